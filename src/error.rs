//! Types for error handling go here.

use std::io::Error as IOError;
use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::MANIFEST_MEMBER;

quick_error! {
    /// Error type for all errors that may occur when handling connectome archives.
    #[derive(Debug)]
    pub enum CffError {
        /// The path does not lead to a usable `.cff` archive
        InvalidArchive(path: PathBuf, reason: String) {
            display("Invalid connectome archive `{}`: {}", path.display(), reason)
        }
        /// The archive has no manifest member
        MissingManifest(path: PathBuf) {
            display("Archive `{}` has no `{}` member", path.display(), MANIFEST_MEMBER)
        }
        /// The manifest is not well-formed or lacks required structure
        ManifestParse(reason: String) {
            display("Could not parse manifest: {}", reason)
        }
        /// The manifest does not conform to the connectome schema
        SchemaValidation(reason: String) {
            display("Manifest failed schema validation: {}", reason)
        }
        /// An entity with this name is already registered
        DuplicateName(kind: &'static str, name: String) {
            display("A {} named `{}` already exists", kind, name)
        }
        /// Entity names must not be empty
        InvalidName(kind: &'static str) {
            display("A {} must have a non-empty name", kind)
        }
        /// The entity's source path cannot be stored in an archive
        InvalidSource(kind: &'static str, src: String) {
            display("Invalid {} source path `{}`", kind, src)
        }
        /// No entity with this name is registered
        NotFound(kind: &'static str, name: String) {
            display("No {} named `{}`", kind, name)
        }
        /// The declared network count disagrees with the network entries
        NetworkCountMismatch(declared: u32, actual: usize) {
            display("Manifest declares {} networks but describes {}", declared, actual)
        }
        /// The entity is not attached to any archive
        Detached(name: String) {
            display("Entity `{}` is not attached to an archive", name)
        }
        /// A payload member could not be read from the archive
        Extraction(member: String, reason: String) {
            display("Could not extract `{}`: {}", member, reason)
        }
        /// The codec rejected the payload bytes
        Decode(format: String, member: String, reason: String) {
            display("Could not decode `{}` as {}: {}", member, format, reason)
        }
        /// An archive or codec operation exceeded its time limit
        Timeout(operation: String, limit: Duration) {
            display("{} timed out after {:?}", operation, limit)
        }
        /// The worker running an operation terminated without a result
        Worker(operation: String) {
            display("{} was interrupted", operation)
        }
        /// The archive could not be written
        Save(reason: String) {
            display("Could not save archive: {}", reason)
        }
        /// I/O Error
        Io(err: IOError) {
            from()
            source(err)
            display("I/O error: {}", err)
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, CffError>;
