//! Utility functions to write connectome archives.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::connectome::Connectome;
use crate::error::{CffError, Result};
use crate::manifest::MANIFEST_MEMBER;

/// Options and flags which can be used to configure how a connectome
/// archive is written.
///
/// The archive is first written to a temporary file next to the destination,
/// which then replaces it. On error the destination is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Where to write the archive.
    path: PathBuf,
    /// Whether members are deflated or stored.
    compress: bool,
    /// Deflate level, or the zip crate's default when `None`.
    compression_level: Option<i32>,
}

impl WriterOptions {
    /// Creates a new set of options writing to `path`, deflating members at
    /// the default level.
    pub fn new<P: AsRef<Path>>(path: P) -> WriterOptions {
        WriterOptions {
            path: path.as_ref().to_path_buf(),
            compress: true,
            compression_level: None,
        }
    }

    /// Whether to deflate members. If `false`, members are stored as is.
    pub fn compress(mut self, compress: bool) -> WriterOptions {
        self.compress = compress;
        self
    }

    /// Set the deflate level, from 0 to 9.
    pub fn compression_level(mut self, level: Option<i32>) -> WriterOptions {
        self.compression_level = level;
        self
    }

    /// Write `connectome` to the destination path.
    ///
    /// `meta.xml` comes first, followed by each entity's payload. Modified
    /// payloads are re-encoded; all others are written as extracted, as
    /// staged, or copied from the source archive.
    ///
    /// # Errors
    ///
    /// - `CffError::Save` if the manifest cannot be serialized or any
    /// member cannot be produced or written.
    pub fn write(&self, connectome: &Connectome) -> Result<()> {
        let manifest = connectome.manifest().to_xml()?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".cff-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| CffError::Save(format!("could not create temporary file: {}", e)))?;

        let mut zip = ZipWriter::new(temp);
        self.write_member(&mut zip, MANIFEST_MEMBER, &manifest)?;

        let mut written = HashSet::new();
        for (src, entity) in connectome.payload_sources() {
            if !written.insert(src) {
                warn!(name = entity.name(), member = src, "source member already written, skipping");
                continue;
            }
            let bytes = entity.bytes().map_err(|e| match e {
                CffError::Save(_) => e,
                e => CffError::Save(format!("`{}`: {}", entity.name(), e)),
            })?;
            self.write_member(&mut zip, src, &bytes)?;
        }

        let temp: NamedTempFile = zip.finish().map_err(|e| CffError::Save(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| CffError::Save(e.to_string()))?;
        let _ = temp
            .persist(&self.path)
            .map_err(|e| CffError::Save(format!("could not replace `{}`: {}", self.path.display(), e)))?;

        debug!(archive = %self.path.display(), members = written.len() + 1, "saved");
        Ok(())
    }

    fn write_member<W>(&self, zip: &mut ZipWriter<W>, name: &str, bytes: &[u8]) -> Result<()>
    where
        W: Write + std::io::Seek,
    {
        let method = if self.compress {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        let options = FileOptions::default()
            .compression_method(method)
            .compression_level(self.compression_level.filter(|_| self.compress));
        zip.start_file(name, options)
            .map_err(|e| CffError::Save(format!("could not start `{}`: {}", name, e)))?;
        zip.write_all(bytes)
            .map_err(|e| CffError::Save(format!("could not write `{}`: {}", name, e)))
    }
}
