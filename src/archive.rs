//! Access to the zip archive backing a connectome.
//!
//! An [`ArchiveHandle`] is shared between a container and every entity
//! registered in it. Each extraction reopens the archive file, and
//! extractions are serialized through a per-handle lock.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::codec::{Codecs, Decoded};
use crate::connectome::ReaderOptions;
use crate::error::{CffError, Result};

/// Largest buffer reserved up front when extracting a member.
const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Shared handle on the archive file, the codecs and the I/O limits.
pub struct ArchiveHandle {
    path: PathBuf,
    lock: Mutex<()>,
    codecs: Codecs,
    io_timeout: Option<Duration>,
    decode_timeout: Option<Duration>,
    extract_to_temp: bool,
}

impl ArchiveHandle {
    pub(crate) fn new(path: PathBuf, options: &ReaderOptions) -> Arc<Self> {
        Arc::new(ArchiveHandle {
            path,
            lock: Mutex::new(()),
            codecs: options.codecs.clone(),
            io_timeout: options.io_timeout,
            decode_timeout: options.decode_timeout,
            extract_to_temp: options.extract_to_temp,
        })
    }

    /// Path of the archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The codecs used to decode this archive's members.
    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    pub(crate) fn extracts_to_temp(&self) -> bool {
        self.extract_to_temp
    }

    /// Read the full contents of one member.
    pub(crate) fn extract(self: &Arc<Self>, member: &str) -> Result<Vec<u8>> {
        let handle = Arc::clone(self);
        let owned = member.to_owned();
        bounded(
            self.io_timeout,
            format!("Extracting `{}`", member),
            move || handle.read_member(&owned),
        )
    }

    fn read_member(&self, member: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| CffError::Extraction(member.to_owned(), reason);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = File::open(&self.path).map_err(|e| failed(e.to_string()))?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| failed(e.to_string()))?;
        let mut entry = match zip.by_name(member) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(failed("no such member in the archive".to_owned()))
            }
            Err(e) => return Err(failed(e.to_string())),
        };

        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        let _ = entry
            .read_to_end(&mut bytes)
            .map_err(|e| failed(e.to_string()))?;
        debug!(archive = %self.path.display(), member, bytes = bytes.len(), "extracted");
        Ok(bytes)
    }

    /// Decode a member with the codec registered for `format`.
    pub(crate) fn decode(&self, format: &str, member: &str, raw: &Arc<Vec<u8>>) -> Result<Decoded> {
        let codec = self.codecs.get(format).ok_or_else(|| {
            CffError::Decode(
                format.to_owned(),
                member.to_owned(),
                "no codec registered for this format".to_owned(),
            )
        })?;
        let raw = Arc::clone(raw);
        let format = format.to_owned();
        let owned = member.to_owned();
        bounded(
            self.decode_timeout,
            format!("Decoding `{}`", member),
            move || {
                codec
                    .decode(&owned, &raw)
                    .map_err(|e| CffError::Decode(format, owned.clone(), e.to_string()))
            },
        )
    }

    /// Re-encode a decoded member. `None` means the codec cannot encode.
    pub(crate) fn encode(&self, format: &str, member: &str, decoded: &Decoded) -> Result<Option<Vec<u8>>> {
        let codec = match self.codecs.get(format) {
            Some(codec) => codec,
            None => return Ok(None),
        };
        codec
            .encode(member, decoded)
            .transpose()
            .map_err(|e| CffError::Save(format!("could not encode `{}`: {}", member, e)))
    }

    /// Write extracted bytes to a temporary file, removed once dropped.
    pub(crate) fn spill(&self, member: &str, raw: &[u8]) -> Result<NamedTempFile> {
        let failed = |e: std::io::Error| CffError::Extraction(member.to_owned(), e.to_string());
        let file_name = Path::new(member)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("cff-")
            .suffix(&format!("-{}", file_name))
            .tempfile()
            .map_err(failed)?;
        file.write_all(raw).map_err(failed)?;
        file.flush().map_err(failed)?;
        Ok(file)
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.path)
            .field("codecs", &self.codecs)
            .field("io_timeout", &self.io_timeout)
            .field("decode_timeout", &self.decode_timeout)
            .field("extract_to_temp", &self.extract_to_temp)
            .finish()
    }
}

/// Run `job`, giving up after `limit` if one is set.
///
/// A job that outlives its limit keeps running on its worker thread; its
/// result is discarded.
fn bounded<T, F>(limit: Option<Duration>, operation: String, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let limit = match limit {
        Some(limit) => limit,
        None => return job(),
    };

    let (tx, rx) = mpsc::channel();
    let _worker = thread::Builder::new()
        .name("cff-worker".to_owned())
        .spawn(move || {
            let _ = tx.send(job());
        })?;

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(CffError::Timeout(operation, limit)),
        Err(RecvTimeoutError::Disconnected) => Err(CffError::Worker(operation)),
    }
}

/// Initial buffer size for a member whose header declares `declared`
/// uncompressed bytes. The declared size is not trusted beyond a ceiling.
fn capacity_hint(declared: u64) -> usize {
    declared.min(PREALLOC_LIMIT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_sizes_are_capped() {
        assert_eq!(capacity_hint(1024), 1024);
        assert_eq!(capacity_hint(u64::MAX), PREALLOC_LIMIT as usize);
    }

    #[test]
    fn unbounded_jobs_run_inline() {
        let value = bounded(None, "inline".to_owned(), || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn slow_jobs_time_out() {
        let result = bounded(Some(Duration::from_millis(20)), "sleep".to_owned(), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        match result {
            Err(CffError::Timeout(operation, limit)) => {
                assert_eq!(operation, "sleep");
                assert_eq!(limit, Duration::from_millis(20));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn panicking_jobs_are_reported() {
        let result: Result<()> = bounded(Some(Duration::from_secs(5)), "boom".to_owned(), || {
            panic!("codec bug")
        });
        assert!(matches!(result, Err(CffError::Worker(_))));
    }
}
