//! This module defines the codec API through which payload bytes extracted
//! from an archive are turned into usable values, and back.
//!
//! Codecs are looked up by the entity's file format tag. The host decides
//! which implementations are available by building a [`Codecs`] set and
//! handing it to [`ReaderOptions`](crate::ReaderOptions).

pub mod graphml;
pub mod nifti;

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::entity::{NetworkFormat, SurfaceFormat, Tag, TimeserieFormat, TrackFormat, VolumeFormat};

pub use self::graphml::{Graph, GraphMlCodec};
pub use self::nifti::{NiftiCodec, NiftiImage};

/// An opaque decoded payload. Consumers downcast it to the codec's type.
pub type Decoded = Box<dyn Any + Send>;

/// The error type returned by codec implementations.
pub type CodecError = Box<dyn Error + Send + Sync>;

/// A decoder (and optionally encoder) for one payload format.
pub trait Codec: Send + Sync {
    /// Decode the bytes of the archive member at `member`.
    fn decode(&self, member: &str, bytes: &[u8]) -> Result<Decoded, CodecError>;

    /// Encode a value previously produced by `decode`.
    ///
    /// Returns `None` when the codec cannot write the format back, in which
    /// case the originally extracted bytes are kept.
    fn encode(&self, _member: &str, _decoded: &Decoded) -> Option<Result<Vec<u8>, CodecError>> {
        None
    }
}

/// Codec keeping the payload as an uninterpreted `Vec<u8>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn decode(&self, _member: &str, bytes: &[u8]) -> Result<Decoded, CodecError> {
        Ok(Box::new(bytes.to_vec()))
    }

    fn encode(&self, _member: &str, decoded: &Decoded) -> Option<Result<Vec<u8>, CodecError>> {
        decoded.downcast_ref::<Vec<u8>>().map(|bytes| Ok(bytes.clone()))
    }
}

/// The set of codecs available to a container, keyed by format tag.
#[derive(Clone)]
pub struct Codecs {
    by_format: HashMap<String, Arc<dyn Codec>>,
}

impl Codecs {
    /// A set with no codecs at all.
    pub fn empty() -> Self {
        Codecs {
            by_format: HashMap::new(),
        }
    }

    /// Register `codec` for the given format tag, replacing any previous one.
    pub fn register<C>(&mut self, format: &str, codec: C) -> &mut Self
    where
        C: Codec + 'static,
    {
        self.register_shared(format, Arc::new(codec))
    }

    /// Register a shared codec for the given format tag.
    pub fn register_shared(&mut self, format: &str, codec: Arc<dyn Codec>) -> &mut Self {
        let _ = self.by_format.insert(format.to_ascii_lowercase(), codec);
        self
    }

    /// Fetch the codec for a format tag.
    pub fn get(&self, format: &str) -> Option<Arc<dyn Codec>> {
        self.by_format.get(&format.to_ascii_lowercase()).cloned()
    }

    /// The registered format tags, sorted.
    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = self.by_format.keys().map(String::as_str).collect();
        formats.sort_unstable();
        formats
    }
}

impl Default for Codecs {
    /// NIfTI and GraphML are decoded, other formats are kept as raw bytes.
    fn default() -> Self {
        let mut codecs = Codecs::empty();
        let _ = codecs
            .register(VolumeFormat::Nifti.as_str(), NiftiCodec)
            .register(NetworkFormat::GraphMl.as_str(), GraphMlCodec)
            .register(SurfaceFormat::Gifti.as_str(), RawCodec)
            .register(TrackFormat::TrackVis.as_str(), RawCodec)
            .register(TimeserieFormat::Hdf5.as_str(), RawCodec);
        codecs
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Codecs")
            .field("formats", &self.formats())
            .finish()
    }
}
