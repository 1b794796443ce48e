//! Rust implementation of the Connectome File Format (CFF).
//!
//! A `.cff` file is a zip archive holding a `meta.xml` manifest and the
//! payloads it describes: networks, volumes, surfaces, tracks and
//! timeseries. Opening an archive parses and validates the manifest and
//! registers one lazily loaded [`Entity`] per descriptor. Payloads are only
//! extracted and decoded when loaded.
//!
//! # Example
//!
//! ```no_run
//! use cff::NiftiImage;
//! # use cff::Result;
//!
//! # fn run() -> Result<()> {
//! let mut connectome = cff::open("subject1.cff")?;
//! let t1 = connectome.volumes_mut().get_mut("T1")?;
//! t1.load()?;
//! if let Some(image) = t1.decoded::<NiftiImage>() {
//!     println!("{:?}", image.dim());
//! }
//! connectome.save("subject1-copy.cff")?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_debug_implementations)]
#![warn(missing_docs, unused_extern_crates, trivial_casts, unused_results)]

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate num_derive;

pub mod archive;
pub mod codec;
pub mod connectome;
pub mod entity;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod schema;
pub mod writer;

pub use crate::codec::{Codec, CodecError, Codecs, Decoded, Graph, NiftiImage, RawCodec};
pub use crate::connectome::{open, Connectome, NetworkCountPolicy, ReaderOptions};
pub use crate::entity::{
    Entity, EntityKind, Network, NetworkFormat, Surface, SurfaceDataKind, SurfaceFormat, Tag,
    Timeserie, TimeserieFormat, Track, TrackFormat, Volume, VolumeDataKind, VolumeFormat,
};
pub use crate::error::{CffError, Result};
pub use crate::manifest::{Descriptor, Manifest, Metadata};
pub use crate::registry::Registry;
pub use crate::schema::{validate_manifest, Schema};
pub use crate::writer::WriterOptions;
