//! Entities are the named, typed and lazily loaded payloads described by a
//! connectome manifest: networks, volumes, surfaces, tracks and timeseries.
//!
//! All kinds share the same shape, [`Entity`], parameterized by a marker
//! type implementing [`EntityKind`]. An entity starts out unloaded. Calling
//! [`Entity::load`] pulls its member out of the owning archive and decodes
//! it; [`Entity::close`] releases the payload again.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::archive::ArchiveHandle;
use crate::codec::Decoded;
use crate::error::{CffError, Result};
use crate::manifest::Descriptor;

/// A closed set of string tags, as found in manifest attributes.
pub trait Tag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every value of the tag, in canonical order.
    const ALL: &'static [Self];

    /// The canonical spelling of this tag.
    fn as_str(self) -> &'static str;

    /// Parse a tag, ignoring ASCII case.
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
    }
}

macro_rules! tags {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $tag:expr, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl Tag for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $tag, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

tags! {
    /// File formats for networks.
    pub enum NetworkFormat {
        /// GraphML markup
        GraphMl => "graphml",
    }
}

tags! {
    /// File formats for volumes.
    pub enum VolumeFormat {
        /// NIfTI-1
        Nifti => "nifti",
    }
}

tags! {
    /// File formats for surfaces.
    pub enum SurfaceFormat {
        /// GIFTI
        Gifti => "gifti",
    }
}

tags! {
    /// File formats for tracks.
    pub enum TrackFormat {
        /// TrackVis `.trk`
        TrackVis => "trackvis",
    }
}

tags! {
    /// File formats for timeseries.
    pub enum TimeserieFormat {
        /// HDF5
        Hdf5 => "hdf5",
    }
}

tags! {
    /// What a volume holds.
    pub enum VolumeDataKind {
        /// Parcellation or tissue segmentation
        Segmentation => "segmentation",
        /// T1-weighted anatomical scan
        T1Weighted => "T1-weighted",
        /// T2-weighted anatomical scan
        T2Weighted => "T2-weighted",
        /// Proton density weighted scan
        PdWeighted => "PD-weighted",
        /// Functional MRI
        Fmri => "fMRI",
        /// Probability map
        ProbabilityMap => "probabilitymap",
        /// Fractional anisotropy
        FractionalAnisotropy => "FA",
        /// Mean diffusivity
        MeanDiffusivity => "MD",
        /// Axial diffusivity
        AxialDiffusivity => "AD",
        /// Radial diffusivity
        RadialDiffusivity => "RD",
        /// Generalized fractional anisotropy
        GeneralizedFractionalAnisotropy => "GFA",
    }
}

tags! {
    /// What a surface holds.
    pub enum SurfaceDataKind {
        /// Surface geometry only
        Surface => "surface",
        /// Vertex labels only
        Label => "label",
        /// Geometry and labels
        SurfaceLabel => "surface-label",
    }
}

/// Data kind for entity kinds that carry no `dtype` attribute.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum NoDataKind {}

impl Tag for NoDataKind {
    const ALL: &'static [Self] = &[];

    fn as_str(self) -> &'static str {
        match self {}
    }
}

/// Type-level description of one kind of entity.
pub trait EntityKind: fmt::Debug + Send + Sync + 'static {
    /// Human readable kind name, used in messages.
    const LABEL: &'static str;
    /// The manifest element describing entities of this kind.
    const ELEMENT: &'static str;
    /// Supported file formats.
    type Format: Tag;
    /// Supported `dtype` values.
    type DataKind: Tag;
}

macro_rules! kind {
    ($(#[$meta:meta])* $name:ident, $label:expr, $element:expr, $format:ty, $dtype:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl EntityKind for $name {
            const LABEL: &'static str = $label;
            const ELEMENT: &'static str = $element;
            type Format = $format;
            type DataKind = $dtype;
        }
    };
}

kind!(
    /// Marker for connectivity networks.
    NetworkKind, "network", "connectome-network", NetworkFormat, NoDataKind
);
kind!(
    /// Marker for volumetric images.
    VolumeKind, "volume", "connectome-volume", VolumeFormat, VolumeDataKind
);
kind!(
    /// Marker for surface meshes and labels.
    SurfaceKind, "surface", "connectome-surface", SurfaceFormat, SurfaceDataKind
);
kind!(
    /// Marker for fiber tracks.
    TrackKind, "track", "connectome-track", TrackFormat, NoDataKind
);
kind!(
    /// Marker for timeseries.
    TimeserieKind, "timeserie", "connectome-timeserie", TimeserieFormat, NoDataKind
);

/// A connectivity network entity.
pub type Network = Entity<NetworkKind>;
/// A volume entity.
pub type Volume = Entity<VolumeKind>;
/// A surface entity.
pub type Surface = Entity<SurfaceKind>;
/// A track entity.
pub type Track = Entity<TrackKind>;
/// A timeserie entity.
pub type Timeserie = Entity<TimeserieKind>;

struct Payload {
    raw: Arc<Vec<u8>>,
    decoded: Decoded,
    modified: bool,
    extracted: Option<NamedTempFile>,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.raw.len())
            .field("modified", &self.modified)
            .field("extracted", &self.extracted.as_ref().map(|f| f.path()))
            .finish()
    }
}

/// A named, lazily loaded archive member.
#[derive(Debug)]
pub struct Entity<K: EntityKind> {
    name: String,
    src: String,
    format: K::Format,
    dtype: Option<K::DataKind>,
    description: String,
    archive: Option<Arc<ArchiveHandle>>,
    staged: Option<Arc<Vec<u8>>>,
    payload: Option<Payload>,
}

impl<K: EntityKind> Entity<K> {
    /// Create a detached, unloaded entity.
    pub fn new<N, S>(name: N, src: S, format: K::Format) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        Entity {
            name: name.into(),
            src: src.into(),
            format,
            dtype: None,
            description: String::new(),
            archive: None,
            staged: None,
            payload: None,
        }
    }

    /// Set the data kind.
    pub fn with_dtype(mut self, dtype: K::DataKind) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Set the free-text description.
    pub fn with_description<D: Into<String>>(mut self, description: D) -> Self {
        self.description = description.into();
        self
    }

    /// Provide the payload bytes directly, for entities that are not yet
    /// stored in any archive. They are used by `load` and written on save.
    pub fn with_content(mut self, bytes: Vec<u8>) -> Self {
        self.staged = Some(Arc::new(bytes));
        self
    }

    /// The entity's unique name within its registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The member path inside the archive.
    pub fn src(&self) -> &str {
        &self.src
    }

    /// The declared file format.
    pub fn format(&self) -> K::Format {
        self.format
    }

    /// The declared data kind, if any.
    pub fn dtype(&self) -> Option<K::DataKind> {
        self.dtype
    }

    /// Change the declared data kind.
    pub fn set_dtype(&mut self, dtype: Option<K::DataKind>) {
        self.dtype = dtype;
    }

    /// The free-text description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Change the free-text description.
    pub fn set_description<D: Into<String>>(&mut self, description: D) {
        self.description = description.into();
    }

    /// Whether the payload is currently held in memory.
    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    /// Whether the decoded payload was accessed mutably since loading.
    pub fn is_modified(&self) -> bool {
        self.payload.as_ref().map_or(false, |p| p.modified)
    }

    /// Path of the archive this entity belongs to, if it is registered.
    pub fn archive_path(&self) -> Option<&Path> {
        self.archive.as_ref().map(|a| a.path())
    }

    /// Extract and decode the payload. Does nothing if already loaded.
    ///
    /// # Errors
    ///
    /// - `CffError::Detached` if the entity is not registered in a container.
    /// - `CffError::Extraction` if the member cannot be read.
    /// - `CffError::Decode` if no codec accepts the bytes.
    /// - `CffError::Timeout` if a configured time limit expires.
    ///
    /// The entity stays unloaded on error.
    pub fn load(&mut self) -> Result<()> {
        if self.payload.is_some() {
            debug!(kind = K::LABEL, name = %self.name, "already loaded");
            return Ok(());
        }
        let archive = self
            .archive
            .clone()
            .ok_or_else(|| CffError::Detached(self.name.clone()))?;

        let raw = match &self.staged {
            Some(bytes) => Arc::clone(bytes),
            None => Arc::new(archive.extract(&self.src)?),
        };
        let decoded = archive.decode(self.format.as_str(), &self.src, &raw)?;
        let extracted = if archive.extracts_to_temp() {
            Some(archive.spill(&self.src, &raw)?)
        } else {
            None
        };

        debug!(kind = K::LABEL, name = %self.name, bytes = raw.len(), "loaded");
        self.payload = Some(Payload {
            raw,
            decoded,
            modified: false,
            extracted,
        });
        Ok(())
    }

    /// Release the payload and any extracted temporary file.
    pub fn close(&mut self) {
        if let Some(payload) = self.payload.take() {
            debug!(kind = K::LABEL, name = %self.name, "closed");
            drop(payload);
        }
    }

    /// The decoded payload, if loaded and of type `T`.
    pub fn decoded<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.decoded.downcast_ref::<T>()
    }

    /// Mutable access to the decoded payload. The entity is then considered
    /// modified and will be re-encoded on save.
    pub fn decoded_mut<T: Any>(&mut self) -> Option<&mut T> {
        let payload = self.payload.as_mut()?;
        if !payload.decoded.is::<T>() {
            return None;
        }
        payload.modified = true;
        payload.decoded.downcast_mut::<T>()
    }

    /// The payload bytes as extracted, if loaded.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        self.payload.as_ref().map(|p| p.raw.as_slice())
    }

    /// The temporary file holding the extracted member, when the container
    /// was opened with `extract_to_temp` and the entity is loaded.
    pub fn extracted_path(&self) -> Option<&Path> {
        self.payload
            .as_ref()
            .and_then(|p| p.extracted.as_ref())
            .map(|f| f.path())
    }

    pub(crate) fn attach(&mut self, archive: Arc<ArchiveHandle>) {
        self.archive = Some(archive);
    }

    /// Release the payload and drop the archive. Loaded bytes are kept as
    /// staged content so the entity can be added to another container.
    pub(crate) fn detach(&mut self) {
        if self.staged.is_none() && self.payload.is_some() {
            match self.payload_bytes() {
                Ok(bytes) => self.staged = Some(bytes),
                Err(e) => warn!(kind = K::LABEL, name = %self.name, "payload not kept: {}", e),
            }
        }
        self.close();
        self.archive = None;
    }

    /// The bytes to store for this entity when writing an archive.
    pub(crate) fn payload_bytes(&self) -> Result<Arc<Vec<u8>>> {
        if let Some(payload) = &self.payload {
            if payload.modified {
                if let Some(archive) = &self.archive {
                    match archive.encode(self.format.as_str(), &self.src, &payload.decoded)? {
                        Some(bytes) => return Ok(Arc::new(bytes)),
                        None => warn!(
                            kind = K::LABEL,
                            name = %self.name,
                            "codec cannot encode, keeping extracted bytes"
                        ),
                    }
                }
            }
            return Ok(Arc::clone(&payload.raw));
        }
        if let Some(bytes) = &self.staged {
            return Ok(Arc::clone(bytes));
        }
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| CffError::Detached(self.name.clone()))?;
        Ok(Arc::new(archive.extract(&self.src)?))
    }

    pub(crate) fn from_descriptor(d: &Descriptor) -> ::std::result::Result<Self, String> {
        let format = if d.format.trim().is_empty() {
            K::Format::ALL
                .first()
                .copied()
                .ok_or_else(|| format!("{} `{}` has no file format", K::LABEL, d.name))?
        } else {
            K::Format::parse(&d.format).ok_or_else(|| {
                format!("{} `{}` has unknown file format `{}`", K::LABEL, d.name, d.format)
            })?
        };
        let dtype = match d.dtype.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(K::DataKind::parse(value).ok_or_else(|| {
                format!("{} `{}` has unknown data type `{}`", K::LABEL, d.name, value)
            })?),
        };

        let mut entity =
            Entity::new(d.name.clone(), d.src.clone(), format).with_description(d.description.clone());
        entity.set_dtype(dtype);
        Ok(entity)
    }

    pub(crate) fn to_descriptor(&self) -> Descriptor {
        Descriptor {
            name: self.name.clone(),
            src: self.src.clone(),
            format: self.format.as_str().to_owned(),
            dtype: self.dtype.map(|t| t.as_str().to_owned()),
            description: self.description.clone(),
        }
    }
}
