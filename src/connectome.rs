//! Module for opening connectome archives and handling their contents.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::archive::ArchiveHandle;
use crate::codec::Codecs;
use crate::entity::{
    Entity, EntityKind, Network, NetworkKind, Surface, SurfaceKind, Timeserie, TimeserieKind,
    Track, TrackKind, Volume, VolumeKind,
};
use crate::error::{CffError, Result};
use crate::manifest::{Descriptor, Manifest, Metadata, FORMAT_VERSION, MANIFEST_MEMBER};
use crate::registry::Registry;
use crate::schema::validate_manifest;
use crate::writer::WriterOptions;

/// File extension of connectome archives, compared without case.
pub const CFF_EXTENSION: &str = "cff";

/// What to do when the declared network count disagrees with the number of
/// network entries in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCountPolicy {
    /// Accept the archive silently
    Ignore,
    /// Accept the archive and log a warning
    Warn,
    /// Refuse to open the archive
    Strict,
}

impl Default for NetworkCountPolicy {
    fn default() -> Self {
        NetworkCountPolicy::Warn
    }
}

/// Options and flags which can be used to configure how a connectome
/// archive is opened.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub(crate) validate_schema: bool,
    pub(crate) network_count: NetworkCountPolicy,
    pub(crate) codecs: Codecs,
    pub(crate) io_timeout: Option<Duration>,
    pub(crate) decode_timeout: Option<Duration>,
    pub(crate) extract_to_temp: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            validate_schema: true,
            network_count: NetworkCountPolicy::default(),
            codecs: Codecs::default(),
            io_timeout: None,
            decode_timeout: None,
            extract_to_temp: false,
        }
    }
}

impl ReaderOptions {
    /// Creates a blank new set of options ready for configuration.
    pub fn new() -> Self {
        ReaderOptions::default()
    }

    /// Whether to check the manifest against the connectome schema. On by default.
    pub fn validate_schema(mut self, validate: bool) -> Self {
        self.validate_schema = validate;
        self
    }

    /// Policy for a declared network count that does not match the manifest.
    pub fn network_count(mut self, policy: NetworkCountPolicy) -> Self {
        self.network_count = policy;
        self
    }

    /// The codecs used to decode entity payloads.
    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    /// Time limit for reading one member out of the archive.
    pub fn io_timeout(mut self, limit: Option<Duration>) -> Self {
        self.io_timeout = limit;
        self
    }

    /// Time limit for decoding one payload.
    pub fn decode_timeout(mut self, limit: Option<Duration>) -> Self {
        self.decode_timeout = limit;
        self
    }

    /// Also write loaded payloads to temporary files, for consumers which
    /// need a file system path. The files are removed on close.
    pub fn extract_to_temp(mut self, extract: bool) -> Self {
        self.extract_to_temp = extract;
        self
    }

    /// Open a connectome archive. Entities are registered but not loaded.
    ///
    /// # Errors
    ///
    /// - `CffError::InvalidArchive` if the path is not an existing `.cff`
    /// file or not a zip archive.
    /// - `CffError::MissingManifest` if the archive has no `meta.xml`.
    /// - `CffError::SchemaValidation` if validation is enabled and fails.
    /// - `CffError::ManifestParse` if the manifest cannot be read, listing
    /// every descriptor problem found.
    /// - `CffError::NetworkCountMismatch` under the strict count policy.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Connectome> {
        let path = path.as_ref();
        let invalid = |reason: String| CffError::InvalidArchive(path.to_path_buf(), reason);

        if !has_cff_extension(path) {
            return Err(invalid(format!("expected a `.{}` file", CFF_EXTENSION)));
        }
        if !path.is_file() {
            return Err(invalid("no such file".to_owned()));
        }
        let file = File::open(path).map_err(|e| invalid(e.to_string()))?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;
        let text = read_manifest(&mut zip, path)?;

        if self.validate_schema {
            validate_manifest(&text)?;
        }
        let manifest = Manifest::parse(&text)?;
        let members: HashSet<&str> = zip.file_names().collect();

        let mut connectome = self.create(path);
        connectome.metadata = manifest.metadata;
        let mut problems: Vec<String> = manifest.problems.into_iter().map(|p| p.message).collect();
        populate(&mut connectome.networks, &manifest.networks, &mut problems);
        populate(&mut connectome.volumes, &manifest.volumes, &mut problems);
        populate(&mut connectome.surfaces, &manifest.surfaces, &mut problems);
        populate(&mut connectome.tracks, &manifest.tracks, &mut problems);
        populate(&mut connectome.timeseries, &manifest.timeseries, &mut problems);
        if !problems.is_empty() {
            return Err(CffError::ManifestParse(problems.join("; ")));
        }

        match connectome.check_network_count() {
            Ok(()) => {}
            Err(e) => match self.network_count {
                NetworkCountPolicy::Ignore => {}
                NetworkCountPolicy::Warn => warn!(archive = %path.display(), "{}", e),
                NetworkCountPolicy::Strict => return Err(e),
            },
        }

        connectome.warn_missing_members(&members);
        debug!(
            archive = %path.display(),
            networks = connectome.networks.len(),
            volumes = connectome.volumes.len(),
            surfaces = connectome.surfaces.len(),
            tracks = connectome.tracks.len(),
            timeseries = connectome.timeseries.len(),
            "opened"
        );
        Ok(connectome)
    }

    /// Create an empty connectome bound to `path`, using these options for
    /// entities added later. Nothing is written until it is saved.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Connectome {
        let archive = ArchiveHandle::new(path.as_ref().to_path_buf(), self);
        Connectome {
            networks: Registry::new(Arc::clone(&archive)),
            volumes: Registry::new(Arc::clone(&archive)),
            surfaces: Registry::new(Arc::clone(&archive)),
            tracks: Registry::new(Arc::clone(&archive)),
            timeseries: Registry::new(Arc::clone(&archive)),
            archive,
            metadata: Metadata {
                version: FORMAT_VERSION.to_owned(),
                generator: concat!("cff ", env!("CARGO_PKG_VERSION")).to_owned(),
                ..Metadata::default()
            },
        }
    }
}

fn has_cff_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map_or(false, |ext| ext.eq_ignore_ascii_case(CFF_EXTENSION))
}

fn read_manifest<R: Read + Seek>(zip: &mut ZipArchive<R>, path: &Path) -> Result<String> {
    let mut member = match zip.by_name(MANIFEST_MEMBER) {
        Ok(member) => member,
        Err(ZipError::FileNotFound) => return Err(CffError::MissingManifest(path.to_path_buf())),
        Err(e) => return Err(CffError::InvalidArchive(path.to_path_buf(), e.to_string())),
    };
    let mut bytes = Vec::new();
    let _ = member
        .read_to_end(&mut bytes)
        .map_err(|e| CffError::InvalidArchive(path.to_path_buf(), e.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|e| CffError::ManifestParse(format!("manifest is not UTF-8: {}", e)))
}

fn populate<K: EntityKind>(
    registry: &mut Registry<K>,
    descriptors: &BTreeMap<String, Descriptor>,
    problems: &mut Vec<String>,
) {
    for descriptor in descriptors.values() {
        let added = Entity::<K>::from_descriptor(descriptor)
            .and_then(|entity| registry.add(entity).map_err(|e| e.to_string()));
        if let Err(problem) = added {
            problems.push(problem);
        }
    }
}

/// A connectome archive: its metadata and one registry per entity kind.
#[derive(Debug)]
pub struct Connectome {
    archive: Arc<ArchiveHandle>,
    metadata: Metadata,
    networks: Registry<NetworkKind>,
    volumes: Registry<VolumeKind>,
    surfaces: Registry<SurfaceKind>,
    tracks: Registry<TrackKind>,
    timeseries: Registry<TimeserieKind>,
}

macro_rules! kind_accessors {
    ($field:ident, $field_mut:ident, $add:ident, $remove:ident, $kind:ty, $alias:ty, $label:expr) => {
        #[doc = concat!("The ", $label, " registry.")]
        pub fn $field(&self) -> &Registry<$kind> {
            &self.$field
        }

        #[doc = concat!("The ", $label, " registry, mutably.")]
        pub fn $field_mut(&mut self) -> &mut Registry<$kind> {
            &mut self.$field
        }

        #[doc = concat!("Register a ", $label, ". See [`Registry::add`].")]
        pub fn $add(&mut self, entity: $alias) -> Result<()> {
            self.$field.add(entity)
        }

        #[doc = concat!("Unregister a ", $label, ". See [`Registry::remove`].")]
        pub fn $remove(&mut self, name: &str) -> Result<$alias> {
            self.$field.remove(name)
        }
    };
}

impl Connectome {
    /// Create an empty connectome bound to `path`, with default options.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        ReaderOptions::new().create(path)
    }

    /// Open a connectome archive with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ReaderOptions::new().open(path)
    }

    /// Path of the backing archive.
    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    /// Archive metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Archive metadata, mutably.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    kind_accessors!(networks, networks_mut, add_network, remove_network, NetworkKind, Network, "network");
    kind_accessors!(volumes, volumes_mut, add_volume, remove_volume, VolumeKind, Volume, "volume");
    kind_accessors!(surfaces, surfaces_mut, add_surface, remove_surface, SurfaceKind, Surface, "surface");
    kind_accessors!(tracks, tracks_mut, add_track, remove_track, TrackKind, Track, "track");
    kind_accessors!(
        timeseries,
        timeseries_mut,
        add_timeserie,
        remove_timeserie,
        TimeserieKind,
        Timeserie,
        "timeserie"
    );

    /// Compare the declared network count with the registered networks.
    pub fn check_network_count(&self) -> Result<()> {
        let declared = self.metadata.network_count;
        let actual = self.networks.len();
        if declared as usize == actual {
            Ok(())
        } else {
            Err(CffError::NetworkCountMismatch(declared, actual))
        }
    }

    /// Release every loaded payload in every registry.
    pub fn close_all(&mut self) {
        self.networks.close_all();
        self.volumes.close_all();
        self.surfaces.close_all();
        self.tracks.close_all();
        self.timeseries.close_all();
    }

    /// Write the connectome to `path` with default writer options.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        WriterOptions::new(path).write(self)
    }

    /// The manifest describing the current contents. The network count is
    /// the number of registered networks.
    pub fn manifest(&self) -> Manifest {
        let mut metadata = self.metadata.clone();
        metadata.network_count = self.networks.len() as u32;
        Manifest {
            metadata,
            networks: self.networks.descriptors(),
            volumes: self.volumes.descriptors(),
            surfaces: self.surfaces.descriptors(),
            tracks: self.tracks.descriptors(),
            timeseries: self.timeseries.descriptors(),
            problems: Vec::new(),
        }
    }

    /// Every registered entity with its source member, in manifest order.
    pub(crate) fn payload_sources(&self) -> Vec<(&str, PayloadSource<'_>)> {
        let mut out: Vec<(&str, PayloadSource<'_>)> = Vec::new();
        out.extend(self.networks.iter().map(|e| (e.src(), PayloadSource::Network(e))));
        out.extend(self.volumes.iter().map(|e| (e.src(), PayloadSource::Volume(e))));
        out.extend(self.surfaces.iter().map(|e| (e.src(), PayloadSource::Surface(e))));
        out.extend(self.tracks.iter().map(|e| (e.src(), PayloadSource::Track(e))));
        out.extend(self.timeseries.iter().map(|e| (e.src(), PayloadSource::Timeserie(e))));
        out
    }

    fn warn_missing_members(&self, members: &HashSet<&str>) {
        for (src, entity) in self.payload_sources() {
            if !members.contains(src) {
                warn!(
                    archive = %self.path().display(),
                    name = entity.name(),
                    member = src,
                    "payload member is missing from the archive"
                );
            }
        }
    }
}

/// A borrowed entity of any kind.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PayloadSource<'a> {
    Network(&'a Network),
    Volume(&'a Volume),
    Surface(&'a Surface),
    Track(&'a Track),
    Timeserie(&'a Timeserie),
}

impl<'a> PayloadSource<'a> {
    pub(crate) fn name(self) -> &'a str {
        match self {
            PayloadSource::Network(e) => e.name(),
            PayloadSource::Volume(e) => e.name(),
            PayloadSource::Surface(e) => e.name(),
            PayloadSource::Track(e) => e.name(),
            PayloadSource::Timeserie(e) => e.name(),
        }
    }

    pub(crate) fn bytes(self) -> Result<Arc<Vec<u8>>> {
        match self {
            PayloadSource::Network(e) => e.payload_bytes(),
            PayloadSource::Volume(e) => e.payload_bytes(),
            PayloadSource::Surface(e) => e.payload_bytes(),
            PayloadSource::Track(e) => e.payload_bytes(),
            PayloadSource::Timeserie(e) => e.payload_bytes(),
        }
    }
}

/// Shorthand for `Connectome::open`.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connectome> {
    Connectome::open(path)
}
