use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

use cff::{
    CffError, Codec, CodecError, Codecs, Connectome, Decoded, Graph, NetworkCountPolicy,
    NetworkFormat, NiftiImage, ReaderOptions, SurfaceDataKind, Track, TrackFormat, Volume,
    VolumeDataKind, VolumeFormat, WriterOptions,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use zip::{CompressionMethod, ZipArchive};

mod util;

use crate::util::*;

fn members(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut out = BTreeMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut bytes = Vec::new();
        let _ = entry.read_to_end(&mut bytes).unwrap();
        let _ = out.insert(entry.name().to_owned(), bytes);
    }
    out
}

#[test]
fn t1_volume_loads_on_demand() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);

    let mut connectome = cff::open(&path).unwrap();
    let t1 = connectome.volumes().get("T1").unwrap();
    assert!(!t1.is_loaded());
    assert_eq!(t1.src(), VOLUME_SRC);
    assert_eq!(t1.format(), VolumeFormat::Nifti);
    assert_eq!(t1.dtype(), Some(VolumeDataKind::T1Weighted));
    assert_eq!(t1.archive_path(), Some(path.as_path()));

    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    assert!(t1.is_loaded());
    let image = t1.decoded::<NiftiImage>().unwrap();
    assert_eq!(image.dim(), &[2, 2, 2]);
    assert_eq!(image.data(), nifti_image().data());
    assert!(!t1.is_modified());
}

#[test]
fn every_kind_is_registered() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let connectome = Connectome::open(&path).unwrap();

    let metadata = connectome.metadata();
    assert_eq!(metadata.version, "1.0");
    assert_eq!(metadata.generator, "cfflib 2.0");
    assert_eq!(metadata.name, "Subject 1");
    assert_eq!(metadata.species, "Homo sapiens");
    assert_eq!(metadata.network_count, 1);

    let network = connectome.networks().get("connectome_freesurferaparc").unwrap();
    assert_eq!(network.format(), NetworkFormat::GraphMl);
    assert_eq!(network.description(), "Freesurfer parcellation");
    assert_eq!(
        connectome.surfaces().get("white").unwrap().dtype(),
        Some(SurfaceDataKind::Surface)
    );
    assert_eq!(connectome.tracks().names().collect::<Vec<_>>(), vec!["fibers"]);
    assert_eq!(connectome.timeseries().names().collect::<Vec<_>>(), vec!["bold"]);
    for volume in connectome.volumes().iter() {
        assert_eq!(volume.archive_path(), Some(connectome.path()));
    }
}

#[test]
fn network_decodes_to_graph() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();

    let network = connectome
        .networks_mut()
        .get_mut("connectome_freesurferaparc")
        .unwrap();
    network.load().unwrap();
    let graph = network.decoded::<Graph>().unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);

    let track = connectome.tracks_mut().get_mut("fibers").unwrap();
    track.load().unwrap();
    assert_eq!(track.decoded::<Vec<u8>>().unwrap(), b"TRACK\0fibers");
}

#[test]
fn archive_without_manifest() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.cff");
    write_zip(&path, &[(VOLUME_SRC, nifti_bytes().as_slice())]);

    match Connectome::open(&path) {
        Err(CffError::MissingManifest(p)) => assert_eq!(p, path),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn truncated_manifest_is_a_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.cff");
    write_archive(&path, r#"<connectome version="1.0"><connectome-meta>"#);

    assert!(matches!(Connectome::open(&path), Err(CffError::ManifestParse(_))));
    assert!(matches!(
        ReaderOptions::new().validate_schema(false).open(&path),
        Err(CffError::ManifestParse(_))
    ));
}

#[test]
fn rejects_paths_which_are_not_archives() {
    let dir = tempdir().unwrap();

    let zip_path = dir.path().join("subject1.zip");
    write_archive(&zip_path, &manifest(1));
    assert!(matches!(Connectome::open(&zip_path), Err(CffError::InvalidArchive(..))));

    let absent = dir.path().join("absent.cff");
    assert!(matches!(Connectome::open(&absent), Err(CffError::InvalidArchive(..))));

    let text = dir.path().join("notes.cff");
    fs::write(&text, "this is not a zip archive").unwrap();
    assert!(matches!(Connectome::open(&text), Err(CffError::InvalidArchive(..))));

    let upper = dir.path().join("SUBJECT1.CFF");
    write_archive(&upper, &manifest(1));
    assert!(Connectome::open(&upper).is_ok());
}

#[test]
fn save_then_open_round_trips() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let original = Connectome::open(&path).unwrap();

    let copy_path = dir.path().join("copy.cff");
    original.save(&copy_path).unwrap();
    let copy = Connectome::open(&copy_path).unwrap();

    assert_eq!(copy.metadata(), original.metadata());
    assert_eq!(copy.manifest().volumes, original.manifest().volumes);
    assert_eq!(
        copy.networks().names().collect::<Vec<_>>(),
        original.networks().names().collect::<Vec<_>>()
    );
    assert_eq!(
        copy.surfaces().names().collect::<Vec<_>>(),
        original.surfaces().names().collect::<Vec<_>>()
    );

    let mut before = members(&path);
    let mut after = members(&copy_path);
    let _ = before.remove("meta.xml");
    let _ = after.remove("meta.xml");
    assert_eq!(after, before);
}

#[test]
fn load_and_close_remove_the_extracted_file() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = ReaderOptions::new()
        .extract_to_temp(true)
        .open(&path)
        .unwrap();

    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    let extracted = t1.extracted_path().unwrap().to_path_buf();
    assert_eq!(fs::read(&extracted).unwrap(), nifti_bytes());

    t1.close();
    assert!(!t1.is_loaded());
    assert!(t1.extracted_path().is_none());
    assert!(!extracted.exists());

    t1.close();
    assert!(!t1.is_loaded());
}

#[test]
fn second_load_is_a_no_op() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();
    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();

    t1.load().unwrap();
    let first = t1.raw_bytes().unwrap().as_ptr();
    t1.load().unwrap();
    assert_eq!(t1.raw_bytes().unwrap().as_ptr(), first);
}

#[test]
fn declared_network_count_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("miscounted.cff");
    write_archive(&path, &manifest(2));

    let connectome = Connectome::open(&path).unwrap();
    assert_eq!(connectome.metadata().network_count, 2);
    assert!(matches!(
        connectome.check_network_count(),
        Err(CffError::NetworkCountMismatch(2, 1))
    ));

    let strict = ReaderOptions::new()
        .network_count(NetworkCountPolicy::Strict)
        .open(&path);
    assert!(matches!(strict, Err(CffError::NetworkCountMismatch(2, 1))));

    let ignored = ReaderOptions::new()
        .network_count(NetworkCountPolicy::Ignore)
        .open(&path);
    assert!(ignored.is_ok());

    // saving writes the actual count
    let fixed = dir.path().join("fixed.cff");
    connectome.save(&fixed).unwrap();
    let reopened = ReaderOptions::new()
        .network_count(NetworkCountPolicy::Strict)
        .open(&fixed)
        .unwrap();
    assert_eq!(reopened.metadata().network_count, 1);
}

#[test]
fn missing_member_fails_only_when_loaded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.cff");
    let manifest = manifest(1);
    let graphml = GRAPHML.as_bytes();
    write_zip(
        &path,
        &[("meta.xml", manifest.as_bytes()), (NETWORK_SRC, graphml)],
    );

    let mut connectome = Connectome::open(&path).unwrap();
    let track = connectome.tracks_mut().get_mut("fibers").unwrap();
    match track.load() {
        Err(CffError::Extraction(member, _)) => assert_eq!(member, TRACK_SRC),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!track.is_loaded());

    let network = connectome
        .networks_mut()
        .get_mut("connectome_freesurferaparc")
        .unwrap();
    network.load().unwrap();
}

#[test]
fn undecodable_payload_stays_unloaded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.cff");
    let manifest = manifest(1);
    write_zip(
        &path,
        &[("meta.xml", manifest.as_bytes()), (VOLUME_SRC, &b"not a nifti file"[..])],
    );

    let mut connectome = Connectome::open(&path).unwrap();
    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    match t1.load() {
        Err(CffError::Decode(format, member, _)) => {
            assert_eq!(format, "nifti");
            assert_eq!(member, VOLUME_SRC);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!t1.is_loaded());
    assert!(t1.decoded::<NiftiImage>().is_none());
}

#[test]
fn volume_with_overflowing_dimensions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("huge.cff");
    let mut volume = nifti_bytes();
    // dim[0..=7] starts at byte 40 of the header
    for (i, d) in [7u16].iter().chain([u16::MAX; 7].iter()).enumerate() {
        volume[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    let manifest = manifest(1);
    write_zip(
        &path,
        &[("meta.xml", manifest.as_bytes()), (VOLUME_SRC, volume.as_slice())],
    );

    let mut connectome = Connectome::open(&path).unwrap();
    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    assert!(matches!(t1.load(), Err(CffError::Decode(..))));
    assert!(!t1.is_loaded());
}

#[derive(Debug)]
struct SlowCodec;

impl Codec for SlowCodec {
    fn decode(&self, _member: &str, bytes: &[u8]) -> Result<Decoded, CodecError> {
        thread::sleep(Duration::from_millis(500));
        Ok(Box::new(bytes.to_vec()))
    }
}

#[test]
fn decode_timeout_leaves_entity_unloaded() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut codecs = Codecs::default();
    let _ = codecs.register("nifti", SlowCodec);

    let mut connectome = ReaderOptions::new()
        .codecs(codecs)
        .decode_timeout(Some(Duration::from_millis(20)))
        .io_timeout(Some(Duration::from_secs(10)))
        .open(&path)
        .unwrap();
    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    match t1.load() {
        Err(CffError::Timeout(_, limit)) => assert_eq!(limit, Duration::from_millis(20)),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!t1.is_loaded());

    // other formats are unaffected
    let network = connectome
        .networks_mut()
        .get_mut("connectome_freesurferaparc")
        .unwrap();
    network.load().unwrap();
}

#[test]
fn unregistered_format_cannot_be_decoded() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = ReaderOptions::new()
        .codecs(Codecs::empty())
        .open(&path)
        .unwrap();

    let bold = connectome.timeseries_mut().get_mut("bold").unwrap();
    assert!(matches!(bold.load(), Err(CffError::Decode(..))));
    assert!(!bold.is_loaded());
}

#[test]
fn failed_save_keeps_destination() {
    let dir = tempdir().unwrap();
    let destination = dir.path().join("keep.cff");
    fs::write(&destination, b"previous contents").unwrap();

    let mut connectome = Connectome::new(dir.path().join("never-written.cff"));
    connectome
        .add_track(Track::new("fibers", TRACK_SRC, TrackFormat::TrackVis))
        .unwrap();

    assert!(matches!(connectome.save(&destination), Err(CffError::Save(_))));
    assert_eq!(fs::read(&destination).unwrap(), b"previous contents");
    assert_eq!(dir_entries(dir.path()), vec!["keep.cff"]);
}

#[test]
fn modified_volume_is_encoded_on_save() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();

    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    t1.decoded_mut::<NiftiImage>().unwrap().data_mut()[0] = 99;
    assert!(t1.is_modified());

    let saved = dir.path().join("edited.cff");
    connectome.save(&saved).unwrap();

    let mut edited = Connectome::open(&saved).unwrap();
    let t1 = edited.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    let image = t1.decoded::<NiftiImage>().unwrap();
    assert_eq!(image.data()[0], 99);
    assert_eq!(&image.data()[1..], &nifti_image().data()[1..]);

    // untouched payloads are copied as they were
    assert_eq!(members(&saved)[NETWORK_SRC], GRAPHML.as_bytes());
}

#[test]
fn saving_over_the_source_archive() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();
    connectome.metadata_mut().description = "re-saved".to_owned();
    let _ = connectome.remove_surface("white").unwrap();

    connectome.save(&path).unwrap();

    let mut reopened = Connectome::open(&path).unwrap();
    assert_eq!(reopened.metadata().description, "re-saved");
    assert!(reopened.surfaces().is_empty());
    assert!(!members(&path).contains_key(SURFACE_SRC));
    let t1 = reopened.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    assert_eq!(t1.raw_bytes().unwrap(), nifti_bytes().as_slice());
}

#[test]
fn remove_returns_a_detached_entity() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();
    connectome.volumes_mut().get_mut("T1").unwrap().load().unwrap();

    let mut t1 = connectome.remove_volume("T1").unwrap();
    assert!(!t1.is_loaded());
    assert!(t1.archive_path().is_none());
    assert!(!connectome.volumes().contains("T1"));
    assert!(matches!(t1.load(), Err(CffError::Detached(_))));

    match connectome.remove_volume("T1") {
        Err(CffError::NotFound(kind, name)) => {
            assert_eq!(kind, "volume");
            assert_eq!(name, "T1");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // a removed entity can be registered again
    connectome.add_volume(t1).unwrap();
    let t1 = connectome.volumes_mut().get_mut("T1").unwrap();
    assert_eq!(t1.archive_path(), Some(path.as_path()));
    t1.load().unwrap();
}

#[test]
fn loaded_entity_moves_to_another_container() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut source = Connectome::open(&path).unwrap();
    let t1 = source.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    t1.decoded_mut::<NiftiImage>().unwrap().data_mut()[0] = 99;
    let t1 = source.remove_volume("T1").unwrap();

    let target_path = dir.path().join("target.cff");
    let mut target = Connectome::new(&target_path);
    target.add_volume(t1).unwrap();
    target.save(&target_path).unwrap();

    let mut reopened = Connectome::open(&target_path).unwrap();
    let t1 = reopened.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    assert_eq!(t1.decoded::<NiftiImage>().unwrap().data()[0], 99);

    // never loaded, so it reads its src from the new archive
    let white = source.remove_surface("white").unwrap();
    let mut empty = Connectome::new(dir.path().join("empty.cff"));
    empty.add_surface(white).unwrap();
    let white = empty.surfaces_mut().get_mut("white").unwrap();
    assert!(matches!(white.load(), Err(CffError::Extraction(..))));
}

#[test]
fn new_container_with_staged_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("new.cff");
    let mut connectome = Connectome::new(&path);
    connectome.metadata_mut().name = "Built from scratch".to_owned();
    connectome
        .add_volume(
            Volume::new("T1", VOLUME_SRC, VolumeFormat::Nifti)
                .with_dtype(VolumeDataKind::T1Weighted)
                .with_content(nifti_bytes()),
        )
        .unwrap();
    assert_eq!(
        connectome.volumes().get("T1").unwrap().archive_path(),
        Some(path.as_path())
    );

    WriterOptions::new(&path)
        .compress(false)
        .write(&connectome)
        .unwrap();

    let mut zip = ZipArchive::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(zip.by_index(0).unwrap().name(), "meta.xml");
    assert_eq!(
        zip.by_name(VOLUME_SRC).unwrap().compression(),
        CompressionMethod::Stored
    );

    let mut reopened = Connectome::open(&path).unwrap();
    assert_eq!(reopened.metadata().name, "Built from scratch");
    assert_eq!(reopened.metadata().network_count, 0);
    let t1 = reopened.volumes_mut().get_mut("T1").unwrap();
    t1.load().unwrap();
    assert!(t1.decoded::<NiftiImage>().is_some());
}

#[test]
fn close_all_releases_every_payload() {
    let dir = tempdir().unwrap();
    let path = sample_archive(&dir);
    let mut connectome = Connectome::open(&path).unwrap();
    connectome.volumes_mut().get_mut("T1").unwrap().load().unwrap();
    connectome.tracks_mut().get_mut("fibers").unwrap().load().unwrap();

    connectome.close_all();
    assert!(connectome.volumes().iter().all(|v| !v.is_loaded()));
    assert!(connectome.tracks().iter().all(|t| !t.is_loaded()));
}

#[test]
fn schema_violations_are_reported_together() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("invalid.cff");
    let manifest = manifest(1)
        .replace(r#"fileformat="Nifti""#, r#"fileformat="analyze""#)
        .replace(r#"dtype="surface""#, r#"dtype="mesh""#);
    write_archive(&path, &manifest);

    match Connectome::open(&path) {
        Err(CffError::SchemaValidation(reason)) => {
            assert!(reason.contains("analyze"), "{}", reason);
            assert!(reason.contains("mesh"), "{}", reason);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match ReaderOptions::new().validate_schema(false).open(&path) {
        Err(CffError::ManifestParse(reason)) => {
            assert!(reason.contains("analyze"), "{}", reason);
            assert!(reason.contains("mesh"), "{}", reason);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
