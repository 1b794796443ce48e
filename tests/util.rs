#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use cff::codec::nifti::NiftiType;
use cff::NiftiImage;
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const NETWORK_SRC: &str = "CNetwork/connectome_freesurferaparc.graphml";
pub const VOLUME_SRC: &str = "Volumes/t1.nii";
pub const SURFACE_SRC: &str = "CSurface/lh.white.gii";
pub const TRACK_SRC: &str = "CTrack/fibers.trk";
pub const TIMESERIE_SRC: &str = "CTimeserie/bold.h5";

/// A two-node network.
pub const GRAPHML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<graphml xmlns="http://graphml.graphdrawing.org/xmlns">
  <key id="d0" for="node" attr.name="dn_name" attr.type="string"/>
  <key id="d1" for="edge" attr.name="number_of_fibers" attr.type="int"/>
  <graph edgedefault="undirected">
    <node id="1"><data key="d0">lh.precentral</data></node>
    <node id="2"><data key="d0">rh.precentral</data></node>
    <edge source="1" target="2"><data key="d1">42</data></edge>
  </graph>
</graphml>"#;

/// Manifest describing one entity of each kind, declaring `networks`
/// networks.
pub fn manifest(networks: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<connectome xmlns="http://www.connectome.ch/2009/Connectome/xmlns" version="1.0">
  <connectome-meta>
    <generator>cfflib 2.0</generator>
    <initial-creator>Connectome Mapper</initial-creator>
    <name>Subject 1</name>
    <species>Homo sapiens</species>
    <nr_of_networks>{}</nr_of_networks>
  </connectome-meta>
  <connectome-network name="connectome_freesurferaparc" src="{}" fileformat="GraphML">
    <description>Freesurfer parcellation</description>
  </connectome-network>
  <connectome-volume name="T1" src="{}" fileformat="Nifti" dtype="T1-weighted"/>
  <connectome-surface name="white" src="{}" fileformat="Gifti" dtype="surface"/>
  <connectome-track name="fibers" src="{}" fileformat="TrackVis"/>
  <connectome-timeserie name="bold" src="{}" fileformat="HDF5"/>
</connectome>
"#,
        networks, NETWORK_SRC, VOLUME_SRC, SURFACE_SRC, TRACK_SRC, TIMESERIE_SRC
    )
}

/// A 2x2x2 unsigned byte volume.
pub fn nifti_image() -> NiftiImage {
    NiftiImage::new(&[2, 2, 2], NiftiType::Uint8, (10..18).collect()).unwrap()
}

pub fn nifti_bytes() -> Vec<u8> {
    nifti_image().to_bytes(false).unwrap()
}

/// Payload members matching `manifest`.
pub fn payloads() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (NETWORK_SRC, GRAPHML.as_bytes().to_vec()),
        (VOLUME_SRC, nifti_bytes()),
        (SURFACE_SRC, b"<GIFTI/>".to_vec()),
        (TRACK_SRC, b"TRACK\0fibers".to_vec()),
        (TIMESERIE_SRC, b"\x89HDF\r\n\x1a\n".to_vec()),
    ]
}

/// Write a zip archive holding the given members.
pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in members {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    let _ = zip.finish().unwrap();
}

/// Write an archive with the given manifest and the sample payloads.
pub fn write_archive(path: &Path, manifest: &str) {
    let payloads = payloads();
    let mut members: Vec<(&str, &[u8])> = vec![("meta.xml", manifest.as_bytes())];
    members.extend(payloads.iter().map(|(name, bytes)| (*name, bytes.as_slice())));
    write_zip(path, &members);
}

/// A complete sample archive inside `dir`.
pub fn sample_archive(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("subject1.cff");
    write_archive(&path, &manifest(1));
    path
}

/// Files left in `dir`, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
