//! This module parses and writes `meta.xml`, the manifest describing the
//! contents of a connectome archive.
//!
//! Parsing is tolerant: missing optional fields take default values, and a
//! problem found in one entity kind does not stop the others from being
//! read. Problems are collected in [`Manifest::problems`].

use std::collections::BTreeMap;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node};

use crate::entity::{
    EntityKind, NetworkKind, SurfaceKind, TimeserieKind, TrackKind, VolumeKind,
};
use crate::error::{CffError, Result};

/// Name of the manifest member at the archive root.
pub const MANIFEST_MEMBER: &str = "meta.xml";
/// XML namespace of connectome manifests.
pub const CFF_NAMESPACE: &str = "http://www.connectome.ch/2009/Connectome/xmlns";
/// Format version written by this crate.
pub const FORMAT_VERSION: &str = "1.0";

pub(crate) const ROOT_ELEMENT: &str = "connectome";
pub(crate) const META_ELEMENT: &str = "connectome-meta";
pub(crate) const DESCRIPTION_ELEMENT: &str = "description";
pub(crate) const NETWORK_COUNT_FIELD: &str = "nr_of_networks";

/// Top-level information about a connectome archive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Format version, from the root element
    pub version: String,
    /// Software which produced the archive
    pub generator: String,
    /// Original author
    pub initial_creator: String,
    /// Creation date, as written in the manifest
    pub creation_date: String,
    /// Last modification date, as written in the manifest
    pub modification_date: String,
    /// Display name
    pub name: String,
    /// Species of the subject
    pub species: String,
    /// Licensing terms
    pub legal_notice: String,
    /// Bibliographic references
    pub references: String,
    /// Related web page
    pub url: String,
    /// Free-text description
    pub description: String,
    /// Number of networks the manifest claims to describe
    pub network_count: u32,
}

impl Metadata {
    fn field_mut(&mut self, field: &str) -> Option<&mut String> {
        Some(match field {
            "generator" => &mut self.generator,
            "initial-creator" => &mut self.initial_creator,
            "creation-date" => &mut self.creation_date,
            "modification-date" => &mut self.modification_date,
            "name" => &mut self.name,
            "species" => &mut self.species,
            "legal-notice" => &mut self.legal_notice,
            "references" => &mut self.references,
            "url" => &mut self.url,
            "description" => &mut self.description,
            _ => return None,
        })
    }

    pub(crate) fn text_fields(&self) -> [(&'static str, &str); 10] {
        [
            ("generator", &self.generator),
            ("initial-creator", &self.initial_creator),
            ("creation-date", &self.creation_date),
            ("modification-date", &self.modification_date),
            ("name", &self.name),
            ("species", &self.species),
            ("legal-notice", &self.legal_notice),
            ("references", &self.references),
            ("url", &self.url),
            ("description", &self.description),
        ]
    }
}

/// The manifest record of one entity, before it is turned into a typed entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Unique name within its kind
    pub name: String,
    /// Member path inside the archive
    pub src: String,
    /// Declared file format tag, possibly empty
    pub format: String,
    /// Declared data kind tag
    pub dtype: Option<String>,
    /// Free-text description
    pub description: String,
}

/// Descriptors of one kind, keyed by name.
pub type DescriptorMap = BTreeMap<String, Descriptor>;

/// A problem found while reading part of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestProblem {
    /// The section where it was found: an entity kind or `metadata`
    pub section: &'static str,
    /// What went wrong
    pub message: String,
}

/// A parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    /// Archive metadata
    pub metadata: Metadata,
    /// Network descriptors
    pub networks: DescriptorMap,
    /// Volume descriptors
    pub volumes: DescriptorMap,
    /// Surface descriptors
    pub surfaces: DescriptorMap,
    /// Track descriptors
    pub tracks: DescriptorMap,
    /// Timeserie descriptors
    pub timeseries: DescriptorMap,
    /// Problems found while parsing, in document order per section
    pub problems: Vec<ManifestProblem>,
}

impl Manifest {
    /// Parse a manifest from raw bytes, which must be UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CffError::ManifestParse(format!("manifest is not UTF-8: {}", e)))?;
        Manifest::parse(text)
    }

    /// Parse a manifest document.
    ///
    /// # Errors
    ///
    /// - `CffError::ManifestParse` if the text is not well-formed XML or its
    /// root is not a `<connectome>` element.
    pub fn parse(text: &str) -> Result<Manifest> {
        let doc = Document::parse(text).map_err(|e| CffError::ManifestParse(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != ROOT_ELEMENT {
            return Err(CffError::ManifestParse(format!(
                "expected <{}> root element, found <{}>",
                ROOT_ELEMENT,
                root.tag_name().name()
            )));
        }

        let mut problems = Vec::new();
        let mut metadata = parse_metadata(root, &mut problems);
        metadata.version = root.attribute("version").unwrap_or_default().trim().to_owned();

        Ok(Manifest {
            metadata,
            networks: parse_descriptors::<NetworkKind>(root, &mut problems),
            volumes: parse_descriptors::<VolumeKind>(root, &mut problems),
            surfaces: parse_descriptors::<SurfaceKind>(root, &mut problems),
            tracks: parse_descriptors::<TrackKind>(root, &mut problems),
            timeseries: parse_descriptors::<TimeserieKind>(root, &mut problems),
            problems,
        })
    }

    /// Serialize the manifest. Problems are not written.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        self.write()
            .map_err(|e| CffError::Save(format!("could not write manifest: {}", e)))
    }

    fn write(&self) -> ::std::result::Result<Vec<u8>, quick_xml::Error> {
        let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let version = if self.metadata.version.is_empty() {
            FORMAT_VERSION
        } else {
            self.metadata.version.as_str()
        };
        let mut root = BytesStart::new(ROOT_ELEMENT);
        root.push_attribute(("xmlns", CFF_NAMESPACE));
        root.push_attribute(("version", version));
        w.write_event(Event::Start(root))?;

        w.write_event(Event::Start(BytesStart::new(META_ELEMENT)))?;
        for (field, value) in self.metadata.text_fields().iter() {
            if !value.is_empty() {
                write_text_element(&mut w, field, value)?;
            }
        }
        let count = self.metadata.network_count.to_string();
        write_text_element(&mut w, NETWORK_COUNT_FIELD, &count)?;
        w.write_event(Event::End(BytesEnd::new(META_ELEMENT)))?;

        write_descriptors(&mut w, NetworkKind::ELEMENT, &self.networks)?;
        write_descriptors(&mut w, VolumeKind::ELEMENT, &self.volumes)?;
        write_descriptors(&mut w, SurfaceKind::ELEMENT, &self.surfaces)?;
        write_descriptors(&mut w, TrackKind::ELEMENT, &self.tracks)?;
        write_descriptors(&mut w, TimeserieKind::ELEMENT, &self.timeseries)?;

        w.write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))?;
        Ok(w.into_inner())
    }
}

fn element_text(node: Node) -> String {
    node.text().unwrap_or_default().trim().to_owned()
}

fn parse_metadata(root: Node, problems: &mut Vec<ManifestProblem>) -> Metadata {
    let mut metadata = Metadata::default();
    let meta = match root
        .children()
        .find(|n| n.tag_name().name() == META_ELEMENT)
    {
        Some(meta) => meta,
        None => return metadata,
    };

    for field in meta.children().filter(Node::is_element) {
        let name = field.tag_name().name();
        if name == NETWORK_COUNT_FIELD {
            let text = element_text(field);
            match text.parse::<u32>() {
                Ok(count) => metadata.network_count = count,
                Err(_) if text.is_empty() => {}
                Err(_) => problems.push(ManifestProblem {
                    section: "metadata",
                    message: format!("network count `{}` is not a non-negative integer", text),
                }),
            }
        } else if let Some(slot) = metadata.field_mut(name) {
            *slot = element_text(field);
        }
    }
    metadata
}

fn parse_descriptors<K: EntityKind>(root: Node, problems: &mut Vec<ManifestProblem>) -> DescriptorMap {
    let mut descriptors = DescriptorMap::new();
    let mut problem = |message: String| {
        problems.push(ManifestProblem {
            section: K::LABEL,
            message,
        })
    };

    for (index, node) in root
        .children()
        .filter(|n| n.tag_name().name() == K::ELEMENT)
        .enumerate()
    {
        let name = node.attribute("name").unwrap_or_default().trim();
        if name.is_empty() {
            problem(format!("{} entry #{} has no name", K::LABEL, index + 1));
            continue;
        }
        let src = node.attribute("src").unwrap_or_default().trim();
        if src.is_empty() {
            problem(format!("{} `{}` has no source path", K::LABEL, name));
            continue;
        }
        if descriptors.contains_key(name) {
            problem(format!("{} `{}` is described more than once", K::LABEL, name));
            continue;
        }

        let description = node
            .children()
            .find(|n| n.tag_name().name() == DESCRIPTION_ELEMENT)
            .map(element_text)
            .unwrap_or_default();
        let descriptor = Descriptor {
            name: name.to_owned(),
            src: src.to_owned(),
            format: node.attribute("fileformat").unwrap_or_default().trim().to_owned(),
            dtype: node.attribute("dtype").map(|d| d.trim().to_owned()),
            description,
        };
        let _ = descriptors.insert(descriptor.name.clone(), descriptor);
    }
    descriptors
}

fn write_text_element<W: std::io::Write>(
    w: &mut Writer<W>,
    name: &str,
    text: &str,
) -> ::std::result::Result<(), quick_xml::Error> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))
}

fn write_descriptors<W: std::io::Write>(
    w: &mut Writer<W>,
    element: &str,
    descriptors: &DescriptorMap,
) -> ::std::result::Result<(), quick_xml::Error> {
    for d in descriptors.values() {
        let mut start = BytesStart::new(element);
        start.push_attribute(("name", d.name.as_str()));
        start.push_attribute(("src", d.src.as_str()));
        start.push_attribute(("fileformat", d.format.as_str()));
        if let Some(dtype) = &d.dtype {
            start.push_attribute(("dtype", dtype.as_str()));
        }
        if d.description.is_empty() {
            w.write_event(Event::Empty(start))?;
        } else {
            w.write_event(Event::Start(start))?;
            write_text_element(w, DESCRIPTION_ELEMENT, &d.description)?;
            w.write_event(Event::End(BytesEnd::new(element)))?;
        }
    }
    Ok(())
}
