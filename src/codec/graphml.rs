//! GraphML network payloads.

use std::collections::{BTreeMap, HashSet};
use std::io;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{Codec, CodecError, Decoded};

const GRAPHML_NAMESPACE: &str = "http://graphml.graphdrawing.org/xmlns";

quick_error! {
    /// Errors raised while decoding or encoding a GraphML payload.
    #[derive(Debug)]
    pub enum GraphMlError {
        /// The payload is not valid UTF-8
        Encoding(err: std::str::Utf8Error) {
            from()
            source(err)
            display("GraphML payload is not UTF-8: {}", err)
        }
        /// The payload is not well-formed XML
        Xml(err: roxmltree::Error) {
            from()
            source(err)
            display("Malformed GraphML: {}", err)
        }
        /// The document has no `<graph>` element
        MissingGraph {
            display("GraphML document has no <graph> element")
        }
        /// A required attribute is absent
        MissingAttribute(element: &'static str, attribute: &'static str) {
            display("<{}> is missing the `{}` attribute", element, attribute)
        }
        /// An edge points at a node that was never declared
        UnknownNode(id: String) {
            display("Edge refers to undeclared node `{}`", id)
        }
        /// The graph could not be serialized
        Write(reason: String) {
            display("Could not write GraphML: {}", reason)
        }
    }
}

/// A `<key>` declaration, naming the data attached to nodes or edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphKey {
    /// Identifier referenced by `<data key=..>`
    pub id: String,
    /// The `for` attribute: `node`, `edge`, `graph` or `all`
    pub domain: String,
    /// The `attr.name` attribute
    pub name: String,
    /// The `attr.type` attribute
    pub value_type: String,
}

/// A network node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node identifier, unique within the graph
    pub id: String,
    /// Data values keyed by key id.
    pub data: BTreeMap<String, String>,
}

/// A network edge between two declared nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
    /// Data values keyed by key id.
    pub data: BTreeMap<String, String>,
}

/// A decoded network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Graph {
    /// Whether edges default to directed
    pub directed: bool,
    /// Data key declarations
    pub keys: Vec<GraphKey>,
    /// Nodes in document order
    pub nodes: Vec<Node>,
    /// Edges in document order
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Parse a GraphML document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Graph, GraphMlError> {
        let text = std::str::from_utf8(bytes)?;
        let doc = roxmltree::Document::parse(text)?;
        let root = doc.root_element();

        let keys = root
            .children()
            .filter(|n| n.tag_name().name() == "key")
            .map(|n| {
                Ok(GraphKey {
                    id: required(n, "key", "id")?.to_owned(),
                    domain: n.attribute("for").unwrap_or("all").to_owned(),
                    name: n.attribute("attr.name").unwrap_or_default().to_owned(),
                    value_type: n.attribute("attr.type").unwrap_or("string").to_owned(),
                })
            })
            .collect::<Result<Vec<_>, GraphMlError>>()?;

        let graph = root
            .children()
            .find(|n| n.tag_name().name() == "graph")
            .ok_or(GraphMlError::MissingGraph)?;
        let directed = graph.attribute("edgedefault") == Some("directed");

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for child in graph.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "node" => nodes.push(Node {
                    id: required(child, "node", "id")?.to_owned(),
                    data: data_of(child),
                }),
                "edge" => edges.push(Edge {
                    source: required(child, "edge", "source")?.to_owned(),
                    target: required(child, "edge", "target")?.to_owned(),
                    data: data_of(child),
                }),
                _ => {}
            }
        }

        let declared: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &edges {
            for end in &[&edge.source, &edge.target] {
                if !declared.contains(end.as_str()) {
                    return Err(GraphMlError::UnknownNode(end.to_string()));
                }
            }
        }

        Ok(Graph {
            directed,
            keys,
            nodes,
            edges,
        })
    }

    /// Serialize the graph as a GraphML document.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GraphMlError> {
        self.write().map_err(|e| GraphMlError::Write(e.to_string()))
    }

    fn write(&self) -> Result<Vec<u8>, quick_xml::Error> {
        let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("graphml");
        root.push_attribute(("xmlns", GRAPHML_NAMESPACE));
        w.write_event(Event::Start(root))?;

        for key in &self.keys {
            let mut elem = BytesStart::new("key");
            elem.push_attribute(("id", key.id.as_str()));
            elem.push_attribute(("for", key.domain.as_str()));
            if !key.name.is_empty() {
                elem.push_attribute(("attr.name", key.name.as_str()));
            }
            elem.push_attribute(("attr.type", key.value_type.as_str()));
            w.write_event(Event::Empty(elem))?;
        }

        let mut graph = BytesStart::new("graph");
        let edgedefault = if self.directed { "directed" } else { "undirected" };
        graph.push_attribute(("edgedefault", edgedefault));
        w.write_event(Event::Start(graph))?;

        for node in &self.nodes {
            let mut elem = BytesStart::new("node");
            elem.push_attribute(("id", node.id.as_str()));
            write_with_data(&mut w, elem, "node", &node.data)?;
        }
        for edge in &self.edges {
            let mut elem = BytesStart::new("edge");
            elem.push_attribute(("source", edge.source.as_str()));
            elem.push_attribute(("target", edge.target.as_str()));
            write_with_data(&mut w, elem, "edge", &edge.data)?;
        }

        w.write_event(Event::End(BytesEnd::new("graph")))?;
        w.write_event(Event::End(BytesEnd::new("graphml")))?;
        Ok(w.into_inner())
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Resolve a data value by the key's `attr.name`, falling back to the key id.
    pub fn value<'a>(&self, data: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
        let id = self
            .keys
            .iter()
            .find(|k| k.name == name)
            .map(|k| k.id.as_str())
            .unwrap_or(name);
        data.get(id).map(String::as_str)
    }
}

fn required<'a>(
    node: roxmltree::Node<'a, '_>,
    element: &'static str,
    attribute: &'static str,
) -> Result<&'a str, GraphMlError> {
    node.attribute(attribute)
        .ok_or(GraphMlError::MissingAttribute(element, attribute))
}

fn data_of(node: roxmltree::Node) -> BTreeMap<String, String> {
    node.children()
        .filter(|n| n.tag_name().name() == "data")
        .filter_map(|n| {
            let key = n.attribute("key")?;
            Some((key.to_owned(), n.text().unwrap_or_default().trim().to_owned()))
        })
        .collect()
}

fn write_with_data<W: io::Write>(
    w: &mut Writer<W>,
    elem: BytesStart,
    name: &str,
    data: &BTreeMap<String, String>,
) -> Result<(), quick_xml::Error> {
    if data.is_empty() {
        return w.write_event(Event::Empty(elem));
    }
    w.write_event(Event::Start(elem))?;
    for (key, value) in data {
        let mut entry = BytesStart::new("data");
        entry.push_attribute(("key", key.as_str()));
        w.write_event(Event::Start(entry))?;
        w.write_event(Event::Text(BytesText::new(value)))?;
        w.write_event(Event::End(BytesEnd::new("data")))?;
    }
    w.write_event(Event::End(BytesEnd::new(name)))
}

/// Codec for `graphml` networks, decoding into [`Graph`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphMlCodec;

impl Codec for GraphMlCodec {
    fn decode(&self, _member: &str, bytes: &[u8]) -> Result<Decoded, CodecError> {
        Ok(Box::new(Graph::from_bytes(bytes)?))
    }

    fn encode(&self, _member: &str, decoded: &Decoded) -> Option<Result<Vec<u8>, CodecError>> {
        let graph = decoded.downcast_ref::<Graph>()?;
        Some(graph.to_bytes().map_err(From::from))
    }
}
