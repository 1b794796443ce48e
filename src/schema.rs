//! Validation of manifests against the connectome schema.
//!
//! [`Schema::connectome`] compiles the bundled `resources/connectome.xsd`
//! ([`CONNECTOME_XSD`]) into a rule set. The compiler understands the subset
//! of XML Schema that the manifest format uses: one root element whose
//! content is a leading metadata element followed by a choice of entity
//! elements, `xs:all` metadata fields, entity types extending a common base,
//! `xs:unique` name constraints, and attribute restrictions given as
//! `xs:enumeration` values or `xs:pattern`s made of literal characters and
//! character classes.

use std::collections::{HashMap, HashSet};

use roxmltree::{Document, Node};

use crate::error::{CffError, Result};

/// XML Schema definition of the manifest format.
pub const CONNECTOME_XSD: &str = include_str!("../resources/connectome.xsd");

const XS_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const MAX_TYPE_DEPTH: usize = 8;

fn broken(reason: impl Into<String>) -> CffError {
    CffError::SchemaValidation(format!("invalid schema definition: {}", reason.into()))
}

/// A restriction pattern: alternative branches of single-character atoms.
#[derive(Debug, Clone, PartialEq)]
struct Pattern {
    branches: Vec<Vec<Vec<char>>>,
}

impl Pattern {
    fn literal(value: &str) -> Self {
        Pattern {
            branches: vec![value.chars().map(|c| vec![c]).collect()],
        }
    }

    fn compile(source: &str) -> Result<Self> {
        let unsupported = || broken(format!("unsupported pattern `{}`", source));
        let mut branches = Vec::new();
        for branch in source.split('|') {
            let mut atoms = Vec::new();
            let mut chars = branch.chars();
            while let Some(c) = chars.next() {
                match c {
                    '[' => {
                        let mut class = Vec::new();
                        loop {
                            match chars.next() {
                                Some(']') => break,
                                Some('\\') => class.push(escaped(chars.next()).ok_or_else(unsupported)?),
                                Some('-') | Some('[') | Some('^') | None => return Err(unsupported()),
                                Some(c) => class.push(c),
                            }
                        }
                        if class.is_empty() {
                            return Err(unsupported());
                        }
                        atoms.push(class);
                    }
                    '\\' => atoms.push(vec![escaped(chars.next()).ok_or_else(unsupported)?]),
                    '.' | '?' | '*' | '+' | '{' | '}' | '(' | ')' | ']' | '^' | '$' => {
                        return Err(unsupported())
                    }
                    c => atoms.push(vec![c]),
                }
            }
            branches.push(atoms);
        }
        Ok(Pattern { branches })
    }

    fn matches(&self, value: &str) -> bool {
        self.branches.iter().any(|atoms| {
            let mut chars = value.chars();
            atoms
                .iter()
                .all(|class| chars.next().map_or(false, |c| class.contains(&c)))
                && chars.next().is_none()
        })
    }
}

/// Single character escapes only; class escapes such as `\d` are not handled.
fn escaped(c: Option<char>) -> Option<char> {
    c.filter(|c| !c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone)]
struct AttributeRule {
    name: String,
    required: bool,
    non_empty: bool,
    values: Vec<Pattern>,
}

impl AttributeRule {
    fn accepts(&self, value: &str) -> bool {
        let value = value.trim();
        self.values.is_empty() || self.values.iter().any(|p| p.matches(value))
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    integer: bool,
}

/// Allowed shape of one kind of entity element.
#[derive(Debug, Clone)]
struct EntityRule {
    label: String,
    element: String,
    attributes: Vec<AttributeRule>,
    children: Vec<String>,
    unique_names: bool,
}

impl EntityRule {
    fn attribute(&self, name: &str) -> Option<&AttributeRule> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// A compiled manifest schema.
#[derive(Debug, Clone)]
pub struct Schema {
    namespace: Option<String>,
    root: String,
    root_attributes: Vec<AttributeRule>,
    meta: String,
    meta_fields: Vec<FieldRule>,
    entities: Vec<EntityRule>,
}

fn is_xs(node: &Node, name: &str) -> bool {
    node.is_element()
        && node.tag_name().namespace() == Some(XS_NAMESPACE)
        && node.tag_name().name() == name
}

fn xs_children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |n| is_xs(n, name))
}

fn xs_child<'a, 'input: 'a>(node: Node<'a, 'input>, name: &'static str) -> Result<Node<'a, 'input>> {
    xs_children(node, name)
        .next()
        .ok_or_else(|| broken(format!("missing <xs:{}>", name)))
}

fn name_of(node: Node) -> Result<String> {
    node.attribute("name")
        .map(str::to_owned)
        .ok_or_else(|| broken(format!("<xs:{}> without a name", node.tag_name().name())))
}

/// Local part of a qualified name.
fn local(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

type Types<'a, 'input> = HashMap<&'a str, Node<'a, 'input>>;

fn referenced<'a, 'input>(types: &Types<'a, 'input>, node: Node) -> Result<Node<'a, 'input>> {
    let reference = node
        .attribute("type")
        .ok_or_else(|| broken(format!("element `{}` has no type", node.attribute("name").unwrap_or_default())))?;
    types
        .get(local(reference))
        .copied()
        .ok_or_else(|| broken(format!("unknown type `{}`", reference)))
}

fn compile_attribute<'a, 'input>(
    types: &Types<'a, 'input>,
    attr: Node<'a, 'input>,
) -> Result<AttributeRule> {
    let simple = match xs_children(attr, "simpleType").next() {
        Some(simple) => Some(simple),
        None => attr
            .attribute("type")
            .and_then(|t| types.get(local(t)).copied()),
    };
    let mut rule = AttributeRule {
        name: name_of(attr)?,
        required: attr.attribute("use") == Some("required"),
        non_empty: false,
        values: Vec::new(),
    };
    if let Some(restriction) = simple.and_then(|s| xs_children(s, "restriction").next()) {
        for pattern in xs_children(restriction, "pattern") {
            rule.values.push(Pattern::compile(pattern.attribute("value").unwrap_or_default())?);
        }
        for value in xs_children(restriction, "enumeration") {
            rule.values.push(Pattern::literal(value.attribute("value").unwrap_or_default()));
        }
        rule.non_empty = xs_children(restriction, "minLength")
            .filter_map(|m| m.attribute("value"))
            .any(|v| v.trim() != "0");
    }
    Ok(rule)
}

/// Collect attributes and child elements of a complex type, bases first.
fn compile_content<'a, 'input>(
    types: &Types<'a, 'input>,
    ty: Node<'a, 'input>,
    rule: &mut EntityRule,
    depth: usize,
) -> Result<()> {
    if depth > MAX_TYPE_DEPTH {
        return Err(broken(format!("type chain of `{}` is too deep", rule.element)));
    }
    let body = match xs_children(ty, "complexContent").next() {
        Some(content) => {
            let extension = xs_child(content, "extension")?;
            let base = extension
                .attribute("base")
                .ok_or_else(|| broken("extension without a base"))?;
            let base = types
                .get(local(base))
                .copied()
                .ok_or_else(|| broken(format!("unknown type `{}`", base)))?;
            compile_content(types, base, rule, depth + 1)?;
            extension
        }
        None => ty,
    };
    for sequence in xs_children(body, "sequence") {
        for element in xs_children(sequence, "element") {
            rule.children.push(name_of(element)?);
        }
    }
    for attr in xs_children(body, "attribute") {
        rule.attributes.push(compile_attribute(types, attr)?);
    }
    Ok(())
}

impl Schema {
    /// Compile the bundled connectome schema.
    ///
    /// # Errors
    ///
    /// - `CffError::SchemaValidation` if the schema definition cannot be
    /// compiled.
    pub fn connectome() -> Result<Self> {
        Schema::from_xsd(CONNECTOME_XSD)
    }

    /// Compile a schema definition shaped like [`CONNECTOME_XSD`].
    pub fn from_xsd(xsd: &str) -> Result<Self> {
        let doc = Document::parse(xsd).map_err(|e| broken(e.to_string()))?;
        let schema = doc.root_element();
        if !is_xs(&schema, "schema") {
            return Err(broken("root element is not <xs:schema>"));
        }
        let types: Types = xs_children(schema, "complexType")
            .chain(xs_children(schema, "simpleType"))
            .filter_map(|t| t.attribute("name").map(|name| (name, t)))
            .collect();

        let root = xs_child(schema, "element")?;
        let root_name = name_of(root)?;
        let root_type = xs_child(root, "complexType")?;
        let root_attributes = xs_children(root_type, "attribute")
            .map(|a| compile_attribute(&types, a))
            .collect::<Result<Vec<_>>>()?;
        let unique: HashSet<&str> = xs_children(root, "unique")
            .filter(|u| xs_children(*u, "field").any(|f| f.attribute("xpath") == Some("@name")))
            .filter_map(|u| xs_children(u, "selector").next())
            .filter_map(|s| s.attribute("xpath"))
            .map(local)
            .collect();

        let sequence = xs_child(root_type, "sequence")?;
        let meta = xs_child(sequence, "element")?;
        let all = xs_child(referenced(&types, meta)?, "all")?;
        let meta_fields = xs_children(all, "element")
            .map(|field| {
                Ok(FieldRule {
                    name: name_of(field)?,
                    integer: field.attribute("type").map(local) == Some("nonNegativeInteger"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let prefix = format!("{}-", root_name);
        let mut entities = Vec::new();
        for element in xs_children(xs_child(sequence, "choice")?, "element") {
            let name = name_of(element)?;
            let mut rule = EntityRule {
                label: name.strip_prefix(prefix.as_str()).unwrap_or(name.as_str()).to_owned(),
                unique_names: unique.contains(name.as_str()),
                element: name,
                attributes: Vec::new(),
                children: Vec::new(),
            };
            compile_content(&types, referenced(&types, element)?, &mut rule, 0)?;
            entities.push(rule);
        }

        Ok(Schema {
            namespace: schema.attribute("targetNamespace").map(str::to_owned),
            root: root_name,
            root_attributes,
            meta: name_of(meta)?,
            meta_fields,
            entities,
        })
    }

    /// Check a manifest document.
    ///
    /// # Errors
    ///
    /// - `CffError::ManifestParse` if the document is not well-formed XML.
    /// - `CffError::SchemaValidation` listing every violation found.
    pub fn validate(&self, text: &str) -> Result<()> {
        let doc = Document::parse(text).map_err(|e| CffError::ManifestParse(e.to_string()))?;
        let violations = self.violations(doc.root_element());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CffError::SchemaValidation(violations.join("; ")))
        }
    }

    fn violations(&self, root: Node) -> Vec<String> {
        let mut out = Vec::new();

        if root.tag_name().name() != self.root {
            out.push(format!(
                "root element is <{}>, expected <{}>",
                root.tag_name().name(),
                self.root
            ));
            return out;
        }
        let namespace = self.namespace.as_deref();
        match root.tag_name().namespace() {
            ns if ns == namespace => {}
            None => out.push(format!(
                "root element is not in namespace `{}`",
                namespace.unwrap_or_default()
            )),
            Some(ns) => out.push(format!("unexpected namespace `{}`", ns)),
        }
        for attr in &self.root_attributes {
            match root.attribute(attr.name.as_str()) {
                Some(v) if !(attr.non_empty && v.trim().is_empty()) => {
                    if !attr.accepts(v) {
                        out.push(format!("root element has unknown {} `{}`", attr.name, v));
                    }
                }
                None if !attr.required => {}
                _ => out.push(format!("root element has no {}", attr.name)),
            }
        }

        let mut seen_meta = false;
        let mut names: Vec<HashSet<&str>> = vec![HashSet::new(); self.entities.len()];
        for (position, child) in root.children().filter(Node::is_element).enumerate() {
            let tag = child.tag_name().name();
            if child.tag_name().namespace() != namespace {
                out.push(format!("<{}> is not in the manifest namespace", tag));
                continue;
            }
            if tag == self.meta {
                if seen_meta {
                    out.push(format!("more than one <{}>", self.meta));
                } else if position != 0 {
                    out.push(format!("<{}> must be the first element", self.meta));
                }
                seen_meta = true;
                self.check_meta(child, &mut out);
                continue;
            }
            match self.entities.iter().position(|r| r.element == tag) {
                Some(index) => {
                    let rule = &self.entities[index];
                    check_entity(rule, namespace, child, &mut out);
                    if let Some(name) = child.attribute("name") {
                        if rule.unique_names && !names[index].insert(name.trim()) {
                            out.push(format!("duplicate {} name `{}`", rule.label, name.trim()));
                        }
                    }
                }
                None => out.push(format!("unexpected element <{}>", tag)),
            }
        }
        if !seen_meta {
            out.push(format!("missing <{}>", self.meta));
        }
        out
    }

    fn check_meta(&self, meta: Node, out: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for field in meta.children().filter(Node::is_element) {
            let name = field.tag_name().name();
            if field.tag_name().namespace() != self.namespace.as_deref() {
                out.push(format!("<{}> is not in the manifest namespace", name));
                continue;
            }
            let rule = match self.meta_fields.iter().find(|f| f.name == name) {
                Some(rule) => rule,
                None => {
                    out.push(format!("unknown metadata field <{}>", name));
                    continue;
                }
            };
            if !seen.insert(name) {
                out.push(format!("metadata field <{}> appears more than once", name));
            }
            if field.children().any(|n| n.is_element()) {
                out.push(format!("metadata field <{}> must contain text only", name));
            }
            if rule.integer {
                let text = field.text().unwrap_or_default().trim();
                let digits = text.strip_prefix('+').unwrap_or(text);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    out.push(format!("<{}> must be a non-negative integer, found `{}`", name, text));
                }
            }
        }
    }
}

fn check_entity(rule: &EntityRule, namespace: Option<&str>, node: Node, out: &mut Vec<String>) {
    let label = &rule.label;
    let name = node.attribute("name").map(str::trim).unwrap_or_default();
    let shown = if name.is_empty() { "<unnamed>" } else { name };

    for attr in &rule.attributes {
        let missing = match node.attribute(attr.name.as_str()) {
            None => attr.required,
            Some(v) if attr.non_empty && v.trim().is_empty() => true,
            Some(v) => {
                if !attr.accepts(v) {
                    out.push(format!("{} `{}` has unknown {} `{}`", label, shown, attr.name, v));
                }
                false
            }
        };
        if missing && attr.name == "name" {
            out.push(format!("{} without a name", label));
        } else if missing {
            out.push(format!("{} `{}` has no {}", label, shown, attr.name));
        }
    }
    for attr in node.attributes() {
        if attr.namespace().is_none() && rule.attribute(attr.name()).is_none() {
            out.push(format!("{} `{}` has unknown attribute `{}`", label, shown, attr.name()));
        }
    }

    let mut seen = HashSet::new();
    for child in node.children().filter(Node::is_element) {
        let tag = child.tag_name().name();
        if child.tag_name().namespace() != namespace || !rule.children.iter().any(|c| c == tag) {
            out.push(format!("{} `{}` has unexpected child <{}>", label, shown, tag));
        } else if !seen.insert(tag) {
            out.push(format!("{} `{}` has more than one {}", label, shown, tag));
        }
    }
}

/// Check a manifest document against [`Schema::connectome`].
pub fn validate_manifest(text: &str) -> Result<()> {
    Schema::connectome()?.validate(text)
}
