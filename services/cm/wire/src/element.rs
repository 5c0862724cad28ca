//! Owned XML element tree used for stanzas and stream-level elements.
//!
//! Elements keep their attributes in document order, including namespace
//! declarations, and remember the namespace they resolved to when parsed so
//! that a stanza lifted out of one stream can be re-serialized into another
//! without losing its namespace.

use std::fmt;

/// A child node of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element
    Element(Element),
    /// Character data (already unescaped)
    Text(String),
}

/// An XML element with attributes and children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an element from a possibly prefixed name such as `stream:features`
    pub fn new(name: impl AsRef<str>) -> Self {
        let (prefix, local) = split_qname(name.as_ref());
        Self {
            prefix: prefix.map(str::to_string),
            name: local.to_string(),
            ns: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create an element that declares `ns` as its default namespace
    pub fn with_ns(name: impl AsRef<str>, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        let mut element = Self::new(name);
        element.attrs.push(("xmlns".to_string(), ns.clone()));
        element.ns = Some(ns);
        element
    }

    pub(crate) fn from_parts(
        prefix: Option<String>,
        name: String,
        ns: Option<String>,
        attrs: Vec<(String, String)>,
    ) -> Self {
        Self {
            prefix,
            name,
            ns,
            attrs,
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style child append
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder-style text append
    pub fn text_node(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Set or replace an attribute
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key == "xmlns" {
            self.ns = Some(value.clone());
        }
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Remove an attribute, returning its previous value
    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let index = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(index).1)
    }

    /// Append a child element
    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        self.children.push(node);
    }

    /// Local name (without prefix)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace prefix, if the element was written with one
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Name as written, `prefix:local` or `local`
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.name),
            None => self.name.clone(),
        }
    }

    /// Resolved namespace URI
    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// True if the element has this local name and namespace
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    /// Attribute value by exact key (e.g. `to`, `xml:lang`)
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Child nodes in document order
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// Consume the element, returning its child elements
    pub fn into_children(self) -> impl Iterator<Item = Element> {
        self.children.into_iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First child element, ignoring text
    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    /// First child element with the given local name
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children().find(|child| child.name == name)
    }

    /// First child element with the given local name and namespace
    pub fn find_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|child| child.is(name, ns))
    }

    /// True if a child element with this local name exists
    pub fn has_child(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Concatenated direct text content
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize to a standalone XML fragment
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_xml(&mut out, None);
        out
    }

    /// Serialize as an unclosed start tag (used for stream headers)
    pub fn to_open_tag(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_start(&mut out, None);
        out.push('>');
        out
    }

    fn write_start(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.qualified_name());
        // Detached unprefixed elements carry their namespace with them.
        if self.prefix.is_none() && self.get_attr("xmlns").is_none() {
            if let Some(ns) = self.ns.as_deref() {
                if parent_ns != Some(ns) {
                    out.push_str(" xmlns=\"");
                    escape_into(out, ns, true);
                    out.push('"');
                }
            }
        }
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            escape_into(out, value, true);
            out.push('"');
        }
    }

    fn write_xml(&self, out: &mut String, parent_ns: Option<&str>) {
        self.write_start(out, parent_ns);
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_xml(out, self.ns.as_deref()),
                Node::Text(text) => escape_into(out, text, false),
            }
        }
        out.push_str("</");
        out.push_str(&self.qualified_name());
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Split `prefix:local` into its parts
pub(crate) fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

/// Escape text or attribute content
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(&mut out, text, true);
    out
}

fn escape_into(out: &mut String, text: &str, attribute: bool) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\'' if attribute => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
}
