//! Owned XML element tree.
//!
//! NETCONF messages are small XML documents that must outlive the read
//! buffer they arrived in, so the reader produces a fully owned tree.
//! Element names are stored without prefix; the namespace each element
//! resolved to at parse time is kept alongside, while the literal
//! attributes (including `xmlns` declarations) are preserved for
//! serialization.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::WireError;

/// One XML element with its attributes, text content, and children.
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    /// Local element name (prefix stripped).
    pub name: String,
    /// Namespace the element resolved to when parsed, if any.
    pub namespace: Option<String>,
    /// Attributes in document order, `xmlns` declarations included.
    pub attributes: Vec<(String, String)>,
    /// Trimmed character data.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlElement>,
}

impl PartialEq for XmlElement {
    /// Equality over the serializable content; the parse-time resolved
    /// namespace is derived from the attributes and not compared.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attributes == other.attributes
            && self.text == other.text
            && self.children == other.children
    }
}

impl Eq for XmlElement {}

impl XmlElement {
    /// Create an element with the given local name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the default namespace: records both the `xmlns` attribute and
    /// the resolved namespace.
    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.attributes.push(("xmlns".to_string(), ns.clone()));
        self.namespace = Some(ns);
        self
    }

    /// Append an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Append a child element.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Set the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Look up an attribute value by its literal name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Parse one XML document into an owned tree.
    pub fn parse(input: &str) -> Result<XmlElement, WireError> {
        let mut reader = NsReader::from_str(input);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let (ns, event) = reader
                .read_resolved_event()
                .map_err(|e| WireError::Xml(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    let el = build_element(&ns, &start)?;
                    stack.push(el);
                }
                Event::Empty(start) => {
                    let el = build_element(&ns, &start)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| WireError::Xml("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    let s = text
                        .unescape()
                        .map_err(|e| WireError::Xml(e.to_string()))?;
                    let trimmed = s.trim();
                    if !trimmed.is_empty() {
                        if let Some(cur) = stack.last_mut() {
                            cur.text.push_str(trimmed);
                        }
                    }
                }
                Event::CData(data) => {
                    let s = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some(cur) = stack.last_mut() {
                        cur.text.push_str(&s);
                    }
                }
                Event::Eof => break,
                // Declarations, comments, and processing instructions carry
                // no message content.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(WireError::Xml("unterminated element".to_string()));
        }
        root.ok_or_else(|| WireError::Xml("empty document".to_string()))
    }

    /// Serialize the tree to a string without added whitespace.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if !self.text.is_empty() {
            out.push_str(&escape(self.text.as_str()));
        }
        for child in &self.children {
            child.write_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Build an element from a start tag and its resolved namespace.
fn build_element(
    ns: &ResolveResult<'_>,
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<XmlElement, WireError> {
    let mut el =
        XmlElement::new(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
    if let ResolveResult::Bound(bound) = ns {
        el.namespace = Some(String::from_utf8_lossy(bound.0).into_owned());
    }
    for attr in start.attributes() {
        let attr = attr.map_err(|e| WireError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| WireError::Xml(e.to_string()))?
            .into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}

/// Attach a finished element to its parent, or record it as the root.
fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    el: XmlElement,
) -> Result<(), WireError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(el);
        Ok(())
    } else if root.is_none() {
        *root = Some(el);
        Ok(())
    } else {
        Err(WireError::Xml("multiple root elements".to_string()))
    }
}
