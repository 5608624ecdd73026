//! A minimal XML element tree: just enough structure (tag, ordered
//! attributes, text, children) to parse the template/fragment documents,
//! merge them, and write the master document back out in the data
//! server's exact expected shape.
//!
//! Parsing rides on `quick_xml`'s event reader; the tree itself and the
//! writer are hand-rolled because the data server's serialization has
//! quirks (`ISO-8859-1` declaration, numeric character references only for
//! non-ASCII text, always-long-form empty elements) that don't match any
//! general-purpose XML writer's defaults.

use std::fmt::Write as _;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::core::errors::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.tag == tag)
    }
}

/// Parses a complete XML document into its root element. Comments and
/// processing instructions are skipped; CDATA is treated as text.
pub fn parse_document(source: &str) -> Result<XmlElement, CoreError> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(CoreError::from)? {
            Event::Start(e) => {
                let elem = start_element(&e)?;
                stack.push(elem);
            }
            Event::Empty(e) => {
                let elem = start_element(&e)?;
                push_completed(&mut stack, &mut root, elem);
            }
            Event::End(_) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| CoreError::parse("unbalanced closing tag"))?;
                push_completed(&mut stack, &mut root, elem);
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(CoreError::from)?.into_owned();
                if !text.trim().is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.text = Some(text);
                    }
                }
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                if let Some(top) = stack.last_mut() {
                    top.text = Some(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| CoreError::parse("document has no root element"))
}

fn start_element(e: &quick_xml::events::BytesStart) -> Result<XmlElement, CoreError> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CoreError::parse(format!("malformed attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(CoreError::from)?.into_owned();
        attrs.push((key, value));
    }
    Ok(XmlElement {
        tag,
        attrs,
        text: None,
        children: Vec::new(),
    })
}

fn push_completed(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, elem: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(elem),
        None => *root = Some(elem),
    }
}

/// Serializes `root` into the data server's master document form: an
/// `ISO-8859-1`-declared prolog, 2-space indentation per nesting level,
/// always-long-form empty elements, and non-ASCII codepoints written as
/// `&#N;` numeric references rather than UTF-8 bytes.
pub fn write_document(root: &XmlElement) -> String {
    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='ISO-8859-1'?>\n");
    write_element(&mut out, root, 0);
    out
}

fn write_element(out: &mut String, elem: &XmlElement, depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&indent);
    out.push('<');
    out.push_str(&elem.tag);
    for (key, value) in &elem.attrs {
        let _ = write!(out, " {key}=\"{}\"", escape(value, true));
    }

    let has_text = elem.text.as_ref().is_some_and(|t| !t.is_empty());
    if elem.children.is_empty() && !has_text {
        out.push_str("></");
        out.push_str(&elem.tag);
        out.push_str(">\n");
        return;
    }

    out.push('>');
    if has_text {
        out.push_str(&escape(elem.text.as_deref().unwrap_or_default(), false));
    }
    if !elem.children.is_empty() {
        out.push('\n');
        for child in &elem.children {
            write_element(out, child, depth + 1);
        }
        out.push_str(&indent);
    }
    out.push_str("</");
    out.push_str(&elem.tag);
    out.push_str(">\n");
}

fn escape(text: &str, is_attr: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if is_attr => out.push_str("&quot;"),
            c if (c as u32) >= 128 => {
                let _ = write!(out, "&#{};", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_with_attributes_and_text() {
        let doc = parse_document(
            r#"<erddapDatasets>
                <dataset type="EDDTableFromAsciiFiles" datasetID="abc123">
                    <reloadEveryNMinutes>10</reloadEveryNMinutes>
                </dataset>
            </erddapDatasets>"#,
        )
        .unwrap();
        assert_eq!(doc.tag, "erddapDatasets");
        assert_eq!(doc.children.len(), 1);
        let dataset = &doc.children[0];
        assert_eq!(dataset.attr("datasetID"), Some("abc123"));
        assert_eq!(dataset.children[0].text.as_deref(), Some("10"));
    }

    #[test]
    fn write_document_escapes_non_ascii_as_numeric_references() {
        let mut root = XmlElement::new("title");
        root.text = Some("Caf\u{e9}".to_string());
        let out = write_document(&root);
        assert!(out.contains("Caf&#233;"));
    }

    #[test]
    fn write_document_uses_long_form_for_empty_elements() {
        let root = XmlElement::new("emptyTag");
        let out = write_document(&root);
        assert!(out.contains("<emptyTag></emptyTag>"));
    }

    #[test]
    fn round_trips_a_simple_document() {
        let original = "<a><b x=\"1\">hello</b><c></c></a>";
        let parsed = parse_document(original).unwrap();
        let written = write_document(&parsed);
        let reparsed = parse_document(&written).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
