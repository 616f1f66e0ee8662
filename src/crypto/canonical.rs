//! Deterministic XML canonical form
//!
//! Signing and verification hash this form rather than raw document bytes, so
//! the signature survives re-serialization of insignificant syntax:
//!
//! - the XML declaration, comments, processing instructions and DOCTYPE are dropped
//! - whitespace-only text nodes are dropped
//! - empty elements are expanded to start/end pairs
//! - attributes (namespace declarations included) are sorted by name
//! - text and attribute values are re-escaped with a fixed entity set
//!
//! This is a registry-internal canonical form, not W3C C14N; both sides of
//! every digest in this crate use it.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed XML: {0}")]
pub struct CanonicalError(pub String);

/// Canonicalize a complete document
pub fn canonicalize(xml: &str) -> Result<String, CanonicalError> {
    canonicalize_excluding(xml, None)
}

/// Canonicalize a complete document, omitting the enveloped element named
/// `excluded`: the first direct child of the root with that qualified name,
/// together with its subtree. Elements of that name anywhere else stay in.
pub fn canonicalize_excluding(xml: &str, excluded: Option<&str>) -> Result<String, CanonicalError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::with_capacity(xml.len());
    let mut depth: usize = 0;
    let mut roots: usize = 0;
    let mut skip_depth: Option<usize> = None;
    let mut envelope_removed = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CanonicalError(format!("at byte {}: {e}", reader.buffer_position())))?;

        match event {
            Event::Start(start) => {
                if depth == 0 {
                    roots += 1;
                    if roots > 1 {
                        return Err(CanonicalError("multiple root elements".to_string()));
                    }
                }
                depth += 1;
                if depth == 2
                    && !envelope_removed
                    && excluded.is_some_and(|name| qname(&start) == name)
                {
                    skip_depth = Some(depth);
                    envelope_removed = true;
                }
                if skip_depth.is_none() {
                    write_start(&mut out, &start)?;
                }
            }
            Event::Empty(start) => {
                if depth == 0 {
                    roots += 1;
                    if roots > 1 {
                        return Err(CanonicalError("multiple root elements".to_string()));
                    }
                }
                let is_envelope = depth == 1
                    && !envelope_removed
                    && excluded.is_some_and(|name| qname(&start) == name);
                if is_envelope {
                    envelope_removed = true;
                } else if skip_depth.is_none() {
                    write_start(&mut out, &start)?;
                    write_end(&mut out, &qname(&start));
                }
            }
            Event::End(end) => {
                if depth == 0 {
                    return Err(CanonicalError("unexpected closing tag".to_string()));
                }
                if skip_depth.is_none() {
                    let name = std::str::from_utf8(end.name().as_ref())
                        .map_err(|e| CanonicalError(e.to_string()))?
                        .to_string();
                    write_end(&mut out, &name);
                }
                if skip_depth == Some(depth) {
                    skip_depth = None;
                }
                depth -= 1;
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|e| CanonicalError(e.to_string()))?;
                if value.trim().is_empty() {
                    continue;
                }
                if depth == 0 {
                    return Err(CanonicalError("text outside the root element".to_string()));
                }
                if skip_depth.is_none() {
                    escape_text(&mut out, &value);
                }
            }
            Event::CData(data) => {
                if depth == 0 {
                    return Err(CanonicalError("CDATA outside the root element".to_string()));
                }
                if skip_depth.is_none() {
                    let value = std::str::from_utf8(&data).map_err(|e| CanonicalError(e.to_string()))?;
                    escape_text(&mut out, value);
                }
            }
            Event::Eof => break,
            // declaration, comments, processing instructions, DOCTYPE
            _ => {}
        }
    }

    if depth != 0 {
        return Err(CanonicalError("unclosed element at end of input".to_string()));
    }
    if roots == 0 {
        return Err(CanonicalError("no root element".to_string()));
    }
    Ok(out)
}

/// Canonical form of the first element named `name` and its subtree
pub fn canonicalize_element(xml: &str, name: &str) -> Result<Option<String>, CanonicalError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut capture_depth: Option<usize> = None;
    let mut depth: usize = 0;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CanonicalError(format!("at byte {}: {e}", reader.buffer_position())))?;

        match event {
            Event::Start(start) => {
                depth += 1;
                if capture_depth.is_none() && qname(&start) == name {
                    capture_depth = Some(depth);
                }
                if capture_depth.is_some() {
                    write_start(&mut out, &start)?;
                }
            }
            Event::Empty(start) => {
                let matches = qname(&start) == name;
                if capture_depth.is_some() || matches {
                    write_start(&mut out, &start)?;
                    write_end(&mut out, &qname(&start));
                }
                if capture_depth.is_none() && matches {
                    return Ok(Some(out));
                }
            }
            Event::End(end) => {
                if capture_depth.is_some() {
                    let end_name = std::str::from_utf8(end.name().as_ref())
                        .map_err(|e| CanonicalError(e.to_string()))?
                        .to_string();
                    write_end(&mut out, &end_name);
                }
                if capture_depth == Some(depth) {
                    return Ok(Some(out));
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(text) if capture_depth.is_some() => {
                let value = text
                    .unescape()
                    .map_err(|e| CanonicalError(e.to_string()))?;
                if !value.trim().is_empty() {
                    escape_text(&mut out, &value);
                }
            }
            Event::CData(data) if capture_depth.is_some() => {
                let value = std::str::from_utf8(&data).map_err(|e| CanonicalError(e.to_string()))?;
                escape_text(&mut out, value);
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn qname(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn write_start(out: &mut String, start: &BytesStart<'_>) -> Result<(), CanonicalError> {
    let mut attributes: Vec<(String, String)> = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| CanonicalError(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| CanonicalError(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| CanonicalError(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    attributes.sort_by(|a, b| a.0.cmp(&b.0));

    out.push('<');
    out.push_str(&qname(start));
    for (key, value) in &attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attribute(out, value);
        out.push('"');
    }
    out.push('>');
    Ok(())
}

fn write_end(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_text(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}
