//! XMP packets: property reading and in-place GPS removal.
//!
//! Packets are parsed with quick-xml's namespace-aware reader, so properties
//! are matched by namespace URI and local name whatever prefix a packet binds.
//!
//! Edits never change the packet length: removed markup is overwritten with
//! spaces, which XMP allows anywhere between elements and attributes. That
//! keeps offsets valid in containers that cannot grow or shrink a block
//! (TIFF tags, HEIF items, GIF's raw XMP extension).

use quick_xml::NsReader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use std::ops::Range;
use thiserror::Error;

pub(crate) const NS_RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub(crate) const NS_XMP: &str = "http://ns.adobe.com/xap/1.0/";
pub(crate) const NS_XMP_MM: &str = "http://ns.adobe.com/xap/1.0/mm/";
pub(crate) const NS_DC: &str = "http://purl.org/dc/elements/1.1/";
pub(crate) const NS_PHOTOSHOP: &str = "http://ns.adobe.com/photoshop/1.0/";
pub(crate) const NS_TIFF: &str = "http://ns.adobe.com/tiff/1.0/";
pub(crate) const NS_EXIF: &str = "http://ns.adobe.com/exif/1.0/";
pub(crate) const NS_AUX: &str = "http://ns.adobe.com/exif/1.0/aux/";

const KNOWN_NAMESPACES: &[&str] = &[NS_RDF, NS_XMP, NS_XMP_MM, NS_DC, NS_PHOTOSHOP, NS_TIFF, NS_EXIF, NS_AUX];

#[derive(Debug, Error)]
pub(crate) enum XmpError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("no rdf:RDF element")]
    NotRdf,
}

/// A simple property of an `rdf:Description`, from an attribute or a child
/// element. Array items (`rdf:li`) are joined with `", "`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Property {
    pub namespace: &'static str,
    pub name: String,
    pub value: String,
}

/// Value of the first property with this namespace and local name.
pub(crate) fn lookup<'p>(properties: &'p [Property], namespace: &str, name: &str) -> Option<&'p str> {
    properties
        .iter()
        .find(|p| p.namespace == namespace && p.name == name)
        .map(|p| p.value.as_str())
}

fn namespace(resolved: &ResolveResult<'_>) -> Option<&'static str> {
    match resolved {
        ResolveResult::Bound(Namespace(uri)) => KNOWN_NAMESPACES.iter().copied().find(|ns| ns.as_bytes() == *uri),
        _ => None,
    }
}

fn is_gps_name(local: &[u8]) -> bool {
    local.starts_with(b"GPS")
}

// ── reading ──────────────────────────────────────────────────────────

struct Element {
    namespace: Option<&'static str>,
    local: Vec<u8>,
}

impl Element {
    fn is_description(&self) -> bool {
        self.namespace == Some(NS_RDF) && self.local == b"Description"
    }
}

/// A property element whose text is still being collected.
struct OpenProperty {
    namespace: &'static str,
    name: String,
    pieces: Vec<String>,
    depth: usize,
}

fn close_property(open: &mut Option<OpenProperty>, depth: usize, found: &mut Vec<Property>) {
    if open.as_ref().is_some_and(|p| p.depth == depth) {
        if let Some(p) = open.take() {
            let value = p.pieces.join(", ");
            if !value.is_empty() {
                found.push(Property {
                    namespace: p.namespace,
                    name: p.name,
                    value,
                });
            }
        }
    }
}

fn description_attributes(
    reader: &NsReader<&[u8]>,
    e: &BytesStart<'_>,
    found: &mut Vec<Property>,
) -> Result<(), quick_xml::Error> {
    for attr in e.attributes() {
        let attr = attr?;
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let Some(namespace) = namespace(&resolved).filter(|&ns| ns != NS_RDF) else {
            continue;
        };
        let value = attr.unescape_value()?;
        let value = value.trim();
        if !value.is_empty() {
            found.push(Property {
                namespace,
                name: String::from_utf8_lossy(local.as_ref()).into_owned(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Every property in a packet from a namespace this crate knows.
pub(crate) fn properties(packet: &[u8]) -> Result<Vec<Property>, XmpError> {
    let mut reader = NsReader::from_reader(packet);
    let mut stack: Vec<Element> = Vec::new();
    let mut open: Option<OpenProperty> = None;
    let mut found = Vec::new();
    let mut rdf = false;

    loop {
        let (resolved, event) = reader.read_resolved_event()?;
        let ns = namespace(&resolved);
        let empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(e) | Event::Empty(e) => {
                let local = e.local_name().as_ref().to_vec();
                rdf |= ns == Some(NS_RDF) && local == b"RDF";
                if ns == Some(NS_RDF) && local == b"Description" {
                    description_attributes(&reader, &e, &mut found)?;
                } else if open.is_none() && stack.last().is_some_and(Element::is_description) {
                    if let Some(namespace) = ns {
                        open = Some(OpenProperty {
                            namespace,
                            name: String::from_utf8_lossy(&local).into_owned(),
                            pieces: Vec::new(),
                            depth: stack.len(),
                        });
                    }
                }
                if empty {
                    close_property(&mut open, stack.len(), &mut found);
                } else {
                    stack.push(Element { namespace: ns, local });
                }
            }
            Event::End(_) => {
                stack.pop();
                close_property(&mut open, stack.len(), &mut found);
            }
            Event::Text(t) => {
                if let Some(p) = open.as_mut() {
                    let text = t.unescape()?;
                    if !text.trim().is_empty() {
                        p.pieces.push(text.trim().to_string());
                    }
                }
            }
            Event::CData(c) => {
                if let Some(p) = open.as_mut() {
                    let text = String::from_utf8_lossy(&c.into_inner()).trim().to_string();
                    if !text.is_empty() {
                        p.pieces.push(text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !rdf {
        return Err(XmpError::NotRdf);
    }
    Ok(found)
}

// ── GPS removal ──────────────────────────────────────────────────────

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `name="value"`, from the name to past the closing quote.
fn attribute_span(tag: &[u8], at: usize, name_end: usize) -> Option<Range<usize>> {
    let mut i = name_end;
    while tag.get(i)?.is_ascii_whitespace() {
        i += 1;
    }
    if tag[i] != b'=' {
        return None;
    }
    i += 1;
    while tag.get(i)?.is_ascii_whitespace() {
        i += 1;
    }
    let quote = *tag.get(i)?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let close = find(tag, &[quote], i + 1)?;
    Some(at..close + 1)
}

/// The next attribute named `qname` in `packet[from..limit]`.
fn attribute_at(packet: &[u8], qname: &[u8], from: usize, limit: usize) -> Option<Range<usize>> {
    let tag = packet.get(..limit)?;
    let mut search = from;
    while let Some(at) = find(tag, qname, search) {
        search = at + 1;
        if at > 0 && tag[at - 1].is_ascii_whitespace() {
            if let Some(span) = attribute_span(tag, at, at + qname.len()) {
                return Some(span);
            }
        }
    }
    None
}

fn gps_attributes(
    reader: &NsReader<&[u8]>,
    e: &BytesStart<'_>,
    packet: &[u8],
    tag: Range<usize>,
    spans: &mut Vec<Range<usize>>,
) -> Result<(), quick_xml::Error> {
    // Attributes come back in source order, so each search resumes after the last.
    let mut cursor = tag.start;
    for attr in e.attributes() {
        let attr = attr?;
        let Some(span) = attribute_at(packet, attr.key.as_ref(), cursor, tag.end) else {
            continue;
        };
        cursor = span.end;
        let (resolved, local) = reader.resolve_attribute(attr.key);
        if namespace(&resolved) == Some(NS_EXIF) && is_gps_name(local.as_ref()) {
            spans.push(span);
        }
    }
    Ok(())
}

/// Byte ranges of every `GPS*` property of the EXIF namespace, as elements
/// (start tag through end tag) or attributes (name through closing quote).
fn gps_spans(packet: &[u8]) -> Result<Vec<Range<usize>>, quick_xml::Error> {
    let mut reader = NsReader::from_reader(packet);
    let mut spans = Vec::new();
    // Start offsets of open elements that are removed whole.
    let mut open: Vec<Option<usize>> = Vec::new();

    loop {
        let (resolved, event) = reader.read_resolved_event()?;
        let in_exif = namespace(&resolved) == Some(NS_EXIF);
        let end = reader.buffer_position() as usize;
        let empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(e) | Event::Empty(e) => {
                // '<' cannot occur inside a tag, so the last one before `end` opens it.
                let start = packet[..end].iter().rposition(|&b| b == b'<').unwrap_or(0);
                if in_exif && is_gps_name(e.local_name().as_ref()) {
                    if empty {
                        spans.push(start..end);
                    } else {
                        open.push(Some(start));
                    }
                    continue;
                }
                gps_attributes(&reader, &e, packet, start..end, &mut spans)?;
                if !empty {
                    open.push(None);
                }
            }
            Event::End(_) => {
                if let Some(Some(start)) = open.pop() {
                    spans.push(start..end);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(spans)
}

/// Whether the packet carries any EXIF-namespace GPS property.
pub(crate) fn has_gps(packet: &[u8]) -> bool {
    gps_spans(packet).is_ok_and(|spans| !spans.is_empty())
}

/// Blank every EXIF-namespace `GPS*` property, in attribute or element form.
///
/// Returns whether anything was removed.
pub(crate) fn scrub_gps(packet: &mut [u8]) -> Result<bool, XmpError> {
    let spans = gps_spans(packet)?;
    for span in &spans {
        packet[span.clone()].fill(b' ');
    }
    if !spans.is_empty() {
        log::debug!("blanked {} XMP GPS propert(ies)", spans.len());
    }
    Ok(!spans.is_empty())
}
