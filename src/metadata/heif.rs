//! HEIF and AVIF (ISO base media file format).
//!
//! Metadata lives in items listed in the `meta` box: an `Exif` item, and
//! `mime` items holding XMP. The ICC profile is a `colr` property. Items are
//! never moved; stripping overwrites their extents with zeros (or a
//! same-length scrubbed XMP packet) and renames a removed `colr` box to
//! `free`, so coded image data and every offset in `iloc` stay valid.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;

use super::{Dimensions, Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped, XmpAction};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const XMP_MIME: &str = "application/rdf+xml";

/// One box: `start` is the header, `body` the payload.
#[derive(Debug, Clone)]
struct BoxRef {
    kind: [u8; 4],
    start: usize,
    body: Range<usize>,
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn be32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn be_n(data: &[u8], at: usize, size: usize) -> Option<u64> {
    match size {
        0 => Some(0),
        4 => be32(data, at).map(u64::from),
        8 => Some(u64::from_be_bytes(data.get(at..at + 8)?.try_into().ok()?)),
        _ => None,
    }
}

fn cstr(data: &[u8], at: usize, end: usize) -> (String, usize) {
    let bytes = data.get(at..end).unwrap_or_default();
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    (String::from_utf8_lossy(&bytes[..len]).into_owned(), (at + len + 1).min(end))
}

/// Child boxes inside `range`.
fn children(data: &[u8], range: Range<usize>) -> Option<Vec<BoxRef>> {
    let mut out = Vec::new();
    let mut pos = range.start;
    while pos + 8 <= range.end {
        let size32 = be32(data, pos)? as usize;
        let kind: [u8; 4] = data.get(pos + 4..pos + 8)?.try_into().ok()?;
        let (header, size) = match size32 {
            0 => (8, range.end - pos),
            1 => {
                let large = be_n(data, pos + 8, 8)?;
                (16, usize::try_from(large).ok()?)
            }
            n => (8, n),
        };
        let end = pos.checked_add(size).filter(|&e| e <= range.end && size >= header)?;
        out.push(BoxRef {
            kind,
            start: pos,
            body: pos + header..end,
        });
        pos = end;
    }
    Some(out)
}

fn find<'b>(boxes: &'b [BoxRef], kind: &[u8; 4]) -> Option<&'b BoxRef> {
    boxes.iter().find(|b| &b.kind == kind)
}

#[derive(Debug)]
struct Item {
    id: u32,
    kind: [u8; 4],
    content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Construction {
    File,
    Idat,
}

/// One `iloc` extent, relative to the item's base.
#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: usize,
    /// `None` for a zero length: the extent runs to the end of its base.
    length: Option<usize>,
}

#[derive(Debug)]
struct Location {
    id: u32,
    construction: Construction,
    extents: Vec<Extent>,
}

/// The parts of the `meta` box this module needs.
#[derive(Debug)]
struct Meta {
    items: Vec<Item>,
    locations: Vec<Location>,
    idat: Option<Range<usize>>,
    /// `colr` boxes with an ICC payload: box and profile bytes.
    icc: Vec<(BoxRef, Range<usize>)>,
    dimensions: Option<Dimensions>,
}

fn parse_iinf(data: &[u8], b: &BoxRef) -> Option<Vec<Item>> {
    let version = *data.get(b.body.start)?;
    let first = if version == 0 { b.body.start + 6 } else { b.body.start + 8 };
    let mut items = Vec::new();
    for infe in children(data, first..b.body.end)?.iter().filter(|c| &c.kind == b"infe") {
        let at = infe.body.start;
        let version = *data.get(at)?;
        if version < 2 {
            continue;
        }
        let (id, mut pos) = if version == 2 {
            (u32::from(be16(data, at + 4)?), at + 6)
        } else {
            (be32(data, at + 4)?, at + 8)
        };
        pos += 2; // protection index
        let kind: [u8; 4] = data.get(pos..pos + 4)?.try_into().ok()?;
        pos += 4;
        let (_name, pos) = cstr(data, pos, infe.body.end);
        let content_type = if &kind == b"mime" {
            cstr(data, pos, infe.body.end).0
        } else {
            String::new()
        };
        items.push(Item { id, kind, content_type });
    }
    Some(items)
}

fn parse_iloc(data: &[u8], b: &BoxRef) -> Option<Vec<Location>> {
    let at = b.body.start;
    let version = *data.get(at)?;
    let sizes = *data.get(at + 4)?;
    let (offset_size, length_size) = ((sizes >> 4) as usize, (sizes & 0x0F) as usize);
    let sizes = *data.get(at + 5)?;
    let base_offset_size = (sizes >> 4) as usize;
    let index_size = if version >= 1 { (sizes & 0x0F) as usize } else { 0 };
    let (count, mut pos) = if version < 2 {
        (be16(data, at + 6)? as usize, at + 8)
    } else {
        (be32(data, at + 6)? as usize, at + 10)
    };

    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = if version < 2 {
            let id = u32::from(be16(data, pos)?);
            pos += 2;
            id
        } else {
            let id = be32(data, pos)?;
            pos += 4;
            id
        };
        let construction = if version >= 1 {
            let method = be16(data, pos)? & 0x0F;
            pos += 2;
            method
        } else {
            0
        };
        pos += 2; // data reference index
        let base = be_n(data, pos, base_offset_size)?;
        pos += base_offset_size;
        let extent_count = be16(data, pos)?;
        pos += 2;

        let mut extents = Vec::new();
        for _ in 0..extent_count {
            pos += index_size;
            let offset = be_n(data, pos, offset_size)?;
            pos += offset_size;
            let length = be_n(data, pos, length_size)?;
            pos += length_size;
            extents.push(Extent {
                offset: usize::try_from(base.checked_add(offset)?).ok()?,
                length: (length != 0).then(|| usize::try_from(length)).transpose().ok()?,
            });
        }
        let construction = match construction {
            0 => Construction::File,
            1 => Construction::Idat,
            _ => continue,
        };
        out.push(Location {
            id,
            construction,
            extents,
        });
    }
    Some(out)
}

/// `ispe` of the primary item, or the first one found.
fn parse_dimensions(data: &[u8], ipco: &[BoxRef], ipma: Option<&BoxRef>, primary: Option<u32>) -> Option<Dimensions> {
    let ispe = |b: &BoxRef| {
        Some(Dimensions {
            width: be32(data, b.body.start + 4)?,
            height: be32(data, b.body.start + 8)?,
        })
    };
    let associated = (|| {
        let ipma = ipma?;
        let primary = primary?;
        let at = ipma.body.start;
        let version = *data.get(at)?;
        let wide_index = data.get(at + 3)? & 1 != 0;
        let count = be32(data, at + 4)?;
        let mut pos = at + 8;
        for _ in 0..count {
            let id = if version < 1 {
                pos += 2;
                u32::from(be16(data, pos - 2)?)
            } else {
                pos += 4;
                be32(data, pos - 4)?
            };
            let n = *data.get(pos)? as usize;
            pos += 1;
            for _ in 0..n {
                let index = if wide_index {
                    pos += 2;
                    (be16(data, pos - 2)? & 0x7FFF) as usize
                } else {
                    pos += 1;
                    (data.get(pos - 1)? & 0x7F) as usize
                };
                if id == primary {
                    if let Some(prop) = index.checked_sub(1).and_then(|i| ipco.get(i)) {
                        if &prop.kind == b"ispe" {
                            return ispe(prop);
                        }
                    }
                }
            }
        }
        None
    })();
    associated.or_else(|| find(ipco, b"ispe").and_then(ispe))
}

fn parse(data: &[u8], format: FormatKind) -> Result<Meta, StripError> {
    let err = |reason: &str| StripError::decode(format, reason);
    let top = children(data, 0..data.len()).ok_or_else(|| err("box runs past the end of the file"))?;
    if top.first().map(|b| &b.kind) != Some(b"ftyp") {
        return Err(err("missing ftyp box"));
    }
    let meta = find(&top, b"meta").ok_or_else(|| err("missing meta box"))?;
    // meta is a full box
    let inner = children(data, meta.body.start + 4..meta.body.end).ok_or_else(|| err("malformed meta box"))?;

    let items = match find(&inner, b"iinf") {
        Some(b) => parse_iinf(data, b).ok_or_else(|| err("malformed iinf box"))?,
        None => Vec::new(),
    };
    let locations = match find(&inner, b"iloc") {
        Some(b) => parse_iloc(data, b).ok_or_else(|| err("malformed iloc box"))?,
        None => Vec::new(),
    };
    let primary = find(&inner, b"pitm").and_then(|b| {
        if data.get(b.body.start) == Some(&0) {
            be16(data, b.body.start + 4).map(u32::from)
        } else {
            be32(data, b.body.start + 4)
        }
    });

    let mut icc = Vec::new();
    let mut dimensions = None;
    if let Some(iprp) = find(&inner, b"iprp") {
        let props = children(data, iprp.body.clone()).ok_or_else(|| err("malformed iprp box"))?;
        if let Some(ipco) = find(&props, b"ipco") {
            let ipco = children(data, ipco.body.clone()).ok_or_else(|| err("malformed ipco box"))?;
            for colr in ipco.iter().filter(|b| &b.kind == b"colr") {
                let kind = data.get(colr.body.start..colr.body.start + 4);
                if matches!(kind, Some(b"prof") | Some(b"rICC")) {
                    icc.push((colr.clone(), colr.body.start + 4..colr.body.end));
                }
            }
            dimensions = parse_dimensions(data, &ipco, find(&props, b"ipma"), primary);
        }
    }

    Ok(Meta {
        items,
        locations,
        idat: find(&inner, b"idat").map(|b| b.body.clone()),
        icc,
        dimensions,
    })
}

/// Where a metadata item sits in the file.
enum Payload {
    Found(Vec<Range<usize>>),
    /// Extents that cannot be edited in place.
    Unusable(String),
    /// Zero-filled by an earlier strip.
    Blank,
}

impl Meta {
    fn extents(&self, id: u32, data: &[u8]) -> Payload {
        let Some(loc) = self.locations.iter().find(|l| l.id == id) else {
            return Payload::Unusable(format!("item {id} has no location"));
        };
        let base = match (loc.construction, &self.idat) {
            (Construction::File, _) => 0..data.len(),
            (Construction::Idat, Some(idat)) => idat.clone(),
            (Construction::Idat, None) => return Payload::Unusable(format!("item {id} refers to a missing idat box")),
        };
        let mut ranges = Vec::with_capacity(loc.extents.len());
        for e in &loc.extents {
            let start = base.start.saturating_add(e.offset);
            let end = match e.length {
                Some(len) => start.saturating_add(len),
                None => base.end,
            };
            if start > end || end > base.end {
                return Payload::Unusable(format!("item {id} extent lies outside the file"));
            }
            ranges.push(start..end);
        }
        if ranges.iter().all(|r| data[r.clone()].iter().all(|&b| b == 0)) {
            return Payload::Blank;
        }
        Payload::Found(ranges)
    }

    /// Extents of every item that is not metadata.
    fn image_extents(&self, data: &[u8]) -> Vec<Range<usize>> {
        self.items
            .iter()
            .filter(|i| metadata_kind(i).is_none())
            .filter_map(|i| match self.extents(i.id, data) {
                Payload::Found(r) => Some(r),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ItemKind {
    Exif,
    Xmp,
    OtherMime,
}

impl ItemKind {
    fn category(self) -> MetadataCategory {
        match self {
            Self::Exif => MetadataCategory::Exif,
            Self::Xmp => MetadataCategory::Xmp,
            Self::OtherMime => MetadataCategory::Other,
        }
    }
}

fn metadata_kind(item: &Item) -> Option<ItemKind> {
    match &item.kind {
        b"Exif" => Some(ItemKind::Exif),
        b"mime" if item.content_type == XMP_MIME => Some(ItemKind::Xmp),
        b"mime" => Some(ItemKind::OtherMime),
        _ => None,
    }
}

fn gather(data: &[u8], ranges: &[Range<usize>]) -> Vec<u8> {
    ranges.iter().flat_map(|r| data[r.clone()].iter().copied()).collect()
}

/// The TIFF structure inside an Exif item, after its header offset.
fn exif_blob(payload: &[u8]) -> Option<&[u8]> {
    let offset = be32(payload, 0)? as usize;
    payload.get(4usize.checked_add(offset)?..)
}

pub(super) fn inspect(data: &[u8], format: FormatKind) -> Result<Inspection<'_>, StripError> {
    let meta = parse(data, format)?;
    let mut inspection = Inspection {
        dimensions: meta.dimensions,
        ..Inspection::default()
    };

    for item in &meta.items {
        let Some(kind) = metadata_kind(item) else { continue };
        let ranges = match meta.extents(item.id, data) {
            Payload::Found(ranges) => ranges,
            Payload::Blank => continue,
            Payload::Unusable(reason) => {
                inspection.warnings.push(MetadataWarning::new(kind.category(), reason));
                continue;
            }
        };
        let payload = gather(data, &ranges);
        match kind {
            ItemKind::Exif => match exif_blob(&payload) {
                Some(blob) if inspection.exif.is_none() => inspection.exif = Some(Cow::Owned(blob.to_vec())),
                Some(_) => {}
                None => inspection.warnings.push(MetadataWarning::new(
                    MetadataCategory::Exif,
                    "Exif item header offset is out of range",
                )),
            },
            ItemKind::Xmp => inspection.xmp.push(Cow::Owned(payload)),
            ItemKind::OtherMime => inspection.other.push(MetadataEntry::new(
                format!("MIME Item {}", item.id),
                format!("{}, {} bytes", item.content_type, payload.len()),
            )),
        }
    }
    if let Some((_, profile)) = meta.icc.first() {
        inspection.icc = Some(Cow::Owned(data[profile.clone()].to_vec()));
    }
    Ok(inspection)
}

pub(super) fn strip(data: &[u8], format: FormatKind, targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let meta = parse(data, format)?;
    let mut pass = StripPass::new(targets);
    let image = meta.image_extents(data);
    let mut out = data.to_vec();

    for item in &meta.items {
        let Some(kind) = metadata_kind(item) else { continue };
        let ranges = match meta.extents(item.id, data) {
            Payload::Found(ranges) => ranges,
            Payload::Blank => continue,
            Payload::Unusable(reason) => {
                pass.warnings.push(MetadataWarning::new(kind.category(), format!("{reason}, item left as is")));
                continue;
            }
        };
        if ranges.iter().any(|r| image.iter().any(|i| r.start < i.end && i.start < r.end)) {
            return Ok(Stripped::NeedsReencode {
                reason: format!("item {} shares bytes with image data", item.id),
            });
        }
        let payload = gather(data, &ranges);
        let replacement = match kind {
            ItemKind::Exif => {
                let blob = exif_blob(&payload).unwrap_or_default();
                pass.remove_exif(blob).then(|| vec![0; payload.len()])
            }
            ItemKind::Xmp => match pass.xmp(&payload) {
                XmpAction::Keep => None,
                XmpAction::Remove => Some(vec![0; payload.len()]),
                XmpAction::Rewrite(scrubbed) => Some(scrubbed),
            },
            ItemKind::OtherMime => pass.remove(MetadataCategory::Other).then(|| vec![0; payload.len()]),
        };
        if let Some(bytes) = replacement {
            log::debug!("overwriting item {} ({:?})", item.id, kind);
            let mut src = bytes.as_slice();
            for r in &ranges {
                let (head, rest) = src.split_at(r.len());
                out[r.clone()].copy_from_slice(head);
                src = rest;
            }
        }
    }

    if !meta.icc.is_empty() && pass.remove(MetadataCategory::Icc) {
        for (colr, profile) in &meta.icc {
            out[colr.start + 4..colr.start + 8].copy_from_slice(b"free");
            out[profile.clone()].fill(0);
        }
    }

    Ok(pass.finish(move || out))
}
