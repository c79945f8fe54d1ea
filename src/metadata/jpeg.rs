use img_parts::Bytes;
use img_parts::jpeg::{Jpeg, JpegSegment};
use std::borrow::Cow;
use std::collections::BTreeSet;

use super::{Dimensions, Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped, XmpAction};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const APP0: u8 = 0xE0;
const APP1: u8 = 0xE1;
const APP2: u8 = 0xE2;
const APP13: u8 = 0xED;
const APP14: u8 = 0xEE;
const COM: u8 = 0xFE;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
const XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const XMP_EXT_HEADER: &[u8] = b"http://ns.adobe.com/xmp/extension/\0";
/// Namespace, 32-byte GUID, full length and chunk offset.
const XMP_EXT_PREFIX_LEN: usize = XMP_EXT_HEADER.len() + 32 + 4 + 4;
const ICC_HEADER: &[u8] = b"ICC_PROFILE\0";
const MPF_HEADER: &[u8] = b"MPF\0";

/// Role of a marker segment.
#[derive(Debug, Clone, PartialEq)]
enum Block {
    /// Needed to display the image (or harmless structure).
    Keep,
    Exif,
    /// XMP packet starting at the given offset into the segment.
    Xmp(usize),
    Icc,
    Other(String),
}

fn classify_segment(marker: u8, contents: &[u8]) -> Block {
    match marker {
        APP1 if contents.starts_with(EXIF_HEADER) => Block::Exif,
        APP1 if contents.starts_with(XMP_HEADER) => Block::Xmp(XMP_HEADER.len()),
        APP1 if contents.starts_with(XMP_EXT_HEADER) && contents.len() >= XMP_EXT_PREFIX_LEN => {
            Block::Xmp(XMP_EXT_PREFIX_LEN)
        }
        APP2 if contents.starts_with(ICC_HEADER) => Block::Icc,
        APP2 if contents.starts_with(MPF_HEADER) => Block::Keep,
        APP0 | APP14 => Block::Keep,
        APP13 if contents.starts_with(b"Photoshop 3.0\0") => Block::Other("IPTC / Photoshop".to_string()),
        COM => Block::Other("Comment".to_string()),
        0xE1..=0xEF => Block::Other(format!("APP{}{}", marker - 0xE0, identifier(contents))),
        _ => Block::Keep,
    }
}

/// Leading NUL-terminated ASCII identifier of an APPn segment, as ` (name)`.
fn identifier(contents: &[u8]) -> String {
    let id: String = contents
        .iter()
        .take(32)
        .take_while(|c| c.is_ascii_graphic() || **c == b' ')
        .map(|&c| c as char)
        .collect();
    if id.trim().is_empty() {
        String::new()
    } else {
        format!(" ({})", id.trim())
    }
}

fn parse(data: &[u8]) -> Result<Jpeg, StripError> {
    Jpeg::from_bytes(Bytes::copy_from_slice(data))
        .map_err(|e| StripError::decode(FormatKind::Jpeg, e.to_string()))
}

fn describe_other(marker: u8, contents: &[u8]) -> String {
    if marker == COM {
        let text = String::from_utf8_lossy(contents);
        let text = text.trim_end_matches('\0').trim();
        if !text.is_empty() {
            return text.chars().take(200).collect();
        }
    }
    format!("{} bytes", contents.len())
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'static>, StripError> {
    let jpeg = parse(data)?;
    let mut inspection = Inspection::default();
    let mut icc_chunks: Vec<(u8, u8, &[u8])> = Vec::new();

    for segment in jpeg.segments() {
        let marker = segment.marker();
        let contents = segment.contents();
        match classify_segment(marker, contents) {
            Block::Exif if inspection.exif.is_none() => {
                inspection.exif = Some(Cow::Owned(contents[EXIF_HEADER.len()..].to_vec()));
            }
            Block::Exif => log::debug!("ignoring additional EXIF segment"),
            Block::Xmp(start) => inspection.xmp.push(Cow::Owned(contents[start..].to_vec())),
            Block::Icc if contents.len() > ICC_HEADER.len() + 2 => {
                let at = ICC_HEADER.len();
                icc_chunks.push((contents[at], contents[at + 1], &contents[at + 2..]));
            }
            Block::Icc => inspection.warnings.push(MetadataWarning::new(
                MetadataCategory::Icc,
                "empty ICC_PROFILE segment",
            )),
            Block::Other(label) => inspection
                .other
                .push(MetadataEntry::new(label, describe_other(marker, contents))),
            Block::Keep => {
                if inspection.dimensions.is_none() {
                    inspection.dimensions = frame_dimensions(marker, contents);
                }
            }
        }
    }

    if !icc_chunks.is_empty() {
        inspection.icc = Some(Cow::Owned(assemble_icc(icc_chunks, &mut inspection.warnings)));
    }
    Ok(inspection)
}

/// Join ICC_PROFILE chunks in sequence order.
fn assemble_icc(mut chunks: Vec<(u8, u8, &[u8])>, warnings: &mut Vec<MetadataWarning>) -> Vec<u8> {
    chunks.sort_by_key(|(seq, _, _)| *seq);
    let expected = chunks[0].1 as usize;
    let in_order = chunks
        .iter()
        .enumerate()
        .all(|(i, (seq, total, _))| *seq as usize == i + 1 && *total as usize == expected);
    if !in_order || chunks.len() != expected {
        warnings.push(MetadataWarning::new(
            MetadataCategory::Icc,
            format!("ICC profile split into {} chunk(s), header says {expected}", chunks.len()),
        ));
    }
    chunks.into_iter().flat_map(|(_, _, c)| c.iter().copied()).collect()
}

/// Size from a start-of-frame segment.
fn frame_dimensions(marker: u8, contents: &[u8]) -> Option<Dimensions> {
    if !matches!(marker, 0xC0..=0xCF) || matches!(marker, 0xC4 | 0xC8 | 0xCC) {
        return None;
    }
    let height = u16::from_be_bytes([*contents.get(1)?, *contents.get(2)?]);
    let width = u16::from_be_bytes([*contents.get(3)?, *contents.get(4)?]);
    Some(Dimensions {
        width: width as u32,
        height: height as u32,
    })
}

/// Drop metadata segments; every other segment, scan data included, is
/// written back as it was.
pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let mut jpeg = parse(data)?;
    let mut pass = StripPass::new(targets);

    let segments = std::mem::take(jpeg.segments_mut());
    let mut kept = Vec::with_capacity(segments.len());
    for segment in segments {
        let marker = segment.marker();
        let contents = segment.contents();
        let remove = match classify_segment(marker, contents) {
            Block::Keep => false,
            Block::Exif => pass.remove_exif(&contents[EXIF_HEADER.len()..]),
            Block::Icc => pass.remove(MetadataCategory::Icc),
            Block::Other(_) => pass.remove(MetadataCategory::Other),
            Block::Xmp(start) => match pass.xmp(&contents[start..]) {
                XmpAction::Keep => false,
                XmpAction::Remove => true,
                XmpAction::Rewrite(packet) => {
                    let mut rewritten = contents[..start].to_vec();
                    rewritten.extend_from_slice(&packet);
                    kept.push(JpegSegment::new_with_contents(marker, Bytes::from(rewritten)));
                    continue;
                }
            },
        };
        if remove {
            log::debug!("dropping JPEG segment 0x{marker:02X} ({} bytes)", contents.len());
        } else {
            kept.push(segment);
        }
    }

    Ok(pass.finish(move || {
        *jpeg.segments_mut() = kept;
        jpeg.encoder().bytes().to_vec()
    }))
}
