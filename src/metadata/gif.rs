use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;

use super::{Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped, XmpAction};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const EXTENSION: u8 = 0x21;
const IMAGE: u8 = 0x2C;
const TRAILER: u8 = 0x3B;
const COMMENT: u8 = 0xFE;
const APPLICATION: u8 = 0xFF;

const XMP_APP: &[u8] = b"XMP DataXMP";
const ICC_APP: &[u8] = b"ICCRGBG1012";
/// Application extensions that drive playback.
const STRUCTURAL_APPS: &[&[u8]] = &[b"NETSCAPE2.0", b"ANIMEXTS1.0"];
/// 0x01, 0xFF down to 0x00, then the block terminator.
const XMP_TRAILER_LEN: usize = 258;

#[derive(Debug, Clone, PartialEq)]
enum Role {
    Keep,
    Comment,
    Xmp,
    Icc,
    Application(String),
    /// Application extension whose identifier block is not 11 bytes.
    Malformed,
}

/// An extension block: `range` covers introducer to terminator, `body`
/// starts after the application identifier (or the label for other kinds).
#[derive(Debug)]
struct Block {
    role: Role,
    range: Range<usize>,
    body: usize,
}

fn decode_error(reason: impl Into<String>) -> StripError {
    StripError::decode(FormatKind::Gif, reason)
}

/// Skip a chain of data sub-blocks starting at `pos`; returns the offset just
/// past the zero-length terminator.
fn skip_sub_blocks(data: &[u8], mut pos: usize) -> Result<usize, StripError> {
    loop {
        let len = *data.get(pos).ok_or_else(|| decode_error("data sub-blocks run past the end"))? as usize;
        pos += 1;
        if len == 0 {
            return Ok(pos);
        }
        pos += len;
        if pos > data.len() {
            return Err(decode_error("data sub-block runs past the end"));
        }
    }
}

fn sub_block_payload(data: &[u8], mut pos: usize, end: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while pos < end {
        let len = data[pos] as usize;
        if len == 0 {
            break;
        }
        out.extend_from_slice(&data[pos + 1..(pos + 1 + len).min(end)]);
        pos += 1 + len;
    }
    out
}

fn color_table_len(packed: u8) -> usize {
    if packed & 0x80 != 0 { 3 << ((packed & 0x07) + 1) } else { 0 }
}

struct Stream {
    blocks: Vec<Block>,
    /// Offset just past the trailer.
    end: usize,
    frames: u32,
}

/// Walk the stream, collecting extension blocks and counting frames.
fn walk(data: &[u8]) -> Result<Stream, StripError> {
    if data.len() < 13 {
        return Err(decode_error("missing logical screen descriptor"));
    }
    let mut pos = 13 + color_table_len(data[10]);
    let mut blocks = Vec::new();
    let mut frames = 0;

    loop {
        let introducer = *data.get(pos).ok_or_else(|| decode_error("stream ends without a trailer"))?;
        match introducer {
            TRAILER => {
                return Ok(Stream {
                    blocks,
                    end: pos + 1,
                    frames,
                });
            }
            IMAGE => {
                frames += 1;
                let packed = *data.get(pos + 9).ok_or_else(|| decode_error("truncated image descriptor"))?;
                // descriptor, local colour table, LZW minimum code size
                let lzw = pos + 10 + color_table_len(packed) + 1;
                pos = skip_sub_blocks(data, lzw)?;
            }
            EXTENSION => {
                let label = *data.get(pos + 1).ok_or_else(|| decode_error("truncated extension"))?;
                let start = pos;
                let (role, body) = match label {
                    COMMENT => (Role::Comment, pos + 2),
                    APPLICATION if data.get(pos + 2) != Some(&11) => (Role::Malformed, pos + 2),
                    APPLICATION => {
                        let id = data
                            .get(pos + 3..pos + 14)
                            .ok_or_else(|| decode_error("truncated application extension"))?;
                        let role = if id == XMP_APP {
                            Role::Xmp
                        } else if id == ICC_APP {
                            Role::Icc
                        } else if STRUCTURAL_APPS.contains(&id) {
                            Role::Keep
                        } else {
                            Role::Application(String::from_utf8_lossy(&id[..8]).trim().to_string())
                        };
                        (role, pos + 14)
                    }
                    _ => (Role::Keep, pos + 2),
                };
                pos = skip_sub_blocks(data, body)?;
                if role != Role::Keep {
                    blocks.push(Block {
                        role,
                        range: start..pos,
                        body,
                    });
                }
            }
            other => return Err(decode_error(format!("unexpected block introducer 0x{other:02X}"))),
        }
    }
}

/// The raw XMP packet inside an XMP application extension.
fn xmp_packet<'a>(data: &'a [u8], block: &Block, warnings: &mut Vec<MetadataWarning>) -> Option<&'a [u8]> {
    let raw = &data[block.body..block.range.end];
    let has_trailer = raw.len() >= XMP_TRAILER_LEN && {
        let trailer = &raw[raw.len() - XMP_TRAILER_LEN..];
        trailer[0] == 0x01
            && trailer[1..257].iter().enumerate().all(|(i, &b)| b as usize == 0xFF - i)
            && trailer[257] == 0
    };
    if has_trailer {
        Some(&raw[..raw.len() - XMP_TRAILER_LEN])
    } else {
        warnings.push(MetadataWarning::new(
            MetadataCategory::Xmp,
            "XMP application extension has no magic trailer",
        ));
        None
    }
}

fn malformed_warning(block: &Block) -> MetadataWarning {
    MetadataWarning::new(
        MetadataCategory::Other,
        format!("malformed application extension at offset {} skipped", block.range.start),
    )
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'_>, StripError> {
    let stream = walk(data)?;
    let mut inspection = Inspection {
        frames: (stream.frames > 1).then_some(stream.frames),
        ..Inspection::default()
    };
    let mut icc = Vec::new();

    for block in &stream.blocks {
        match &block.role {
            Role::Keep => {}
            Role::Comment => {
                let text = sub_block_payload(data, block.body, block.range.end);
                inspection.other.push(MetadataEntry::new(
                    "Comment",
                    String::from_utf8_lossy(&text).trim().chars().take(200).collect::<String>(),
                ));
            }
            Role::Xmp => {
                if let Some(packet) = xmp_packet(data, block, &mut inspection.warnings) {
                    inspection.xmp.push(Cow::Borrowed(packet));
                }
            }
            Role::Icc => icc.extend(sub_block_payload(data, block.body, block.range.end)),
            Role::Application(id) => inspection.other.push(MetadataEntry::new(
                format!("Application {id}"),
                format!("{} bytes", block.range.len()),
            )),
            Role::Malformed => inspection.warnings.push(malformed_warning(block)),
        }
    }
    if !icc.is_empty() {
        inspection.icc = Some(Cow::Owned(icc));
    }
    Ok(inspection)
}

/// Copy the stream block by block, leaving out removed extensions. Image
/// data and everything after the trailer is copied unchanged.
pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let stream = walk(data)?;
    let mut pass = StripPass::new(targets);
    // Byte ranges to drop, or to overwrite with a same-length packet.
    let mut edits: Vec<(Range<usize>, Option<Vec<u8>>)> = Vec::new();

    for block in &stream.blocks {
        let remove = match &block.role {
            Role::Keep => false,
            Role::Malformed => {
                pass.warnings.push(malformed_warning(block));
                pass.remove(MetadataCategory::Other)
            }
            Role::Comment | Role::Application(_) => pass.remove(MetadataCategory::Other),
            Role::Icc => pass.remove(MetadataCategory::Icc),
            Role::Xmp => match xmp_packet(data, block, &mut pass.warnings) {
                None => pass.remove(MetadataCategory::Xmp),
                Some(packet) => match pass.xmp(packet) {
                    XmpAction::Keep => false,
                    XmpAction::Remove => true,
                    XmpAction::Rewrite(scrubbed) => {
                        edits.push((block.body..block.body + scrubbed.len(), Some(scrubbed)));
                        continue;
                    }
                },
            },
        };
        if remove {
            log::debug!("dropping GIF extension {:?}", block.role);
            edits.push((block.range.clone(), None));
        }
    }

    Ok(pass.finish(|| {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        for (range, replacement) in &edits {
            out.extend_from_slice(&data[pos..range.start]);
            if let Some(bytes) = replacement {
                out.extend_from_slice(bytes);
            }
            pos = range.end;
        }
        out.extend_from_slice(&data[pos..]);
        out
    }))
}
