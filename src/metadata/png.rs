use flate2::read::ZlibDecoder;
use img_parts::Bytes;
use img_parts::png::{Png, PngChunk};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::io::Read;

use super::{Dimensions, Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped, XmpAction};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const XMP_KEYWORD: &[u8] = b"XML:com.adobe.xmp";
const RAW_PROFILE: &str = "Raw profile type ";
/// Cap on inflated chunk payloads.
const MAX_INFLATED: u64 = 16 * 1024 * 1024;

/// Role of an ancillary chunk.
enum Role {
    Keep,
    /// TIFF-structured EXIF, `None` when the payload could not be decoded.
    Exif(Option<Vec<u8>>),
    Icc(Option<Vec<u8>>),
    Xmp(XmpChunk),
    Other(MetadataEntry),
}

/// An XMP packet and how its chunk is written back.
struct XmpChunk {
    packet: Option<Vec<u8>>,
    raw_profile: Option<String>,
}

impl XmpChunk {
    fn rebuild(&self, packet: &[u8]) -> PngChunk {
        match &self.raw_profile {
            Some(keyword) => {
                let mut contents = keyword.as_bytes().to_vec();
                contents.push(0);
                contents.extend_from_slice(&encode_raw_profile("xmp", packet));
                PngChunk::new(*b"tEXt", Bytes::from(contents))
            }
            None => {
                let mut contents = XMP_KEYWORD.to_vec();
                // NUL, uncompressed, no language tag, no translated keyword
                contents.extend_from_slice(&[0, 0, 0, 0, 0]);
                contents.extend_from_slice(packet);
                PngChunk::new(*b"iTXt", Bytes::from(contents))
            }
        }
    }
}

fn parse(data: &[u8]) -> Result<Png, StripError> {
    Png::from_bytes(Bytes::copy_from_slice(data))
        .map_err(|e| StripError::decode(FormatKind::Png, e.to_string()))
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

/// Split `keyword\0rest`.
fn split_keyword(contents: &[u8]) -> Option<(&[u8], &[u8])> {
    let nul = contents.iter().position(|&c| c == 0)?;
    Some((&contents[..nul], &contents[nul + 1..]))
}

/// Keyword and text of a tEXt, zTXt or iTXt chunk.
fn text_chunk(kind: &[u8; 4], contents: &[u8]) -> Option<(String, Option<Vec<u8>>)> {
    let (keyword, rest) = split_keyword(contents)?;
    let keyword = String::from_utf8_lossy(keyword).into_owned();
    let text = match kind {
        b"tEXt" => Some(rest.to_vec()),
        // compression method byte, then the zlib stream
        b"zTXt" => rest.get(1..).and_then(inflate),
        b"iTXt" => {
            let (&compressed, rest) = rest.split_first()?;
            let rest = rest.get(1..)?;
            let (_language, rest) = split_keyword(rest)?;
            let (_translated, text) = split_keyword(rest)?;
            if compressed == 1 { inflate(text) } else { Some(text.to_vec()) }
        }
        _ => return None,
    };
    Some((keyword, text))
}

/// ImageMagick's `Raw profile type <name>` text: name, length, hex dump.
fn decode_raw_profile(text: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(text).ok()?;
    let mut lines = text.trim_start_matches('\n').splitn(3, '\n');
    let _name = lines.next()?;
    let len: usize = lines.next()?.trim().parse().ok()?;
    let digits: String = lines.next()?.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let mut payload = hex::decode(digits.get(..len.checked_mul(2)?)?).ok()?;
    payload.truncate(len);
    Some(payload)
}

fn encode_raw_profile(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut text = format!("\n{name}\n{:8}\n", payload.len());
    for line in hex::encode(payload).as_bytes().chunks(72) {
        text.push_str(&String::from_utf8_lossy(line));
        text.push('\n');
    }
    text.into_bytes()
}

fn strip_exif_header(payload: Vec<u8>) -> Vec<u8> {
    match payload.strip_prefix(b"Exif\0\0") {
        Some(rest) => rest.to_vec(),
        None => payload,
    }
}

fn classify_chunk(kind: &[u8; 4], contents: &[u8], warnings: &mut Vec<MetadataWarning>) -> Role {
    match kind {
        b"eXIf" => Role::Exif(Some(strip_exif_header(contents.to_vec()))),
        b"iCCP" => {
            let profile = split_keyword(contents).and_then(|(_, rest)| rest.get(1..)).and_then(inflate);
            if profile.is_none() {
                warnings.push(MetadataWarning::new(
                    MetadataCategory::Icc,
                    "iCCP chunk does not inflate",
                ));
            }
            Role::Icc(profile)
        }
        b"tIME" if contents.len() == 7 => Role::Other(MetadataEntry::new(
            "Last Modified",
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                u16::from_be_bytes([contents[0], contents[1]]),
                contents[2],
                contents[3],
                contents[4],
                contents[5],
                contents[6]
            ),
        )),
        b"tEXt" | b"zTXt" | b"iTXt" => {
            let Some((keyword, text)) = text_chunk(kind, contents) else {
                warnings.push(MetadataWarning::new(
                    MetadataCategory::Other,
                    format!("malformed {} chunk", String::from_utf8_lossy(kind)),
                ));
                return Role::Other(MetadataEntry::new("Text", format!("{} bytes", contents.len())));
            };
            classify_text(kind, keyword, text, warnings)
        }
        _ => Role::Keep,
    }
}

fn classify_text(
    kind: &[u8; 4],
    keyword: String,
    text: Option<Vec<u8>>,
    warnings: &mut Vec<MetadataWarning>,
) -> Role {
    if kind == b"iTXt" && keyword.as_bytes() == XMP_KEYWORD {
        if text.is_none() {
            warnings.push(MetadataWarning::new(MetadataCategory::Xmp, "compressed XMP does not inflate"));
        }
        return Role::Xmp(XmpChunk {
            packet: text,
            raw_profile: None,
        });
    }

    if let Some(profile) = keyword.strip_prefix(RAW_PROFILE) {
        let payload = text.as_deref().and_then(decode_raw_profile);
        let category = match profile.to_ascii_lowercase().as_str() {
            "exif" | "app1" => MetadataCategory::Exif,
            "xmp" => MetadataCategory::Xmp,
            "icc" | "icm" => MetadataCategory::Icc,
            _ => MetadataCategory::Other,
        };
        if payload.is_none() && category != MetadataCategory::Other {
            warnings.push(MetadataWarning::new(category, format!("unreadable \"{keyword}\" chunk")));
        }
        return match category {
            MetadataCategory::Exif => Role::Exif(payload.map(strip_exif_header)),
            MetadataCategory::Icc => Role::Icc(payload),
            MetadataCategory::Xmp => Role::Xmp(XmpChunk {
                packet: payload,
                raw_profile: Some(keyword),
            }),
            _ => Role::Other(MetadataEntry::new(
                keyword,
                format!("{} bytes", payload.map_or(0, |p| p.len())),
            )),
        };
    }

    let value = match text {
        Some(text) => String::from_utf8_lossy(&text).trim().chars().take(200).collect(),
        None => {
            warnings.push(MetadataWarning::new(
                MetadataCategory::Other,
                format!("compressed text \"{keyword}\" does not inflate"),
            ));
            String::new()
        }
    };
    Role::Other(MetadataEntry::new(keyword, value))
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'static>, StripError> {
    let png = parse(data)?;
    let mut inspection = Inspection::default();

    for chunk in png.chunks() {
        let contents = chunk.contents();
        if &chunk.kind() == b"IHDR" && contents.len() >= 8 {
            inspection.dimensions = Some(Dimensions {
                width: u32::from_be_bytes([contents[0], contents[1], contents[2], contents[3]]),
                height: u32::from_be_bytes([contents[4], contents[5], contents[6], contents[7]]),
            });
        }
        match classify_chunk(&chunk.kind(), contents, &mut inspection.warnings) {
            Role::Keep | Role::Exif(None) | Role::Icc(None) => {}
            Role::Exif(Some(blob)) => {
                if inspection.exif.is_none() {
                    inspection.exif = Some(Cow::Owned(blob));
                }
            }
            Role::Icc(Some(profile)) => inspection.icc = Some(Cow::Owned(profile)),
            Role::Xmp(xmp) => inspection.xmp.extend(xmp.packet.map(Cow::Owned)),
            Role::Other(entry) => inspection.other.push(entry),
        }
    }
    Ok(inspection)
}

pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let mut png = parse(data)?;
    let mut pass = StripPass::new(targets);

    let chunks = std::mem::take(png.chunks_mut());
    let mut kept = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let kind = chunk.kind();
        let remove = match classify_chunk(&kind, chunk.contents(), &mut pass.warnings) {
            Role::Keep => false,
            Role::Exif(Some(blob)) => pass.remove_exif(&blob),
            Role::Exif(None) => pass.remove(MetadataCategory::Exif),
            Role::Icc(_) => pass.remove(MetadataCategory::Icc),
            Role::Other(_) => pass.remove(MetadataCategory::Other),
            Role::Xmp(xmp) => match xmp.packet.as_deref().map(|p| pass.xmp(p)) {
                None => pass.remove(MetadataCategory::Xmp),
                Some(XmpAction::Keep) => false,
                Some(XmpAction::Remove) => true,
                Some(XmpAction::Rewrite(packet)) => {
                    kept.push(xmp.rebuild(&packet));
                    continue;
                }
            },
        };
        if remove {
            log::debug!("dropping PNG chunk {}", String::from_utf8_lossy(&kind));
        } else {
            kept.push(chunk);
        }
    }

    Ok(pass.finish(move || {
        *png.chunks_mut() = kept;
        png.encoder().bytes().to_vec()
    }))
}
