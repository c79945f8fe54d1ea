use img_parts::riff::{RiffChunk, RiffContent};
use img_parts::webp::{CHUNK_ANMF, CHUNK_EXIF, CHUNK_ICCP, CHUNK_VP8X, CHUNK_XMP, WebP};
use img_parts::{Bytes, ImageICC};
use std::borrow::Cow;
use std::collections::BTreeSet;

use super::{Inspection, MetadataCategory, StripPass, Stripped, XmpAction};
use crate::error::StripError;
use crate::format::FormatKind;

// VP8X feature flags
const FLAG_ICC: u8 = 0x20;
const FLAG_EXIF: u8 = 0x08;
const FLAG_XMP: u8 = 0x04;

fn parse(data: &[u8]) -> Result<WebP, StripError> {
    WebP::from_bytes(Bytes::copy_from_slice(data))
        .map_err(|e| StripError::decode(FormatKind::WebP, e.to_string()))
}

fn payload(chunk: &RiffChunk) -> &[u8] {
    chunk.content().data().map(|d| &d[..]).unwrap_or_default()
}

fn exif_payload(data: &[u8]) -> &[u8] {
    data.strip_prefix(b"Exif\0\0").unwrap_or(data)
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'static>, StripError> {
    let webp = parse(data)?;
    let mut inspection = Inspection::default();

    if let Some(exif) = webp.chunk_by_id(CHUNK_EXIF) {
        inspection.exif = Some(Cow::Owned(exif_payload(payload(exif)).to_vec()));
    }
    inspection.icc = webp.icc_profile().map(|p| Cow::Owned(p.to_vec()));
    inspection.xmp = webp
        .chunks_by_id(CHUNK_XMP)
        .map(|c| Cow::Owned(payload(c).to_vec()))
        .collect();

    let frames = webp.chunks_by_id(CHUNK_ANMF).count();
    if frames > 0 {
        inspection.frames = Some(frames as u32);
    }
    Ok(inspection)
}

/// Clear the VP8X flags of metadata chunks the file no longer carries.
fn sync_vp8x_flags(webp: &mut WebP) {
    let mut clear = 0u8;
    for (id, flag) in [(CHUNK_EXIF, FLAG_EXIF), (CHUNK_ICCP, FLAG_ICC), (CHUNK_XMP, FLAG_XMP)] {
        if !webp.has_chunk(id) {
            clear |= flag;
        }
    }
    for chunk in webp.chunks_mut().iter_mut().filter(|c| c.id() == CHUNK_VP8X) {
        if let RiffContent::Data(data) = chunk.content_mut() {
            if let Some(&flags) = data.first() {
                let mut vp8x = data.to_vec();
                vp8x[0] = flags & !clear;
                *data = Bytes::from(vp8x);
            }
        }
    }
}

/// Drop EXIF/ICCP/XMP chunks, then clear the matching VP8X flags. Image
/// chunks are carried over untouched.
pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let mut webp = parse(data)?;
    let mut pass = StripPass::new(targets);

    let chunks = std::mem::take(webp.chunks_mut());
    let mut kept = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let id = chunk.id();
        let remove = match id {
            CHUNK_EXIF => pass.remove_exif(exif_payload(payload(&chunk))),
            CHUNK_ICCP => pass.remove(MetadataCategory::Icc),
            CHUNK_XMP => match pass.xmp(payload(&chunk)) {
                XmpAction::Keep => false,
                XmpAction::Remove => true,
                XmpAction::Rewrite(packet) => {
                    kept.push(RiffChunk::new(CHUNK_XMP, RiffContent::Data(Bytes::from(packet))));
                    continue;
                }
            },
            _ => false,
        };
        if remove {
            log::debug!("dropping WebP chunk {}", String::from_utf8_lossy(&id));
        } else {
            kept.push(chunk);
        }
    }

    Ok(pass.finish(move || {
        *webp.chunks_mut() = kept;
        sync_vp8x_flags(&mut webp);
        webp.encoder().bytes().to_vec()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CleanOptions, clean, preview};
    use crate::testdata;

    fn ids(data: &[u8]) -> Vec<[u8; 4]> {
        parse(data).unwrap().chunks().iter().map(|c| c.id()).collect()
    }

    fn vp8x_flags(data: &[u8]) -> u8 {
        payload(parse(data).unwrap().chunk_by_id(CHUNK_VP8X).unwrap())[0]
    }

    // ── structure ────────────────────────────────────────────────────

    #[test]
    fn walks_fixture_chunks() {
        let data = testdata::tagged_webp();
        let ids = ids(&data);
        assert_eq!(ids[0], CHUNK_VP8X);
        assert!(ids.contains(&CHUNK_ICCP));
        assert!(ids.contains(&CHUNK_EXIF));
        assert!(ids.contains(&CHUNK_XMP));
        assert!(ids.contains(b"VP8L"));
    }

    #[test]
    fn truncated_chunk_is_decode_error() {
        let mut data = testdata::tagged_webp();
        data.truncate(data.len() - 5);
        assert!(matches!(inspect(&data), Err(StripError::Decode { .. })));
        assert!(matches!(
            strip(&data, &CleanOptions::default().targets()),
            Err(StripError::Decode { .. })
        ));
    }

    #[test]
    fn inspect_finds_exif_icc_and_xmp() {
        let data = testdata::tagged_webp();
        let inspection = inspect(&data).unwrap();
        assert!(inspection.exif.as_deref().unwrap().starts_with(b"II*\0"));
        assert_eq!(inspection.icc.as_deref(), Some(&testdata::icc_profile()[..]));
        assert_eq!(inspection.xmp.len(), 1);
        assert_eq!(inspection.frames, None);
    }

    // ── stripping ────────────────────────────────────────────────────

    #[test]
    fn default_clean_updates_flags_and_size() {
        let data = testdata::tagged_webp();
        assert_eq!(vp8x_flags(&data) & (FLAG_EXIF | FLAG_ICC | FLAG_XMP), FLAG_EXIF | FLAG_ICC | FLAG_XMP);

        let cleaned = clean(&data, FormatKind::WebP, CleanOptions::default()).unwrap();
        assert!(!ids(&cleaned.bytes).contains(&CHUNK_EXIF));
        assert_eq!(vp8x_flags(&cleaned.bytes) & FLAG_EXIF, 0);
        assert_eq!(vp8x_flags(&cleaned.bytes) & (FLAG_ICC | FLAG_XMP), FLAG_ICC | FLAG_XMP);
        let riff = u32::from_le_bytes(cleaned.bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(riff + 8, cleaned.bytes.len());
    }

    #[test]
    fn remove_all_clears_every_metadata_flag() {
        let data = testdata::tagged_webp();
        let cleaned = clean(&data, FormatKind::WebP, CleanOptions { remove_all: true }).unwrap();
        assert_eq!(vp8x_flags(&cleaned.bytes) & (FLAG_EXIF | FLAG_ICC | FLAG_XMP), 0);
        assert_eq!(ids(&cleaned.bytes), vec![CHUNK_VP8X, *b"VP8L"]);
        let summary = preview(&cleaned.bytes, FormatKind::WebP).unwrap();
        assert!(summary.present().is_empty());
    }

    #[test]
    fn odd_sized_xmp_rewrite_stays_aligned() {
        let mut webp = parse(&testdata::tagged_webp()).unwrap();
        let mut packet = testdata::xmp_packet().into_bytes();
        if packet.len() % 2 == 0 {
            packet.push(b' ');
        }
        for chunk in webp.chunks_mut().iter_mut().filter(|c| c.id() == CHUNK_XMP) {
            *chunk.content_mut() = RiffContent::Data(Bytes::from(packet.clone()));
        }
        let data = webp.encoder().bytes().to_vec();

        let cleaned = clean(&data, FormatKind::WebP, CleanOptions::default()).unwrap();
        assert_eq!(cleaned.bytes.len() % 2, 0);
        let after = parse(&cleaned.bytes).unwrap();
        assert_eq!(payload(after.chunk_by_id(CHUNK_XMP).unwrap()).len(), packet.len());
    }
}
