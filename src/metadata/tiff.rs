//! TIFF files are their own EXIF container, so stripping edits the IFDs in
//! place: dropped entries are compacted out of each directory, their values
//! and the detached sub-directories are zeroed, and every other byte keeps its
//! offset. Pixel strips and tiles are never moved.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;

use super::ifd::{
    self, ByteOrder, Directory, Ifd, IfdEntry, IfdError, TAG_EXIF_IFD, TAG_GPS_IFD, TAG_ICC,
    TAG_IPTC, TAG_PHOTOSHOP, TAG_XMP,
};
use super::{Dimensions, Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped, XmpAction};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const ENTRY_SIZE: usize = 12;

fn walk(data: &[u8], warnings: &mut Vec<MetadataWarning>) -> Result<Option<Directory>, StripError> {
    match ifd::walk(data, warnings) {
        Ok(dir) => Ok(Some(dir)),
        Err(IfdError::BigTiff) => Ok(None),
        Err(e) => Err(StripError::decode(FormatKind::Tiff, e.to_string())),
    }
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'_>, StripError> {
    let mut inspection = Inspection::default();
    let Some(dir) = walk(data, &mut inspection.warnings)? else {
        inspection.warnings.push(MetadataWarning::new(
            MetadataCategory::Exif,
            "BigTIFF directories are not read",
        ));
        return Ok(inspection);
    };
    let ifd0 = dir.primary();

    inspection.exif = Some(Cow::Borrowed(data));
    inspection.exif_is_container = true;
    inspection.icc = ifd0.get(TAG_ICC).and_then(|e| e.bytes(data)).map(Cow::Borrowed);
    if let Some(packet) = ifd0.get(TAG_XMP).and_then(|e| e.bytes(data)) {
        inspection.xmp.push(Cow::Borrowed(packet));
    }
    for (tag, key) in [(TAG_IPTC, "IPTC"), (TAG_PHOTOSHOP, "Photoshop")] {
        if let Some(bytes) = ifd0.get(tag).and_then(|e| e.bytes(data)) {
            inspection
                .other
                .push(MetadataEntry::new(key, format!("{} bytes", bytes.len())));
        }
    }

    let dimension = |tag| {
        ifd0.get(tag)
            .and_then(|e| e.decode(dir.order, data))
            .and_then(|v| v.first_unsigned())
            .and_then(|v| u32::try_from(v).ok())
    };
    if let (Some(width), Some(height)) = (dimension(0x0100), dimension(0x0101)) {
        inspection.dimensions = Some(Dimensions { width, height });
    }
    Ok(inspection)
}

/// Byte ranges holding coded pixels, from the strip and tile offset tables.
fn image_data(dir: &Directory, data: &[u8]) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    for ifd in &dir.chain {
        for (offsets, counts) in [(0x0111, 0x0117), (0x0144, 0x0145)] {
            let values = |tag| {
                ifd.get(tag)
                    .and_then(|e| e.decode(dir.order, data))
                    .and_then(|v| match v {
                        ifd::Value::Unsigned(v) => Some(v),
                        _ => None,
                    })
                    .unwrap_or_default()
            };
            for (start, len) in values(offsets).into_iter().zip(values(counts)) {
                let start = start as usize;
                ranges.push(start..start.saturating_add(len as usize));
            }
        }
    }
    ranges
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Zeroes byte ranges that no surviving structure refers to.
struct Eraser {
    protected: Vec<Range<usize>>,
    ranges: Vec<Range<usize>>,
}

impl Eraser {
    fn erase(&mut self, range: Range<usize>) {
        self.ranges.push(range);
    }

    fn apply(self, out: &mut [u8]) {
        for range in self.ranges {
            if range.end > out.len() || self.protected.iter().any(|p| overlaps(p, &range)) {
                log::debug!("leaving {range:?} in place, still referenced");
                continue;
            }
            out[range].fill(0);
        }
    }
}

/// Rewrite `ifd` at its own offset with only the `kept` entries.
fn compact(out: &mut [u8], order: ByteOrder, ifd: &Ifd, kept: &[&IfdEntry]) {
    let span = ifd.span();
    let mut pos = ifd.offset;
    out[pos..pos + 2].copy_from_slice(&order.encode_u16(kept.len() as u16));
    pos += 2;
    for entry in kept {
        // Copy the original entry; its value offset is unchanged.
        let raw: [u8; ENTRY_SIZE] = {
            let mut raw = [0; ENTRY_SIZE];
            raw.copy_from_slice(&out[entry.position..entry.position + ENTRY_SIZE]);
            raw
        };
        out[pos..pos + ENTRY_SIZE].copy_from_slice(&raw);
        pos += ENTRY_SIZE;
    }
    out[pos..pos + 4].copy_from_slice(&order.encode_u32(ifd.next as u32));
    pos += 4;
    out[pos..span.end].fill(0);
}

pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let mut warnings = Vec::new();
    let Some(dir) = walk(data, &mut warnings)? else {
        return Ok(Stripped::NeedsReencode {
            reason: "BigTIFF directories cannot be edited in place".to_string(),
        });
    };
    let mut pass = StripPass::new(targets);
    pass.warnings = warnings;
    let order = dir.order;

    let mut out = data.to_vec();
    let mut compacted: Vec<(&Ifd, Vec<&IfdEntry>)> = Vec::new();
    let mut detached: Vec<&Ifd> = Vec::new();
    let mut eraser = Eraser {
        protected: image_data(&dir, data),
        ranges: Vec::new(),
    };

    for ifd in &dir.chain {
        let mut kept = Vec::with_capacity(ifd.entries.len());
        for entry in &ifd.entries {
            let remove = match entry.tag {
                TAG_EXIF_IFD => {
                    let drop = pass.remove(MetadataCategory::Exif);
                    if drop {
                        detached.extend(dir.exif.iter().chain(dir.interop.iter()));
                    }
                    drop
                }
                TAG_GPS_IFD => {
                    let has_gps = dir.gps.as_ref().is_some_and(|g| !g.entries.is_empty());
                    let drop = pass.remove(if has_gps { MetadataCategory::Gps } else { MetadataCategory::Exif });
                    if drop {
                        detached.extend(dir.gps.iter());
                    }
                    drop
                }
                TAG_ICC => pass.remove(MetadataCategory::Icc),
                TAG_IPTC | TAG_PHOTOSHOP => pass.remove(MetadataCategory::Other),
                TAG_XMP => match entry.bytes(data) {
                    None => pass.remove(MetadataCategory::Xmp),
                    Some(packet) => match pass.xmp(packet) {
                        XmpAction::Keep => false,
                        XmpAction::Remove => true,
                        XmpAction::Rewrite(scrubbed) => {
                            if let Some(range) = entry.value.clone() {
                                out[range].copy_from_slice(&scrubbed);
                            }
                            false
                        }
                    },
                },
                tag if ifd::is_descriptive_tag(tag) => pass.remove(MetadataCategory::Exif),
                _ => false,
            };
            if remove {
                if let Some(range) = entry.out_of_line() {
                    eraser.erase(range);
                }
            } else {
                kept.push(entry);
            }
        }
        if kept.len() != ifd.entries.len() {
            log::debug!(
                "IFD at {}: dropping {} of {} entries",
                ifd.offset,
                ifd.entries.len() - kept.len(),
                ifd.entries.len()
            );
            compacted.push((ifd, kept));
        } else {
            for entry in &ifd.entries {
                if let Some(range) = entry.out_of_line() {
                    eraser.protected.push(range);
                }
            }
        }
    }

    for (_, kept) in &compacted {
        eraser
            .protected
            .extend(kept.iter().filter_map(|e| e.out_of_line()));
    }
    for sub in &detached {
        eraser.erase(sub.span());
        for entry in &sub.entries {
            if let Some(range) = entry.out_of_line() {
                eraser.erase(range);
            }
        }
    }

    for (ifd, kept) in &compacted {
        compact(&mut out, order, ifd, kept);
    }
    for chain_ifd in &dir.chain {
        eraser.protected.push(chain_ifd.offset..chain_ifd.offset + 2 + chain_ifd.entries.len() * ENTRY_SIZE + 4);
    }
    eraser.apply(&mut out);

    Ok(pass.finish(move || out))
}
