use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;

use super::{Dimensions, Inspection, MetadataCategory, MetadataEntry, StripPass, Stripped};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const FILE_HEADER: usize = 14;
const V5_HEADER: u32 = 124;
// Offsets inside the BITMAPV5HEADER.
const BIT_COUNT: usize = 14;
const SIZE_IMAGE: usize = 20;
const CS_TYPE: usize = 56;
const PROFILE_DATA: usize = 112;
const PROFILE_SIZE: usize = 116;

const LCS_SRGB: u32 = u32::from_be_bytes(*b"sRGB");
const PROFILE_EMBEDDED: u32 = u32::from_be_bytes(*b"MBED");
const PROFILE_LINKED: u32 = u32::from_be_bytes(*b"LINK");

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().ok()?))
}

fn decode_error(reason: impl Into<String>) -> StripError {
    StripError::decode(FormatKind::Bmp, reason)
}

/// A colour profile referenced from a V5 header.
#[derive(Debug, PartialEq)]
enum Profile {
    Embedded(Range<usize>),
    Linked(Range<usize>),
}

impl Profile {
    fn range(&self) -> &Range<usize> {
        match self {
            Self::Embedded(r) | Self::Linked(r) => r,
        }
    }

    fn category(&self) -> MetadataCategory {
        match self {
            Self::Embedded(_) => MetadataCategory::Icc,
            Self::Linked(_) => MetadataCategory::Other,
        }
    }
}

struct Header {
    dib_size: u32,
    dimensions: Option<Dimensions>,
    profile: Option<Profile>,
    /// Set when the profile range shares bytes with the headers or pixels.
    clash: Option<&'static str>,
}

/// Bytes of the pixel array, from `bfOffBits` to its computed end.
fn pixel_array(data: &[u8], dimensions: Option<Dimensions>) -> Option<Range<usize>> {
    let start = u32_at(data, 10)? as usize;
    let declared = u32_at(data, FILE_HEADER + SIZE_IMAGE)? as usize;
    let len = if declared != 0 {
        declared
    } else {
        let bits = u16::from_le_bytes(data.get(FILE_HEADER + BIT_COUNT..FILE_HEADER + BIT_COUNT + 2)?.try_into().ok()?);
        let dims = dimensions?;
        let stride = (usize::from(bits).checked_mul(dims.width as usize)?.checked_add(31)? / 32).checked_mul(4)?;
        stride.checked_mul(dims.height as usize)?
    };
    Some(start..start.checked_add(len)?)
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn parse(data: &[u8], warnings: &mut Vec<MetadataWarning>) -> Result<Header, StripError> {
    let dib_size = u32_at(data, FILE_HEADER).ok_or_else(|| decode_error("truncated file header"))?;
    if data.len() < FILE_HEADER + dib_size as usize {
        return Err(decode_error("truncated DIB header"));
    }
    let dib = FILE_HEADER;
    let dimensions = if dib_size == 12 {
        let w = u16::from_le_bytes([data[dib + 4], data[dib + 5]]);
        let h = u16::from_le_bytes([data[dib + 6], data[dib + 7]]);
        Some(Dimensions {
            width: w.into(),
            height: h.into(),
        })
    } else {
        let w = u32_at(data, dib + 4).map(|v| v as i32);
        let h = u32_at(data, dib + 8).map(|v| v as i32);
        w.zip(h).map(|(w, h)| Dimensions {
            width: w.unsigned_abs(),
            height: h.unsigned_abs(),
        })
    };

    let mut profile = None;
    if dib_size >= V5_HEADER {
        let cs_type = u32_at(data, dib + CS_TYPE).unwrap_or(0);
        if cs_type == PROFILE_EMBEDDED || cs_type == PROFILE_LINKED {
            let start = u32_at(data, dib + PROFILE_DATA).unwrap_or(0) as usize + dib;
            let len = u32_at(data, dib + PROFILE_SIZE).unwrap_or(0) as usize;
            match start.checked_add(len).filter(|&end| end <= data.len() && len > 0) {
                Some(end) if cs_type == PROFILE_EMBEDDED => profile = Some(Profile::Embedded(start..end)),
                Some(end) => profile = Some(Profile::Linked(start..end)),
                None => warnings.push(MetadataWarning::new(
                    MetadataCategory::Icc,
                    "colour profile lies outside the file",
                )),
            }
        }
    }
    let clash = profile.as_ref().and_then(|p| {
        let headers = 0..FILE_HEADER + dib_size as usize;
        if overlaps(p.range(), &headers) {
            Some("headers")
        } else if pixel_array(data, dimensions).is_some_and(|px| overlaps(p.range(), &px)) {
            Some("pixel data")
        } else {
            None
        }
    });
    if let (Some(p), Some(what)) = (&profile, clash) {
        warnings.push(MetadataWarning::new(
            p.category(),
            format!("colour profile overlaps the {what}; its bytes are left in place"),
        ));
    }
    Ok(Header {
        dib_size,
        dimensions,
        profile,
        clash,
    })
}

pub(super) fn inspect(data: &[u8]) -> Result<Inspection<'_>, StripError> {
    let mut inspection = Inspection::default();
    let header = parse(data, &mut inspection.warnings)?;
    inspection.dimensions = header.dimensions;
    if header.clash.is_some() {
        return Ok(inspection);
    }
    match header.profile {
        Some(Profile::Embedded(range)) => inspection.icc = Some(Cow::Borrowed(&data[range])),
        Some(Profile::Linked(range)) => {
            let path = String::from_utf8_lossy(&data[range]).trim_end_matches('\0').to_string();
            inspection.other.push(MetadataEntry::new("Linked Colour Profile", path));
        }
        None => {}
    }
    Ok(inspection)
}

/// Reset the colour space to sRGB and drop the profile bytes. A profile at
/// the end of the file is cut off; anywhere else it is zeroed, unless it
/// overlaps the headers or pixels, where only the header reference goes.
pub(super) fn strip(data: &[u8], targets: &BTreeSet<MetadataCategory>) -> Result<Stripped, StripError> {
    let mut pass = StripPass::new(targets);
    let header = parse(data, &mut pass.warnings)?;
    let range = match header.profile {
        Some(Profile::Embedded(range)) if pass.remove(MetadataCategory::Icc) => range,
        Some(Profile::Linked(range)) if pass.remove(MetadataCategory::Other) => range,
        _ => return Ok(pass.finish(Vec::new)),
    };
    debug_assert!(header.dib_size >= V5_HEADER);

    let mut out = data.to_vec();
    let dib = FILE_HEADER;
    out[dib + CS_TYPE..dib + CS_TYPE + 4].copy_from_slice(&LCS_SRGB.to_le_bytes());
    out[dib + PROFILE_DATA..dib + PROFILE_SIZE + 4].fill(0);
    if header.clash.is_some() {
        return Ok(pass.finish(move || out));
    }

    let pixels_start = u32_at(data, 10).unwrap_or(0) as usize;
    if range.end == out.len() && range.start >= pixels_start {
        out.truncate(range.start);
        let size = out.len() as u32;
        out[2..6].copy_from_slice(&size.to_le_bytes());
    } else {
        out[range].fill(0);
    }
    Ok(pass.finish(move || out))
}
