//! Raw TIFF IFD walking, for rewriting a TIFF file's own directories in place.
//!
//! Reading EXIF for display goes through nom-exif; this walker exists because
//! stripping needs entry offsets and value spans. Everything is
//! bounds-checked; a malformed directory is an [`IfdError`], never a panic.

use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;

use super::MetadataCategory;
use crate::error::MetadataWarning;

pub(crate) const TAG_EXIF_IFD: u16 = 0x8769;
pub(crate) const TAG_GPS_IFD: u16 = 0x8825;
pub(crate) const TAG_INTEROP_IFD: u16 = 0xA005;
pub(crate) const TAG_XMP: u16 = 0x02BC;
pub(crate) const TAG_IPTC: u16 = 0x83BB;
pub(crate) const TAG_PHOTOSHOP: u16 = 0x8649;
pub(crate) const TAG_ICC: u16 = 0x8773;

const ENTRY_SIZE: usize = 12;
const MAX_CHAIN: usize = 64;

#[derive(Debug, Error)]
pub(crate) enum IfdError {
    #[error("not a TIFF header")]
    BadHeader,
    #[error("BigTIFF layout is not supported")]
    BigTiff,
    #[error("IFD at offset {0} lies outside the data")]
    OutOfBounds(usize),
    #[error("IFD at offset {0} is referenced more than once")]
    Loop(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub(crate) fn u16(self, data: &[u8], offset: usize) -> Option<u16> {
        let b: [u8; 2] = data.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        })
    }

    pub(crate) fn u32(self, data: &[u8], offset: usize) -> Option<u32> {
        let b: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        })
    }

    pub(crate) fn encode_u16(self, val: u16) -> [u8; 2] {
        match self {
            Self::Little => val.to_le_bytes(),
            Self::Big => val.to_be_bytes(),
        }
    }

    pub(crate) fn encode_u32(self, val: u32) -> [u8; 4] {
        match self {
            Self::Little => val.to_le_bytes(),
            Self::Big => val.to_be_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub order: ByteOrder,
    pub first_ifd: usize,
}

/// Parse the 8-byte classic TIFF header.
pub(crate) fn parse_header(data: &[u8]) -> Result<Header, IfdError> {
    let order = match data.get(0..2) {
        Some(b"II") => ByteOrder::Little,
        Some(b"MM") => ByteOrder::Big,
        _ => return Err(IfdError::BadHeader),
    };
    match order.u16(data, 2) {
        Some(42) => {}
        Some(43) => return Err(IfdError::BigTiff),
        _ => return Err(IfdError::BadHeader),
    }
    let first_ifd = order.u32(data, 4).ok_or(IfdError::BadHeader)? as usize;
    Ok(Header { order, first_ifd })
}

/// Byte size of one value of a TIFF field type.
fn type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 => Some(8),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u32,
    /// Offset of the 12-byte entry itself.
    pub position: usize,
    /// Where the value bytes live, `None` when the type is unknown or the
    /// value points outside the data.
    pub value: Option<Range<usize>>,
}

impl IfdEntry {
    fn inline_range(&self) -> Range<usize> {
        self.position + 8..self.position + 12
    }

    /// Value bytes stored outside the entry, if any.
    pub(crate) fn out_of_line(&self) -> Option<Range<usize>> {
        self.value
            .clone()
            .filter(|r| r.start != self.inline_range().start)
    }

    pub(crate) fn bytes<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(self.value.clone()?)
    }

    /// First value as an offset (LONG/IFD entries pointing at sub-directories).
    pub(crate) fn pointer(&self, order: ByteOrder, data: &[u8]) -> Option<usize> {
        match self.field_type {
            4 | 13 => order.u32(data, self.value.as_ref()?.start).map(|v| v as usize),
            _ => None,
        }
    }

    pub(crate) fn decode(&self, order: ByteOrder, data: &[u8]) -> Option<Value> {
        let bytes = self.bytes(data)?;
        let n = self.count as usize;
        let value = match self.field_type {
            2 => Value::Ascii(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string(),
            ),
            1 | 7 => Value::Bytes(bytes.to_vec()),
            6 => Value::Signed(bytes.iter().map(|&b| b as i8 as i64).collect()),
            3 => Value::Unsigned(
                (0..n)
                    .filter_map(|i| order.u16(bytes, i * 2))
                    .map(u64::from)
                    .collect(),
            ),
            8 => Value::Signed(
                (0..n)
                    .filter_map(|i| order.u16(bytes, i * 2))
                    .map(|v| v as i16 as i64)
                    .collect(),
            ),
            4 | 13 => Value::Unsigned(
                (0..n)
                    .filter_map(|i| order.u32(bytes, i * 4))
                    .map(u64::from)
                    .collect(),
            ),
            9 => Value::Signed(
                (0..n)
                    .filter_map(|i| order.u32(bytes, i * 4))
                    .map(|v| v as i32 as i64)
                    .collect(),
            ),
            5 => Value::Rational(
                (0..n)
                    .filter_map(|i| Some((order.u32(bytes, i * 8)?, order.u32(bytes, i * 8 + 4)?)))
                    .collect(),
            ),
            10 => Value::SRational(
                (0..n)
                    .filter_map(|i| {
                        Some((
                            order.u32(bytes, i * 8)? as i32,
                            order.u32(bytes, i * 8 + 4)? as i32,
                        ))
                    })
                    .collect(),
            ),
            11 => Value::Float(
                (0..n)
                    .filter_map(|i| order.u32(bytes, i * 4))
                    .map(|v| f32::from_bits(v) as f64)
                    .collect(),
            ),
            12 => Value::Float(
                (0..n)
                    .filter_map(|i| {
                        let hi = order.u32(bytes, i * 8)? as u64;
                        let lo = order.u32(bytes, i * 8 + 4)? as u64;
                        Some(match order {
                            ByteOrder::Big => (hi << 32) | lo,
                            ByteOrder::Little => (lo << 32) | hi,
                        })
                    })
                    .map(f64::from_bits)
                    .collect(),
            ),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Ifd {
    pub offset: usize,
    pub entries: Vec<IfdEntry>,
    /// Offset of the next IFD in the chain, 0 when last.
    pub next: usize,
}

impl Ifd {
    pub(crate) fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == tag)
    }

    /// Byte span of the directory itself (count, entries, next pointer).
    pub(crate) fn span(&self) -> Range<usize> {
        self.offset..self.offset + 2 + self.entries.len() * ENTRY_SIZE + 4
    }
}

/// Read one IFD at `offset`.
pub(crate) fn read_ifd(data: &[u8], order: ByteOrder, offset: usize) -> Result<Ifd, IfdError> {
    let count = order.u16(data, offset).ok_or(IfdError::OutOfBounds(offset))? as usize;
    let start = offset + 2;
    let end = start + count * ENTRY_SIZE;
    let next = order.u32(data, end).ok_or(IfdError::OutOfBounds(offset))? as usize;

    let entries = (0..count)
        .map(|i| {
            let position = start + i * ENTRY_SIZE;
            // Bounds were checked through the next pointer above.
            let tag = order.u16(data, position).unwrap_or(0);
            let field_type = order.u16(data, position + 2).unwrap_or(0);
            let count = order.u32(data, position + 4).unwrap_or(0);
            let value = type_size(field_type)
                .and_then(|size| size.checked_mul(count as usize))
                .and_then(|len| {
                    if len <= 4 {
                        Some(position + 8..position + 8 + len)
                    } else {
                        let ptr = order.u32(data, position + 8)? as usize;
                        let end = ptr.checked_add(len)?;
                        (end <= data.len()).then_some(ptr..end)
                    }
                });
            IfdEntry {
                tag,
                field_type,
                count,
                position,
                value,
            }
        })
        .collect();

    Ok(Ifd {
        offset,
        entries,
        next,
    })
}

/// Every directory reachable from a TIFF header.
#[derive(Debug, Clone)]
pub(crate) struct Directory {
    pub order: ByteOrder,
    /// IFD0 followed by the rest of the main chain (thumbnail, pages).
    pub chain: Vec<Ifd>,
    pub exif: Option<Ifd>,
    pub gps: Option<Ifd>,
    pub interop: Option<Ifd>,
}

impl Directory {
    pub(crate) fn primary(&self) -> &Ifd {
        &self.chain[0]
    }
}

/// Walk the main IFD chain and the Exif, GPS and Interop sub-directories.
///
/// A bad IFD0 is an error. Problems further down (a broken sub-directory,
/// a chain loop) are reported as warnings and the walk keeps what it has.
pub(crate) fn walk(data: &[u8], warnings: &mut Vec<MetadataWarning>) -> Result<Directory, IfdError> {
    let header = parse_header(data)?;
    let order = header.order;
    let first = read_ifd(data, order, header.first_ifd)?;

    let mut visited = HashSet::from([first.offset]);
    let mut next = first.next;
    let mut chain = vec![first];
    while next != 0 && chain.len() < MAX_CHAIN {
        if !visited.insert(next) {
            warnings.push(MetadataWarning::new(
                MetadataCategory::Exif,
                IfdError::Loop(next).to_string(),
            ));
            break;
        }
        match read_ifd(data, order, next) {
            Ok(ifd) => {
                next = ifd.next;
                chain.push(ifd);
            }
            Err(e) => {
                warnings.push(MetadataWarning::new(MetadataCategory::Exif, e.to_string()));
                break;
            }
        }
    }

    let mut sub = |parent: &Ifd, tag: u16, category: MetadataCategory| {
        let offset = parent.get(tag)?.pointer(order, data)?;
        if !visited.insert(offset) {
            warnings.push(MetadataWarning::new(category, IfdError::Loop(offset).to_string()));
            return None;
        }
        match read_ifd(data, order, offset) {
            Ok(ifd) => Some(ifd),
            Err(e) => {
                warnings.push(MetadataWarning::new(category, e.to_string()));
                None
            }
        }
    };

    let exif = sub(&chain[0], TAG_EXIF_IFD, MetadataCategory::Exif);
    let gps = sub(&chain[0], TAG_GPS_IFD, MetadataCategory::Gps);
    let interop = exif
        .as_ref()
        .and_then(|e| sub(e, TAG_INTEROP_IFD, MetadataCategory::Exif));

    Ok(Directory {
        order,
        chain,
        exif,
        gps,
        interop,
    })
}

/// A decoded TIFF field value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Ascii(String),
    Bytes(Vec<u8>),
    Unsigned(Vec<u64>),
    Signed(Vec<i64>),
    Rational(Vec<(u32, u32)>),
    SRational(Vec<(i32, i32)>),
    Float(Vec<f64>),
}

impl Value {
    pub(crate) fn first_unsigned(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => v.first().copied(),
            Self::Bytes(v) => v.first().map(|&b| b as u64),
            _ => None,
        }
    }
}

/// Pointer and pixel-layout tags that say nothing about the photo.
pub(crate) fn is_layout_tag(tag: u16) -> bool {
    matches!(
        tag,
        0x0111 | 0x0117 | 0x0144 | 0x0145 | 0x0201 | 0x0202 | 0x014A
            | TAG_EXIF_IFD | TAG_GPS_IFD | TAG_INTEROP_IFD
    )
}

/// Baseline image-structure tags a TIFF decoder needs.
pub(crate) fn is_structural_tag(tag: u16) -> bool {
    is_layout_tag(tag)
        || matches!(
            tag,
            0x00FE | 0x00FF | 0x0100 | 0x0101 | 0x0102 | 0x0103 | 0x0106 | 0x0107
                | 0x0108 | 0x0109 | 0x010A | 0x0112 | 0x0115 | 0x0116 | 0x0118
                | 0x0119 | 0x011A | 0x011B | 0x011C | 0x0122 | 0x0123 | 0x0124
                | 0x0125 | 0x0128 | 0x012D | 0x013D | 0x013E | 0x013F | 0x0140
                | 0x0142 | 0x0143 | 0x0152 | 0x0153 | 0x0154 | 0x0155 | 0x015B
                | 0x0211 | 0x0212 | 0x0213 | 0x0214
        )
}

/// Tags of a TIFF file's own IFDs that carry EXIF-style descriptive data.
///
/// Everything a decoder does not need counts, apart from the blocks that are
/// reported under their own category (XMP, ICC, IPTC, Photoshop).
pub(crate) fn is_descriptive_tag(tag: u16) -> bool {
    !is_structural_tag(tag) && !matches!(tag, TAG_XMP | TAG_ICC | TAG_IPTC | TAG_PHOTOSHOP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::{self, TiffBuilder, TiffEntry};

    #[test]
    fn header_both_byte_orders() {
        let le = parse_header(b"II*\0\x08\0\0\0").unwrap();
        assert_eq!(le.order, ByteOrder::Little);
        assert_eq!(le.first_ifd, 8);

        let be = parse_header(b"MM\0*\0\0\0\x08").unwrap();
        assert_eq!(be.order, ByteOrder::Big);
        assert_eq!(be.first_ifd, 8);
    }

    #[test]
    fn header_rejects_bigtiff_and_garbage() {
        assert!(matches!(parse_header(b"II+\0\x08\0\0\0"), Err(IfdError::BigTiff)));
        assert!(matches!(parse_header(b"XX*\0"), Err(IfdError::BadHeader)));
        assert!(matches!(parse_header(b"II"), Err(IfdError::BadHeader)));
    }

    #[test]
    fn walk_finds_sub_directories() {
        let blob = testdata::exif_blob_with_gps();
        let mut warnings = Vec::new();
        let dir = walk(&blob, &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert!(dir.exif.is_some());
        assert!(dir.gps.is_some());
        let make = dir.primary().get(0x010F).unwrap();
        assert_eq!(make.decode(dir.order, &blob), Some(Value::Ascii("TestCam".to_string())));
    }

    #[test]
    fn walk_reports_broken_sub_ifd_as_warning() {
        // GPS pointer far outside the data.
        let blob = TiffBuilder::new()
            .ifd0(vec![
                TiffEntry::ascii(0x010F, "TestCam"),
                TiffEntry::long(TAG_GPS_IFD, 0xFFFF_0000),
            ])
            .build();
        let mut warnings = Vec::new();
        let dir = walk(&blob, &mut warnings).unwrap();
        assert!(dir.gps.is_none());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, MetadataCategory::Gps);
    }

    #[test]
    fn walk_fails_on_out_of_bounds_ifd0() {
        let mut warnings = Vec::new();
        assert!(matches!(
            walk(b"II*\0\xff\0\0\0", &mut warnings),
            Err(IfdError::OutOfBounds(255))
        ));
    }

    #[test]
    fn walk_stops_on_chain_loop() {
        // IFD0 at 8 whose next pointer refers back to itself.
        let mut data = b"II*\0\x08\0\0\0".to_vec();
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        let mut warnings = Vec::new();
        let dir = walk(&data, &mut warnings).unwrap();
        assert_eq!(dir.chain.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn entry_value_out_of_bounds_is_none() {
        let mut data = b"II*\0\x08\0\0\0".to_vec();
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0x010Fu16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&5000u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        let ifd = read_ifd(&data, ByteOrder::Little, 8).unwrap();
        assert!(ifd.entries[0].value.is_none());
        assert!(ifd.entries[0].decode(ByteOrder::Little, &data).is_none());
    }

    #[test]
    fn big_endian_values() {
        let blob = TiffBuilder::big_endian()
            .ifd0(vec![
                TiffEntry::ascii(0x010F, "BigCam"),
                TiffEntry::short(0x0112, 6),
            ])
            .build();
        let mut warnings = Vec::new();
        let dir = walk(&blob, &mut warnings).unwrap();
        assert_eq!(dir.order, ByteOrder::Big);
        let orientation = dir.primary().get(0x0112).unwrap().decode(dir.order, &blob).unwrap();
        assert_eq!(orientation, Value::Unsigned(vec![6]));
    }
}
