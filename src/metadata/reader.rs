//! Turns raw metadata blocks into a [`MetadataSummary`].

use nom_exif::{EntryValue, ExifIter, ExifTag, GPSInfo, LatLng, MediaParser, MediaSource};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use super::ifd::{self, TAG_EXIF_IFD, TAG_GPS_IFD, TAG_INTEROP_IFD};
use super::xmp::{self, NS_AUX, NS_DC, NS_EXIF, NS_PHOTOSHOP, NS_TIFF, NS_XMP, NS_XMP_MM};
use super::{CategoryReport, Inspection, MetadataCategory, MetadataEntry, MetadataSummary};
use crate::error::MetadataWarning;
use crate::format::FormatKind;

// GPS IFD tags
const GPS_LATITUDE_REF: u16 = 0x0001;
const GPS_LATITUDE: u16 = 0x0002;
const GPS_LONGITUDE_REF: u16 = 0x0003;
const GPS_LONGITUDE: u16 = 0x0004;
const GPS_ALTITUDE_REF: u16 = 0x0005;
const GPS_ALTITUDE: u16 = 0x0006;
const GPS_TIMESTAMP: u16 = 0x0007;
const GPS_DATESTAMP: u16 = 0x001D;

const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;
const TAG_USER_COMMENT: u16 = 0x9286;
const TAG_MAKER_NOTE: u16 = 0x927C;

const MAX_LISTED_VALUES: usize = 16;

/// A decoded GPS position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsPosition {
    /// Signed decimal degrees, negative south of the equator.
    pub latitude: f64,
    /// Signed decimal degrees, negative west of Greenwich.
    pub longitude: f64,
    /// Metres, negative below sea level.
    pub altitude: Option<f64>,
}

impl GpsPosition {
    /// Latitude as degrees/minutes/seconds with hemisphere, e.g. `40°26'46.00" N`.
    pub fn latitude_dms(&self) -> String {
        to_dms(self.latitude, if self.latitude < 0.0 { 'S' } else { 'N' })
    }

    /// Longitude as degrees/minutes/seconds with hemisphere, e.g. `79°58'56.00" W`.
    pub fn longitude_dms(&self) -> String {
        to_dms(self.longitude, if self.longitude < 0.0 { 'W' } else { 'E' })
    }

    pub fn decimal(&self) -> String {
        format!("{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

impl fmt::Display for GpsPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude_dms(), self.longitude_dms())
    }
}

fn to_dms(decimal: f64, hemisphere: char) -> String {
    // Work in hundredths of a second so rounding carries into minutes/degrees.
    let total = (decimal.abs() * 360_000.0).round() as u64;
    let degrees = total / 360_000;
    let minutes = (total % 360_000) / 6_000;
    let hundredths = total % 6_000;
    format!(
        "{degrees}°{minutes}'{}.{:02}\" {hemisphere}",
        hundredths / 100,
        hundredths % 100
    )
}

/// Build the summary for one image from what its handler found.
pub(crate) fn summarize(format: FormatKind, inspection: Inspection<'_>) -> MetadataSummary {
    let Inspection {
        exif,
        exif_is_container,
        icc,
        xmp,
        other,
        dimensions,
        frames,
        mut warnings,
    } = inspection;

    let mut categories: BTreeMap<MetadataCategory, CategoryReport> = MetadataCategory::ALL
        .into_iter()
        .map(|c| (c, CategoryReport::Absent))
        .collect();
    let mut gps = None;
    let mut gps_entries = Vec::new();

    if let Some(blob) = exif.as_deref() {
        let (exif_entries, exif_gps) = read_exif(blob, exif_is_container, &mut warnings);
        if let Some((position, entries)) = exif_gps {
            gps = position;
            gps_entries = entries;
        }
        if !exif_entries.is_empty() {
            categories.insert(MetadataCategory::Exif, CategoryReport::Present { entries: exif_entries });
        }
    }

    if let Some(profile) = icc.as_deref() {
        categories.insert(
            MetadataCategory::Icc,
            CategoryReport::Present {
                entries: read_icc(profile, &mut warnings),
            },
        );
    }

    if !xmp.is_empty() {
        let (entries, xmp_gps) = read_xmp(&xmp, &mut warnings);
        if gps.is_none() {
            gps = xmp_gps.position;
        }
        gps_entries.extend(xmp_gps.entries);
        categories.insert(MetadataCategory::Xmp, CategoryReport::Present { entries });
    }

    if !gps_entries.is_empty() {
        categories.insert(MetadataCategory::Gps, CategoryReport::Present { entries: gps_entries });
    }
    if !other.is_empty() {
        categories.insert(MetadataCategory::Other, CategoryReport::Present { entries: other });
    }

    MetadataSummary {
        format,
        dimensions,
        frames: frames.unwrap_or(1),
        has_alpha: None,
        color_mode: None,
        categories,
        gps,
        warnings,
    }
}

// ── EXIF ─────────────────────────────────────────────────────────────

type GpsResult = (Option<GpsPosition>, Vec<MetadataEntry>);

/// Parse a TIFF-structured EXIF block (byte-order mark first) with nom-exif.
pub(crate) fn exif_iter(blob: &[u8]) -> Result<ExifIter, nom_exif::Error> {
    let mut parser = MediaParser::new();
    let ms = MediaSource::seekable(Cursor::new(blob.to_vec()))?;
    parser.parse(ms)
}

/// Whether the block has a GPS directory with anything in it.
pub(crate) fn has_gps(iter: &ExifIter) -> bool {
    iter.parse_gps_info().ok().flatten().is_some()
}

/// Directory a tag was read from.
///
/// nom-exif yields sub-directory entries right after the pointer tag that
/// leads to them, and GPS and Interop tags all sit below 0x20, so the last
/// pointer seen tells which directory a low-numbered tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Main,
    Gps,
    Interop,
}

struct Tag {
    code: u16,
    known: Option<ExifTag>,
    page: usize,
    section: Section,
    value: EntryValue,
}

fn collect_tags(iter: ExifIter) -> Vec<Tag> {
    let mut tags = Vec::new();
    let mut section = Section::Main;
    let mut page = 0;
    for mut entry in iter {
        let code = entry.tag_code();
        if entry.ifd_index() != page {
            page = entry.ifd_index();
            section = Section::Main;
        }
        match code {
            TAG_GPS_IFD => section = Section::Gps,
            TAG_INTEROP_IFD => section = Section::Interop,
            TAG_EXIF_IFD => section = Section::Main,
            _ => {}
        }
        let Some(value) = entry.take_value() else {
            log::debug!("skipping undecodable tag 0x{code:04X}");
            continue;
        };
        tags.push(Tag {
            code,
            known: entry.tag(),
            page,
            section: if code < 0x20 { section } else { Section::Main },
            value,
        });
    }
    tags
}

fn tag_name(tag: &Tag) -> String {
    let name = match tag.section {
        Section::Interop => match tag.code {
            0x0001 => Some("InteroperabilityIndex".to_string()),
            0x0002 => Some("InteroperabilityVersion".to_string()),
            _ => None,
        },
        _ => tag.known.map(|t| t.to_string()).or_else(|| {
            EXTRA_TAG_NAMES
                .iter()
                .find(|(code, _)| *code == tag.code)
                .map(|(_, name)| name.to_string())
        }),
    };
    name.unwrap_or_else(|| format!("Tag 0x{:04X}", tag.code))
}

/// Names nom-exif does not know.
const EXTRA_TAG_NAMES: &[(u16, &str)] = &[
    (0x010D, "DocumentName"),
    (0x011D, "PageName"),
    (0x013B, "Artist"),
    (0x4746, "Rating"),
    (0x9C9B, "XPTitle"),
    (0x9C9C, "XPComment"),
    (0x9C9D, "XPAuthor"),
    (0x9C9E, "XPKeywords"),
    (0x9C9F, "XPSubject"),
    (0xA430, "CameraOwnerName"),
    (0xA431, "BodySerialNumber"),
    (0xA435, "LensSerialNumber"),
    (0xA460, "CompositeImage"),
    (0x001F, "GPSHPositioningError"),
];

fn read_exif(
    blob: &[u8],
    is_container: bool,
    warnings: &mut Vec<MetadataWarning>,
) -> (Vec<MetadataEntry>, Option<GpsResult>) {
    let mut entries = Vec::new();
    if !is_container {
        entries.push(MetadataEntry::new("Size", format!("{} bytes", blob.len())));
    }

    let iter = match exif_iter(blob) {
        Ok(iter) => iter,
        Err(e) => {
            warnings.push(MetadataWarning::new(
                MetadataCategory::Exif,
                format!("unreadable EXIF block skipped: {e}"),
            ));
            return (entries, None);
        }
    };
    let gps_info = iter.parse_gps_info().ok().flatten();
    let big_endian = blob.starts_with(b"MM");
    let tags = collect_tags(iter);

    for tag in tags.iter().filter(|t| t.section != Section::Gps) {
        if tag.page > 0 && !is_container {
            if tag.code == TAG_THUMBNAIL_LENGTH {
                if let Some(len) = tag.value.as_u32() {
                    entries.push(MetadataEntry::new("Thumbnail", format!("embedded JPEG, {len} bytes")));
                }
            }
            continue;
        }
        let listed = if is_container && tag.section == Section::Main {
            ifd::is_descriptive_tag(tag.code)
        } else {
            !ifd::is_layout_tag(tag.code)
        };
        if !listed {
            continue;
        }
        let text = render(tag.code, &tag.value, big_endian);
        if !text.is_empty() {
            let prefix = if tag.page == 0 { String::new() } else { format!("Page {} ", tag.page + 1) };
            entries.push(MetadataEntry::new(format!("{prefix}{}", tag_name(tag)), text));
        }
    }

    let gps_tags: Vec<&Tag> = tags.iter().filter(|t| t.section == Section::Gps).collect();
    let gps = (!gps_tags.is_empty() || gps_info.is_some()).then(|| read_gps(gps_info, &gps_tags, big_endian));
    (entries, gps)
}

fn rational(n: i64, d: i64) -> String {
    if d == 0 {
        "undefined".to_string()
    } else if n % d == 0 {
        (n / d).to_string()
    } else if n.abs() < d.abs() {
        format!("{n}/{d}")
    } else {
        let s = format!("{:.2}", n as f64 / d as f64);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn join(values: impl ExactSizeIterator<Item = String>) -> String {
    let total = values.len();
    let mut text = values.take(MAX_LISTED_VALUES).collect::<Vec<_>>().join(", ");
    if total > MAX_LISTED_VALUES {
        text.push_str(&format!(", ... ({total} values)"));
    }
    text
}

/// Render an EXIF value, decoding the tags whose byte payload has its own encoding.
fn render(code: u16, value: &EntryValue, big_endian: bool) -> String {
    match value {
        EntryValue::Text(s) => s.trim().to_string(),
        EntryValue::URational(r) => rational(r.0.into(), r.1.into()),
        EntryValue::IRational(r) => rational(r.0.into(), r.1.into()),
        EntryValue::URationalArray(v) => join(v.iter().map(|r| rational(r.0.into(), r.1.into()))),
        EntryValue::IRationalArray(v) => join(v.iter().map(|r| rational(r.0.into(), r.1.into()))),
        EntryValue::U16Array(v) => join(v.iter().map(u16::to_string)),
        EntryValue::U32Array(v) => join(v.iter().map(u32::to_string)),
        EntryValue::NaiveDateTime(t) => t.format("%Y:%m:%d %H:%M:%S").to_string(),
        EntryValue::Time(t) => t.format("%Y:%m:%d %H:%M:%S %:z").to_string(),
        EntryValue::U8Array(b) | EntryValue::Undefined(b) => render_bytes(code, b, big_endian),
        other => other.to_string(),
    }
}

fn render_bytes(code: u16, bytes: &[u8], big_endian: bool) -> String {
    match code {
        // XP* tags are UTF-16LE whatever the file's byte order.
        0x9C9B..=0x9C9F => decode_utf16(bytes, false),
        TAG_USER_COMMENT if bytes.len() >= 8 => {
            let (charset, text) = bytes.split_at(8);
            if charset.starts_with(b"UNICODE") {
                decode_utf16(text, big_endian)
            } else {
                String::from_utf8_lossy(text)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string()
            }
        }
        TAG_MAKER_NOTE => format!("{} bytes", bytes.len()),
        _ => {
            let end = bytes.iter().rposition(|&c| c != 0).map_or(0, |p| p + 1);
            let trimmed = &bytes[..end];
            if !trimmed.is_empty() && trimmed.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
                String::from_utf8_lossy(trimmed).into_owned()
            } else if bytes.len() <= MAX_LISTED_VALUES {
                hex::encode(bytes)
            } else {
                format!("{} bytes", bytes.len())
            }
        }
    }
}

fn decode_utf16(bytes: &[u8], big_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| {
            if big_endian {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

// ── GPS ──────────────────────────────────────────────────────────────

fn read_gps(info: Option<GPSInfo>, tags: &[&Tag], big_endian: bool) -> GpsResult {
    let value = |code: u16| tags.iter().find(|t| t.code == code).map(|t| &t.value);

    let altitude = value(GPS_ALTITUDE)
        .and_then(|v| v.as_urational().map(|r| r.as_float()).or_else(|| v.as_irational().map(|r| r.as_float())))
        .filter(|alt| alt.is_finite())
        .map(|alt| match value(GPS_ALTITUDE_REF).and_then(EntryValue::as_u8) {
            Some(1) => -alt,
            _ => alt,
        });

    let position = info.and_then(|gps| {
        Some(GpsPosition {
            latitude: latlng_to_decimal(&gps.latitude, gps.latitude_ref)?,
            longitude: latlng_to_decimal(&gps.longitude, gps.longitude_ref)?,
            altitude,
        })
    });

    let mut entries = Vec::new();
    if let Some(pos) = &position {
        entries.push(MetadataEntry::new("Latitude", pos.latitude_dms()));
        entries.push(MetadataEntry::new("Longitude", pos.longitude_dms()));
        entries.push(MetadataEntry::new("Position", pos.decimal()));
    }
    if let Some(alt) = altitude {
        entries.push(MetadataEntry::new("Altitude", format!("{alt:.1} m")));
    }
    if let Some([h, m, s]) = value(GPS_TIMESTAMP).and_then(EntryValue::as_urational_array).and_then(|t| <&[_; 3]>::try_from(t).ok()) {
        entries.push(MetadataEntry::new(
            "Time",
            format!("{:02}:{:02}:{:02} UTC", h.as_float() as u32, m.as_float() as u32, s.as_float() as u32),
        ));
    }
    if let Some(date) = value(GPS_DATESTAMP) {
        entries.push(MetadataEntry::new("Date", render(GPS_DATESTAMP, date, big_endian)));
    }

    let formatted = [
        GPS_LATITUDE_REF,
        GPS_LATITUDE,
        GPS_LONGITUDE_REF,
        GPS_LONGITUDE,
        GPS_ALTITUDE_REF,
        GPS_ALTITUDE,
        GPS_TIMESTAMP,
        GPS_DATESTAMP,
    ];
    for tag in tags.iter().filter(|t| !formatted.contains(&t.code)) {
        let name = tag_name(tag).replace("Tag 0x", "GPS tag 0x");
        entries.push(MetadataEntry::new(name, render(tag.code, &tag.value, big_endian)));
    }

    (position, entries)
}

/// Convert a nom-exif LatLng (3 URationals: deg, min, sec) to decimal degrees.
fn latlng_to_decimal(latlng: &LatLng, reference: char) -> Option<f64> {
    let part = |num: u32, den: u32| (den != 0).then(|| num as f64 / den as f64);
    let degrees = part(latlng.0.0, latlng.0.1)?;
    let minutes = part(latlng.1.0, latlng.1.1)?;
    let seconds = part(latlng.2.0, latlng.2.1)?;
    Some(dms_to_decimal(degrees, minutes, seconds, reference))
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, reference: char) -> f64 {
    let coord = degrees + minutes / 60.0 + seconds / 3600.0;
    if matches!(reference, 'S' | 's' | 'W' | 'w') { -coord } else { coord }
}

// ── ICC ──────────────────────────────────────────────────────────────

fn read_icc(profile: &[u8], warnings: &mut Vec<MetadataWarning>) -> Vec<MetadataEntry> {
    let mut entries = vec![MetadataEntry::new("Size", format!("{} bytes", profile.len()))];
    if profile.len() < 128 || &profile[36..40] != b"acsp" {
        warnings.push(MetadataWarning::new(
            MetadataCategory::Icc,
            "ICC profile header is missing or damaged",
        ));
        return entries;
    }

    let sig = |at: usize| String::from_utf8_lossy(&profile[at..at + 4]).trim().to_string();
    entries.push(MetadataEntry::new(
        "Version",
        format!("{}.{}", profile[8], profile[9] >> 4),
    ));
    let class = match &profile[12..16] {
        b"mntr" => "Display".to_string(),
        b"scnr" => "Input".to_string(),
        b"prtr" => "Output".to_string(),
        b"link" => "Device link".to_string(),
        b"spac" => "Colour space".to_string(),
        b"abst" => "Abstract".to_string(),
        b"nmcl" => "Named colour".to_string(),
        _ => sig(12),
    };
    entries.push(MetadataEntry::new("Device Class", class));
    entries.push(MetadataEntry::new("Colour Space", sig(16)));
    entries.push(MetadataEntry::new("Connection Space", sig(20)));
    if profile[80..84] != [0; 4] {
        entries.push(MetadataEntry::new("Creator", sig(80)));
    }
    match icc_description(profile) {
        Some(desc) if !desc.is_empty() => entries.push(MetadataEntry::new("Description", desc)),
        _ => log::debug!("ICC profile has no readable description"),
    }
    entries
}

fn icc_description(profile: &[u8]) -> Option<String> {
    let be32 = |at: usize| -> Option<usize> {
        Some(u32::from_be_bytes(profile.get(at..at + 4)?.try_into().ok()?) as usize)
    };
    let count = be32(128)?;
    let (offset, size) = (0..count.min(256)).find_map(|i| {
        let at = 132 + i * 12;
        if profile.get(at..at + 4)? != b"desc" {
            return None;
        }
        Some((be32(at + 4)?, be32(at + 8)?))
    })?;
    let tag = profile.get(offset..offset.checked_add(size)?)?;

    match tag.get(0..4)? {
        b"desc" => {
            let len = u32::from_be_bytes(tag.get(8..12)?.try_into().ok()?) as usize;
            let text = tag.get(12..12usize.checked_add(len)?)?;
            Some(
                String::from_utf8_lossy(text)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string(),
            )
        }
        b"mluc" => {
            let len = u32::from_be_bytes(tag.get(20..24)?.try_into().ok()?) as usize;
            let at = u32::from_be_bytes(tag.get(24..28)?.try_into().ok()?) as usize;
            let text = tag.get(at..at.checked_add(len)?)?;
            Some(decode_utf16(text, true))
        }
        _ => None,
    }
}

// ── XMP ──────────────────────────────────────────────────────────────

const XMP_PROPERTIES: &[(&str, &str, &str)] = &[
    ("Creator Tool", NS_XMP, "CreatorTool"),
    ("Create Date", NS_XMP, "CreateDate"),
    ("Modify Date", NS_XMP, "ModifyDate"),
    ("Metadata Date", NS_XMP, "MetadataDate"),
    ("Creator", NS_DC, "creator"),
    ("Title", NS_DC, "title"),
    ("Description", NS_DC, "description"),
    ("Subject", NS_DC, "subject"),
    ("Rights", NS_DC, "rights"),
    ("City", NS_PHOTOSHOP, "City"),
    ("State", NS_PHOTOSHOP, "State"),
    ("Country", NS_PHOTOSHOP, "Country"),
    ("Camera Make", NS_TIFF, "Make"),
    ("Camera Model", NS_TIFF, "Model"),
    ("Lens", NS_AUX, "Lens"),
    ("Date Taken", NS_EXIF, "DateTimeOriginal"),
    ("Document ID", NS_XMP_MM, "DocumentID"),
];

#[derive(Default)]
struct XmpGps {
    position: Option<GpsPosition>,
    entries: Vec<MetadataEntry>,
}

fn read_xmp(packets: &[Cow<'_, [u8]>], warnings: &mut Vec<MetadataWarning>) -> (Vec<MetadataEntry>, XmpGps) {
    let total: usize = packets.iter().map(|p| p.len()).sum();
    let mut entries = vec![MetadataEntry::new("Size", format!("{total} bytes"))];

    let mut properties = Vec::new();
    for packet in packets {
        match xmp::properties(packet) {
            Ok(found) => properties.extend(found),
            Err(e) => warnings.push(MetadataWarning::new(
                MetadataCategory::Xmp,
                format!("XMP packet skipped: {e}"),
            )),
        }
    }

    for (label, namespace, name) in XMP_PROPERTIES {
        if let Some(value) = xmp::lookup(&properties, namespace, name) {
            entries.push(MetadataEntry::new(*label, value));
        }
    }

    let mut gps = XmpGps::default();
    let lat = xmp::lookup(&properties, NS_EXIF, "GPSLatitude");
    let lng = xmp::lookup(&properties, NS_EXIF, "GPSLongitude");
    if let Some(lat) = lat {
        gps.entries.push(MetadataEntry::new("XMP Latitude", lat));
    }
    if let Some(lng) = lng {
        gps.entries.push(MetadataEntry::new("XMP Longitude", lng));
    }
    let altitude = xmp::lookup(&properties, NS_EXIF, "GPSAltitude").and_then(|alt| {
        gps.entries.push(MetadataEntry::new("XMP Altitude", alt));
        parse_xmp_rational(alt)
    });
    if let (Some(latitude), Some(longitude)) = (
        lat.and_then(parse_xmp_coordinate),
        lng.and_then(parse_xmp_coordinate),
    ) {
        gps.position = Some(GpsPosition {
            latitude,
            longitude,
            altitude,
        });
    }
    (entries, gps)
}

/// XMP GPS coordinates are `DDD,MM,SSk` or `DDD,MM.mmk` with k in NSEW.
fn parse_xmp_coordinate(text: &str) -> Option<f64> {
    let text = text.trim();
    let reference = text.chars().last()?;
    if !matches!(reference.to_ascii_uppercase(), 'N' | 'S' | 'E' | 'W') {
        return text.parse().ok();
    }
    let body = &text[..text.len() - reference.len_utf8()];
    let parts: Vec<f64> = body
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    let (d, m, s) = match parts[..] {
        [d, m] => (d, m, 0.0),
        [d, m, s] => (d, m, s),
        _ => return None,
    };
    Some(dms_to_decimal(d, m, s, reference.to_ascii_uppercase()))
}

fn parse_xmp_rational(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((n, d)) => {
            let d: f64 = d.trim().parse().ok()?;
            (d != 0.0).then_some(n.trim().parse::<f64>().ok()? / d)
        }
        None => text.trim().parse().ok(),
    }
}
