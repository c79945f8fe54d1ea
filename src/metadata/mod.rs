//! Metadata preview and removal.
//!
//! [`preview`] and [`clean`] take an already classified buffer and route it to
//! the one handler module for its [`FormatKind`]. Handlers only walk container
//! structure; pixel decoding is done once here, through the `image` crate, so
//! that a damaged image body is reported as a decode error instead of being
//! cleaned into a file nobody can open.

mod bmp;
mod gif;
mod heif;
pub(crate) mod ifd;
mod jpeg;
mod png;
pub mod reader;
mod reencode;
mod tiff;
mod webp;
mod xmp;

use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;

use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

pub use reader::GpsPosition;

/// Kinds of metadata the processor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataCategory {
    Exif,
    Gps,
    Icc,
    Xmp,
    /// Comments, text chunks, IPTC and vendor application blocks.
    Other,
}

impl MetadataCategory {
    pub const ALL: [MetadataCategory; 5] = [Self::Exif, Self::Gps, Self::Icc, Self::Xmp, Self::Other];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Exif => "EXIF",
            Self::Gps => "GPS",
            Self::Icc => "ICC",
            Self::Xmp => "XMP",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for MetadataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One human-readable property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryReport {
    Absent,
    Present { entries: Vec<MetadataEntry> },
}

static ABSENT: CategoryReport = CategoryReport::Absent;

impl CategoryReport {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        match self {
            Self::Absent => &[],
            Self::Present { entries } => entries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What [`preview`] found in one image.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataSummary {
    pub format: FormatKind,
    pub dimensions: Option<Dimensions>,
    /// Number of frames; 1 for still images.
    pub frames: u32,
    /// `None` when the body was not decoded.
    pub has_alpha: Option<bool>,
    /// Decoded colour layout, e.g. `RGBA 8-bit`.
    pub color_mode: Option<String>,
    pub categories: BTreeMap<MetadataCategory, CategoryReport>,
    pub gps: Option<GpsPosition>,
    pub warnings: Vec<MetadataWarning>,
}

impl MetadataSummary {
    pub fn category(&self, category: MetadataCategory) -> &CategoryReport {
        self.categories.get(&category).unwrap_or(&ABSENT)
    }

    pub fn is_present(&self, category: MetadataCategory) -> bool {
        self.category(category).is_present()
    }

    /// Categories with something in them, in display order.
    pub fn present(&self) -> Vec<MetadataCategory> {
        MetadataCategory::ALL
            .into_iter()
            .filter(|c| self.is_present(*c))
            .collect()
    }
}

/// Options for [`clean`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanOptions {
    /// Also remove ICC profiles, XMP and other blocks, not just EXIF and GPS.
    pub remove_all: bool,
}

impl CleanOptions {
    /// Categories this configuration removes.
    pub fn targets(&self) -> BTreeSet<MetadataCategory> {
        if self.remove_all {
            MetadataCategory::ALL.into_iter().collect()
        } else {
            BTreeSet::from([MetadataCategory::Exif, MetadataCategory::Gps])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanMode {
    /// Container surgery only, decoded pixels are unchanged.
    Lossless,
    /// Pixels were decoded and re-encoded.
    LossyFallback,
}

/// Result of [`clean`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanedImage {
    #[serde(rename = "size", serialize_with = "serialize_len")]
    pub bytes: Vec<u8>,
    pub mode: CleanMode,
    pub removed: Vec<MetadataCategory>,
    pub warnings: Vec<MetadataWarning>,
}

fn serialize_len<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(bytes.len() as u64)
}

impl CleanedImage {
    pub fn is_lossless(&self) -> bool {
        self.mode == CleanMode::Lossless
    }
}

/// Raw metadata located by a handler, before it is turned into entries.
#[derive(Debug, Default)]
pub(crate) struct Inspection<'a> {
    /// TIFF-structured EXIF data (starting at the byte-order mark).
    pub exif: Option<Cow<'a, [u8]>>,
    /// The EXIF data is the image's own TIFF structure.
    pub exif_is_container: bool,
    pub icc: Option<Cow<'a, [u8]>>,
    pub xmp: Vec<Cow<'a, [u8]>>,
    pub other: Vec<MetadataEntry>,
    pub dimensions: Option<Dimensions>,
    /// Frame count of an animated image.
    pub frames: Option<u32>,
    pub warnings: Vec<MetadataWarning>,
}

/// Outcome of a handler's strip pass.
#[derive(Debug)]
pub(crate) enum Stripped {
    Done {
        /// `None` when nothing was removed.
        bytes: Option<Vec<u8>>,
        removed: BTreeSet<MetadataCategory>,
        warnings: Vec<MetadataWarning>,
    },
    /// The container cannot be rewritten in place.
    NeedsReencode { reason: String },
}

impl Stripped {
    pub(crate) fn unchanged(warnings: Vec<MetadataWarning>) -> Self {
        Self::Done {
            bytes: None,
            removed: BTreeSet::new(),
            warnings,
        }
    }
}

/// Categories removed along with an EXIF block: EXIF, plus GPS when the block
/// has a GPS directory.
///
/// A block too damaged to parse is still removed; the damage becomes a warning.
pub(crate) fn exif_block_categories(
    blob: &[u8],
    warnings: &mut Vec<MetadataWarning>,
) -> Vec<MetadataCategory> {
    match reader::exif_iter(blob) {
        Ok(iter) if reader::has_gps(&iter) => vec![MetadataCategory::Exif, MetadataCategory::Gps],
        Ok(_) => vec![MetadataCategory::Exif],
        Err(e) => {
            warnings.push(MetadataWarning::new(
                MetadataCategory::Exif,
                format!("damaged EXIF block dropped: {e}"),
            ));
            vec![MetadataCategory::Exif]
        }
    }
}

/// Categories removed along with an XMP packet.
pub(crate) fn xmp_block_categories(packet: &[u8]) -> Vec<MetadataCategory> {
    if xmp::has_gps(packet) {
        vec![MetadataCategory::Xmp, MetadataCategory::Gps]
    } else {
        vec![MetadataCategory::Xmp]
    }
}

/// What a strip pass does with one XMP packet.
pub(crate) enum XmpAction {
    Keep,
    Remove,
    /// Same-length packet with the GPS properties blanked.
    Rewrite(Vec<u8>),
}

/// Bookkeeping shared by the handlers' strip passes.
pub(crate) struct StripPass<'t> {
    targets: &'t BTreeSet<MetadataCategory>,
    removed: BTreeSet<MetadataCategory>,
    pub warnings: Vec<MetadataWarning>,
}

impl<'t> StripPass<'t> {
    pub(crate) fn new(targets: &'t BTreeSet<MetadataCategory>) -> Self {
        Self {
            targets,
            removed: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn targets(&self, category: MetadataCategory) -> bool {
        self.targets.contains(&category)
    }

    /// Decide on a block of a single category; `true` means drop it.
    pub(crate) fn remove(&mut self, category: MetadataCategory) -> bool {
        let remove = self.targets(category);
        if remove {
            self.removed.insert(category);
        }
        remove
    }

    /// Decide on an EXIF block; `true` means drop it.
    pub(crate) fn remove_exif(&mut self, blob: &[u8]) -> bool {
        if !self.targets(MetadataCategory::Exif) {
            return false;
        }
        let categories = exif_block_categories(blob, &mut self.warnings);
        self.removed.extend(categories);
        true
    }

    pub(crate) fn xmp(&mut self, packet: &[u8]) -> XmpAction {
        if self.targets(MetadataCategory::Xmp) {
            self.removed.extend(xmp_block_categories(packet));
            return XmpAction::Remove;
        }
        if self.targets(MetadataCategory::Gps) {
            let mut scrubbed = packet.to_vec();
            match xmp::scrub_gps(&mut scrubbed) {
                Ok(true) => {
                    self.removed.insert(MetadataCategory::Gps);
                    return XmpAction::Rewrite(scrubbed);
                }
                Ok(false) => {}
                Err(e) => {
                    // GPS cannot be told apart in a packet that does not parse.
                    self.warnings.push(MetadataWarning::new(
                        MetadataCategory::Xmp,
                        format!("unparseable XMP packet dropped: {e}"),
                    ));
                    self.removed.insert(MetadataCategory::Xmp);
                    return XmpAction::Remove;
                }
            }
        }
        XmpAction::Keep
    }

    /// Finish the pass; `rebuild` is only called when something was removed.
    pub(crate) fn finish(self, rebuild: impl FnOnce() -> Vec<u8>) -> Stripped {
        if self.removed.is_empty() {
            return Stripped::unchanged(self.warnings);
        }
        Stripped::Done {
            bytes: Some(rebuild()),
            removed: self.removed,
            warnings: self.warnings,
        }
    }
}

/// What decoding the body told us.
struct BodyInfo {
    dimensions: Dimensions,
    has_alpha: bool,
    color_mode: &'static str,
}

fn color_mode(color: image::ColorType) -> &'static str {
    use image::ColorType;
    match color {
        ColorType::L8 => "Grayscale 8-bit",
        ColorType::La8 => "Grayscale + alpha 8-bit",
        ColorType::Rgb8 => "RGB 8-bit",
        ColorType::Rgba8 => "RGBA 8-bit",
        ColorType::L16 => "Grayscale 16-bit",
        ColorType::La16 => "Grayscale + alpha 16-bit",
        ColorType::Rgb16 => "RGB 16-bit",
        ColorType::Rgba16 => "RGBA 16-bit",
        ColorType::Rgb32F => "RGB float",
        ColorType::Rgba32F => "RGBA float",
        _ => "other",
    }
}

/// Fully decode the pixel data (the first frame of an animation).
///
/// Formats without a linked codec, and codec features the `image` crate does
/// not implement, are not validated here.
fn decode_body(data: &[u8], format: FormatKind) -> Result<Option<BodyInfo>, StripError> {
    let Some(image_format) = format.image_format() else {
        return Ok(None);
    };
    let mut reader = image::ImageReader::new(Cursor::new(data));
    reader.set_format(image_format);
    match reader.decode() {
        Ok(img) => Ok(Some(BodyInfo {
            dimensions: Dimensions {
                width: img.width(),
                height: img.height(),
            },
            has_alpha: img.color().has_alpha(),
            color_mode: color_mode(img.color()),
        })),
        Err(image::ImageError::Unsupported(e)) => {
            log::debug!("{format} body not validated: {e}");
            Ok(None)
        }
        Err(e) => Err(StripError::decode(format, e.to_string())),
    }
}

/// Extract a structured summary of the metadata in `data`.
///
/// The buffer is only borrowed; it is never modified. A damaged metadata block
/// is skipped with a warning, a damaged image body is a [`StripError::Decode`].
pub fn preview(data: &[u8], format: FormatKind) -> Result<MetadataSummary, StripError> {
    let inspection = match format {
        FormatKind::Jpeg => jpeg::inspect(data)?,
        FormatKind::Png => png::inspect(data)?,
        FormatKind::Gif => gif::inspect(data)?,
        FormatKind::WebP => webp::inspect(data)?,
        FormatKind::Tiff => tiff::inspect(data)?,
        FormatKind::Bmp => bmp::inspect(data)?,
        FormatKind::Heif | FormatKind::Avif => heif::inspect(data, format)?,
        FormatKind::Unknown => return Err(StripError::UnsupportedFormat),
    };
    let decoded = decode_body(data, format)?;

    let mut summary = reader::summarize(format, inspection);
    if let Some(body) = decoded {
        summary.dimensions = Some(body.dimensions);
        summary.has_alpha = Some(body.has_alpha);
        summary.color_mode = Some(body.color_mode.to_string());
    }
    log::debug!(
        "{format}: metadata present in {:?}, {} warning(s)",
        summary.present(),
        summary.warnings.len()
    );
    Ok(summary)
}

/// Remove metadata from `data`.
///
/// With `remove_all == false` only EXIF and GPS are removed. The result is
/// [`CleanMode::Lossless`] whenever the container could be edited without
/// touching coded pixels; otherwise the image is re-encoded and flagged
/// [`CleanMode::LossyFallback`]. Input without removable metadata comes back
/// byte-for-byte unchanged.
pub fn clean(data: &[u8], format: FormatKind, options: CleanOptions) -> Result<CleanedImage, StripError> {
    let targets = options.targets();
    let outcome = match format {
        FormatKind::Jpeg => jpeg::strip(data, &targets)?,
        FormatKind::Png => png::strip(data, &targets)?,
        FormatKind::Gif => gif::strip(data, &targets)?,
        FormatKind::WebP => webp::strip(data, &targets)?,
        FormatKind::Tiff => tiff::strip(data, &targets)?,
        FormatKind::Bmp => bmp::strip(data, &targets)?,
        FormatKind::Heif | FormatKind::Avif => heif::strip(data, format, &targets)?,
        FormatKind::Unknown => return Err(StripError::UnsupportedFormat),
    };
    decode_body(data, format)?;

    match outcome {
        Stripped::Done {
            bytes,
            removed,
            warnings,
        } => {
            let bytes = bytes.unwrap_or_else(|| data.to_vec());
            log::debug!("{format}: removed {removed:?} losslessly");
            Ok(CleanedImage {
                bytes,
                mode: CleanMode::Lossless,
                removed: removed.into_iter().collect(),
                warnings,
            })
        }
        Stripped::NeedsReencode { reason } => {
            log::info!("{format}: {reason}, re-encoding pixels");
            reencode::reencode(data, format, options)
        }
    }
}
