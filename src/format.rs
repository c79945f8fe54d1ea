use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::StripError;

/// Supported image extensions, used only when walking directories.
///
/// Classification itself never looks at the filename.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "jfif", "png", "gif", "webp", "tif", "tiff", "bmp", "dib", "heic", "heif",
    "hif", "avif",
];

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const GIF87A: &[u8] = b"GIF87a";
const GIF89A: &[u8] = b"GIF89a";
const TIFF_LE: &[u8] = b"II*\0";
const TIFF_BE: &[u8] = b"MM\0*";
const BIGTIFF_LE: &[u8] = b"II+\0";
const BIGTIFF_BE: &[u8] = b"MM\0+";

/// BITMAPCOREHEADER through BITMAPV5HEADER.
const BMP_DIB_HEADER_SIZES: &[u32] = &[12, 40, 52, 56, 64, 108, 124];

const AVIF_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis"];
const HEIF_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

/// Container format of an uploaded image, determined from its signature.
///
/// Use [`classify`] to obtain one from a byte buffer. The filename (and any
/// client-declared content type) is ignored, so a PNG uploaded as `photo.jpg`
/// is still handled as a PNG.
///
/// # Example
///
/// ```rust
/// use exif_strip::format::{classify, FormatKind};
///
/// let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
/// assert_eq!(classify(png).unwrap(), FormatKind::Png);
/// assert!(classify(b"not an image").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Jpeg,
    Png,
    Gif,
    #[serde(rename = "webp")]
    WebP,
    Tiff,
    Bmp,
    /// HEIC/HEIF (ISO-BMFF with an HEVC or generic image brand)
    Heif,
    Avif,
    /// No signature matched.
    Unknown,
}

/// How metadata is removed for a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Drop whole marker segments; entropy-coded scan data is copied verbatim.
    SegmentStrip,
    /// Drop or null metadata chunks, blocks or tags inside the container.
    ChunkStrip,
    /// Rewrite the ISO-BMFF box structure around the coded image items.
    ContainerRewrite,
    /// Nothing can be done for an unclassified buffer.
    Unsupported,
}

impl FormatKind {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Gif => "GIF",
            Self::WebP => "WebP",
            Self::Tiff => "TIFF",
            Self::Bmp => "BMP",
            Self::Heif => "HEIF",
            Self::Avif => "AVIF",
            Self::Unknown => "unknown",
        }
    }

    /// The metadata removal strategy the dispatcher routes this format to.
    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Jpeg => Strategy::SegmentStrip,
            Self::Png | Self::Gif | Self::WebP | Self::Tiff | Self::Bmp => Strategy::ChunkStrip,
            Self::Heif | Self::Avif => Strategy::ContainerRewrite,
            Self::Unknown => Strategy::Unsupported,
        }
    }

    /// MIME type for the format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Tiff => "image/tiff",
            Self::Bmp => "image/bmp",
            Self::Heif => "image/heif",
            Self::Avif => "image/avif",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// Codec in the `image` crate that can decode (and re-encode) this format.
    ///
    /// `None` for HEIF/AVIF: no HEVC or AV1 codec is linked in.
    pub(crate) fn image_format(&self) -> Option<image::ImageFormat> {
        match self {
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Png => Some(image::ImageFormat::Png),
            Self::Gif => Some(image::ImageFormat::Gif),
            Self::WebP => Some(image::ImageFormat::WebP),
            Self::Tiff => Some(image::ImageFormat::Tiff),
            Self::Bmp => Some(image::ImageFormat::Bmp),
            Self::Heif | Self::Avif | Self::Unknown => None,
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Detect the container format from magic bytes. Returns [`FormatKind::Unknown`]
/// when nothing matches.
pub fn detect(data: &[u8]) -> FormatKind {
    if data.starts_with(JPEG_MAGIC) {
        return FormatKind::Jpeg;
    }
    if data.starts_with(PNG_MAGIC) {
        return FormatKind::Png;
    }
    if data.starts_with(GIF87A) || data.starts_with(GIF89A) {
        return FormatKind::Gif;
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return FormatKind::WebP;
    }
    if [TIFF_LE, TIFF_BE, BIGTIFF_LE, BIGTIFF_BE]
        .iter()
        .any(|magic| data.starts_with(magic))
    {
        return FormatKind::Tiff;
    }
    if is_bmp(data) {
        return FormatKind::Bmp;
    }
    if let Some(kind) = detect_isobmff(data) {
        return kind;
    }
    FormatKind::Unknown
}

/// Classify a buffer by signature.
///
/// Fails with [`StripError::UnsupportedFormat`] when no known signature matches.
pub fn classify(data: &[u8]) -> Result<FormatKind, StripError> {
    match detect(data) {
        FormatKind::Unknown => Err(StripError::UnsupportedFormat),
        kind => Ok(kind),
    }
}

/// Check if a file has a supported image extension.
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_bmp(data: &[u8]) -> bool {
    if data.len() < 18 || !data.starts_with(b"BM") {
        return false;
    }
    let dib_size = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
    BMP_DIB_HEADER_SIZES.contains(&dib_size)
}

/// Look at the `ftyp` box brands. AVIF files usually also carry `mif1`, so AVIF
/// brands win over the generic HEIF ones.
fn detect_isobmff(data: &[u8]) -> Option<FormatKind> {
    if data.len() < 16 || &data[4..8] != b"ftyp" {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size < 16 || size > data.len() {
        return None;
    }

    let mut brands: Vec<&[u8]> = vec![&data[8..12]];
    brands.extend(data[16..size].chunks_exact(4));

    let has_any = |set: &[&[u8; 4]]| brands.iter().any(|b| set.iter().any(|s| *b == &s[..]));
    if has_any(AVIF_BRANDS) {
        Some(FormatKind::Avif)
    } else if has_any(HEIF_BRANDS) {
        Some(FormatKind::Heif)
    } else {
        None
    }
}
