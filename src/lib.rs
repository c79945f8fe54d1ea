//! # exif-strip
//!
//! Preview and remove privacy-sensitive image metadata (EXIF, GPS, ICC profiles,
//! XMP, comments) without touching pixel data wherever the container allows it.
//!
//! ## Quick Start
//!
//! The pipeline module classifies, previews and cleans whole batches. Each file
//! succeeds or fails on its own; a broken upload never fails the batch:
//!
//! ```rust,no_run
//! use exif_strip::metadata::CleanOptions;
//! use exif_strip::pipeline::{clean_batch, UploadedImage};
//!
//! fn main() -> anyhow::Result<()> {
//!     let uploads = vec![
//!         UploadedImage::new("holiday.jpg", std::fs::read("holiday.jpg")?),
//!         UploadedImage::new("scan.tif", std::fs::read("scan.tif")?),
//!     ];
//!
//!     let report = clean_batch(&uploads, CleanOptions::default());
//!     for (name, cleaned) in report.successes() {
//!         println!("{name}: removed {:?} ({:?})", cleaned.removed, cleaned.mode);
//!     }
//!     for failure in report.failures() {
//!         eprintln!("{}: {}", failure.filename, failure.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-Level Usage
//!
//! For a single buffer, classify it and call the metadata processor directly:
//!
//! ```rust,no_run
//! use exif_strip::format::classify;
//! use exif_strip::metadata::{clean, preview, CleanOptions, MetadataCategory};
//!
//! fn main() -> anyhow::Result<()> {
//!     let bytes = std::fs::read("photo.jpg")?;
//!     let format = classify(&bytes)?;
//!
//!     let summary = preview(&bytes, format)?;
//!     if let Some(gps) = &summary.gps {
//!         println!("Taken at {} {}", gps.latitude_dms(), gps.longitude_dms());
//!     }
//!
//!     let cleaned = clean(&bytes, format, CleanOptions { remove_all: true })?;
//!     assert!(!cleaned.removed.is_empty() || cleaned.bytes == bytes);
//!     println!("ICC removed: {}", cleaned.removed.contains(&MetadataCategory::Icc));
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Formats
//!
//! | Format | Strategy |
//! |--------|----------|
//! | JPEG | Segment strip (APP1 EXIF/XMP, APP2 ICC, APP13 IPTC, COM) |
//! | PNG | Chunk strip (`eXIf`, `iCCP`, text chunks) |
//! | GIF | Extension strip (comments, XMP/ICC application extensions) |
//! | WebP | Chunk strip (`EXIF`, `ICCP`, `XMP `), VP8X flags updated |
//! | TIFF | In-place IFD edit; BigTIFF is re-encoded |
//! | BMP | V5 colour profile removal |
//! | HEIF / AVIF | Metadata item payloads blanked in place |
//!
//! ## Modules
//!
//! - [`config`] - Configuration types and loading/saving
//! - [`error`] - [`StripError`](error::StripError) and [`MetadataWarning`](error::MetadataWarning)
//! - [`format`] - Signature-based format detection
//! - [`metadata`] - Metadata preview and removal per format
//! - [`pipeline`] - Per-file state machine, batches and file helpers

pub mod config;
pub mod error;
pub mod format;
pub mod metadata;
pub mod pipeline;

#[cfg(test)]
mod testdata;

pub use error::{MetadataWarning, StripError};
pub use format::{FormatKind, classify};
pub use metadata::{CleanMode, CleanOptions, CleanedImage, MetadataCategory, MetadataSummary, clean, preview};
