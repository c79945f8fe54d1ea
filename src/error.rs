use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::format::FormatKind;
use crate::metadata::MetadataCategory;

/// Errors that exclude a file from the batch.
///
/// Neither variant is retried. The batch layer turns them into a
/// [`FailureRecord`](crate::pipeline::FailureRecord) and moves on to the next file.
#[derive(Debug, Error)]
pub enum StripError {
    /// No known container signature matched.
    #[error("unsupported or unrecognised image format")]
    UnsupportedFormat,

    /// The image body could not be parsed as its detected format.
    #[error("could not decode {format} image: {reason}")]
    Decode { format: FormatKind, reason: String },
}

impl StripError {
    pub(crate) fn decode(format: FormatKind, reason: impl Into<String>) -> Self {
        Self::Decode {
            format,
            reason: reason.into(),
        }
    }
}

/// A recoverable problem with one metadata block (partial metadata corruption).
///
/// The block is dropped (when cleaning) or skipped (when previewing) and
/// processing continues with the remaining blocks. The result still counts as a
/// success but carries the warning so callers can surface it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataWarning {
    pub category: MetadataCategory,
    pub message: String,
}

impl MetadataWarning {
    pub(crate) fn new(category: MetadataCategory, message: impl Into<String>) -> Self {
        let warning = Self {
            category,
            message: message.into(),
        };
        log::warn!("{warning}");
        warning
    }
}

impl fmt::Display for MetadataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partial metadata corruption in {} block: {}",
            self.category, self.message
        )
    }
}
