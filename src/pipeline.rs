use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StripError;
use crate::format::{self, FormatKind};
use crate::metadata::{self, CleanOptions, CleanedImage, MetadataSummary};

/// One file handed to the pipeline: the name it was uploaded under and its bytes.
///
/// The filename is carried through to reports and output names only; it has
/// no say in how the bytes are classified.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedImage {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Read a file from disk, refusing anything larger than `max_bytes`.
    ///
    /// The upload keeps only the file name, not the directory it came from.
    pub fn from_path(path: &Path, max_bytes: u64) -> Result<Self> {
        let len = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if len > max_bytes {
            anyhow::bail!(
                "{} is {len} bytes, larger than the {max_bytes} byte limit",
                path.display()
            );
        }
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(filename, bytes))
    }
}

/// Where a file is in its life cycle.
///
/// ```text
/// Received -> Classified -> PreviewReady | Cleaned | Failed
/// Received -> Failed
/// ```
///
/// `PreviewReady`, `Cleaned` and `Failed` are terminal. There are no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Received,
    Classified,
    PreviewReady,
    Cleaned,
    Failed,
}

impl FileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PreviewReady | Self::Cleaned | Self::Failed)
    }

    pub fn can_advance_to(&self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Received, Classified) | (Received, Failed) | (Classified, PreviewReady | Cleaned | Failed)
        )
    }
}

/// Why a file was excluded from the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnsupportedFormat,
    DecodeError,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported format",
            Self::DecodeError => "could not decode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub filename: String,
    pub reason: FailureReason,
    pub message: String,
}

impl FailureRecord {
    fn new(filename: &str, error: &StripError) -> Self {
        let reason = match error {
            StripError::UnsupportedFormat => FailureReason::UnsupportedFormat,
            StripError::Decode { .. } => FailureReason::DecodeError,
        };
        Self {
            filename: filename.to_string(),
            reason,
            message: error.to_string(),
        }
    }
}

/// The result carried by a [`FileReport`] once it reached a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Failure(FailureRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport<T> {
    pub filename: String,
    /// `None` when classification itself failed.
    pub format: Option<FormatKind>,
    pub state: FileState,
    pub outcome: Outcome<T>,
}

impl<T> FileReport<T> {
    pub fn success(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(record) => Some(record),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success().is_some()
    }
}

/// Per-file results in input order, successes and failures side by side.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    pub files: Vec<FileReport<T>>,
}

impl<T> BatchReport<T> {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.files
            .iter()
            .filter_map(|f| f.success().map(|v| (f.filename.as_str(), v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.files.iter().filter_map(FileReport::failure)
    }

    pub fn success_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }
}

/// Walks one file through its states, checking every transition.
struct Tracker<'a> {
    filename: &'a str,
    state: FileState,
}

impl<'a> Tracker<'a> {
    fn new(filename: &'a str) -> Self {
        Self {
            filename,
            state: FileState::Received,
        }
    }

    fn advance(&mut self, next: FileState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        log::debug!("{}: {:?} -> {next:?}", self.filename, self.state);
        self.state = next;
    }

    fn finish<T>(mut self, format: Option<FormatKind>, result: Result<T, StripError>, done: FileState) -> FileReport<T> {
        let outcome = match result {
            Ok(value) => {
                self.advance(done);
                Outcome::Success(value)
            }
            Err(e) => {
                log::error!("{}: {e}", self.filename);
                self.advance(FileState::Failed);
                Outcome::Failure(FailureRecord::new(self.filename, &e))
            }
        };
        FileReport {
            filename: self.filename.to_string(),
            format,
            state: self.state,
            outcome,
        }
    }
}

fn run<T>(
    upload: &UploadedImage,
    done: FileState,
    op: impl FnOnce(&[u8], FormatKind) -> Result<T, StripError>,
) -> FileReport<T> {
    let mut tracker = Tracker::new(&upload.filename);
    let format = match format::classify(&upload.bytes) {
        Ok(format) => format,
        Err(e) => return tracker.finish(None, Err(e), done),
    };
    tracker.advance(FileState::Classified);
    let result = op(&upload.bytes, format);
    tracker.finish(Some(format), result, done)
}

/// Classify and summarise one upload.
pub fn preview_file(upload: &UploadedImage) -> FileReport<MetadataSummary> {
    run(upload, FileState::PreviewReady, metadata::preview)
}

/// Classify and clean one upload.
pub fn clean_file(upload: &UploadedImage, options: CleanOptions) -> FileReport<CleanedImage> {
    run(upload, FileState::Cleaned, |data, format| metadata::clean(data, format, options))
}

/// Preview every upload in parallel. A failing file never fails the batch.
///
/// # Example
///
/// ```rust
/// use exif_strip::pipeline::{preview_batch, UploadedImage};
///
/// let uploads = vec![UploadedImage::new("notes.txt", b"plain text".to_vec())];
/// let report = preview_batch(&uploads);
/// assert_eq!(report.failure_count(), 1);
/// ```
pub fn preview_batch(uploads: &[UploadedImage]) -> BatchReport<MetadataSummary> {
    BatchReport {
        files: uploads.par_iter().map(preview_file).collect(),
    }
}

/// Clean every upload in parallel with one set of options for the whole batch.
pub fn clean_batch(uploads: &[UploadedImage], options: CleanOptions) -> BatchReport<CleanedImage> {
    BatchReport {
        files: uploads.par_iter().map(|u| clean_file(u, options)).collect(),
    }
}

/// Collect image files from the given paths.
///
/// Files named explicitly are always kept and left to signature
/// classification. Directories are walked recursively (following symlinks)
/// and only files with a known image extension are picked up.
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            images.push(path.clone());
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && format::has_image_extension(p) {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

/// Output names for a batch: each upload keeps its filename, repeats get a
/// numeric suffix before the extension (`photo.jpg`, `photo-1.jpg`, ...).
pub fn output_names<'a>(filenames: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken = HashSet::new();
    let mut names = Vec::new();
    for filename in filenames {
        let path = Path::new(filename);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

        let mut candidate = filename.to_string();
        let mut n = 1;
        while !taken.insert(candidate.to_lowercase()) {
            candidate = match &ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            n += 1;
        }
        names.push(candidate);
    }
    names
}

/// Create a backup of the original file next to it (`photo.jpg.bak`).
///
/// An existing backup is left alone so repeated runs keep the first original.
pub fn backup_file(path: &Path) -> Result<PathBuf> {
    let backup_path = path.with_extension(format!(
        "{}.bak",
        path.extension().unwrap_or_default().to_string_lossy()
    ));

    if !backup_path.exists() {
        std::fs::copy(path, &backup_path).context("Failed to create backup")?;
        log::debug!("Backup created: {}", backup_path.display());
    }

    Ok(backup_path)
}
