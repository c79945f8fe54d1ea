use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use exif_strip::config::Config;
use exif_strip::metadata::{CategoryReport, CleanedImage, MetadataCategory, MetadataSummary};
use exif_strip::pipeline::{self, BatchReport, FileReport, UploadedImage};

#[derive(Parser, Debug)]
#[command(
    name = "exif-strip",
    version,
    about = "Preview and strip EXIF, GPS, ICC and XMP metadata from images without touching pixel data"
)]
struct Cli {
    /// Image files or directories to process
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Show the metadata of each file without writing anything
    #[arg(long)]
    preview: bool,

    /// Also remove ICC profiles, XMP and comments, not just EXIF and GPS
    #[arg(long = "remove-all")]
    remove_all: bool,

    /// Directory to write cleaned files to
    #[arg(short, long, value_name = "DIR", conflicts_with = "in_place")]
    output_dir: Option<PathBuf>,

    /// Overwrite the input files
    #[arg(long = "in-place")]
    in_place: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    // Load config, CLI flags win
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.remove_all {
        config.clean.remove_all = true;
    }
    if let Some(dir) = &cli.output_dir {
        config.output.output_dir = dir.clone();
        config.output.in_place = false;
    }
    if cli.in_place {
        config.output.in_place = true;
    }

    let images = pipeline::collect_images(&cli.paths);
    if images.is_empty() {
        anyhow::bail!("No image files found in the specified paths.");
    }

    let (sources, uploads) = read_uploads(&images, config.limits.max_file_bytes);
    log::info!("Found {} image(s) to process", uploads.len());

    if cli.preview {
        let report = pipeline::preview_batch(&uploads);
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            for file in &report.files {
                print_preview(file);
            }
            print_failures(&report);
        }
        log::info!(
            "Done: {} previewed, {} failed out of {} images",
            report.success_count(),
            report.failure_count(),
            report.len()
        );
        return Ok(());
    }

    if config.clean.remove_all {
        log::info!("Removing all metadata (EXIF, GPS, ICC, XMP, other)");
    } else {
        log::info!("Removing EXIF and GPS");
    }

    let report = pipeline::clean_batch(&uploads, config.clean);
    let written = write_outputs(&report, &sources, &config)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (file, path) in report.files.iter().zip(&written) {
            if let (Some(cleaned), Some(path)) = (file.success(), path) {
                print_cleaned(&file.filename, cleaned, path);
            }
        }
        print_failures(&report);
    }

    log::info!(
        "Done: {} cleaned, {} failed out of {} images",
        report.success_count(),
        report.failure_count(),
        report.len()
    );

    Ok(())
}

/// Read every collected file, skipping (with a warning) the ones that are too
/// large or unreadable. Returns source paths alongside the uploads.
fn read_uploads(images: &[PathBuf], max_bytes: u64) -> (Vec<PathBuf>, Vec<UploadedImage>) {
    let mut sources = Vec::new();
    let mut uploads = Vec::new();
    for path in images {
        match UploadedImage::from_path(path, max_bytes) {
            Ok(upload) => {
                sources.push(path.clone());
                uploads.push(upload);
            }
            Err(e) => log::warn!("Skipping {e:#}"),
        }
    }
    (sources, uploads)
}

/// Write each cleaned file and return where it went (index-aligned with the report).
///
/// A file that cannot be written is logged and left out; it does not stop the batch.
fn write_outputs(report: &BatchReport<CleanedImage>, sources: &[PathBuf], config: &Config) -> Result<Vec<Option<PathBuf>>> {
    if config.output.in_place {
        return Ok(report
            .files
            .iter()
            .zip(sources)
            .map(|(file, source)| {
                let cleaned = file.success()?;
                match write_in_place(source, cleaned, config.output.backup_originals) {
                    Ok(()) => Some(source.clone()),
                    Err(e) => {
                        log::error!("{e:#}");
                        None
                    }
                }
            })
            .collect());
    }

    let dir = &config.output.output_dir;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let names = pipeline::output_names(report.files.iter().map(|f| f.filename.as_str()));

    Ok(report
        .files
        .iter()
        .zip(names)
        .map(|(file, name)| {
            let cleaned = file.success()?;
            let target = dir.join(name);
            match std::fs::write(&target, &cleaned.bytes) {
                Ok(()) => Some(target),
                Err(e) => {
                    log::error!("Failed to write {}: {e}", target.display());
                    None
                }
            }
        })
        .collect())
}

fn write_in_place(path: &Path, cleaned: &CleanedImage, backup: bool) -> Result<()> {
    if cleaned.removed.is_empty() && cleaned.is_lossless() {
        log::debug!("{}: nothing removed, left untouched", path.display());
        return Ok(());
    }
    if backup {
        pipeline::backup_file(path)?;
    }
    std::fs::write(path, &cleaned.bytes).with_context(|| format!("Failed to write {}", path.display()))
}

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

fn print_cleaned(filename: &str, cleaned: &CleanedImage, path: &Path) {
    let removed = if cleaned.removed.is_empty() {
        "nothing to remove".to_string()
    } else {
        let labels: Vec<&str> = cleaned.removed.iter().map(MetadataCategory::label).collect();
        format!("removed {}", labels.join(", "))
    };
    let mode = if cleaned.is_lossless() {
        String::new()
    } else {
        format!(" {YELLOW}(re-encoded){RESET}")
    };
    println!("  {GREEN}✓{RESET} {filename}: {removed}{mode} {DIM}→ {}{RESET}", path.display());
    for warning in &cleaned.warnings {
        println!("    {YELLOW}! {warning}{RESET}");
    }
}

fn print_failures<T>(report: &BatchReport<T>) {
    let failures: Vec<_> = report.failures().collect();
    if failures.is_empty() {
        return;
    }
    println!();
    println!("{BOLD}Failed:{RESET}");
    for failure in failures {
        println!("  {RED}✗{RESET} {}: {}", failure.filename, failure.reason.label());
        println!("    {DIM}{}{RESET}", failure.message);
    }
}

/// Print the metadata of one file, organized by section.
fn print_preview(file: &FileReport<MetadataSummary>) {
    let Some(summary) = file.success() else {
        return;
    };

    println!();
    let mut details = vec![summary.format.to_string()];
    if let Some(dim) = summary.dimensions {
        details.push(dim.to_string());
    }
    if let Some(mode) = &summary.color_mode {
        details.push(mode.clone());
    }
    if summary.frames > 1 {
        details.push(format!("{} frames", summary.frames));
    }
    println!("{BOLD}File:{RESET} {} {DIM}({}){RESET}", file.filename, details.join(", "));
    println!("{DIM}{}{RESET}", "═".repeat(72));

    if let Some(gps) = &summary.gps {
        println!("  {BOLD}{GREEN}Location{RESET}");
        println!("  {DIM}{}{RESET}", "─".repeat(70));
        print_highlighted("Latitude", &gps.latitude_dms());
        print_highlighted("Longitude", &gps.longitude_dms());
        print_highlighted("Decimal", &gps.decimal());
        if let Some(alt) = gps.altitude {
            print_highlighted("Altitude", &format!("{alt:.1} m"));
        }
        println!();
    }

    for category in MetadataCategory::ALL {
        match summary.category(category) {
            CategoryReport::Absent => {
                println!("  {BOLD}{}{RESET} {DIM}(none){RESET}", category.label());
            }
            CategoryReport::Present { entries } => {
                println!("  {BOLD}{}{RESET}", category.label());
                println!("  {DIM}{}{RESET}", "─".repeat(70));
                for entry in entries {
                    print_row(&entry.key, &entry.value);
                }
                println!();
            }
        }
    }

    for warning in &summary.warnings {
        println!("  {YELLOW}! {warning}{RESET}");
    }
}

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print a single row in the metadata table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Print a row in green.
fn print_highlighted(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    println!("  {GREEN}{tag_col} : {val}{RESET}");
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
