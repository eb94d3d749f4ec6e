// src/replay.rs
//
// Offline track replay. Tracker exports are JSONL files (one TrackUpdate
// per line) under a directory, typically one file per camera or recording
// session. The replay merges all files into one stream sorted by timestamp
// so multi-camera recordings play back in a consistent order.

use crate::types::TrackUpdate;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Collect every .jsonl file under the directory, recursively.
pub fn find_track_files(input_dir: &str) -> Result<Vec<std::path::PathBuf>> {
    let root = Path::new(input_dir);
    if !root.is_dir() {
        anyhow::bail!("replay input directory '{}' does not exist", input_dir);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .map(|ext| ext == "jsonl")
                .unwrap_or(false)
        {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    info!("📂 Found {} track file(s) under '{}'", files.len(), input_dir);
    Ok(files)
}

/// Load and merge all track files into a single timestamp-sorted stream.
/// Malformed lines are skipped with a warning; one bad export must not
/// abort the replay.
pub fn load_updates(input_dir: &str) -> Result<Vec<TrackUpdate>> {
    let mut updates = Vec::new();

    for path in find_track_files(input_dir)? {
        let file = File::open(&path)
            .with_context(|| format!("opening track file {}", path.display()))?;
        let mut skipped = 0usize;

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrackUpdate>(&line) {
                Ok(update) => updates.push(update),
                Err(e) => {
                    skipped += 1;
                    warn!(
                        "Skipping malformed line {} in {}: {}",
                        lineno + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
        if skipped > 0 {
            warn!("{} malformed line(s) skipped in {}", skipped, path.display());
        }
    }

    // Stable sort: equal timestamps keep file order, and per-track order
    // within a file is preserved.
    updates.sort_by(|a, b| a.point.ts_ms.total_cmp(&b.point.ts_ms));
    info!("▶️  Replaying {} track update(s)", updates.len());
    Ok(updates)
}
