//! Zip packaging of a project file set for download and archive-based deploys.

use std::io::{Cursor, Read, Write};

use anyhow::Context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::model::{FileChange, merge_file_sets, sanitize_relative_path};
use crate::errors::PipelineError;

/// Download name for a session's archive.
pub fn archive_file_name(session_id: &str) -> String {
    format!("shipwright-{}.zip", session_id)
}

/// Pack every materialized file into an in-memory zip. A path that occurs
/// more than once is written once, with its last content.
pub fn build_archive(files: &[FileChange]) -> Result<Vec<u8>, PipelineError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for file in &merge_file_sets(&[], files) {
        writer
            .start_file(file.path.as_str(), options)
            .with_context(|| format!("Failed to add {} to archive", file.path))?;
        writer
            .write_all(file.content.as_bytes())
            .with_context(|| format!("Failed to write {} to archive", file.path))?;
    }

    let cursor = writer.finish().context("Failed to finalize archive")?;
    Ok(cursor.into_inner())
}

/// Unpack a zip into a file set. Directory entries and entries whose names
/// escape the archive root are skipped; an entry that is not UTF-8 text
/// rejects the archive.
pub fn extract_archive(bytes: &[u8]) -> Result<Vec<FileChange>, PipelineError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::validation(format!("Invalid zip archive: {}", e)))?;

    let mut files = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PipelineError::validation(format!("Invalid zip entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }

        let path = match sanitize_relative_path(entry.name()) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(entry = entry.name(), error = %e, "Skipping unsafe archive entry");
                continue;
            }
        };
        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(|_| {
            PipelineError::validation(format!("Archive entry {} is not UTF-8 text", path))
        })?;
        files.push(FileChange::create(path, content));
    }

    Ok(files)
}
