//! Project-level file operations on a live sandbox.

use std::collections::VecDeque;
use std::time::Instant;

use super::{SandboxHandle, SandboxProvider, shell_quote};
use crate::errors::PipelineError;
use crate::files::{FileChange, sanitize_relative_path};

const SKIPPED_DIRS: &[&str] = &["node_modules", ".next", ".git"];
const SKIPPED_FILES: &[&str] = &["package-lock.json"];

fn is_listed_file(name: &str) -> bool {
    !name.ends_with(".log") && !SKIPPED_FILES.contains(&name)
}

/// Every project file under the sandbox root, relative to it, breadth-first.
/// Dependency, build and VCS directories, logs and the lockfile are skipped.
pub async fn list_project_files(
    provider: &dyn SandboxProvider,
    handle: &SandboxHandle,
) -> Result<Vec<String>, PipelineError> {
    let mut files = Vec::new();
    let mut pending = VecDeque::from([String::new()]);

    while let Some(dir) = pending.pop_front() {
        for entry in provider.list_dir(handle, &dir).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };
            if entry.is_dir {
                if !SKIPPED_DIRS.contains(&entry.name.as_str()) {
                    pending.push_back(path);
                }
            } else if is_listed_file(&entry.name) {
                files.push(path);
            }
        }
    }

    Ok(files)
}

/// Read `paths` from the sandbox. Unreadable files are logged and skipped so
/// one bad path does not block an edit.
pub async fn read_files(
    provider: &dyn SandboxProvider,
    handle: &SandboxHandle,
    paths: &[String],
) -> Vec<FileChange> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let started = Instant::now();
        match provider.download(handle, path).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).into_owned();
                tracing::debug!(
                    %path,
                    size_kb = format!("{:.1}", content.len() as f64 / 1024.0),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Read file"
                );
                files.push(FileChange::create(path.clone(), content));
            }
            Err(e) => {
                tracing::warn!(
                    %path,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Failed to read file, skipping"
                );
            }
        }
    }
    files
}

/// Write files into the sandbox as one batch.
///
/// Every path is sanitized before the first upload, so a bad path rejects
/// the batch without touching anything. Prior contents are captured first;
/// if an upload fails, files already written in this call are restored
/// (or removed when they did not exist) before the error is returned.
/// Returns the written paths. `Delete` entries are ignored.
pub async fn write_files(
    provider: &dyn SandboxProvider,
    handle: &SandboxHandle,
    files: &[FileChange],
) -> Result<Vec<String>, PipelineError> {
    let mut batch = Vec::with_capacity(files.len());
    for file in files.iter().filter(|f| f.is_materialized()) {
        batch.push((sanitize_relative_path(&file.path)?, file.content.as_bytes()));
    }

    let mut previous = Vec::with_capacity(batch.len());
    for (path, _) in &batch {
        previous.push(provider.download(handle, path).await.ok());
    }

    let mut written: Vec<String> = Vec::with_capacity(batch.len());
    for (path, content) in &batch {
        if let Err(e) = provider.upload(handle, path, content).await {
            tracing::warn!(sandbox_id = %handle.id, %path, error = %e, "Upload failed, rolling back batch");
            roll_back(provider, handle, &written, &previous).await;
            return Err(e);
        }
        tracing::debug!(sandbox_id = %handle.id, %path, bytes = content.len(), "Wrote file");
        written.push(path.clone());
    }
    Ok(written)
}

/// Undo the first `written.len()` uploads of a batch. Best effort: failures
/// are logged, the original upload error is what the caller sees.
async fn roll_back(
    provider: &dyn SandboxProvider,
    handle: &SandboxHandle,
    written: &[String],
    previous: &[Option<Vec<u8>>],
) {
    let mut created = Vec::new();
    for (path, prior) in written.iter().zip(previous) {
        match prior {
            Some(bytes) => {
                if let Err(e) = provider.upload(handle, path, bytes).await {
                    tracing::warn!(sandbox_id = %handle.id, %path, error = %e, "Failed to restore file");
                }
            }
            None => created.push(shell_quote(path)),
        }
    }
    if created.is_empty() {
        return;
    }
    let command = format!("rm -f -- {}", created.join(" "));
    match provider.exec(handle, &command, &[], None).await {
        Ok(out) if out.success() => {}
        Ok(out) => {
            tracing::warn!(sandbox_id = %handle.id, exit_code = out.exit_code, "Failed to remove new files")
        }
        Err(e) => tracing::warn!(sandbox_id = %handle.id, error = %e, "Failed to remove new files"),
    }
}
