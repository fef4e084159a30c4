//! Directory-backed sandboxes for development without a control plane.
//!
//! Each sandbox is a directory under the configured root. Commands run with
//! `sh -c` in that directory; there is no isolation beyond that. Every
//! command gets its own process group, recorded next to the sandbox
//! directory, so `delete` can stop servers that were started in the
//! background.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use super::{ExecOutput, RemoteEntry, SandboxHandle, SandboxProvider};
use crate::errors::PipelineError;

const ID_PREFIX: &str = "local-";

pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, id: &str) -> Result<PathBuf, PipelineError> {
        let valid = id.starts_with(ID_PREFIX)
            && id[ID_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(PipelineError::validation(format!(
                "Invalid local sandbox id: {}",
                id
            )));
        }
        Ok(self.root.join(id))
    }

    fn handle_for(&self, id: &str, dir: &Path) -> SandboxHandle {
        SandboxHandle::new(id, dir.to_string_lossy())
    }

    /// Outside the sandbox directory so it never shows up as a project file.
    fn groups_file(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{}.pgids", id))
    }

    async fn record_group(&self, id: &str, pgid: u32) -> Result<(), PipelineError> {
        use tokio::io::AsyncWriteExt;

        let path = self.groups_file(id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(format!("{}\n", pgid).as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn stop_groups(&self, id: &str) {
        let path = self.groups_file(id);
        let Ok(recorded) = tokio::fs::read_to_string(&path).await else {
            return;
        };
        for pgid in recorded.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
            kill_process_group(pgid);
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(sandbox_id = %id, error = %e, "Failed to remove process group record");
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    if pgid == 0 {
        return;
    }
    let res = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if res != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone is the common case.
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[async_trait]
impl SandboxProvider for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, image: &str) -> Result<SandboxHandle, PipelineError> {
        let id = format!("{}{}", ID_PREFIX, uuid::Uuid::new_v4().simple());
        let dir = self.dir_for(&id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        tracing::info!(sandbox_id = %id, image, dir = %dir.display(), "Local sandbox created (image ignored)");
        Ok(self.handle_for(&id, &dir))
    }

    async fn get(&self, id: &str) -> Result<SandboxHandle, PipelineError> {
        let dir = self.dir_for(id)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(PipelineError::not_found(format!("Sandbox {} not found", id)));
        }
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        Ok(self.handle_for(id, &dir))
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), PipelineError> {
        let target = Path::new(&handle.root_dir).join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        env: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, PipelineError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&handle.root_dir)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to run: {}", command))?;
        let pgid = child.id().unwrap_or(0);
        self.record_group(&handle.id, pgid).await?;

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    kill_process_group(pgid);
                    return Err(PipelineError::Other(anyhow::anyhow!(
                        "Command timed out after {:?}: {}",
                        limit,
                        command
                    )));
                }
            },
            None => child.wait_with_output().await,
        }
        .with_context(|| format!("Failed to run: {}", command))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn list_dir(
        &self,
        handle: &SandboxHandle,
        dir: &str,
    ) -> Result<Vec<RemoteEntry>, PipelineError> {
        let full = Path::new(&handle.root_dir).join(dir);
        let mut reader = tokio::fs::read_dir(&full)
            .await
            .with_context(|| format!("Failed to list {}", full.display()))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", full.display()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn download(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, PipelineError> {
        let full = Path::new(&handle.root_dir).join(path);
        let bytes = tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))?;
        Ok(bytes)
    }

    async fn preview_url(&self, _handle: &SandboxHandle, port: u16) -> Result<String, PipelineError> {
        Ok(format!("http://localhost:{}", port))
    }

    async fn delete(&self, id: &str) -> Result<(), PipelineError> {
        let dir = self.dir_for(id)?;
        self.stop_groups(id).await;
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
        tracing::info!(sandbox_id = %id, "Local sandbox deleted");
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, PipelineError> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut reader = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut ids = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .context("Failed to list local sandboxes")?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(ID_PREFIX) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
