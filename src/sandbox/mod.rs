//! Ephemeral execution sandboxes for generated projects.
//!
//! [`SandboxProvider`] is the seam to the control plane (Daytona in
//! production, local directories in development). [`Provisioner`] drives a
//! provider through the bring-up state machine:
//!
//! ```text
//! creating → uploading → installing → starting → health-checking → ready
//!     └──────────┴────────────┴───────────┴──────────────┴──────→ failed
//! ```
//!
//! Every failure after `creating` deletes the sandbox before the error is
//! returned.

pub mod daytona;
pub mod health;
pub mod local;
pub mod provisioner;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{SandboxProviderKind, SandboxSection, Secrets};
use crate::errors::PipelineError;

pub use daytona::DaytonaClient;
pub use health::{HealthSignal, HttpProbe, ProbeResult, ReachabilityProbe, classify_server_log};
pub use local::LocalSandbox;
pub use provisioner::{HealthOutcome, ProvisionedSandbox, Provisioner};

/// Quote for POSIX `sh` inside single quotes.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A live sandbox. `root_dir` is the absolute project directory inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub id: String,
    pub root_dir: String,
    /// Set once the sandbox has been provisioned and a preview link obtained.
    pub preview_url: Option<String>,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, root_dir: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root_dir: root_dir.into(),
            preview_url: None,
        }
    }
}

/// Result of a command run inside a sandbox; `output` is combined stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One directory entry as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Control-plane operations the pipeline needs from a sandbox backend.
///
/// Paths passed to `upload`, `list_dir` and `download` are relative to the
/// handle's root directory and already sanitized.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, image: &str) -> Result<SandboxHandle, PipelineError>;

    async fn get(&self, id: &str) -> Result<SandboxHandle, PipelineError>;

    async fn upload(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), PipelineError>;

    /// Run `command` through a shell in the project root.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        env: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, PipelineError>;

    /// Immediate children of `dir` (`""` for the root).
    async fn list_dir(
        &self,
        handle: &SandboxHandle,
        dir: &str,
    ) -> Result<Vec<RemoteEntry>, PipelineError>;

    async fn download(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, PipelineError>;

    /// Externally reachable URL for `port`.
    async fn preview_url(&self, handle: &SandboxHandle, port: u16) -> Result<String, PipelineError>;

    async fn delete(&self, id: &str) -> Result<(), PipelineError>;

    async fn list_ids(&self) -> Result<Vec<String>, PipelineError>;
}

/// Where a provisioning run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionStage {
    Creating,
    Uploading,
    Installing,
    Starting,
    HealthChecking,
    Ready,
    Failed,
}

impl ProvisionStage {
    fn ordinal(self) -> Option<u8> {
        match self {
            ProvisionStage::Creating => Some(0),
            ProvisionStage::Uploading => Some(1),
            ProvisionStage::Installing => Some(2),
            ProvisionStage::Starting => Some(3),
            ProvisionStage::HealthChecking => Some(4),
            ProvisionStage::Ready => Some(5),
            ProvisionStage::Failed => None,
        }
    }

    /// Strictly forward, one step at a time; `Failed` is reachable from any
    /// other stage and is terminal.
    pub fn can_advance_to(self, next: ProvisionStage) -> bool {
        match (self.ordinal(), next.ordinal()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to == from + 1,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisionStage::Ready | ProvisionStage::Failed)
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProvisionStage::Creating => "creating",
            ProvisionStage::Uploading => "uploading",
            ProvisionStage::Installing => "installing",
            ProvisionStage::Starting => "starting",
            ProvisionStage::HealthChecking => "health-checking",
            ProvisionStage::Ready => "ready",
            ProvisionStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of deleting every sandbox a provider knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Delete every sandbox visible to `provider`. Individual failures are
/// logged and reported, not fatal.
pub async fn delete_all(provider: &dyn SandboxProvider) -> Result<CleanupReport, PipelineError> {
    let ids = provider.list_ids().await?;
    let mut report = CleanupReport::default();

    for id in ids {
        match provider.delete(&id).await {
            Ok(()) => report.deleted.push(id),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to delete sandbox");
                report.failed.push(id);
            }
        }
    }

    tracing::info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        provider = provider.name(),
        "Sandbox cleanup finished"
    );
    Ok(report)
}

/// Build the provider selected in configuration.
pub fn provider_from_config(
    config: &SandboxSection,
    secrets: &Secrets,
) -> anyhow::Result<Arc<dyn SandboxProvider>> {
    let provider: Arc<dyn SandboxProvider> = match config.provider {
        SandboxProviderKind::Daytona => Arc::new(DaytonaClient::new(
            secrets.daytona_api_url.clone(),
            secrets.daytona_api_key.clone(),
            secrets.daytona_target.clone(),
        )?),
        SandboxProviderKind::Local => Arc::new(LocalSandbox::new(config.local_root.clone())),
    };
    Ok(provider)
}
