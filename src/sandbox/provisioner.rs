//! Sandbox bring-up: create, upload, install, start, health-check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::health::{HealthSignal, ProbeResult, ReachabilityProbe, classify_server_log};
use super::{ProvisionStage, SandboxHandle, SandboxProvider, workspace};
use crate::config::SandboxSection;
use crate::errors::PipelineError;
use crate::files::FileChange;
use crate::telemetry::format_duration;

/// How the dev server was judged healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthOutcome {
    /// Loopback probe or a ready marker in the log.
    Confirmed,
    /// No marker either way within the attempt limit.
    AssumedHealthy,
}

#[derive(Debug, Clone)]
pub struct ProvisionedSandbox {
    pub handle: SandboxHandle,
    pub preview_url: String,
    pub health: HealthOutcome,
    /// Whether the preview URL answered from outside the sandbox.
    pub externally_reachable: bool,
}

/// Tracks the current stage and refuses to move anywhere the state machine
/// does not allow.
struct StageTracker {
    stage: ProvisionStage,
    entered: Instant,
}

impl StageTracker {
    fn new() -> Self {
        tracing::debug!(stage = %ProvisionStage::Creating, "Provisioning stage");
        Self {
            stage: ProvisionStage::Creating,
            entered: Instant::now(),
        }
    }

    fn advance(&mut self, next: ProvisionStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {}",
            self.stage,
            next
        );
        tracing::debug!(
            from = %self.stage,
            stage = %next,
            elapsed_ms = self.entered.elapsed().as_millis() as u64,
            "Provisioning stage"
        );
        self.stage = next;
        self.entered = Instant::now();
    }

    /// Wrap `err` with the current stage unless it is already a
    /// provisioning or configuration error.
    fn fail(&mut self, err: PipelineError) -> PipelineError {
        let stage = self.stage;
        self.advance(ProvisionStage::Failed);
        match err {
            PipelineError::Provisioning { .. } | PipelineError::Configuration(_) => err,
            other => PipelineError::provisioning(stage, other.to_string()),
        }
    }
}

pub struct Provisioner {
    provider: Arc<dyn SandboxProvider>,
    probe: Arc<dyn ReachabilityProbe>,
    config: SandboxSection,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        probe: Arc<dyn ReachabilityProbe>,
        config: SandboxSection,
    ) -> Self {
        Self {
            provider,
            probe,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Bring up a sandbox running `files`. Human-readable progress goes to
    /// `reporter`. Any failure after the sandbox exists deletes it before
    /// the error is returned.
    pub async fn provision(
        &self,
        files: &[FileChange],
        reporter: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<ProvisionedSandbox, PipelineError> {
        let started = Instant::now();
        let mut tracker = StageTracker::new();

        reporter("Creating sandbox...");
        let handle = match self.provider.create(&self.config.image).await {
            Ok(handle) => handle,
            Err(e) => return Err(tracker.fail(e)),
        };
        tracing::info!(sandbox_id = %handle.id, provider = self.provider.name(), "Sandbox created");

        match self.bring_up(&handle, files, reporter, &mut tracker).await {
            Ok(provisioned) => {
                tracing::info!(
                    sandbox_id = %handle.id,
                    health = ?provisioned.health,
                    externally_reachable = provisioned.externally_reachable,
                    elapsed = %format_duration(started.elapsed()),
                    "Sandbox ready"
                );
                Ok(provisioned)
            }
            Err(e) => {
                let err = tracker.fail(e);
                tracing::error!(sandbox_id = %handle.id, error = %err, "Provisioning failed, deleting sandbox");
                if let Err(cleanup) = self.provider.delete(&handle.id).await {
                    tracing::error!(sandbox_id = %handle.id, error = %cleanup, "Failed to delete sandbox after failure");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        handle: &SandboxHandle,
        files: &[FileChange],
        reporter: &(dyn Fn(&str) + Send + Sync),
        tracker: &mut StageTracker,
    ) -> Result<ProvisionedSandbox, PipelineError> {
        let provider = self.provider.as_ref();

        tracker.advance(ProvisionStage::Uploading);
        reporter("Uploading files to sandbox...");
        let written = workspace::write_files(provider, handle, files).await?;
        tracing::info!(sandbox_id = %handle.id, files = written.len(), "Files uploaded");
        reporter("Files uploaded");

        tracker.advance(ProvisionStage::Installing);
        reporter("Installing dependencies...");
        let install = provider
            .exec(
                handle,
                &self.config.install_command,
                &[],
                Some(self.config.install_timeout()),
            )
            .await?;
        if !install.success() {
            return Err(PipelineError::provisioning(
                ProvisionStage::Installing,
                format!(
                    "{} failed: {}",
                    self.config.install_command,
                    install.output.trim()
                ),
            ));
        }
        reporter("Dependencies installed");

        tracker.advance(ProvisionStage::Starting);
        reporter("Starting dev server...");
        let port = self.config.port.to_string();
        let launch = format!(
            "nohup {} > {} 2>&1 &",
            self.config.dev_command, self.config.log_file
        );
        provider
            .exec(handle, &launch, &[("PORT", port.as_str())], None)
            .await?;

        tracker.advance(ProvisionStage::HealthChecking);
        reporter("Waiting for server to start...");
        tokio::time::sleep(self.config.settle_delay()).await;
        let health = self.wait_for_server(handle, reporter).await?;

        tracker.advance(ProvisionStage::Ready);
        let preview_url = provider.preview_url(handle, self.config.port).await?;
        let externally_reachable = self.wait_for_preview(&preview_url, reporter).await;
        if !externally_reachable {
            reporter("Server taking longer than expected...");
        }

        let mut handle = handle.clone();
        handle.preview_url = Some(preview_url.clone());
        Ok(ProvisionedSandbox {
            handle,
            preview_url,
            health,
            externally_reachable,
        })
    }

    /// Poll the loopback port and the server log until one of them gives a
    /// definite answer or the attempt limit runs out.
    async fn wait_for_server(
        &self,
        handle: &SandboxHandle,
        reporter: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<HealthOutcome, PipelineError> {
        let provider = self.provider.as_ref();
        let curl = format!(
            "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{} || echo 'failed'",
            self.config.port
        );
        let read_log = format!("cat {} 2>/dev/null || true", self.config.log_file);

        for attempt in 1..=self.config.health_attempts {
            let status = provider.exec(handle, &curl, &[], None).await?;
            if let Ok(code) = status.output.trim().parse::<u16>()
                && ProbeResult::from_status(code).is_healthy()
            {
                tracing::debug!(sandbox_id = %handle.id, attempt, status = code, "Loopback probe healthy");
                reporter("Server started successfully!");
                return Ok(HealthOutcome::Confirmed);
            }

            let log = provider.exec(handle, &read_log, &[], None).await?;
            match classify_server_log(&log.output) {
                HealthSignal::Ready => {
                    tracing::debug!(sandbox_id = %handle.id, attempt, "Ready marker in server log");
                    reporter("Server is running!");
                    return Ok(HealthOutcome::Confirmed);
                }
                HealthSignal::Fatal(line) => {
                    return Err(PipelineError::provisioning(
                        ProvisionStage::HealthChecking,
                        format!("Server failed to start: {}", line),
                    ));
                }
                HealthSignal::Ambiguous => {
                    tracing::debug!(sandbox_id = %handle.id, attempt, "No health marker yet");
                }
            }

            if attempt % 5 == 0 {
                let waited = self.config.health_interval() * attempt;
                reporter(&format!("Still waiting for server... ({}s)", waited.as_secs()));
            }
            if attempt < self.config.health_attempts {
                tokio::time::sleep(self.config.health_interval()).await;
            }
        }

        tracing::warn!(
            sandbox_id = %handle.id,
            attempts = self.config.health_attempts,
            "Server gave no health signal, proceeding"
        );
        reporter("Server status unclear, trying preview...");
        Ok(HealthOutcome::AssumedHealthy)
    }

    async fn wait_for_preview(&self, url: &str, reporter: &(dyn Fn(&str) + Send + Sync)) -> bool {
        for attempt in 1..=self.config.probe_attempts {
            match self.probe.probe(url).await {
                ProbeResult::Healthy { status } => {
                    tracing::debug!(%url, attempt, status, "Preview reachable");
                    return true;
                }
                other => {
                    tracing::debug!(%url, attempt, result = ?other, "Preview not reachable yet");
                }
            }
            if attempt % 5 == 0 {
                let waited: Duration = self.config.health_interval() * attempt;
                reporter(&format!("Still waiting for server... ({}s)", waited.as_secs()));
            }
            if attempt < self.config.probe_attempts {
                tokio::time::sleep(self.config.health_interval()).await;
            }
        }
        tracing::warn!(%url, attempts = self.config.probe_attempts, "Preview never became reachable");
        false
    }
}
