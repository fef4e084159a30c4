use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::errors::PipelineError;
use crate::files::parse_response;
use crate::generation::prompts::BUILD_CONTRACT;
use crate::generation::{ChatMessage, CodeGenerator, GenerationOptions};
use crate::sandbox::{HealthOutcome, Provisioner, SandboxHandle};
use crate::session::{SessionId, SessionStore};
use crate::telemetry::format_duration;

/// A build that reached a running preview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub session_id: SessionId,
    pub preview_url: String,
    pub sandbox: SandboxHandle,
    pub files_generated: usize,
    pub health: HealthOutcome,
    pub externally_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

/// Drives generate → parse → provision for one session and narrates every
/// step into the session's progress log. Every run ends the log with exactly
/// one terminal event.
pub struct BuildOrchestrator {
    generator: Arc<dyn CodeGenerator>,
    provisioner: Arc<Provisioner>,
    sessions: SessionStore,
    options: GenerationOptions,
}

impl BuildOrchestrator {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        provisioner: Arc<Provisioner>,
        sessions: SessionStore,
        options: GenerationOptions,
    ) -> Self {
        Self {
            generator,
            provisioner,
            sessions,
            options,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn admit(&self, session: &SessionId, prompt: &str) -> Result<(), PipelineError> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::validation("Missing prompt"));
        }
        self.sessions.open(session)
    }

    /// Validate and open the session, then run the build in the background.
    /// Errors here mean nothing was started.
    pub fn start(
        self: &Arc<Self>,
        session: SessionId,
        prompt: String,
    ) -> Result<JoinHandle<Result<BuildOutcome, PipelineError>>, PipelineError> {
        self.admit(&session, &prompt)?;
        tracing::info!(session_id = %session, "Build started");
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(&session, &prompt).await }))
    }

    /// Run a build to completion in the caller's task.
    pub async fn run(
        &self,
        session: &SessionId,
        prompt: &str,
    ) -> Result<BuildOutcome, PipelineError> {
        self.admit(session, prompt)?;
        self.execute(session, prompt).await
    }

    async fn execute(
        &self,
        session: &SessionId,
        prompt: &str,
    ) -> Result<BuildOutcome, PipelineError> {
        let started = Instant::now();
        let result = self.build(session, prompt).await;
        match &result {
            Ok(outcome) => {
                self.sessions
                    .append(session, format!("✅ Preview ready! {}", outcome.preview_url));
                self.sessions.complete(session, outcome.preview_url.clone());
                tracing::info!(
                    session_id = %session,
                    elapsed = %format_duration(started.elapsed()),
                    "Build complete"
                );
            }
            Err(e) => {
                self.sessions.append(session, format!("❌ {}", e));
                self.sessions.fail(session, e.to_string());
                tracing::error!(
                    session_id = %session,
                    error = %e,
                    elapsed = %format_duration(started.elapsed()),
                    "Build failed"
                );
            }
        }
        result
    }

    async fn build(&self, session: &SessionId, prompt: &str) -> Result<BuildOutcome, PipelineError> {
        self.sessions
            .append(session, "🧠 Calling Claude to generate code...");
        let generation = self
            .generator
            .generate(&[ChatMessage::user(prompt)], BUILD_CONTRACT, &self.options)
            .await?;

        let parsed = parse_response(&generation.text);
        if !parsed.skipped.is_empty() {
            self.sessions.append(
                session,
                format!("⚠️ Skipped {} malformed file block(s)", parsed.skipped.len()),
            );
        }

        // Stored before success is decided so a failed preview can still be
        // downloaded or deployed.
        let files = parsed.files;
        self.sessions.put_files(session, files.clone());
        if files.is_empty() {
            return Err(PipelineError::Other(anyhow::anyhow!("No files generated")));
        }
        self.sessions
            .append(session, format!("📝 Generated {} file(s)", files.len()));

        let report = |message: &str| {
            self.sessions.append(session, message);
        };
        let provisioned = self.provisioner.provision(&files, &report).await?;

        Ok(BuildOutcome {
            session_id: session.clone(),
            preview_url: provisioned.preview_url,
            sandbox: provisioned.handle,
            files_generated: files.len(),
            health: provisioned.health,
            externally_reachable: provisioned.externally_reachable,
            thinking: generation.thinking.or(parsed.thinking),
        })
    }
}
