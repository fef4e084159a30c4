use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::files::{FileChange, FileOperation, merge_file_sets, parse_response, select_files};
use crate::generation::prompts::{EDIT_CONTRACT, edit_turn};
use crate::generation::{ChatMessage, CodeGenerator, GenerationOptions};
use crate::sandbox::SandboxProvider;
use crate::sandbox::workspace::{list_project_files, read_files, write_files};
use crate::session::{SessionId, SessionStore};
use crate::telemetry::timed_step;

const TOTAL_STEPS: usize = 6;
const SLOW_READ: Duration = Duration::from_secs(3);
const SLOW_GENERATE: Duration = Duration::from_secs(10);
const SLOW_WRITE: Duration = Duration::from_secs(2);

const FALLBACK_EXPLANATION: &str = "I've analyzed your request.";

/// A follow-up instruction against a running preview.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(default, alias = "conversationHistory")]
    pub history: Vec<ChatMessage>,
    /// When set, the session's stored file set is updated with the edit.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl EditRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.message.trim().is_empty() || self.sandbox_id.trim().is_empty() {
            return Err(PipelineError::validation("Missing message or sandboxId"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOutcome {
    pub explanation: String,
    /// Chat-ready reply: the explanation plus a change summary.
    pub message: String,
    pub files_updated: usize,
    pub updated_paths: Vec<String>,
    pub targeted_paths: Vec<String>,
}

/// Applies edit instructions to a live sandbox: targets a file subset,
/// asks for changes, and writes back only what came back.
pub struct EditOrchestrator {
    generator: Arc<dyn CodeGenerator>,
    provider: Arc<dyn SandboxProvider>,
    sessions: SessionStore,
    options: GenerationOptions,
}

impl EditOrchestrator {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        provider: Arc<dyn SandboxProvider>,
        sessions: SessionStore,
        options: GenerationOptions,
    ) -> Self {
        Self {
            generator,
            provider,
            sessions,
            options,
        }
    }

    pub async fn apply(&self, request: &EditRequest) -> Result<EditOutcome, PipelineError> {
        request.validate()?;
        let provider = self.provider.as_ref();
        let handle = provider.get(request.sandbox_id.trim()).await?;
        tracing::info!(sandbox_id = %handle.id, "Applying edit");

        let inventory = timed_step(1, TOTAL_STEPS, "List sandbox files", Some(SLOW_READ), async {
            list_project_files(provider, &handle).await
        })
        .await?;

        let selection = select_files(&request.message, &inventory);
        tracing::info!(
            step = 2,
            total = TOTAL_STEPS,
            selected = selection.paths.len(),
            inventory = inventory.len(),
            fallback = selection.fallback,
            categories = ?selection.categories,
            "[DONE] Target files"
        );

        let current = timed_step(3, TOTAL_STEPS, "Read targeted files", Some(SLOW_READ), async {
            Ok::<_, PipelineError>(read_files(provider, &handle, &selection.paths).await)
        })
        .await?;

        let mut conversation = request.history.clone();
        conversation.push(ChatMessage::user(edit_turn(&current, &request.message)));

        let generation = timed_step(4, TOTAL_STEPS, "Generate changes", Some(SLOW_GENERATE), async {
            self.generator
                .generate(&conversation, EDIT_CONTRACT, &self.options)
                .await
        })
        .await?;

        let parsed = parse_response(&generation.text);
        if !parsed.skipped.is_empty() {
            tracing::warn!(skipped = parsed.skipped.len(), "Ignored malformed file blocks in edit");
        }
        tracing::info!(step = 5, total = TOTAL_STEPS, files = parsed.files.len(), "[DONE] Parse response");

        let existing: HashSet<&str> = inventory.iter().map(String::as_str).collect();
        let changes: Vec<FileChange> = parsed
            .files
            .into_iter()
            .map(|mut file| {
                if file.operation != FileOperation::Delete {
                    file.operation = if existing.contains(file.path.as_str()) {
                        FileOperation::Edit
                    } else {
                        FileOperation::Create
                    };
                }
                file
            })
            .collect();

        let updated_paths = if changes.is_empty() {
            Vec::new()
        } else {
            timed_step(6, TOTAL_STEPS, "Write files", Some(SLOW_WRITE), async {
                write_files(provider, &handle, &changes).await
            })
            .await?
        };

        if let Some(session) = &request.session_id
            && !changes.is_empty()
        {
            let base = self.sessions.files(session).unwrap_or_default();
            self.sessions
                .put_files(session, merge_file_sets(&base, &changes));
        }

        let explanation = parsed
            .explanation
            .unwrap_or_else(|| FALLBACK_EXPLANATION.to_string());
        let message = if updated_paths.is_empty() {
            explanation.clone()
        } else {
            format!(
                "{}\n\n✅ Updated {} file(s). Changes will appear in the preview momentarily via hot reload.",
                explanation,
                updated_paths.len()
            )
        };

        Ok(EditOutcome {
            explanation,
            message,
            files_updated: updated_paths.len(),
            updated_paths,
            targeted_paths: selection.paths,
        })
    }
}
