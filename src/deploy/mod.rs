//! Two-phase deployment of a session's files.
//!
//! Phase A publishes the files as a fresh repository on a [`SourceHost`].
//! Phase B, attempted only after A succeeds, asks a [`HostingPlatform`] to
//! build and serve that repository. A Phase B failure still reports the
//! repository so the caller can present a partial success.

pub mod github;
pub mod vercel;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeploySection;
use crate::errors::PipelineError;
use crate::files::{FileChange, FileOperation};
use crate::session::{SessionId, SessionStore};
use crate::util::slugify;

pub use github::{GitHubClient, is_valid_github_token};
pub use vercel::VercelClient;

pub const MAX_COMMIT_MESSAGE_CHARS: usize = 500;
const MAX_PROJECT_SLUG: usize = 50;

/// What to create on the source host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub name: String,
    pub description: String,
    pub commit_message: String,
    pub branch: String,
    pub private: bool,
}

/// A repository with the deployed files committed on its branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedRepo {
    pub owner: String,
    pub name: String,
    pub html_url: String,
    pub clone_url: String,
    pub default_branch: String,
    pub commit_sha: String,
}

impl PublishedRepo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// The platform reported the deployment as serving.
    Ready,
    /// Polling ran out before a terminal state; the URL is already assigned.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedDeployment {
    pub project_id: String,
    pub deployment_id: String,
    pub url: String,
    pub state: DeploymentState,
}

/// Phase A collaborator.
#[async_trait]
pub trait SourceHost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the repository and commit `files` onto `spec.branch`. Steps are
    /// not retried; a repository created before a later step fails is left
    /// in place.
    async fn publish(
        &self,
        spec: &RepoSpec,
        files: &[FileChange],
    ) -> Result<PublishedRepo, PipelineError>;
}

/// Phase B collaborator.
#[async_trait]
pub trait HostingPlatform: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deploy(
        &self,
        project_name: &str,
        repo: &PublishedRepo,
    ) -> Result<HostedDeployment, PipelineError>;
}

/// Caller input for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub commit_message: Option<String>,
    /// Prompt the project was built from; used to derive a name.
    pub project_prompt: Option<String>,
    /// Explicit project name; wins over the prompt.
    pub project_name: Option<String>,
}

impl DeployRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(message) = &self.commit_message
            && message.chars().count() > MAX_COMMIT_MESSAGE_CHARS
        {
            return Err(PipelineError::validation(format!(
                "Commit message exceeds {} characters",
                MAX_COMMIT_MESSAGE_CHARS
            )));
        }
        Ok(())
    }

    fn project(&self) -> String {
        self.project_name
            .as_deref()
            .map(|name| slugify(name, MAX_PROJECT_SLUG))
            .filter(|slug| !slug.is_empty())
            .unwrap_or_else(|| project_name_from_prompt(self.project_prompt.as_deref().unwrap_or("")))
    }
}

/// Outcome of one deployment. Provider failures land here rather than in an
/// `Err` so a partial result keeps the repository link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_state: Option<DeploymentState>,
    pub files_deployed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentResult {
    /// True when the repository exists but hosting did not succeed.
    pub fn is_partial(&self) -> bool {
        !self.success && self.github_url.is_some()
    }
}

/// Name a project after the first three meaningful words of its prompt.
pub fn project_name_from_prompt(prompt: &str) -> String {
    let cleaned: String = prompt
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .take(3)
        .collect();
    if words.is_empty() {
        "project".to_string()
    } else {
        words.join("-")
    }
}

/// `<prefix>-<project>-<timestamp_ms>`; the timestamp keeps names unique.
pub fn repo_name(prefix: &str, project: &str, timestamp_ms: i64) -> String {
    let project = slugify(project, MAX_PROJECT_SLUG);
    let project = if project.is_empty() { "project" } else { project.as_str() };
    match slugify(prefix, MAX_PROJECT_SLUG) {
        p if p.is_empty() => format!("{}-{}", project, timestamp_ms),
        p => format!("{}-{}-{}", p, project, timestamp_ms),
    }
}

pub struct DeploymentOrchestrator {
    sessions: SessionStore,
    source: Arc<dyn SourceHost>,
    hosting: Arc<dyn HostingPlatform>,
    config: DeploySection,
}

impl DeploymentOrchestrator {
    pub fn new(
        sessions: SessionStore,
        source: Arc<dyn SourceHost>,
        hosting: Arc<dyn HostingPlatform>,
        config: DeploySection,
    ) -> Self {
        Self {
            sessions,
            source,
            hosting,
            config,
        }
    }

    /// Deploy the file set stored for `session`. `Err` only for bad input or
    /// a session without files.
    pub async fn deploy(
        &self,
        session: &SessionId,
        request: &DeployRequest,
    ) -> Result<DeploymentResult, PipelineError> {
        request.validate()?;
        let files = self
            .sessions
            .files(session)
            .filter(|files| !files.is_empty())
            .ok_or_else(|| {
                PipelineError::not_found(
                    "No files found for this session. Make sure the app was built successfully.",
                )
            })?;
        tracing::info!(session_id = %session, files = files.len(), "Deploying session files");
        self.deploy_files(&files, request).await
    }

    /// Deploy an explicit file set.
    pub async fn deploy_files(
        &self,
        files: &[FileChange],
        request: &DeployRequest,
    ) -> Result<DeploymentResult, PipelineError> {
        request.validate()?;
        let files: Vec<FileChange> = files
            .iter()
            .filter(|f| f.operation != FileOperation::Delete)
            .cloned()
            .collect();
        if files.is_empty() {
            return Err(PipelineError::validation("No files to deploy"));
        }

        let project = request.project();
        let spec = RepoSpec {
            name: repo_name(
                &self.config.repo_prefix,
                &project,
                chrono::Utc::now().timestamp_millis(),
            ),
            description: format!("Shipwright generated project: {}", project),
            commit_message: request
                .commit_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("Initial commit: {}\n\nGenerated by Shipwright", project)),
            branch: self.config.branch.clone(),
            private: self.config.private_repo,
        };

        let outcome = self.run_phases(&spec, &files).await;
        Ok(fold_outcome(outcome, files.len()))
    }

    async fn run_phases(
        &self,
        spec: &RepoSpec,
        files: &[FileChange],
    ) -> Result<(PublishedRepo, HostedDeployment), PipelineError> {
        tracing::info!(repo = %spec.name, host = self.source.name(), "Phase A: publishing repository");
        let repo = self.source.publish(spec, files).await?;
        tracing::info!(repo = %repo.full_name(), url = %repo.html_url, "Repository published");

        tracing::info!(repo = %repo.full_name(), platform = self.hosting.name(), "Phase B: hosting deployment");
        match self.hosting.deploy(&repo.name, &repo).await {
            Ok(hosted) => {
                tracing::info!(url = %hosted.url, state = ?hosted.state, "Deployment finished");
                Ok((repo, hosted))
            }
            Err(e) => Err(PipelineError::PartialDeployment {
                repo_url: repo.html_url,
                repo_name: repo.name,
                message: e.to_string(),
            }),
        }
    }
}

fn fold_outcome(
    outcome: Result<(PublishedRepo, HostedDeployment), PipelineError>,
    files_deployed: usize,
) -> DeploymentResult {
    match outcome {
        Ok((repo, hosted)) => DeploymentResult {
            success: true,
            message: Some(match hosted.state {
                DeploymentState::Ready => "Deployment complete".to_string(),
                DeploymentState::Pending => {
                    "Deployment is still in progress; the URL will serve once it finishes".to_string()
                }
            }),
            deployment_url: Some(hosted.url),
            github_url: Some(repo.html_url),
            repo_name: Some(repo.name),
            deployment_state: Some(hosted.state),
            files_deployed,
            error: None,
        },
        Err(PipelineError::PartialDeployment {
            repo_url,
            repo_name,
            message,
        }) => {
            tracing::warn!(repo = %repo_name, error = %message, "Hosting deployment failed after repository was created");
            DeploymentResult {
                success: false,
                github_url: Some(repo_url),
                repo_name: Some(repo_name),
                files_deployed,
                error: Some(message),
                ..Default::default()
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Repository publishing failed");
            DeploymentResult {
                success: false,
                files_deployed,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}
