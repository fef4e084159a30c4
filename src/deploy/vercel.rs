//! Vercel project + deployment client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{DeploymentState, HostedDeployment, HostingPlatform, PublishedRepo};
use crate::config::DeploySection;
use crate::errors::PipelineError;

const VERCEL_API_URL: &str = "https://api.vercel.com";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProject<'a> {
    name: &'a str,
    framework: &'a str,
    git_repository: GitRepository<'a>,
    public_source: bool,
    build_command: &'a str,
    dev_command: &'a str,
    install_command: &'a str,
    output_directory: &'a str,
}

#[derive(Serialize)]
struct GitRepository<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    repo: &'a str,
}

#[derive(Deserialize)]
struct Project {
    id: String,
    #[serde(default)]
    link: Option<ProjectLink>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectLink {
    #[serde(default)]
    repo_id: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CreateDeployment<'a> {
    name: &'a str,
    project: &'a str,
    #[serde(rename = "gitSource")]
    git_source: GitSource<'a>,
    target: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GitSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "ref")]
    git_ref: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo_id: Option<&'a serde_json::Value>,
    repo: &'a str,
}

#[derive(Deserialize)]
struct Deployment {
    id: String,
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    ready_state: Option<String>,
}

pub struct VercelClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    team_id: Option<String>,
    config: DeploySection,
}

impl VercelClient {
    pub fn new(
        token: Option<String>,
        team_id: Option<String>,
        config: DeploySection,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for Vercel")?;
        Ok(Self {
            http,
            api_url: VERCEL_API_URL.to_string(),
            token,
            team_id,
            config,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn token(&self) -> Result<&str, PipelineError> {
        self.token
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("VERCEL_TOKEN".to_string()))
    }

    fn url(&self, path: &str) -> String {
        match &self.team_id {
            Some(team) => format!("{}{}?teamId={}", self.api_url, path, team),
            None => format!("{}{}", self.api_url, path),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, PipelineError> {
        let resp = request
            .bearer_auth(self.token()?)
            .send()
            .await
            .with_context(|| format!("Vercel request failed: {}", what))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream {
                service: "Vercel",
                status: status.as_u16(),
                body,
            });
        }
        let parsed = resp
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse Vercel response: {}", what))?;
        Ok(parsed)
    }

    /// Poll until the deployment reaches a terminal state. Status reads that
    /// fail are ignored; the attempt still counts.
    async fn wait_until_ready(&self, deployment_id: &str) -> Result<(), PipelineError> {
        let url = self.url(&format!("/v13/deployments/{}", deployment_id));
        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;

            let status: DeploymentStatus =
                match self.call(self.http.get(&url), "get deployment status").await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::debug!(deployment_id, attempt, error = %e, "Status poll failed");
                        continue;
                    }
                };

            let state = status.ready_state.unwrap_or_default();
            tracing::debug!(deployment_id, attempt, state = %state, "Deployment state");
            match state.as_str() {
                "READY" => return Ok(()),
                "ERROR" | "CANCELED" => {
                    return Err(PipelineError::Other(anyhow::anyhow!(
                        "Deployment failed with state: {}",
                        state
                    )));
                }
                _ => {}
            }
        }
        Err(PipelineError::Timeout {
            operation: "Vercel deployment",
            attempts: self.config.poll_attempts,
        })
    }
}

#[async_trait]
impl HostingPlatform for VercelClient {
    fn name(&self) -> &'static str {
        "vercel"
    }

    async fn deploy(
        &self,
        project_name: &str,
        repo: &PublishedRepo,
    ) -> Result<HostedDeployment, PipelineError> {
        let full_name = repo.full_name();

        let project: Project = self
            .call(
                self.http.post(self.url("/v9/projects")).json(&CreateProject {
                    name: project_name,
                    framework: &self.config.framework,
                    git_repository: GitRepository {
                        kind: "github",
                        repo: &full_name,
                    },
                    public_source: true,
                    build_command: &self.config.build_command,
                    dev_command: &self.config.dev_command,
                    install_command: &self.config.install_command,
                    output_directory: &self.config.output_directory,
                }),
                "create project",
            )
            .await?;
        tracing::info!(project_id = %project.id, repo = %full_name, "Vercel project created");

        let repo_id = project.link.as_ref().and_then(|l| l.repo_id.as_ref());
        let deployment: Deployment = self
            .call(
                self.http
                    .post(self.url("/v13/deployments"))
                    .json(&CreateDeployment {
                        name: project_name,
                        project: &project.id,
                        git_source: GitSource {
                            kind: "github",
                            git_ref: &self.config.branch,
                            repo_id,
                            repo: &full_name,
                        },
                        target: "production",
                    }),
                "trigger deployment",
            )
            .await?;
        let url = format!("https://{}", deployment.url);
        tracing::info!(deployment_id = %deployment.id, %url, "Deployment triggered");

        let state = match self.wait_until_ready(&deployment.id).await {
            Ok(()) => DeploymentState::Ready,
            Err(PipelineError::Timeout { attempts, .. }) => {
                tracing::warn!(deployment_id = %deployment.id, attempts, "Deployment still in progress");
                DeploymentState::Pending
            }
            Err(e) => return Err(e),
        };

        Ok(HostedDeployment {
            project_id: project.id,
            deployment_id: deployment.id,
            url,
            state,
        })
    }
}
