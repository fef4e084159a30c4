use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{PublishedRepo, RepoSpec, SourceHost};
use crate::errors::PipelineError;
use crate::files::FileChange;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "shipwright";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only; says nothing about whether the token is active or
/// has the `repo` scope.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty()
        && GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

#[derive(Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
    /// A README commit gives us a base tree to layer onto.
    auto_init: bool,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Deserialize)]
struct GitHubRepo {
    name: String,
    html_url: String,
    clone_url: String,
    default_branch: String,
    owner: RepoOwner,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
}

#[derive(Deserialize)]
struct Created {
    sha: String,
}

#[derive(Serialize)]
struct CreateBlob<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

#[derive(Serialize)]
struct CreateTree<'a> {
    base_tree: &'a str,
    tree: Vec<TreeEntry<'a>>,
}

#[derive(Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
}

#[derive(Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

/// Publishes file sets through the Git data API: one blob per file, a tree
/// on top of the initial commit's tree, a commit, then a forced ref update.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    username: Option<String>,
    init_delay: Duration,
}

impl GitHubClient {
    pub fn new(token: Option<String>, username: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for GitHub")?;
        Ok(Self {
            http,
            api_url: GITHUB_API_URL.to_string(),
            token,
            username,
            init_delay: Duration::from_secs(2),
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Pause between creating the repository and reading its first commit.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    fn token(&self) -> Result<&str, PipelineError> {
        self.token
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("GITHUB_TOKEN".to_string()))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, PipelineError> {
        let resp = request
            .bearer_auth(self.token()?)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .with_context(|| format!("GitHub request failed: {}", what))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(step = what, status = status.as_u16(), "GitHub API call failed");
            return Err(PipelineError::Upstream {
                service: "GitHub",
                status: status.as_u16(),
                body,
            });
        }
        let parsed = resp
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub response: {}", what))?;
        Ok(parsed)
    }

    async fn commit_files(
        &self,
        repo_path: &str,
        spec: &RepoSpec,
        files: &[FileChange],
    ) -> Result<String, PipelineError> {
        let git = format!("{}/repos/{}/git", self.api_url, repo_path);

        let base: GitRef = self
            .call(
                self.http.get(format!("{}/ref/heads/{}", git, spec.branch)),
                "get branch ref",
            )
            .await?;
        let base_commit: GitCommit = self
            .call(
                self.http.get(format!("{}/commits/{}", git, base.object.sha)),
                "get base commit",
            )
            .await?;

        let mut tree = Vec::with_capacity(files.len());
        for file in files {
            let blob: Created = self
                .call(
                    self.http.post(format!("{}/blobs", git)).json(&CreateBlob {
                        content: &file.content,
                        encoding: "utf-8",
                    }),
                    "create blob",
                )
                .await?;
            tree.push(TreeEntry {
                path: &file.path,
                mode: "100644",
                kind: "blob",
                sha: blob.sha,
            });
        }
        tracing::debug!(repo = repo_path, blobs = tree.len(), "Blobs created");

        let new_tree: Created = self
            .call(
                self.http.post(format!("{}/trees", git)).json(&CreateTree {
                    base_tree: &base_commit.tree.sha,
                    tree,
                }),
                "create tree",
            )
            .await?;
        let commit: Created = self
            .call(
                self.http.post(format!("{}/commits", git)).json(&CreateCommit {
                    message: &spec.commit_message,
                    tree: &new_tree.sha,
                    parents: [&base_commit.sha],
                }),
                "create commit",
            )
            .await?;
        let _: serde_json::Value = self
            .call(
                self.http
                    .patch(format!("{}/refs/heads/{}", git, spec.branch))
                    .json(&UpdateRef {
                        sha: &commit.sha,
                        force: true,
                    }),
                "update branch ref",
            )
            .await?;

        Ok(commit.sha)
    }
}

#[async_trait]
impl SourceHost for GitHubClient {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn publish(
        &self,
        spec: &RepoSpec,
        files: &[FileChange],
    ) -> Result<PublishedRepo, PipelineError> {
        let repo: GitHubRepo = self
            .call(
                self.http
                    .post(format!("{}/user/repos", self.api_url))
                    .json(&CreateRepoRequest {
                        name: &spec.name,
                        description: &spec.description,
                        private: spec.private,
                        auto_init: true,
                    }),
                "create repository",
            )
            .await?;
        tracing::info!(repo = %repo.name, url = %repo.html_url, "Repository created");

        tokio::time::sleep(self.init_delay).await;

        let owner = self.username.clone().unwrap_or(repo.owner.login);
        let repo_path = format!("{}/{}", owner, repo.name);
        let commit_sha = match self.commit_files(&repo_path, spec, files).await {
            Ok(sha) => sha,
            Err(e) => {
                tracing::warn!(
                    repo = %repo_path,
                    url = %repo.html_url,
                    error = %e,
                    "Committing files failed; repository left in place"
                );
                return Err(e);
            }
        };
        tracing::info!(repo = %repo_path, commit = %commit_sha, files = files.len(), "Files pushed");

        Ok(PublishedRepo {
            owner,
            name: repo.name,
            html_url: repo.html_url,
            clone_url: repo.clone_url,
            default_branch: repo.default_branch,
            commit_sha,
        })
    }
}
