//! Daytona control-plane and toolbox client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};

use super::{ExecOutput, ProvisionStage, RemoteEntry, SandboxHandle, SandboxProvider, shell_quote};
use crate::errors::PipelineError;

const DEFAULT_API_URL: &str = "https://app.daytona.io/api";
/// Control-plane calls; command execution carries its own timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const START_POLL_INTERVAL: Duration = Duration::from_secs(1);
const START_POLL_ATTEMPTS: u32 = 60;

pub struct DaytonaClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    target: Option<String>,
}

#[derive(Serialize)]
struct CreateSandboxRequest<'a> {
    image: &'a str,
    public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

#[derive(Deserialize)]
struct SandboxRecord {
    id: String,
    /// Missing on older control planes, which only answer once started.
    #[serde(default)]
    state: Option<String>,
}

/// `GET /sandbox` has answered both a bare array and a wrapped object.
#[derive(Deserialize)]
#[serde(untagged)]
enum SandboxList {
    Bare(Vec<SandboxRecord>),
    Wrapped { sandboxes: Vec<SandboxRecord> },
}

#[derive(Deserialize)]
struct ProjectDir {
    dir: String,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    command: String,
    cwd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    exit_code: i32,
    #[serde(default)]
    result: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    name: String,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Deserialize)]
struct PreviewLink {
    url: String,
}

/// `sh -c '<K=V ...> <command>'`, so shell syntax and env assignments work
/// the same way they do for the local provider.
fn shell_command(command: &str, env: &[(&str, &str)]) -> String {
    let assignments: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    let inner = if assignments.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", assignments.join(" "), command)
    };
    format!("sh -c {}", shell_quote(&inner))
}

impl DaytonaClient {
    pub fn new(
        api_url: Option<String>,
        api_key: Option<String>,
        target: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for Daytona")?;
        Ok(Self {
            http,
            api_url: api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            target,
        })
    }

    fn key(&self) -> Result<&str, PipelineError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("DAYTONA_API_KEY".to_string()))
    }

    fn toolbox_url(&self, id: &str, path: &str) -> String {
        format!("{}/toolbox/{}/toolbox/{}", self.api_url, id, path)
    }

    fn join(root: &str, relative: &str) -> String {
        if relative.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root.trim_end_matches('/'), relative)
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, PipelineError> {
        let resp = request
            .bearer_auth(self.key()?)
            .send()
            .await
            .with_context(|| format!("Daytona request failed: {}", what))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream {
                service: "Daytona",
                status: status.as_u16(),
                body: runner_hint(&body).unwrap_or(body),
            });
        }
        Ok(resp)
    }

    /// Poll until the sandbox reports `started`. Error states fail fast.
    async fn wait_started(&self, record: SandboxRecord) -> Result<SandboxRecord, PipelineError> {
        let mut record = record;
        for attempt in 1..=START_POLL_ATTEMPTS {
            match record.state.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("started") => return Ok(record),
                Some(state @ ("error" | "build_failed" | "destroyed")) => {
                    return Err(PipelineError::provisioning(
                        ProvisionStage::Creating,
                        format!("Daytona sandbox {} entered state '{}'", record.id, state),
                    ));
                }
                Some(state) => {
                    tracing::debug!(sandbox_id = %record.id, state, attempt, "Waiting for Daytona sandbox to start");
                }
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
            record = self.fetch(&record.id).await?;
        }
        Err(PipelineError::Timeout {
            operation: "Daytona sandbox start",
            attempts: START_POLL_ATTEMPTS,
        })
    }

    async fn fetch(&self, id: &str) -> Result<SandboxRecord, PipelineError> {
        let resp = self
            .send(
                self.http
                    .get(format!("{}/sandbox/{}", self.api_url, id))
                    .timeout(REQUEST_TIMEOUT),
                "get sandbox",
            )
            .await?;
        let record = resp
            .json()
            .await
            .context("Failed to parse Daytona sandbox")?;
        Ok(record)
    }

    async fn ready_root_dir(&self, record: SandboxRecord) -> Result<String, PipelineError> {
        let record = self.wait_started(record).await?;
        self.project_dir(&record.id).await
    }

    async fn project_dir(&self, id: &str) -> Result<String, PipelineError> {
        let resp = self
            .send(
                self.http
                    .get(self.toolbox_url(id, "project-dir"))
                    .timeout(REQUEST_TIMEOUT),
                "get project dir",
            )
            .await?;
        let dir: ProjectDir = resp
            .json()
            .await
            .context("Failed to parse Daytona project dir")?;
        Ok(dir.dir)
    }
}

/// Runner lookup failures are almost always configuration mistakes.
fn runner_hint(body: &str) -> Option<String> {
    body.contains("runner info").then(|| {
        format!(
            "Daytona runner not found. Check DAYTONA_TARGET and DAYTONA_API_URL. Cause: {}",
            body
        )
    })
}

#[async_trait]
impl SandboxProvider for DaytonaClient {
    fn name(&self) -> &'static str {
        "daytona"
    }

    async fn create(&self, image: &str) -> Result<SandboxHandle, PipelineError> {
        let body = CreateSandboxRequest {
            image,
            public: true,
            target: self.target.as_deref(),
        };
        let resp = self
            .send(
                self.http
                    .post(format!("{}/sandbox", self.api_url))
                    .timeout(REQUEST_TIMEOUT)
                    .json(&body),
                "create sandbox",
            )
            .await?;
        let record: SandboxRecord = resp
            .json()
            .await
            .context("Failed to parse Daytona sandbox")?;
        let id = record.id.clone();

        // The sandbox exists from here on; any failure must not orphan it.
        let root_dir = match self.ready_root_dir(record).await {
            Ok(dir) => dir,
            Err(e) => {
                if let Err(cleanup) = self.delete(&id).await {
                    tracing::warn!(sandbox_id = %id, error = %cleanup, "Failed to delete unstarted Daytona sandbox");
                }
                return Err(e);
            }
        };
        tracing::info!(sandbox_id = %id, %root_dir, "Daytona sandbox created");
        Ok(SandboxHandle::new(id, root_dir))
    }

    async fn get(&self, id: &str) -> Result<SandboxHandle, PipelineError> {
        let record = self.fetch(id).await?;
        let root_dir = self.project_dir(&record.id).await?;
        Ok(SandboxHandle::new(record.id, root_dir))
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), PipelineError> {
        let destination = Self::join(&handle.root_dir, path);
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(content.to_vec()).file_name(file_name),
        );
        self.send(
            self.http
                .post(self.toolbox_url(&handle.id, "files/upload"))
                .query(&[("path", destination.as_str())])
                .timeout(REQUEST_TIMEOUT)
                .multipart(form),
            "upload file",
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        env: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, PipelineError> {
        let body = ExecuteRequest {
            command: shell_command(command, env),
            cwd: &handle.root_dir,
            timeout: timeout.map(|t| t.as_secs()),
        };
        // Leave headroom over the remote timeout so the server reports it.
        let http_timeout = timeout.map_or(REQUEST_TIMEOUT, |t| t + REQUEST_TIMEOUT);
        let resp = self
            .send(
                self.http
                    .post(self.toolbox_url(&handle.id, "process/execute"))
                    .timeout(http_timeout)
                    .json(&body),
                "execute command",
            )
            .await?;
        let result: ExecuteResponse = resp
            .json()
            .await
            .context("Failed to parse Daytona command result")?;
        Ok(ExecOutput {
            exit_code: result.exit_code,
            output: result.result,
        })
    }

    async fn list_dir(
        &self,
        handle: &SandboxHandle,
        dir: &str,
    ) -> Result<Vec<RemoteEntry>, PipelineError> {
        let full = Self::join(&handle.root_dir, dir);
        let resp = self
            .send(
                self.http
                    .get(self.toolbox_url(&handle.id, "files"))
                    .query(&[("path", full.as_str())])
                    .timeout(REQUEST_TIMEOUT),
                "list files",
            )
            .await?;
        let entries: Vec<FileInfo> = resp
            .json()
            .await
            .context("Failed to parse Daytona file listing")?;
        Ok(entries
            .into_iter()
            .map(|e| RemoteEntry {
                name: e.name,
                is_dir: e.is_dir,
            })
            .collect())
    }

    async fn download(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, PipelineError> {
        let full = Self::join(&handle.root_dir, path);
        let resp = self
            .send(
                self.http
                    .get(self.toolbox_url(&handle.id, "files/download"))
                    .query(&[("path", full.as_str())])
                    .timeout(REQUEST_TIMEOUT),
                "download file",
            )
            .await?;
        let bytes = resp
            .bytes()
            .await
            .context("Failed to read Daytona file body")?;
        Ok(bytes.to_vec())
    }

    async fn preview_url(&self, handle: &SandboxHandle, port: u16) -> Result<String, PipelineError> {
        let resp = self
            .send(
                self.http
                    .get(format!(
                        "{}/sandbox/{}/ports/{}/preview-url",
                        self.api_url, handle.id, port
                    ))
                    .timeout(REQUEST_TIMEOUT),
                "get preview link",
            )
            .await?;
        let link: PreviewLink = resp
            .json()
            .await
            .context("Failed to parse Daytona preview link")?;
        Ok(link.url)
    }

    async fn delete(&self, id: &str) -> Result<(), PipelineError> {
        self.send(
            self.http
                .delete(format!("{}/sandbox/{}", self.api_url, id))
                .query(&[("force", "true")])
                .timeout(REQUEST_TIMEOUT),
            "delete sandbox",
        )
        .await?;
        tracing::info!(sandbox_id = %id, "Daytona sandbox deleted");
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, PipelineError> {
        let resp = self
            .send(
                self.http
                    .get(format!("{}/sandbox", self.api_url))
                    .timeout(REQUEST_TIMEOUT),
                "list sandboxes",
            )
            .await?;
        let list: SandboxList = resp
            .json()
            .await
            .context("Failed to parse Daytona sandbox list")?;
        let records = match list {
            SandboxList::Bare(records) | SandboxList::Wrapped { sandboxes: records } => records,
        };
        Ok(records
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !id.is_empty())
            .collect())
    }
}
