//! In-memory doubles for the pipeline's async seams.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::deploy::{
    DeploymentState, HostedDeployment, HostingPlatform, PublishedRepo, RepoSpec, SourceHost,
};
use crate::errors::PipelineError;
use crate::files::FileChange;
use crate::generation::{ChatMessage, CodeGenerator, Generation, GenerationOptions};
use crate::sandbox::{
    ExecOutput, ProbeResult, ReachabilityProbe, RemoteEntry, SandboxHandle, SandboxProvider,
};

// ── Sandbox ──────────────────────────────────────────────────────────

#[derive(Default)]
struct SandboxState {
    sandboxes: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    next_id: usize,
    created: Vec<String>,
    deleted: Vec<String>,
    commands: Vec<String>,
    install_exit: i32,
    install_output: String,
    curl_output: Option<String>,
    server_log: String,
    fail_create: bool,
    fail_delete: HashSet<String>,
    fail_upload: HashSet<String>,
}

/// Sandbox provider backed by in-memory file maps. Commands are not run;
/// `npm install`, `curl` and `cat` answer with configured output, `rm -f`
/// removes files and everything else succeeds silently.
#[derive(Default)]
pub struct FakeSandbox {
    state: Mutex<SandboxState>,
}

impl FakeSandbox {
    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap()
    }

    pub fn set_install_result(&self, exit_code: i32, output: &str) {
        let mut state = self.state();
        state.install_exit = exit_code;
        state.install_output = output.to_string();
    }

    pub fn set_curl_output(&self, output: &str) {
        self.state().curl_output = Some(output.to_string());
    }

    pub fn set_server_log(&self, log: &str) {
        self.state().server_log = log.to_string();
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    pub fn fail_delete_for(&self, id: &str) {
        self.state().fail_delete.insert(id.to_string());
    }

    pub fn fail_upload_for(&self, path: &str) {
        self.state().fail_upload.insert(path.to_string());
    }

    pub fn file(&self, id: &str, path: &str) -> Option<String> {
        self.state()
            .sandboxes
            .get(id)?
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    fn missing(id: &str) -> PipelineError {
        PipelineError::not_found(format!("Sandbox {} not found", id))
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _image: &str) -> Result<SandboxHandle, PipelineError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(PipelineError::Upstream {
                service: "Fake",
                status: 503,
                body: "no capacity".into(),
            });
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.sandboxes.insert(id.clone(), BTreeMap::new());
        state.created.push(id.clone());
        Ok(SandboxHandle::new(id, "/workspace"))
    }

    async fn get(&self, id: &str) -> Result<SandboxHandle, PipelineError> {
        if self.state().sandboxes.contains_key(id) {
            Ok(SandboxHandle::new(id, "/workspace"))
        } else {
            Err(Self::missing(id))
        }
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), PipelineError> {
        let mut state = self.state();
        if state.fail_upload.contains(path) {
            return Err(PipelineError::Upstream {
                service: "Fake",
                status: 500,
                body: "upload failed".into(),
            });
        }
        let files = state
            .sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| Self::missing(&handle.id))?;
        files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        _env: &[(&str, &str)],
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, PipelineError> {
        let mut state = self.state();
        state.commands.push(command.to_string());
        let (exit_code, output) = if command.starts_with("npm install") {
            (state.install_exit, state.install_output.clone())
        } else if command.contains("curl") {
            (0, state.curl_output.clone().unwrap_or_else(|| "000".into()))
        } else if command.starts_with("cat ") {
            (0, state.server_log.clone())
        } else if let Some(quoted) = command.strip_prefix("rm -f -- ") {
            // Paths arrive single-quoted without embedded quotes in tests.
            if let Some(files) = state.sandboxes.get_mut(&handle.id) {
                for path in quoted.split_whitespace() {
                    files.remove(path.trim_matches('\''));
                }
            }
            (0, String::new())
        } else {
            (0, String::new())
        };
        Ok(ExecOutput { exit_code, output })
    }

    async fn list_dir(
        &self,
        handle: &SandboxHandle,
        dir: &str,
    ) -> Result<Vec<RemoteEntry>, PipelineError> {
        let state = self.state();
        let files = state
            .sandboxes
            .get(&handle.id)
            .ok_or_else(|| Self::missing(&handle.id))?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut entries = BTreeSet::new();
        for path in files.keys() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((child, _)) => entries.insert((child.to_string(), true)),
                    None => entries.insert((rest.to_string(), false)),
                };
            }
        }
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| RemoteEntry { name, is_dir })
            .collect())
    }

    async fn download(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, PipelineError> {
        self.state()
            .sandboxes
            .get(&handle.id)
            .and_then(|files| files.get(path).cloned())
            .ok_or_else(|| PipelineError::not_found(format!("File {} not found", path)))
    }

    async fn preview_url(&self, handle: &SandboxHandle, port: u16) -> Result<String, PipelineError> {
        Ok(format!("https://{}-{}.preview.test", port, handle.id))
    }

    async fn delete(&self, id: &str) -> Result<(), PipelineError> {
        let mut state = self.state();
        if state.fail_delete.contains(id) {
            return Err(PipelineError::Upstream {
                service: "Fake",
                status: 500,
                body: "delete failed".into(),
            });
        }
        if state.sandboxes.remove(id).is_none() {
            return Err(Self::missing(id));
        }
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self.state().sandboxes.keys().cloned().collect())
    }
}

/// Reachability probe with a fixed answer.
pub struct FakeProbe {
    healthy: bool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            healthy: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn probe(&self, _url: &str) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy {
            ProbeResult::Healthy { status: 200 }
        } else {
            ProbeResult::Unreachable {
                reason: "connection refused".into(),
            }
        }
    }
}

// ── Generation ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub conversation: Vec<ChatMessage>,
    pub system: String,
    pub options: GenerationOptions,
}

/// Answers generation calls from a queue of canned replies.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<Generation, PipelineError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<Generation, PipelineError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(Generation {
            text: text.to_string(),
            thinking: None,
        })])
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self::new(vec![Err(PipelineError::Upstream {
            service: "Claude",
            status,
            body: body.to_string(),
        })])
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        conversation: &[ChatMessage],
        system: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, PipelineError> {
        self.calls.lock().unwrap().push(RecordedCall {
            conversation: conversation.to_vec(),
            system: system.to_string(),
            options: options.clone(),
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::validation("no scripted reply left")))
    }
}

// ── Deployment ───────────────────────────────────────────────────────

pub struct FakeSourceHost {
    owner: String,
    failure: Option<(u16, String)>,
    published: Mutex<Vec<RepoSpec>>,
}

impl FakeSourceHost {
    pub fn succeeding(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            failure: None,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self {
            owner: "octo".to_string(),
            failure: Some((status, body.to_string())),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<RepoSpec> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    fn name(&self) -> &'static str {
        "fake-git"
    }

    async fn publish(
        &self,
        spec: &RepoSpec,
        _files: &[FileChange],
    ) -> Result<PublishedRepo, PipelineError> {
        if let Some((status, body)) = &self.failure {
            return Err(PipelineError::Upstream {
                service: "GitHub",
                status: *status,
                body: body.clone(),
            });
        }
        self.published.lock().unwrap().push(spec.clone());
        Ok(PublishedRepo {
            owner: self.owner.clone(),
            name: spec.name.clone(),
            html_url: format!("https://github.com/{}/{}", self.owner, spec.name),
            clone_url: format!("https://github.com/{}/{}.git", self.owner, spec.name),
            default_branch: spec.branch.clone(),
            commit_sha: "0123abcd".into(),
        })
    }
}

enum HostingMode {
    Ready,
    Pending,
    Failing(String),
}

pub struct FakeHostingPlatform {
    mode: HostingMode,
    calls: AtomicUsize,
}

impl FakeHostingPlatform {
    fn with(mode: HostingMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ready() -> Self {
        Self::with(HostingMode::Ready)
    }

    pub fn pending() -> Self {
        Self::with(HostingMode::Pending)
    }

    pub fn failing(message: &str) -> Self {
        Self::with(HostingMode::Failing(message.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostingPlatform for FakeHostingPlatform {
    fn name(&self) -> &'static str {
        "fake-hosting"
    }

    async fn deploy(
        &self,
        project_name: &str,
        _repo: &PublishedRepo,
    ) -> Result<HostedDeployment, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = match &self.mode {
            HostingMode::Ready => DeploymentState::Ready,
            HostingMode::Pending => DeploymentState::Pending,
            HostingMode::Failing(message) => {
                return Err(PipelineError::Other(anyhow::anyhow!("{}", message)));
            }
        };
        Ok(HostedDeployment {
            project_id: "prj_fake".into(),
            deployment_id: "dpl_fake".into(),
            url: format!("https://{}.vercel.test", project_name),
            state,
        })
    }
}
