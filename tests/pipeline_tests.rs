//! End-to-end pipeline tests against the public API.
//!
//! Uses the directory-backed sandbox with trivial install/dev commands, so
//! files really land on disk and commands really run through `sh`. Model
//! and publishing collaborators are in-test doubles.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use shipwright::config::{DeploySection, SandboxSection};
use shipwright::deploy::{
    DeployRequest, DeploymentOrchestrator, DeploymentState, HostedDeployment, HostingPlatform,
    PublishedRepo, RepoSpec, SourceHost,
};
use shipwright::files::{FileChange, FileOperation, build_archive, extract_archive};
use shipwright::generation::{ChatMessage, CodeGenerator, Generation, GenerationOptions};
use shipwright::pipeline::{BuildOrchestrator, EditOrchestrator, EditRequest};
use shipwright::sandbox::{
    LocalSandbox, ProbeResult, Provisioner, ReachabilityProbe, SandboxProvider,
};
use shipwright::session::{EventKind, SessionId, SessionStore};
use shipwright::PipelineError;

const BUILD_REPLY: &str = r#"<thinking>Small Next.js app.</thinking>
<files>
FILE: package.json
```json
{"name": "todo", "scripts": {"dev": "next dev"}}
```

FILE: src/app/page.tsx
```tsx
export default function Page() {
  return <main>Todos</main>;
}
```

FILE: src/app/globals.css
```css
body { margin: 0; }
```
</files>"#;

const EDIT_REPLY: &str = r#"<explanation>Switched the background to navy.</explanation>
<files>
FILE: src/app/globals.css
```css
body { margin: 0; background: navy; }
```

FILE: src/components/Footer.tsx
```tsx
export function Footer() { return <footer>bye</footer>; }
```
</files>"#;

struct Replies(Mutex<VecDeque<String>>, Mutex<Vec<Vec<ChatMessage>>>);

impl Replies {
    fn new(replies: &[&str]) -> Self {
        Self(
            Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            Mutex::new(Vec::new()),
        )
    }

    fn conversations(&self) -> Vec<Vec<ChatMessage>> {
        self.1.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for Replies {
    async fn generate(
        &self,
        conversation: &[ChatMessage],
        _system: &str,
        _options: &GenerationOptions,
    ) -> Result<Generation, PipelineError> {
        self.1.lock().unwrap().push(conversation.to_vec());
        let text = self
            .0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::validation("no reply left"))?;
        Ok(Generation {
            text,
            thinking: None,
        })
    }
}

struct AlwaysUp;

#[async_trait]
impl ReachabilityProbe for AlwaysUp {
    async fn probe(&self, _url: &str) -> ProbeResult {
        ProbeResult::Healthy { status: 404 }
    }
}

#[derive(Default)]
struct RecordingHost(Mutex<Vec<(RepoSpec, Vec<FileChange>)>>);

#[async_trait]
impl SourceHost for RecordingHost {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn publish(
        &self,
        spec: &RepoSpec,
        files: &[FileChange],
    ) -> Result<PublishedRepo, PipelineError> {
        self.0.lock().unwrap().push((spec.clone(), files.to_vec()));
        Ok(PublishedRepo {
            owner: "octo".into(),
            name: spec.name.clone(),
            html_url: format!("https://github.com/octo/{}", spec.name),
            clone_url: format!("https://github.com/octo/{}.git", spec.name),
            default_branch: spec.branch.clone(),
            commit_sha: "cafe".into(),
        })
    }
}

struct SlowPlatform;

#[async_trait]
impl HostingPlatform for SlowPlatform {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn deploy(
        &self,
        project_name: &str,
        _repo: &PublishedRepo,
    ) -> Result<HostedDeployment, PipelineError> {
        Ok(HostedDeployment {
            project_id: "prj".into(),
            deployment_id: "dpl".into(),
            url: format!("https://{}.example.app", project_name),
            state: DeploymentState::Pending,
        })
    }
}

fn sandbox_config(root: &Path) -> SandboxSection {
    SandboxSection {
        install_command: "true".into(),
        dev_command: "echo 'ready in 5ms'".into(),
        settle_delay_secs: 0,
        health_interval_secs: 1,
        health_attempts: 3,
        probe_attempts: 1,
        port: 39517,
        local_root: root.to_path_buf(),
        ..SandboxSection::default()
    }
}

struct Pipeline {
    sessions: SessionStore,
    sandbox: Arc<LocalSandbox>,
    generator: Arc<Replies>,
    host: Arc<RecordingHost>,
    builds: Arc<BuildOrchestrator>,
    edits: EditOrchestrator,
    deployments: DeploymentOrchestrator,
}

fn pipeline(root: &Path, replies: &[&str]) -> Pipeline {
    let sessions = SessionStore::default();
    let config = sandbox_config(root);
    let sandbox = Arc::new(LocalSandbox::new(config.local_root.clone()));
    let generator = Arc::new(Replies::new(replies));
    let host = Arc::new(RecordingHost::default());
    let provisioner = Arc::new(Provisioner::new(sandbox.clone(), Arc::new(AlwaysUp), config));

    Pipeline {
        builds: Arc::new(BuildOrchestrator::new(
            generator.clone(),
            provisioner,
            sessions.clone(),
            GenerationOptions::build(&Default::default()),
        )),
        edits: EditOrchestrator::new(
            generator.clone(),
            sandbox.clone(),
            sessions.clone(),
            GenerationOptions::edit(&Default::default()),
        ),
        deployments: DeploymentOrchestrator::new(
            sessions.clone(),
            host.clone(),
            Arc::new(SlowPlatform),
            DeploySection::default(),
        ),
        sessions,
        sandbox,
        generator,
        host,
    }
}

#[tokio::test]
async fn test_build_edit_deploy_round_trip() {
    let root = TempDir::new().unwrap();
    let p = pipeline(root.path(), &[BUILD_REPLY, EDIT_REPLY]);
    let session: SessionId = "e2e-1".parse().unwrap();

    // Build, watching the progress stream as a client would.
    let mut subscription = p
        .sessions
        .subscribe(&session, 0, std::time::Duration::from_secs(60));
    let handle = p
        .builds
        .start(session.clone(), "Build a todo list app".into())
        .unwrap();

    let mut messages = Vec::new();
    let mut terminal = None;
    while let Some(event) = subscription.next_event().await {
        match event.kind {
            EventKind::Info(message) => messages.push(message),
            other => terminal = Some(other),
        }
    }
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.files_generated, 3);
    assert_eq!(outcome.preview_url, "http://localhost:39517");
    assert!(matches!(terminal, Some(EventKind::Complete { ref url }) if url == "http://localhost:39517"));
    assert!(messages.contains(&"Files uploaded".to_string()));
    assert_eq!(
        messages.last().unwrap(),
        "✅ Preview ready! http://localhost:39517"
    );

    let sandbox_dir = Path::new(&outcome.sandbox.root_dir);
    assert_eq!(
        std::fs::read_to_string(sandbox_dir.join("src/app/globals.css")).unwrap(),
        "body { margin: 0; }"
    );

    // Edit the live sandbox; only the targeted files travel to the model.
    let request = EditRequest {
        message: "make the background color navy and add a footer".into(),
        sandbox_id: outcome.sandbox.id.clone(),
        history: vec![],
        session_id: Some(session.clone()),
    };
    let edit = p.edits.apply(&request).await.unwrap();

    assert_eq!(edit.files_updated, 2);
    assert!(edit.message.contains("✅ Updated 2 file(s)"));
    assert_eq!(
        std::fs::read_to_string(sandbox_dir.join("src/app/globals.css")).unwrap(),
        "body { margin: 0; background: navy; }"
    );
    assert_eq!(
        std::fs::read_to_string(sandbox_dir.join("src/app/page.tsx")).unwrap(),
        "export default function Page() {\n  return <main>Todos</main>;\n}"
    );
    let edit_turn = &p.generator.conversations()[1][0].content;
    assert!(!edit_turn.contains("dev-server.log"));
    assert!(edit_turn.ends_with("User request: make the background color navy and add a footer"));

    let stored = p.sessions.files(&session).unwrap();
    assert_eq!(stored.len(), 4);
    let css = stored.iter().find(|f| f.path == "src/app/globals.css").unwrap();
    assert_eq!(css.operation, FileOperation::Edit);
    let footer = stored.iter().find(|f| f.path == "src/components/Footer.tsx").unwrap();
    assert_eq!(footer.operation, FileOperation::Create);

    // The archive carries the edited set.
    let unpacked = extract_archive(&build_archive(&stored).unwrap()).unwrap();
    assert_eq!(unpacked.len(), 4);

    // Deploy the merged set; a still-building deployment is a success.
    let result = p
        .deployments
        .deploy(
            &session,
            &DeployRequest {
                project_prompt: Some("Build a todo list app".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.deployment_state, Some(DeploymentState::Pending));
    assert_eq!(result.files_deployed, 4);

    let published = p.host.0.lock().unwrap();
    let (spec, files) = &published[0];
    assert!(spec.name.starts_with("shipwright-build-todo-list-"));
    assert!(spec.commit_message.starts_with("Initial commit: build-todo-list"));
    assert_eq!(files.len(), 4);

    p.sandbox.delete(&outcome.sandbox.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_install_tears_down_and_keeps_files() {
    let root = TempDir::new().unwrap();
    let sessions = SessionStore::default();
    let mut config = sandbox_config(root.path());
    config.install_command = "echo 'npm ERR! missing script' && exit 1".into();
    let sandbox = Arc::new(LocalSandbox::new(root.path()));
    let builds = Arc::new(BuildOrchestrator::new(
        Arc::new(Replies::new(&[BUILD_REPLY])),
        Arc::new(Provisioner::new(sandbox.clone(), Arc::new(AlwaysUp), config)),
        sessions.clone(),
        GenerationOptions::build(&Default::default()),
    ));
    let session: SessionId = "e2e-2".parse().unwrap();

    let err = builds.run(&session, "a todo app").await.unwrap_err();

    assert!(err.to_string().contains("npm ERR! missing script"));
    assert!(sandbox.list_ids().await.unwrap().is_empty());
    assert_eq!(sessions.files(&session).unwrap().len(), 3);
    let last = sessions.events_since(&session, 0).unwrap().pop().unwrap();
    assert!(matches!(last.kind, EventKind::Error { .. }));
}

#[tokio::test]
async fn test_late_subscriber_sees_whole_log() {
    let root = TempDir::new().unwrap();
    let p = pipeline(root.path(), &["no files in this reply"]);
    let session: SessionId = "e2e-3".parse().unwrap();

    p.builds.run(&session, "anything").await.unwrap_err();

    let events: Vec<_> = {
        let mut sub = p
            .sessions
            .subscribe(&session, 0, std::time::Duration::from_secs(5));
        let mut out = Vec::new();
        while let Some(event) = sub.next_event().await {
            out.push(event.wire_message());
        }
        out
    };
    assert_eq!(events.first().unwrap(), "🧠 Calling Claude to generate code...");
    assert_eq!(events.last().unwrap(), "ERROR:No files generated");
    assert!(p.sandbox.list_ids().await.unwrap().is_empty());
}
