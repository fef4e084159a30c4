use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::deploy::{DeployRequest, DeploymentOrchestrator};
use crate::errors::PipelineError;
use crate::files::{archive_file_name, build_archive};
use crate::pipeline::{BuildOrchestrator, EditOrchestrator, EditOutcome, EditRequest};
use crate::sandbox::{SandboxProvider, delete_all};
use crate::session::{SessionId, SessionStore};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub sessions: SessionStore,
    pub builds: Arc<BuildOrchestrator>,
    pub edits: EditOrchestrator,
    pub deployments: DeploymentOrchestrator,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub stream_timeout: Duration,
    pub keep_alive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBuildRequest {
    #[serde(default)]
    pub prompt: String,
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub from: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployBody {
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub request: DeployRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EditResponse {
    success: bool,
    #[serde(flatten)]
    outcome: EditOutcome,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Upstream(String),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::Validation(_) => ApiError::BadRequest(message),
            PipelineError::NotFound(_) => ApiError::NotFound(message),
            PipelineError::Upstream { .. }
            | PipelineError::Provisioning { .. }
            | PipelineError::PartialDeployment { .. }
            | PipelineError::Timeout { .. } => ApiError::Upstream(message),
            PipelineError::Configuration(_) | PipelineError::Other(_) => {
                ApiError::Internal(message)
            }
        }
    }
}

/// Malformed bodies get the same envelope as every other bad request.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (
            status,
            Json(serde_json::json!({"success": false, "error": message})),
        )
            .into_response()
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse::<SessionId>().map_err(ApiError::from)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/builds", post(start_build))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/files", get(session_files))
        .route("/api/sessions/{id}/archive", get(session_archive))
        .route("/api/edits", post(apply_edit))
        .route("/api/deployments", post(deploy))
        .route(
            "/api/sandboxes",
            get(list_sandboxes).delete(delete_all_sandboxes),
        )
        .route("/api/sandboxes/{id}", delete(delete_sandbox))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_build(
    State(state): State<SharedState>,
    payload: Result<Json<StartBuildRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing prompt".into()));
    }
    let session = match req.session_id.as_deref() {
        Some(raw) => parse_session_id(raw)?,
        None => SessionId::generate(),
    };

    state.builds.start(session.clone(), req.prompt)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "success": true,
            "sessionId": session,
            "eventsUrl": format!("/api/sessions/{}/events", session),
        })),
    ))
}

async fn session_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = parse_session_id(&id)?;
    let subscription =
        state
            .sessions
            .subscribe(&session, query.from.unwrap_or(0), state.stream_timeout);
    let stream = subscription
        .into_stream()
        .map(|event| Ok(Event::default().data(event.payload())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

async fn session_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = parse_session_id(&id)?;
    let files = state
        .sessions
        .files(&session)
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))?;
    Ok(Json(serde_json::json!({
        "success": true,
        "sessionId": session,
        "count": files.len(),
        "files": files.as_slice(),
    })))
}

async fn session_archive(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = parse_session_id(&id)?;
    let files = state
        .sessions
        .files(&session)
        .filter(|files| !files.is_empty())
        .ok_or_else(|| ApiError::NotFound("No files found for this session".into()))?;
    let bytes = build_archive(&files)?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        archive_file_name(session.as_str())
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

async fn apply_edit(
    State(state): State<SharedState>,
    payload: Result<Json<EditRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    req.validate()?;
    let outcome = state.edits.apply(&req).await?;
    Ok(Json(EditResponse {
        success: true,
        outcome,
    }))
}

async fn deploy(
    State(state): State<SharedState>,
    payload: Result<Json<DeployBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload?;
    if body.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing sessionId".into()));
    }
    let session = parse_session_id(&body.session_id)?;
    body.request.validate()?;

    let result = state.deployments.deploy(&session, &body.request).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(result)))
}

async fn list_sandboxes(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let ids = state.sandboxes.list_ids().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "provider": state.sandboxes.name(),
        "count": ids.len(),
        "sandboxes": ids,
    })))
}

async fn delete_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sandboxes.delete(&id).await?;
    tracing::info!(sandbox_id = %id, "Sandbox deleted");
    Ok(Json(serde_json::json!({"success": true, "deleted": id})))
}

async fn delete_all_sandboxes(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let report = delete_all(state.sandboxes.as_ref()).await?;
    Ok(Json(serde_json::json!({
        "success": report.failed.is_empty(),
        "deleted": report.deleted,
        "failed": report.failed,
    })))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::{DeploySection, SandboxSection};
    use crate::files::{FileChange, extract_archive};
    use crate::generation::GenerationOptions;
    use crate::sandbox::Provisioner;
    use crate::test_support::{
        FakeHostingPlatform, FakeProbe, FakeSandbox, FakeSourceHost, ScriptedGenerator,
    };

    struct Harness {
        state: SharedState,
        sandbox: Arc<FakeSandbox>,
    }

    impl Harness {
        fn new(reply: &str, hosting: FakeHostingPlatform) -> Self {
            let sessions = SessionStore::default();
            let sandbox = Arc::new(FakeSandbox::default());
            let generator = Arc::new(ScriptedGenerator::replying(reply));
            let provisioner = Arc::new(Provisioner::new(
                sandbox.clone(),
                Arc::new(FakeProbe::healthy()),
                SandboxSection::default(),
            ));
            let state = Arc::new(AppState {
                sessions: sessions.clone(),
                builds: Arc::new(BuildOrchestrator::new(
                    generator.clone(),
                    provisioner,
                    sessions.clone(),
                    GenerationOptions::build(&Default::default()),
                )),
                edits: EditOrchestrator::new(
                    generator,
                    sandbox.clone(),
                    sessions.clone(),
                    GenerationOptions::edit(&Default::default()),
                ),
                deployments: DeploymentOrchestrator::new(
                    sessions,
                    Arc::new(FakeSourceHost::succeeding("octo")),
                    Arc::new(hosting),
                    DeploySection::default(),
                ),
                sandboxes: sandbox.clone(),
                stream_timeout: Duration::from_secs(300),
                keep_alive: Duration::from_secs(15),
            });
            Self { state, sandbox }
        }

        fn app(&self) -> Router {
            api_router().with_state(self.state.clone())
        }
    }

    fn harness() -> Harness {
        Harness::new("<explanation>ok</explanation>", FakeHostingPlatform::ready())
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sid(s: &str) -> SessionId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = harness().app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_start_build_is_accepted() {
        let h = harness();
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/builds",
                serde_json::json!({"prompt": "a todo app", "sessionId": "abc_123"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["sessionId"], "abc_123");
        assert!(h.state.sessions.contains(&sid("abc_123")));
    }

    #[tokio::test]
    async fn test_start_build_rejects_bad_input_before_touching_state() {
        let h = harness();
        for body in [
            serde_json::json!({"prompt": "   "}),
            serde_json::json!({"prompt": "x", "sessionId": "has space"}),
            serde_json::json!({"prompt": "x", "sessionId": "../../etc"}),
        ] {
            let response = h
                .app()
                .oneshot(json_request("POST", "/api/builds", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["success"], false);
        }
        assert!(h.state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_bodies_get_error_envelope() {
        let h = harness();
        for uri in ["/api/builds", "/api/edits", "/api/deployments"] {
            let requests = [
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
                json_request("POST", uri, serde_json::json!({"prompt": 7, "message": 7, "sessionId": 7})),
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from("{}"))
                    .unwrap(),
            ];
            for request in requests {
                let response = h.app().oneshot(request).await.unwrap();
                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
                let body = body_json(response).await;
                assert_eq!(body["success"], false);
                assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
            }
        }
        assert!(h.state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_events_stream_replays_log_and_closes() {
        let h = harness();
        let id = sid("s1");
        h.state.sessions.append(&id, "a");
        h.state.sessions.append(&id, "b");
        h.state.sessions.complete(&id, "http://x");

        let response = h.app().oneshot(get("/api/sessions/s1/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(
            text,
            "data: {\"message\":\"a\"}\n\ndata: {\"message\":\"b\"}\n\ndata: {\"message\":\"COMPLETE:http://x\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_events_rejects_invalid_session_id() {
        let response = harness()
            .app()
            .oneshot(get("/api/sessions/bad%20id/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_files_and_archive() {
        let h = harness();
        let id = sid("s2");
        h.state.sessions.put_files(
            &id,
            vec![
                FileChange::create("package.json", "{}"),
                FileChange::create("src/app/page.tsx", "page"),
            ],
        );

        let response = h.app().oneshot(get("/api/sessions/s2/files")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["files"][1]["path"], "src/app/page.tsx");
        assert_eq!(body["files"][1]["operation"], "create");

        let response = h.app().oneshot(get("/api/sessions/s2/archive")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"shipwright-s2.zip\""
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let files = extract_archive(&bytes).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_files_is_404() {
        let h = harness();
        for uri in ["/api/sessions/nope/files", "/api/sessions/nope/archive"] {
            let response = h.app().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_edit_validation_and_success() {
        let h = harness();
        let response = h
            .app()
            .oneshot(json_request("POST", "/api/edits", serde_json::json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Missing message or sandboxId");

        let handle = h.sandbox.create("node:20").await.unwrap();
        h.sandbox
            .upload(&handle, "src/app/page.tsx", b"page")
            .await
            .unwrap();
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/edits",
                serde_json::json!({"message": "what does this do?", "sandboxId": handle.id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["filesUpdated"], 0);
        assert_eq!(body["explanation"], "ok");
    }

    #[tokio::test]
    async fn test_deploy_statuses() {
        let h = harness();
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/deployments",
                serde_json::json!({"sessionId": "empty"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/deployments",
                serde_json::json!({"sessionId": "s3", "commitMessage": "x".repeat(501)}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        h.state
            .sessions
            .put_files(&sid("s3"), vec![FileChange::create("package.json", "{}")]);
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/deployments",
                serde_json::json!({"sessionId": "s3", "projectName": "Todo App"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["deploymentState"], "ready");
        assert_eq!(body["filesDeployed"], 1);
        assert!(body["repoName"].as_str().unwrap().contains("todo-app"));
    }

    #[tokio::test]
    async fn test_partial_deploy_is_bad_gateway_with_repo_url() {
        let h = Harness::new("", FakeHostingPlatform::failing("build quota exceeded"));
        h.state
            .sessions
            .put_files(&sid("s4"), vec![FileChange::create("package.json", "{}")]);

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/api/deployments",
                serde_json::json!({"sessionId": "s4"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["githubUrl"].as_str().unwrap().starts_with("https://github.com/octo/"));
        assert_eq!(body["error"], "build quota exceeded");
    }

    #[tokio::test]
    async fn test_sandbox_management() {
        let h = harness();
        let a = h.sandbox.create("node:20").await.unwrap();
        let b = h.sandbox.create("node:20").await.unwrap();

        let body = body_json(h.app().oneshot(get("/api/sandboxes")).await.unwrap()).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["provider"], "fake");

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/sandboxes/{}", a.id))
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        h.sandbox.fail_delete_for(&b.id);
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/sandboxes")
            .body(Body::empty())
            .unwrap();
        let body = body_json(h.app().oneshot(request).await.unwrap()).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["failed"][0], b.id.as_str());
    }
}
