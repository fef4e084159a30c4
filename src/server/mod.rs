//! HTTP surface: JSON control endpoints plus an SSE progress stream.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use api::{ApiError, AppState, SharedState, api_router};

use crate::config::{Secrets, ShipwrightToml};
use crate::deploy::{DeploymentOrchestrator, GitHubClient, VercelClient};
use crate::generation::{AnthropicClient, GenerationOptions};
use crate::pipeline::{BuildOrchestrator, EditOrchestrator};
use crate::sandbox::{HttpProbe, Provisioner, provider_from_config};
use crate::session::SessionStore;

/// Configuration for the API server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn from_config(config: &ShipwrightToml) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev_mode,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&ShipwrightToml::default())
    }
}

impl AppState {
    /// Wire the real collaborators. Missing credentials are not an error
    /// here; the operation that needs them fails with a configuration error.
    pub fn from_config(config: &ShipwrightToml, secrets: &Secrets) -> Result<Self> {
        let sessions = SessionStore::from_config(&config.session);
        let generator = Arc::new(
            AnthropicClient::new(&config.generation, secrets.anthropic_api_key.clone())
                .context("Failed to create generation client")?,
        );
        let sandboxes = provider_from_config(&config.sandbox, secrets)
            .context("Failed to create sandbox provider")?;
        let probe = Arc::new(HttpProbe::new().context("Failed to create preview probe")?);
        let provisioner = Arc::new(Provisioner::new(
            sandboxes.clone(),
            probe,
            config.sandbox.clone(),
        ));

        let github = GitHubClient::new(secrets.github_token.clone(), secrets.github_username.clone())?
            .with_init_delay(config.deploy.repo_init_delay());
        let vercel = VercelClient::new(
            secrets.vercel_token.clone(),
            secrets.vercel_team_id.clone(),
            config.deploy.clone(),
        )?;

        Ok(Self {
            builds: Arc::new(BuildOrchestrator::new(
                generator.clone(),
                provisioner,
                sessions.clone(),
                GenerationOptions::build(&config.generation),
            )),
            edits: EditOrchestrator::new(
                generator,
                sandboxes.clone(),
                sessions.clone(),
                GenerationOptions::edit(&config.generation),
            ),
            deployments: DeploymentOrchestrator::new(
                sessions.clone(),
                Arc::new(github),
                Arc::new(vercel),
                config.deploy.clone(),
            ),
            sandboxes,
            stream_timeout: config.session.stream_timeout(),
            keep_alive: config.session.keep_alive(),
            sessions,
        })
    }
}

pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Bind, serve until Ctrl+C, then stop the session sweeper. `on_ready`
/// receives the bound URL.
pub async fn start_server(
    server: ServerConfig,
    config: &ShipwrightToml,
    secrets: &Secrets,
    on_ready: impl FnOnce(&str),
) -> Result<()> {
    let state = Arc::new(AppState::from_config(config, secrets)?);
    let sweeper = state
        .sessions
        .spawn_sweeper(config.session.sweep_interval());
    let app = build_router(state, server.dev_mode);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://{}", local_addr);
    tracing::info!(%url, dev_mode = server.dev_mode, "Shipwright server listening");
    on_ready(&url);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}
