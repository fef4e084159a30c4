//! Layered configuration for Shipwright.
//!
//! Settings come from `.shipwright/shipwright.toml` (every field has a
//! default), then the process environment (`.env` is loaded by the binary
//! with `dotenvy`), then CLI flags. Credentials are never read from the
//! file; see [`Secrets`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [generation]
//! model = "claude-sonnet-4-20250514"
//! build_max_tokens = 8000
//! edit_temperature = 0.7
//!
//! [sandbox]
//! provider = "daytona"
//! image = "node:20"
//! port = 3000
//! install_timeout_secs = 300
//!
//! [deploy]
//! repo_prefix = "shipwright"
//! poll_attempts = 60
//!
//! [session]
//! stream_timeout_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::deploy::is_valid_github_token;
use crate::errors::PipelineError;

pub const CONFIG_DIR: &str = ".shipwright";
pub const CONFIG_FILE: &str = "shipwright.toml";

/// Path of the project configuration file under `project_dir`.
pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

// ── Sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Enables permissive CORS for a separately served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_build_max_tokens")]
    pub build_max_tokens: u32,
    #[serde(default = "default_build_temperature")]
    pub build_temperature: f64,
    #[serde(default = "default_edit_max_tokens")]
    pub edit_max_tokens: u32,
    #[serde(default = "default_edit_temperature")]
    pub edit_temperature: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_build_max_tokens() -> u32 {
    8000
}

fn default_build_temperature() -> f64 {
    1.0
}

fn default_edit_max_tokens() -> u32 {
    16000
}

fn default_edit_temperature() -> f64 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            build_max_tokens: default_build_max_tokens(),
            build_temperature: default_build_temperature(),
            edit_max_tokens: default_edit_max_tokens(),
            edit_temperature: default_edit_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Which sandbox backend provisions preview environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProviderKind {
    #[default]
    Daytona,
    /// Directories on this machine; for development without a control plane.
    Local,
}

impl std::fmt::Display for SandboxProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxProviderKind::Daytona => write!(f, "daytona"),
            SandboxProviderKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for SandboxProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daytona" => Ok(SandboxProviderKind::Daytona),
            "local" => Ok(SandboxProviderKind::Local),
            _ => anyhow::bail!(
                "Invalid sandbox provider '{}'. Valid values: daytona, local",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: SandboxProviderKind,
    #[serde(default = "default_image")]
    pub image: String,
    /// Port the dev server binds inside the sandbox.
    #[serde(default = "default_sandbox_port")]
    pub port: u16,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_dev_command")]
    pub dev_command: String,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Root directory for the `local` provider.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

fn default_image() -> String {
    "node:20".to_string()
}

fn default_sandbox_port() -> u16 {
    3000
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_settle_delay_secs() -> u64 {
    8
}

fn default_health_interval_secs() -> u64 {
    2
}

fn default_health_attempts() -> u32 {
    30
}

fn default_probe_attempts() -> u32 {
    30
}

fn default_log_file() -> String {
    "dev-server.log".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("sandboxes")
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: SandboxProviderKind::default(),
            image: default_image(),
            port: default_sandbox_port(),
            install_command: default_install_command(),
            dev_command: default_dev_command(),
            install_timeout_secs: default_install_timeout_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            health_interval_secs: default_health_interval_secs(),
            health_attempts: default_health_attempts(),
            probe_attempts: default_probe_attempts(),
            log_file: default_log_file(),
            local_root: default_local_root(),
        }
    }
}

impl SandboxSection {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default = "default_repo_prefix")]
    pub repo_prefix: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub private_repo: bool,
    #[serde(default = "default_framework")]
    pub framework: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_dev_command")]
    pub dev_command: String,
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default = "default_repo_init_delay_secs")]
    pub repo_init_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
}

fn default_repo_prefix() -> String {
    "shipwright".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_framework() -> String {
    "nextjs".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_output_directory() -> String {
    ".next".to_string()
}

fn default_repo_init_delay_secs() -> u64 {
    2
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    60
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            repo_prefix: default_repo_prefix(),
            branch: default_branch(),
            private_repo: false,
            framework: default_framework(),
            build_command: default_build_command(),
            install_command: default_install_command(),
            dev_command: default_dev_command(),
            output_directory: default_output_directory(),
            repo_init_delay_secs: default_repo_init_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_attempts: default_poll_attempts(),
        }
    }
}

impl DeploySection {
    pub fn repo_init_delay(&self) -> Duration {
        Duration::from_secs(self.repo_init_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Wall-clock cap on a single progress stream.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// How long a finished session keeps its full progress log.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_stream_timeout_secs() -> u64 {
    300
}

fn default_grace_secs() -> u64 {
    5
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_keep_alive_secs() -> u64 {
    15
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            stream_timeout_secs: default_stream_timeout_secs(),
            grace_secs: default_grace_secs(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl SessionSection {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

// ── Root document ─────────────────────────────────────────────────────

/// The full `shipwright.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipwrightToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub session: SessionSection,
}

impl ShipwrightToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipwright.toml")
    }

    /// Load `.shipwright/shipwright.toml` under `project_dir`, or defaults
    /// when the file does not exist. Environment overrides are applied
    /// either way.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize shipwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Non-secret environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("SHIPWRIGHT_MODEL")
            && !model.trim().is_empty()
        {
            self.generation.model = model;
        }
        if let Ok(provider) = std::env::var("SHIPWRIGHT_SANDBOX_PROVIDER") {
            match provider.parse() {
                Ok(kind) => self.sandbox.provider = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring SHIPWRIGHT_SANDBOX_PROVIDER"),
            }
        }
        if let Ok(port) = std::env::var("SHIPWRIGHT_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid SHIPWRIGHT_PORT"),
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, value) in [
            ("sandbox.health_attempts", self.sandbox.health_attempts),
            ("sandbox.probe_attempts", self.sandbox.probe_attempts),
            ("deploy.poll_attempts", self.deploy.poll_attempts),
        ] {
            if value == 0 {
                warnings.push(format!("{} is 0: the polling loop will never run", name));
            }
        }

        for (name, value) in [
            ("sandbox.health_interval_secs", self.sandbox.health_interval_secs),
            ("deploy.poll_interval_secs", self.deploy.poll_interval_secs),
            ("session.sweep_interval_secs", self.session.sweep_interval_secs),
            ("session.stream_timeout_secs", self.session.stream_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!("{} is 0", name));
            }
        }

        for (name, value) in [
            ("generation.build_temperature", self.generation.build_temperature),
            ("generation.edit_temperature", self.generation.edit_temperature),
        ] {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(format!("{} = {} is outside 0.0..=1.0", name, value));
            }
        }

        if self.session.ttl_secs < self.session.stream_timeout_secs {
            warnings.push(format!(
                "session.ttl_secs ({}) is shorter than session.stream_timeout_secs ({})",
                self.session.ttl_secs, self.session.stream_timeout_secs
            ));
        }

        if self.sandbox.port == self.server.port {
            warnings.push(format!(
                "sandbox.port and server.port are both {}",
                self.server.port
            ));
        }

        warnings
    }
}

// ── Secrets ───────────────────────────────────────────────────────────

/// Credentials for external collaborators, read only from the environment.
#[derive(Clone, Default)]
pub struct Secrets {
    pub anthropic_api_key: Option<String>,
    pub daytona_api_key: Option<String>,
    pub daytona_api_url: Option<String>,
    pub daytona_target: Option<String>,
    pub github_token: Option<String>,
    pub github_username: Option<String>,
    pub vercel_token: Option<String>,
    pub vercel_team_id: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(value: &Option<String>) -> &'static str {
            if value.is_some() { "<set>" } else { "<unset>" }
        }
        f.debug_struct("Secrets")
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("daytona_api_key", &mask(&self.daytona_api_key))
            .field("daytona_api_url", &self.daytona_api_url)
            .field("daytona_target", &self.daytona_target)
            .field("github_token", &mask(&self.github_token))
            .field("github_username", &self.github_username)
            .field("vercel_token", &mask(&self.vercel_token))
            .field("vercel_team_id", &self.vercel_team_id)
            .finish()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: env_var("ANTHROPIC_API_KEY").or_else(|| env_var("CLAUDE_API_KEY")),
            daytona_api_key: env_var("DAYTONA_API_KEY"),
            daytona_api_url: env_var("DAYTONA_API_URL"),
            daytona_target: env_var("DAYTONA_TARGET"),
            github_token: env_var("GITHUB_TOKEN"),
            github_username: env_var("GITHUB_USERNAME"),
            vercel_token: env_var("VERCEL_TOKEN"),
            vercel_team_id: env_var("VERCEL_TEAM_ID"),
        }
    }

    /// Borrow a required credential or fail with a configuration error
    /// naming the variable.
    pub fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, PipelineError> {
        value
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration(name.to_string()))
    }

    /// Warnings about credentials, suitable for `config validate`.
    pub fn validate(&self, config: &ShipwrightToml) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.anthropic_api_key.is_none() {
            warnings.push("ANTHROPIC_API_KEY is not set: builds and edits will fail".to_string());
        }
        if config.sandbox.provider == SandboxProviderKind::Daytona && self.daytona_api_key.is_none()
        {
            warnings.push("DAYTONA_API_KEY is not set: sandbox provisioning will fail".to_string());
        }
        match &self.github_token {
            None => warnings.push("GITHUB_TOKEN is not set: deployments will fail".to_string()),
            Some(token) if !is_valid_github_token(token) => warnings.push(
                "GITHUB_TOKEN does not look like a GitHub token (expected ghp_, github_pat_, ...)"
                    .to_string(),
            ),
            Some(_) => {}
        }
        if self.vercel_token.is_none() {
            warnings.push("VERCEL_TOKEN is not set: hosting deployments will fail".to_string());
        }
        warnings
    }
}
