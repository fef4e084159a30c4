//! Dev-server health signals.
//!
//! Two independent sources decide whether a freshly started dev server is
//! usable: its own log output inside the sandbox, and an HTTP probe against
//! the externally reachable preview URL.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

/// Lines that mean the server is definitely broken.
const FATAL_MARKERS: &[&str] = &[
    "eaddrinuse",
    "address already in use",
    "module_not_found",
    "cannot find module",
    "module not found",
    "failed to compile",
    "error: listen",
];

/// Startup lines that mean the server is up (or compiling, which implies
/// up). Word-bounded so "already in use" never reads as "ready in".
static READY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ready in|started server on|compiling)\b|✓\s*ready\b")
        .expect("ready marker pattern is a valid static regex")
});

/// What the dev-server log says about health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    Ready,
    /// The offending log line, trimmed.
    Fatal(String),
    /// Neither kind of marker; silence is not failure.
    Ambiguous,
}

/// Classify a dev-server log.
///
/// Any ready marker means the server is up, and later errors (a page that
/// fails its first compile, a missing font) are left for edits to fix.
/// Fatal markers only decide when the server never reported ready; the
/// first fatal line is returned.
pub fn classify_server_log(log: &str) -> HealthSignal {
    if READY_PATTERN.is_match(log) {
        return HealthSignal::Ready;
    }
    log.lines()
        .find(|line| {
            let lowered = line.to_lowercase();
            FATAL_MARKERS.iter().any(|m| lowered.contains(m))
        })
        .map_or(HealthSignal::Ambiguous, |line| {
            HealthSignal::Fatal(line.trim().to_string())
        })
}

/// Outcome of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy { status: u16 },
    Unhealthy { status: u16 },
    Unreachable { reason: String },
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy { .. })
    }

    /// 2xx, 3xx and 404 all prove a live server process.
    pub fn from_status(status: u16) -> Self {
        if (200..400).contains(&status) || status == 404 {
            ProbeResult::Healthy { status }
        } else {
            ProbeResult::Unhealthy { status }
        }
    }
}

/// Checks that a URL is served from outside the sandbox.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeResult;
}

/// `HEAD` request with a short timeout. Redirects are not followed.
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub const TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self, url: &str) -> ProbeResult {
        match self.http.head(url).send().await {
            Ok(resp) => ProbeResult::from_status(resp.status().as_u16()),
            Err(e) => ProbeResult::Unreachable {
                reason: e.to_string(),
            },
        }
    }
}
