//! Typed error hierarchy for the Shipwright pipeline.
//!
//! `PipelineError` is the single error type that crosses component seams:
//! - `Validation`: bad input, surfaced verbatim, never retried
//! - `NotFound`: the named session or sandbox does not exist
//! - `Upstream`: a generation or provider API answered with a failure
//! - `Provisioning`: the sandbox never became healthy (already torn down)
//! - `PartialDeployment`: source hosting succeeded, hosting failed
//! - `Timeout`: a bounded polling loop ran out of attempts

use thiserror::Error;

use crate::sandbox::ProvisionStage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{service} API error: {status} - {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Sandbox provisioning failed while {stage}: {message}")]
    Provisioning {
        stage: ProvisionStage,
        message: String,
    },

    #[error("Repository {repo_name} was created but hosting deployment failed: {message}")]
    PartialDeployment {
        repo_url: String,
        repo_name: String,
        message: String,
    },

    #[error("{operation} did not finish after {attempts} attempts")]
    Timeout {
        operation: &'static str,
        attempts: u32,
    },

    #[error("{0} not configured in environment variables")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn provisioning(stage: ProvisionStage, message: impl Into<String>) -> Self {
        Self::Provisioning {
            stage,
            message: message.into(),
        }
    }

    /// Whether the failure was caused by the caller rather than a collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Other(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_carries_status_and_body() {
        let err = PipelineError::Upstream {
            service: "generation",
            status: 529,
            body: "overloaded".to_string(),
        };
        match &err {
            PipelineError::Upstream { status, body, .. } => {
                assert_eq!(*status, 529);
                assert_eq!(body, "overloaded");
            }
            _ => panic!("Expected Upstream"),
        }
        assert_eq!(err.to_string(), "generation API error: 529 - overloaded");
    }

    #[test]
    fn provisioning_error_names_the_stage() {
        let err = PipelineError::provisioning(ProvisionStage::Installing, "npm install failed");
        assert!(err.to_string().contains("installing"));
        assert!(err.to_string().contains("npm install failed"));
    }

    #[test]
    fn validation_error_is_surfaced_verbatim() {
        let err = PipelineError::validation("Invalid sessionId format");
        assert_eq!(err.to_string(), "Invalid sessionId format");
        assert!(err.is_client_error());
    }

    #[test]
    fn partial_deployment_keeps_repo_url() {
        let err = PipelineError::PartialDeployment {
            repo_url: "https://github.com/o/r".to_string(),
            repo_name: "r".to_string(),
            message: "Deployment failed with state: ERROR".to_string(),
        };
        match &err {
            PipelineError::PartialDeployment { repo_url, .. } => {
                assert_eq!(repo_url, "https://github.com/o/r")
            }
            _ => panic!("Expected PartialDeployment"),
        }
        assert!(!err.is_client_error());
    }

    #[test]
    fn configuration_error_names_variable() {
        let err = PipelineError::Configuration("GITHUB_TOKEN".to_string());
        assert_eq!(
            err.to_string(),
            "GITHUB_TOKEN not configured in environment variables"
        );
    }

    #[test]
    fn anyhow_errors_convert_into_other() {
        let err: PipelineError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, PipelineError::Other(_)));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::Timeout {
            operation: "deployment status polling",
            attempts: 60,
        });
    }
}
