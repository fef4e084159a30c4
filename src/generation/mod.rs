//! Code generation client.
//!
//! The pipeline talks to the language model only through [`CodeGenerator`],
//! so orchestrators can be driven by a scripted double in tests. The client
//! does not check that the model followed the response protocol; that is
//! [`crate::files::parse_response`]'s job.

pub mod anthropic;
pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GenerationSection;
use crate::errors::PipelineError;

pub use anthropic::AnthropicClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling settings for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl GenerationOptions {
    /// Settings for generating a whole project from a prompt.
    pub fn build(config: &GenerationSection) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.build_max_tokens,
            temperature: config.build_temperature,
        }
    }

    /// Settings for editing a live project.
    pub fn edit(config: &GenerationSection) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.edit_max_tokens,
            temperature: config.edit_temperature,
        }
    }
}

/// Raw model output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// Extended-thinking output, when the model returned any.
    pub thinking: Option<String>,
}

/// Sends a conversation plus a system contract to a language model.
///
/// Real implementation: [`AnthropicClient`]. No retries happen at this layer.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        conversation: &[ChatMessage],
        system: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, PipelineError>;
}
