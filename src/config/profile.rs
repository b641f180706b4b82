//! Relay profile loaded from a TOML file
//!
//! A profile collects the request defaults the relay applies when a caller
//! leaves them out, and the optional system prompt injected in single-turn
//! mode.
//!
//! # Example Profile
//!
//! ```toml
//! [defaults]
//! model = "deepseek-chat"
//! temperature = 0.7
//! max_tokens = 2000
//! stream = true
//!
//! [prompt]
//! system = "You are a warm, concise assistant."
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayProfile {
    #[serde(default)]
    pub defaults: RequestDefaults,

    #[serde(default)]
    pub prompt: PromptConfig,
}

impl RelayProfile {
    /// Load a profile from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load a profile from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ProfileError> {
        let profile: RelayProfile = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.defaults.model.trim().is_empty() {
            return Err(ProfileError::Validation("defaults.model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.defaults.temperature) {
            return Err(ProfileError::Validation(format!(
                "defaults.temperature must be within 0.0..=2.0, got {}",
                self.defaults.temperature
            )));
        }
        if self.defaults.max_tokens == 0 {
            return Err(ProfileError::Validation("defaults.max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// Values filled in when a chat request omits them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDefaults {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Whether single-turn requests stream their reply
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System prompt prepended to single-turn requests
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
