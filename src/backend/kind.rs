//! The four backend kinds and their presets.
//!
//! Exactly one kind is active per process. Each preset names the dialect the
//! kind speaks, a default base URL (when the provider has a well-known one)
//! and the environment variable the credential is read from by default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::dialect::{Dialect, AZURE_DATABRICKS, LITELLM_ANTHROPIC, LITELLM_OPENROUTER, OPENROUTER};
use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// OpenRouter chat-completions, called directly.
    OpenRouter,
    /// A LiteLLM proxy exposing the Anthropic Messages format.
    LiteLlm,
    /// A Claude model served from an Azure Databricks serving endpoint.
    AzureDatabricks,
    /// OpenRouter reached through a LiteLLM proxy.
    LiteLlmOpenRouter,
}

#[derive(Debug, Clone)]
pub struct BackendPreset {
    pub kind: BackendKind,
    pub default_base_url: Option<&'static str>,
    pub default_api_key_env: &'static str,
    pub dialect: &'static Dialect,
}

static PRESETS: &[BackendPreset] = &[
    BackendPreset {
        kind: BackendKind::OpenRouter,
        default_base_url: Some("https://openrouter.ai/api/v1"),
        default_api_key_env: "OPENROUTER_API_KEY",
        dialect: &OPENROUTER,
    },
    BackendPreset {
        kind: BackendKind::LiteLlm,
        default_base_url: None,
        default_api_key_env: "LITELLM_API_KEY",
        dialect: &LITELLM_ANTHROPIC,
    },
    BackendPreset {
        kind: BackendKind::AzureDatabricks,
        default_base_url: None,
        default_api_key_env: "DATABRICKS_TOKEN",
        dialect: &AZURE_DATABRICKS,
    },
    BackendPreset {
        kind: BackendKind::LiteLlmOpenRouter,
        default_base_url: None,
        default_api_key_env: "LITELLM_API_KEY",
        dialect: &LITELLM_OPENROUTER,
    },
];

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::OpenRouter,
        BackendKind::LiteLlm,
        BackendKind::AzureDatabricks,
        BackendKind::LiteLlmOpenRouter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::OpenRouter => "openrouter",
            BackendKind::LiteLlm => "litellm",
            BackendKind::AzureDatabricks => "azure_databricks",
            BackendKind::LiteLlmOpenRouter => "litellm_openrouter",
        }
    }

    #[must_use]
    pub fn preset(self) -> &'static BackendPreset {
        // PRESETS holds one entry per variant
        PRESETS
            .iter()
            .find(|p| p.kind == self)
            .unwrap_or(&PRESETS[0])
    }

    pub fn dialect(self) -> &'static Dialect {
        self.preset().dialect
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ProxyError;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "openrouter" => Ok(BackendKind::OpenRouter),
            "litellm" => Ok(BackendKind::LiteLlm),
            "azure_databricks" | "databricks" => Ok(BackendKind::AzureDatabricks),
            "litellm_openrouter" => Ok(BackendKind::LiteLlmOpenRouter),
            _ => Err(ProxyError::config(format!(
                "Unknown backend kind '{s}'. Expected one of: {}",
                BackendKind::ALL.map(BackendKind::as_str).join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = ProxyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}
