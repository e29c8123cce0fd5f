//! Model-name mapping.
//!
//! Clients send Anthropic model names (or the `big` / `small` aliases); the
//! mapper turns them into the name the active backend understands. Responses
//! always echo the name the client asked for.

use crate::backend::dialect::Dialect;
use crate::config::BackendConfig;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ModelMapper {
    table: HashMap<String, String>,
    big_model: Option<String>,
    small_model: Option<String>,
    dialect: &'static Dialect,
}

impl ModelMapper {
    pub fn new(config: &BackendConfig, dialect: &'static Dialect) -> Self {
        Self {
            table: config.models.clone(),
            big_model: config.big_model.clone(),
            small_model: config.small_model.clone(),
            dialect,
        }
    }

    /// Backend model name for a client-requested model.
    ///
    /// Exact table entries win; then `big`/opus/sonnet map to the big model
    /// and `small`/haiku to the small one; anything else passes through.
    pub fn resolve(&self, requested: &str) -> String {
        let mapped = self
            .table
            .get(requested)
            .cloned()
            .or_else(|| self.alias(requested).map(str::to_string))
            .unwrap_or_else(|| requested.to_string());

        self.dialect.qualify_model(&mapped)
    }

    fn alias(&self, requested: &str) -> Option<&str> {
        let lower = requested.to_lowercase();
        if lower == "big" || lower.contains("opus") || lower.contains("sonnet") {
            return self.big_model.as_deref();
        }
        if lower == "small" || lower.contains("haiku") {
            return self.small_model.as_deref();
        }
        None
    }

    /// Model ids the gateway advertises on `/v1/models`.
    pub fn advertised(&self) -> ModelList {
        let mut ids: Vec<String> = self.table.keys().cloned().collect();
        ids.sort();
        if self.big_model.is_some() {
            ids.push("big".to_string());
        }
        if self.small_model.is_some() {
            ids.push("small".to_string());
        }

        let data: Vec<ModelInfo> = ids
            .into_iter()
            .map(|id| ModelInfo {
                display_name: self.resolve(&id),
                id,
                model_type: "model",
            })
            .collect();

        ModelList {
            first_id: data.first().map(|m| m.id.clone()),
            last_id: data.last().map(|m| m.id.clone()),
            has_more: false,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: &'static str,
    /// Backend model the id resolves to.
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub data: Vec<ModelInfo>,
    pub has_more: bool,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dialect::{LITELLM_OPENROUTER, OPENROUTER};

    fn config() -> BackendConfig {
        let mut config = BackendConfig::default();
        config.big_model = Some("anthropic/claude-3.5-sonnet".to_string());
        config.small_model = Some("anthropic/claude-3-haiku".to_string());
        config
            .models
            .insert("claude-3-opus-20240229".to_string(), "openai/gpt-4o".to_string());
        config
    }

    #[test]
    fn test_exact_entry_beats_alias() {
        let mapper = ModelMapper::new(&config(), &OPENROUTER);
        assert_eq!(mapper.resolve("claude-3-opus-20240229"), "openai/gpt-4o");
        assert_eq!(mapper.resolve("claude-opus-4"), "anthropic/claude-3.5-sonnet");
    }

    #[test]
    fn test_aliases() {
        let mapper = ModelMapper::new(&config(), &OPENROUTER);
        assert_eq!(mapper.resolve("big"), "anthropic/claude-3.5-sonnet");
        assert_eq!(mapper.resolve("claude-3-5-sonnet-20241022"), "anthropic/claude-3.5-sonnet");
        assert_eq!(mapper.resolve("small"), "anthropic/claude-3-haiku");
        assert_eq!(mapper.resolve("claude-3-5-haiku-latest"), "anthropic/claude-3-haiku");
        assert_eq!(mapper.resolve("mistral/large"), "mistral/large");
    }

    #[test]
    fn test_alias_without_target_passes_through() {
        let mapper = ModelMapper::new(&BackendConfig::default(), &OPENROUTER);
        assert_eq!(mapper.resolve("big"), "big");
    }

    #[test]
    fn test_dialect_prefix_applied_after_mapping() {
        let mapper = ModelMapper::new(&config(), &LITELLM_OPENROUTER);
        assert_eq!(mapper.resolve("big"), "openrouter/anthropic/claude-3.5-sonnet");
    }

    #[test]
    fn test_advertised_lists_table_and_aliases() {
        let mapper = ModelMapper::new(&config(), &OPENROUTER);
        let list = mapper.advertised();
        let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["claude-3-opus-20240229", "big", "small"]);
        assert_eq!(list.first_id.as_deref(), Some("claude-3-opus-20240229"));
        assert_eq!(list.data[1].display_name, "anthropic/claude-3.5-sonnet");
    }
}
