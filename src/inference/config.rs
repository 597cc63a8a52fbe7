//! Completion-engine configuration and config-text helpers.
//!
//! `ModelConfig` is the `model:` section of `switchboard.yaml`. The
//! interpolation helpers are shared with the application config loader.

use serde::Deserialize;

/// Endpoint and sampling settings for the completion engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent in every request.
    #[serde(default = "default_model_name", alias = "name")]
    pub model_name: String,
    /// OpenAI-compatible base URL (without `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token. When unset, `api_key_env` is read at request time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Whole-stream timeout in seconds.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

fn default_model_name() -> String {
    "deepseek-chat".to_string()
}
fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_stream_timeout_secs() -> u64 {
    180
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: None,
            stream_timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// The configured key, else the value of `api_key_env`. Empty values
    /// count as unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__SWITCHBOARD_NONEXISTENT_VAR__");
        let input = "${__SWITCHBOARD_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__SWITCHBOARD_MODEL_VAR__", "https://llm.internal/v1");
        let input = "base_url: ${__SWITCHBOARD_MODEL_VAR__:-http://localhost}";
        assert_eq!(interpolate_env_vars(input), "base_url: https://llm.internal/v1");
        std::env::remove_var("__SWITCHBOARD_MODEL_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with a $ sign";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/providers");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/providers"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: ModelConfig = serde_yaml::from_str("temperature: 0.2").unwrap();
        assert_eq!(config.model_name, "deepseek-chat");
        assert_eq!(config.base_url, "https://api.deepseek.com/v1");

        let named: ModelConfig = serde_yaml::from_str("name: qwen2.5-7b").unwrap();
        assert_eq!(named.model_name, "qwen2.5-7b");
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = ModelConfig {
            api_key: Some("sk-test".to_string()),
            api_key_env: "__SWITCHBOARD_UNSET_KEY__".to_string(),
            ..ModelConfig::default()
        };
        assert_eq!(config.resolved_api_key().as_deref(), Some("sk-test"));

        let blank = ModelConfig {
            api_key: Some("  ".to_string()),
            ..config
        };
        assert!(blank.resolved_api_key().is_none());
    }
}
