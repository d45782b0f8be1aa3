// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should default to enabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    /// Named provider configurations, referenced by key.
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

/// Which wire protocol a driver speaks.
///
/// Distinct from the provider identity: Anthropic models are reachable both
/// through the native Messages API and through Bedrock, and OpenAI models
/// through both the Completions and the Responses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    AnthropicMessages,
    BedrockMessages,
    OpenaiCompletions,
    OpenaiResponses,
    GoogleGenerativeAi,
    Mock,
}

impl Default for ApiKind {
    fn default() -> Self {
        Self::AnthropicMessages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "google" | "bedrock" | "mock".
    pub provider: String,
    /// Wire protocol for this model.
    #[serde(default)]
    pub api: ApiKind,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in config files so secrets stay
    /// out of version control.
    pub api_key: Option<String>,
    /// Base URL override for local proxies and gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// AWS region override for Bedrock (also honoured via AWS_DEFAULT_REGION).
    pub aws_region: Option<String>,
    /// Extra headers forwarded verbatim on every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            api: ApiKind::AnthropicMessages,
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            aws_region: None,
            headers: Vec::new(),
        }
    }
}

/// Reasoning effort requested from models that support extended thinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        Self::Off
    }
}

impl ThinkingLevel {
    /// Thinking-token budget forwarded to providers that take an explicit
    /// budget (Anthropic / Bedrock).  `None` disables thinking.
    pub fn budget_tokens(self) -> Option<u32> {
        match self {
            Self::Off => None,
            Self::Low => Some(2_048),
            Self::Medium => Some(8_192),
            Self::High => Some(24_576),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default thinking level for new sessions.
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    /// Display name recorded in the session header.
    pub session_name: Option<String>,
    /// Seconds a tool may run before it is terminated.
    pub tool_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            thinking_level: ThinkingLevel::Off,
            session_name: None,
            tool_timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests inside one rolling window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Minimum spacing between consecutive requests in milliseconds.
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: 60_000,
            min_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Milliseconds the breaker stays open before probing half-open.
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Whether the inbound poller runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Milliseconds between idle ticks.
    pub interval_ms: u64,
    /// Maximum work items fetched per tick.
    pub batch_limit: usize,
    /// Multiplier applied to the interval after each consecutive store error.
    pub backoff_factor: f64,
    /// Ceiling for the backed-off interval in milliseconds.
    pub backoff_cap_ms: u64,
    /// Consecutive failures before the poller reports itself degraded.
    pub failure_threshold: u32,
    /// Recently claimed ids remembered for deduplication.
    pub dedup_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2_000,
            batch_limit: 10,
            backoff_factor: 2.0,
            backoff_cap_ms: 60_000,
            failure_threshold: 5,
            dedup_capacity: 1_024,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert!(cfg.poller.enabled);
    }

    #[test]
    fn model_config_round_trips() {
        let cfg = ModelConfig {
            provider: "openai".into(),
            api: ApiKind::OpenaiResponses,
            name: "gpt-5".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            ..ModelConfig::default()
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: ModelConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.provider, "openai");
        assert_eq!(back.api, ApiKind::OpenaiResponses);
        assert_eq!(back.name, "gpt-5");
    }

    #[test]
    fn api_kind_uses_kebab_case_on_the_wire() {
        let yaml = serde_yaml::to_string(&ApiKind::OpenaiCompletions).unwrap();
        assert!(yaml.contains("openai-completions"), "got: {yaml}");
    }

    #[test]
    fn thinking_level_budgets_are_monotonic() {
        assert!(ThinkingLevel::Off.budget_tokens().is_none());
        let low = ThinkingLevel::Low.budget_tokens().unwrap();
        let med = ThinkingLevel::Medium.budget_tokens().unwrap();
        let high = ThinkingLevel::High.budget_tokens().unwrap();
        assert!(low < med && med < high);
    }

    #[test]
    fn poller_defaults_are_sane() {
        let p = PollerConfig::default();
        assert!(p.backoff_factor > 1.0);
        assert!(p.backoff_cap_ms >= p.interval_ms);
        assert!(p.dedup_capacity > 0);
    }

    #[test]
    fn named_providers_parse() {
        let yaml = r#"
providers:
  work:
    provider: anthropic
    name: claude-opus-4-6
    api_key_env: WORK_ANTHROPIC_KEY
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let work = cfg.providers.get("work").unwrap();
        assert_eq!(work.name, "claude-opus-4-6");
        assert_eq!(work.api_key_env.as_deref(), Some("WORK_ANTHROPIC_KEY"));
    }
}
