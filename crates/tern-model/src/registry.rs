// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for every supported API driver.
//!
//! Single source of truth for which driver ids exist and what their defaults
//! are.  Construction logic lives in [`crate::from_config`].

use tern_config::ApiKind;

/// Metadata describing a registered provider driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique driver id used in `model.provider` config (e.g. `"anthropic"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Wire protocol this driver speaks.
    pub api: ApiKind,
    /// Default environment variable holding the API key.  `None` for drivers
    /// that need no key (mock) or use non-key auth (Bedrock/SigV4).
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when config does not set one.
    pub default_base_url: Option<&'static str>,
    pub requires_api_key: bool,
}

/// Complete registry of supported drivers.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Claude models via the Messages API",
        api: ApiKind::AnthropicMessages,
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "bedrock",
        name: "AWS Bedrock",
        description: "Anthropic Claude models via AWS Bedrock (SigV4 auth)",
        api: ApiKind::BedrockMessages,
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
    },
    DriverMeta {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI models via the Chat Completions API",
        api: ApiKind::OpenaiCompletions,
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "openai-responses",
        name: "OpenAI Responses",
        description: "OpenAI models via the Responses API",
        api: ApiKind::OpenaiResponses,
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "google",
        name: "Google Gemini",
        description: "Google Gemini models via the Generative Language API",
        api: ApiKind::GoogleGenerativeAi,
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "mock",
        name: "Mock",
        description: "Scripted driver for tests (no network)",
        api: ApiKind::Mock,
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
    },
];

/// Returns all registered drivers in declaration order.
pub fn list_drivers() -> &'static [DriverMeta] {
    DRIVERS
}

/// Look up a driver by its id.  Returns `None` for unknown ids.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// Returns an iterator over all known driver ids.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}
