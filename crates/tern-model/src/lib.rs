// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod partial_json;
pub mod provider;
pub mod registry;
pub mod repair;
pub mod sanitize;
pub mod stream;
mod types;
mod anthropic;
mod bedrock;
mod google;
mod mock;
mod openai;
mod openai_responses;

pub use anthropic::AnthropicDriver;
pub use bedrock::BedrockDriver;
pub use catalog::{InputModality, ModelCatalogEntry, ModelPrice};
pub use google::GoogleDriver;
pub use mock::{text_script, tool_script, ScriptedDriver};
pub use openai::OpenAiDriver;
pub use openai_responses::OpenAiResponsesDriver;
pub use provider::{
    default_stop_reason, stream, ProviderDriver, StreamOptions, UsageUpdate, WireBlock, WireEvent,
    WireStream,
};
pub use registry::{get_driver, known_driver_ids, list_drivers, DriverMeta};
pub use stream::{EventSink, EventStream, StreamError};
pub use types::*;

use std::sync::Arc;

use anyhow::bail;
use tern_config::{ApiKind, ModelConfig};

/// Construct a shared [`ProviderDriver`] from configuration.
///
/// Selects the driver by `cfg.provider`, resolving the API key from explicit
/// config, the configured env var, or the registry's default env var.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ProviderDriver>> {
    let key = resolve_api_key(cfg);
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicDriver::new(
            key,
            cfg.base_url.clone(),
            cfg.headers.clone(),
        ))),
        "bedrock" => Ok(Arc::new(BedrockDriver::new(cfg.aws_region.clone()))),
        "openai" => match cfg.api {
            ApiKind::OpenaiResponses => Ok(Arc::new(OpenAiResponsesDriver::new(
                key,
                cfg.base_url.clone(),
                cfg.headers.clone(),
            ))),
            _ => Ok(Arc::new(OpenAiDriver::new(
                key,
                cfg.base_url.clone(),
                cfg.headers.clone(),
            ))),
        },
        "openai-responses" => Ok(Arc::new(OpenAiResponsesDriver::new(
            key,
            cfg.base_url.clone(),
            cfg.headers.clone(),
        ))),
        "google" => Ok(Arc::new(GoogleDriver::new(key, cfg.base_url.clone()))),
        "mock" => Ok(Arc::new(ScriptedDriver::new(vec![]))),
        other => {
            let known: Vec<&str> = registry::known_driver_ids().collect();
            bail!(
                "unknown model provider: {other:?}\n\
                 Known providers: {known}",
                known = known.join(", ")
            )
        }
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(meta) = registry::get_driver(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}
