// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata and the per-model price table.

use serde::{Deserialize, Serialize};

use crate::types::{Usage, UsageCost};

/// Input modalities supported by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

fn default_input_modalities() -> Vec<InputModality> {
    // Conservative default: text only.  Vision-capable models must list
    // `image` explicitly in models.yaml.
    vec![InputModality::Text]
}

/// USD per million tokens, by token class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-5", "claude-opus-4-6").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Provider identifier: "anthropic" | "openai" | "google" | "bedrock" | "mock".
    pub provider: String,
    /// Total context window in tokens.
    pub context_window: u64,
    /// Maximum output tokens per completion.
    pub max_output_tokens: u32,
    /// Supported input modalities.  Defaults to `[text]`.
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<InputModality>,
    #[serde(default)]
    pub price: ModelPrice,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by id (or display name).
pub fn lookup(model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == model_id || e.name == model_id)
}

/// Whether the model accepts image input.  Unknown models default to `false`
/// so images are never sent blind.
pub fn supports_images(model_id: &str) -> bool {
    lookup(model_id).map(|e| e.supports_images()).unwrap_or(false)
}

/// Context window for a model, with a fallback for unknown ids.
pub fn context_window(model_id: &str, default: u64) -> u64 {
    lookup(model_id).map(|e| e.context_window).unwrap_or(default)
}

/// Recompute the cost breakdown for `usage` from a model's price table.
///
/// Unknown models price at zero; token counts are still tracked.
pub fn compute_cost(model_id: &str, usage: &Usage) -> UsageCost {
    let price = lookup(model_id).map(|e| e.price).unwrap_or_default();
    cost_from_price(&price, usage)
}

pub fn cost_from_price(price: &ModelPrice, usage: &Usage) -> UsageCost {
    const MTOK: f64 = 1_000_000.0;
    let input = usage.input as f64 / MTOK * price.input;
    let output = usage.output as f64 / MTOK * price.output;
    let cache_read = usage.cache_read as f64 / MTOK * price.cache_read;
    let cache_write = usage.cache_write as f64 / MTOK * price.cache_write;
    UsageCost {
        input,
        output,
        cache_read,
        cache_write,
        total: input + output + cache_read + cache_write,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
