// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic-on-Bedrock driver — Messages API semantics over AWS transport.
//!
//! The full SigV4 signing algorithm is implemented locally using `sha2` and
//! `hex` (already workspace dependencies) to avoid pulling in the AWS SDK.
//!
//! # Framing
//! Bedrock delivers the provider's JSON events as newline-delimited text
//! inside binary chunks.  Partial lines are buffered across chunks; complete
//! lines that fail to parse are framing artifacts and are dropped (logged at
//! debug level), not surfaced as stream errors.
//!
//! # Credentials
//! Read from env vars: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
//! `AWS_SESSION_TOKEN` (optional), `AWS_DEFAULT_REGION` / `AWS_REGION`
//! (fallback `us-east-1`).

use anyhow::{bail, Context as AnyhowContext};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::anthropic::{build_messages_params, decode_messages_event};
use crate::provider::{ProviderDriver, StreamOptions, WireEvent, WireStream};
use crate::provider::json_lines;
use crate::types::Context;

pub struct BedrockDriver {
    region: String,
    client: reqwest::Client,
}

impl BedrockDriver {
    pub fn new(region: Option<String>) -> Self {
        let region = region
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| "us-east-1".into());
        Self {
            region,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderDriver for BedrockDriver {
    fn api(&self) -> &'static str {
        "bedrock-messages"
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn build_params(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<Value> {
        // Bedrock takes the model in the URL and streams by endpoint choice,
        // so the body carries neither; it declares the Messages schema
        // version instead.
        let mut body = build_messages_params(model, context, options, false)?;
        body["anthropic_version"] = json!("bedrock-2023-05-31");
        Ok(body)
    }

    async fn create_event_stream(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<WireStream> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        let body = self.build_params(model, context, options)?;
        let body_bytes = serde_json::to_vec(&body)?;

        let host = format!("bedrock-runtime.{}.amazonaws.com", self.region);
        let path = format!("/model/{}/invoke-with-response-stream", urlencoded(model));
        let url = format!("https://{host}{path}");

        debug!(model, region = %self.region, "sending bedrock request");

        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = &date_time[..8];
        let content_type = "application/json";
        let service = "bedrock";

        let headers_to_sign: Vec<(&str, &str)> = {
            let mut h = vec![
                ("content-type", content_type),
                ("host", host.as_str()),
                ("x-amz-date", date_time.as_str()),
            ];
            if let Some(tok) = &session_token {
                h.push(("x-amz-security-token", tok.as_str()));
            }
            h.sort_by_key(|&(k, _)| k);
            h
        };

        let canonical_headers: String = headers_to_sign
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
            .collect();
        let signed_headers: String = headers_to_sign
            .iter()
            .map(|(k, _)| k.to_lowercase())
            .collect::<Vec<_>>()
            .join(";");
        let body_hash = hex_sha256(&body_bytes);

        let canonical_request = format!(
            "POST\n{}\n\n{}\n{}\n{}",
            path, canonical_headers, signed_headers, body_hash
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", date, self.region, service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(secret_key.as_bytes(), date, &self.region, service);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            access_key, credential_scope, signed_headers, signature
        );

        let mut request = self
            .client
            .post(&url)
            .header("content-type", content_type)
            .header("host", &host)
            .header("x-amz-date", &date_time)
            .header("Authorization", &authorization)
            .body(body_bytes);
        if let Some(tok) = &session_token {
            request = request.header("x-amz-security-token", tok);
        }

        let resp = request.send().await.context("Bedrock request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Bedrock error {status}: {text}");
        }

        Ok(json_lines(resp))
    }

    fn decode_event(&self, raw: &Value) -> Vec<WireEvent> {
        decode_messages_event(raw)
    }
}

// ── SigV4 helpers ─────────────────────────────────────────────────────────────

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// HMAC-SHA256 computed without the `hmac` crate using the raw SHA256 primitive.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let norm_key = if key.len() > BLOCK {
        sha256(key)
    } else {
        key.to_vec()
    };
    let mut padded = [0u8; BLOCK];
    padded[..norm_key.len()].copy_from_slice(&norm_key);
    let ipad: Vec<u8> = padded.iter().map(|&b| b ^ 0x36).collect();
    let opad: Vec<u8> = padded.iter().map(|&b| b ^ 0x5c).collect();
    let inner = {
        let mut h = Sha256::new();
        h.update(&ipad);
        h.update(data);
        h.finalize().to_vec()
    };
    let mut h = Sha256::new();
    h.update(&opad);
    h.update(&inner);
    h.finalize().to_vec()
}

fn derive_signing_key(secret: &[u8], date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = [b"AWS4", secret].concat();
    let k_date = hmac_sha256(&k_secret, date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode everything outside the unreserved set, keeping `/` for
/// model ids that embed a path.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
