//! Minimal client for OpenAI-compatible JSON endpoints.
//!
//! Shared by [`embedding`](crate::embedding) and
//! [`completion`](crate::completion). The API key is passed per request:
//! it lives in the caller's session, never in the process environment.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! `max_retries` defaults to 0, i.e. every failure is reported to the user
//! on the first attempt.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::OpenAIConfig;
use crate::credential::ValidCredential;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    api_base: String,
    max_retries: u32,
}

impl OpenAIClient {
    pub fn new(config: &OpenAIConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// POST `body` to `{api_base}/{path}` and return the decoded JSON reply.
    pub async fn post_json(
        &self,
        credential: &ValidCredential,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(%url, attempt, ?delay, "retrying provider request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&url)
                .bearer_auth(credential.expose())
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return Ok(json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = error_message(&body_text);

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("provider error {}: {}", status, message));
                        continue;
                    }

                    bail!("provider error {}: {}", status, message);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("provider request failed: {}", e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("provider request failed after retries")))
    }
}

/// Pull `error.message` out of an OpenAI error body, falling back to the raw
/// text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
