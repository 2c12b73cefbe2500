// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST client for the connection API.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use durastate_core::adapter::{ConnectorService, state_contains};
use durastate_core::error::StepError;

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};

/// Versioned JSON media type the API expects.
const ACCEPT_JSON_V2: &str = "application/json;version=2";

/// [`ConnectorService`] over the REST API.
///
/// | Capability | Request |
/// |------------|---------|
/// | `get_state` / `verify_state` | `GET connections/{id}/state` |
/// | `pause` / `resume` | `PATCH connections/{id}` with `{"paused": bool}` |
/// | `update_state` | `PATCH connections/{id}/state` with `{"state": ...}` |
#[derive(Debug, Clone)]
pub struct RestConnector {
    http: reqwest::Client,
    base_url: Url,
}

impl RestConnector {
    /// Build a client with Basic auth and the versioned `Accept` header on
    /// every request.
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ConnectorError::Config(format!("invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ConnectorError::Config(format!(
                "invalid base URL: {}",
                config.base_url
            )));
        }

        let credentials = STANDARD.encode(format!("{}:{}", config.api_key, config.api_secret));
        let mut auth = HeaderValue::from_str(&format!("Basic {}", credentials))
            .map_err(|e| ConnectorError::Config(format!("invalid credentials: {}", e)))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON_V2));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .user_agent(concat!("durastate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::Config(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ConnectorError::Config("base URL cannot have a path".to_string()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// Send one request and decode the JSON body. An empty success body is `{}`.
    async fn request(&self, method: Method, segments: &[&str], payload: Option<Value>) -> Result<Value> {
        let url = self.url(segments)?;
        debug!(method = %method, url = %url, "API request");

        let mut request = self.http.request(method, url);
        if let Some(payload) = payload {
            request = request.json(&payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| body.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| {
                    format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("error")
                    )
                });
            warn!(status = status.as_u16(), message = %message, "API request failed");
            return Err(ConnectorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
    }

    async fn read_state(&self, resource_id: &str) -> Result<Value> {
        self.request(Method::GET, &["connections", resource_id, "state"], None)
            .await
    }

    async fn set_paused(&self, resource_id: &str, paused: bool) -> Result<Value> {
        self.request(
            Method::PATCH,
            &["connections", resource_id],
            Some(json!({ "paused": paused })),
        )
        .await
    }
}

/// The state inside a state response: `data.state`, then `state`, then the
/// whole body.
pub fn extract_state(body: &Value) -> &Value {
    body.pointer("/data/state")
        .or_else(|| body.get("state"))
        .unwrap_or(body)
}

#[async_trait]
impl ConnectorService for RestConnector {
    #[instrument(skip(self))]
    async fn get_state(&self, resource_id: &str) -> std::result::Result<Value, StepError> {
        let body = self.read_state(resource_id).await?;
        info!("Retrieved connection state");
        Ok(body)
    }

    #[instrument(skip(self))]
    async fn pause(&self, resource_id: &str) -> std::result::Result<Value, StepError> {
        let body = self.set_paused(resource_id, true).await?;
        info!("Paused connection");
        Ok(body)
    }

    #[instrument(skip(self, new_state))]
    async fn update_state(
        &self,
        resource_id: &str,
        new_state: &Value,
    ) -> std::result::Result<Value, StepError> {
        let body = self
            .request(
                Method::PATCH,
                &["connections", resource_id, "state"],
                Some(json!({ "state": new_state })),
            )
            .await?;
        info!("Updated connection state");
        Ok(body)
    }

    #[instrument(skip(self))]
    async fn resume(&self, resource_id: &str) -> std::result::Result<Value, StepError> {
        let body = self.set_paused(resource_id, false).await?;
        info!("Resumed connection");
        Ok(body)
    }

    #[instrument(skip(self, expected))]
    async fn verify_state(
        &self,
        resource_id: &str,
        expected: &Value,
    ) -> std::result::Result<Value, StepError> {
        let body = self.read_state(resource_id).await?;
        let actual = extract_state(&body);
        if !state_contains(actual, expected) {
            return Err(ConnectorError::StateMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        info!("Verified connection state");
        Ok(body)
    }
}
