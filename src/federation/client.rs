//! Outbound HTTP for federation
//!
//! Every request carries the configured User-Agent and an explicit
//! per-call timeout.

use std::time::{Duration, Instant};

use serde_json::Value;

use super::signature::SignatureHeaders;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// ActivityPub media type
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// JSON-LD form of the ActivityPub media type
pub const LD_JSON_ACTIVITY: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACCEPT_JRD: &str = "application/jrd+json, application/json";

/// HTTP client shared by every outbound federation call
#[derive(Clone)]
pub struct FederationClient {
    http: reqwest::Client,
    timeout: Duration,
}

fn record_outbound(status: &str, started: Instant) {
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound", status])
        .inc();
    FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["outbound"])
        .observe(started.elapsed().as_secs_f64());
}

impl FederationClient {
    /// Build a client with a fixed User-Agent and per-call timeout
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, timeout })
    }

    /// GET an ActivityStreams document
    pub async fn get_activity_json(&self, url: &str) -> Result<Value, AppError> {
        self.get_json(url, ACCEPT_ACTIVITY).await
    }

    /// GET a WebFinger JRD document
    pub async fn get_jrd(&self, url: &str) -> Result<Value, AppError> {
        self.get_json(url, ACCEPT_JRD).await
    }

    async fn get_json(&self, url: &str, accept: &str) -> Result<Value, AppError> {
        let started = Instant::now();
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                record_outbound("error", started);
                AppError::Transport(format!("GET {} failed: {}", url, e))
            })?;

        let status = response.status();
        record_outbound(status.as_str(), started);

        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(AppError::NotFound(format!("{} returned HTTP {}", url, status)));
        }
        if !status.is_success() {
            return Err(AppError::Transport(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::Transport(format!("Invalid JSON from {}: {}", url, e)))
    }

    /// POST a signed ActivityStreams body
    ///
    /// # Returns
    /// The response status code. Non-success statuses are `Transport` errors.
    pub async fn post_activity(
        &self,
        url: &str,
        body: Vec<u8>,
        signed: SignatureHeaders,
    ) -> Result<u16, AppError> {
        let started = Instant::now();
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header(reqwest::header::HOST, signed.host)
            .header(reqwest::header::DATE, signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                record_outbound("error", started);
                AppError::Transport(format!("POST {} failed: {}", url, e))
            })?;

        let status = response.status();
        record_outbound(status.as_str(), started);

        if !status.is_success() {
            return Err(AppError::Transport(format!(
                "Inbox {} rejected activity: HTTP {}",
                url, status
            )));
        }

        Ok(status.as_u16())
    }
}
