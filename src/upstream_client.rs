use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::live_positions::FlightPositionRecord;

/// Batched live position lookups by registration
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Fetch live records for up to one batch of registrations. Any transport
    /// failure, timeout or non-2xx status is an error for the whole batch.
    async fn fetch_positions(&self, registrations: &[String]) -> Result<Vec<FlightPositionRecord>>;
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Parse a `{"data": [...]}` response body. Records that do not deserialize are
/// logged and dropped without failing the rest of the batch.
pub fn parse_positions_body(body: &str) -> Result<Vec<FlightPositionRecord>> {
    let response: PositionsResponse =
        serde_json::from_str(body).context("Failed to parse live positions response")?;

    let mut records = Vec::with_capacity(response.data.len());
    for (index, value) in response.data.into_iter().enumerate() {
        match serde_json::from_value::<FlightPositionRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                metrics::counter!("poller.records.skipped").increment(1);
                warn!(index, "Skipping malformed live position record: {}", e);
            }
        }
    }
    Ok(records)
}

/// Client for the Flightradar24 live flight positions endpoint
pub struct LivePositionsClient {
    client: Client,
    base_url: String,
}

impl LivePositionsClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("accept-version"),
            HeaderValue::from_static("v1"),
        );
        if let Some(key) = &config.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .context("API key contains invalid header characters")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        } else {
            warn!("No upstream API key configured, requests will be unauthenticated");
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/live/flight-positions/full", self.base_url)
    }
}

#[async_trait]
impl PositionSource for LivePositionsClient {
    async fn fetch_positions(&self, registrations: &[String]) -> Result<Vec<FlightPositionRecord>> {
        if registrations.is_empty() {
            return Ok(Vec::new());
        }

        let joined = registrations.join(",");
        debug!(count = registrations.len(), "Requesting live positions");

        let response = self
            .client
            .get(self.endpoint())
            .query(&[("registrations", joined.as_str())])
            .send()
            .await
            .context("Failed to send live positions request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Live positions API error {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        let body = response
            .text()
            .await
            .context("Failed to read live positions response body")?;
        parse_positions_body(&body)
    }
}
