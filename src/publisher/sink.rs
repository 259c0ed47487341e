// =============================================================================
// Record sinks: where flushed batches end up
// =============================================================================
//
// `RestProxySink` posts each batch to a Kafka REST proxy (v2 JSON embedded
// format). The record key routes the message to a partition, so every
// message for one symbol lands on the same partition. Failed requests are
// retried with exponential backoff, moving to the next broker each time.
//
// `LogSink` writes records as structured log lines for runs without a broker.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::message::OutboundMessage;
use crate::backoff::Backoff;
use crate::config::PublishConfig;
use crate::error::PublishError;

const KAFKA_JSON_V2: &str = "application/vnd.kafka.json.v2+json";
const KAFKA_V2: &str = "application/vnd.kafka.v2+json";

/// First retry delay; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Destination of flushed batches.
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver one batch; either all records are accepted or the call fails.
    async fn write_batch(&mut self, batch: &[OutboundMessage]) -> Result<(), PublishError>;

    /// Release transport resources. Called once, after the final flush.
    async fn close(&mut self) -> Result<(), PublishError> {
        Ok(())
    }

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

pub struct LogSink {
    topic: String,
}

impl LogSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl RecordSink for LogSink {
    async fn write_batch(&mut self, batch: &[OutboundMessage]) -> Result<(), PublishError> {
        for msg in batch {
            info!(
                topic = %self.topic,
                key = %msg.key,
                message_id = %msg.message_id,
                payload = %msg.payload,
                "record published"
            );
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "log"
    }
}

// ---------------------------------------------------------------------------
// RestProxySink
// ---------------------------------------------------------------------------

/// Response body of `POST /topics/{topic}`.
#[derive(Debug, Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    offsets: Vec<ProduceOffset>,
}

#[derive(Debug, Deserialize)]
struct ProduceOffset {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RestProxySink {
    client: reqwest::Client,
    endpoints: Vec<String>,
    topic: String,
    required_acks: i32,
    max_attempts: u32,
    /// Index of the broker tried first on the next request.
    next_endpoint: usize,
}

impl RestProxySink {
    pub fn new(config: &PublishConfig, topic: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(KAFKA_V2));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.write_timeout())
            .build()
            .context("failed to build REST proxy client")?;

        let endpoints: Vec<String> = config
            .brokers
            .iter()
            .map(|b| topic_endpoint(b, topic))
            .collect();

        info!(
            topic,
            brokers = ?config.brokers,
            acks = config.required_acks,
            compression = %config.compression,
            max_attempts = config.max_attempts,
            "REST proxy sink initialised"
        );

        Ok(Self {
            client,
            endpoints,
            topic: topic.to_string(),
            required_acks: config.required_acks,
            max_attempts: config.max_attempts.max(1),
            next_endpoint: 0,
        })
    }

    async fn post_once(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        total: usize,
    ) -> Result<(), PublishError> {
        let resp = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, KAFKA_JSON_V2)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if self.required_acks == 0 {
            return Ok(());
        }

        let parsed: ProduceResponse = resp.json().await?;
        check_offsets(&parsed, total)
    }
}

#[async_trait]
impl RecordSink for RestProxySink {
    async fn write_batch(&mut self, batch: &[OutboundMessage]) -> Result<(), PublishError> {
        if self.endpoints.is_empty() {
            return Err(PublishError::NoEndpoints);
        }

        let body = request_body(batch);
        let mut backoff = Backoff::new(RETRY_BASE, RETRY_MAX);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let endpoint = &self.endpoints[self.next_endpoint];

            match self.post_once(endpoint, &body, batch.len()).await {
                Ok(()) => {
                    debug!(endpoint = %endpoint, records = batch.len(), attempt, "batch accepted");
                    return Ok(());
                }
                Err(e) if e.should_retry() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        endpoint = %endpoint,
                        topic = %self.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    self.next_endpoint = (self.next_endpoint + 1) % self.endpoints.len();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        debug!(topic = %self.topic, "REST proxy sink closed");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "rest_proxy"
    }
}

/// `localhost:8082` or `http://proxy:8082/` to `{base}/topics/{topic}`.
fn topic_endpoint(broker: &str, topic: &str) -> String {
    let broker = broker.trim().trim_end_matches('/');
    if broker.starts_with("http://") || broker.starts_with("https://") {
        format!("{broker}/topics/{topic}")
    } else {
        format!("http://{broker}/topics/{topic}")
    }
}

fn request_body(batch: &[OutboundMessage]) -> serde_json::Value {
    let records: Vec<serde_json::Value> = batch
        .iter()
        .map(|m| json!({ "key": m.key, "value": m.payload }))
        .collect();
    json!({ "records": records })
}

/// Fail when any record in the response carries an error code.
fn check_offsets(resp: &ProduceResponse, total: usize) -> Result<(), PublishError> {
    let mut failed = resp
        .offsets
        .iter()
        .filter(|o| o.error_code.is_some_and(|c| c != 0));

    let Some(first) = failed.next() else {
        return Ok(());
    };

    Err(PublishError::Rejected {
        failed: 1 + failed.count(),
        total,
        first_error: first
            .error
            .clone()
            .unwrap_or_else(|| format!("error code {}", first.error_code.unwrap_or_default())),
    })
}
