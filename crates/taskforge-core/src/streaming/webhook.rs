//! Webhook event sink: posts each progress event to a configured URL.
//!
//! Retry policy: client errors (4xx) are never retried; server errors
//! (5xx) and network/timeout failures retry with exponential backoff
//! 1 s, 2 s, 4 s, ... up to `max_retries` attempts. Irrecoverable failure
//! is logged without failing task execution.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{EventSink, ProgressEvent};

const QUEUE_CAPACITY: usize = 256;

/// Supported webhook HTTP methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    3
}

/// Caller-supplied webhook configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub method: WebhookMethod,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            method: WebhookMethod::default(),
            timeout: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Wire payload delivered to the webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub protocol: String,
    pub root_task_id: String,
    pub task_id: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: super::EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn from_event(protocol: &str, root_task_id: &str, event: &ProgressEvent) -> Self {
        Self {
            protocol: protocol.to_owned(),
            root_task_id: root_task_id.to_owned(),
            task_id: event.task_id.clone(),
            status: event
                .status
                .clone()
                .unwrap_or_else(|| "in_progress".to_owned()),
            progress: event.progress,
            message: event.message.clone().unwrap_or_default(),
            kind: event.kind,
            timestamp: event.timestamp,
            is_final: event.is_final,
            result: event.result.clone(),
            error: event.error.clone(),
        }
    }
}

/// Sink that delivers events over HTTP with bounded retry.
pub struct WebhookSink {
    tx: mpsc::Sender<Option<ProgressEvent>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookSink {
    pub fn new(
        protocol: impl Into<String>,
        root_task_id: impl Into<String>,
        config: WebhookConfig,
    ) -> Result<Self> {
        let protocol = protocol.into();
        let root_task_id = root_task_id.into();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .context("failed to build webhook HTTP client")?;

        let (tx, mut rx) = mpsc::channel::<Option<ProgressEvent>>(QUEUE_CAPACITY);

        let consumer = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Some(event) => {
                        let payload = WebhookPayload::from_event(&protocol, &root_task_id, &event);
                        send_with_retry(&client, &config, &payload).await;
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            tx,
            consumer: Mutex::new(Some(consumer)),
        })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn put(&self, event: ProgressEvent) {
        if self.tx.send(Some(event)).await.is_err() {
            warn!("webhook sink consumer already stopped, dropping event");
        }
    }

    async fn close(&self) {
        let _ = self.tx.send(None).await;
        let handle = self
            .consumer
            .lock()
            .expect("webhook sink lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The headers that go on the wire: `Content-Type: application/json`
/// with the caller's headers merged over it, so a caller-supplied value
/// wins on collision. Unparseable names or values are dropped with a
/// warning instead of failing delivery.
fn merged_headers(config: &WebhookConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in &config.headers {
        let Ok(parsed_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "ignoring invalid webhook header name");
            continue;
        };
        let Ok(parsed_value) = HeaderValue::from_str(value) else {
            warn!(header = %name, "ignoring invalid webhook header value");
            continue;
        };
        // insert replaces any default under the same name.
        headers.insert(parsed_name, parsed_value);
    }
    headers
}

/// Deliver one payload, retrying per the sink's policy. Terminal failures
/// are logged and swallowed.
async fn send_with_retry(client: &reqwest::Client, config: &WebhookConfig, payload: &WebhookPayload) {
    let headers = merged_headers(config);
    let mut last_error: Option<String> = None;

    for attempt in 0..config.max_retries {
        let request = match config.method {
            WebhookMethod::Post => client.post(&config.url),
            WebhookMethod::Put => client.put(&config.url),
        };
        // `json` only sets Content-Type when the map lacks one, so the
        // merged value survives.
        let request = request.headers(headers.clone()).json(payload);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(
                        url = %config.url,
                        attempt = attempt + 1,
                        "webhook update delivered"
                    );
                    return;
                }
                if status.is_client_error() {
                    error!(
                        url = %config.url,
                        status = %status,
                        "webhook rejected with client error, not retrying"
                    );
                    return;
                }
                last_error = Some(format!("server error {status}"));
                warn!(
                    url = %config.url,
                    status = %status,
                    attempt = attempt + 1,
                    max = config.max_retries,
                    "webhook delivery failed with server error"
                );
            }
            Err(e) => {
                last_error = Some(e.to_string());
                warn!(
                    url = %config.url,
                    error = %e,
                    attempt = attempt + 1,
                    max = config.max_retries,
                    "webhook delivery failed with network error"
                );
            }
        }

        if attempt + 1 < config.max_retries {
            let backoff = Duration::from_secs(1 << attempt);
            tokio::time::sleep(backoff).await;
        }
    }

    error!(
        url = %config.url,
        attempts = config.max_retries,
        error = last_error.as_deref().unwrap_or("unknown"),
        "giving up on webhook delivery"
    );
}
