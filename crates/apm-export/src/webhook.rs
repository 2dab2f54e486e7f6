//! Webhook exporter
//!
//! Posts batch envelopes to an HTTP collector endpoint.
//! Supports retries with exponential backoff and several authentication methods.

use crate::{BatchExporter, ExportError, ExportResult};
use apm_core::{Config, ConfigKey, Payload, AGENT_VERSION};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use reqwest::{Client, Method, StatusCode};

/// Header carrying the agent key when built from agent config
pub const AGENT_KEY_HEADER: &str = "Agent-Key";

/// HTTP method for webhook requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

impl WebhookMethod {
    fn as_reqwest(self) -> Method {
        match self {
            WebhookMethod::Post => Method::POST,
            WebhookMethod::Put => Method::PUT,
        }
    }
}

/// Authentication method for webhook
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WebhookAuth {
    /// No authentication
    #[default]
    None,
    /// API key in header
    ApiKey { header: String, value: String },
    /// Bearer token
    Bearer(String),
    /// Basic authentication
    Basic { username: String, password: String },
}

/// Webhook exporter configuration
#[derive(Debug, Clone)]
pub struct WebhookExporterConfig {
    /// Collector endpoint URL
    pub endpoint: String,

    /// HTTP method
    pub method: WebhookMethod,

    /// Authentication configuration
    pub auth: WebhookAuth,

    /// Static headers to include in all requests
    pub headers: HashMap<String, String>,

    /// Request timeout
    pub timeout: Duration,

    /// Accept gzip-compressed responses
    pub compression: bool,

    /// Enable retry on failure
    pub retry_enabled: bool,

    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial retry delay (doubles with each retry)
    pub initial_retry_delay: Duration,

    /// Maximum retry delay
    pub max_retry_delay: Duration,

    /// User-Agent header
    pub user_agent: String,

    /// Dead letter file for batches that could not be delivered
    pub dlq_path: Option<String>,
}

impl Default for WebhookExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6590/batches".to_string(),
            method: WebhookMethod::Post,
            auth: WebhookAuth::None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            compression: true,
            retry_enabled: true,
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            user_agent: format!("apm-agent/{}", AGENT_VERSION),
            dlq_path: None,
        }
    }
}

impl WebhookExporterConfig {
    /// Defaults for `endpoint`, authenticated with the agent `key` and
    /// tagged with the application `name` when configured
    pub fn from_agent_config(config: &Config, endpoint: impl Into<String>) -> Self {
        let mut webhook = Self {
            endpoint: endpoint.into(),
            ..Self::default()
        };

        if let Some(key) = config.get_as::<String>(ConfigKey::Key) {
            webhook.auth = WebhookAuth::ApiKey {
                header: AGENT_KEY_HEADER.to_string(),
                value: key,
            };
        }
        if let Some(name) = config.get_as::<String>(ConfigKey::Name) {
            webhook.headers.insert("Agent-App".to_string(), name);
        }

        webhook
    }
}

/// Webhook export statistics
#[derive(Debug, Clone, Default)]
pub struct WebhookStats {
    pub batches_exported: u64,
    pub batches_retried: u64,
    pub batches_dropped: u64,
    pub errors: u64,
}

/// Webhook-specific error types
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Client error {status}: {body}")]
    ClientError { status: StatusCode, body: String },

    #[error("Server error {status}: {body}")]
    ServerError { status: StatusCode, body: String },
}

impl WebhookError {
    /// 4xx responses mean the collector rejected the batch itself
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WebhookError::ClientError { .. })
    }
}

/// Attempt budget and backoff schedule for one batch
#[derive(Debug, Clone, Copy, PartialEq)]
struct RetryPolicy {
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    fn from_config(config: &WebhookExporterConfig) -> Self {
        let retries = if config.retry_enabled {
            config.max_retries
        } else {
            0
        };

        Self {
            attempts: retries.saturating_add(1),
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
        }
    }

    /// Sleep before each retry: doubling from the initial delay, capped
    fn delays(self) -> impl Iterator<Item = Duration> {
        let max = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(max)), move |delay| {
            Some(delay.saturating_mul(2).min(max))
        })
        .take(self.attempts.saturating_sub(1) as usize)
    }
}

/// Webhook exporter for sending batches to HTTP endpoints
pub struct WebhookExporter {
    config: WebhookExporterConfig,
    client: Client,
    batches_exported: AtomicU64,
    batches_retried: AtomicU64,
    batches_dropped: AtomicU64,
    errors: AtomicU64,
}

impl WebhookExporter {
    /// Create a new webhook exporter with the given configuration
    pub fn new(config: WebhookExporterConfig) -> ExportResult<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent);

        if config.compression {
            builder = builder.gzip(true);
        }

        let client = builder.build().map_err(|e| {
            ExportError::InitializationFailed(format!("Failed to create HTTP client: {}", e))
        })?;

        info!(
            "Webhook exporter initialized: endpoint={}, method={:?}",
            config.endpoint, config.method
        );

        Ok(Self {
            config,
            client,
            batches_exported: AtomicU64::new(0),
            batches_retried: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Send a single batch envelope
    async fn send_request(&self, body: &str) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .request(self.config.method.as_reqwest(), &self.config.endpoint)
            .header("Content-Type", "application/json");

        request = match &self.config.auth {
            WebhookAuth::None => request,
            WebhookAuth::ApiKey { header, value } => {
                request.header(header.as_str(), value.as_str())
            }
            WebhookAuth::Bearer(token) => request.bearer_auth(token),
            WebhookAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.body(body.to_string()).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            // 4xx: the collector rejected the batch, retrying won't help
            let body = response.text().await.unwrap_or_default();
            Err(WebhookError::ClientError { status, body })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(WebhookError::ServerError { status, body })
        }
    }

    /// Deliver `body`, retrying per [`RetryPolicy`]. A batch that is
    /// rejected or runs out of attempts goes to the dead letter file.
    async fn deliver(&self, body: &str) -> ExportResult<()> {
        let policy = RetryPolicy::from_config(&self.config);
        let mut delays = policy.delays();
        let mut attempt: u32 = 1;

        let failure = loop {
            let err = match self.send_request(body).await {
                Ok(()) => {
                    if attempt > 1 {
                        self.batches_retried.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            match delays.next() {
                Some(delay) if err.is_retryable() => {
                    warn!(
                        attempt,
                        attempts = policy.attempts,
                        ?delay,
                        "Webhook delivery failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => break err,
            }
        };

        error!(attempt, "Dropping batch, webhook delivery failed: {}", failure);
        self.write_to_dlq(body);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);

        Err(ExportError::OperationFailed(format!(
            "Webhook delivery failed on attempt {}: {}",
            attempt, failure
        )))
    }

    /// Append an undeliverable batch to the dead letter file
    fn write_to_dlq(&self, body: &str) {
        use std::fs::OpenOptions;
        use std::io::Write;

        let Some(path) = &self.config.dlq_path else {
            return;
        };

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", body) {
                    error!("Failed to write to DLQ file: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to open DLQ file {}: {}", path, e);
            }
        }
    }

    /// Get export statistics
    pub fn stats(&self) -> WebhookStats {
        WebhookStats {
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BatchExporter for WebhookExporter {
    fn name(&self) -> &str {
        "webhook-exporter"
    }

    async fn export(&self, payload: &Payload) -> ExportResult<()> {
        let body = serde_json::to_string(payload)?;
        self.deliver(&body).await?;
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        debug!("Exported {} ({} items) to webhook", payload.kind(), payload.len());
        Ok(())
    }
}
