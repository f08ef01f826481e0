//! HTTP transport to an Elasticsearch-compatible cluster.
//!
//! Owns the one shared `reqwest::Client` of the process. Connection
//! failures (and timeouts, when `retry_on_timeout` is set) are retried
//! round-robin across hosts up to `max_retries` times; gateway errors
//! (502/503/504) likewise. Exhausting the budget yields
//! `SiftError::BackendUnavailable`. Any other HTTP status is returned to
//! the caller, which decides what it means.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::ElasticsearchConfig;
use crate::error::{Result, SiftError};

const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BASE_BACKOFF: Duration = Duration::from_millis(100);

pub enum RequestBody {
    Json(Value),
    NdJson(Bytes),
}

/// Status and decoded body of a backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `error.type` of an error response.
    pub fn error_type(&self) -> Option<&str> {
        self.body
            .get("error")
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
    }

    pub fn error_reason(&self) -> String {
        let error = self.body.get("error");
        error
            .and_then(|e| e.get("reason"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| error.and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| self.body.to_string())
    }
}

enum Auth {
    None,
    Basic { username: String, password: Option<String> },
    ApiKey(HeaderValue),
}

pub struct Transport {
    client: reqwest::Client,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    auth: Auth,
    max_retries: u32,
    retry_on_timeout: bool,
}

impl Transport {
    pub fn from_config(config: &ElasticsearchConfig) -> Result<Self> {
        config.validate()?;
        let hosts = config.host_urls()?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .pool_max_idle_per_host(32)
            .danger_accept_invalid_certs(!config.ssl_verify);

        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                SiftError::Config(format!("cannot read CA file {}: {e}", ca_path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                SiftError::Config(format!("invalid CA file {}: {e}", ca_path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| SiftError::Config(format!("failed to build HTTP client: {e}")))?;

        let auth = match (&config.api_key, &config.username) {
            (Some(key), _) => {
                let value = HeaderValue::from_str(&format!("ApiKey {key}"))
                    .map_err(|e| SiftError::Config(format!("invalid api key: {e}")))?;
                Auth::ApiKey(value)
            }
            (None, Some(username)) => Auth::Basic {
                username: username.clone(),
                password: config.password.clone(),
            },
            (None, None) => Auth::None,
        };

        Ok(Self {
            client,
            hosts,
            next_host: AtomicUsize::new(0),
            auth,
            max_retries: config.max_retries,
            retry_on_timeout: config.retry_on_timeout,
        })
    }

    fn url_for(&self, host: &Url, path: &str) -> String {
        format!(
            "{}/{}",
            host.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn pick_host(&self) -> &Url {
        let i = self.next_host.fetch_add(1, Ordering::Relaxed);
        &self.hosts[i % self.hosts.len()]
    }

    /// Send one request, retrying transient failures.
    pub async fn request(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&RequestBody>,
    ) -> Result<BackendResponse> {
        let start = Instant::now();
        let mut attempt = 0u32;

        let outcome = loop {
            let host = self.pick_host();
            let url = self.url_for(host, path);
            debug!(operation, %method, url = %url, attempt, "sending backend request");

            let mut request = self.client.request(method.clone(), &url).query(query);
            request = match &self.auth {
                Auth::None => request,
                Auth::Basic { username, password } => {
                    request.basic_auth(username, password.as_ref())
                }
                Auth::ApiKey(value) => request.header(AUTHORIZATION, value.clone()),
            };
            request = match body {
                Some(RequestBody::Json(value)) => request.json(value),
                Some(RequestBody::NdJson(bytes)) => request
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(bytes.clone()),
                None => request,
            };

            let retryable_error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if is_gateway_error(status) && attempt < self.max_retries {
                        format!("{operation}: backend returned {status}")
                    } else if is_gateway_error(status) {
                        break Err(SiftError::BackendUnavailable(format!(
                            "{operation}: backend returned {status} after {} attempts",
                            attempt + 1
                        )));
                    } else {
                        break Ok(decode(status, response).await?);
                    }
                }
                Err(e) if e.is_timeout() && !self.retry_on_timeout => {
                    break Err(SiftError::BackendUnavailable(format!(
                        "{operation}: request timed out: {e}"
                    )));
                }
                Err(e) if is_transient(&e) => {
                    if attempt >= self.max_retries {
                        break Err(SiftError::BackendUnavailable(format!(
                            "{operation}: {e} (after {} attempts)",
                            attempt + 1
                        )));
                    }
                    format!("{operation}: {e}")
                }
                Err(e) => {
                    break Err(SiftError::Backend {
                        status: 0,
                        reason: format!("{operation}: {e}"),
                    });
                }
            };

            let delay = backoff(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %retryable_error,
                "retrying backend request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        let label = match &outcome {
            Ok(r) if r.is_success() => "ok",
            Ok(_) => "error_status",
            Err(_) => "unavailable",
        };
        crate::metrics::BACKEND_REQUESTS_TOTAL
            .with_label_values(&[operation, label])
            .inc();
        crate::metrics::BACKEND_REQUEST_DURATION
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());

        outcome
    }
}

async fn decode(status: StatusCode, response: reqwest::Response) -> Result<BackendResponse> {
    let bytes = response.bytes().await.map_err(|e| {
        SiftError::BackendUnavailable(format!("failed to read backend response: {e}"))
    })?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Ok(BackendResponse {
        status: status.as_u16(),
        body,
    })
}

fn is_gateway_error(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}
