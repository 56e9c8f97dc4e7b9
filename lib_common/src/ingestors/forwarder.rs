//! # Line Forwarder
//!
//! Drains the queue shared by all serial devices and delivers every line to
//! the ingest server, one request per line. Quick resends after a dropped
//! connection or a 5xx are left to the HTTP client's retry middleware; longer
//! outages are ridden out here with bounded exponential backoff. A line the
//! server rejects outright is not retried.
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::device::LineEnvelope;
use crate::core::{retry_transient, RetryError, RetryPolicy};
use crate::readings::{IDEMPOTENCY_KEY_HEADER, READING_TIME_HEADER, SENSOR_USER_HEADER};
use crate::retrieve::ApiClient;

/// Why a line was not delivered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The server refused the line. Resending it will not help.
    #[error("ingest server rejected the line ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Transport failure, timeout or a retryable status.
    #[error("ingest server unavailable: {0}")]
    Unavailable(String),
}

impl ForwardError {
    /// 4xx other than 408 and 429 is a rejection; anything else is retryable.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 429 => ForwardError::Unavailable(format!("status {}: {}", status, body)),
            400..=499 => ForwardError::Rejected { status, body },
            _ => ForwardError::Unavailable(format!("status {}: {}", status, body)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Unavailable(_))
    }
}

/// Somewhere lines can be delivered to.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Delivers one line. `Ok` means the server has acknowledged it.
    async fn deliver(&self, envelope: &LineEnvelope) -> Result<(), ForwardError>;
}

/// Posts lines to the ingest server's `/write` route as `text/plain`.
#[derive(Clone)]
pub struct HttpForwarder {
    client: ApiClient,
    user: Option<HeaderValue>,
}

impl HttpForwarder {
    /// `ingest_url` is the full write URL, e.g. `http://localhost:5001/write`.
    /// `transport_retries` quick resends happen inside one delivery attempt.
    pub fn new(
        ingest_url: &str,
        user: Option<&str>,
        timeout: Duration,
        transport_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = ApiClient::new(ingest_url, transport_retries, timeout)?;
        let user = user.map(HeaderValue::from_str).transpose()?;
        Ok(Self { client, user })
    }

    fn headers(&self, envelope: &LineEnvelope) -> Result<HeaderMap, ForwardError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| ForwardError::Rejected {
            status: 0,
            body: e.to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
            HeaderValue::from_str(&envelope.idempotency_key()).map_err(invalid)?,
        );
        headers.insert(
            HeaderName::from_static(READING_TIME_HEADER),
            HeaderValue::from_str(&envelope.captured_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .map_err(invalid)?,
        );
        if let Some(user) = &self.user {
            headers.insert(HeaderName::from_static(SENSOR_USER_HEADER), user.clone());
        }
        Ok(headers)
    }
}

#[async_trait]
impl LineSink for HttpForwarder {
    async fn deliver(&self, envelope: &LineEnvelope) -> Result<(), ForwardError> {
        let headers = self.headers(envelope)?;
        let response = self
            .client
            .send_text(Method::POST, "", Some(headers), envelope.line.clone())
            .await
            .map_err(|e| ForwardError::Unavailable(e.to_string()))?;

        if response.success {
            Ok(())
        } else {
            Err(ForwardError::from_status(response.status, response.body))
        }
    }
}

/// Totals of a forwarder run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub delivered: u64,
    pub dropped: u64,
}

async fn deliver_with_retry(
    sink: &dyn LineSink,
    envelope: &LineEnvelope,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), RetryError<ForwardError>> {
    retry_transient(
        policy,
        Some(cancel),
        |_| sink.deliver(envelope),
        ForwardError::is_retryable,
        |attempt, err, next| {
            if let Some(delay) = next {
                log::warn!(
                    "Forwarding {} failed (attempt {}): {}. Retrying in {:?}",
                    envelope.idempotency_key(),
                    attempt,
                    err,
                    delay
                );
            }
        },
    )
    .await
}

/// One last attempt for `envelope`, made while shutting down.
async fn deliver_final(sink: &dyn LineSink, envelope: &LineEnvelope, stats: &mut ForwardStats) {
    match sink.deliver(envelope).await {
        Ok(()) => stats.delivered += 1,
        Err(e) => {
            stats.dropped += 1;
            log::error!("Dropping line {:?} at shutdown: {}", envelope.line, e);
        }
    }
}

/// Delivers queued lines until the queue closes or `cancel` fires. On cancel,
/// the line being retried and whatever is still queued get one delivery
/// attempt each.
pub async fn run_forwarder(
    mut queue: mpsc::Receiver<LineEnvelope>,
    sink: Arc<dyn LineSink>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> ForwardStats {
    let mut stats = ForwardStats::default();
    let mut interrupted = None;

    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        match deliver_with_retry(sink.as_ref(), &envelope, policy, &cancel).await {
            Ok(()) => stats.delivered += 1,
            Err(RetryError::Cancelled(_)) => {
                interrupted = Some(envelope);
                break;
            }
            Err(e) => {
                stats.dropped += 1;
                log::error!("Dropping line {:?} from {}: {}", envelope.line, envelope.port, e);
            }
        }
    }

    queue.close();
    if let Some(envelope) = interrupted {
        deliver_final(sink.as_ref(), &envelope, &mut stats).await;
    }
    let mut drained = 0usize;
    while let Ok(envelope) = queue.try_recv() {
        drained += 1;
        deliver_final(sink.as_ref(), &envelope, &mut stats).await;
    }
    if drained > 0 {
        log::info!("Forwarder drained {} queued lines at shutdown", drained);
    }

    log::info!(
        "Forwarder stopped: {} delivered, {} dropped",
        stats.delivered,
        stats.dropped
    );
    stats
}
