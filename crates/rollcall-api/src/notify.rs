//! Absence notification delivery.
//!
//! The webhook notifier POSTs one JSON notice per newly-absent Record. When a
//! secret is configured the body is signed with HMAC-SHA256 and the hex
//! digest is sent as `X-Rollcall-Signature: sha256=<hex>`. Retrying a failed
//! delivery is the receiver's concern; the caller only logs the failure.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info};

use rollcall_core::{defaults, AbsenceNotifier, Error, Record, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Rollcall-Signature";

/// Header naming the event type.
pub const EVENT_HEADER: &str = "X-Rollcall-Event";

/// Event name for absence notices.
pub const ABSENCE_EVENT: &str = "attendance.absent";

/// Compute the signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Serialize)]
struct AbsenceNotice<'a> {
    event: &'a str,
    record: &'a Record,
}

/// Webhook delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    /// Read `NOTIFY_WEBHOOK_URL`, `NOTIFY_WEBHOOK_SECRET` and
    /// `NOTIFY_TIMEOUT_SECS`. `None` when no URL is configured.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        let secret = std::env::var("NOTIFY_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        let timeout = std::env::var("NOTIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::NOTIFY_TIMEOUT_SECS);
        Some(Self {
            url,
            secret,
            timeout: Duration::from_secs(timeout),
        })
    }
}

/// Sends absence notices to an HTTP endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl AbsenceNotifier for WebhookNotifier {
    async fn notify_absence(&self, record: &Record) -> Result<()> {
        let start = Instant::now();
        let body = serde_json::to_vec(&AbsenceNotice {
            event: ABSENCE_EVENT,
            record,
        })
        .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.config.url)
            .timeout(self.config.timeout)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, ABSENCE_EVENT);
        if let Some(signature) = self.config.secret.as_deref().and_then(|s| sign(s, &body)) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Request(format!("absence webhook failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Request(format!(
                "absence webhook returned {}",
                status.as_u16()
            )));
        }

        debug!(
            subsystem = "api",
            component = "notify",
            record_id = %record.id,
            student_id = record.student_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Absence notice delivered"
        );
        Ok(())
    }
}

/// Notifier used when no webhook is configured: logs the notice and succeeds.
pub struct LogNotifier;

#[async_trait]
impl AbsenceNotifier for LogNotifier {
    async fn notify_absence(&self, record: &Record) -> Result<()> {
        info!(
            subsystem = "api",
            component = "notify",
            record_id = %record.id,
            school_id = record.school_id,
            class_id = record.class_id,
            student_id = record.student_id,
            date = %record.date,
            "Student marked absent"
        );
        Ok(())
    }
}

/// Notifier that keeps every notice in memory.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Record>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent deliveries fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn sent(&self) -> Vec<Record> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AbsenceNotifier for RecordingNotifier {
    async fn notify_absence(&self, record: &Record) -> Result<()> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(Error::Request("notifier unavailable".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}
