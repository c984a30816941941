use crate::error::{Result, SessionError};
use crate::realtime::Usage;
use crate::settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Max lines to keep in usage-session.jsonl (one line per session).
const MAX_SESSION_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub audio_input_tokens: u64,
    pub audio_output_tokens: u64,
    pub text_input_tokens: u64,
    pub text_output_tokens: u64,
}

impl UsageCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Adds one response's usage. Missing fields count as zero; when only
    /// aggregate totals are reported they are attributed to text.
    pub fn add(&mut self, usage: &Usage) {
        match &usage.input_token_details {
            Some(details) => {
                self.audio_input_tokens = self
                    .audio_input_tokens
                    .saturating_add(details.audio_tokens.unwrap_or(0));
                self.text_input_tokens = self
                    .text_input_tokens
                    .saturating_add(details.text_tokens.unwrap_or(0));
            }
            None => {
                self.text_input_tokens = self
                    .text_input_tokens
                    .saturating_add(usage.input_tokens.unwrap_or(0));
            }
        }
        match &usage.output_token_details {
            Some(details) => {
                self.audio_output_tokens = self
                    .audio_output_tokens
                    .saturating_add(details.audio_tokens.unwrap_or(0));
                self.text_output_tokens = self
                    .text_output_tokens
                    .saturating_add(details.text_tokens.unwrap_or(0));
            }
            None => {
                self.text_output_tokens = self
                    .text_output_tokens
                    .saturating_add(usage.output_tokens.unwrap_or(0));
            }
        }
    }
}

/// One finished session, as debited and journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUsage {
    #[serde(flatten)]
    pub counters: UsageCounters,
    pub duration_seconds: u64,
    pub responses: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Body of the billing-debit request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageDebit {
    #[serde(flatten)]
    pub counters: UsageCounters,
    pub duration_seconds: u64,
}

impl From<&SessionUsage> for UsageDebit {
    fn from(usage: &SessionUsage) -> Self {
        Self {
            counters: usage.counters,
            duration_seconds: usage.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DebitReceipt {
    #[serde(default)]
    pub credits_charged: Option<f64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Elapsed time rounded up to whole seconds.
pub fn duration_seconds(elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs();
    if elapsed.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[derive(Debug, Default)]
pub struct UsageAccountant {
    counters: UsageCounters,
    responses: u64,
    started: Option<(Instant, DateTime<Utc>)>,
}

impl UsageAccountant {
    /// Zeroes the counters and stamps the start time.
    pub fn start(&mut self) {
        self.counters = UsageCounters::default();
        self.responses = 0;
        self.started = Some((Instant::now(), Utc::now()));
    }

    pub fn counters(&self) -> UsageCounters {
        self.counters
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn record(&mut self, usage: Option<&Usage>) {
        if self.started.is_none() {
            log::debug!("[usage] ignoring usage outside a session");
            return;
        }
        self.responses = self.responses.saturating_add(1);
        if let Some(usage) = usage {
            self.counters.add(usage);
        }
        log::debug!("[usage] counters now {:?}", self.counters);
    }

    /// Closes the accounting window. Yields the record once per `start`.
    pub fn finish(&mut self) -> Option<SessionUsage> {
        let (started, started_at) = self.started.take()?;
        Some(SessionUsage {
            counters: self.counters,
            duration_seconds: duration_seconds(started.elapsed()),
            responses: self.responses,
            started_at,
            ended_at: Utc::now(),
        })
    }
}

#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn debit(&self, debit: &UsageDebit) -> Result<DebitReceipt>;
}

pub struct HttpBillingClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBillingClient {
    pub fn new(backend_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/realtime/usage", backend_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl BillingClient for HttpBillingClient {
    async fn debit(&self, debit: &UsageDebit) -> Result<DebitReceipt> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(debit)
            .send()
            .await
            .map_err(|e| SessionError::BillingRequestFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SessionError::BillingRequestFailed(format!(
                "billing endpoint returned {}: {}",
                status, body
            )));
        }
        resp.json()
            .await
            .map_err(|e| SessionError::BillingRequestFailed(format!("bad receipt: {}", e)))
    }
}

/// Fires the debit for `usage` on the current runtime without waiting for it.
/// Nothing is sent when every counter is zero.
pub fn submit_detached(
    billing: Arc<dyn BillingClient>,
    usage: &SessionUsage,
) -> Option<JoinHandle<()>> {
    if usage.counters.is_zero() {
        log::info!("[usage] nothing to bill");
        return None;
    }
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(h) => h,
        Err(_) => {
            log::warn!("[usage] no runtime available, debit skipped: {:?}", usage.counters);
            return None;
        }
    };
    let debit = UsageDebit::from(usage);
    Some(handle.spawn(async move {
        match billing.debit(&debit).await {
            Ok(receipt) => log::info!(
                "[usage] debited {:?} for {}s: credits={:?} cost={:?}",
                debit.counters,
                debit.duration_seconds,
                receipt.credits_charged,
                receipt.cost
            ),
            Err(e) => log::warn!("[usage] {}", e),
        }
    }))
}

pub fn session_usage_path() -> Option<PathBuf> {
    settings::data_dir().map(|dir| dir.join("usage-session.jsonl"))
}

pub fn append_usage_line<T: Serialize>(path: &Path, usage: &T) -> std::result::Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create usage dir: {}", e))?;
    }
    let line = serde_json::to_string(usage).map_err(|e| format!("Failed to serialize usage: {}", e))?;
    let mut text = line;
    text.push('\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, text.as_bytes()))
        .map_err(|e| format!("Failed to append usage log: {}", e))?;
    truncate_log(path, MAX_SESSION_LOG_LINES);
    Ok(())
}

/// If `path` has more than `max_lines` lines, rewrite it keeping only the last `max_lines`.
fn truncate_log(path: &Path, max_lines: usize) {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return;
    }
    let keep = &lines[lines.len() - max_lines..];
    let mut out = keep.join("\n");
    out.push('\n');
    if let Err(e) = fs::write(path, out.as_bytes()) {
        log::warn!("[usage] failed to truncate {}: {}", path.display(), e);
    }
}
