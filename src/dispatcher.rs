// src/dispatcher.rs
//
// AlertDispatcher: fans qualifying events out to notification channels.
// Each channel gets its own worker task and pending queue; the ingestion
// lanes fire and forget. Delivery is at-least-once per channel with
// exponential backoff, and the request carries an immutable snapshot of the
// event record, so duplicate sends can never corrupt event state. Under
// overload, low/medium requests are shed first; high/critical never are.

use crate::config::{AlertingConfig, ChannelConfig};
use crate::pipeline::metrics::EngineMetrics;
use crate::types::{EventRecord, Severity};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One in-flight delivery attempt on one channel. Destroyed on terminal
/// success or after max retries; the underlying event remains either way.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub event: EventRecord,
    pub channel: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    Success,
    /// Transient failure (timeout, 5xx); worth retrying with backoff.
    Retryable(String),
    /// Permanent failure (bad config, 4xx); retrying cannot help.
    Fatal(String),
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    alert: &'a EventRecord,
}

/// Notification channels. Email/SMS gateways sit behind webhooks; the log
/// channel doubles as the in-app feed.
pub enum AlertChannel {
    Log {
        name: String,
    },
    Webhook {
        name: String,
        client: reqwest::Client,
        url: String,
    },
    #[cfg(test)]
    Scripted {
        name: String,
        outcomes: std::sync::Mutex<VecDeque<ChannelOutcome>>,
        sent: Arc<std::sync::Mutex<Vec<AlertRequest>>>,
        send_delay: Duration,
    },
}

impl AlertChannel {
    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        match config {
            ChannelConfig::Log { name } => Ok(AlertChannel::Log { name: name.clone() }),
            ChannelConfig::Webhook {
                name,
                url,
                timeout_secs,
            } => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(*timeout_secs))
                    .build()
                    .context("building webhook HTTP client")?;
                Ok(AlertChannel::Webhook {
                    name: name.clone(),
                    client,
                    url: url.clone(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AlertChannel::Log { name } => name,
            AlertChannel::Webhook { name, .. } => name,
            #[cfg(test)]
            AlertChannel::Scripted { name, .. } => name,
        }
    }

    pub async fn send(&self, request: &AlertRequest) -> ChannelOutcome {
        match self {
            AlertChannel::Log { name } => {
                info!(
                    "🔔 [{}] {} {} on camera {} (event {})",
                    name,
                    request.event.severity.as_str(),
                    request.event.event_type.as_str(),
                    request.event.camera_id,
                    request.event.event_id
                );
                ChannelOutcome::Success
            }
            AlertChannel::Webhook { name, client, url } => {
                let payload = WebhookPayload {
                    channel: name,
                    alert: &request.event,
                };
                match client.post(url).json(&payload).send().await {
                    Ok(response) if response.status().is_success() => ChannelOutcome::Success,
                    Ok(response) if response.status().is_server_error() => {
                        ChannelOutcome::Retryable(format!("server returned {}", response.status()))
                    }
                    Ok(response) => {
                        ChannelOutcome::Fatal(format!("server returned {}", response.status()))
                    }
                    Err(e) if e.is_timeout() || e.is_connect() => {
                        ChannelOutcome::Retryable(e.to_string())
                    }
                    Err(e) => ChannelOutcome::Fatal(e.to_string()),
                }
            }
            #[cfg(test)]
            AlertChannel::Scripted {
                outcomes,
                sent,
                send_delay,
                ..
            } => {
                tokio::time::sleep(*send_delay).await;
                sent.lock().unwrap().push(request.clone());
                outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(ChannelOutcome::Success)
            }
        }
    }
}

pub struct AlertDispatcher {
    min_severity: Severity,
    channel_txs: Vec<(String, mpsc::UnboundedSender<EventRecord>)>,
}

impl AlertDispatcher {
    pub fn new(
        config: &AlertingConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let channels: Vec<AlertChannel> = config
            .channels
            .iter()
            .map(AlertChannel::from_config)
            .collect::<Result<_>>()?;
        Ok(Self::with_channels(config, channels, metrics))
    }

    pub fn with_channels(
        config: &AlertingConfig,
        channels: Vec<AlertChannel>,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut channel_txs = Vec::new();
        let mut workers = Vec::new();
        for channel in channels {
            let (tx, rx) = mpsc::unbounded_channel();
            channel_txs.push((channel.name().to_string(), tx));
            workers.push(tokio::spawn(channel_worker(
                channel,
                config.clone(),
                metrics.clone(),
                rx,
            )));
        }
        (
            Self {
                min_severity: config.min_severity,
                channel_txs,
            },
            workers,
        )
    }

    /// Fire-and-forget fan-out. Called when an event opens at qualifying
    /// severity and again on severity upgrades; sub-threshold events are
    /// ignored here.
    pub fn dispatch(&self, record: &EventRecord) {
        if record.severity < self.min_severity {
            return;
        }
        for (name, tx) in &self.channel_txs {
            if tx.send(record.clone()).is_err() {
                debug!("Alert channel '{}' is gone, dropping dispatch", name);
            }
        }
    }
}

async fn channel_worker(
    channel: AlertChannel,
    config: AlertingConfig,
    metrics: Arc<EngineMetrics>,
    mut rx: mpsc::UnboundedReceiver<EventRecord>,
) {
    let mut pending: VecDeque<AlertRequest> = VecDeque::new();
    let mut intake_open = true;
    // Absolute deadline for the next delivery attempt. Must survive loop
    // iterations: a relative sleep rebuilt per iteration would restart the
    // backoff on every intake arrival and starve retries under load.
    let mut next_attempt_at = Instant::now();

    while intake_open || !pending.is_empty() {
        // Nothing to deliver: park on intake.
        if pending.is_empty() {
            match rx.recv().await {
                Some(record) => enqueue(&channel, &config, &metrics, &mut pending, record),
                None => break,
            }
            continue;
        }

        tokio::select! {
            message = rx.recv(), if intake_open => {
                match message {
                    Some(record) => enqueue(&channel, &config, &metrics, &mut pending, record),
                    None => intake_open = false,
                }
            }
            _ = tokio::time::sleep_until(next_attempt_at) => {
                deliver_front(&channel, &config, &metrics, &mut pending).await;
                // Everything that arrived while the send was in flight goes
                // through shedding before the next delivery is scheduled.
                loop {
                    match rx.try_recv() {
                        Ok(record) => {
                            enqueue(&channel, &config, &metrics, &mut pending, record)
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            intake_open = false;
                            break;
                        }
                    }
                }
                next_attempt_at = Instant::now()
                    + pending
                        .front()
                        .map(|r| backoff_for(&config, r.attempts))
                        .unwrap_or(Duration::ZERO);
            }
        }
    }
    debug!("Alert channel '{}' worker stopped", channel.name());
}

fn enqueue(
    channel: &AlertChannel,
    config: &AlertingConfig,
    metrics: &EngineMetrics,
    pending: &mut VecDeque<AlertRequest>,
    record: EventRecord,
) {
    if pending.len() >= config.channel_queue_capacity {
        // Shed below-high severities first: the incoming request if it is
        // sheddable, otherwise the oldest sheddable one already queued.
        // High/critical are never shed; the queue soft cap yields instead.
        if record.severity < Severity::High {
            metrics.inc(&metrics.alerts_shed);
            warn!(
                "Alert queue '{}' full, shedding {} alert for event {}",
                channel.name(),
                record.severity.as_str(),
                record.event_id
            );
            return;
        }
        if let Some(idx) = pending
            .iter()
            .position(|r| r.event.severity < Severity::High)
        {
            let shed = pending.remove(idx).unwrap();
            metrics.inc(&metrics.alerts_shed);
            warn!(
                "Alert queue '{}' full, shedding queued {} alert for event {}",
                channel.name(),
                shed.event.severity.as_str(),
                shed.event.event_id
            );
        }
    }

    metrics.inc(&metrics.alerts_enqueued);
    pending.push_back(AlertRequest {
        event: record,
        channel: channel.name().to_string(),
        attempts: 0,
        last_error: None,
    });
}

async fn deliver_front(
    channel: &AlertChannel,
    config: &AlertingConfig,
    metrics: &EngineMetrics,
    pending: &mut VecDeque<AlertRequest>,
) {
    let Some(request) = pending.front_mut() else {
        return;
    };
    request.attempts += 1;

    match channel.send(request).await {
        ChannelOutcome::Success => {
            metrics.inc(&metrics.alerts_delivered);
            debug!(
                "Alert for event {} delivered on '{}' (attempt {})",
                request.event.event_id,
                channel.name(),
                request.attempts
            );
            pending.pop_front();
        }
        ChannelOutcome::Fatal(reason) => {
            metrics.inc(&metrics.alerts_failed);
            error!(
                "❌ Alert for event {} failed permanently on '{}': {}",
                request.event.event_id,
                channel.name(),
                reason
            );
            pending.pop_front();
        }
        ChannelOutcome::Retryable(reason) => {
            request.last_error = Some(reason);
            if request.attempts >= config.max_attempts {
                metrics.inc(&metrics.alerts_failed);
                error!(
                    "❌ Alert for event {} exhausted {} attempts on '{}': {} \
                     (event kept for manual review)",
                    request.event.event_id,
                    config.max_attempts,
                    request.channel,
                    request.last_error.as_deref().unwrap_or("unknown"),
                );
                pending.pop_front();
            } else {
                warn!(
                    "Alert delivery on '{}' failed (attempt {}/{}), backing off: {}",
                    request.channel,
                    request.attempts,
                    config.max_attempts,
                    request.last_error.as_deref().unwrap_or("unknown"),
                );
            }
        }
    }
}

fn backoff_for(config: &AlertingConfig, attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let exp = config
        .backoff_base_ms
        .saturating_mul(1u64 << (attempts - 1).min(16));
    Duration::from_millis(exp.min(config.backoff_max_ms))
}
