// src/store.rs
//
// Event persistence. The engine calls persist on every create/extend/close
// transition; the ingestion lanes never wait on the backend. Writes flow
// through a fire-and-forget writer task with a bounded local buffer:
// backend failures are retried, and overflow drops the oldest unacknowledged
// write with a loud warning. Open events live in the aggregator, never
// here, so a store outage cannot lose one.

use crate::config::StoreConfig;
use crate::errors::EngineError;
use crate::pipeline::metrics::EngineMetrics;
use crate::types::EventRecord;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub trait EventStore: Send {
    fn persist(&mut self, record: &EventRecord) -> Result<(), EngineError>;
}

/// Append-only JSONL store: one line per lifecycle transition, so the full
/// event history replays from the file.
pub struct JsonlEventStore {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlEventStore {
    pub fn new(output_dir: &str) -> Result<Self, EngineError> {
        fs::create_dir_all(output_dir)
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            path: PathBuf::from(output_dir).join("events.jsonl"),
            file: None,
        })
    }

    fn file(&mut self) -> Result<&mut File, EngineError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }
}

impl EventStore for JsonlEventStore {
    fn persist(&mut self, record: &EventRecord) -> Result<(), EngineError> {
        let line = serde_json::to_string(record)
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        let file = self.file()?;
        writeln!(file, "{}", line).map_err(|e| {
            // Reopen on the next attempt; the handle may be stale.
            self.file = None;
            EngineError::StoreUnavailable(e.to_string())
        })?;
        Ok(())
    }
}

/// Handle the lanes use. Sending never blocks; the writer task owns the
/// buffering and retries.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl StoreHandle {
    pub fn persist(&self, record: EventRecord) {
        // The writer outlives the lanes; a send failure means shutdown is
        // already past the point where this write could matter.
        let _ = self.tx.send(record);
    }
}

pub fn spawn_store_writer(
    store: Box<dyn EventStore>,
    config: StoreConfig,
    metrics: Arc<EngineMetrics>,
) -> (StoreHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(store_writer_loop(store, config, metrics, rx));
    (StoreHandle { tx }, handle)
}

async fn store_writer_loop(
    mut store: Box<dyn EventStore>,
    config: StoreConfig,
    metrics: Arc<EngineMetrics>,
    mut rx: mpsc::UnboundedReceiver<EventRecord>,
) {
    let mut pending: VecDeque<EventRecord> = VecDeque::new();
    // Retry attempts spent on the current head of the queue.
    let mut head_attempts: u32 = 0;
    let mut retry_timer = tokio::time::interval(Duration::from_millis(config.retry_delay_ms));
    retry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(record) => {
                        pending.push_back(record);
                        if pending.len() > config.buffer_capacity {
                            let dropped = pending.pop_front().unwrap();
                            head_attempts = 0;
                            metrics.inc(&metrics.store_dropped);
                            warn!(
                                "⚠️  Store buffer full ({}), dropping oldest unacknowledged \
                                 write for event {}",
                                config.buffer_capacity, dropped.event_id
                            );
                        }
                        flush(&mut store, &mut pending, &mut head_attempts, &config, &metrics);
                    }
                    None => break,
                }
            }
            _ = retry_timer.tick(), if !pending.is_empty() => {
                flush(&mut store, &mut pending, &mut head_attempts, &config, &metrics);
            }
        }
    }

    // Intake closed: final flush passes for whatever is still buffered.
    for _ in 0..=config.retry_attempts {
        flush(&mut store, &mut pending, &mut head_attempts, &config, &metrics);
        if pending.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
    }
    if !pending.is_empty() {
        error!(
            "Store writer shutting down with {} unpersisted record(s)",
            pending.len()
        );
    }
    debug!("Store writer stopped");
}

fn flush(
    store: &mut Box<dyn EventStore>,
    pending: &mut VecDeque<EventRecord>,
    head_attempts: &mut u32,
    config: &StoreConfig,
    metrics: &EngineMetrics,
) {
    while let Some(record) = pending.front() {
        match store.persist(record) {
            Ok(()) => {
                pending.pop_front();
                *head_attempts = 0;
                metrics.inc(&metrics.store_writes);
            }
            Err(e) => {
                *head_attempts += 1;
                metrics.inc(&metrics.store_retries);
                if *head_attempts > config.retry_attempts {
                    let dropped = pending.pop_front().unwrap();
                    *head_attempts = 0;
                    metrics.inc(&metrics.store_dropped);
                    error!(
                        "⚠️  Store write for event {} abandoned after {} attempts: {}",
                        dropped.event_id, config.retry_attempts, e
                    );
                } else {
                    warn!(
                        "Store write failed (attempt {}/{}), will retry: {}",
                        head_attempts, config.retry_attempts, e
                    );
                    break;
                }
            }
        }
    }
}
