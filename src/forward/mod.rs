//! Result forwarding to a collector.
//!
//! Forwarding is fire-and-forget from the capture loop's point of view:
//! [`Forwarder::submit`] hands the payload to a worker thread through a
//! bounded channel and never blocks. When the queue is full the payload is
//! dropped with a warning; local persistence is never affected by forwarding.

mod http;
mod websocket;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use crate::session::FrameRecord;
use crate::EngagementLevel;

pub use http::HttpTransport;
pub use websocket::WebSocketTransport;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Wire payload for one classified frame. Field names are the collector's
/// contract and must not change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub responden: String,
    pub sesi: String,
    pub frame: String,
    pub engagement_level: EngagementLevel,
    pub fps: f64,
    pub response_time: f64,
}

impl ResultPayload {
    pub fn from_record(respondent: &str, session_label: &str, record: &FrameRecord) -> Self {
        Self {
            responden: respondent.to_string(),
            sesi: session_label.to_string(),
            frame: record.frame_name.clone(),
            engagement_level: record.level,
            fps: record.fps,
            response_time: record.response_time,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ForwardConfig {
    /// Collector URL. `http(s)://` posts JSON, `ws(s)://` sends text frames.
    /// `None` disables forwarding.
    pub url: Option<String>,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            url: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Delivery of one payload to a collector.
pub trait ResultTransport: Send {
    fn describe(&self) -> String;

    /// Deliver `payload`. An error is logged by the worker and the payload is
    /// not retried.
    fn send(&mut self, payload: &ResultPayload) -> Result<()>;
}

/// Build the transport for `url`, selected by scheme.
pub fn transport_for_url(url: &str, timeout: Duration) -> Result<Box<dyn ResultTransport>> {
    let parsed = Url::parse(url).map_err(|err| anyhow!("invalid forward url '{}': {}", url, err))?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(HttpTransport::new(parsed, timeout))),
        "ws" | "wss" => Ok(Box::new(WebSocketTransport::new(parsed, timeout))),
        other => Err(anyhow!(
            "unsupported forward scheme '{}'; expected http(s) or ws(s)",
            other
        )),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub submitted: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Dropped because the queue was full or the worker had stopped.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Background forwarder. Disabled forwarders accept and discard payloads.
pub struct Forwarder {
    sender: Option<SyncSender<ResultPayload>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    target: Option<String>,
}

impl Forwarder {
    pub fn disabled() -> Self {
        Self {
            sender: None,
            worker: None,
            counters: Arc::new(Counters::default()),
            target: None,
        }
    }

    /// Start a forwarder for `config`, or a disabled one when no URL is set.
    pub fn start(config: &ForwardConfig) -> Result<Self> {
        match config.url.as_deref().map(str::trim) {
            None | Some("") => Ok(Self::disabled()),
            Some(url) => {
                let transport = transport_for_url(url, config.timeout)?;
                Self::with_transport(transport, config.queue_capacity)
            }
        }
    }

    pub fn with_transport(transport: Box<dyn ResultTransport>, queue_capacity: usize) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(anyhow!("forward queue capacity must be positive"));
        }
        let (sender, receiver) = sync_channel(queue_capacity);
        let counters = Arc::new(Counters::default());
        let target = transport.describe();
        let worker_counters = counters.clone();
        let worker = std::thread::Builder::new()
            .name("result-forwarder".to_string())
            .spawn(move || run_worker(transport, receiver, worker_counters))
            .map_err(|err| anyhow!("spawn forwarder thread: {}", err))?;
        log::info!("forwarding results to {}", target);
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            counters,
            target: Some(target),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Queue `payload` for delivery. Never blocks; returns false when the
    /// payload was dropped (or forwarding is disabled).
    pub fn submit(&self, payload: ResultPayload) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("forward queue full; dropping result for {}", payload.frame);
                false
            }
            Err(TrySendError::Disconnected(payload)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("forwarder stopped; dropping result for {}", payload.frame);
                false
            }
        }
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Deliver everything still queued, then stop the worker.
    pub fn shutdown(mut self) -> ForwardStats {
        self.stop_worker();
        self.counters.snapshot()
    }

    fn stop_worker(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("forwarder thread panicked");
            }
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn run_worker(
    mut transport: Box<dyn ResultTransport>,
    receiver: Receiver<ResultPayload>,
    counters: Arc<Counters>,
) {
    for payload in receiver {
        match transport.send(&payload) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "failed to forward {} to {}: {:#}",
                    payload.frame,
                    transport.describe(),
                    err
                );
            }
        }
    }
    log::debug!("forwarder for {} drained", transport.describe());
}
