/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::DeliverySettings;
use crate::delivery::{Deliverer, SendOutcome};
use crate::transport::RequestKey;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub max_pending: usize,
    pub log_len: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_interval: Duration::from_secs(30),
            max_pending: 1000,
            log_len: 16,
        }
    }
}

impl From<&DeliverySettings> for QueueSettings {
    fn from(s: &DeliverySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            retry_interval: Duration::from_secs(s.retry_interval_secs),
            max_pending: s.max_pending,
            log_len: s.attempt_log_len,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub inbox: String,
    pub attempt: u32,
    pub outcome: String,
}

/// Ring buffer over the most recent delivery attempts.
pub struct AttemptLog {
    ring: Mutex<VecDeque<AttemptRecord>>,
    capacity: usize,
}

impl AttemptLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn record(&self, record: AttemptRecord) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push_back(record);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Final word on one fan-out target, surfaced on the batch report channel.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub inbox: String,
    pub delivered: bool,
    pub attempts: u32,
    pub aborted_unauthorized: bool,
}

/// One task per in-flight fan-out target. The pending registry is bounded;
/// under pressure the oldest pending send is cancelled to admit the newest.
/// Retries are preemptible through the shutdown channel.
pub struct DeliveryPool {
    deliverer: Arc<Deliverer>,
    settings: QueueSettings,
    log: Arc<AttemptLog>,
    pending: Arc<Mutex<VecDeque<(u64, AbortHandle)>>>,
    seq: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryPool {
    pub fn new(
        deliverer: Arc<Deliverer>,
        settings: QueueSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let log = Arc::new(AttemptLog::new(settings.log_len));
        Self {
            deliverer,
            settings,
            log,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            seq: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn attempt_log(&self) -> Arc<AttemptLog> {
        self.log.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn spawn_send(
        &self,
        key: RequestKey,
        inbox: String,
        body: Bytes,
        reports: mpsc::UnboundedSender<DeliveryReport>,
    ) {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let deliverer = self.deliverer.clone();
        let settings = self.settings.clone();
        let log = self.log.clone();
        let shutdown = self.shutdown.clone();
        let pending = self.pending.clone();

        let mut queue = pending.lock().unwrap_or_else(|e| e.into_inner());
        while queue.len() >= self.settings.max_pending {
            // Shed-oldest backpressure: cancel to admit the newest.
            if let Some((old_id, handle)) = queue.pop_front() {
                warn!("delivery pool full, cancelling oldest pending send ({old_id})");
                handle.abort();
            }
        }
        let pending_for_task = pending.clone();
        let handle = tokio::spawn(async move {
            let report = run_send(deliverer, settings, log, shutdown, key, &inbox, &body).await;
            let _ = reports.send(report);
            pending_for_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(pid, _)| *pid != id);
        });
        queue.push_back((id, handle.abort_handle()));
    }
}

async fn run_send(
    deliverer: Arc<Deliverer>,
    settings: QueueSettings,
    log: Arc<AttemptLog>,
    mut shutdown: watch::Receiver<bool>,
    key: RequestKey,
    inbox: &str,
    body: &Bytes,
) -> DeliveryReport {
    let mut attempt = 0u32;
    while attempt < settings.max_attempts {
        attempt += 1;
        let outcome = deliverer.send(&key, inbox, body).await;
        log.record(AttemptRecord {
            inbox: inbox.to_string(),
            attempt,
            outcome: match &outcome {
                SendOutcome::Delivered => "delivered".to_string(),
                SendOutcome::Unauthorized(status) => format!("unauthorized ({status})"),
                SendOutcome::Transient(reason) => format!("transient: {reason}"),
            },
        });

        match outcome {
            SendOutcome::Delivered => {
                info!("delivered to {inbox} (attempt {attempt})");
                return DeliveryReport {
                    inbox: inbox.to_string(),
                    delivered: true,
                    attempts: attempt,
                    aborted_unauthorized: false,
                };
            }
            SendOutcome::Unauthorized(status) => {
                // Terminal: no retry budget spent on a host that rejected us.
                warn!("delivery to {inbox} unauthorized ({status}), aborting");
                return DeliveryReport {
                    inbox: inbox.to_string(),
                    delivered: false,
                    attempts: attempt,
                    aborted_unauthorized: true,
                };
            }
            SendOutcome::Transient(_) if attempt < settings.max_attempts => {
                tokio::select! {
                    _ = tokio::time::sleep(settings.retry_interval) => {}
                    _ = shutdown.changed() => {
                        return DeliveryReport {
                            inbox: inbox.to_string(),
                            delivered: false,
                            attempts: attempt,
                            aborted_unauthorized: false,
                        };
                    }
                }
            }
            SendOutcome::Transient(_) => {}
        }
    }

    warn!("delivery to {inbox} exhausted {} attempts", settings.max_attempts);
    DeliveryReport {
        inbox: inbox.to_string(),
        delivered: false,
        attempts: attempt,
        aborted_unauthorized: false,
    }
}
