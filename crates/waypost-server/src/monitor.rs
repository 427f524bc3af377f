//! Fleet monitor: ledger polling, inactivity tracking, batched
//! notifications.
//!
//! Two tickers drive the monitor. The fast one polls the error ledger for
//! entries past the last observed id and recomputes the set of inactive
//! edges (`now − last_seen` beyond the threshold), queueing a human-readable
//! notification whenever either changes. The slow one drains the queue into
//! a pluggable [`NotificationSink`].

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use waypost_store::Store;

use crate::error::ServerError;

/// Queued messages beyond this are dropped oldest-first.
const QUEUE_CAP: usize = 1024;

/// Where drained notification batches go.
///
/// The original deployment mailed them; any transport with a batch send
/// fits. Failures are logged and the batch is dropped, never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one drained batch.
    async fn send_batch(&self, messages: &[String]) -> Result<(), ServerError>;
}

/// Sink that writes notifications to the log.
///
/// The default when no external gateway is configured.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn send_batch(&self, messages: &[String]) -> Result<(), ServerError> {
        for message in messages {
            tracing::info!(target: "waypost_server::notifications", "{message}");
        }
        Ok(())
    }
}

/// Monitor cadence and thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ledger/inactivity polling cadence.
    pub poll_interval: Duration,
    /// Notification flush cadence.
    pub flush_interval: Duration,
    /// An edge unseen for longer than this is inactive.
    pub inactive_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(600),
            inactive_after: Duration::from_secs(600),
        }
    }
}

/// The fleet monitor task state.
pub struct FleetMonitor {
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
    config: MonitorConfig,
    queue: VecDeque<String>,
    last_error_id: i64,
    inactive: Vec<i64>,
}

impl FleetMonitor {
    /// Create a monitor over the given store and sink.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn NotificationSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            queue: VecDeque::new(),
            last_error_id: 0,
            inactive: Vec::new(),
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        // Seed the inactive set so the first poll reports changes, not the
        // initial state
        if let Ok(initial) = self.store.inactive_edges(self.config.inactive_after).await {
            self.inactive = initial;
        }
        self.enqueue("fleet monitor started".to_string());
        self.flush().await;

        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut flush_tick = tokio::time::interval(self.config.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately once; swallow that
        poll_tick.tick().await;
        flush_tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.flush().await;
                    return;
                },
                _ = poll_tick.tick() => self.poll().await,
                _ = flush_tick.tick() => self.flush().await,
            }
        }
    }

    /// One polling round: new ledger entries and inactivity transitions.
    pub async fn poll(&mut self) {
        match self.store.errors_since(self.last_error_id).await {
            Ok((entries, new_last_id)) => {
                for entry in entries {
                    self.enqueue(format!(
                        "[{}] {} x{}: {}",
                        entry.level.as_str(),
                        entry.kind.as_str(),
                        entry.count,
                        entry.text,
                    ));
                }
                self.last_error_id = new_last_id;
            },
            Err(err) => tracing::warn!(error = %err, "ledger poll failed"),
        }

        match self.store.inactive_edges(self.config.inactive_after).await {
            Ok(current) => {
                if current != self.inactive {
                    self.enqueue(format!(
                        "inactive edges changed from {:?} to {:?}",
                        self.inactive, current,
                    ));
                    self.inactive = current;
                }
            },
            Err(err) => tracing::warn!(error = %err, "inactive edge poll failed"),
        }
    }

    /// Drain the queue into the sink.
    pub async fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let batch: Vec<String> = self.queue.drain(..).collect();
        tracing::debug!(count = batch.len(), "flushing notifications");
        if let Err(err) = self.sink.send_batch(&batch).await {
            tracing::error!(error = %err, "notification sink failed");
        }
    }

    /// Queued messages awaiting a flush (test support).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&mut self, message: String) {
        if self.queue.len() >= QUEUE_CAP {
            self.queue.pop_front();
            tracing::warn!("notification queue full, dropping oldest");
        }
        self.queue.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use waypost_proto::Uuid;
    use waypost_store::{ErrorKind, ErrorLevel, ErrorReport, MemoryStore};

    use super::*;

    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { batches: Mutex::new(Vec::new()) })
        }

        #[allow(clippy::expect_used)]
        fn all_messages(&self) -> Vec<String> {
            self.batches.lock().expect("Mutex poisoned").concat()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        #[allow(clippy::expect_used)]
        async fn send_batch(&self, messages: &[String]) -> Result<(), ServerError> {
            self.batches.lock().expect("Mutex poisoned").push(messages.to_vec());
            Ok(())
        }
    }

    fn monitor(store: &MemoryStore, sink: Arc<RecordingSink>) -> FleetMonitor {
        FleetMonitor::new(Arc::new(store.clone()), sink, MonitorConfig::default())
    }

    #[tokio::test]
    async fn ledger_entries_become_notifications() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let mut monitor = monitor(&store, Arc::clone(&sink));

        store
            .record_error(
                ErrorReport {
                    kind: ErrorKind::Desync,
                    level: ErrorLevel::Warn,
                    text: "edge 1 clock skew of 10s".to_string(),
                    edge_id: Some(1),
                },
                Duration::from_secs(120),
            )
            .await
            .unwrap();

        monitor.poll().await;
        assert_eq!(monitor.queued(), 1);
        monitor.flush().await;

        let messages = sink.all_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("WARN"));
        assert!(messages[0].contains("DESYNC"));

        // Nothing new: the high-water mark advanced
        monitor.poll().await;
        assert_eq!(monitor.queued(), 0);
    }

    #[tokio::test]
    async fn inactivity_transitions_are_reported_once() {
        let store = MemoryStore::new();
        let uuid = Uuid::from_bytes([1; 16]);
        store.add_edge(uuid, -59.0, 2.0, [0.0; 3]);

        let sink = RecordingSink::new();
        let mut monitor = monitor(&store, Arc::clone(&sink));

        monitor.poll().await;
        assert_eq!(monitor.queued(), 0);

        store.set_edge_last_seen(uuid, Utc::now() - chrono::Duration::minutes(11));
        monitor.poll().await;
        assert_eq!(monitor.queued(), 1);

        // Unchanged set stays quiet
        monitor.poll().await;
        assert_eq!(monitor.queued(), 1);
    }

    #[tokio::test]
    async fn flush_drains_the_queue() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let mut monitor = monitor(&store, Arc::clone(&sink));

        monitor.enqueue("one".to_string());
        monitor.enqueue("two".to_string());
        monitor.flush().await;

        assert_eq!(monitor.queued(), 0);
        assert_eq!(sink.all_messages(), vec!["one".to_string(), "two".to_string()]);

        // Empty flush sends nothing
        monitor.flush().await;
        let batches = sink.batches.lock().map(|b| b.len()).unwrap_or_default();
        assert_eq!(batches, 1);
    }
}
