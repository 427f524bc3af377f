//! Rate-collapsing error ledger.
//!
//! Thin wrapper over the store's error operations that fixes the collapse
//! windows. Recording never fails the caller: a ledger write that cannot
//! land is logged and dropped, so an error path cannot recurse into itself
//! through the store.

use std::{sync::Arc, time::Duration};

use waypost_store::{ErrorKind, ErrorLevel, ErrorReport, Store};

/// Collapse window for repeated clock-skew reports from one edge.
pub const DESYNC_COLLAPSE_WINDOW: Duration = Duration::from_secs(120);

/// Collapse window for semantic errors (unknown edge or beacon).
pub const SEMANTIC_COLLAPSE_WINDOW: Duration = Duration::from_secs(120);

/// Handle for recording collapsed errors.
#[derive(Clone)]
pub struct ErrorLedger {
    store: Arc<dyn Store>,
}

impl ErrorLedger {
    /// Create a ledger over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a clock-skew observation.
    pub async fn record_desync(&self, level: ErrorLevel, edge_id: i64, skew_secs: i64) {
        self.record(
            ErrorReport {
                kind: ErrorKind::Desync,
                level,
                text: format!("edge {edge_id} clock skew of {skew_secs}s"),
                edge_id: Some(edge_id),
            },
            DESYNC_COLLAPSE_WINDOW,
        )
        .await;
    }

    /// Record a semantic error (unknown edge or beacon reference).
    pub async fn record_semantic(&self, kind: ErrorKind, text: String, edge_id: Option<i64>) {
        self.record(
            ErrorReport { kind, level: ErrorLevel::Error, text, edge_id },
            SEMANTIC_COLLAPSE_WINDOW,
        )
        .await;
    }

    async fn record(&self, report: ErrorReport, window: Duration) {
        if let Err(err) = self.store.record_error(report, window).await {
            tracing::error!(error = %err, "failed to record ledger entry");
        }
    }
}
