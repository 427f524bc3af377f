//! Pull-model delivery of shell commands to edges.
//!
//! "Pending" is a command with `completed = false`; "oldest" is by enqueue
//! time. The ingest path consults [`ControlDispatcher::pull`] on every
//! sample-batch response; there is no push channel. Delivery is
//! at-least-once: the same command rides every response until the edge's
//! CONTROL_COMPLETE arrives, and completion is a one-way latch.

use std::sync::Arc;

use waypost_store::{PendingControl, Store, StoreError};

/// Dispatcher over the store's pending-command queue.
#[derive(Clone)]
pub struct ControlDispatcher {
    store: Arc<dyn Store>,
}

impl ControlDispatcher {
    /// Create a dispatcher over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The oldest undelivered command for an edge, rendered for the wire as
    /// `"<id>\n<text>"`.
    ///
    /// A store failure here is logged and swallowed: command delivery is
    /// opportunistic and must not fail the sample batch that triggered it.
    pub async fn pull(&self, edge_id: i64) -> Option<(i64, String)> {
        match self.store.next_pending_control(edge_id).await {
            Ok(Some(PendingControl { id, text })) => Some((id, format!("{id}\n{text}"))),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(edge_id, error = %err, "failed to fetch pending control");
                None
            },
        }
    }

    /// Accept a completion payload: latch the command and append a
    /// control-log row referencing it.
    pub async fn complete(
        &self,
        edge_id: i64,
        control_id: i64,
        output: &str,
    ) -> Result<(), StoreError> {
        self.store.complete_control(edge_id, control_id, output).await?;
        self.store
            .insert_control_log(edge_id, &format!("{control_id}\n{output}"))
            .await
    }
}
