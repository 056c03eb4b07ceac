//! Out-of-band control messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::worker::ServiceWorker;
use crate::SwError;

/// Sender side of a worker's message channel.
///
/// Posting never waits for the worker. Dropping every sender lets the
/// receiving task finish once queued messages are handled.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    tx: mpsc::UnboundedSender<String>,
}

impl ControlChannel {
    /// Start the receiving task for `worker`.
    pub fn spawn(worker: Arc<ServiceWorker>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                debug!(worker = ?worker.id(), message = %message, "Control message received");
                worker.handle_message(&message).settled().await;
            }
            debug!(worker = ?worker.id(), "Control channel closed");
        });

        (Self { tx }, task)
    }

    /// Queue a message for the worker.
    pub fn post_message(&self, message: impl Into<String>) -> Result<(), SwError> {
        self.tx
            .send(message.into())
            .map_err(|_| SwError::State("worker is no longer receiving messages".to_string()))
    }
}
