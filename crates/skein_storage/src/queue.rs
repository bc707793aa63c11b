//! Bounded write queue shared by the persistent providers.
//!
//! One writer task per store drains the queue strictly in FIFO order. The
//! queue capacity is the persistence backpressure bound: once it is full,
//! further writes are refused immediately rather than blocking publishers.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{AckReceiver, StorageError};

pub(crate) const WRITE_QUEUE_CAPACITY: usize = 5000;

pub(crate) struct WriteRequest {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub deadline: Instant,
    pub ack: oneshot::Sender<Result<(), StorageError>>,
}

/// The enqueue half of a store's write queue. `None` after close.
pub(crate) type QueueHandle = Mutex<Option<mpsc::Sender<WriteRequest>>>;

/// Non-blocking enqueue. Failures are delivered on the returned channel so
/// the caller sees exactly one outcome either way.
pub(crate) fn enqueue(
    queue: &QueueHandle,
    key: &str,
    value: Value,
    timestamp: DateTime<Utc>,
    deadline: Instant,
) -> AckReceiver {
    let (ack_tx, ack_rx) = oneshot::channel();
    let request = WriteRequest {
        key: key.to_string(),
        value,
        timestamp,
        deadline,
        ack: ack_tx,
    };

    let guard = queue.lock().unwrap();
    match guard.as_ref() {
        None => {
            let _ = request.ack.send(Err(StorageError::Closed));
        }
        Some(tx) => match tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                let _ = request.ack.send(Err(StorageError::QueueFull));
            }
            Err(TrySendError::Closed(request)) => {
                let _ = request.ack.send(Err(StorageError::Closed));
            }
        },
    }

    ack_rx
}

/// Spawn the single writer task for a store.
///
/// The task drains requests FIFO, checking each request's deadline before
/// the write runs. It stops when the queue closes (store close, after
/// draining) or when `shutdown` is cancelled; requests still queued at
/// cancellation are acknowledged as `Cancelled`.
pub(crate) fn spawn_writer<F>(
    mut rx: mpsc::Receiver<WriteRequest>,
    shutdown: CancellationToken,
    mut write: F,
) -> JoinHandle<()>
where
    F: FnMut(&WriteRequest) -> Result<(), StorageError> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { return };
                    if Instant::now() >= request.deadline {
                        let _ = request.ack.send(Err(StorageError::Cancelled));
                        continue;
                    }
                    let outcome = write(&request);
                    if let Err(unclaimed) = request.ack.send(outcome) {
                        // The watcher gave up waiting; a failure still gets
                        // logged even though nobody will hear about it.
                        if let Err(error) = unclaimed {
                            warn!(error = %error, "write outcome arrived after its watcher expired");
                        }
                    }
                }
            }
        }

        // Cancelled: report every pending ack instead of leaving callers
        // hanging until their own timeouts fire.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            let _ = request.ack.send(Err(StorageError::Cancelled));
        }
    })
}
