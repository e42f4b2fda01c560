//! Pending-publish queue.
//!
//! Publishes attempted while the transport is not ready are parked here and
//! drained strictly FIFO once it is. Each caller awaits a oneshot that
//! resolves only when its message was accepted or terminally rejected, which
//! makes the queue the backpressure mechanism for publishers.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use super::{BrokerError, Result};

/// A publish request buffered until the transport is ready.
pub struct PendingMessage<R> {
    pub record: R,
    pub responder: oneshot::Sender<Result<()>>,
    pub retries_left: u32,
}

/// FIFO of pending publishes with a single drainer at a time.
pub struct PendingQueue<R> {
    tx: mpsc::UnboundedSender<PendingMessage<R>>,
    /// Holding this lock is what makes a task "the drainer".
    rx: Mutex<mpsc::UnboundedReceiver<PendingMessage<R>>>,
    len: AtomicUsize,
}

impl<R: Send> Default for PendingQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send> PendingQueue<R> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            len: AtomicUsize::new(0),
        }
    }

    /// Park a record. The returned receiver resolves with the final outcome.
    pub fn enqueue(&self, record: R, retries: u32) -> oneshot::Receiver<Result<()>> {
        let (responder, outcome) = oneshot::channel();
        let message = PendingMessage {
            record,
            responder,
            retries_left: retries,
        };

        self.len.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            // Receiver lives as long as self; unreachable in practice.
            self.len.fetch_sub(1, Ordering::SeqCst);
            let _ = message
                .responder
                .send(Err(BrokerError::Publish("pending queue closed".to_string())));
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send every parked record through `send`, oldest first.
    ///
    /// Only one drain runs at a time; a concurrent call waits for the running
    /// one and then drains whatever arrived meanwhile. Returns how many
    /// records were processed.
    pub async fn drain<F, Fut>(&self, mut send: F) -> usize
    where
        F: FnMut(R, u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut rx = self.rx.lock().await;
        let mut drained = 0;

        while let Ok(message) = rx.try_recv() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            let PendingMessage {
                record,
                responder,
                retries_left,
            } = message;

            let outcome = send(record, retries_left).await;
            if responder.send(outcome).is_err() {
                debug!("Pending publisher went away before its outcome was delivered");
            }
            drained += 1;
        }

        drained
    }

    /// Reject every parked record, e.g. on disconnect.
    pub async fn reject_all(&self, reason: impl Fn() -> BrokerError) -> usize {
        let mut rx = self.rx.lock().await;
        let mut rejected = 0;

        while let Ok(message) = rx.try_recv() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            let _ = message.responder.send(Err(reason()));
            rejected += 1;
        }

        rejected
    }
}

/// Await the outcome of a parked publish.
pub async fn await_outcome(outcome: oneshot::Receiver<Result<()>>) -> Result<()> {
    outcome.await.unwrap_or(Err(BrokerError::Disconnected))
}
