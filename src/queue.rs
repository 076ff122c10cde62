use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// The sending half of a [`Queue`]. Cloneable; `push` is non-blocking (§4.1).
#[derive(Clone)]
pub struct QueueHandle<T> {
    tx: UnboundedSender<T>,
}

impl<T> QueueHandle<T> {
    /// Enqueue `item`. Non-blocking; fails only if every `Queue` receiver has
    /// been dropped.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.0)
    }
}

/// An unbounded FIFO queue with a blocking (async) `recv`, matching §4.1:
/// `add(x)` is non-blocking, `remove()` blocks until an element is available,
/// FIFO order, safe for one-producer/one-consumer and multi-producer/
/// multi-consumer use. Backed by a `tokio::sync::mpsc` unbounded channel.
pub struct Queue<T> {
    rx: UnboundedReceiver<T>,
}

impl<T> Queue<T> {
    /// Create a new queue and its sending handle.
    pub fn new() -> (QueueHandle<T>, Self) {
        let (tx, rx) = unbounded_channel();
        (QueueHandle { tx }, Queue { rx })
    }

    /// Block until an element is available and return it, preserving FIFO order.
    ///
    /// Returns `None` if every sender has been dropped (the producer side
    /// shut down); callers that expect the queue to outlive them should treat
    /// this the same as the Python original's unbounded blocking `remove()`
    /// never returning once the process is torn down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// A counter initialized to `n`; `decrement()` atomically reduces it by one
/// and signals when it reaches zero; `wait()` blocks until it does (§4.1).
/// Multi-writer, one-waiter, matching §5's shared-resource note.
pub struct Counter {
    remaining: AtomicI64,
    zero: Notify,
}

impl Counter {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicI64::new(n as i64),
            zero: Notify::new(),
        })
    }

    /// Atomically decrement by one; wakes any `wait()` callers once the
    /// counter reaches zero. Decrementing below zero is a logic error (more
    /// helper tasks decremented than were configured) but is not itself fatal
    /// here — `wait()` would simply return immediately.
    pub fn decrement(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            self.zero.notify_waiters();
        }
    }

    /// Block until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            if self.remaining.load(Ordering::Acquire) <= 0 {
                return;
            }
            // Register before the second check to avoid missing a
            // decrement-then-notify that happens between the load above and
            // this call.
            let notified = self.zero.notified();
            if self.remaining.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Current remaining count, for diagnostics/tests.
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}
