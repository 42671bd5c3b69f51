//! Leaky bucket limiter.
//!
//! Admitted items wait in a bounded FIFO queue. A drain step running once
//! per period releases the oldest item for execution. Idle ticks are lost:
//! unlike a token bucket, a leaky bucket never banks capacity.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::clock::SharedClock;
use crate::config::{validate_shape, LimiterConfig, LimiterKind};
use crate::error::{AcquireError, ConfigError};
use crate::task::PeriodicTask;

/// A bounded queue drained at a fixed rate.
#[derive(Debug)]
pub struct LeakyBucket {
    shared: Arc<Shared>,
    drain_period: Duration,
    clock: SharedClock,
    _drain: Option<PeriodicTask>,
}

#[derive(Debug)]
struct Shared {
    capacity: u64,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Waiter>,
    next_seq: u64,
    enqueued: u64,
    released: u64,
    abandoned: u64,
}

#[derive(Debug)]
struct Waiter {
    seq: u64,
    tx: oneshot::Sender<()>,
}

/// Counters describing everything that passed through a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Items currently waiting
    pub queued: u64,
    /// Items ever admitted to the queue
    pub enqueued: u64,
    /// Items released for execution by the drain
    pub released: u64,
    /// Items that gave up before being released
    pub abandoned: u64,
}

impl LeakyBucket {
    /// Create a bucket whose drain runs as a background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(capacity: u64, drain_period: Duration, clock: SharedClock) -> Result<Self, ConfigError> {
        let mut bucket = Self::new_manual(capacity, drain_period, clock)?;
        let task = PeriodicTask::spawn(
            "leaky_bucket_drain",
            bucket.clock.clone(),
            drain_period,
            Arc::downgrade(&bucket.shared),
            |shared: &Shared| {
                shared.drain_once();
            },
        );
        bucket._drain = Some(task);
        Ok(bucket)
    }

    /// Create a bucket without a drain task; call [`drain_once`](Self::drain_once)
    /// to release items.
    pub fn new_manual(capacity: u64, drain_period: Duration, clock: SharedClock) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::LeakyBucket, capacity, drain_period)?;
        Ok(Self {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(QueueState::default()),
            }),
            drain_period,
            clock,
            _drain: None,
        })
    }

    /// Create a draining bucket from a limiter configuration.
    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, config.period(), clock)
    }

    /// Join the queue, or return `None` if it is full.
    pub fn try_enqueue(&self) -> Option<Ticket> {
        let mut state = self.shared.state.lock();
        if state.queue.len() as u64 >= self.shared.capacity {
            trace!(queued = state.queue.len(), "Leaky bucket full");
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.enqueued += 1;

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter { seq, tx });
        trace!(seq, queued = state.queue.len(), "Enqueued into leaky bucket");

        Some(Ticket {
            seq,
            shared: self.shared.clone(),
            clock: self.clock.clone(),
            rx,
            done: false,
        })
    }

    /// Release the oldest queued item. Returns whether an item was released.
    pub fn drain_once(&self) -> bool {
        self.shared.drain_once()
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    pub fn drain_period(&self) -> Duration {
        self.drain_period
    }

    /// Items currently waiting for their turn.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            queued: state.queue.len() as u64,
            enqueued: state.enqueued,
            released: state.released,
            abandoned: state.abandoned,
        }
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        // Tickets keep `Shared` alive, so close their channels explicitly.
        let mut state = self.shared.state.lock();
        let stranded = std::mem::take(&mut state.queue);
        if !stranded.is_empty() {
            state.abandoned += stranded.len() as u64;
            debug!(stranded = stranded.len(), "Leaky bucket dropped with queued items");
        }
    }
}

impl Shared {
    fn drain_once(&self) -> bool {
        let mut state = self.state.lock();
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.tx.send(()).is_ok() {
                state.released += 1;
                trace!(seq = waiter.seq, "Released item from leaky bucket");
                return true;
            }
            // Receiver vanished without deregistering; count it and move on.
            state.abandoned += 1;
        }
        false
    }

    fn abandon(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.seq == seq) {
            state.queue.remove(pos);
            state.abandoned += 1;
            debug!(seq, "Abandoned leaky bucket slot");
        }
    }
}

/// A place in a [`LeakyBucket`] queue.
///
/// Dropping a ticket before its turn gives the slot back.
#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    shared: Arc<Shared>,
    clock: SharedClock,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl Ticket {
    /// Position of this ticket in enqueue order.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Wait until the drain releases this item, up to `timeout`.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<(), AcquireError> {
        self.wait_or_cancel(timeout, std::future::pending()).await
    }

    /// Wait until released, the timeout elapses, or `cancel` completes.
    ///
    /// On timeout or cancellation the item leaves the queue.
    pub async fn wait_or_cancel<C>(mut self, timeout: Option<Duration>, cancel: C) -> Result<(), AcquireError>
    where
        C: Future<Output = ()>,
    {
        let deadline = match timeout {
            Some(timeout) => self.clock.sleep(timeout),
            None => future::pending().boxed(),
        };

        let result = tokio::select! {
            biased;
            released = &mut self.rx => match released {
                Ok(()) => Ok(()),
                Err(_) => Err(AcquireError::Rejected("leaky bucket dropped")),
            },
            _ = deadline => Err(AcquireError::Timeout(timeout.unwrap_or_default())),
            _ = cancel => Err(AcquireError::Canceled),
        };

        if result.is_ok() {
            self.done = true;
        }
        result
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Already released by the drain means nothing to give back.
        if self.rx.try_recv().is_ok() {
            return;
        }
        self.shared.abandon(self.seq);
    }
}
