//! Per-bucket admission queue.
//!
//! Every bucket is driven by one actor task that admits a single request at a time, in arrival
//! order, and holds the next admission back for whatever delay the previous response asked for:
//!
//! ```text
//! IDLE --ticket--> DISPATCHING --permit dropped--> WAITING (sleep > 0) --> IDLE
//!                               \--------------- sleep == 0 ------------/
//! ```
//!
//! Completion is signalled by dropping the [`BucketPermit`], so success, error, panic and
//! cancellation of the caller all release the bucket exactly once.

use crate::bucket::BucketKey;
use crate::error::RouterError;
use crate::sleeper::Sleeper;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

const STATE_IDLE: u8 = 0;
const STATE_DISPATCHING: u8 = 1;
const STATE_WAITING: u8 = 2;

/// Observable state of a bucket queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Ready to admit the next request.
    Idle,
    /// A request holds the bucket.
    Dispatching,
    /// Sleeping out a rate-limit delay before the next admission.
    Waiting,
}

impl QueueState {
    fn to_u8(self) -> u8 {
        match self {
            QueueState::Idle => STATE_IDLE,
            QueueState::Dispatching => STATE_DISPATCHING,
            QueueState::Waiting => STATE_WAITING,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_DISPATCHING => QueueState::Dispatching,
            STATE_WAITING => QueueState::Waiting,
            _ => QueueState::Idle,
        }
    }
}

type Ticket = oneshot::Sender<BucketPermit>;

#[derive(Debug)]
struct Shared {
    key: BucketKey,
    state: AtomicU8,
    sleep_nanos: AtomicU64,
    queued: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: QueueState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn take_sleep(&self) -> Duration {
        Duration::from_nanos(self.sleep_nanos.swap(0, Ordering::AcqRel))
    }
}

/// Exclusive right to dispatch on a bucket. Dropping it completes the request.
#[derive(Debug)]
pub struct BucketPermit {
    key: BucketKey,
    done: Option<oneshot::Sender<()>>,
}

impl BucketPermit {
    /// Bucket this permit belongs to.
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Release the bucket now.
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// FIFO admission queue for one bucket.
///
/// Must be created inside a tokio runtime; the driving task ends when the queue is dropped.
#[derive(Debug)]
pub struct RequestQueue {
    shared: Arc<Shared>,
    tickets: mpsc::UnboundedSender<Ticket>,
}

impl RequestQueue {
    /// Spawn the actor for `key`, waiting out delays through `sleeper`.
    pub fn new(key: BucketKey, sleeper: Arc<dyn Sleeper>) -> Self {
        let (tickets, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            key,
            state: AtomicU8::new(STATE_IDLE),
            sleep_nanos: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
        });
        tokio::spawn(drive(shared.clone(), rx, sleeper));
        Self { shared, tickets }
    }

    /// Wait for exclusive dispatch rights. Cancel-safe: dropping the future forfeits the slot.
    pub async fn admit(&self) -> Result<BucketPermit, RouterError> {
        let (ticket, permit) = oneshot::channel();
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if self.tickets.send(ticket).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(RouterError::Closed("bucket queue"));
        }
        permit.await.map_err(|_| RouterError::Closed("bucket queue"))
    }

    /// Delay the admission that follows the in-flight request. Zero clears a pending delay.
    pub fn set_sleep_time(&self, delay: Duration) {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.shared.sleep_nanos.store(nanos, Ordering::Release);
    }

    /// Delay currently pending.
    pub fn sleep_time(&self) -> Duration {
        Duration::from_nanos(self.shared.sleep_nanos.load(Ordering::Acquire))
    }

    /// Current state.
    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Tickets not yet picked up by the actor, including ones whose waiter gave up.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Bucket key.
    pub fn key(&self) -> &BucketKey {
        &self.shared.key
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut tickets: mpsc::UnboundedReceiver<Ticket>,
    sleeper: Arc<dyn Sleeper>,
) {
    while let Some(ticket) = tickets.recv().await {
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        let (done, finished) = oneshot::channel();
        let permit = BucketPermit { key: shared.key.clone(), done: Some(done) };
        shared.set_state(QueueState::Dispatching);
        if ticket.send(permit).is_err() {
            trace!(bucket = %shared.key, "waiter gone before admission");
            shared.set_state(QueueState::Idle);
            continue;
        }
        // Err means the permit was dropped without an explicit send; same outcome.
        let _ = finished.await;
        let sleep = shared.take_sleep();
        if !sleep.is_zero() {
            shared.set_state(QueueState::Waiting);
            debug!(bucket = %shared.key, ?sleep, "delaying next request");
            sleeper.sleep(sleep).await;
        }
        shared.set_state(QueueState::Idle);
    }
    trace!(bucket = %shared.key, "bucket queue closed");
}
