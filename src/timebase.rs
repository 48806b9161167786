//! Abstract time operations
//!
//! No component reads the OS clock directly: wall-clock reads and delays
//! go through [`Timebase`] so tests can drive time deterministically.
//! `SysClock` is the production implementation; `SimClock` is a virtual
//! clock whose `advance` wakes due sleepers in deadline order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Abstract clock: wall-clock reads and cancellable delays.
#[async_trait]
pub trait Timebase: Send + Sync {
    /// Current wall-clock instant
    fn now_utc(&self) -> DateTime<Utc>;

    /// Completes when virtual time reaches `now + duration`
    async fn sleep(&self, duration: Duration);

    /// Completes when virtual time reaches `deadline`; immediate if past
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = self.now_utc();
        if deadline <= now {
            return;
        }
        let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        self.sleep(wait).await;
    }
}

/// Real clock (production)
#[derive(Debug, Clone, Copy, Default)]
pub struct SysClock;

#[async_trait]
impl Timebase for SysClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct Sleeper {
    due: DateTime<Utc>,
    seq: u64,
    waker: Option<oneshot::Sender<()>>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    // Reversed: BinaryHeap is a max-heap, the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SimClockInner {
    now: DateTime<Utc>,
    sleepers: BinaryHeap<Sleeper>,
    next_seq: u64,
}

/// Simulated clock (tests).
///
/// Time only moves through [`SimClock::advance`]; pending sleeps whose
/// deadlines are reached are woken in deadline order before `advance`
/// returns, so `advance(d)` deterministically releases everything due
/// within `d`.
#[derive(Clone)]
pub struct SimClock {
    inner: Arc<Mutex<SimClockInner>>,
}

impl SimClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimClockInner {
                now: start,
                sleepers: BinaryHeap::new(),
                next_seq: 0,
            })),
        }
    }

    /// Create a clock frozen at the Unix epoch plus one day.
    ///
    /// The offset keeps "now minus a tolerance" arithmetic away from the
    /// epoch sentinel used for unset timestamps.
    pub fn starting_now() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(1))
    }

    /// Advance virtual time, waking sleepers that come due.
    pub fn advance(&self, delta: Duration) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.now += chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero());
            let now = inner.now;
            let mut woken = Vec::new();
            while inner
                .sleepers
                .peek()
                .map(|sleeper| sleeper.due <= now)
                .unwrap_or(false)
            {
                if let Some(mut sleeper) = inner.sleepers.pop() {
                    if let Some(waker) = sleeper.waker.take() {
                        woken.push(waker);
                    }
                }
            }
            woken
        };
        for waker in woken {
            // Receiver may have been cancelled; nothing to do then.
            let _ = waker.send(());
        }
    }

    /// Number of sleeps currently parked on the clock.
    pub fn pending_sleepers(&self) -> usize {
        self.inner.lock().sleepers.len()
    }
}

#[async_trait]
impl Timebase for SimClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let rx = {
            let mut inner = self.inner.lock();
            let due = inner.now
                + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.sleepers.push(Sleeper {
                due,
                seq,
                waker: Some(tx),
            });
            rx
        };
        let _ = rx.await;
    }
}
