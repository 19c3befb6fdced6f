use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;
const TIMED_OUT: u8 = 3;

/// Failures produced by [`AsyncSemaphore`]. Kept separate from
/// [`pipelinekit_types::PipelineError`]: the semaphore is a standalone
/// primitive with no opinion on how its caller reports admission failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("cancelled while waiting for a permit")]
    Cancelled,
    #[error("timed out waiting for a permit")]
    TimedOut,
}

struct WaiterNode {
    id: u64,
    state: AtomicU8,
    notify: Notify,
    deadline: Option<Instant>,
    priority: i32,
}

impl WaiterNode {
    fn new(id: u64, deadline: Option<Instant>, priority: i32) -> Self {
        Self {
            id,
            state: AtomicU8::new(PENDING),
            notify: Notify::new(),
            deadline,
            priority,
        }
    }

    fn try_transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct SemState {
    available: usize,
    waiters: VecDeque<Arc<WaiterNode>>,
}

struct Inner {
    state: Mutex<SemState>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Inner {
    /// Hand the next available permit to the first live waiter, skipping any
    /// already cancelled or timed out; if the queue drains, the permit
    /// becomes an available one instead of being lost.
    fn signal(self_arc: &Arc<Self>) {
        let mut state = self_arc.state.lock();
        loop {
            match state.waiters.pop_front() {
                Some(node) => {
                    if node.try_transition(COMPLETED) {
                        node.notify.notify_one();
                        return;
                    }
                    // Dead waiter (already cancelled/timed out); keep looking.
                }
                None => {
                    state.available += 1;
                    return;
                }
            }
        }
    }
}

/// A FIFO-fair async semaphore with cancellation-safe waiters.
///
/// Waiters are admitted in arrival order. Cancelling or timing out one
/// waiter never disturbs another: a dead waiter's slot in the queue is
/// simply skipped the next time a permit is handed out. See spec §4.1 for
/// the full invariant list this upholds.
pub struct AsyncSemaphore {
    inner: Arc<Inner>,
}

impl AsyncSemaphore {
    pub fn new(capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(SemState {
                available: capacity,
                waiters: VecDeque::new(),
            }),
            capacity,
            next_id: AtomicU64::new(0),
        });
        spawn_sweeper(Arc::downgrade(&inner));
        Self { inner }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits not currently held. Diagnostic only — never branch dispatch
    /// logic on this value, since it can change between the read and the
    /// next `acquire`.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Take a permit immediately if one is free, without enqueuing.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.available > 0 {
            state.available -= 1;
            Some(Permit::new(self.inner.clone()))
        } else {
            None
        }
    }

    /// Current number of waiters queued behind a held permit. Diagnostic
    /// only, same caveat as `available()`.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub async fn acquire(&self) -> Result<Permit, SemaphoreError> {
        self.acquire_inner(None, None, 0).await
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Permit, SemaphoreError> {
        self.acquire_inner(Some(Instant::now() + timeout), None, 0)
            .await
    }

    /// Like `acquire`, but tags the waiter with a priority so it can be
    /// targeted (or spared) by `cancel_lowest_priority_waiter_below`.
    pub async fn acquire_with_priority(&self, priority: i32) -> Result<Permit, SemaphoreError> {
        self.acquire_inner(None, None, priority).await
    }

    /// Cancel the longest-waiting queued waiter, if any, waking it with
    /// `SemaphoreError::Cancelled`. Used by callers that want newer arrivals
    /// to take priority over ones already queued, e.g. `DropOldest`
    /// admission. Does not affect `available`: the evicted waiter was never
    /// holding a permit.
    pub fn cancel_oldest_waiter(&self) -> bool {
        let mut state = self.inner.state.lock();
        while let Some(node) = state.waiters.pop_front() {
            if node.try_transition(CANCELLED) {
                node.notify.notify_one();
                return true;
            }
        }
        false
    }

    /// Cancel the queued waiter with the lowest priority, but only if it is
    /// strictly lower than `newcomer_priority`. Ties and an empty or
    /// all-outranking queue both return `false`, leaving the queue
    /// untouched. Used by `DropPriority` admission.
    pub fn cancel_lowest_priority_waiter_below(&self, newcomer_priority: i32) -> bool {
        let mut state = self.inner.state.lock();
        loop {
            let Some((idx, _)) = state.waiters.iter().enumerate().min_by_key(|(_, w)| w.priority)
            else {
                return false;
            };
            if state.waiters[idx].priority >= newcomer_priority {
                return false;
            }
            let node = state.waiters.remove(idx).expect("index came from this deque");
            if node.try_transition(CANCELLED) {
                node.notify.notify_one();
                return true;
            }
            // Already resolved by a concurrent signal; it's gone from the
            // queue either way, keep looking for another candidate.
        }
    }

    pub async fn acquire_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Permit, SemaphoreError> {
        self.acquire_inner(None, Some(cancel), 0).await
    }

    async fn acquire_inner(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
        priority: i32,
    ) -> Result<Permit, SemaphoreError> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(WaiterNode::new(id, deadline, priority));
        {
            let mut state = self.inner.state.lock();
            state.waiters.push_back(node.clone());
        }
        let _guard = WaiterGuard {
            inner: self.inner.clone(),
            node: node.clone(),
        };

        let notified = node.notify.notified();
        tokio::pin!(notified);

        match (deadline, cancel) {
            (Some(dl), Some(token)) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(dl) => {}
                    _ = token.cancelled() => {}
                }
            }
            (Some(dl), None) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(dl) => {}
                }
            }
            (None, Some(token)) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = token.cancelled() => {}
                }
            }
            (None, None) => {
                notified.await;
            }
        }

        match node.state.load(Ordering::Acquire) {
            COMPLETED => Ok(Permit::new(self.inner.clone())),
            _ => {
                // Not yet completed: this waiter lost the race (timeout or
                // cancellation fired). Claim a terminal state ourselves;
                // if a concurrent `signal` beat us to COMPLETED, take the
                // permit instead — the signal always wins a true race.
                if node.try_transition(TIMED_OUT) || node.try_transition(CANCELLED) {
                    let was_cancel = cancel.is_some_and(|t| t.is_cancelled());
                    if was_cancel {
                        Err(SemaphoreError::Cancelled)
                    } else {
                        Err(SemaphoreError::TimedOut)
                    }
                } else {
                    Ok(Permit::new(self.inner.clone()))
                }
            }
        }
    }
}

/// Removes a dropped waiter from the queue so dead entries never accumulate
/// past the next `signal`. Runs whenever `acquire`'s future is dropped,
/// including on task abort, which is how Rust tasks are actually cancelled.
struct WaiterGuard {
    inner: Arc<Inner>,
    node: Arc<WaiterNode>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.node.try_transition(CANCELLED) {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|w| w.id != self.node.id);
        }
    }
}

/// A held permit. Releases back to the semaphore exactly once, whether
/// through an explicit `release()` or an implicit drop (including on panic
/// unwind).
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Permit {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(inner) = self.inner.take() {
            Inner::signal(&inner);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn spawn_sweeper(weak: Weak<Inner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let now = Instant::now();
            let mut state = inner.state.lock();
            let before = state.waiters.len();
            state.waiters.retain(|node| {
                let expired = node.deadline.is_some_and(|dl| dl <= now);
                if expired && node.try_transition(TIMED_OUT) {
                    node.notify.notify_one();
                    false
                } else {
                    true
                }
            });
            if state.waiters.len() != before {
                trace!(
                    swept = before - state.waiters.len(),
                    "semaphore sweep removed expired waiters"
                );
            }
        }
    });
}
