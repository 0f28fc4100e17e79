// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared retransmission scheduler.
//!
//! One instance serves the whole process: every transaction retransmit and
//! linger timer goes through the same worker task, which pops a deadline-
//! ordered heap and runs callbacks in order. Deadlines that were missed
//! while the worker was busy are coalesced and fired once, at the true now.
//!
//! `cancel` is synchronous and idempotent: a handle cancelled before its
//! callback begins guarantees the callback never runs.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use sip_timer::RetryScheduler;
//! # async fn example() {
//! let scheduler = RetryScheduler::new();
//! let handle = scheduler.schedule_after(Duration::from_millis(500), || {
//!     println!("T1 fired");
//! });
//! handle.cancel(); // too late to retransmit after all
//! # }
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Callback type run on the scheduler's worker task.
///
/// Callbacks must not block; anything slow should hop to its own task.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    wakeup: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl TimerHandle {
    /// Cancels the scheduled callback. Synchronous and idempotent: if this
    /// returns before the callback started, the callback never runs.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, AtomicOrdering::SeqCst) {
            let _ = self.wakeup.send(Command::Cancelled(self.id));
        }
    }

    /// Returns true once the callback can no longer run.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

enum Command {
    Schedule(Entry),
    Cancelled(u64),
}

struct Entry {
    id: u64,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

/// Heap adapter: earliest deadline first, insertion id as the tiebreak so
/// two timers due at the same instant fire in schedule order.
struct HeapEntry(Entry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to pop the earliest deadline.
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

/// Process-wide timer service. Exactly one worker task owns the wheel;
/// callers only post to it.
pub struct RetryScheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

static SHARED: OnceCell<Arc<RetryScheduler>> = OnceCell::new();

impl RetryScheduler {
    /// Creates a scheduler with its own worker task. Tests use this to get
    /// an isolated wheel; production code normally calls [`shared`].
    ///
    /// [`shared`]: RetryScheduler::shared
    pub fn new() -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(run_wheel(cmd_rx));
        scheduler
    }

    /// Returns the process-shared instance, creating it on first use. Must
    /// first be called from within a tokio runtime.
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(Self::new).clone()
    }

    /// Current monotonic time, the clock all deadlines are measured on.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Schedules `callback` to run at `deadline` on the worker task.
    pub fn schedule_at(
        &self,
        deadline: Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            id,
            deadline,
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        };
        // Send can only fail at shutdown, when firing is moot anyway.
        let _ = self.cmd_tx.send(Command::Schedule(entry));
        TimerHandle {
            id,
            cancelled,
            wakeup: self.cmd_tx.clone(),
        }
    }

    /// Schedules `callback` to run after `delay`.
    pub fn schedule_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, callback)
    }
}

async fn run_wheel(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();

    loop {
        // Drop cancelled heads eagerly so they never shorten the sleep.
        while let Some(head) = heap.peek() {
            if head.0.cancelled.load(AtomicOrdering::SeqCst) {
                heap.pop();
            } else {
                break;
            }
        }

        let next_deadline = heap.peek().map(|e| e.0.deadline);
        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Schedule(entry)) => heap.push(HeapEntry(entry)),
                        Some(Command::Cancelled(_)) => {}
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        fire_due(&mut heap);
                    }
                }
            }
            None => match cmd_rx.recv().await {
                Some(Command::Schedule(entry)) => heap.push(HeapEntry(entry)),
                Some(Command::Cancelled(_)) => {}
                None => break,
            },
        }
    }
}

/// Runs every entry whose deadline has passed. Entries that became due while
/// an earlier callback ran are included, so a missed deadline fires once
/// rather than queueing a burst.
fn fire_due(heap: &mut BinaryHeap<HeapEntry>) {
    let now = Instant::now();
    while let Some(head) = heap.peek() {
        if head.0.deadline > now {
            break;
        }
        let entry = heap.pop().expect("peeked").0;
        if entry.cancelled.swap(true, AtomicOrdering::SeqCst) {
            continue;
        }
        trace!(id = entry.id, "timer fired");
        (entry.callback)();
    }
}
