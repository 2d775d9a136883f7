//! Process-wide pacing gates shared by all concurrent openers.
//!
//! Pausing before a spare connection attempt is a process-wide concern:
//! the prime head start is per opener, but the spare gap and spare cap
//! are enforced across every opener of the worker.  Each gate keeps a
//! FIFO of waiting openers and a single timer armed for the earliest
//! deadline; waking the front waiter cannot starve the ones behind it,
//! because a FIFO of equal pauses is naturally deadline-ordered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::StreamExt;
use futures::channel::oneshot;
use postage::watch;
use tor_rtcompat::{Runtime, SleepProvider};

use crate::config::OpenerConfig;

/// Both pacing gates, bundled for injection into openers.
pub struct OpenerGates<R: Runtime> {
    /// The prime head-start gate.
    pub prime_chance: Arc<PrimeChanceGiver<R>>,
    /// The spare gap/cap gate.
    pub spare_allowance: Arc<SpareAllowanceGiver<R>>,
}

impl<R: Runtime> OpenerGates<R> {
    /// Construct the gates for one worker process.
    pub fn new(runtime: &R, config: Arc<OpenerConfig>) -> Arc<Self> {
        Arc::new(OpenerGates {
            prime_chance: PrimeChanceGiver::new(runtime, Arc::clone(&config)),
            spare_allowance: SpareAllowanceGiver::new(runtime, config),
        })
    }
}

/// Sleep until `until`, or forever when there is no deadline.
async fn maybe_sleep<R: SleepProvider>(runtime: &R, until: Option<Instant>) {
    match until {
        Some(deadline) => {
            let now = runtime.now();
            if deadline > now {
                runtime.sleep(deadline.saturating_duration_since(now)).await;
            }
        }
        None => futures::future::pending().await,
    }
}

/// Spawn the timer task for one gate.
///
/// The task sleeps toward whatever deadline the gate last published and
/// calls `wake` when it arrives; `wake` returning false stops the task.
fn spawn_timer<R: Runtime>(
    runtime: &R,
    updates: watch::Receiver<Option<Instant>>,
    wake: impl Fn() -> bool + Send + 'static,
) {
    use futures::task::SpawnExt as _;
    let rt = runtime.clone();
    let _ignore = runtime.spawn(async move {
        let mut next_wakeup: Option<Instant> = None;
        let mut updates = updates.fuse();
        loop {
            futures::select_biased! {
                changed = updates.next() => match changed {
                    Some(deadline) => next_wakeup = deadline,
                    None => break,
                },
                () = maybe_sleep(&rt, next_wakeup).fuse() => {
                    next_wakeup = None;
                    if !wake() {
                        break;
                    }
                }
            }
        }
    });
}

/// Shared plumbing for publishing a gate's earliest deadline.
struct DeadlineSlot {
    /// Sender half of the deadline watch.
    tx: Mutex<watch::Sender<Option<Instant>>>,
}

impl DeadlineSlot {
    /// Create a slot and the receiver its timer task will watch.
    fn new() -> (Self, watch::Receiver<Option<Instant>>) {
        let (tx, rx) = watch::channel();
        (DeadlineSlot { tx: Mutex::new(tx) }, rx)
    }

    /// Publish `deadline`, if it differs from the current one.
    fn set(&self, deadline: Option<Instant>) {
        let mut tx = self.tx.lock().expect("poisoned lock");
        // The read borrow must end before borrow_mut, or we deadlock.
        let current = *tx.borrow();
        if current != deadline {
            *tx.borrow_mut() = deadline;
        }
    }
}

/// One opener waiting its turn at the prime-chance gate.
struct PrimeWaiter {
    /// When this opener's prime attempt started.
    basis: Instant,
    /// How to wake the opener.
    wake: oneshot::Sender<()>,
}

/// Enforces the prime head start: an opener that wants to try a spare
/// must first give its prime attempt this long to succeed alone.
pub struct PrimeChanceGiver<R: Runtime> {
    /// Runtime, for the current time.
    runtime: R,
    /// Shared opener configuration.
    config: Arc<OpenerConfig>,
    /// Openers waiting for their prime's chance to expire, in FIFO order.
    waiters: Mutex<VecDeque<PrimeWaiter>>,
    /// Where we publish the earliest pending deadline.
    deadline: DeadlineSlot,
}

impl<R: Runtime> PrimeChanceGiver<R> {
    /// Construct the gate and launch its timer task.
    pub fn new(runtime: &R, config: Arc<OpenerConfig>) -> Arc<Self> {
        let (deadline, updates) = DeadlineSlot::new();
        let giver = Arc::new(PrimeChanceGiver {
            runtime: runtime.clone(),
            config,
            waiters: Mutex::new(VecDeque::new()),
            deadline,
        });
        let weak = Arc::downgrade(&giver);
        spawn_timer(runtime, updates, move || {
            Weak::upgrade(&weak).map(|g| g.checkpoint()).is_some()
        });
        giver
    }

    /// The moment at which a prime started at `basis` has had its chance.
    ///
    /// A basis in the future (clock oddities) is treated as "now".
    fn chance_end(&self, now: Instant, basis: Instant) -> Instant {
        basis.min(now) + self.config.scaled_head_start()
    }

    /// Return true if an opener whose prime started at `basis` need not
    /// wait at all.
    pub fn ready_now(&self, basis: Instant) -> bool {
        if self.config.scaled_head_start() == Duration::ZERO {
            return true;
        }
        let now = self.runtime.now();
        self.chance_end(now, basis) <= now
    }

    /// Join the FIFO; the returned receiver fires when the prime's chance
    /// is over.  Dropping the receiver leaves the queue.
    pub fn enqueue(&self, basis: Instant) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("poisoned lock");
            waiters.push_back(PrimeWaiter { basis, wake: tx });
        }
        self.checkpoint();
        rx
    }

    /// Wake every waiter whose deadline has arrived, then re-arm the
    /// timer for the earliest remaining one.
    fn checkpoint(&self) {
        let now = self.runtime.now();
        let next = {
            let mut waiters = self.waiters.lock().expect("poisoned lock");
            loop {
                match waiters.front() {
                    None => break None,
                    Some(front) if front.wake.is_canceled() => {
                        waiters.pop_front();
                    }
                    Some(front) => {
                        let end = self.chance_end(now, front.basis);
                        if end <= now {
                            if let Some(waiter) = waiters.pop_front() {
                                let _ = waiter.wake.send(());
                            }
                        } else {
                            break Some(end);
                        }
                    }
                }
            }
        };
        self.deadline.set(next);
    }
}

/// One opener waiting its turn at the spare-allowance gate.
struct SpareWaiter<R: Runtime> {
    /// How to hand the opener its allowance.
    wake: oneshot::Sender<SpareAllowance<R>>,
}

/// Counters behind the spare-allowance gate.
struct AllowanceState<R: Runtime> {
    /// Openers waiting for an allowance, in FIFO order.
    waiters: VecDeque<SpareWaiter<R>>,
    /// Allowances handed out and not yet returned.
    level: u32,
    /// When the most recent allowance was handed out.
    last_start: Option<Instant>,
}

/// Enforces the minimum gap between spare starts and the cap on
/// concurrent spares, across every opener of this worker.
pub struct SpareAllowanceGiver<R: Runtime> {
    /// Runtime, for the current time.
    runtime: R,
    /// Shared opener configuration.
    config: Arc<OpenerConfig>,
    /// Mutable gate state.
    state: Mutex<AllowanceState<R>>,
    /// Where we publish the earliest pending deadline.
    deadline: DeadlineSlot,
}

/// Permission to start one spare connection attempt.
///
/// Exactly one of two things happens to every allowance: it is consumed
/// by a finished spare attempt ([`mark_used`](Self::mark_used)), or it is
/// dropped, which returns it and resets the pacing gap (an allowance that
/// was granted but never led to a spare start should not delay others).
pub struct SpareAllowance<R: Runtime> {
    /// The gate to report back to; taken on use.
    giver: Option<Arc<SpareAllowanceGiver<R>>>,
}

impl<R: Runtime> SpareAllowance<R> {
    /// Consume this allowance: the spare attempt it licensed finished.
    pub fn mark_used(mut self) {
        if let Some(giver) = self.giver.take() {
            giver.note_used();
        }
    }
}

impl<R: Runtime> Drop for SpareAllowance<R> {
    fn drop(&mut self) {
        if let Some(giver) = self.giver.take() {
            giver.note_dropped();
        }
    }
}

impl<R: Runtime> SpareAllowanceGiver<R> {
    /// Construct the gate and launch its timer task.
    pub fn new(runtime: &R, config: Arc<OpenerConfig>) -> Arc<Self> {
        let (deadline, updates) = DeadlineSlot::new();
        let giver = Arc::new(SpareAllowanceGiver {
            runtime: runtime.clone(),
            config,
            state: Mutex::new(AllowanceState {
                waiters: VecDeque::new(),
                level: 0,
                last_start: None,
            }),
            deadline,
        });
        let weak = Arc::downgrade(&giver);
        spawn_timer(runtime, updates, move || {
            Weak::upgrade(&weak).map(|g| g.checkpoint()).is_some()
        });
        giver
    }

    /// The earliest moment the gap permits another spare start, if the
    /// gap is currently in force.
    fn gap_end(&self, now: Instant, last_start: Option<Instant>) -> Option<Instant> {
        let gap = self.config.scaled_gap();
        if gap == Duration::ZERO {
            return None;
        }
        let last = last_start?;
        let end = last.min(now) + gap;
        (end > now).then_some(end)
    }

    /// Return true if a new spare may start right now.
    pub fn ready_now(self: &Arc<Self>) -> bool {
        let now = self.runtime.now();
        let state = self.state.lock().expect("poisoned lock");
        !self.config.spare_limit_reached(state.level) && self.gap_end(now, state.last_start).is_none()
    }

    /// Consume an allowance immediately.
    ///
    /// Callers must have just observed [`ready_now`](Self::ready_now);
    /// this is the "no waiting needed" fast path.
    pub fn instant_allowance(self: &Arc<Self>) -> SpareAllowance<R> {
        let now = self.runtime.now();
        {
            let mut state = self.state.lock().expect("poisoned lock");
            state.level += 1;
            state.last_start = Some(now);
        }
        SpareAllowance {
            giver: Some(Arc::clone(self)),
        }
    }

    /// Join the FIFO; the returned receiver yields an allowance when the
    /// gap and cap permit.  Dropping the receiver leaves the queue.
    pub fn enqueue(self: &Arc<Self>) -> oneshot::Receiver<SpareAllowance<R>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().expect("poisoned lock");
            state.waiters.push_back(SpareWaiter { wake: tx });
        }
        self.checkpoint();
        rx
    }

    /// An allowance was consumed by a finished spare attempt.
    fn note_used(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            state.level = state.level.saturating_sub(1);
        }
        self.checkpoint();
    }

    /// An allowance was returned unused.
    ///
    /// The gap origin is cleared: the dropped allowance was the most
    /// recent start, and since it was allowed then, the gap is already
    /// satisfied for whoever comes next.
    fn note_dropped(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            state.level = state.level.saturating_sub(1);
            state.last_start = None;
        }
        self.checkpoint();
    }

    /// Grant allowances to ready front waiters, then re-arm the timer.
    fn checkpoint(self: &Arc<Self>) {
        /// What one pass over the queue decided.
        enum Act<R: Runtime> {
            /// Hand this waiter an allowance.
            Grant(oneshot::Sender<SpareAllowance<R>>),
            /// Nothing (more) to do now; maybe arm the timer.
            Done(Option<Instant>),
        }

        loop {
            let now = self.runtime.now();
            let act = {
                let mut state = self.state.lock().expect("poisoned lock");
                loop {
                    match state.waiters.front() {
                        None => break Act::Done(None),
                        Some(front) if front.wake.is_canceled() => {
                            state.waiters.pop_front();
                        }
                        Some(_) => {
                            if self.config.spare_limit_reached(state.level) {
                                // No timer: a used/dropped return re-runs us.
                                break Act::Done(None);
                            }
                            if let Some(end) = self.gap_end(now, state.last_start) {
                                break Act::Done(Some(end));
                            }
                            match state.waiters.pop_front() {
                                Some(waiter) => {
                                    state.level += 1;
                                    state.last_start = Some(now);
                                    break Act::Grant(waiter.wake);
                                }
                                None => break Act::Done(None),
                            }
                        }
                    }
                }
            };
            match act {
                Act::Grant(wake) => {
                    let allowance = SpareAllowance {
                        giver: Some(Arc::clone(self)),
                    };
                    // A failed send drops the allowance, which returns it
                    // through note_dropped.
                    let _ = wake.send(allowance);
                }
                Act::Done(deadline) => {
                    self.deadline.set(deadline);
                    return;
                }
            }
        }
    }
}
