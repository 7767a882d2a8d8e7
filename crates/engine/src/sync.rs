//! Waitable primitives for the monitor threads.
//!
//! Shutdown is cooperative: every blocking wait in the engine either sleeps
//! on a [`QuitEvent`] directly or waits on a primitive that has been
//! [subscribed](QuitEvent::subscribe) to one, so a quit transition wakes it
//! within one notification. When a wait could be satisfied by both the quit
//! event and its own primitive, quit wins.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a quit-aware wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The quit event fired. Takes priority over everything else.
    Quit,
    /// The waited event was set, or a semaphore permit was acquired.
    Signaled,
    /// The wait is pointless: the dump limit has been reached.
    Abandoned,
    TimedOut,
}

/// Anything a [`QuitEvent`] can nudge so its waiters re-check the quit flag.
pub trait Wakeable: Send + Sync {
    fn wake(&self);
}

/// A manual-reset event: once set it stays set, releasing every waiter,
/// until explicitly reset.
#[derive(Default)]
pub struct ManualResetEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
    }

    /// Block until the event is set or the timeout elapses. Returns whether
    /// the event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        true
    }

    /// Wait for the event, observing `quit` with priority.
    pub fn wait_quit_aware(&self, quit: &QuitEvent, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            if quit.is_set() {
                return WaitOutcome::Quit;
            }
            if *state {
                return WaitOutcome::Signaled;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if quit.is_set() {
                            return WaitOutcome::Quit;
                        }
                        return if *state {
                            WaitOutcome::Signaled
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

impl Wakeable for ManualResetEvent {
    fn wake(&self) {
        // Take the lock so a waiter between its predicate check and its
        // cond wait cannot miss the notification.
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

/// A counted semaphore.
pub struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }

    /// Acquire a permit, observing `quit` with priority.
    pub fn acquire_quit_aware(&self, quit: &QuitEvent, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut permits = self.permits.lock();
        loop {
            if quit.is_set() {
                return WaitOutcome::Quit;
            }
            if *permits > 0 {
                *permits -= 1;
                return WaitOutcome::Signaled;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut permits, deadline).timed_out() {
                        if quit.is_set() {
                            return WaitOutcome::Quit;
                        }
                        if *permits > 0 {
                            *permits -= 1;
                            return WaitOutcome::Signaled;
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut permits),
            }
        }
    }
}

impl Wakeable for Semaphore {
    fn wake(&self) {
        let _permits = self.permits.lock();
        self.cond.notify_all();
    }
}

/// The cooperative-shutdown event. Unlike a plain [`ManualResetEvent`] it is
/// one-way (never reset) and fans its transition out to subscribed
/// primitives so their quit-aware waits wake immediately.
#[derive(Default)]
pub struct QuitEvent {
    fired: AtomicBool,
    event: ManualResetEvent,
    wakers: Mutex<Vec<Arc<dyn Wakeable>>>,
}

impl QuitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; repeated sets are no-ops.
    pub fn set(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.event.set();
        for waker in self.wakers.lock().iter() {
            waker.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn wait(&self) {
        self.event.wait();
    }

    /// Returns whether quit fired before the timeout. The idiomatic
    /// "sleep one polling interval, but wake instantly on shutdown".
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.event.wait_timeout(timeout)
    }

    /// Register a primitive whose quit-aware waits must wake when this
    /// event fires. A primitive waited on with `*_quit_aware` against this
    /// event must be subscribed here, otherwise a mid-wait quit is only
    /// noticed at the next notification.
    pub fn subscribe(&self, waker: Arc<dyn Wakeable>) {
        if self.is_set() {
            waker.wake();
        }
        self.wakers.lock().push(waker);
    }
}

impl Wakeable for QuitEvent {
    /// Chaining: subscribing a child quit event to a parent propagates the
    /// parent's transition to the whole target.
    fn wake(&self) {
        self.set();
    }
}
