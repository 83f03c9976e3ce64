#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Reentrant mutual-exclusion lock with an explicit per-thread hold count.
///
/// The lock protects no data by itself; it serializes the cache manager's
/// critical sections. A thread already holding it may acquire it again, and
/// [`ReentrantLock::suspend`] releases every hold of the calling thread at once
/// so a sleeping caller never keeps other threads out.
pub struct ReentrantLock {
    state: Mutex<Owner>,
    released: Condvar,
}

#[derive(Default, Debug)]
struct Owner {
    thread: Option<ThreadId>,
    holds: usize,
}

/// Snapshot of lock ownership for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Whether any thread holds the lock.
    pub held: bool,
    /// Hold count of the owning thread.
    pub holds: usize,
    /// Whether the calling thread is the owner.
    pub held_by_current: bool,
}

/// One hold on a [`ReentrantLock`], released on drop.
#[must_use = "dropping the guard releases the hold immediately"]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

/// Every hold the current thread had when it called [`ReentrantLock::suspend`].
///
/// Dropping the token (or calling [`Suspension::resume`]) blocks until the
/// lock is free again and restores the same hold count.
#[must_use = "dropping the suspension reacquires the lock immediately"]
pub struct Suspension<'a> {
    lock: &'a ReentrantLock,
    holds: usize,
    _not_send: PhantomData<*const ()>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Owner::default()),
            released: Condvar::new(),
        }
    }

    /// Acquires one hold, blocking while another thread owns the lock.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.acquire(1, None);
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires one hold if the lock is free or already owned by this thread.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        self.try_lock_for(Duration::ZERO)
    }

    /// Like [`ReentrantLock::lock`] but gives up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ReentrantGuard<'_>> {
        if self.acquire(1, Some(Instant::now() + timeout)) {
            Some(ReentrantGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Number of holds the calling thread currently has.
    pub fn hold_count(&self) -> usize {
        let me = thread::current().id();
        let state = self.state.lock();
        if state.thread == Some(me) {
            state.holds
        } else {
            0
        }
    }

    /// Returns true if the calling thread owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.hold_count() > 0
    }

    /// Returns a snapshot of the current ownership.
    pub fn snapshot(&self) -> LockSnapshot {
        let me = thread::current().id();
        let state = self.state.lock();
        LockSnapshot {
            held: state.thread.is_some(),
            holds: state.holds,
            held_by_current: state.thread == Some(me),
        }
    }

    /// Fully releases the calling thread's holds until the token is dropped.
    ///
    /// A thread holding nothing gets an empty token whose drop is a no-op.
    pub fn suspend(&self) -> Suspension<'_> {
        let me = thread::current().id();
        let holds = {
            let mut state = self.state.lock();
            if state.thread == Some(me) {
                let holds = state.holds;
                state.thread = None;
                state.holds = 0;
                holds
            } else {
                0
            }
        };
        if holds > 0 {
            self.released.notify_one();
        }
        Suspension {
            lock: self,
            holds,
            _not_send: PhantomData,
        }
    }

    fn acquire(&self, holds: usize, deadline: Option<Instant>) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.thread {
                None => {
                    state.thread = Some(me);
                    state.holds = holds;
                    return true;
                }
                Some(owner) if owner == me => {
                    state.holds += holds;
                    return true;
                }
                Some(_) => match deadline {
                    None => self.released.wait(&mut state),
                    Some(deadline) => {
                        if self.released.wait_until(&mut state, deadline).timed_out()
                            && state.thread.is_some()
                            && state.thread != Some(me)
                        {
                            return false;
                        }
                    }
                },
            }
        }
    }

    fn release_one(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.thread, Some(me), "lock released by non-owner");
        if state.thread != Some(me) {
            return;
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.thread = None;
            drop(state);
            self.released.notify_one();
        }
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}

impl Suspension<'_> {
    /// Number of holds that will be restored.
    pub fn holds(&self) -> usize {
        self.holds
    }

    /// Reacquires the suspended holds now.
    pub fn resume(self) {
        drop(self);
    }
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        if self.holds > 0 {
            self.lock.acquire(self.holds, None);
        }
    }
}
