//! Safepoint rendezvous between mutators and the collector
//!
//! Mutators hold a shared "mutator" share while they run managed code and
//! release it at safepoints. The collector suspends them by requesting a
//! safepoint and waiting until no share is held. Everything a mutator
//! wrote before releasing its share (card marks included) is visible to
//! the collector once `safepoint_begin` returns.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static NEXT_RENDEZVOUS_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Rendezvous ids whose mutator share this thread holds
    static HELD_SHARES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct RendezvousState {
    running_mutators: usize,
    suspend_requested: bool,
}

/// Mutator/collector handshake
pub struct Rendezvous {
    id: usize,
    state: Mutex<RendezvousState>,
    condvar: Condvar,
    suspend_flag: AtomicBool,
}

impl Rendezvous {
    /// Create a rendezvous with no mutators
    pub fn new() -> Self {
        Self {
            id: NEXT_RENDEZVOUS_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(RendezvousState {
                running_mutators: 0,
                suspend_requested: false,
            }),
            condvar: Condvar::new(),
            suspend_flag: AtomicBool::new(false),
        }
    }

    /// Acquire the mutator share, waiting out any safepoint in progress
    pub fn mutator_enter(&self) {
        let mut state = self.state.lock();
        while state.suspend_requested {
            self.condvar.wait(&mut state);
        }
        state.running_mutators += 1;
        drop(state);
        HELD_SHARES.with(|held| held.borrow_mut().push(self.id));
    }

    /// Release the mutator share
    pub fn mutator_leave(&self) {
        HELD_SHARES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&id| id == self.id) {
                held.remove(pos);
            }
        });
        let mut state = self.state.lock();
        state.running_mutators = state
            .running_mutators
            .checked_sub(1)
            .unwrap_or_else(|| crate::fatal!("mutator_leave without mutator_enter"));
        if state.running_mutators == 0 {
            self.condvar.notify_all();
        }
    }

    /// Check if the calling thread holds the mutator share
    pub fn holds_mutator_share(&self) -> bool {
        HELD_SHARES.with(|held| held.borrow().contains(&self.id))
    }

    /// Check if a safepoint has been requested
    #[inline]
    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_flag.load(Ordering::Acquire)
    }

    /// Safepoint poll: park while the collector holds the world stopped
    #[inline]
    pub fn safepoint_poll(&self) {
        if self.is_suspend_requested() && self.holds_mutator_share() {
            self.mutator_leave();
            self.mutator_enter();
        }
    }

    /// Stop the world: wait until every mutator has released its share
    pub fn safepoint_begin(&self) {
        if self.holds_mutator_share() {
            crate::fatal!("safepoint_begin called while holding the mutator share");
        }
        let mut state = self.state.lock();
        while state.suspend_requested {
            self.condvar.wait(&mut state);
        }
        state.suspend_requested = true;
        self.suspend_flag.store(true, Ordering::Release);
        while state.running_mutators > 0 {
            self.condvar.wait(&mut state);
        }
    }

    /// Resume mutators
    pub fn safepoint_end(&self) {
        let mut state = self.state.lock();
        state.suspend_requested = false;
        self.suspend_flag.store(false, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Hold the mutator share for the lifetime of the returned guard
    pub fn enter_managed(&self) -> ManagedScope<'_> {
        self.mutator_enter();
        ManagedScope { rendezvous: self }
    }

    /// Release the mutator share for the lifetime of the returned guard
    /// (the caller must hold it)
    pub fn release_managed(&self) -> NativeScope<'_> {
        self.mutator_leave();
        NativeScope { rendezvous: self }
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard holding the mutator share
pub struct ManagedScope<'a> {
    rendezvous: &'a Rendezvous,
}

impl Drop for ManagedScope<'_> {
    fn drop(&mut self) {
        self.rendezvous.mutator_leave();
    }
}

/// Guard that gave the mutator share up temporarily
pub struct NativeScope<'a> {
    rendezvous: &'a Rendezvous,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.rendezvous.mutator_enter();
    }
}

/// Runs the world while a concurrent phase is in progress
pub struct ConcurrentScope<'a> {
    rendezvous: &'a Rendezvous,
    active: bool,
}

impl<'a> ConcurrentScope<'a> {
    /// Resume mutators if `enabled`; they are suspended again on drop
    pub fn new(rendezvous: &'a Rendezvous, enabled: bool) -> Self {
        if enabled {
            rendezvous.safepoint_end();
        }
        Self {
            rendezvous,
            active: enabled,
        }
    }
}

impl Drop for ConcurrentScope<'_> {
    fn drop(&mut self) {
        if self.active {
            self.rendezvous.safepoint_begin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn test_share_tracking() {
        let rv = Rendezvous::new();
        assert!(!rv.holds_mutator_share());
        {
            let _scope = rv.enter_managed();
            assert!(rv.holds_mutator_share());
            {
                let _native = rv.release_managed();
                assert!(!rv.holds_mutator_share());
            }
            assert!(rv.holds_mutator_share());
        }
        assert!(!rv.holds_mutator_share());
    }

    #[test]
    fn test_safepoint_waits_for_mutators() {
        let rv = Arc::new(Rendezvous::new());
        let progress = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let mutator = {
            let (rv, progress, stop) = (rv.clone(), progress.clone(), stop.clone());
            std::thread::spawn(move || {
                let _scope = rv.enter_managed();
                while !stop.load(Ordering::Acquire) {
                    progress.fetch_add(1, Ordering::AcqRel);
                    rv.safepoint_poll();
                }
            })
        };

        while progress.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        rv.safepoint_begin();
        let frozen = progress.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::Acquire), frozen);
        rv.safepoint_end();

        stop.store(true, Ordering::Release);
        mutator.join().unwrap();
        assert!(progress.load(Ordering::Acquire) >= frozen);
    }

    #[test]
    fn test_concurrent_scope_resumes_world() {
        let rv = Rendezvous::new();
        rv.safepoint_begin();
        assert!(rv.is_suspend_requested());
        {
            let _scope = ConcurrentScope::new(&rv, true);
            assert!(!rv.is_suspend_requested());
        }
        assert!(rv.is_suspend_requested());
        rv.safepoint_end();
    }
}
