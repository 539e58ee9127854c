// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Process-wide single-flight gate engaged by the exception coordinator.
///
/// While engaged, shadow-stack mutation on every thread except the
/// designated reporter blocks, which freezes the diagnostic state the crash
/// harvest is about to read. The engaged flag is read without the lock on
/// the hot path; the race with a mid-push engage is benign (at worst one
/// frame mutates slightly after the ideal freeze point). The engage
/// transition itself is a compare-and-swap so concurrent faults on
/// different threads cannot both enter the coordinator.
pub struct ExceptionGate {
    engaged: AtomicBool,
    // OS thread id allowed through while engaged; 0 = none.
    exempt_thread: AtomicU64,
    lock: Mutex<()>,
    released: Condvar,
}

impl ExceptionGate {
    /// Re-check interval for blocked threads. The condvar is notified on
    /// disengage; the timeout only guards against a lost wakeup.
    const RECHECK: Duration = Duration::from_millis(50);

    pub fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
            exempt_thread: AtomicU64::new(0),
            lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    /// Attempts to engage the gate. Exactly one caller per process lifetime
    /// wins; the exempt thread may keep mutating its shadow stack.
    pub fn try_engage(&self, exempt_thread: u64) -> bool {
        if self
            .engaged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.exempt_thread.store(exempt_thread, Ordering::Release);
        true
    }

    /// Moves the exemption, e.g. from the faulting thread to the dedicated
    /// reporter once it takes over harvesting.
    pub fn set_exempt_thread(&self, exempt_thread: u64) {
        self.exempt_thread.store(exempt_thread, Ordering::Release);
    }

    #[inline]
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Blocks the calling thread while the gate is engaged, unless it is
    /// the exempt thread. Not cancellable by the blocked thread; in a real
    /// crash the process terminates before disengage, in tests the gate is
    /// explicitly released.
    pub fn block_while_engaged(&self, os_thread_id: u64) {
        // Hot path: one relaxed-ish load, no lock.
        if !self.is_engaged() {
            return;
        }
        if self.exempt_thread.load(Ordering::Acquire) == os_thread_id {
            return;
        }
        let mut guard = match self.lock.lock() {
            Ok(guard) => guard,
            // A poisoned gate lock means a crashed harvester; do not block.
            Err(poisoned) => poisoned.into_inner(),
        };
        while self.is_engaged() && self.exempt_thread.load(Ordering::Acquire) != os_thread_id {
            guard = match self.released.wait_timeout(guard, Self::RECHECK) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Releases the gate and wakes blocked threads. The crash path never
    /// calls this (it terminates instead); tests and the debugger escape
    /// hatch do.
    pub fn disengage(&self) {
        self.engaged.store(false, Ordering::Release);
        self.exempt_thread.store(0, Ordering::Release);
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.released.notify_all();
    }
}

impl Default for ExceptionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExceptionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionGate")
            .field("engaged", &self.is_engaged())
            .field("exempt_thread", &self.exempt_thread.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn engage_is_single_flight() {
        let gate = ExceptionGate::new();
        assert!(gate.try_engage(1));
        assert!(!gate.try_engage(2));
        assert!(gate.is_engaged());
        gate.disengage();
        assert!(!gate.is_engaged());
    }

    #[test]
    fn exempt_thread_passes_through() {
        let gate = ExceptionGate::new();
        assert!(gate.try_engage(7));
        // Must return immediately rather than deadlocking the test.
        gate.block_while_engaged(7);
        gate.set_exempt_thread(9);
        gate.block_while_engaged(9);
        gate.disengage();
    }

    #[test]
    fn disengaged_gate_never_blocks() {
        let gate = ExceptionGate::new();
        gate.block_while_engaged(1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn blocked_thread_resumes_on_disengage() {
        let gate = Arc::new(ExceptionGate::new());
        let passed = Arc::new(AtomicBool::new(false));
        assert!(gate.try_engage(1));

        let worker = {
            let gate = Arc::clone(&gate);
            let passed = Arc::clone(&passed);
            std::thread::spawn(move || {
                gate.block_while_engaged(2);
                passed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!passed.load(Ordering::SeqCst), "worker must be frozen");
        gate.disengage();
        worker.join().expect("worker join");
        assert!(passed.load(Ordering::SeqCst));
    }
}
