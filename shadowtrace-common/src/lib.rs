// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::{Mutex, MutexGuard};

pub mod install_uid;
pub mod paths;
pub mod sem;
pub mod shm;
pub mod threading;
pub mod timeout;
pub mod unix;

/// Extension trait for `Mutex` that acquires a lock, panicking if the lock is
/// poisoned.
///
/// A poisoned mutex in this crate means a thread panicked while holding a
/// diagnostics lock; continuing with the partial state would corrupt reports,
/// so panicking is the correct escalation.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_or_panic_round_trips() {
        let data = Arc::new(Mutex::new(41));
        {
            let mut guard = data.lock_or_panic();
            *guard += 1;
        }
        assert_eq!(*data.lock_or_panic(), 42);
    }
}
