// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread-local slots owning the current thread's shadow stack.
//!
//! Each thread gets its stack lazily on first push and gives it back
//! deterministically on thread exit: the slot's destructor marks the stack
//! cell dead and tells the registry, which is what lets the registry sweep
//! lazily instead of taking a lock on every thread death.

use crate::registry::ThreadRegistry;
use crate::stack::ShadowStack;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to one thread's shadow stack.
///
/// The inner stack is exclusively owned by the thread named in
/// `owner_os_id`; everyone else may only touch it through
/// [`StackCell::harvest_mut`] while the exception gate has frozen the owner.
pub struct StackCell {
    inner: UnsafeCell<ShadowStack>,
    owner_os_id: u64,
    alive: AtomicBool,
}

// SAFETY: access to `inner` is governed by the ownership protocol above;
// the cell itself is just a tagged box.
unsafe impl Send for StackCell {}
unsafe impl Sync for StackCell {}

impl StackCell {
    pub fn new(owner_os_id: u64) -> Self {
        Self {
            inner: UnsafeCell::new(ShadowStack::new()),
            owner_os_id,
            alive: AtomicBool::new(true),
        }
    }

    pub fn owner_os_id(&self) -> u64 {
        self.owner_os_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Mutable access for the owning thread.
    ///
    /// # Safety
    /// The caller must be running on the thread whose id is
    /// `owner_os_id()`; that thread is the only mutator outside a crash
    /// harvest.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn owner_mut(&self) -> &mut ShadowStack {
        unsafe { &mut *self.inner.get() }
    }

    /// Mutable access for the crash harvester.
    ///
    /// # Safety
    /// The exception gate must be engaged and the owning thread must be
    /// either blocked on it or dead; only then is the owner guaranteed not
    /// to mutate concurrently.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn harvest_mut(&self) -> &mut ShadowStack {
        unsafe { &mut *self.inner.get() }
    }
}

impl std::fmt::Debug for StackCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCell")
            .field("owner_os_id", &self.owner_os_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct ThreadSlot {
    context_id: u64,
    os_id: u64,
    cell: Arc<StackCell>,
    registry: Weak<ThreadRegistry>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.cell.mark_dead();
        if let Some(registry) = self.registry.upgrade() {
            registry.on_thread_exit(self.os_id);
        }
    }
}

thread_local! {
    // One slot per context; in practice a process has one context and the
    // vector has one element. Tests construct several contexts per thread.
    static SLOTS: RefCell<Vec<ThreadSlot>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` against the calling thread's shadow stack for this context,
/// creating and registering the stack on first use.
///
/// Silently becomes a no-op when the thread-local slot is unusable (thread
/// teardown, re-entrant call): push/pop must be unconditionally safe to
/// call from anywhere.
pub fn with_thread_stack<R>(
    context_id: u64,
    registry: &Arc<ThreadRegistry>,
    f: impl FnOnce(&mut ShadowStack) -> R,
) -> Option<R> {
    SLOTS
        .try_with(|slots| {
            let mut slots = match slots.try_borrow_mut() {
                Ok(slots) => slots,
                Err(_) => return None,
            };
            let index = match slots.iter().position(|slot| slot.context_id == context_id) {
                Some(index) => index,
                None => {
                    let os_id = shadowtrace_common::threading::get_current_thread_id();
                    let cell = Arc::new(StackCell::new(os_id));
                    if let Err(error) = registry.register(os_id, Arc::clone(&cell)) {
                        // The stack still works unregistered; its frames
                        // just cannot be harvested into a crash report.
                        tracing::warn!(%os_id, %error, "thread registry rejected this thread");
                    }
                    slots.push(ThreadSlot {
                        context_id,
                        os_id,
                        cell,
                        registry: Arc::downgrade(registry),
                    });
                    slots.len() - 1
                }
            };
            // SAFETY: the slot was created by this thread and never leaves
            // it; we are the owner.
            let stack = unsafe { slots[index].cell.owner_mut() };
            Some(f(stack))
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::FrameArg;

    #[test]
    fn first_use_registers_the_thread() {
        let registry = Arc::new(ThreadRegistry::new());
        let os_id = shadowtrace_common::threading::get_current_thread_id();
        assert_eq!(registry.lookup(os_id), None);

        with_thread_stack(9001, &registry, |stack| {
            stack.push("Init", &[FrameArg::Uint(1)]);
        });
        assert!(registry.lookup(os_id).is_some());
    }

    #[test]
    fn thread_exit_marks_cell_dead() {
        let registry = Arc::new(ThreadRegistry::new());
        let registry_for_thread = Arc::clone(&registry);
        std::thread::spawn(move || {
            with_thread_stack(9002, &registry_for_thread, |stack| {
                stack.push("ShortLived", &[]);
            });
        })
        .join()
        .expect("thread join");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].cell.is_alive());
    }

    #[test]
    fn distinct_contexts_get_distinct_stacks() {
        let registry_a = Arc::new(ThreadRegistry::new());
        let registry_b = Arc::new(ThreadRegistry::new());
        with_thread_stack(9003, &registry_a, |stack| stack.push("InA", &[]));
        with_thread_stack(9004, &registry_b, |stack| stack.push("InB", &[]));

        let frames_a =
            with_thread_stack(9003, &registry_a, |stack| stack.frame_count()).unwrap();
        let frames_b =
            with_thread_stack(9004, &registry_b, |stack| stack.frame_count()).unwrap();
        assert_eq!(frames_a, 1);
        assert_eq!(frames_b, 1);
    }
}
