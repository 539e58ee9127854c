// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread registry and remap cache.
//!
//! OS thread ids are volatile and reused; everything user-facing (reports,
//! trace frames) wants a stable small integer instead. The registry hands
//! those out monotonically and keeps the handle needed to reach each
//! thread's shadow stack during a crash harvest.

use crate::shared::constants::{ST_MAX_REGISTRY_THREADS, ST_REMAP_CACHE_SLOTS};
use crate::stack::tls::StackCell;
use shadowtrace_common::MutexExt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Thread registry is full and every entry is still alive")]
    Full,
}

/// Direct-mapped cache over the sorted table, keyed by the low bits of the
/// OS thread id. Lives under the registry mutex; a hit makes the critical
/// section two loads and a compare.
struct RemapCache {
    slots: [Option<(u64, u32)>; ST_REMAP_CACHE_SLOTS],
}

impl RemapCache {
    fn new() -> Self {
        Self {
            slots: [None; ST_REMAP_CACHE_SLOTS],
        }
    }

    #[inline]
    fn index(os_id: u64) -> usize {
        os_id as usize & (ST_REMAP_CACHE_SLOTS - 1)
    }

    fn get(&self, os_id: u64) -> Option<u32> {
        match self.slots[Self::index(os_id)] {
            Some((cached_os_id, small_id)) if cached_os_id == os_id => Some(small_id),
            _ => None,
        }
    }

    fn put(&mut self, os_id: u64, small_id: u32) {
        self.slots[Self::index(os_id)] = Some((os_id, small_id));
    }

    fn invalidate(&mut self, os_id: u64) {
        let slot = &mut self.slots[Self::index(os_id)];
        if matches!(slot, Some((cached_os_id, _)) if *cached_os_id == os_id) {
            *slot = None;
        }
    }
}

struct RegistryEntry {
    os_id: u64,
    small_id: u32,
    cell: Arc<StackCell>,
}

struct RegistryInner {
    // Sorted by os_id for the cache-miss binary search.
    entries: Vec<RegistryEntry>,
    cache: RemapCache,
    next_small_id: u32,
}

/// A thread visible to the crash harvester.
pub struct RegisteredThread {
    pub small_id: u32,
    pub os_id: u64,
    pub cell: Arc<StackCell>,
}

pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: Vec::with_capacity(ST_MAX_REGISTRY_THREADS),
                cache: RemapCache::new(),
                next_small_id: 1,
            }),
        }
    }

    /// Registers a thread's stack cell and assigns the next small id.
    ///
    /// Entries for dead threads are reclaimed lazily: only when the table
    /// is full does a sweep evict them. An entry left behind by a previous
    /// owner of the same (reused) OS id is always replaced.
    pub fn register(&self, os_id: u64, cell: Arc<StackCell>) -> Result<u32, RegistryError> {
        let mut inner = self.inner.lock_or_panic();

        if let Ok(index) = inner.entries.binary_search_by_key(&os_id, |e| e.os_id) {
            inner.entries.remove(index);
            inner.cache.invalidate(os_id);
        }

        if inner.entries.len() >= ST_MAX_REGISTRY_THREADS {
            inner.entries.retain(|entry| entry.cell.is_alive());
            inner.cache = RemapCache::new();
            if inner.entries.len() >= ST_MAX_REGISTRY_THREADS {
                return Err(RegistryError::Full);
            }
        }

        let small_id = inner.next_small_id;
        inner.next_small_id += 1;
        // The equal entry, if any, was removed above, so this is always Err.
        let insert_at = inner
            .entries
            .binary_search_by_key(&os_id, |e| e.os_id)
            .unwrap_or_else(|position| position);
        inner.entries.insert(
            insert_at,
            RegistryEntry {
                os_id,
                small_id,
                cell,
            },
        );
        inner.cache.put(os_id, small_id);
        Ok(small_id)
    }

    /// Maps a volatile OS thread id to its stable small id. Cache first,
    /// then binary search with cache refill.
    pub fn lookup(&self, os_id: u64) -> Option<u32> {
        let mut inner = self.inner.lock_or_panic();
        if let Some(small_id) = inner.cache.get(os_id) {
            return Some(small_id);
        }
        let index = inner
            .entries
            .binary_search_by_key(&os_id, |e| e.os_id)
            .ok()?;
        let small_id = inner.entries[index].small_id;
        inner.cache.put(os_id, small_id);
        Some(small_id)
    }

    /// Called from the thread-local slot destructor. The entry itself stays
    /// for the lazy sweep; only the cache mapping goes, because the OS may
    /// hand the id to a new thread immediately.
    pub fn on_thread_exit(&self, os_id: u64) {
        let mut inner = self.inner.lock_or_panic();
        inner.cache.invalidate(os_id);
    }

    /// Clones the table for a crash harvest, in small-id order so reports
    /// list threads in registration order.
    pub fn snapshot(&self) -> Vec<RegisteredThread> {
        let inner = self.inner.lock_or_panic();
        let mut threads: Vec<RegisteredThread> = inner
            .entries
            .iter()
            .map(|entry| RegisteredThread {
                small_id: entry.small_id,
                os_id: entry.os_id,
                cell: Arc::clone(&entry.cell),
            })
            .collect();
        threads.sort_by_key(|thread| thread.small_id);
        threads
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_panic().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_cell(os_id: u64) -> Arc<StackCell> {
        Arc::new(StackCell::new(os_id))
    }

    fn dead_cell(os_id: u64) -> Arc<StackCell> {
        let cell = live_cell(os_id);
        cell.mark_dead();
        cell
    }

    #[test]
    fn small_ids_increase_monotonically() {
        let registry = ThreadRegistry::new();
        let first = registry.register(100, live_cell(100)).expect("register");
        let second = registry.register(50, live_cell(50)).expect("register");
        let third = registry.register(75, live_cell(75)).expect("register");
        assert!(first < second && second < third);
    }

    #[test]
    fn repeat_lookup_is_coherent() {
        let registry = ThreadRegistry::new();
        let small_id = registry.register(42, live_cell(42)).expect("register");
        // First call misses the cache and fills it; the second must return
        // the same mapping from the cache slot.
        assert_eq!(registry.lookup(42), Some(small_id));
        assert_eq!(registry.lookup(42), Some(small_id));
        assert_eq!(registry.lookup(43), None);
    }

    #[test]
    fn cache_collision_still_resolves_correctly() {
        let registry = ThreadRegistry::new();
        // Same low bits, different ids: they fight over one cache slot.
        let os_a = 7;
        let os_b = 7 + ST_REMAP_CACHE_SLOTS as u64;
        let id_a = registry.register(os_a, live_cell(os_a)).expect("register");
        let id_b = registry.register(os_b, live_cell(os_b)).expect("register");
        assert_eq!(registry.lookup(os_a), Some(id_a));
        assert_eq!(registry.lookup(os_b), Some(id_b));
        assert_eq!(registry.lookup(os_a), Some(id_a));
    }

    #[test]
    fn dead_entries_are_swept_only_when_full() {
        let registry = ThreadRegistry::new();
        for os_id in 0..ST_MAX_REGISTRY_THREADS as u64 {
            registry
                .register(os_id + 1, dead_cell(os_id + 1))
                .expect("register");
        }
        assert_eq!(registry.len(), ST_MAX_REGISTRY_THREADS);

        // Table is full of dead entries; the next register sweeps them all.
        registry.register(10_000, live_cell(10_000)).expect("register");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn full_table_of_live_threads_rejects_registration() {
        let registry = ThreadRegistry::new();
        for os_id in 0..ST_MAX_REGISTRY_THREADS as u64 {
            registry
                .register(os_id + 1, live_cell(os_id + 1))
                .expect("register");
        }
        assert_eq!(
            registry.register(10_000, live_cell(10_000)).unwrap_err(),
            RegistryError::Full
        );
    }

    #[test]
    fn reused_os_id_replaces_the_dead_entry() {
        let registry = ThreadRegistry::new();
        let old_id = registry.register(42, dead_cell(42)).expect("register");
        let new_id = registry.register(42, live_cell(42)).expect("register");
        assert_ne!(old_id, new_id);
        assert_eq!(registry.lookup(42), Some(new_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_lists_threads_in_registration_order() {
        let registry = ThreadRegistry::new();
        registry.register(300, live_cell(300)).expect("register");
        registry.register(100, live_cell(100)).expect("register");
        registry.register(200, live_cell(200)).expect("register");
        let snapshot = registry.snapshot();
        let os_ids: Vec<u64> = snapshot.iter().map(|t| t.os_id).collect();
        assert_eq!(os_ids, vec![300, 100, 200]);
    }
}
