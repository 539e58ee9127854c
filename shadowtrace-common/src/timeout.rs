// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Deadline bookkeeping shared by every bounded wait in the pipeline.
///
/// A single `TimeoutManager` is created at the start of an operation
/// (handshake, dump request, crash harvest) and threaded through its
/// individual waits, so the stages share one budget instead of each taking
/// the full timeout.
pub struct TimeoutManager {
    deadline: Instant,
    start: Instant,
    budget: Duration,
}

impl TimeoutManager {
    /// Never hand a wait less than a few scheduler slices, even when the
    /// budget is spent; a zero-length wait turns poll loops into spins.
    const MINIMUM_SLICE: Duration = Duration::from_millis(160);

    pub fn new(budget: Duration) -> Self {
        let start = Instant::now();
        Self {
            deadline: start + budget,
            start,
            budget,
        }
    }

    /// Remaining budget, clamped below by [`Self::MINIMUM_SLICE`].
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(Instant::now())
            .max(Self::MINIMUM_SLICE)
    }

    /// True once the full budget has elapsed. `remaining()` still returns the
    /// minimum slice afterwards; callers decide whether to keep reaping.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("budget", &self.budget)
            .field("elapsed", &self.elapsed())
            .field("remaining", &self.remaining())
            .field("expired", &self.expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_has_full_budget() {
        let manager = TimeoutManager::new(Duration::from_secs(5));
        assert_eq!(manager.budget(), Duration::from_secs(5));
        assert!(!manager.expired());
        assert!(manager.remaining() > Duration::from_secs(4));
    }

    #[test]
    fn remaining_never_drops_below_minimum_slice() {
        let manager = TimeoutManager::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.expired());
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_SLICE);
    }

    #[test]
    fn elapsed_advances() {
        let manager = TimeoutManager::new(Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.elapsed() >= Duration::from_millis(10));
        assert!(!manager.expired());
    }

    #[test]
    fn debug_shows_budget_fields() {
        let manager = TimeoutManager::new(Duration::from_secs(1));
        let debug_str = format!("{manager:?}");
        assert!(debug_str.contains("budget"));
        assert!(debug_str.contains("remaining"));
    }
}
