// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Returns the kernel identifier for the current OS thread.
///
/// This is the volatile id the registry remaps to stable small integers; it
/// is only unique among live threads and may be reused after thread exit.
#[cfg(target_os = "linux")]
pub fn get_current_thread_id() -> u64 {
    // SAFETY: syscall(SYS_gettid) has no preconditions for the current thread.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Returns the kernel identifier for the current OS thread.
#[cfg(target_os = "macos")]
pub fn get_current_thread_id() -> u64 {
    let mut tid: u64 = 0;
    // SAFETY: `pthread_threadid_np` has no preconditions for the current
    // thread when pthread_t is 0 and the output pointer is valid.
    let rc = unsafe { libc::pthread_threadid_np(0, &mut tid) };
    debug_assert_eq!(rc, 0, "pthread_threadid_np failed: {rc}");
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("shadowtrace_common::threading::get_current_thread_id is unsupported on this platform");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(get_current_thread_id(), get_current_thread_id());
    }

    #[test]
    fn thread_id_differs_across_threads() {
        let here = get_current_thread_id();
        let there = std::thread::spawn(get_current_thread_id)
            .join()
            .expect("spawned thread");
        assert_ne!(here, there);
    }
}
