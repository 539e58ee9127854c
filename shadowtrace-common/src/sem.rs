// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Named POSIX semaphores.
//!
//! These back both roles the diagnostics protocols need from the platform:
//! counting flow-control budgets and binary data-ready/data-accepted events
//! shared with an unrelated process. Name-addressed so either side can adopt
//! an object the other created.

use std::ffi::CString;
use std::time::Duration;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum SemError {
    #[error("Semaphore name contains an interior NUL")]
    BadName,
    #[error("No semaphore with this name exists")]
    NotFound,
    #[error("A semaphore with this name already exists")]
    AlreadyExists,
    #[error("Timed out waiting on semaphore")]
    Timeout,
    #[error("Semaphore operation failed with errno: {0}")]
    Sys(i32),
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// A named semaphore plus the knowledge of whether this process created it.
/// The creating side unlinks the name on drop; adopters only close their
/// mapping.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

// SAFETY: sem_t operations are thread-safe; the raw pointer is only handed
// to libc sem_* calls.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates a semaphore that must not already exist.
    pub fn create(name: &str, initial: u32) -> Result<Self, SemError> {
        let c_name = CString::new(name).map_err(|_| SemError::BadName)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(match last_errno() {
                libc::EEXIST => SemError::AlreadyExists,
                errno => SemError::Sys(errno),
            });
        }
        Ok(Self {
            sem,
            name: c_name,
            owner: true,
        })
    }

    /// Adopts a semaphore some other process created. ENOENT maps to
    /// [`SemError::NotFound`], which is how callers probe for a peer.
    pub fn open(name: &str) -> Result<Self, SemError> {
        let c_name = CString::new(name).map_err(|_| SemError::BadName)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(match last_errno() {
                libc::ENOENT => SemError::NotFound,
                errno => SemError::Sys(errno),
            });
        }
        Ok(Self {
            sem,
            name: c_name,
            owner: false,
        })
    }

    pub fn post(&self) -> Result<(), SemError> {
        // SAFETY: self.sem came from a successful sem_open.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(SemError::Sys(last_errno()));
        }
        Ok(())
    }

    pub fn try_wait(&self) -> Result<bool, SemError> {
        // SAFETY: self.sem came from a successful sem_open.
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match last_errno() {
            libc::EAGAIN => Ok(false),
            libc::EINTR => Ok(false),
            errno => Err(SemError::Sys(errno)),
        }
    }

    /// Bounded wait for one unit. Never blocks past `timeout`.
    #[cfg(target_os = "linux")]
    pub fn timed_wait(&self, timeout: Duration) -> Result<(), SemError> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: the timespec pointer is valid for the call.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(SemError::Sys(last_errno()));
        }
        let nanos = now.tv_nsec as i128 + timeout.subsec_nanos() as i128;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };
        loop {
            // SAFETY: self.sem came from a successful sem_open; deadline is valid.
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(());
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::ETIMEDOUT => return Err(SemError::Timeout),
                errno => return Err(SemError::Sys(errno)),
            }
        }
    }

    /// macOS has no `sem_timedwait`; fall back to a try-wait loop with short
    /// sleeps. Only handshake and budget waits run through here, never the
    /// push/pop hot path.
    #[cfg(not(target_os = "linux"))]
    pub fn timed_wait(&self, timeout: Duration) -> Result<(), SemError> {
        let manager = crate::timeout::TimeoutManager::new(timeout);
        loop {
            if self.try_wait()? {
                return Ok(());
            }
            if manager.expired() {
                return Err(SemError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }

    /// Removes the name from the system. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<(), SemError> {
        let c_name = CString::new(name).map_err(|_| SemError::BadName)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 && last_errno() != libc::ENOENT {
            return Err(SemError::Sys(last_errno()));
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem came from a successful sem_open and is closed once.
        unsafe {
            libc::sem_close(self.sem);
        }
        if self.owner {
            // SAFETY: the name is a valid NUL-terminated string.
            unsafe {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}
