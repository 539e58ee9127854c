// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use crate::timeout::TimeoutManager;
use libc::{nfds_t, poll, pollfd, EXIT_FAILURE, POLLERR, POLLHUP, POLLIN};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;
#[cfg(target_os = "linux")]
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ReapError {
    #[error("Timeout waiting for child process to exit")]
    Timeout,
    #[error("Error waiting for child process to exit: {0}")]
    WaitError(#[from] nix::Error),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PollError {
    #[error("Poll failed with errno: {0}")]
    PollError(i32),
    #[error("Poll returned unexpected revents: {0}")]
    UnexpectedResult(i16),
}

/// Outcome of a bounded wait over several descriptors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The descriptor at this index became ready (readable, or hung up).
    Ready(usize),
    Timeout,
}

/// Kills the program without raising an abort or calling at_exit handlers.
pub fn terminate() -> ! {
    // SAFETY: no preconditions.
    unsafe { libc::_exit(EXIT_FAILURE) }
}

/// Non-blocking child reaper.
/// * Returns `Ok(true)` once the child has been reaped.
/// * Returns `Ok(false)` if the child cannot be found (nothing left to do).
/// * Returns `Err(Timeout)` if the child outlives the timeout budget.
///
/// `waitpid` is characterized as async-signal safe by POSIX, so this may run
/// on the crash path.
pub fn reap_child_non_blocking(
    pid: Pid,
    timeout_manager: &TimeoutManager,
) -> Result<bool, ReapError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.expired() {
                    return Err(ReapError::Timeout);
                }
                // One scheduler slice between probes; WNOHANG otherwise spins.
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(_status) => return Ok(true),
            Err(nix::Error::ECHILD) => return Ok(false),
            Err(e) => return Err(ReapError::WaitError(e)),
        }
    }
}

/// Most descriptors any caller waits on at once; keeps the poll set on the
/// stack because this runs on the crash path.
const MAX_WAIT_FDS: usize = 8;

/// Waits until any of `fds` becomes readable or hangs up, bounded by the
/// timeout budget. Returns the index of the first ready descriptor.
///
/// Hangup and error conditions count as ready: for a pidfd that is process
/// exit, for a pipe it is the peer closing, and in both cases the caller
/// must look at the descriptor to learn which.
pub fn wait_any(fds: &[RawFd], timeout_manager: &TimeoutManager) -> Result<WaitOutcome, PollError> {
    debug_assert!(fds.len() <= MAX_WAIT_FDS);
    let count = fds.len().min(MAX_WAIT_FDS);
    let mut poll_fds = [pollfd {
        fd: -1,
        events: POLLIN,
        revents: 0,
    }; MAX_WAIT_FDS];
    for (slot, &fd) in poll_fds.iter_mut().zip(fds) {
        slot.fd = fd;
    }
    let poll_fds = &mut poll_fds[..count];

    loop {
        let timeout_ms = timeout_manager.remaining().as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: poll_fds outlives the call and nfds matches its length.
        let poll_result = unsafe { poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) };
        match poll_result {
            -1 => match nix::Error::last_raw() {
                libc::EAGAIN | libc::EINTR => {
                    if timeout_manager.expired() {
                        return Ok(WaitOutcome::Timeout);
                    }
                }
                errno => return Err(PollError::PollError(errno)),
            },
            0 => return Ok(WaitOutcome::Timeout),
            _ => {
                for (index, pfd) in poll_fds.iter().enumerate() {
                    if pfd.revents & (POLLIN | POLLHUP | POLLERR) != 0 {
                        return Ok(WaitOutcome::Ready(index));
                    }
                }
                return Err(PollError::UnexpectedResult(poll_fds[0].revents));
            }
        }
    }
}

/// Opens a pollable handle to a process. The descriptor becomes readable
/// when the process exits, which is what makes two-handle rendezvous waits
/// robust against helper death.
#[cfg(target_os = "linux")]
pub fn pidfd_open(pid: Pid) -> std::io::Result<OwnedFd> {
    // SAFETY: pidfd_open has no preconditions; flags must be 0.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0u32) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the kernel just returned this descriptor to us, nobody else
    // owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Liveness probe without reaping: signal 0 only performs permission checks.
pub fn process_alive(pid: Pid) -> bool {
    // SAFETY: kill with signal 0 delivers nothing.
    let rc = unsafe { libc::kill(pid.as_raw(), 0) };
    rc == 0 || nix::Error::last_raw() == libc::EPERM
}

/// Checks whether a debugger is attached to this process.
///
/// Reads `/proc/self/status` into a fixed buffer; `TracerPid` sits in the
/// first kilobyte, and this may run in a signal handler so no heap
/// allocation is allowed.
#[cfg(target_os = "linux")]
pub fn is_being_traced() -> std::io::Result<bool> {
    use std::io::Read;
    let mut file = std::fs::File::open("/proc/self/status")?;
    let mut buffer = [0u8; 4096];
    let len = file.read(&mut buffer)?;
    Ok(tracer_pid_is_set(&buffer[..len]))
}

#[cfg(not(target_os = "linux"))]
pub fn is_being_traced() -> std::io::Result<bool> {
    // No procfs; callers treat "unknown" as "not traced".
    Ok(false)
}

#[cfg(target_os = "linux")]
fn tracer_pid_is_set(status: &[u8]) -> bool {
    const MARKER: &[u8] = b"TracerPid:";
    let mut offset = 0;
    while offset < status.len() {
        let line_end = status[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(status.len(), |pos| offset + pos);
        let line = &status[offset..line_end];
        if let Some(rest) = line.strip_prefix(MARKER) {
            return rest.iter().any(|&b| b.is_ascii_digit() && b != b'0');
        }
        offset = line_end + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn reap_unknown_child_returns_false() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        let result = reap_child_non_blocking(Pid::from_raw(999_999), &manager);
        assert_eq!(result, Ok(false));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn wait_any_times_out_on_idle_pipe() {
        let (read_end, _write_end) = nix::unistd::pipe().expect("pipe");
        let manager = TimeoutManager::new(Duration::from_millis(1));
        let outcome = wait_any(&[read_end.as_raw_fd()], &manager).expect("poll");
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn wait_any_sees_readable_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        nix::unistd::write(&write_end, b"x").expect("write");
        let manager = TimeoutManager::new(Duration::from_secs(1));
        let outcome = wait_any(&[read_end.as_raw_fd()], &manager).expect("poll");
        assert_eq!(outcome, WaitOutcome::Ready(0));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(Pid::this()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tracer_pid_parsing() {
        assert!(!tracer_pid_is_set(b"Name:\tfoo\nTracerPid:\t0\nUid:\t0\n"));
        assert!(tracer_pid_is_set(b"Name:\tfoo\nTracerPid:\t4312\nUid:\t0\n"));
        assert!(!tracer_pid_is_set(b"Name:\tfoo\nUid:\t0\n"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn pidfd_open_self_works() {
        let fd = pidfd_open(Pid::this()).expect("pidfd_open");
        assert!(fd.as_raw_fd() >= 0);
    }
}
