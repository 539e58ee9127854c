// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous with the out-of-process bug-report helper.
//!
//! At startup the owning process creates the shared record and four event
//! pipes (Fire, Done, SetLanguage, CheckBacklog), then spawns the helper
//! with the read/write ends it needs inherited across the spawn — fd
//! inheritance is the capability-transfer step on this platform. Every
//! request is fill-fields, signal, wait; the wait covers {helper process,
//! Done} so a dead helper completes the wait instead of hanging it.

pub mod helper;
pub mod record;

use crate::shared::configuration::{DiagnosticsConfiguration, HelperConfig};
use crate::shared::constants::{ST_HELPER_BIN_NAME, ST_RENDEZVOUS_VERSION};
use record::{status, ExceptionSnapshot, RecordView, RendezvousRecord};
use shadowtrace_common::shm::NamedShm;
use shadowtrace_common::timeout::TimeoutManager;
use shadowtrace_common::unix::{wait_any, WaitOutcome};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("Bug-report helper process is gone")]
    HelperDead,
    #[error("Timed out waiting for the bug-report helper")]
    Timeout,
    #[error("Bug-report helper reported failure")]
    HelperFailed,
    #[error("Rendezvous field does not fit its record slot")]
    FieldTooLong(#[from] crate::shared::fixedstr::FixedStrTooLong),
    #[error("Rendezvous I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Rendezvous poll failure: {0}")]
    Poll(#[from] shadowtrace_common::unix::PollError),
}

/// A unidirectional event: one byte over a pipe. Pipes instead of anything
/// fancier because both ends must survive fd inheritance across spawn.
pub(crate) struct EventPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl EventPipe {
    pub(crate) fn new() -> std::io::Result<Self> {
        let (read, write) = nix::unistd::pipe()?;
        set_nonblocking(read.as_raw_fd())?;
        Ok(Self { read, write })
    }

    pub(crate) fn signal(&self) -> std::io::Result<()> {
        // SAFETY: writing one byte from a valid buffer.
        let rc = unsafe { libc::write(self.write.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Consumes any pending signals. Returns whether one was pending.
    pub(crate) fn drain(&self) -> bool {
        let mut buf = [0u8; 16];
        // SAFETY: reading into a valid buffer on a non-blocking fd.
        let rc = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        rc > 0
    }

    pub(crate) fn read_fd(&self) -> i32 {
        self.read.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> i32 {
        self.write.as_raw_fd()
    }
}

pub(crate) fn set_nonblocking(fd: i32) -> std::io::Result<()> {
    // SAFETY: fd is open; F_GETFL/F_SETFL have no other preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Parent-side endpoint, alive for the whole process lifetime.
pub struct Rendezvous {
    view: RecordView,
    // Owns the name; unlinked when the process tears the context down.
    _shm: NamedShm,
    shm_name: String,
    fire: EventPipe,
    done: EventPipe,
    set_language_event: EventPipe,
    check_backlog_event: EventPipe,
    helper: Child,
    #[cfg(target_os = "linux")]
    helper_pidfd: Option<OwnedFd>,
    failure_reported: AtomicBool,
    timeout: Duration,
    unbounded_waits: bool,
}

impl Rendezvous {
    /// Creates the record, spawns the helper next to the current executable
    /// (or at the configured override) and hands it the record name, its
    /// four event descriptors and the startup language on the command line.
    pub fn launch(
        config: &DiagnosticsConfiguration,
        install_uid: &str,
        report_dir: &Path,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        // Unique per launch, not just per process: a process may tear one
        // context down and build another.
        static LAUNCHES: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let shm_name = format!(
            "/st-rv-{}-{}",
            std::process::id(),
            LAUNCHES.fetch_add(1, Ordering::Relaxed)
        );
        NamedShm::unlink(&shm_name)?;
        let shm = NamedShm::create(&shm_name, std::mem::size_of::<RendezvousRecord>())
            .context("creating rendezvous record segment")?;
        let view = RecordView::new(shm.map()?)?;

        let mut record = RendezvousRecord::empty();
        record.version = ST_RENDEZVOUS_VERSION;
        record.owner_pid = std::process::id();
        record.set_language(config.language())?;
        crate::shared::fixedstr::write_fixed(
            &mut record.output_dir,
            &report_dir.to_string_lossy(),
        )?;
        crate::shared::fixedstr::write_fixed(&mut record.basename, config.report_basename())?;
        crate::shared::fixedstr::write_fixed(&mut record.install_uid, install_uid)?;
        view.store(&record);

        let fire = EventPipe::new()?;
        let done = EventPipe::new()?;
        let set_language_event = EventPipe::new()?;
        let check_backlog_event = EventPipe::new()?;

        let helper_path = match config.helper_path() {
            Some(path) => path.clone(),
            None => helper_path_next_to_exe()?,
        };
        let helper_config = HelperConfig::new(
            helper_path.to_string_lossy().into_owned(),
            vec![
                shm_name.clone(),
                fire.read_fd().to_string(),
                done.write_fd().to_string(),
                set_language_event.read_fd().to_string(),
                check_backlog_event.read_fd().to_string(),
                config.language().to_owned(),
            ],
            vec![],
            None,
            None,
        )?;
        let helper = spawn_helper(&helper_config)
            .with_context(|| format!("spawning helper {}", helper_path.display()))?;
        tracing::debug!(pid = helper.id(), path = %helper_path.display(), "bug-report helper launched");

        #[cfg(target_os = "linux")]
        let helper_pidfd =
            shadowtrace_common::unix::pidfd_open(nix::unistd::Pid::from_raw(helper.id() as i32))
                .map_err(|error| {
                    tracing::warn!(%error, "pidfd unavailable; falling back to liveness probes");
                    error
                })
                .ok();

        Ok(Self {
            view,
            _shm: shm,
            shm_name,
            fire,
            done,
            set_language_event,
            check_backlog_event,
            helper,
            #[cfg(target_os = "linux")]
            helper_pidfd,
            failure_reported: AtomicBool::new(false),
            timeout: config.timeout(),
            unbounded_waits: config.debug_unbounded_waits(),
        })
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn helper_pid(&self) -> u32 {
        self.helper.id()
    }

    /// Hands the fault to the helper and waits for the dump. The part up to
    /// the wait is allocation-free: volatile stores into the mapped record,
    /// a one-byte write, a poll.
    pub fn request_dump(&self, snapshot: &ExceptionSnapshot) -> Result<PathBuf, RendezvousError> {
        let mut record = self.view.load();
        record.snapshot = *snapshot;
        record.status = status::IDLE;
        record.result_path.fill(0);
        self.view.store(&record);

        self.round_trip(&self.fire).inspect_err(|error| {
            self.report_failure_once(error);
        })?;

        let record = self.view.load();
        if record.status != status::OK {
            self.report_failure_once(&RendezvousError::HelperFailed);
            return Err(RendezvousError::HelperFailed);
        }
        Ok(PathBuf::from(record.result_path()))
    }

    /// Tells the helper which localization to use for future dumps.
    pub fn set_language(&self, name: &str) -> Result<(), RendezvousError> {
        let mut record = self.view.load();
        record.set_language(name)?;
        record.status = status::IDLE;
        self.view.store(&record);

        self.round_trip(&self.set_language_event)?;
        if self.view.load().status != status::OK {
            return Err(RendezvousError::HelperFailed);
        }
        Ok(())
    }

    /// Asks the helper how many artifacts from earlier runs are still
    /// sitting in the output directory.
    pub fn check_backlog(&self) -> Result<u32, RendezvousError> {
        let mut record = self.view.load();
        record.status = status::IDLE;
        record.backlog_count = 0;
        self.view.store(&record);

        self.round_trip(&self.check_backlog_event)?;
        let record = self.view.load();
        if record.status != status::OK {
            return Err(RendezvousError::HelperFailed);
        }
        Ok(record.backlog_count)
    }

    /// Signal one request event, then wait on {helper process, Done}.
    fn round_trip(&self, event: &EventPipe) -> Result<(), RendezvousError> {
        // A stale Done from an abandoned round must not satisfy this one.
        while self.done.drain() {}
        event.signal()?;

        loop {
            let timeout = if self.unbounded_waits {
                TimeoutManager::new(Duration::from_secs(3600))
            } else {
                TimeoutManager::new(self.timeout)
            };
            let outcome = self.wait_done_or_death(&timeout)?;
            match outcome {
                WaitOutcome::Ready(0) => {
                    self.done.drain();
                    return Ok(());
                }
                WaitOutcome::Ready(_) => {
                    // Helper exited. It may have answered first; give the
                    // Done pipe the final word.
                    if self.done.drain() {
                        return Ok(());
                    }
                    return Err(RendezvousError::HelperDead);
                }
                WaitOutcome::Timeout => {
                    if self.unbounded_waits {
                        continue;
                    }
                    return Err(RendezvousError::Timeout);
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn wait_done_or_death(&self, timeout: &TimeoutManager) -> Result<WaitOutcome, RendezvousError> {
        match &self.helper_pidfd {
            Some(pidfd) => Ok(wait_any(
                &[self.done.read_fd(), pidfd.as_raw_fd()],
                timeout,
            )?),
            None => self.wait_done_with_probes(timeout),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_done_or_death(&self, timeout: &TimeoutManager) -> Result<WaitOutcome, RendezvousError> {
        self.wait_done_with_probes(timeout)
    }

    /// Fallback when no pollable process handle exists: wait on Done in
    /// short slices and probe helper liveness between them.
    fn wait_done_with_probes(
        &self,
        timeout: &TimeoutManager,
    ) -> Result<WaitOutcome, RendezvousError> {
        loop {
            let slice = TimeoutManager::new(Duration::from_millis(200).min(timeout.remaining()));
            match wait_any(&[self.done.read_fd()], &slice)? {
                WaitOutcome::Ready(index) => return Ok(WaitOutcome::Ready(index)),
                WaitOutcome::Timeout => {
                    if !shadowtrace_common::unix::process_alive(nix::unistd::Pid::from_raw(
                        self.helper.id() as i32,
                    )) {
                        // Index 1 is "the process handle" in the two-handle
                        // wait shape.
                        return Ok(WaitOutcome::Ready(1));
                    }
                    if timeout.expired() {
                        return Ok(WaitOutcome::Timeout);
                    }
                }
            }
        }
    }

    /// Helper failures surface once per process lifetime; crashing apps
    /// must not stack error dialogs on every retry.
    fn report_failure_once(&self, error: &RendezvousError) {
        if !self.failure_reported.swap(true, Ordering::SeqCst) {
            tracing::error!(%error, "bug-report helper unavailable; falling back to in-process reporting");
            eprintln!("shadowtrace: bug-report helper unavailable ({error}); continuing without a dump");
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        // The record lives for the whole process; by the time this runs the
        // process is shutting down and the helper goes with it.
        let _ = self.helper.kill();
        let timeout = TimeoutManager::new(Duration::from_millis(500));
        let _ = shadowtrace_common::unix::reap_child_non_blocking(
            nix::unistd::Pid::from_raw(self.helper.id() as i32),
            &timeout,
        );
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("shm_name", &self.shm_name)
            .field("helper_pid", &self.helper.id())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Launches the helper described by a [`HelperConfig`]: stdio redirected to
/// the configured files or to null, everything else inherited so the event
/// descriptors survive the spawn.
fn spawn_helper(config: &HelperConfig) -> std::io::Result<Child> {
    let mut command = Command::new(&config.path_to_helper_binary);
    command.args(&config.args);
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command
        .stdin(Stdio::null())
        .stdout(stdio_sink(config.stdout_filename.as_deref())?)
        .stderr(stdio_sink(config.stderr_filename.as_deref())?);
    command.spawn()
}

/// Opens a redirect target in append mode, or swallows the stream. Some
/// systems run without /dev/null (chroot jails), so Stdio::null() is only
/// the fallback, never assumed.
fn stdio_sink(filename: Option<&str>) -> std::io::Result<Stdio> {
    match filename {
        Some(name) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(name)?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

fn helper_path_next_to_exe() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("current executable has no parent directory"))?;
    Ok(dir.join(ST_HELPER_BIN_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn event_pipe_signals_and_drains() {
        let pipe = EventPipe::new().expect("pipe");
        assert!(!pipe.drain());
        pipe.signal().expect("signal");
        pipe.signal().expect("signal");
        assert!(pipe.drain());
        assert!(!pipe.drain());
    }

    #[test]
    fn helper_path_is_next_to_the_executable() {
        let path = helper_path_next_to_exe().expect("path");
        assert!(path.ends_with(ST_HELPER_BIN_NAME));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn launch_fails_cleanly_without_helper_binary() {
        let config = DiagnosticsConfiguration::default();
        let dir = tempfile::tempdir().expect("tempdir");
        // The test runner's directory has no helper binary.
        let result = Rendezvous::launch(&config, "deadbeef", dir.path());
        assert!(result.is_err());
    }
}
