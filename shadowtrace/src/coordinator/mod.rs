// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide exception coordinator.
//!
//! Installed once per process. On an unhandled fault it requests the
//! out-of-process dump, engages the gate that freezes every shadow stack,
//! harvests them into a text report (preferably on the pre-spawned reporter
//! thread, inline as a fallback), optionally mirrors the event onto the
//! trace channel, and always ends in process termination.
//!
//! This file runs inside a signal handler. Up to the point where the gate
//! is engaged and the report handed off, it restricts itself to
//! async-signal-safe operations: atomic loads and stores, volatile
//! shared-memory writes, `write`, `poll`, `nanosleep`.

pub mod report;

use crate::context::DiagnosticsContext;
use crate::rendezvous::record::ExceptionSnapshot;
use crate::shared::constants::{ST_REPORTER_WAIT, ST_REPORT_EXT};
use libc::{c_void, siginfo_t, ucontext_t};
use report::ReportContext;
use shadowtrace_common::paths::artifact_file_name;
use shadowtrace_common::threading::get_current_thread_id;
use shadowtrace_common::timeout::TimeoutManager;
use shadowtrace_common::unix::terminate;
use std::cell::UnsafeCell;
use std::io::{BufWriter, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

// The coordinator's state lives in statics rather than on the context
// because a signal handler receives no arguments of ours. The context is
// reachable through exactly one pointer, installed by `install()`; all
// other statics are plain flags and descriptors.
static CONTEXT: AtomicPtr<Arc<DiagnosticsContext>> = AtomicPtr::new(ptr::null_mut());
static ENABLED: AtomicBool = AtomicBool::new(true);
static INSTALL_STARTED: AtomicBool = AtomicBool::new(false);
static FAULTS_SEEN: AtomicU64 = AtomicU64::new(0);
static REPORTER_TID: AtomicU64 = AtomicU64::new(0);
static REPORTER_WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static REPORT_DONE: AtomicBool = AtomicBool::new(false);

const JOB_PATH_MAX: usize = 256;

/// Handoff from the faulting thread to the reporter thread: snapshot plus
/// the dump path as raw bytes, so publishing it allocates nothing.
struct ReportJob {
    snapshot: ExceptionSnapshot,
    dump_path: [u8; JOB_PATH_MAX],
    dump_path_len: usize,
}

struct JobCell {
    data: UnsafeCell<ReportJob>,
    ready: AtomicBool,
}

// SAFETY: the single writer is the thread that won the one-shot fault
// guard; it publishes with a release store on `ready` before any reader
// looks.
unsafe impl Sync for JobCell {}

static JOB: JobCell = JobCell {
    data: UnsafeCell::new(ReportJob {
        snapshot: ExceptionSnapshot::empty(),
        dump_path: [0; JOB_PATH_MAX],
        dump_path_len: 0,
    }),
    ready: AtomicBool::new(false),
};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Attempted to double install the crash handler")]
    AlreadyInstalled,
    #[error("Failed to spawn the reporter thread: {0}")]
    ReporterSpawn(std::io::Error),
    #[error("Errors registering signal handlers: {0:?}")]
    SignalRegistration(Vec<String>),
}

/// Turns crash handling into a no-op without touching the installed
/// handlers. Idempotent.
pub fn disable() {
    ENABLED.store(false, SeqCst);
}

/// Re-enables crash handling if it was disabled. Idempotent.
pub fn enable() {
    ENABLED.store(true, SeqCst);
}

/// Installs the coordinator: stores the context where the signal handler
/// can reach it, spawns the dedicated reporter thread (when configured)
/// and registers the configured signals. Once per process.
pub fn install(context: &Arc<DiagnosticsContext>) -> Result<(), InstallError> {
    if INSTALL_STARTED
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        return Err(InstallError::AlreadyInstalled);
    }

    let context_ptr = Box::into_raw(Box::new(Arc::clone(context)));
    CONTEXT.store(context_ptr, SeqCst);

    if context.config().use_reporter_thread() {
        spawn_reporter(context)?;
    }

    let mut errors = vec![];
    for signum in context.config().signals() {
        // SAFETY: handle_signal is async-signal aware by construction.
        if let Err(e) = unsafe { register_signal_handler(*signum) } {
            errors.push(format!("Unable to register signal for {signum}: {e:?}"));
        }
    }
    if !errors.is_empty() {
        return Err(InstallError::SignalRegistration(errors));
    }
    Ok(())
}

/// Deliberate hard-invariant-violation path: leaves one last frame
/// describing the violation, then aborts so post-mortem tooling sees a
/// clean, unwound-free stack right here.
pub fn invariant_violation(context: &DiagnosticsContext, description: &str) -> ! {
    context.push_frame("InvariantViolation", &[crate::stack::FrameArg::Str(description)]);
    eprintln!("shadowtrace: invariant violated: {description}");
    // SAFETY: abort has no preconditions.
    unsafe { libc::abort() }
}

fn spawn_reporter(context: &Arc<DiagnosticsContext>) -> Result<(), InstallError> {
    let (wake_read, wake_write) =
        nix::unistd::pipe().map_err(|e| InstallError::ReporterSpawn(e.into()))?;
    REPORTER_WAKE_FD.store(wake_write.into_raw_fd(), SeqCst);
    let context = Arc::clone(context);
    std::thread::Builder::new()
        .name("st-crash-reporter".into())
        .spawn(move || reporter_main(context, wake_read))
        .map_err(InstallError::ReporterSpawn)?;
    Ok(())
}

/// The dedicated reporter thread: parked on a blocking pipe read until a
/// fault wakes it. Pre-spawned so report generation runs on a stack and
/// thread state untouched by the fault.
fn reporter_main(context: Arc<DiagnosticsContext>, wake_read: std::os::fd::OwnedFd) {
    use std::os::fd::AsRawFd;
    REPORTER_TID.store(get_current_thread_id(), SeqCst);
    let mut byte = [0u8; 1];
    loop {
        // SAFETY: reading into a valid one-byte buffer.
        let rc = unsafe {
            libc::read(wake_read.as_raw_fd(), byte.as_mut_ptr().cast(), 1)
        };
        if rc < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if rc == 0 {
            return;
        }
        if JOB.ready.load(SeqCst) {
            // SAFETY: published by the fault winner before the wake byte.
            let job = unsafe { &*JOB.data.get() };
            run_report_job(&context, job);
            REPORT_DONE.store(true, SeqCst);
        }
    }
}

unsafe fn register_signal_handler(signum: i32) -> anyhow::Result<()> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    let signal = crate::shared::configuration::signal_from_signum(signum)?;
    let action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    signal::sigaction(signal, &action)?;
    Ok(())
}

/// Restores the default disposition and re-raises, for the paths that skip
/// reporting (disabled tracker, attached debugger).
fn escape_to_default(signum: i32) {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    if let Ok(signal) = crate::shared::configuration::signal_from_signum(signum) {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring SIG_DFL has no preconditions.
        let _ = unsafe { signal::sigaction(signal, &action) };
        // SAFETY: raising a signal for the current process has no
        // preconditions.
        unsafe { libc::raise(signum) };
    }
}

pub(crate) extern "C" fn handle_signal(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    handle_signal_impl(signum, sig_info, ucontext as *const ucontext_t);
    // Reaching here means an escape path chose to re-raise; every
    // reporting path terminates the process instead.
}

fn handle_signal_impl(signum: i32, sig_info: *mut siginfo_t, ucontext: *const ucontext_t) {
    if !ENABLED.load(SeqCst) {
        escape_to_default(signum);
        return;
    }

    // Debugger escape hatch: a developer at a breakpoint wants the fault,
    // not a report. Production builds skip the procfs probe.
    #[cfg(debug_assertions)]
    if shadowtrace_common::unix::is_being_traced().unwrap_or(false) {
        escape_to_default(signum);
        return;
    }

    // One crash report per process. A second fault — possibly a crash of
    // this very code — must not recurse.
    if FAULTS_SEEN.fetch_add(1, SeqCst) > 0 {
        terminate();
    }

    let context_ptr = CONTEXT.load(SeqCst);
    if context_ptr.is_null() {
        escape_to_default(signum);
        return;
    }
    // SAFETY: the pointer was created by Box::into_raw in install() and is
    // never freed.
    let context = unsafe { &*context_ptr };

    let os_id = get_current_thread_id();
    let snapshot = ExceptionSnapshot::capture(signum, sig_info, ucontext, os_id);

    // Out-of-process dump first, while the process image is closest to the
    // fault. The rendezvous path is pre-allocated shared memory plus
    // write/poll, safe even with the heap suspect.
    let dump_path = context
        .rendezvous()
        .and_then(|rendezvous| rendezvous.request_dump(&snapshot).ok());

    if !context.gate().try_engage(os_id) {
        // Another thread beat us into the coordinator; it owns process
        // shutdown. Park until it terminates us.
        loop {
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    // Publish the job for whichever thread generates the report.
    {
        // SAFETY: the one-shot guard above makes this the only writer, and
        // readers wait for the release store on `ready`.
        let job = unsafe { &mut *JOB.data.get() };
        job.snapshot = snapshot;
        job.dump_path_len = 0;
        if let Some(path) = &dump_path {
            let bytes = path.as_os_str().as_bytes();
            let len = bytes.len().min(JOB_PATH_MAX);
            job.dump_path[..len].copy_from_slice(&bytes[..len]);
            job.dump_path_len = len;
        }
    }
    JOB.ready.store(true, SeqCst);

    let reporter_tid = REPORTER_TID.load(SeqCst);
    let wake_fd = REPORTER_WAKE_FD.load(SeqCst);
    let mut reported = false;
    if reporter_tid != 0 && wake_fd >= 0 {
        // Hand the harvest to the dedicated thread: its stack is clean and
        // a fault there cannot take this thread's report path with it.
        context.gate().set_exempt_thread(reporter_tid);
        // SAFETY: writing one byte from a valid buffer.
        let rc = unsafe { libc::write(wake_fd, [1u8].as_ptr().cast(), 1) };
        if rc == 1 {
            let budget = TimeoutManager::new(ST_REPORTER_WAIT);
            while !REPORT_DONE.load(SeqCst) && !budget.expired() {
                std::thread::sleep(Duration::from_millis(10));
            }
            reported = REPORT_DONE.load(SeqCst);
        }
    }

    if !reported {
        // Reporter missing or stuck: degrade to generating the report on
        // the faulting thread.
        context.gate().set_exempt_thread(os_id);
        // SAFETY: ready was published above and no writer runs anymore.
        let job = unsafe { &*JOB.data.get() };
        run_report_job(context, job);
    }

    if context.config().emit_crash_to_channel() {
        emit_crash_event(context, &snapshot);
    }

    terminate();
}

/// Builds the report file; degrades to stderr when the file cannot be
/// produced. Never lets a report failure abort the crash path.
fn run_report_job(context: &DiagnosticsContext, job: &ReportJob) {
    let dump_path = (job.dump_path_len > 0).then(|| {
        Path::new(std::ffi::OsStr::from_bytes(
            &job.dump_path[..job.dump_path_len],
        ))
    });
    let report_context = ReportContext {
        snapshot: &job.snapshot,
        install_uid: context.install_uid(),
        dump_path,
        generated_at: chrono::Utc::now(),
    };

    let file_name = artifact_file_name(
        context.install_uid(),
        context.config().report_basename(),
        report_context.generated_at,
        ST_REPORT_EXT,
    );
    let path = context.report_dir().join(file_name);

    let file = std::fs::create_dir_all(context.report_dir())
        .and_then(|()| std::fs::File::create(&path));
    match file {
        Ok(file) => {
            let mut writer = BufWriter::new(file);
            let written = report::build_report(
                &mut writer,
                context.gate(),
                context.registry(),
                &report_context,
            )
            .and_then(|()| writer.flush());
            match written {
                Ok(()) => eprintln!("shadowtrace: crash report written to {}", path.display()),
                Err(_) => report_to_stderr(context, &report_context),
            }
        }
        Err(_) => report_to_stderr(context, &report_context),
    }
}

fn report_to_stderr(context: &DiagnosticsContext, report_context: &ReportContext<'_>) {
    let stderr = std::io::stderr();
    let _ = report::build_report(
        &mut stderr.lock(),
        context.gate(),
        context.registry(),
        report_context,
    );
}

/// Mirrors the crash onto the trace channel, best effort: try-lock only,
/// and any failure is already covered by the channel's teardown policy.
fn emit_crash_event(context: &DiagnosticsContext, snapshot: &ExceptionSnapshot) {
    let message = format!(
        "fatal signal {} at {:#018x}",
        snapshot.signum, snapshot.fault_address
    );
    context.channel().try_send(
        context.registry(),
        &crate::channel::frame::TraceEvent {
            kind: crate::channel::frame::TraceEventKind::Narrow,
            source_path: "",
            source_line: 0,
            message: &message,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_disable_flip_the_flag() {
        assert!(ENABLED.load(SeqCst));
        disable();
        assert!(!ENABLED.load(SeqCst));
        enable();
        assert!(ENABLED.load(SeqCst));
    }

    #[test]
    fn job_cell_starts_unpublished() {
        assert!(!JOB.ready.load(SeqCst) || FAULTS_SEEN.load(SeqCst) > 0);
    }
}
