// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The diagnostics context.
//!
//! One explicit object owns every component of the pipeline — registry,
//! gate, trace channel, rendezvous — constructed once at process start and
//! passed to whatever instruments itself. Teardown is dropping the last
//! `Arc`: the channel disconnects, the helper is reaped, the shared record
//! unlinks. The only global is the single pointer the crash handler needs
//! (see `coordinator`), installed explicitly by
//! [`DiagnosticsContext::install_crash_handler`].

use crate::channel::frame::{TraceEvent, TraceEventKind};
use crate::channel::handshake::HandshakeError;
use crate::channel::TraceChannel;
use crate::coordinator;
use crate::gate::ExceptionGate;
use crate::registry::ThreadRegistry;
use crate::rendezvous::{Rendezvous, RendezvousError};
use crate::shared::configuration::DiagnosticsConfiguration;
use crate::shared::constants::ST_APP_NAME;
use crate::stack::{tls, FrameArg};
use shadowtrace_common::threading::get_current_thread_id;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

fn next_context_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub struct DiagnosticsContext {
    id: u64,
    config: DiagnosticsConfiguration,
    registry: Arc<ThreadRegistry>,
    gate: ExceptionGate,
    channel: TraceChannel,
    rendezvous: OnceLock<Rendezvous>,
    install_uid: String,
    report_dir: PathBuf,
}

impl DiagnosticsContext {
    /// Builds the context: resolves the installation UID and report
    /// directory, wires the components. Launching the helper, connecting
    /// the channel and installing the crash handler stay separate explicit
    /// steps so embedders control what runs in their process.
    pub fn initialize(config: DiagnosticsConfiguration) -> anyhow::Result<Arc<Self>> {
        let install_uid = shadowtrace_common::install_uid::installation_uid(ST_APP_NAME)?;
        let report_dir = config
            .report_dir()
            .clone()
            .unwrap_or_else(|| shadowtrace_common::paths::default_report_dir(ST_APP_NAME));
        let channel = TraceChannel::new(config.collector_namespace().clone());
        Ok(Arc::new(Self {
            id: next_context_id(),
            config,
            registry: Arc::new(ThreadRegistry::new()),
            gate: ExceptionGate::new(),
            channel,
            rendezvous: OnceLock::new(),
            install_uid,
            report_dir,
        }))
    }

    // -----------------------------------------------------------------
    // Startup steps

    /// Spawns the bug-report helper and establishes the rendezvous.
    pub fn launch_helper(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.rendezvous.get().is_none(),
            "helper already launched for this context"
        );
        let rendezvous = Rendezvous::launch(&self.config, &self.install_uid, &self.report_dir)?;
        self.rendezvous
            .set(rendezvous)
            .map_err(|_| anyhow::anyhow!("helper already launched for this context"))?;
        Ok(())
    }

    /// Connects the trace channel to a running collector, if any.
    pub fn connect_trace_channel(&self) -> Result<(), HandshakeError> {
        self.channel.connect()
    }

    /// Installs the process-wide crash handler pointing at this context.
    pub fn install_crash_handler(self: &Arc<Self>) -> anyhow::Result<()> {
        coordinator::install(self)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shadow stack API

    /// Brackets the start of a logical operation on this thread's shadow
    /// stack. Never allocates on the hot path, never fails; blocks only
    /// while a crash harvest has the gate engaged.
    pub fn push_frame(&self, name: &str, args: &[FrameArg<'_>]) {
        self.gate.block_while_engaged(get_current_thread_id());
        tls::with_thread_stack(self.id, &self.registry, |stack| stack.push(name, args));
    }

    /// Removes the most recent frame pushed by this thread.
    pub fn pop_frame(&self) {
        self.gate.block_while_engaged(get_current_thread_id());
        tls::with_thread_stack(self.id, &self.registry, |stack| stack.pop());
    }

    /// RAII bracket: pops on drop.
    #[must_use = "the frame pops when the guard drops"]
    pub fn frame_guard<'a>(&'a self, name: &str, args: &[FrameArg<'_>]) -> FrameGuard<'a> {
        self.push_frame(name, args);
        FrameGuard { context: self }
    }

    // -----------------------------------------------------------------
    // Trace channel API

    /// Streams one diagnostic event to the collector; a no-op while
    /// disconnected.
    #[track_caller]
    pub fn emit_trace(&self, kind: TraceEventKind, message: &str) {
        let location = std::panic::Location::caller();
        self.channel.send(
            &self.registry,
            &TraceEvent {
                kind,
                source_path: location.file(),
                source_line: location.line(),
                message,
            },
        );
    }

    // -----------------------------------------------------------------
    // Rendezvous API

    /// Tells the helper which localization future dumps should use.
    pub fn set_language(&self, name: &str) -> Result<(), RendezvousError> {
        match self.rendezvous.get() {
            Some(rendezvous) => rendezvous.set_language(name),
            None => Ok(()),
        }
    }

    /// Asks the helper how many unsent artifacts previous runs left
    /// behind. `None` when no helper is attached.
    pub fn check_report_backlog(&self) -> Option<u32> {
        self.rendezvous
            .get()
            .and_then(|rendezvous| rendezvous.check_backlog().ok())
    }

    /// Records the violation on the shadow stack and raises a clean-stack
    /// abort for post-mortem tooling.
    pub fn fatal_invariant(&self, description: &str) -> ! {
        coordinator::invariant_violation(self, description)
    }

    // -----------------------------------------------------------------
    // Component access

    pub fn config(&self) -> &DiagnosticsConfiguration {
        &self.config
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &ExceptionGate {
        &self.gate
    }

    pub fn channel(&self) -> &TraceChannel {
        &self.channel
    }

    pub fn rendezvous(&self) -> Option<&Rendezvous> {
        self.rendezvous.get()
    }

    pub fn install_uid(&self) -> &str {
        &self.install_uid
    }

    pub fn report_dir(&self) -> &std::path::Path {
        &self.report_dir
    }
}

impl std::fmt::Debug for DiagnosticsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsContext")
            .field("id", &self.id)
            .field("install_uid", &self.install_uid)
            .field("report_dir", &self.report_dir)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Pops its frame when dropped, keeping push/pop bracketing correct on
/// every exit path.
pub struct FrameGuard<'a> {
    context: &'a DiagnosticsContext,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.context.pop_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::tls::with_thread_stack;

    fn test_context() -> Arc<DiagnosticsContext> {
        DiagnosticsContext::initialize(DiagnosticsConfiguration::default()).expect("context")
    }

    fn current_frames(context: &DiagnosticsContext) -> usize {
        with_thread_stack(context.id, &context.registry, |stack| stack.frame_count())
            .unwrap_or(0)
    }

    #[test]
    fn push_pop_balance_through_the_context() {
        let context = test_context();
        context.push_frame("OpenFile", &[FrameArg::Str("a.txt")]);
        context.push_frame("ReadBytes", &[FrameArg::Uint(100)]);
        assert_eq!(current_frames(&context), 2);
        context.pop_frame();
        context.pop_frame();
        assert_eq!(current_frames(&context), 0);
    }

    #[test]
    fn frame_guard_pops_on_drop() {
        let context = test_context();
        {
            let _guard = context.frame_guard("Scoped", &[]);
            assert_eq!(current_frames(&context), 1);
        }
        assert_eq!(current_frames(&context), 0);
    }

    #[test]
    fn first_push_registers_with_the_registry() {
        let context = test_context();
        let os_id = get_current_thread_id();
        assert!(context.registry().lookup(os_id).is_none());
        context.push_frame("First", &[]);
        assert!(context.registry().lookup(os_id).is_some());
    }

    #[test]
    fn rendezvous_free_context_answers_gracefully() {
        let context = test_context();
        assert!(context.rendezvous().is_none());
        context.set_language("Deutsch").expect("no-op");
        assert_eq!(context.check_report_backlog(), None);
        // A disconnected channel swallows traces the same way.
        context.emit_trace(TraceEventKind::Narrow, "nobody listening");
        assert!(!context.channel().is_connected());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn end_to_end_harvest_scenario() {
        use crate::coordinator::report::{build_report, ReportContext};
        use crate::rendezvous::record::ExceptionSnapshot;
        use std::sync::mpsc;

        let context = test_context();

        // Thread A pushes two frames and reports its os id, then stays
        // alive (parked on the gate the moment it touches the stack again).
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = {
            let context = Arc::clone(&context);
            std::thread::spawn(move || {
                context.push_frame("OpenFile", &[FrameArg::Str("a.txt")]);
                context.push_frame("ReadBytes", &[FrameArg::Uint(100)]);
                ready_tx
                    .send(get_current_thread_id())
                    .expect("report thread id");
                release_rx.recv().expect("release");
                context.pop_frame();
                context.pop_frame();
            })
        };
        let worker_os_id = ready_rx.recv().expect("worker ready");

        // Thread B plays the coordinator: engage, harvest, inspect.
        let harvester_id = get_current_thread_id();
        assert!(context.gate().try_engage(harvester_id));
        let mut snapshot = ExceptionSnapshot::empty();
        snapshot.signum = libc::SIGSEGV;
        snapshot.faulting_thread = harvester_id;

        let mut out = Vec::new();
        build_report(
            &mut out,
            context.gate(),
            context.registry(),
            &ReportContext {
                snapshot: &snapshot,
                install_uid: context.install_uid(),
                dump_path: None,
                generated_at: chrono::Utc::now(),
            },
        )
        .expect("report");
        let text = String::from_utf8(out).expect("utf8");

        let open_at = text.find("at OpenFile(a.txt)").expect("first frame");
        let read_at = text.find("at ReadBytes(100)").expect("second frame");
        assert!(open_at < read_at, "frames must appear in push order");
        assert!(text.contains(&format!("(os id {worker_os_id})")));

        // Unlike a real crash, the test releases the gate and lets the
        // worker finish cleanly.
        context.gate().disengage();
        release_tx.send(()).expect("release worker");
        worker.join().expect("worker join");
    }
}
