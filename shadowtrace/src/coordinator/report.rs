// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The human-readable crash report.
//!
//! Built from the shadow stacks of every registered thread while the
//! exception gate holds them frozen. Report generation is best-effort all
//! the way down: an unreadable frame degrades to a placeholder line, a
//! thread that cannot be walked degrades to a note, and only a failure of
//! the output writer itself aborts the build.

use crate::gate::ExceptionGate;
use crate::registry::ThreadRegistry;
use crate::rendezvous::record::ExceptionSnapshot;
use chrono::{DateTime, Utc};
use std::io::{self, Write};
use std::path::Path;

pub struct ReportContext<'a> {
    pub snapshot: &'a ExceptionSnapshot,
    pub install_uid: &'a str,
    pub dump_path: Option<&'a Path>,
    pub generated_at: DateTime<Utc>,
}

/// Writes the full report.
///
/// PRECONDITIONS:
///     The exception gate must be engaged and the calling thread must be
///     its exempt thread; every other registered thread is then either
///     parked on the gate or dead, which is what makes walking their
///     stacks sound.
pub fn build_report(
    writer: &mut impl Write,
    gate: &ExceptionGate,
    registry: &ThreadRegistry,
    report: &ReportContext<'_>,
) -> io::Result<()> {
    debug_assert!(gate.is_engaged(), "harvest requires an engaged gate");

    let snapshot = report.snapshot;
    writeln!(writer, "==== shadowtrace crash report ====")?;
    writeln!(
        writer,
        "generated: {}",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(writer, "installation: {}", report.install_uid)?;
    writeln!(writer, "process: {}", std::process::id())?;
    writeln!(writer, "signal: {} (code {})", snapshot.signum, snapshot.si_code)?;
    writeln!(writer, "fault-address: {:#018x}", snapshot.fault_address)?;
    writeln!(
        writer,
        "instruction-pointer: {:#018x}",
        snapshot.instruction_pointer
    )?;
    writeln!(writer, "faulting-thread: {}", snapshot.faulting_thread)?;
    match report.dump_path {
        Some(path) => writeln!(writer, "memory-dump: {}", path.display())?,
        None => writeln!(writer, "memory-dump: <not available>")?,
    }
    writeln!(writer)?;
    writer.flush()?;

    for thread in registry.snapshot() {
        let marker = if thread.os_id == snapshot.faulting_thread {
            " [faulting]"
        } else {
            ""
        };
        if !thread.cell.is_alive() {
            writeln!(
                writer,
                "thread #{} (os id {}): exited",
                thread.small_id, thread.os_id
            )?;
            continue;
        }
        writeln!(
            writer,
            "thread #{} (os id {}){marker}:",
            thread.small_id, thread.os_id
        )?;

        // SAFETY: per the preconditions, the owning thread cannot be
        // mutating its stack while we walk it.
        let stack = unsafe { thread.cell.harvest_mut() };
        stack.reset_iteration();
        let mut frames = 0usize;
        while let Some(line) = stack.next_line() {
            writeln!(writer, "  at {line}")?;
            frames += 1;
        }
        if frames == 0 {
            writeln!(writer, "  <no retained frames>")?;
        }
        if stack.skipped() > 0 {
            writeln!(
                writer,
                "  ({} deeper frames dropped, buffer full)",
                stack.skipped()
            )?;
        }
        // Flush per thread so a fault mid-harvest keeps earlier threads.
        writer.flush()?;
    }

    writeln!(writer)?;
    writeln!(writer, "==== end of report ====")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::tls::StackCell;
    use crate::stack::FrameArg;
    use std::sync::Arc;

    fn engaged_gate() -> ExceptionGate {
        let gate = ExceptionGate::new();
        assert!(gate.try_engage(shadowtrace_common::threading::get_current_thread_id()));
        gate
    }

    fn report_context<'a>(snapshot: &'a ExceptionSnapshot) -> ReportContext<'a> {
        ReportContext {
            snapshot,
            install_uid: "cafebabe",
            dump_path: None,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn report_contains_pushed_frames_in_push_order() {
        let registry = ThreadRegistry::new();
        let cell = Arc::new(StackCell::new(41));
        // SAFETY (test): no other thread touches this cell.
        let stack = unsafe { cell.owner_mut() };
        stack.push("OpenFile", &[FrameArg::Str("a.txt")]);
        stack.push("ReadBytes", &[FrameArg::Uint(100)]);
        registry.register(41, cell).expect("register");

        let gate = engaged_gate();
        let mut snapshot = ExceptionSnapshot::empty();
        snapshot.signum = libc::SIGSEGV;
        snapshot.faulting_thread = 99;

        let mut out = Vec::new();
        build_report(&mut out, &gate, &registry, &report_context(&snapshot)).expect("report");
        let text = String::from_utf8(out).expect("utf8");

        let open_at = text.find("at OpenFile(a.txt)").expect("first frame");
        let read_at = text.find("at ReadBytes(100)").expect("second frame");
        assert!(open_at < read_at, "frames must appear in push order");
        assert!(text.contains("signal: 11"));
        assert!(text.contains("memory-dump: <not available>"));
        gate.disengage();
    }

    #[test]
    fn faulting_thread_is_marked_and_dead_threads_noted() {
        let registry = ThreadRegistry::new();
        let faulting = Arc::new(StackCell::new(7));
        // SAFETY (test): no other thread touches this cell.
        unsafe { faulting.owner_mut() }.push("Crashing", &[]);
        registry.register(7, faulting).expect("register");

        let dead = Arc::new(StackCell::new(8));
        dead.mark_dead();
        registry.register(8, dead).expect("register");

        let gate = engaged_gate();
        let mut snapshot = ExceptionSnapshot::empty();
        snapshot.faulting_thread = 7;

        let mut out = Vec::new();
        build_report(&mut out, &gate, &registry, &report_context(&snapshot)).expect("report");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("(os id 7) [faulting]:"));
        assert!(text.contains("(os id 8): exited"));
        gate.disengage();
    }

    #[test]
    fn empty_and_skipping_stacks_are_described() {
        let registry = ThreadRegistry::new();
        let empty = Arc::new(StackCell::new(21));
        registry.register(21, empty).expect("register");

        let skipping = Arc::new(StackCell::new(22));
        {
            // SAFETY (test): no other thread touches this cell.
            let stack = unsafe { skipping.owner_mut() };
            // A tiny arena makes the second push overflow.
            *stack = crate::stack::ShadowStack::with_capacity(
                crate::shared::constants::ST_MAX_FRAME_TEXT
                    + crate::shared::constants::ST_FRAME_OVERHEAD,
            );
            stack.push("Kept", &[]);
            stack.push("Lost", &[]);
        }
        registry.register(22, skipping).expect("register");

        let gate = engaged_gate();
        let snapshot = ExceptionSnapshot::empty();
        let mut out = Vec::new();
        build_report(&mut out, &gate, &registry, &report_context(&snapshot)).expect("report");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("<no retained frames>"));
        assert!(text.contains("(1 deeper frames dropped, buffer full)"));
        gate.disengage();
    }
}
