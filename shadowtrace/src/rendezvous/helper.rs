// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The bug-report helper process.
//!
//! Runs out-of-process so it can capture the owner's state even when the
//! owner's heap and stack are no longer trustworthy. Maps the rendezvous
//! record by name, then serves Fire / SetLanguage / CheckBacklog requests
//! over the inherited event descriptors until the owner exits.

#![cfg(feature = "helper")]

use crate::rendezvous::record::{status, RecordView, RendezvousRecord};
use crate::shared::constants::{ST_DUMP_EXT, ST_RENDEZVOUS_VERSION, ST_REPORT_EXT};
use anyhow::Context;
use shadowtrace_common::paths::artifact_file_name;
use shadowtrace_common::shm::NamedShm;
use shadowtrace_common::timeout::TimeoutManager;
use shadowtrace_common::unix::{wait_any, WaitOutcome};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line contract with the owner:
/// `<shm-name> <fire-fd> <done-fd> <set-language-fd> <check-backlog-fd> <language>`
#[derive(Debug)]
pub struct HelperArgs {
    pub shm_name: String,
    pub fire_fd: RawFd,
    pub done_fd: RawFd,
    pub set_language_fd: RawFd,
    pub check_backlog_fd: RawFd,
    pub language: String,
}

impl HelperArgs {
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            args.len() == 6,
            "expected 6 arguments (shm-name, 4 fds, language), got {}",
            args.len()
        );
        let fd = |index: usize| -> anyhow::Result<RawFd> {
            args[index]
                .parse::<RawFd>()
                .with_context(|| format!("argument {index} is not a descriptor number"))
        };
        Ok(Self {
            shm_name: args[0].clone(),
            fire_fd: fd(1)?,
            done_fd: fd(2)?,
            set_language_fd: fd(3)?,
            check_backlog_fd: fd(4)?,
            language: args[5].clone(),
        })
    }
}

struct Helper {
    view: RecordView,
    fire: OwnedFd,
    done: OwnedFd,
    set_language: OwnedFd,
    check_backlog: OwnedFd,
    #[cfg(target_os = "linux")]
    owner_pidfd: Option<OwnedFd>,
    owner_pid: u32,
    language: String,
}

/// Entry point of the `shadowtrace-helper` binary.
pub fn helper_entry_point(args: HelperArgs) -> anyhow::Result<()> {
    let shm = NamedShm::open(&args.shm_name)
        .with_context(|| format!("opening rendezvous segment {}", args.shm_name))?;
    let view = RecordView::new(shm.map()?)?;
    let record = view.load();
    anyhow::ensure!(
        record.version == ST_RENDEZVOUS_VERSION,
        "rendezvous version mismatch: owner {} vs helper {}",
        record.version,
        ST_RENDEZVOUS_VERSION
    );
    let owner_pid = record.owner_pid;

    // SAFETY: the owner opened these descriptors for us and leaves them to
    // this process; each is adopted exactly once.
    let adopt = |fd: RawFd| unsafe { OwnedFd::from_raw_fd(fd) };
    let fire = adopt(args.fire_fd);
    let done = adopt(args.done_fd);
    let set_language = adopt(args.set_language_fd);
    let check_backlog = adopt(args.check_backlog_fd);
    for fd in [&fire, &set_language, &check_backlog] {
        super::set_nonblocking(fd.as_raw_fd())?;
    }

    #[cfg(target_os = "linux")]
    let owner_pidfd =
        shadowtrace_common::unix::pidfd_open(nix::unistd::Pid::from_raw(owner_pid as i32)).ok();

    let mut helper = Helper {
        view,
        fire,
        done,
        set_language,
        check_backlog,
        #[cfg(target_os = "linux")]
        owner_pidfd,
        owner_pid,
        language: args.language,
    };
    helper.serve()
}

impl Helper {
    /// Serves requests until the owner goes away.
    fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            let mut fds = [
                self.fire.as_raw_fd(),
                self.set_language.as_raw_fd(),
                self.check_backlog.as_raw_fd(),
                -1,
            ];
            let mut count = 3;
            #[cfg(target_os = "linux")]
            if let Some(pidfd) = &self.owner_pidfd {
                fds[3] = pidfd.as_raw_fd();
                count = 4;
            }

            let timeout = TimeoutManager::new(Duration::from_secs(2));
            match wait_any(&fds[..count], &timeout)? {
                WaitOutcome::Ready(0) => {
                    drain(&self.fire);
                    self.handle_fire();
                }
                WaitOutcome::Ready(1) => {
                    drain(&self.set_language);
                    self.handle_set_language();
                }
                WaitOutcome::Ready(2) => {
                    drain(&self.check_backlog);
                    self.handle_check_backlog();
                }
                WaitOutcome::Ready(_) => return Ok(()), // owner died
                WaitOutcome::Timeout => {
                    if !shadowtrace_common::unix::process_alive(nix::unistd::Pid::from_raw(
                        self.owner_pid as i32,
                    )) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn answer(&self, mut record: RendezvousRecord, verdict: i32) {
        record.status = verdict;
        self.view.store(&record);
        // SAFETY: writing one byte from a valid buffer.
        let rc = unsafe { libc::write(self.done.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        if rc < 0 {
            tracing::warn!("failed to signal Done to the owner");
        }
    }

    fn handle_fire(&self) {
        let mut record = self.view.load();
        match self.write_dump(&record) {
            Ok(path) => {
                let stored = crate::shared::fixedstr::write_fixed(
                    &mut record.result_path,
                    &path.to_string_lossy(),
                );
                match stored {
                    Ok(()) => self.answer(record, status::OK),
                    Err(_) => self.answer(record, status::FAILED),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "dump generation failed");
                self.answer(record, status::FAILED);
            }
        }
    }

    fn handle_set_language(&mut self) {
        let record = self.view.load();
        self.language = record.language();
        self.answer(record, status::OK);
    }

    /// Counts artifacts from earlier runs still sitting in the output
    /// directory, so the owner can offer to (re)send them.
    fn handle_check_backlog(&self) {
        let mut record = self.view.load();
        let uid = record.install_uid();
        let dir = PathBuf::from(record.output_dir());
        let mut count = 0u32;
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(uid.as_str())
                    && (name.ends_with(ST_DUMP_EXT) || name.ends_with(ST_REPORT_EXT))
                {
                    count += 1;
                }
            }
        }
        record.backlog_count = count;
        self.answer(record, status::OK);
    }

    fn write_dump(&self, record: &RendezvousRecord) -> anyhow::Result<PathBuf> {
        let dir = PathBuf::from(record.output_dir());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating dump dir {}", dir.display()))?;
        let name = artifact_file_name(
            &record.install_uid(),
            &record.basename(),
            chrono::Utc::now(),
            ST_DUMP_EXT,
        );
        let path = dir.join(name);
        let file = File::create(&path)
            .with_context(|| format!("creating dump file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        emit_dump(&mut writer, record, &self.language)?;
        writer.flush()?;
        Ok(path)
    }
}

fn drain(fd: &OwnedFd) {
    let mut buf = [0u8; 16];
    // SAFETY: reading into a valid buffer on a non-blocking fd.
    while unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
}

/// Dump layout: fault record and register context first (most likely to
/// matter, least likely to fail), then the owner's /proc state. Each
/// section flushes before the next starts so a failure mid-dump still
/// leaves everything earlier on disk.
fn emit_dump(
    writer: &mut impl Write,
    record: &RendezvousRecord,
    language: &str,
) -> anyhow::Result<()> {
    let snapshot = &record.snapshot;
    writeln!(writer, "shadowtrace memory dump")?;
    writeln!(writer, "language: {language}")?;
    writeln!(writer, "owner-pid: {}", record.owner_pid)?;
    writeln!(writer, "installation: {}", record.install_uid())?;
    writeln!(writer)?;
    writeln!(writer, "signal: {}", snapshot.signum)?;
    writeln!(writer, "code: {}", snapshot.si_code)?;
    writeln!(writer, "fault-address: {:#018x}", snapshot.fault_address)?;
    writeln!(
        writer,
        "instruction-pointer: {:#018x}",
        snapshot.instruction_pointer
    )?;
    writeln!(writer, "stack-pointer: {:#018x}", snapshot.stack_pointer)?;
    writeln!(writer, "faulting-thread: {}", snapshot.faulting_thread)?;
    for (index, value) in snapshot
        .registers
        .iter()
        .take(snapshot.register_count as usize)
        .enumerate()
    {
        writeln!(writer, "r{index:02}: {value:#018x}")?;
    }
    writer.flush()?;

    #[cfg(target_os = "linux")]
    {
        emit_proc_file(writer, record.owner_pid, "status")?;
        emit_proc_file(writer, record.owner_pid, "maps")?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn emit_proc_file(writer: &mut impl Write, pid: u32, leaf: &str) -> anyhow::Result<()> {
    let path = format!("/proc/{pid}/{leaf}");
    writeln!(writer)?;
    writeln!(writer, "-- begin {path} --")?;
    match File::open(&path) {
        Ok(mut file) => {
            let mut buffer = [0u8; 512];
            loop {
                let read_count = file.read(&mut buffer)?;
                if read_count == 0 {
                    break;
                }
                writer.write_all(&buffer[..read_count])?;
            }
        }
        Err(error) => {
            // Unreadable proc entries must not sink the whole dump.
            writeln!(writer, "<unavailable: {error}>")?;
        }
    }
    writeln!(writer, "-- end {path} --")?;
    writer.flush()?;
    Ok(())
}
