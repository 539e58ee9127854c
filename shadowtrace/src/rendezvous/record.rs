// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared-memory record handed to the bug-report helper.
//!
//! Created once at startup by the owning process, mapped read/write by the
//! helper, destroyed only at process exit. Every request follows the same
//! shape: the owner fills fields, signals the request event, and the helper
//! answers through `status` (and `result_path`/`backlog_count`) before
//! signalling Done.

use crate::shared::fixedstr::{read_fixed, write_fixed, FixedStrTooLong};
use libc::{siginfo_t, ucontext_t};
use shadowtrace_common::shm::MappedRegion;

pub const ST_RV_LANG_MAX: usize = 64;
pub const ST_RV_PATH_MAX: usize = 256;
pub const ST_RV_NAME_MAX: usize = 64;
pub const ST_RV_UID_MAX: usize = 40;
/// Enough general-purpose registers for any supported architecture.
pub const ST_RV_REG_COUNT: usize = 32;

/// Helper verdict for the most recent request.
pub mod status {
    pub const IDLE: i32 = 0;
    pub const OK: i32 = 1;
    pub const FAILED: i32 = 2;
}

/// Fault record plus register context, filled in the signal handler with no
/// allocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExceptionSnapshot {
    pub signum: i32,
    pub si_code: i32,
    pub fault_address: u64,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub register_count: u32,
    pub registers: [u64; ST_RV_REG_COUNT],
    pub faulting_thread: u64,
}

impl ExceptionSnapshot {
    pub const fn empty() -> Self {
        Self {
            signum: 0,
            si_code: 0,
            fault_address: 0,
            instruction_pointer: 0,
            stack_pointer: 0,
            register_count: 0,
            registers: [0; ST_RV_REG_COUNT],
            faulting_thread: 0,
        }
    }

    /// Captures the fault record out of the raw signal-handler arguments.
    ///
    /// SIGNAL SAFETY:
    ///     Only reads through the provided pointers into plain fields.
    pub fn capture(
        signum: i32,
        sig_info: *const siginfo_t,
        ucontext: *const ucontext_t,
        faulting_thread: u64,
    ) -> Self {
        let mut snapshot = Self::empty();
        snapshot.signum = signum;
        snapshot.faulting_thread = faulting_thread;

        if !sig_info.is_null() {
            // SAFETY: the pointer comes from the signal handler and was
            // checked non-null.
            snapshot.si_code = unsafe { (*sig_info).si_code };
            // https://man7.org/linux/man-pages/man2/sigaction.2.html
            // Only these signals fill si_addr with the faulting address.
            snapshot.fault_address = match signum {
                libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                    // SAFETY: as above.
                    unsafe { (*sig_info).si_addr() as u64 }
                }
                _ => 0,
            };
        }

        if !ucontext.is_null() {
            // SAFETY: the pointer comes from the signal handler and was
            // checked non-null.
            unsafe { snapshot.capture_machine_context(&*ucontext) };
        }
        snapshot
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    unsafe fn capture_machine_context(&mut self, ucontext: &ucontext_t) {
        let gregs = &ucontext.uc_mcontext.gregs;
        self.instruction_pointer = gregs[libc::REG_RIP as usize] as u64;
        self.stack_pointer = gregs[libc::REG_RSP as usize] as u64;
        let count = gregs.len().min(ST_RV_REG_COUNT);
        for (slot, &reg) in self.registers.iter_mut().zip(gregs.iter().take(count)) {
            *slot = reg as u64;
        }
        self.register_count = count as u32;
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe fn capture_machine_context(&mut self, ucontext: &ucontext_t) {
        let mcontext = &ucontext.uc_mcontext;
        self.instruction_pointer = mcontext.pc;
        self.stack_pointer = mcontext.sp;
        let count = mcontext.regs.len().min(ST_RV_REG_COUNT);
        for (slot, &reg) in self.registers.iter_mut().zip(mcontext.regs.iter().take(count)) {
            *slot = reg;
        }
        self.register_count = count as u32;
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    unsafe fn capture_machine_context(&mut self, _ucontext: &ucontext_t) {
        // No register capture on this platform; the fault record alone
        // still produces a useful dump.
    }
}

impl std::fmt::Debug for ExceptionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionSnapshot")
            .field("signum", &self.signum)
            .field("si_code", &self.si_code)
            .field("fault_address", &format_args!("{:#x}", self.fault_address))
            .field(
                "instruction_pointer",
                &format_args!("{:#x}", self.instruction_pointer),
            )
            .field("register_count", &self.register_count)
            .finish()
    }
}

/// The whole shared record. Plain old data; both sides move it with
/// volatile whole-record loads and stores ordered by the event pipes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RendezvousRecord {
    pub version: i32,
    pub owner_pid: u32,
    pub status: i32,
    pub backlog_count: u32,
    pub snapshot: ExceptionSnapshot,
    pub language: [u8; ST_RV_LANG_MAX],
    pub output_dir: [u8; ST_RV_PATH_MAX],
    pub basename: [u8; ST_RV_NAME_MAX],
    pub install_uid: [u8; ST_RV_UID_MAX],
    pub result_path: [u8; ST_RV_PATH_MAX],
}

impl RendezvousRecord {
    pub fn empty() -> Self {
        Self {
            version: 0,
            owner_pid: 0,
            status: status::IDLE,
            backlog_count: 0,
            snapshot: ExceptionSnapshot::empty(),
            language: [0; ST_RV_LANG_MAX],
            output_dir: [0; ST_RV_PATH_MAX],
            basename: [0; ST_RV_NAME_MAX],
            install_uid: [0; ST_RV_UID_MAX],
            result_path: [0; ST_RV_PATH_MAX],
        }
    }

    pub fn language(&self) -> String {
        read_fixed(&self.language)
    }

    pub fn set_language(&mut self, value: &str) -> Result<(), FixedStrTooLong> {
        write_fixed(&mut self.language, value)
    }

    pub fn output_dir(&self) -> String {
        read_fixed(&self.output_dir)
    }

    pub fn basename(&self) -> String {
        read_fixed(&self.basename)
    }

    pub fn install_uid(&self) -> String {
        read_fixed(&self.install_uid)
    }

    pub fn result_path(&self) -> String {
        read_fixed(&self.result_path)
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("Rendezvous segment is too small for the record")]
pub struct BadRecordSegment;

/// Typed, volatile access to the mapped record.
pub struct RecordView {
    region: MappedRegion,
}

impl RecordView {
    pub fn new(region: MappedRegion) -> Result<Self, BadRecordSegment> {
        if region.len() < std::mem::size_of::<RendezvousRecord>() {
            return Err(BadRecordSegment);
        }
        Ok(Self { region })
    }

    pub fn load(&self) -> RendezvousRecord {
        // SAFETY: the region is at least one record long and the record is
        // plain old data.
        unsafe { std::ptr::read_volatile(self.region.as_ptr().cast::<RendezvousRecord>()) }
    }

    pub fn store(&self, record: &RendezvousRecord) {
        // SAFETY: as above; the mapping is writable.
        unsafe {
            std::ptr::write_volatile(self.region.as_mut_ptr().cast::<RendezvousRecord>(), *record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_has_idle_status() {
        let record = RendezvousRecord::empty();
        assert_eq!(record.status, status::IDLE);
        assert_eq!(record.language(), "");
        assert_eq!(record.result_path(), "");
    }

    #[test]
    fn fixed_fields_round_trip_through_the_record() {
        let mut record = RendezvousRecord::empty();
        record.set_language("Deutsch").expect("language");
        assert_eq!(record.language(), "Deutsch");
    }

    #[test]
    fn snapshot_capture_handles_null_pointers() {
        let snapshot =
            ExceptionSnapshot::capture(libc::SIGSEGV, std::ptr::null(), std::ptr::null(), 77);
        assert_eq!(snapshot.signum, libc::SIGSEGV);
        assert_eq!(snapshot.faulting_thread, 77);
        assert_eq!(snapshot.fault_address, 0);
        assert_eq!(snapshot.register_count, 0);
    }

    #[test]
    fn record_is_fixed_size_pod() {
        // The helper maps this across a process boundary; its size must not
        // depend on anything but the declared fields.
        let expected = 16
            + std::mem::size_of::<ExceptionSnapshot>()
            + ST_RV_LANG_MAX
            + ST_RV_PATH_MAX
            + ST_RV_NAME_MAX
            + ST_RV_UID_MAX
            + ST_RV_PATH_MAX;
        assert_eq!(std::mem::size_of::<RendezvousRecord>(), expected);
    }
}
