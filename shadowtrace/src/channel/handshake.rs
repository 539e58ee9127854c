// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory handshake with the trace collector.
//!
//! Connecting is a rendezvous between unrelated processes, so every object
//! involved is name-addressed inside a namespace: a connect semaphore
//! serializing attempts (and doubling as the "collector is running" probe),
//! a fixed-layout shared-memory block carrying the negotiation fields, and
//! a data-ready / data-accepted event pair gating each round-trip.
//!
//! Capability transfer is open-by-name: whichever side the result code says
//! created the pipe and flow semaphore, the other side adopts them by
//! opening the paths written into the block.

use crate::shared::fixedstr::FixedStrTooLong;
use shadowtrace_common::sem::{NamedSemaphore, SemError};
use shadowtrace_common::shm::MappedRegion;
use std::path::PathBuf;

pub use crate::shared::fixedstr::{read_fixed, write_fixed};

pub const ST_HS_PATH_MAX: usize = 108;
pub const ST_HS_NAME_MAX: usize = 64;

/// Result codes written by the collector into [`HandshakeArea::result`].
pub mod result_code {
    /// Request written, no verdict yet.
    pub const PENDING: i32 = 0;
    /// Accepted; the collector created the pipe and flow semaphore and the
    /// client adopts them.
    pub const ACCEPT_COLLECTOR_PIPE: i32 = 1;
    /// Accepted; the client must create the pipe and flow semaphore and
    /// publish their names in a second round.
    pub const ACCEPT_CLIENT_PIPE: i32 = 2;
    /// The offered protocol version is not spoken; retry with another.
    pub const REJECT_VERSION: i32 = 3;
    /// Final acknowledgement of a client-created pipe round.
    pub const ESTABLISHED: i32 = 4;
}

/// Fixed-size negotiation record at offset zero of the handshake segment.
///
/// The path and name fields are the Unix rendering of "platform handle":
/// the peer duplicates the capability into its own process by opening the
/// name rather than by kernel handle duplication.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HandshakeArea {
    pub version: i32,
    pub process_id: u32,
    pub result: i32,
    pub granted_budget: u32,
    pub pipe_path: [u8; ST_HS_PATH_MAX],
    pub flow_sem_name: [u8; ST_HS_NAME_MAX],
}

impl HandshakeArea {
    pub fn empty() -> Self {
        Self {
            version: 0,
            process_id: 0,
            result: result_code::PENDING,
            granted_budget: 0,
            pipe_path: [0; ST_HS_PATH_MAX],
            flow_sem_name: [0; ST_HS_NAME_MAX],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Trace channel has no collector namespace configured")]
    NotConfigured,
    #[error("No collector is running")]
    CollectorNotRunning,
    #[error("Handshake timed out")]
    Timeout,
    #[error("Collector rejected every offered protocol version")]
    VersionRejected,
    #[error("Unexpected handshake result code: {0}")]
    Protocol(i32),
    #[error("Name or path does not fit the handshake record")]
    NameTooLong(#[from] FixedStrTooLong),
    #[error("Handshake segment is too small for the negotiation record")]
    BadSegment,
    #[error("Handshake semaphore failure: {0}")]
    Sem(#[from] SemError),
    #[error("Handshake I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Object names

pub fn handshake_shm_name(namespace: &str) -> String {
    format!("/st-hs-{namespace}")
}

pub fn connect_sem_name(namespace: &str) -> String {
    format!("/st-connect-{namespace}")
}

pub fn ready_sem_name(namespace: &str) -> String {
    format!("/st-ready-{namespace}")
}

pub fn accept_sem_name(namespace: &str) -> String {
    format!("/st-accept-{namespace}")
}

pub fn flow_sem_name(namespace: &str) -> String {
    format!("/st-flow-{namespace}")
}

pub fn client_flow_sem_name(namespace: &str, pid: u32) -> String {
    format!("/st-flow-{namespace}-{pid}")
}

pub fn pipe_path(namespace: &str) -> PathBuf {
    std::env::temp_dir().join(format!("st-pipe-{namespace}"))
}

pub fn client_pipe_path(namespace: &str, pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("st-pipe-{namespace}-{pid}"))
}

// ---------------------------------------------------------------------------
// Mapped view

/// Typed, volatile access to the negotiation record. Each load/store moves
/// the whole record; the event semaphores order them between processes.
pub struct HandshakeView {
    region: MappedRegion,
}

impl HandshakeView {
    pub fn new(region: MappedRegion) -> Result<Self, HandshakeError> {
        if region.len() < std::mem::size_of::<HandshakeArea>() {
            return Err(HandshakeError::BadSegment);
        }
        Ok(Self { region })
    }

    pub fn load(&self) -> HandshakeArea {
        // SAFETY: the region is at least one record long and the record is
        // plain old data.
        unsafe { std::ptr::read_volatile(self.region.as_ptr().cast::<HandshakeArea>()) }
    }

    pub fn store(&self, area: &HandshakeArea) {
        // SAFETY: as above; the mapping is writable.
        unsafe { std::ptr::write_volatile(self.region.as_mut_ptr().cast::<HandshakeArea>(), *area) }
    }
}

/// Posts the connect semaphore back when the handshake scope ends, so a
/// failed attempt cannot wedge every later one.
pub struct ConnectSlot<'a>(pub &'a NamedSemaphore);

impl Drop for ConnectSlot<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.0.post() {
            tracing::warn!(%error, "failed to release the collector connect slot");
        }
    }
}
