// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client half of the trace channel.
//!
//! The channel streams diagnostic events to an external collector over a
//! byte pipe, under a flow-control budget drawn from a counting semaphore:
//! one unit per started kilobyte must be held before anything touches the
//! wire. Every transport failure silently tears the connection down;
//! subsequent sends are no-ops until an explicit reconnect.

#[cfg(feature = "collector")]
pub mod collector;
pub mod frame;
pub mod handshake;

use crate::registry::ThreadRegistry;
use crate::shared::constants::{
    ST_BUDGET_WAIT, ST_FLOW_UNIT, ST_HANDSHAKE_TIMEOUT, ST_MAX_TRACE_TEXT, ST_PROTOCOL_VERSION,
    ST_PROTOCOL_VERSION_COMPAT,
};
use frame::{encode_payload, FrameHeader, TraceEvent, WireTimestamp};
use handshake::{result_code, ConnectSlot, HandshakeArea, HandshakeError, HandshakeView};
use shadowtrace_common::sem::{NamedSemaphore, SemError};
use shadowtrace_common::shm::NamedShm;
use shadowtrace_common::timeout::TimeoutManager;
use shadowtrace_common::MutexExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Flow budget wait failed: {0}")]
    Budget(#[from] SemError),
    #[error("Pipe write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("Collector end of the pipe is gone")]
    PeerGone,
}

struct Connection {
    pipe: File,
    flow: NamedSemaphore,
    /// Budget units acquired but not yet spent on wire bytes.
    credit_units: u32,
    /// Origin of the high-resolution counter stamped into headers.
    epoch: Instant,
    /// Set when this side created the pipe and must unlink it on teardown.
    owned_pipe_path: Option<PathBuf>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(path) = &self.owned_pipe_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Client endpoint. One per context; concurrent senders serialize on the
/// internal lock so header/payload pairs are never interleaved on the wire.
pub struct TraceChannel {
    namespace: Option<String>,
    state: Mutex<Option<Connection>>,
}

impl TraceChannel {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace,
            state: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock_or_panic().is_some()
    }

    /// Runs the shared-memory handshake against a running collector.
    /// Version negotiation is two-phase: the backward-compatible version is
    /// offered first and the current one once on rejection. Any timeout or
    /// rejection leaves the channel disconnected.
    pub fn connect(&self) -> Result<(), HandshakeError> {
        let namespace = self
            .namespace
            .as_deref()
            .ok_or(HandshakeError::NotConfigured)?;
        let mut state = self.state.lock_or_panic();
        if state.is_some() {
            return Ok(());
        }
        ignore_sigpipe();
        *state = Some(establish(namespace)?);
        Ok(())
    }

    pub fn disconnect(&self) {
        *self.state.lock_or_panic() = None;
    }

    /// Emits exactly one frame. A disconnected channel makes this a no-op;
    /// a failing transport disconnects and swallows the frame, per the
    /// channel's error taxonomy.
    pub fn send(&self, registry: &ThreadRegistry, event: &TraceEvent<'_>) {
        let mut state = self.state.lock_or_panic();
        self.send_locked(&mut state, registry, event);
    }

    /// Crash-path variant: never blocks on a contended channel lock.
    pub fn try_send(&self, registry: &ThreadRegistry, event: &TraceEvent<'_>) {
        if let Ok(mut state) = self.state.try_lock() {
            self.send_locked(&mut state, registry, event);
        }
    }

    fn send_locked(
        &self,
        state: &mut Option<Connection>,
        registry: &ThreadRegistry,
        event: &TraceEvent<'_>,
    ) {
        let Some(connection) = state.as_mut() else {
            return;
        };
        if let Err(error) = send_on(connection, registry, event) {
            tracing::debug!(%error, "trace send failed; disconnecting channel");
            *state = None;
        }
    }
}

impl std::fmt::Debug for TraceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceChannel")
            .field("namespace", &self.namespace)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection establishment

fn establish(namespace: &str) -> Result<Connection, HandshakeError> {
    let connect_sem = match NamedSemaphore::open(&handshake::connect_sem_name(namespace)) {
        Ok(sem) => sem,
        Err(SemError::NotFound) => return Err(HandshakeError::CollectorNotRunning),
        Err(error) => return Err(error.into()),
    };
    connect_sem
        .timed_wait(ST_HANDSHAKE_TIMEOUT)
        .map_err(|error| match error {
            SemError::Timeout => HandshakeError::Timeout,
            other => other.into(),
        })?;
    let _slot = ConnectSlot(&connect_sem);

    let shm = NamedShm::open(&handshake::handshake_shm_name(namespace))?;
    let view = HandshakeView::new(shm.map()?)?;
    let ready = NamedSemaphore::open(&handshake::ready_sem_name(namespace))?;
    let accepted = NamedSemaphore::open(&handshake::accept_sem_name(namespace))?;

    let mut reply = offer_version(&view, &ready, &accepted, ST_PROTOCOL_VERSION_COMPAT)?;
    if reply.result == result_code::REJECT_VERSION {
        reply = offer_version(&view, &ready, &accepted, ST_PROTOCOL_VERSION)?;
    }

    let timeout = TimeoutManager::new(ST_HANDSHAKE_TIMEOUT);
    match reply.result {
        result_code::ACCEPT_COLLECTOR_PIPE => {
            // Adopt the collector's pipe and semaphore by name.
            let pipe_path = PathBuf::from(handshake::read_fixed(&reply.pipe_path));
            let flow = NamedSemaphore::open(&handshake::read_fixed(&reply.flow_sem_name))?;
            let pipe = open_pipe_writer(&pipe_path, &timeout)?;
            Ok(Connection {
                pipe,
                flow,
                credit_units: 0,
                epoch: Instant::now(),
                owned_pipe_path: None,
            })
        }
        result_code::ACCEPT_CLIENT_PIPE => {
            establish_client_pipe(namespace, &view, &ready, &accepted, &timeout)
        }
        result_code::REJECT_VERSION => Err(HandshakeError::VersionRejected),
        other => Err(HandshakeError::Protocol(other)),
    }
}

fn offer_version(
    view: &HandshakeView,
    ready: &NamedSemaphore,
    accepted: &NamedSemaphore,
    version: i32,
) -> Result<HandshakeArea, HandshakeError> {
    let mut area = HandshakeArea::empty();
    area.version = version;
    area.process_id = std::process::id();
    view.store(&area);
    ready.post()?;
    accepted
        .timed_wait(ST_HANDSHAKE_TIMEOUT)
        .map_err(|error| match error {
            SemError::Timeout => HandshakeError::Timeout,
            other => other.into(),
        })?;
    Ok(view.load())
}

/// The branch where the result code put pipe creation on our side: publish
/// the names of freshly created objects and wait for the collector to adopt
/// them.
fn establish_client_pipe(
    namespace: &str,
    view: &HandshakeView,
    ready: &NamedSemaphore,
    accepted: &NamedSemaphore,
    timeout: &TimeoutManager,
) -> Result<Connection, HandshakeError> {
    let pid = std::process::id();
    let pipe_path = handshake::client_pipe_path(namespace, pid);
    let _ = std::fs::remove_file(&pipe_path);
    nix::unistd::mkfifo(&pipe_path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
        .map_err(std::io::Error::from)?;
    let flow_name = handshake::client_flow_sem_name(namespace, pid);
    let _ = NamedSemaphore::unlink(&flow_name);
    let flow = NamedSemaphore::create(&flow_name, crate::shared::constants::ST_FLOW_BUDGET_UNITS)?;

    let mut area = view.load();
    area.result = result_code::PENDING;
    area.granted_budget = crate::shared::constants::ST_FLOW_BUDGET_UNITS;
    handshake::write_fixed(&mut area.pipe_path, &pipe_path.to_string_lossy())?;
    handshake::write_fixed(&mut area.flow_sem_name, &flow_name)?;
    view.store(&area);
    ready.post()?;
    accepted
        .timed_wait(ST_HANDSHAKE_TIMEOUT)
        .map_err(|error| match error {
            SemError::Timeout => HandshakeError::Timeout,
            other => other.into(),
        })?;
    let reply = view.load();
    if reply.result != result_code::ESTABLISHED {
        let _ = std::fs::remove_file(&pipe_path);
        return Err(HandshakeError::Protocol(reply.result));
    }

    let pipe = open_pipe_writer(&pipe_path, timeout)?;
    Ok(Connection {
        pipe,
        flow,
        credit_units: 0,
        epoch: Instant::now(),
        owned_pipe_path: Some(pipe_path),
    })
}

/// Opens the write end of a FIFO, bounded. ENXIO means the reader has not
/// opened its end yet; that resolves within the handshake timeout or not at
/// all.
fn open_pipe_writer(path: &Path, timeout: &TimeoutManager) -> Result<File, HandshakeError> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                clear_nonblocking(&file)?;
                return Ok(file);
            }
            Err(error) if error.raw_os_error() == Some(libc::ENXIO) => {
                if timeout.expired() {
                    return Err(HandshakeError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn clear_nonblocking(file: &File) -> std::io::Result<()> {
    // SAFETY: fd is open; F_GETFL/F_SETFL have no other preconditions.
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Writes to a torn-down FIFO raise SIGPIPE, which would kill the process
/// over a diagnostics failure; turn those into plain EPIPE errors instead.
fn ignore_sigpipe() {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        // SAFETY: installing SIG_IGN for SIGPIPE has no preconditions.
        let _ = unsafe {
            signal::sigaction(
                signal::SIGPIPE,
                &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
            )
        };
    });
}

// ---------------------------------------------------------------------------
// Frame emission

fn send_on(
    connection: &mut Connection,
    registry: &ThreadRegistry,
    event: &TraceEvent<'_>,
) -> Result<(), SendError> {
    // Clamp the text so a single frame always fits the collector's initial
    // budget grant and can make progress.
    let event = TraceEvent {
        message: clamp_str(event.message, ST_MAX_TRACE_TEXT),
        ..*event
    };
    let event = &event;
    let (payload, text_offset) = encode_payload(event);
    let os_id = shadowtrace_common::threading::get_current_thread_id();
    let header = FrameHeader {
        kind: event.kind as i32,
        thread_id: os_id as u32,
        remapped_id: registry.lookup(os_id).unwrap_or(0),
        timestamp: WireTimestamp::from_datetime(chrono::Utc::now()),
        payload_size: payload.len() as u32,
        text_offset,
        source_line: event.source_line,
        counter: connection.epoch.elapsed().as_secs_f64(),
    };
    let encoded_header = header.encode();

    let total = encoded_header.len() + payload.len();
    let units_needed = total.div_ceil(ST_FLOW_UNIT) as u32;
    acquire_budget(connection, units_needed)?;

    connection.pipe.write_all(&encoded_header)?;
    connection.pipe.write_all(&payload)?;
    connection.pipe.flush()?;
    connection.credit_units -= units_needed;
    Ok(())
}

/// Draws budget units one at a time. A unit wait that times out probes the
/// pipe before waiting again, so a dead collector is detected instead of
/// blocking indefinitely; a merely slow collector keeps exercising
/// backpressure.
fn acquire_budget(connection: &mut Connection, units_needed: u32) -> Result<(), SendError> {
    while connection.credit_units < units_needed {
        match connection.flow.timed_wait(ST_BUDGET_WAIT) {
            Ok(()) => connection.credit_units += 1,
            Err(SemError::Timeout) => probe_pipe(&connection.pipe)?,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

fn clamp_str(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// Zero-length write probe: transfers nothing, but surfaces a torn-down
/// pipe either as a write error or as POLLERR on the write end.
fn probe_pipe(pipe: &File) -> Result<(), SendError> {
    // SAFETY: a zero-length write touches no buffer.
    let rc = unsafe { libc::write(pipe.as_raw_fd(), std::ptr::null(), 0) };
    if rc < 0 {
        return Err(SendError::PeerGone);
    }
    let mut pfd = libc::pollfd {
        fd: pipe.as_raw_fd(),
        events: 0,
        revents: 0,
    };
    // SAFETY: pfd is valid for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc > 0 && pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        return Err(SendError::PeerGone);
    }
    Ok(())
}
