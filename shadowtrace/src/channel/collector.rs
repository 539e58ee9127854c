// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference trace-collector service, the receiving half of the channel.
//!
//! Owns the namespace's handshake objects, negotiates protocol versions,
//! and drains frames off the pipe, posting flow-control budget back as it
//! goes. The `trace-collector` binary wraps this; tests use it in-process
//! to exercise the client against a real peer.

use crate::channel::frame::{decode_payload, DecodedFrame, FrameHeader};
use crate::channel::handshake::{
    self, result_code, HandshakeArea, HandshakeView,
};
use crate::shared::constants::{
    ST_FLOW_BUDGET_UNITS, ST_FLOW_UNIT, ST_FRAME_HEADER_SIZE, ST_PROTOCOL_VERSION,
};
use anyhow::Context;
use shadowtrace_common::sem::NamedSemaphore;
use shadowtrace_common::shm::NamedShm;
use shadowtrace_common::timeout::TimeoutManager;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of a session creates the pipe and flow semaphore. The
/// handshake result code communicates the choice to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    CollectorOwns,
    ClientCreates,
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub pipe_mode: PipeMode,
    pub accepted_versions: Vec<i32>,
    pub granted_units: u32,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            pipe_mode: PipeMode::CollectorOwns,
            accepted_versions: vec![ST_PROTOCOL_VERSION],
            granted_units: ST_FLOW_BUDGET_UNITS,
        }
    }
}

/// A bound collector: handshake objects exist, clients can knock.
pub struct TraceCollector {
    namespace: String,
    options: CollectorOptions,
    view: HandshakeView,
    ready: NamedSemaphore,
    accepted: NamedSemaphore,
    // Held for their unlink-on-drop side effects.
    _connect_sem: NamedSemaphore,
    _shm: NamedShm,
}

impl TraceCollector {
    pub fn bind(namespace: &str) -> anyhow::Result<Self> {
        Self::bind_with(namespace, CollectorOptions::default())
    }

    pub fn bind_with(namespace: &str, options: CollectorOptions) -> anyhow::Result<Self> {
        // Sweep leftovers of a previous collector that died without cleanup.
        let _ = NamedSemaphore::unlink(&handshake::connect_sem_name(namespace));
        let _ = NamedSemaphore::unlink(&handshake::ready_sem_name(namespace));
        let _ = NamedSemaphore::unlink(&handshake::accept_sem_name(namespace));
        let _ = NamedSemaphore::unlink(&handshake::flow_sem_name(namespace));
        NamedShm::unlink(&handshake::handshake_shm_name(namespace))?;

        let shm = NamedShm::create(
            &handshake::handshake_shm_name(namespace),
            std::mem::size_of::<HandshakeArea>(),
        )
        .context("creating handshake segment")?;
        let view = HandshakeView::new(shm.map()?)?;
        view.store(&HandshakeArea::empty());

        let connect_sem = NamedSemaphore::create(&handshake::connect_sem_name(namespace), 1)?;
        let ready = NamedSemaphore::create(&handshake::ready_sem_name(namespace), 0)?;
        let accepted = NamedSemaphore::create(&handshake::accept_sem_name(namespace), 0)?;

        Ok(Self {
            namespace: namespace.to_owned(),
            options,
            view,
            ready,
            accepted,
            _connect_sem: connect_sem,
            _shm: shm,
        })
    }

    /// Serves handshake rounds until a session is established or the budget
    /// runs out. Unsupported versions are answered with a rejection and the
    /// wait continues, which is the collector side of the client's
    /// two-phase offer.
    pub fn accept(&self, budget: Duration) -> anyhow::Result<TraceSession> {
        let timeout = TimeoutManager::new(budget);
        loop {
            anyhow::ensure!(!timeout.expired(), "timed out waiting for a client");
            self.ready
                .timed_wait(timeout.remaining())
                .context("waiting for a handshake request")?;
            let mut area = self.view.load();

            if !self.options.accepted_versions.contains(&area.version) {
                tracing::debug!(version = area.version, "rejecting offered protocol version");
                area.result = result_code::REJECT_VERSION;
                self.view.store(&area);
                self.accepted.post()?;
                continue;
            }

            let peer_pid = area.process_id;
            return match self.options.pipe_mode {
                PipeMode::CollectorOwns => self.establish_own_pipe(area, peer_pid),
                PipeMode::ClientCreates => self.establish_client_pipe(area, peer_pid, &timeout),
            };
        }
    }

    fn establish_own_pipe(
        &self,
        mut area: HandshakeArea,
        peer_pid: u32,
    ) -> anyhow::Result<TraceSession> {
        let pipe_path = handshake::pipe_path(&self.namespace);
        let _ = std::fs::remove_file(&pipe_path);
        nix::unistd::mkfifo(
            &pipe_path,
            nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
        )
        .context("creating trace pipe")?;
        let flow_name = handshake::flow_sem_name(&self.namespace);
        // A previous session's semaphore may still carry stale budget.
        let _ = NamedSemaphore::unlink(&flow_name);
        let flow = NamedSemaphore::create(&flow_name, self.options.granted_units)?;

        area.result = result_code::ACCEPT_COLLECTOR_PIPE;
        area.granted_budget = self.options.granted_units;
        handshake::write_fixed(&mut area.pipe_path, &pipe_path.to_string_lossy())?;
        handshake::write_fixed(&mut area.flow_sem_name, &flow_name)?;
        self.view.store(&area);

        // Open the read end before answering so the client's write-end open
        // cannot race a missing reader.
        let pipe = open_pipe_reader(&pipe_path)?;
        self.accepted.post()?;

        Ok(TraceSession {
            pipe,
            flow,
            owned_pipe_path: Some(pipe_path),
            peer_pid,
            saw_writer: false,
        })
    }

    fn establish_client_pipe(
        &self,
        mut area: HandshakeArea,
        peer_pid: u32,
        timeout: &TimeoutManager,
    ) -> anyhow::Result<TraceSession> {
        area.result = result_code::ACCEPT_CLIENT_PIPE;
        self.view.store(&area);
        self.accepted.post()?;

        // Second round: the client publishes the names of what it created.
        self.ready
            .timed_wait(timeout.remaining())
            .context("waiting for client-created pipe names")?;
        let mut area = self.view.load();
        let pipe_path = PathBuf::from(handshake::read_fixed(&area.pipe_path));
        let flow = NamedSemaphore::open(&handshake::read_fixed(&area.flow_sem_name))?;
        let pipe = open_pipe_reader(&pipe_path)?;

        area.result = result_code::ESTABLISHED;
        self.view.store(&area);
        self.accepted.post()?;

        Ok(TraceSession {
            pipe,
            flow,
            // The client created it; the client unlinks it.
            owned_pipe_path: None,
            peer_pid,
            saw_writer: false,
        })
    }
}

fn open_pipe_reader(path: &std::path::Path) -> anyhow::Result<File> {
    // A non-blocking read-end open succeeds with no writer present.
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening trace pipe {}", path.display()))
}

/// One established client connection.
pub struct TraceSession {
    pipe: File,
    flow: NamedSemaphore,
    owned_pipe_path: Option<PathBuf>,
    peer_pid: u32,
    /// A FIFO read end reports EOF until the first writer opens it; only
    /// after bytes have flowed does EOF mean the client went away.
    saw_writer: bool,
}

impl TraceSession {
    pub fn peer_pid(&self) -> u32 {
        self.peer_pid
    }

    /// Reads and decodes the next frame, posting the consumed flow-control
    /// units back once the frame is off the pipe. `Ok(None)` means the
    /// writer closed cleanly between frames.
    pub fn read_frame(&mut self, budget: Duration) -> anyhow::Result<Option<DecodedFrame>> {
        let timeout = TimeoutManager::new(budget);
        let mut header_buf = [0u8; ST_FRAME_HEADER_SIZE];
        if !read_exact_bounded(&mut self.pipe, &mut header_buf, &timeout, &mut self.saw_writer)? {
            return Ok(None);
        }
        let header = FrameHeader::decode(&header_buf);
        anyhow::ensure!(
            header.payload_size as usize <= 1024 * 1024,
            "implausible payload size {}",
            header.payload_size
        );

        let mut payload = vec![0u8; header.payload_size as usize];
        anyhow::ensure!(
            read_exact_bounded(&mut self.pipe, &mut payload, &timeout, &mut self.saw_writer)?,
            "pipe closed in the middle of a frame"
        );

        let consumed =
            (ST_FRAME_HEADER_SIZE + header.payload_size as usize).div_ceil(ST_FLOW_UNIT);
        for _ in 0..consumed {
            self.flow.post()?;
        }

        Ok(Some(decode_payload(&header, &payload)?))
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Some(path) = &self.owned_pipe_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Fills `buf` from a non-blocking pipe, sleeping on poll between short
/// reads. Returns false on a clean EOF before the first byte.
fn read_exact_bounded(
    pipe: &mut File,
    buf: &mut [u8],
    timeout: &TimeoutManager,
    writer_seen: &mut bool,
) -> anyhow::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => {
                if !*writer_seen {
                    // No writer has opened the FIFO yet; this is "not
                    // connected", not "closed".
                    if timeout.expired() {
                        return Ok(false);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                anyhow::ensure!(filled == 0, "pipe closed mid-read at offset {filled}");
                return Ok(false);
            }
            Ok(n) => {
                *writer_seen = true;
                filled += n;
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                anyhow::ensure!(!timeout.expired(), "timed out reading from the trace pipe");
                let _ = shadowtrace_common::unix::wait_any(&[pipe.as_raw_fd()], timeout);
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame::{TraceEvent, TraceEventKind};
    use crate::channel::TraceChannel;
    use crate::registry::ThreadRegistry;
    use crate::stack::tls::StackCell;
    use std::sync::Arc;

    fn test_namespace(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn narrow_event(message: &str) -> TraceEvent<'_> {
        TraceEvent {
            kind: TraceEventKind::Narrow,
            source_path: "src/panel/files.rs",
            source_line: 42,
            message,
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn connect_fails_fast_without_collector() {
        let channel = TraceChannel::new(Some(test_namespace("nobody")));
        let started = std::time::Instant::now();
        let error = channel.connect().unwrap_err();
        assert!(matches!(
            error,
            crate::channel::handshake::HandshakeError::CollectorNotRunning
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!channel.is_connected());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn unconfigured_channel_send_is_a_noop() {
        let channel = TraceChannel::new(None);
        let registry = ThreadRegistry::new();
        channel.send(&registry, &narrow_event("dropped on the floor"));
        assert!(!channel.is_connected());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn two_phase_handshake_and_mixed_encodings_round_trip() {
        let namespace = test_namespace("roundtrip");
        let collector = TraceCollector::bind(&namespace).expect("bind");
        let server = std::thread::spawn(move || {
            let mut session = collector.accept(Duration::from_secs(5)).expect("accept");
            let first = session
                .read_frame(Duration::from_secs(5))
                .expect("read")
                .expect("frame");
            let second = session
                .read_frame(Duration::from_secs(5))
                .expect("read")
                .expect("frame");
            (session.peer_pid(), first, second)
        });

        let channel = TraceChannel::new(Some(namespace));
        // The default collector speaks only the current version, so this
        // connect exercises the reject-compat-then-retry path.
        channel.connect().expect("connect");
        assert!(channel.is_connected());

        let registry = ThreadRegistry::new();
        let os_id = shadowtrace_common::threading::get_current_thread_id();
        let small_id = registry
            .register(os_id, Arc::new(StackCell::new(os_id)))
            .expect("register");

        channel.send(&registry, &narrow_event("narrow text"));
        channel.send(
            &registry,
            &TraceEvent {
                kind: TraceEventKind::Wide,
                source_path: "core/io.rs",
                source_line: 7,
                message: "wide-тext",
            },
        );
        assert!(channel.is_connected());

        let (peer_pid, first, second) = server.join().expect("server");
        assert_eq!(peer_pid, std::process::id());
        assert_eq!(first.message, "narrow text");
        assert_eq!(first.source_path, "src/panel/files.rs");
        assert_eq!(first.header.remapped_id, small_id);
        assert_eq!(first.header.source_line, 42);
        assert_eq!(second.message, "wide-тext");
        assert_eq!(second.header.kind, TraceEventKind::Wide as i32);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn client_created_pipe_mode_round_trips() {
        let namespace = test_namespace("clientpipe");
        let collector = TraceCollector::bind_with(
            &namespace,
            CollectorOptions {
                pipe_mode: PipeMode::ClientCreates,
                ..CollectorOptions::default()
            },
        )
        .expect("bind");
        let server = std::thread::spawn(move || {
            let mut session = collector.accept(Duration::from_secs(5)).expect("accept");
            session
                .read_frame(Duration::from_secs(5))
                .expect("read")
                .expect("frame")
        });

        let channel = TraceChannel::new(Some(namespace));
        channel.connect().expect("connect");
        let registry = ThreadRegistry::new();
        channel.send(&registry, &narrow_event("over my own pipe"));

        let frame = server.join().expect("server");
        assert_eq!(frame.message, "over my own pipe");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn flow_control_blocks_and_frames_never_interleave() {
        let namespace = test_namespace("flow");
        // Budget of 8 KiB against ~3 KiB frames: senders must stall until
        // the collector drains and reposts units.
        let collector = TraceCollector::bind_with(
            &namespace,
            CollectorOptions {
                granted_units: 8,
                ..CollectorOptions::default()
            },
        )
        .expect("bind");
        const FRAMES_PER_SENDER: usize = 4;
        let server = std::thread::spawn(move || {
            let mut session = collector.accept(Duration::from_secs(5)).expect("accept");
            let mut frames = Vec::new();
            for _ in 0..2 * FRAMES_PER_SENDER {
                // Delay draining a little so senders actually hit the
                // budget wait.
                std::thread::sleep(Duration::from_millis(20));
                frames.push(
                    session
                        .read_frame(Duration::from_secs(10))
                        .expect("read")
                        .expect("frame"),
                );
            }
            frames
        });

        let channel = Arc::new(TraceChannel::new(Some(namespace)));
        channel.connect().expect("connect");
        let registry = Arc::new(ThreadRegistry::new());

        let senders: Vec<_> = ["alpha", "bravo"]
            .into_iter()
            .map(|tag| {
                let channel = Arc::clone(&channel);
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let body = tag.repeat(600); // ~3 KiB
                    for _ in 0..FRAMES_PER_SENDER {
                        channel.send(&registry, &narrow_event(&body));
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender");
        }
        assert!(channel.is_connected(), "no send may have torn the channel");

        let frames = server.join().expect("server");
        assert_eq!(frames.len(), 2 * FRAMES_PER_SENDER);
        for frame in &frames {
            // An interleaved payload would not decode into a pure run of
            // one sender's tag.
            let body = &frame.message;
            assert!(
                body.chars().count() == 600 * 5
                    && (body.starts_with("alpha") || body.starts_with("bravo")),
                "corrupted frame body"
            );
            let tag = &body[..5];
            assert!(body.as_bytes().chunks(5).all(|c| c == tag.as_bytes()));
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn collector_death_tears_the_channel_down() {
        let namespace = test_namespace("teardown");
        let collector = TraceCollector::bind(&namespace).expect("bind");
        let server = std::thread::spawn(move || {
            let session = collector.accept(Duration::from_secs(5)).expect("accept");
            // Die without reading anything.
            drop(session);
        });

        let channel = TraceChannel::new(Some(namespace));
        channel.connect().expect("connect");
        server.join().expect("server");

        let registry = ThreadRegistry::new();
        // The first sends may still land in the pipe buffer; the teardown
        // must be detected within a few attempts.
        for _ in 0..8 {
            if !channel.is_connected() {
                break;
            }
            channel.send(&registry, &narrow_event("into the void"));
        }
        assert!(!channel.is_connected());

        // Disconnected sends are silent no-ops.
        channel.send(&registry, &narrow_event("still silent"));
    }
}
