// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Application namespace used for per-user directories and object names.
pub const ST_APP_NAME: &str = "shadowtrace";

/// Name of the bug-report helper binary, looked up next to the current
/// executable.
pub const ST_HELPER_BIN_NAME: &str = "shadowtrace-helper";

// ---------------------------------------------------------------------------
// Shadow stack

/// Byte capacity of one thread's shadow stack arena. Fixed at registration;
/// a full arena drops frames instead of growing.
pub const ST_STACK_CAPACITY: usize = 16 * 1024;

/// Maximum formatted length of one frame, excluding the terminator.
pub const ST_MAX_FRAME_TEXT: usize = 512;

/// NUL terminator plus the trailing little-endian u16 self-length field.
pub const ST_FRAME_OVERHEAD: usize = 3;

/// Substituted when a frame cannot be formatted.
pub const ST_FRAME_PLACEHOLDER: &str = "<unformattable frame>";

/// Substituted when a retained frame's bytes cannot be read back as text.
pub const ST_LINE_PLACEHOLDER: &str = "<unreadable frame>";

// ---------------------------------------------------------------------------
// Thread registry

/// Fixed number of direct-mapped remap-cache slots; must be a power of two.
pub const ST_REMAP_CACHE_SLOTS: usize = 64;

/// Registry table size; dead entries are swept only once this fills up.
pub const ST_MAX_REGISTRY_THREADS: usize = 256;

// ---------------------------------------------------------------------------
// Trace channel

/// Advertised first for backward compatibility with older collectors.
pub const ST_PROTOCOL_VERSION_COMPAT: i32 = 1;

/// Current trace protocol version, offered if the compat version is refused.
pub const ST_PROTOCOL_VERSION: i32 = 3;

/// One flow-control budget unit covers this many bytes on the pipe.
pub const ST_FLOW_UNIT: usize = 1024;

/// Budget units the collector grants a fresh connection.
pub const ST_FLOW_BUDGET_UNITS: u32 = 64;

/// Fixed size of the encoded trace frame header.
pub const ST_FRAME_HEADER_SIZE: usize = 48;

/// Cap on message text per trace frame. Keeps the largest possible frame
/// well under the collector's initial budget grant, so one frame can always
/// make progress.
pub const ST_MAX_TRACE_TEXT: usize = 16 * 1024;

/// Bound on each handshake event wait.
pub const ST_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on acquiring one flow-control unit before probing pipe liveness.
pub const ST_BUDGET_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Rendezvous and crash reporting

/// Version stamped into the rendezvous record for the helper to check.
pub const ST_RENDEZVOUS_VERSION: i32 = 2;

/// Default budget for one rendezvous round-trip with the helper.
pub const ST_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the faulting thread waits for the dedicated reporter thread
/// before generating the report inline.
#[cfg(debug_assertions)]
pub const ST_REPORTER_WAIT: Duration = Duration::from_secs(30);
#[cfg(not(debug_assertions))]
pub const ST_REPORTER_WAIT: Duration = Duration::from_secs(3);

/// Extensions of the two on-disk artifacts.
pub const ST_REPORT_EXT: &str = "txt";
pub const ST_DUMP_EXT: &str = "dmp";
