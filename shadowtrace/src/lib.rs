// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Crash-resilient diagnostics pipeline.
//!
//! Four cooperating pieces, usable together or alone:
//!
//! * per-thread **shadow call stacks** — bounded, allocation-free trails of
//!   "currently executing" text frames, independent of the CPU stack;
//! * a **trace channel** streaming diagnostic events to an external
//!   collector process under flow control;
//! * an **exception coordinator** that freezes all shadow stacks on a
//!   fatal fault and harvests them into a text report;
//! * a **bug-report rendezvous** handing the fault to an out-of-process
//!   helper that captures a memory dump.
//!
//! Everything hangs off one explicitly constructed
//! [`DiagnosticsContext`]:
//!
//! ```no_run
//! use shadowtrace::{DiagnosticsConfiguration, DiagnosticsContext, FrameArg};
//!
//! # fn main() -> anyhow::Result<()> {
//! let context = DiagnosticsContext::initialize(DiagnosticsConfiguration::default())?;
//! context.launch_helper()?;
//! context.install_crash_handler()?;
//!
//! let _frame = context.frame_guard("OpenFile", &[FrameArg::Str("a.txt")]);
//! // ... the operation this frame describes ...
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod channel;
pub mod context;
pub mod coordinator;
pub mod gate;
pub mod registry;
pub mod rendezvous;
pub mod shared;
pub mod stack;

pub use channel::frame::{TraceEvent, TraceEventKind};
pub use channel::TraceChannel;
pub use context::{DiagnosticsContext, FrameGuard};
pub use coordinator::{disable, enable};
pub use gate::ExceptionGate;
pub use registry::ThreadRegistry;
pub use shared::configuration::{DiagnosticsConfiguration, HelperConfig};
pub use stack::{FrameArg, ShadowStack};
