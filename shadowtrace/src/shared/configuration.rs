// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Signals the coordinator traps when the caller does not supply a list.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGABRT,
        libc::SIGILL,
        libc::SIGFPE,
    ]
}

pub fn signal_from_signum(signum: i32) -> anyhow::Result<Signal> {
    Ok(Signal::try_from(signum)?)
}

/// Process-wide configuration for the diagnostics pipeline, fixed at
/// context construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfiguration {
    // Directory for reports and dumps; None selects the per-user default
    report_dir: Option<PathBuf>,
    report_basename: String,
    // Localization name forwarded to the helper at spawn and via SetLanguage
    language: String,
    // Namespace of the collector's named objects; None disables the channel
    collector_namespace: Option<String>,
    // Helper binary override; None resolves next to the current executable
    helper_path: Option<PathBuf>,
    signals: Vec<i32>,
    timeout: Duration,
    use_reporter_thread: bool,
    // Debug-only escape hatch making rendezvous waits unbounded
    debug_unbounded_waits: bool,
    emit_crash_to_channel: bool,
}

impl DiagnosticsConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        report_dir: Option<PathBuf>,
        report_basename: String,
        language: String,
        collector_namespace: Option<String>,
        helper_path: Option<PathBuf>,
        mut signals: Vec<i32>,
        timeout: Option<Duration>,
        use_reporter_thread: bool,
        debug_unbounded_waits: bool,
        emit_crash_to_channel: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !report_basename.is_empty(),
            "Report basename must not be empty"
        );
        anyhow::ensure!(
            !report_basename.contains(['/', '\0']),
            "Report basename must be a plain file-name component"
        );
        if let Some(namespace) = &collector_namespace {
            anyhow::ensure!(
                !namespace.is_empty() && namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
                "Collector namespace must be non-empty and [A-Za-z0-9-]"
            );
        }
        let timeout = timeout.unwrap_or(constants::ST_DEFAULT_TIMEOUT);
        if signals.is_empty() {
            signals = default_signals();
        } else {
            // Ensure we don't have double elements in the signals list.
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            // Ensure that all signal values translate to a valid signum
            signals
                .iter()
                .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            report_dir,
            report_basename,
            language,
            collector_namespace,
            helper_path,
            signals,
            timeout,
            use_reporter_thread,
            debug_unbounded_waits,
            emit_crash_to_channel,
        })
    }

    pub fn report_dir(&self) -> &Option<PathBuf> {
        &self.report_dir
    }

    pub fn report_basename(&self) -> &str {
        &self.report_basename
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn collector_namespace(&self) -> &Option<String> {
        &self.collector_namespace
    }

    pub fn helper_path(&self) -> &Option<PathBuf> {
        &self.helper_path
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn use_reporter_thread(&self) -> bool {
        self.use_reporter_thread
    }

    pub fn debug_unbounded_waits(&self) -> bool {
        self.debug_unbounded_waits
    }

    pub fn emit_crash_to_channel(&self) -> bool {
        self.emit_crash_to_channel
    }

    pub fn set_language(&mut self, language: String) {
        self.language = language;
    }
}

impl Default for DiagnosticsConfiguration {
    fn default() -> Self {
        Self {
            report_dir: None,
            report_basename: "bugreport".to_string(),
            language: "English".to_string(),
            collector_namespace: None,
            helper_path: None,
            signals: default_signals(),
            timeout: constants::ST_DEFAULT_TIMEOUT,
            use_reporter_thread: true,
            debug_unbounded_waits: false,
            emit_crash_to_channel: true,
        }
    }
}

/// How to launch the bug-report helper process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HelperConfig {
    pub path_to_helper_binary: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stderr_filename: Option<String>,
    pub stdout_filename: Option<String>,
}

impl HelperConfig {
    pub fn new(
        path_to_helper_binary: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        stderr_filename: Option<String>,
        stdout_filename: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            stderr_filename.is_none() && stdout_filename.is_none()
                || stderr_filename != stdout_filename,
            "Can't give the same filename for stderr ({stderr_filename:?})
        and stdout ({stdout_filename:?}), they will conflict with each other"
        );

        Ok(Self {
            path_to_helper_binary,
            args,
            env,
            stderr_filename,
            stdout_filename,
        })
    }
}
