// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Per-user directory where reports and dumps land, e.g.
/// `~/.local/share/<app>` on Linux. Falls back to the home directory, then
/// to the system temp dir, so report generation always has somewhere to
/// write.
pub fn default_report_dir(app: &str) -> PathBuf {
    if let Some(path) = dirs::data_local_dir() {
        return path.join(app);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(format!(".{app}"));
    }
    std::env::temp_dir().join(app)
}

/// Per-user configuration directory, where the installation UID persists.
pub fn default_config_dir(app: &str) -> PathBuf {
    if let Some(path) = dirs::config_dir() {
        return path.join(app);
    }
    default_report_dir(app)
}

/// Canonical artifact name: `<installation-UID>-<base-name>-<date>-<time>.<ext>`.
/// Both the text report and the helper's dump use this, so the two halves of
/// one crash sort next to each other.
pub fn artifact_file_name(uid: &str, base: &str, timestamp: DateTime<Utc>, ext: &str) -> String {
    format!(
        "{uid}-{base}-{}-{}.{ext}",
        timestamp.format("%Y%m%d"),
        timestamp.format("%H%M%S")
    )
}
