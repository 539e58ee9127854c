// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use std::fs;
use std::path::Path;
use uuid::Uuid;

const UID_FILE_NAME: &str = "installation-id";

/// Returns the stable per-installation UID, generating and persisting it the
/// first time it is needed. The UID prefixes every report and dump name so
/// artifacts from one installation can be correlated across crashes.
pub fn installation_uid(app: &str) -> anyhow::Result<String> {
    installation_uid_at(&crate::paths::default_config_dir(app))
}

/// Same as [`installation_uid`], rooted at an explicit directory.
pub fn installation_uid_at(dir: &Path) -> anyhow::Result<String> {
    let path = dir.join(UID_FILE_NAME);
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if Uuid::parse_str(trimmed).is_ok() {
            return Ok(trimmed.to_owned());
        }
        // Corrupt contents; fall through and regenerate.
    }

    let fresh = Uuid::new_v4().to_string();
    fs::create_dir_all(dir)
        .with_context(|| format!("creating config dir {}", dir.display()))?;
    fs::write(&path, &fresh)
        .with_context(|| format!("persisting installation uid to {}", path.display()))?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_is_generated_once_and_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = installation_uid_at(dir.path()).expect("first");
        let second = installation_uid_at(dir.path()).expect("second");
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn corrupt_uid_file_is_regenerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(UID_FILE_NAME), "not-a-uuid").expect("write");
        let uid = installation_uid_at(dir.path()).expect("uid");
        assert!(Uuid::parse_str(&uid).is_ok());
        let persisted = fs::read_to_string(dir.path().join(UID_FILE_NAME)).expect("read");
        assert_eq!(persisted, uid);
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        let uid = installation_uid_at(&nested).expect("uid");
        assert!(Uuid::parse_str(&uid).is_ok());
    }
}
