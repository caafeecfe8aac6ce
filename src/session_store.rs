// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persisted sub-agent session pointer: a plain-text file surviving
//! reconnects so the bridge can resume the same sub-agent conversation.

use std::path::{Path, PathBuf};

pub fn pointer_path() -> PathBuf {
    std::env::temp_dir().join("opencode-session-id")
}

/// Reads the persisted pointer, if any. Absence (or an unreadable file) is
/// "no prior session", not an error.
pub fn load(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn save(path: &Path, session_id: &str) -> std::io::Result<()> {
    std::fs::write(path, session_id)
}

pub fn clear(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opencode-session-id");
        save(&path, "ses_abc123").unwrap();
        assert_eq!(load(&path).as_deref(), Some("ses_abc123"));
    }

    #[test]
    fn absent_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opencode-session-id");
        assert!(load(&path).is_none());
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opencode-session-id");
        save(&path, "ses_abc123").unwrap();
        clear(&path);
        assert!(load(&path).is_none());
    }
}
