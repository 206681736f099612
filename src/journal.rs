// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Best-effort journal (spec 6, design notes 9): truncated and
//! rewritten at each engine state transition. It exists for
//! post-mortem reading, not to resume mid-component -- a half-written
//! component is always redone from byte zero on the next run, so the
//! journal never needs to record an offset within a step.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub const DEFAULT_JOURNAL_PATH: &str = "/var/lib/updater/state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum EngineState {
    Idle,
    Planning,
    Verifying,
    Applying,
    Committing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub state: EngineState,
    pub version: String,
    pub target: String,
    pub current_step: usize,
    pub current_component: Option<String>,
    pub bytes_written: u64,
    pub error_kind: Option<String>,
}

/// Writes `entry` to `path`, truncating whatever was there. Failures
/// are logged and swallowed: losing the journal must never abort an
/// update in progress (spec 9: the journal is informational, the
/// bootloader's active-slot variable is authoritative).
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, entry: &JournalEntry) {
        if let Err(e) = self.try_record(entry) {
            eprintln!("warning: failed to update journal at {}: {e}", self.path.display());
        }
    }

    fn try_record(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entry)?;
        let tmp = self.tmp_path();
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(".tmp");
        PathBuf::from(s)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_and_overwrites_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let journal = Journal::new(&path);

        journal.record(&JournalEntry {
            state: EngineState::Planning,
            version: "1.0".into(),
            target: "B".into(),
            current_step: 0,
            current_component: None,
            bytes_written: 0,
            error_kind: None,
        });
        assert!(path.exists());
        let first = fs::read_to_string(&path).unwrap();
        assert!(first.contains("Planning"));

        journal.record(&JournalEntry {
            state: EngineState::Completed,
            version: "1.0".into(),
            target: "B".into(),
            current_step: 3,
            current_component: None,
            bytes_written: 12345,
            error_kind: None,
        });
        let second = fs::read_to_string(&path).unwrap();
        assert!(second.contains("Completed"));
        assert!(!second.contains("Planning"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_parent_directory_does_not_panic() {
        // a path under a directory the process can't create (permission
        // denied) should log and return, never panic or propagate
        let journal = Journal::new("/proc/does-not-exist/state.json");
        journal.record(&JournalEntry {
            state: EngineState::Failed,
            version: String::new(),
            target: String::new(),
            current_step: 0,
            current_component: None,
            bytes_written: 0,
            error_kind: Some("SourceIOError".into()),
        });
    }
}
