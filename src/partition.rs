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

//! `PartitionWriter` (spec 4.3): the append-only `Writer` side of the
//! pipeline. Opens a block device or a regular file, tracks bytes
//! written, and fsyncs on a configurable byte cadence plus once more at
//! the end.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::InstallError;

/// Append-only from the caller's perspective; seeking is not part of
/// the contract (spec 4.1). A destructor is not enough to report a
/// failed close reliably, so callers that care must call `fsync_now`
/// explicitly before dropping -- which the pipeline always does at EOF.
pub trait Writer {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    fn fsync_now(&mut self) -> Result<()>;
    fn bytes_written(&self) -> u64;
}

pub struct PartitionWriter {
    file: File,
    bytes_written: u64,
    since_last_fsync: u64,
    fsync_interval_bytes: u64,
    failed: bool,
}

impl PartitionWriter {
    /// Opens `path` for writing. Block devices (paths starting with
    /// `/dev/`) are opened without truncation -- a device node has a
    /// fixed size and there's nothing to truncate. Everything else
    /// (the `file`-type component's `.tmp` staging path) is created and
    /// truncated, since it's meant to be written fresh each time.
    pub fn open(path: impl AsRef<Path>, fsync_interval_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        let is_device = path.to_string_lossy().starts_with("/dev/");
        let file = if is_device {
            OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("opening block device {}", path.display()))?
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("creating file {}", path.display()))?
        };
        Ok(Self {
            file,
            bytes_written: 0,
            since_last_fsync: 0,
            fsync_interval_bytes,
            failed: false,
        })
    }
}

impl Writer for PartitionWriter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failed {
            // On any write error, do not attempt further writes (spec 4.3).
            return Err(InstallError::DestinationIoError(
                "write attempted after a previous write failed".into(),
            )
            .into());
        }
        if let Err(e) = self.file.write_all(bytes) {
            self.failed = true;
            return Err(InstallError::DestinationIoError(e.to_string()).into());
        }
        self.bytes_written += bytes.len() as u64;
        self.since_last_fsync += bytes.len() as u64;

        if self.fsync_interval_bytes > 0 {
            while self.since_last_fsync >= self.fsync_interval_bytes {
                self.since_last_fsync -= self.fsync_interval_bytes;
                self.sync()?;
            }
        }
        Ok(())
    }

    fn fsync_now(&mut self) -> Result<()> {
        self.since_last_fsync = 0;
        self.sync()
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl PartitionWriter {
    fn sync(&mut self) -> Result<()> {
        if self.failed {
            return Err(InstallError::DestinationIoError("writer already failed".into()).into());
        }
        self.file.sync_all().map_err(|e| {
            self.failed = true;
            InstallError::DestinationIoError(format!("fsync failed: {e}"))
        })?;
        Ok(())
    }
}

/// In-memory `Writer` used by tests (spec 8's memory-backed destination)
/// and by anything that wants to assert byte fidelity or fsync cadence
/// without touching a real filesystem.
pub struct MemoryWriter {
    pub data: Vec<u8>,
    pub fsync_calls: u32,
    fail_after: Option<u64>,
    failed: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            fsync_calls: 0,
            fail_after: None,
            failed: false,
        }
    }

    pub fn failing_after(bytes: u64) -> Self {
        Self {
            data: Vec::new(),
            fsync_calls: 0,
            fail_after: Some(bytes),
            failed: false,
        }
    }
}

impl Default for MemoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for MemoryWriter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failed {
            return Err(InstallError::DestinationIoError("writer already failed".into()).into());
        }
        if let Some(limit) = self.fail_after {
            if self.data.len() as u64 + bytes.len() as u64 > limit {
                let allowed = (limit - self.data.len() as u64) as usize;
                self.data.extend_from_slice(&bytes[..allowed]);
                self.failed = true;
                return Err(InstallError::DestinationIoError(
                    "simulated write failure".into(),
                )
                .into());
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn fsync_now(&mut self) -> Result<()> {
        if self.failed {
            return Err(InstallError::DestinationIoError("writer already failed".into()).into());
        }
        self.fsync_calls += 1;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Silences "unused" when building without touching real files; kept
/// because `io::Write for MemoryWriter` is convenient for tests that
/// want to go through a generic `Write` bound instead of our `Writer`
/// trait.
impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsync_cadence_matches_interval() {
        // S2: 3 MiB + 10 bytes, 1 MiB interval -> 3 interval + 1 final = 4
        let mut w = MemoryWriter::new();
        let chunk = vec![0xABu8; 1024 * 1024];
        for _ in 0..3 {
            w.write_all(&chunk).unwrap();
            w.fsync_now().unwrap();
        }
        w.write_all(&[0xAB; 10]).unwrap();
        w.fsync_now().unwrap();
        assert_eq!(w.fsync_calls, 4);
        assert_eq!(w.bytes_written(), 3 * 1024 * 1024 + 10);
    }

    #[test]
    fn mid_write_failure_preserves_prefix() {
        // S3: writer fails at 2.5 MiB into an 8 MiB input
        let fail_at = 2 * 1024 * 1024 + 512 * 1024;
        let mut w = MemoryWriter::failing_after(fail_at);
        let data = vec![0x5Au8; 8 * 1024 * 1024];
        let chunk_size = 64 * 1024;
        let mut failed = false;
        for chunk in data.chunks(chunk_size) {
            if w.write_all(chunk).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert_eq!(w.bytes_written(), fail_at);
        assert!(w.bytes_written() >= 1);
        assert!(w.bytes_written() <= fail_at);
    }
}
