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

//! `InternalPipe` (spec 4.5): reads a 1 MiB buffer at a time from a
//! reader and writes it to a `Writer`, tracking progress and fsync
//! cadence, and checking cancellation once per buffer iteration.

use std::io::Read;

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::error::InstallError;
use crate::partition::Writer;
use crate::progress::{Progress, ProgressSink};

const PIPE_BUFFER_SIZE: usize = 1024 * 1024;

pub struct PipeOptions {
    pub progress_interval_bytes: u64,
    pub fsync_interval_bytes: u64,
}

pub struct PipeOutcome {
    pub bytes_written: u64,
}

/// Tag identifies the component for progress messages. `base_pct` and
/// `share_pct` let the caller (an `UpdateModule` driven by the engine)
/// express this component's slice of the overall run; `InternalPipe`
/// interpolates within that slice as bytes move, exactly as spec 4.9
/// describes for the engine's progress allocation.
pub fn run_pipe(
    reader: &mut impl Read,
    writer: &mut dyn Writer,
    opts: &PipeOptions,
    tag: &str,
    total_size_hint: Option<u64>,
    base_pct: f64,
    share_pct: f64,
    cancel: &CancelToken,
    progress: &mut ProgressSink,
) -> Result<PipeOutcome> {
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut written: u64 = 0;
    let mut since_last_progress: u64 = 0;
    let mut since_last_fsync: u64 = 0;

    loop {
        cancel.check()?;

        let n = reader
            .read(&mut buf)
            .map_err(|e| InstallError::SourceIoError(format!("{tag}: {e}")))?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n])?;
        written += n as u64;
        since_last_progress += n as u64;
        since_last_fsync += n as u64;

        if since_last_progress >= opts.progress_interval_bytes {
            since_last_progress = 0;
            emit_progress(tag, written, total_size_hint, base_pct, share_pct, progress);
        }

        if opts.fsync_interval_bytes > 0 && since_last_fsync >= opts.fsync_interval_bytes {
            since_last_fsync = 0;
            writer.fsync_now()?;
        }
    }

    writer.fsync_now()?;
    progress(&Progress::at(
        base_pct + share_pct,
        format!("{tag}: complete ({} written)", crate::progress::human_bytes(written)),
    ));

    Ok(PipeOutcome { bytes_written: written })
}

fn emit_progress(
    tag: &str,
    written: u64,
    total_size_hint: Option<u64>,
    base_pct: f64,
    share_pct: f64,
    progress: &mut ProgressSink,
) {
    match total_size_hint.filter(|&t| t > 0) {
        Some(total) => {
            let fraction = (written as f64 / total as f64).min(1.0);
            progress(&Progress::at(
                base_pct + share_pct * fraction,
                format!("{tag}: {} / {}", crate::progress::human_bytes(written), crate::progress::human_bytes(total)),
            ));
        }
        None => {
            progress(&Progress::info(format!(
                "{tag}: {} written",
                crate::progress::human_bytes(written)
            )));
        }
    }
}
