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

//! Progress reporting.
//!
//! The legacy source had two channels, a logger and a progress callback.
//! Here there's one: a `ProgressSink` is just `FnMut(&Progress)`, and
//! every layer of the pipeline that wants to report something -- a
//! byte-count update, a state transition, a terminal error -- goes
//! through it.

use byte_unit::Byte;

/// `percentage` is `0.0..=100.0`, or `-1.0` for a non-numeric
/// informational or fatal-error message.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percentage: f64,
    pub message: String,
}

pub const INFO: f64 = -1.0;

impl Progress {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            percentage: INFO,
            message: message.into(),
        }
    }

    pub fn at(percentage: f64, message: impl Into<String>) -> Self {
        debug_assert!((0.0..=100.0).contains(&percentage));
        Self {
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
        }
    }

    pub fn terminal_error(kind: &str, message: impl std::fmt::Display) -> Self {
        Self {
            percentage: INFO,
            message: format!("{kind}: {message}"),
        }
    }

    pub fn is_informational(&self) -> bool {
        self.percentage == INFO
    }
}

pub type ProgressSink<'a> = dyn FnMut(&Progress) + 'a;

/// A sink that discards everything, for call sites (mostly tests) that
/// don't care about progress.
pub fn null_sink(_progress: &Progress) {}

/// Render a byte count the way a human reads it, e.g. "512.0 MiB".
/// Used for the occasional informational message; the percentage field
/// carries the machine-readable signal.
pub fn human_bytes(n: u64) -> String {
    let byte = Byte::from_u64(n);
    let adjusted = byte.get_appropriate_unit(byte_unit::UnitType::Binary);
    format!("{adjusted:.1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_percentage() {
        let p = Progress::at(150.0, "over");
        assert_eq!(p.percentage, 100.0);
        let p = Progress::at(-5.0, "under");
        assert_eq!(p.percentage, 0.0);
    }

    #[test]
    fn info_is_negative_one() {
        assert!(Progress::info("hello").is_informational());
        assert!(!Progress::at(50.0, "half").is_informational());
    }
}
