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

//! Slots and the `SlotControl` capability (spec 4.6).
//!
//! `Slot` is a closed sum type -- there are exactly two redundant
//! install targets plus the "couldn't tell" case -- while `SlotControl`
//! stays a trait so tests can substitute a fake and the Tegra
//! `nvbootctrl`/`fw_setenv` mechanism can be swapped for another
//! board's boot-control tool without touching the engine.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::error::InstallError;
use crate::runcmd;
use crate::util::cmd_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
    Unknown,
}

impl Slot {
    /// The slot not currently booted. Planning against `Unknown` is
    /// nonsensical and the caller is expected to have already turned it
    /// into a `SlotError` (spec 3, 4.8).
    pub fn other(self) -> Option<Slot> {
        match self {
            Slot::A => Some(Slot::B),
            Slot::B => Some(Slot::A),
            Slot::Unknown => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
            Slot::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" | "A" | "a" => Ok(Slot::A),
            "1" | "B" | "b" => Ok(Slot::B),
            other => anyhow::bail!("unrecognized slot value {other:?}"),
        }
    }
}

/// Reports current slot, and commits a target slot as active. The
/// engine calls `mark_active` exactly once, as the very last action of
/// a successful run (spec 4.9): that single call is the commit point
/// distinguishing "inactive slot partially written" from "update live".
pub trait SlotControl {
    fn current_slot(&self) -> Result<Slot>;
    fn mark_active(&self, target: Slot) -> Result<()>;
}

/// Drives Tegra's `nvbootctrl` for slot queries and an optional
/// `fw_setenv`-based override for the activation command, matching the
/// manifest's `boot.switch_cmd` escape hatch (spec 6).
pub struct TegraSlotControl {
    switch_cmd_override: Option<String>,
}

impl TegraSlotControl {
    pub fn new(switch_cmd_override: Option<String>) -> Self {
        Self {
            switch_cmd_override,
        }
    }
}

impl SlotControl for TegraSlotControl {
    fn current_slot(&self) -> Result<Slot> {
        let output = cmd_output(Command::new("nvbootctrl").arg("get-current-slot"))
            .context("querying current slot")?;
        output.trim().parse::<Slot>().or(Ok(Slot::Unknown))
    }

    fn mark_active(&self, target: Slot) -> Result<()> {
        if let Some(cmd) = &self.switch_cmd_override {
            let mut parts = cmd.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| InstallError::SlotError("empty boot.switch_cmd".into()))?;
            let status = Command::new(program)
                .args(parts)
                .args([target.label()])
                .status()
                .with_context(|| format!("running override boot switch command {cmd:?}"))?;
            if !status.success() {
                return Err(InstallError::SlotError(format!(
                    "boot switch command {cmd:?} exited with {status}"
                ))
                .into());
            }
            return Ok(());
        }

        let slot_index = match target {
            Slot::A => "0",
            Slot::B => "1",
            Slot::Unknown => {
                return Err(InstallError::SlotError("cannot activate Unknown slot".into()).into())
            }
        };
        runcmd!("nvbootctrl", "set-active-boot-slot", slot_index)
            .map_err(|e| InstallError::SlotError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeSlotControl {
        current: Slot,
        activated: Cell<Option<Slot>>,
        fail_mark: bool,
    }

    impl SlotControl for FakeSlotControl {
        fn current_slot(&self) -> Result<Slot> {
            Ok(self.current)
        }

        fn mark_active(&self, target: Slot) -> Result<()> {
            if self.fail_mark {
                anyhow::bail!(InstallError::SlotError("simulated failure".into()));
            }
            self.activated.set(Some(target));
            Ok(())
        }
    }

    #[test]
    fn slot_alternation() {
        assert_eq!(Slot::A.other(), Some(Slot::B));
        assert_eq!(Slot::B.other(), Some(Slot::A));
        assert_eq!(Slot::Unknown.other(), None);
    }

    #[test]
    fn fake_slot_control_tracks_activation() {
        let ctl = FakeSlotControl {
            current: Slot::A,
            activated: Cell::new(None),
            fail_mark: false,
        };
        assert_eq!(ctl.current_slot().unwrap(), Slot::A);
        ctl.mark_active(Slot::B).unwrap();
        assert_eq!(ctl.activated.get(), Some(Slot::B));
    }

    #[test]
    fn fake_slot_control_mark_failure() {
        let ctl = FakeSlotControl {
            current: Slot::A,
            activated: Cell::new(None),
            fail_mark: true,
        };
        let err = ctl.mark_active(Slot::B).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("SlotError"));
        assert_eq!(ctl.activated.get(), None);
    }

    #[test]
    fn slot_from_str() {
        assert_eq!("A".parse::<Slot>().unwrap(), Slot::A);
        assert_eq!("b".parse::<Slot>().unwrap(), Slot::B);
        assert!("x".parse::<Slot>().is_err());
    }
}
