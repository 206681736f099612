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

//! `InstallEngine` (spec 4.9): the top-level state machine.
//!
//! `Idle -> Planning -> Verifying -> Applying(0..n) -> Committing ->
//! Completed`, with `Failed` absorbing from any state. The engine owns
//! the one rule that makes the whole design safe: `mark_active` is
//! called exactly once, only after every plan step has succeeded.

use anyhow::Result;

use crate::bundle::InstallBundle;
use crate::cancel::CancelToken;
use crate::error::{kind_of, InstallError};
use crate::journal::{EngineState, Journal, JournalEntry};
use crate::manifest::Manifest;
use crate::module::{ModuleOptions, UpdateModule};
use crate::planner::Planner;
use crate::progress::{Progress, ProgressSink};
use crate::slot::{Slot, SlotControl};

const PLANNING_DONE_PCT: f64 = 10.0;
const APPLYING_BAND_PCT: f64 = 80.0;
const COMMIT_START_PCT: f64 = 95.0;

pub struct InstallEngine<'a> {
    slot_control: &'a dyn SlotControl,
    module_options: &'a ModuleOptions,
    journal: &'a Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

impl<'a> InstallEngine<'a> {
    pub fn new(
        slot_control: &'a dyn SlotControl,
        module_options: &'a ModuleOptions,
        journal: &'a Journal,
    ) -> Self {
        Self {
            slot_control,
            module_options,
            journal,
        }
    }

    /// Runs a full update against `bundle`, returning `Ok(RunOutcome)`
    /// for anything that reached a terminal state cleanly and `Err` only
    /// for an unexpected internal error (never for a step failure -- that
    /// surfaces as `RunOutcome::Failed` plus a terminal progress record,
    /// matching spec 7's "process exit is non-zero, not a panic").
    pub fn run(
        &self,
        bundle: &dyn InstallBundle,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<RunOutcome> {
        match self.run_inner(bundle, cancel, progress) {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(e) => {
                let kind = kind_of(&e).unwrap_or("Unknown");
                progress(&Progress::terminal_error(kind, &e));
                self.journal.record(&JournalEntry {
                    state: EngineState::Failed,
                    version: String::new(),
                    target: String::new(),
                    current_step: 0,
                    current_component: None,
                    bytes_written: 0,
                    error_kind: Some(kind.to_string()),
                });
                Ok(RunOutcome::Failed)
            }
        }
    }

    fn run_inner(
        &self,
        bundle: &dyn InstallBundle,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<()> {
        // Idle -> Planning
        self.journal.record(&JournalEntry {
            state: EngineState::Planning,
            version: String::new(),
            target: String::new(),
            current_step: 0,
            current_component: None,
            bytes_written: 0,
            error_kind: None,
        });
        progress(&Progress::info("reading manifest"));

        let manifest_json = bundle.read_manifest()?;
        let manifest = Manifest::parse(&manifest_json)?;

        let current = self.slot_control.current_slot()?;
        let target = current
            .other()
            .ok_or_else(|| InstallError::SlotError("current slot is Unknown".into()))?;

        let plan = Planner::plan(&manifest, target)?;
        if plan.is_empty() {
            return Err(InstallError::ManifestInvalid("plan has no steps".into()).into());
        }

        progress(&Progress::at(
            PLANNING_DONE_PCT,
            format!("plan has {} step(s), targeting slot {target}", plan.len()),
        ));

        // Planning -> Verifying is implicit: hash verification happens
        // inside each UpdateModule.install before any bytes move for
        // that component (spec 4.5, 4.7), not as a separate up-front
        // pass, so every step's verification failure aborts that step
        // with no partial writes on the destination it was headed for.

        let total_hint: u64 = plan.iter().filter_map(|s| s.component.expected_size).sum();
        let known_sizes = total_hint > 0 && plan.iter().all(|s| s.component.expected_size.is_some());

        self.journal.record(&JournalEntry {
            state: EngineState::Applying,
            version: manifest.version.clone(),
            target: target.label().to_string(),
            current_step: 0,
            current_component: plan.first().map(|s| s.component.name.clone()),
            bytes_written: 0,
            error_kind: None,
        });

        let module = UpdateModule::new(bundle, self.module_options);
        let n = plan.len();
        let mut cumulative_fraction = 0.0_f64;

        for (i, step) in plan.iter().enumerate() {
            cancel.check()?;

            let step_fraction = if known_sizes {
                step.component.expected_size.unwrap_or(0) as f64 / total_hint as f64
            } else {
                1.0 / n as f64
            };
            let base_pct = PLANNING_DONE_PCT + APPLYING_BAND_PCT * cumulative_fraction;
            let share_pct = APPLYING_BAND_PCT * step_fraction;

            self.journal.record(&JournalEntry {
                state: EngineState::Applying,
                version: manifest.version.clone(),
                target: target.label().to_string(),
                current_step: i,
                current_component: Some(step.component.name.clone()),
                bytes_written: 0,
                error_kind: None,
            });

            progress(&Progress::at(
                base_pct,
                format!("installing {} ({}/{})", step.component.name, i + 1, n),
            ));

            let mut scoped_sink = |p: &Progress| {
                if p.is_informational() {
                    progress(p);
                } else {
                    let scaled = base_pct + (p.percentage / 100.0) * share_pct;
                    progress(&Progress::at(scaled, p.message.clone()));
                }
            };
            module.install(step, cancel, &mut scoped_sink)?;

            cumulative_fraction += step_fraction;
        }

        // Applying(n-1) -> Committing
        self.journal.record(&JournalEntry {
            state: EngineState::Committing,
            version: manifest.version.clone(),
            target: target.label().to_string(),
            current_step: n,
            current_component: None,
            bytes_written: 0,
            error_kind: None,
        });
        progress(&Progress::at(COMMIT_START_PCT, "committing boot slot switch"));

        // This is the one call in the whole engine that must never
        // happen before every step above has returned Ok -- it's the
        // commit point (spec 4.9, 9).
        self.slot_control.mark_active(target)?;

        self.journal.record(&JournalEntry {
            state: EngineState::Completed,
            version: manifest.version.clone(),
            target: target.label().to_string(),
            current_step: n,
            current_component: None,
            bytes_written: 0,
            error_kind: None,
        });
        progress(&Progress::at(100.0, format!("update complete, active slot {target}")));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveOptions;
    use crate::bundle::DirBundle;
    use crate::pipe::PipeOptions;
    use crate::slot::Slot;
    use std::cell::{Cell, RefCell};
    use tempfile::tempdir;

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
                anyhow::bail!(InstallError::SlotError("simulated".into()));
            }
            self.activated.set(Some(target));
            Ok(())
        }
    }

    fn make_bundle(dir: &std::path::Path) -> DirBundle {
        std::fs::write(
            dir.join("manifest.json"),
            r#"{
                "version": "9.9.9",
                "slots": {"A": {}, "B": {"rootfs": "DEST_PLACEHOLDER"}},
                "components": [
                    {"name": "rootfs", "type": "raw", "filename": "rootfs.img", "target": "rootfs"}
                ]
            }"#
            .replace("DEST_PLACEHOLDER", dir.join("dest.img").to_str().unwrap()),
        )
        .unwrap();
        std::fs::write(dir.join("rootfs.img"), vec![0x11u8; 4096]).unwrap();
        DirBundle::new(dir)
    }

    fn module_options() -> ModuleOptions {
        ModuleOptions {
            pipe: PipeOptions {
                progress_interval_bytes: 1024 * 1024,
                fsync_interval_bytes: 0,
            },
            archive: ArchiveOptions::default(),
            verify_hash_enabled: true,
        }
    }

    #[test]
    fn successful_run_commits_target_slot() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path());
        let slot_control = FakeSlotControl {
            current: Slot::A,
            activated: Cell::new(None),
            fail_mark: false,
        };
        let options = module_options();
        let journal_path = dir.path().join("state.json");
        let journal = Journal::new(&journal_path);
        let engine = InstallEngine::new(&slot_control, &options, &journal);

        let cancel = CancelToken::new();
        let records = RefCell::new(Vec::new());
        let mut sink = |p: &Progress| records.borrow_mut().push(p.clone());
        let outcome = engine.run(&bundle, &cancel, &mut sink).unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(slot_control.activated.get(), Some(Slot::B));
        assert_eq!(std::fs::read(dir.path().join("dest.img")).unwrap(), vec![0x11u8; 4096]);
        let last = records.borrow().last().unwrap().clone();
        assert_eq!(last.percentage, 100.0);
        assert!(std::fs::read_to_string(&journal_path).unwrap().contains("Completed"));
    }

    #[test]
    fn mark_active_not_called_when_step_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{
                "slots": {"A": {}, "B": {"rootfs": "/dev/nonexistent-ota-test-device"}},
                "components": [
                    {"name": "rootfs", "type": "raw", "filename": "rootfs.img", "target": "rootfs"}
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("rootfs.img"), vec![0x11u8; 4096]).unwrap();
        let bundle = DirBundle::new(dir.path());

        let slot_control = FakeSlotControl {
            current: Slot::A,
            activated: Cell::new(None),
            fail_mark: false,
        };
        let options = module_options();
        let journal = Journal::new(dir.path().join("state.json"));
        let engine = InstallEngine::new(&slot_control, &options, &journal);

        let cancel = CancelToken::new();
        let mut sink = crate::progress::null_sink;
        let outcome = engine.run(&bundle, &cancel, &mut sink).unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(slot_control.activated.get(), None);
    }

    #[test]
    fn unknown_current_slot_fails_before_any_write() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path());
        let slot_control = FakeSlotControl {
            current: Slot::Unknown,
            activated: Cell::new(None),
            fail_mark: false,
        };
        let options = module_options();
        let journal = Journal::new(dir.path().join("state.json"));
        let engine = InstallEngine::new(&slot_control, &options, &journal);

        let cancel = CancelToken::new();
        let mut sink = crate::progress::null_sink;
        let outcome = engine.run(&bundle, &cancel, &mut sink).unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        assert!(!dir.path().join("dest.img").exists());
    }
}
