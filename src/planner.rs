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

//! The planner (spec 4.8): manifest + target slot -> ordered
//! `InstallStep`s. Pure function, no I/O -- it resolves strings from
//! the manifest's slot table and classifies destinations, nothing more.

use std::collections::HashSet;

use anyhow::Result;

use crate::error::InstallError;
use crate::manifest::{Component, Manifest};
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Device,
    Directory,
    File,
}

#[derive(Debug, Clone)]
pub struct InstallStep {
    pub component: Component,
    pub install_to: String,
    pub destination_kind: DestinationKind,
}

pub struct Planner;

impl Planner {
    /// `Planner.plan(m, target)` is a pure function: equal inputs yield
    /// byte-identical plans (spec 8, property 4). There is no hidden
    /// state here to make that anything but trivially true, which is
    /// the point -- determinism is a property of the *algorithm*, not
    /// something bolted on with memoization.
    pub fn plan(manifest: &Manifest, target: Slot) -> Result<Vec<InstallStep>> {
        if target == Slot::Unknown {
            return Err(InstallError::SlotError(
                "cannot plan against an Unknown target slot".into(),
            )
            .into());
        }

        let slot_table = manifest.slot_targets(target.label()).ok_or_else(|| {
            InstallError::ManifestInvalid(format!(
                "manifest has no slot table for target slot {}",
                target.label()
            ))
        })?;

        let mut steps = Vec::with_capacity(manifest.components.len());
        let mut seen_destinations = HashSet::new();

        for component in &manifest.components {
            let install_to = slot_table.get(&component.target).cloned().ok_or_else(|| {
                InstallError::ManifestInvalid(format!(
                    "component {:?} targets {:?}, which has no destination in slot {}",
                    component.name,
                    component.target,
                    target.label()
                ))
            })?;

            let destination_kind = classify(&install_to, component.component_type);

            if !seen_destinations.insert(install_to.clone()) {
                return Err(InstallError::ManifestInvalid(format!(
                    "duplicate install destination {install_to:?} in plan"
                ))
                .into());
            }

            steps.push(InstallStep {
                component: component.clone(),
                install_to,
                destination_kind,
            });
        }

        Ok(steps)
    }
}

fn classify(install_to: &str, component_type: crate::manifest::ComponentType) -> DestinationKind {
    use crate::manifest::ComponentType::*;
    if install_to.starts_with("/dev/") {
        DestinationKind::Device
    } else {
        match component_type {
            File => DestinationKind::File,
            Raw | Archive => DestinationKind::Directory,
        }
    }
}
