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

//! The manifest model (spec 3, 6).
//!
//! The source had two overlapping orchestrators with different
//! manifest shapes (`up::UpdateManager`'s `components` array and
//! `flash::OtaInstaller`'s legacy `artifacts[].items[]` nesting). This
//! unifies on the `components` shape as the canonical in-memory model
//! and accepts the legacy layout only at parse time, flattening it into
//! the same `Component` list -- an implementer has to pick one schema
//! (design notes, 9), and normalizing at the edge keeps the planner and
//! engine from ever seeing the legacy shape.

use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Raw,
    Archive,
    File,
}

impl ComponentType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ComponentType::Raw),
            "archive" => Ok(ComponentType::Archive),
            "file" => Ok(ComponentType::File),
            other => Err(InstallError::UnsupportedComponentType(other.to_string()).into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub component_type: ComponentType,
    pub filename: String,
    pub target: String,
    pub path: Option<String>,
    pub permissions: Option<String>,
    pub create_destination: bool,
    pub expected_hash: Option<String>,
    pub expected_size: Option<u64>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub version: String,
    /// slot label ("A"|"B") -> target name -> destination string
    pub slots: HashMap<String, HashMap<String, String>>,
    pub components: Vec<Component>,
    pub boot_switch_cmd: Option<String>,
}

// --- wire format -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    slots: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    components: Option<Vec<RawComponent>>,
    #[serde(default)]
    artifacts: Option<Vec<RawArtifact>>,
    #[serde(default)]
    boot: Option<RawBoot>,
}

#[derive(Debug, Deserialize)]
struct RawBoot {
    switch_cmd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    name: String,
    #[serde(rename = "type")]
    component_type: String,
    filename: String,
    target: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default, rename = "create-destination")]
    create_destination: bool,
    #[serde(default, rename = "expected-size")]
    expected_size: Option<u64>,
    #[serde(default, rename = "expected-hash")]
    expected_hash: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

/// Legacy layout: `artifacts[].items[]`, where each artifact groups a
/// set of items under what used to be a separately-named phase.
/// Flattened into the same component list; the grouping itself carries
/// no remaining semantic in the unified model.
#[derive(Debug, Deserialize)]
struct RawArtifact {
    #[serde(default)]
    items: Vec<RawComponent>,
}

impl TryFrom<RawComponent> for Component {
    type Error = anyhow::Error;

    fn try_from(r: RawComponent) -> Result<Self> {
        Ok(Component {
            name: r.name,
            component_type: ComponentType::parse(&r.component_type)?,
            filename: r.filename,
            target: r.target,
            path: r.path,
            permissions: r.permissions,
            create_destination: r.create_destination,
            expected_hash: r.expected_hash,
            expected_size: r.expected_size,
            signature: r.signature,
        })
    }
}

impl Manifest {
    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_str(json).map_err(|e| InstallError::ManifestInvalid(e.to_string()))?;

        let mut components: Vec<Component> = Vec::new();
        if let Some(list) = raw.components {
            for c in list {
                components.push(c.try_into()?);
            }
        }
        if let Some(artifacts) = raw.artifacts {
            for artifact in artifacts {
                for c in artifact.items {
                    components.push(c.try_into()?);
                }
            }
        }
        if components.is_empty() {
            return Err(InstallError::ManifestInvalid(
                "manifest has no components (neither `components` nor `artifacts[].items[]`)"
                    .into(),
            )
            .into());
        }

        for component in &components {
            if component.name.is_empty()
                || component.filename.is_empty()
                || component.target.is_empty()
            {
                return Err(InstallError::ManifestInvalid(format!(
                    "component {:?} missing required field",
                    component.name
                ))
                .into());
            }
        }

        Ok(Manifest {
            version: raw.version.unwrap_or_default(),
            slots: raw.slots,
            components,
            boot_switch_cmd: raw.boot.and_then(|b| b.switch_cmd),
        })
    }

    pub fn slot_targets(&self, slot_label: &str) -> Option<&HashMap<String, String>> {
        self.slots.get(slot_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unified_manifest() {
        let json = r#"{
            "version": "1.2.3",
            "slots": {
                "A": {"rootfs": "/dev/mmcblk0p3"},
                "B": {"rootfs": "/dev/mmcblk0p4"}
            },
            "components": [
                {"name": "rootfs", "type": "raw", "filename": "rootfs.img.gz", "target": "rootfs"}
            ],
            "boot": {"switch_cmd": "fw_setenv boot_slot"}
        }"#;
        let m = Manifest::parse(json).unwrap();
        assert_eq!(m.version, "1.2.3");
        assert_eq!(m.components.len(), 1);
        assert_eq!(m.components[0].name, "rootfs");
        assert_eq!(
            m.slot_targets("B").unwrap().get("rootfs").unwrap(),
            "/dev/mmcblk0p4"
        );
        assert_eq!(m.boot_switch_cmd.as_deref(), Some("fw_setenv boot_slot"));
    }

    #[test]
    fn parse_legacy_artifacts_layout() {
        let json = r#"{
            "slots": {"A": {}, "B": {"kernel": "/boot/kernel"}},
            "artifacts": [
                {"items": [
                    {"name": "kernel", "type": "file", "filename": "kernel.bin", "target": "kernel", "path": "/boot/kernel"}
                ]}
            ]
        }"#;
        let m = Manifest::parse(json).unwrap();
        assert_eq!(m.components.len(), 1);
        assert_eq!(m.components[0].component_type, ComponentType::File);
    }

    #[test]
    fn missing_components_is_invalid() {
        let json = r#"{"slots": {}}"#;
        let err = Manifest::parse(json).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("ManifestInvalid"));
    }

    #[test]
    fn malformed_json_is_invalid() {
        let err = Manifest::parse("{not json").unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("ManifestInvalid"));
    }
}
