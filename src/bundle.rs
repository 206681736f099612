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

//! `InstallBundle` (spec 3, 6): opaque to the core beyond `open` and
//! `size`. A bundle is a staged directory containing `manifest.json`
//! at its root and component payloads at the paths the manifest's
//! `filename` fields name.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::error::InstallError;

pub trait InstallBundle {
    fn open(&self, filename: &str) -> Result<Box<dyn std::io::Read>>;
    fn size(&self, filename: &str) -> Result<u64>;
    fn read_manifest(&self) -> Result<String>;
}

pub struct DirBundle {
    root: PathBuf,
}

impl DirBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        // Component filenames come from the manifest, not from
        // untrusted archive entries, so this doesn't need the same
        // `..`-rejection as `ArchiveInstaller`'s tar paths -- but it
        // still shouldn't let a crafted manifest escape the bundle
        // root, since the manifest itself is as untrusted as the
        // archive it describes.
        let joined = self.root.join(filename);
        let canonical_root = self
            .root
            .canonicalize()
            .with_context(|| format!("resolving bundle root {}", self.root.display()))?;
        let parent = joined.parent().unwrap_or(&joined);
        if parent.exists() {
            let canonical_parent = parent
                .canonicalize()
                .with_context(|| format!("resolving {}", parent.display()))?;
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(InstallError::SourceIoError(format!(
                    "component filename {filename:?} escapes bundle root"
                ))
                .into());
            }
        }
        Ok(joined)
    }
}

impl InstallBundle for DirBundle {
    fn open(&self, filename: &str) -> Result<Box<dyn std::io::Read>> {
        let path = self.resolve(filename)?;
        let file = File::open(&path)
            .map_err(|e| InstallError::SourceIoError(format!("opening {filename}: {e}")))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn size(&self, filename: &str) -> Result<u64> {
        let path = self.resolve(filename)?;
        let meta = std::fs::metadata(&path)
            .map_err(|e| InstallError::SourceIoError(format!("stat {filename}: {e}")))?;
        Ok(meta.len())
    }

    fn read_manifest(&self) -> Result<String> {
        std::fs::read_to_string(self.root.join("manifest.json"))
            .map_err(|e| InstallError::SourceIoError(format!("reading manifest.json: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::tempdir;

    #[test]
    fn opens_and_sizes_component() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("rootfs.img"), b"0123456789").unwrap();

        let bundle = DirBundle::new(dir.path());
        assert_eq!(bundle.size("rootfs.img").unwrap(), 10);
        let mut buf = Vec::new();
        bundle.open("rootfs.img").unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"0123456789");
        assert_eq!(bundle.read_manifest().unwrap(), "{}");
    }

    #[test]
    fn rejects_filenames_escaping_bundle_root() {
        let outer = tempdir().unwrap();
        let inner = outer.path().join("bundle");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(outer.path().join("secret"), b"nope").unwrap();

        let bundle = DirBundle::new(&inner);
        // the parent of "../secret" from inner's perspective is `outer`,
        // which exists and is outside the bundle root
        let err = bundle.open("../secret").unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("SourceIOError"));
        let _ = Write::flush(&mut std::io::sink());
    }
}
