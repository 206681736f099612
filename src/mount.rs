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

//! A scoped mount, used by `ArchiveInstaller`'s device-path mode (spec
//! 4.4, mode A). On any exit path -- including an error unwind out of
//! extraction -- the guard unmounts on drop, matching the source's
//! `MountGuard` in `archive_installer.cpp`.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::mount::{mount, umount, MsFlags};
use tempfile::{Builder, TempDir};

use crate::error::InstallError;

const UNMOUNT_RETRIES: u32 = 20;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct MountGuard {
    mountpoint: TempDir,
}

impl MountGuard {
    /// Creates a unique mount directory under `base` (default
    /// `/mnt/ota-XXXXXX`), mounts `device` there with `fstype` and
    /// `flags` (default `MS_RELATIME`, per the spec's option-driven
    /// choice over the source's hardcoded paths), and returns a guard
    /// whose `Drop` unmounts and removes the directory.
    pub fn mount(
        device: &str,
        fstype: &str,
        flags: MsFlags,
        base: impl AsRef<Path>,
    ) -> Result<Self> {
        let mountpoint = Builder::new()
            .prefix("ota-")
            .tempdir_in(base.as_ref())
            .with_context(|| format!("creating mount directory under {}", base.as_ref().display()))?;

        mount(
            Some(device),
            mountpoint.path(),
            Some(fstype),
            flags,
            None::<&str>,
        )
        .map_err(|e| {
            InstallError::DestinationIoError(format!(
                "mounting {device} at {}: {e}",
                mountpoint.path().display()
            ))
        })?;

        Ok(Self { mountpoint })
    }

    pub fn path(&self) -> &Path {
        self.mountpoint.path()
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let path: PathBuf = self.mountpoint.path().to_path_buf();
        for attempt in 0..UNMOUNT_RETRIES {
            match umount(&path) {
                Ok(()) => return,
                Err(nix::errno::Errno::EINVAL) => return, // already unmounted
                Err(_) if attempt + 1 < UNMOUNT_RETRIES => {
                    thread::sleep(UNMOUNT_RETRY_DELAY);
                }
                Err(e) => {
                    eprintln!("failed to unmount {}: {e}", path.display());
                    return;
                }
            }
        }
    }
}

pub fn default_relatime_flags() -> MsFlags {
    MsFlags::MS_RELATIME
}

#[cfg(test)]
mod tests {
    use super::*;

    // Real mount/umount requires root and a loop device; exercised in
    // integration testing on target hardware. Here we only check the
    // directory-naming contract, which doesn't need privilege.
    #[test]
    fn mountpoint_created_under_base() {
        let base = tempfile::tempdir().unwrap();
        let sub = Builder::new()
            .prefix("ota-")
            .tempdir_in(base.path())
            .unwrap();
        assert!(sub.path().starts_with(base.path()));
        assert!(sub
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ota-"));
    }
}
