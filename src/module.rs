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

//! `UpdateModule` (spec 4.5): installs a single component, dispatching
//! by `component.type` to the raw writer, `ArchiveInstaller`, or the
//! atomic file-replace path.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::archive::{ArchiveInstaller, ArchiveOptions};
use crate::cancel::CancelToken;
use crate::digest::verify_hash;
use crate::error::InstallError;
use crate::io::{CountingReader, Decompressor};
use crate::manifest::ComponentType;
use crate::partition::{PartitionWriter, Writer};
use crate::pipe::{run_pipe, PipeOptions};
use crate::planner::{DestinationKind, InstallStep};
use crate::progress::{Progress, ProgressSink};

pub struct ModuleOptions {
    pub pipe: PipeOptions,
    pub archive: ArchiveOptions,
    pub verify_hash_enabled: bool,
}

pub struct UpdateModule<'a> {
    bundle: &'a dyn crate::bundle::InstallBundle,
    options: &'a ModuleOptions,
}

impl<'a> UpdateModule<'a> {
    pub fn new(bundle: &'a dyn crate::bundle::InstallBundle, options: &'a ModuleOptions) -> Self {
        Self { bundle, options }
    }

    /// Installs `step`, reporting progress within `[base_pct, base_pct
    /// + share_pct]`. Returns the number of bytes the pipe actually
    /// wrote (used by the engine only for logging).
    pub fn install(
        &self,
        step: &InstallStep,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        let tag = step.component.name.clone();

        if self.options.verify_hash_enabled {
            if let Some(expected_hash) = &step.component.expected_hash {
                let reader = self.open_decompressed(&step.component.filename)?;
                verify_hash(reader, expected_hash, &tag, progress)?;
            }
        }

        let mut reader = self.open_decompressed(&step.component.filename)?;
        let total_size_hint = step.component.expected_size;

        match step.component.component_type {
            ComponentType::Raw => {
                self.install_raw(&mut reader, step, &tag, total_size_hint, cancel, progress)
            }
            ComponentType::Archive => {
                self.install_archive(reader, step, &tag, cancel, progress)?;
                Ok(0)
            }
            ComponentType::File => {
                self.install_file(&mut reader, step, &tag, total_size_hint, cancel, progress)
            }
        }
    }

    fn open_decompressed(&self, filename: &str) -> Result<Box<dyn std::io::Read>> {
        let raw = self.bundle.open(filename)?;
        let counting = CountingReader::new(raw);
        let decompressed = Decompressor::for_filename(filename, counting)
            .map_err(|e| InstallError::SourceIoError(e.to_string()))?;
        Ok(Box::new(decompressed))
    }

    fn install_raw(
        &self,
        reader: &mut (impl std::io::Read + ?Sized),
        step: &InstallStep,
        tag: &str,
        total_size_hint: Option<u64>,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        // `run_pipe` owns fsync cadence (it calls `fsync_now` on the
        // configured interval plus once at EOF); opening the writer with
        // its own nonzero interval would fsync twice per crossing.
        let mut writer = PartitionWriter::open(&step.install_to, 0)
            .with_context(|| format!("opening destination {}", step.install_to))?;
        let outcome = run_pipe(
            reader,
            &mut writer,
            &self.options.pipe,
            tag,
            total_size_hint,
            0.0,
            100.0,
            cancel,
            progress,
        )?;
        Ok(outcome.bytes_written)
    }

    fn install_archive(
        &self,
        reader: impl std::io::Read,
        step: &InstallStep,
        tag: &str,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<()> {
        debug_assert!(matches!(
            step.destination_kind,
            DestinationKind::Device | DestinationKind::Directory
        ));
        let installer = ArchiveInstaller::new(ArchiveOptions {
            mount_base: self.options.archive.mount_base.clone(),
            fstype: self.options.archive.fstype.clone(),
            progress_interval_bytes: self.options.archive.progress_interval_bytes,
            safe_paths_only: self.options.archive.safe_paths_only,
        });
        installer.install_tar_stream_to_target(reader, &step.install_to, tag, cancel, progress)
    }

    fn install_file(
        &self,
        reader: &mut (impl std::io::Read + ?Sized),
        step: &InstallStep,
        tag: &str,
        total_size_hint: Option<u64>,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        let final_path = step
            .component
            .path
            .clone()
            .unwrap_or_else(|| step.install_to.clone());
        let tmp_path = format!("{final_path}.tmp");

        if step.component.create_destination {
            if let Some(parent) = PathBuf::from(&final_path).parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating parent directories for {final_path}"))?;
            }
        }

        let result = (|| -> Result<u64> {
            let mut writer = PartitionWriter::open(&tmp_path, 0)
                .with_context(|| format!("creating staging file {tmp_path}"))?;
            let outcome = run_pipe(
                reader,
                &mut writer,
                &self.options.pipe,
                tag,
                total_size_hint,
                0.0,
                100.0,
                cancel,
                progress,
            )?;

            if let Some(perm) = &step.component.permissions {
                let trimmed = perm.trim().trim_start_matches("0o");
                let mode = u32::from_str_radix(trimmed, 8)
                    .with_context(|| format!("parsing permissions {perm:?} for {tag}"))?;
                fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("setting permissions on {tmp_path}"))?;
            }

            Ok(outcome.bytes_written)
        })();

        match result {
            Ok(written) => {
                fs::rename(&tmp_path, &final_path).map_err(|e| {
                    InstallError::DestinationIoError(format!(
                        "renaming {tmp_path} to {final_path}: {e}"
                    ))
                })?;
                progress(&Progress::at(100.0, format!("{tag}: installed to {final_path}")));
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}
