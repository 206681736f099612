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

//! `ArchiveInstaller` (spec 4.4): streams a tar archive from a `Reader`
//! into a target, which is either a block device (mount first) or a
//! plain directory. Path safety (property 6, scenario S5) is the point
//! of this module; everything else is plumbing around it.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd;
use tar::EntryType;

use crate::cancel::CancelToken;
use crate::error::InstallError;
use crate::mount::{default_relatime_flags, MountGuard};
use crate::progress::{Progress, ProgressSink};

pub const DEFAULT_MOUNT_BASE: &str = "/mnt";
pub const DEFAULT_FSTYPE: &str = "ext4";
const DEFAULT_PROGRESS_INTERVAL_BYTES: u64 = 4 * 1024 * 1024;

pub struct ArchiveOptions {
    pub mount_base: String,
    pub fstype: String,
    pub progress_interval_bytes: u64,
    pub safe_paths_only: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            mount_base: DEFAULT_MOUNT_BASE.into(),
            fstype: DEFAULT_FSTYPE.into(),
            progress_interval_bytes: DEFAULT_PROGRESS_INTERVAL_BYTES,
            safe_paths_only: true,
        }
    }
}

pub struct ArchiveInstaller {
    options: ArchiveOptions,
}

impl ArchiveInstaller {
    pub fn new(options: ArchiveOptions) -> Self {
        Self { options }
    }

    /// `install_to` is either a block device path (mode A: mount, then
    /// extract) or a directory path (mode B: extract in place).
    pub fn install_tar_stream_to_target(
        &self,
        reader: impl Read,
        install_to: &str,
        tag: &str,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<()> {
        if install_to.starts_with("/dev/") {
            let guard = MountGuard::mount(
                install_to,
                &self.options.fstype,
                default_relatime_flags(),
                &self.options.mount_base,
            )
            .with_context(|| format!("mounting {install_to} for component {tag}"))?;
            // The guard unmounts on drop regardless of how extraction
            // below returns, including the `?` below.
            self.extract_tar_stream_to_dir(reader, guard.path(), tag, cancel, progress)
        } else {
            fs::create_dir_all(install_to)
                .with_context(|| format!("creating target directory {install_to}"))?;
            self.extract_tar_stream_to_dir(reader, Path::new(install_to), tag, cancel, progress)
        }
    }

    fn extract_tar_stream_to_dir(
        &self,
        reader: impl Read,
        target_dir: &Path,
        tag: &str,
        cancel: &CancelToken,
        progress: &mut ProgressSink,
    ) -> Result<()> {
        let _chdir = ChdirGuard::enter(target_dir)
            .with_context(|| format!("entering target directory {}", target_dir.display()))?;

        let checked_reader = CancelReader {
            inner: reader,
            cancel: cancel.clone(),
        };
        let mut archive = tar::Archive::new(checked_reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(false);

        let mut extracted_bytes: u64 = 0;
        let mut since_last_progress: u64 = 0;

        let entries = archive
            .entries()
            .map_err(|e| archive_io_error(tag, cancel, e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| archive_io_error(tag, cancel, e))?;

            let raw_path = entry
                .path()
                .map_err(|e| InstallError::ExtractionError(format!("{tag}: {e}")))?
                .to_string_lossy()
                .into_owned();

            let normalized = match normalize_entry_path(&raw_path, self.options.safe_paths_only) {
                NormalizeOutcome::Skip => continue,
                NormalizeOutcome::Unsafe => {
                    return Err(InstallError::UnsafePathError(format!(
                        "{tag}: entry {raw_path:?} escapes target directory"
                    ))
                    .into())
                }
                NormalizeOutcome::Path(p) => p,
            };
            let dest = PathBuf::from(&normalized);

            // secure-symlinks: refuse to write through any path component
            // that already exists as a symlink, so a prior `link -> /etc`
            // entry can't be used to smuggle a later `link/passwd` entry
            // outside the target directory (spec 4.4 rule 5; mirrors the
            // original's `ARCHIVE_EXTRACT_SECURE_SYMLINKS`).
            if path_has_symlink_ancestor(&dest) {
                return Err(InstallError::UnsafePathError(format!(
                    "{tag}: entry {raw_path:?} writes through a symlinked path component"
                ))
                .into());
            }

            match entry.header().entry_type() {
                EntryType::Directory => {
                    fs::create_dir_all(&dest)
                        .with_context(|| format!("creating directory {normalized}"))?;
                }
                EntryType::Symlink => {
                    let link_name = entry
                        .link_name()
                        .map_err(|e| InstallError::ExtractionError(format!("{tag}: {e}")))?
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).ok();
                    }
                    let _ = fs::remove_file(&dest);
                    std::os::unix::fs::symlink(&link_name, &dest)
                        .with_context(|| format!("creating symlink {normalized} -> {link_name}"))?;
                }
                EntryType::Link => {
                    let raw_link = entry
                        .link_name()
                        .map_err(|e| InstallError::ExtractionError(format!("{tag}: {e}")))?
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let link_target = match normalize_entry_path(&raw_link, self.options.safe_paths_only)
                    {
                        NormalizeOutcome::Skip => {
                            return Err(InstallError::UnsafePathError(format!(
                                "{tag}: hardlink {raw_path:?} has empty target"
                            ))
                            .into())
                        }
                        NormalizeOutcome::Unsafe => {
                            return Err(InstallError::UnsafePathError(format!(
                                "{tag}: hardlink {raw_path:?} -> {raw_link:?} escapes target directory"
                            ))
                            .into())
                        }
                        NormalizeOutcome::Path(p) => p,
                    };
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).ok();
                    }
                    let _ = fs::remove_file(&dest);
                    fs::hard_link(&link_target, &dest).with_context(|| {
                        format!("creating hardlink {normalized} -> {link_target}")
                    })?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("creating parent directory for {normalized}"))?;
                    }
                    let _ = fs::remove_file(&dest);
                    let mut out = File::create(&dest)
                        .with_context(|| format!("creating file {normalized}"))?;
                    let mut buf = [0u8; crate::io::BUFFER_SIZE];
                    loop {
                        cancel.check()?;
                        let n = entry
                            .read(&mut buf)
                            .map_err(|e| archive_io_error(tag, cancel, e))?;
                        if n == 0 {
                            break;
                        }
                        io::Write::write_all(&mut out, &buf[..n])
                            .map_err(|e| InstallError::DestinationIoError(e.to_string()))?;
                        extracted_bytes += n as u64;
                        since_last_progress += n as u64;
                        if since_last_progress >= self.options.progress_interval_bytes {
                            since_last_progress = 0;
                            progress(&Progress::info(format!(
                                "{tag}: extracted {} so far",
                                crate::progress::human_bytes(extracted_bytes)
                            )));
                        }
                    }
                    if let Some(mode) = entry.header().mode().ok() {
                        let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode));
                    }
                }
                _ => {
                    // Device nodes, FIFOs, and similar are not part of
                    // an OTA component's payload; skip rather than fail.
                    continue;
                }
            }
        }

        Ok(())
    }
}

/// A read failure while the cancel token is set is the cancellation
/// path (spec 7: `Cancelled` takes precedence over the generic
/// `ExtractionError` an interrupted read would otherwise produce).
fn archive_io_error(tag: &str, cancel: &CancelToken, e: io::Error) -> InstallError {
    if cancel.is_cancelled() {
        InstallError::Cancelled
    } else {
        InstallError::ExtractionError(format!("{tag}: {e}"))
    }
}

enum NormalizeOutcome {
    Skip,
    Unsafe,
    Path(String),
}

/// Strips leading `./`, strips leading `/`, and collapses duplicate
/// `/` by the simple expedient of splitting on `/` and dropping empty
/// and `.` components. Entries that normalize to nothing are skipped
/// silently (rule 1); entries containing a `..` segment or a backslash
/// are unsafe (rule 2) when `safe_paths_only` is set.
fn normalize_entry_path(raw: &str, safe_paths_only: bool) -> NormalizeOutcome {
    if safe_paths_only && raw.contains('\\') {
        return NormalizeOutcome::Unsafe;
    }
    let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    if parts.is_empty() {
        return NormalizeOutcome::Skip;
    }
    if safe_paths_only && parts.iter().any(|s| *s == "..") {
        return NormalizeOutcome::Unsafe;
    }
    NormalizeOutcome::Path(parts.join("/"))
}

/// True if any proper prefix of `dest` (i.e. any ancestor directory the
/// entry would be written under, not `dest` itself) already exists on
/// disk as a symlink. Extraction always runs with CWD set to the target
/// directory, so `dest` is relative and every prefix checked here is
/// necessarily inside it -- there's no need to resolve the symlink's
/// target to know the write would escape.
fn path_has_symlink_ancestor(dest: &Path) -> bool {
    let mut prefix = PathBuf::new();
    let mut components: Vec<_> = dest.components().collect();
    components.pop();
    for component in components {
        prefix.push(component);
        if fs::symlink_metadata(&prefix)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Reader wrapper that checks a `CancelToken` once per buffer read, the
/// hook point tar's entry iterator reads through. Mirrors the source's
/// `ReadCb` checking a global cancel flag inside the libarchive read
/// callback.
struct CancelReader<R: Read> {
    inner: R,
    cancel: CancelToken,
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Scoped process-CWD change, restored on all exit paths including
/// unwind. Extraction always runs with CWD set to the target directory
/// so entries are written as relative paths (rule 3): even if a path
/// safety check were ever missed, the underlying filesystem calls can't
/// escape above the process's working directory via a bare write to an
/// absolute path, because none of our writes use absolute paths here.
struct ChdirGuard {
    previous: PathBuf,
}

impl ChdirGuard {
    fn enter(target: &Path) -> Result<Self> {
        let previous = std::env::current_dir().context("getting current directory")?;
        unistd::chdir(target).with_context(|| format!("chdir to {}", target.display()))?;
        Ok(Self { previous })
    }
}

impl Drop for ChdirGuard {
    fn drop(&mut self) {
        if let Err(e) = unistd::chdir(&self.previous) {
            eprintln!(
                "failed to restore working directory to {}: {e}",
                self.previous.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn normalizes_dot_slash_and_duplicate_slashes() {
        match normalize_entry_path("./a//b/./c", true) {
            NormalizeOutcome::Path(p) => assert_eq!(p, "a/b/c"),
            _ => panic!("expected normalized path"),
        }
    }

    #[test]
    fn skips_empty_normalized_entries() {
        assert!(matches!(normalize_entry_path("./", true), NormalizeOutcome::Skip));
        assert!(matches!(normalize_entry_path(".", true), NormalizeOutcome::Skip));
    }

    #[test]
    fn s6_path_traversal_detected() {
        assert!(matches!(
            normalize_entry_path("../etc/passwd", true),
            NormalizeOutcome::Unsafe
        ));
        assert!(matches!(
            normalize_entry_path("a/../../etc/passwd", true),
            NormalizeOutcome::Unsafe
        ));
        assert!(matches!(
            normalize_entry_path("a\\b", true),
            NormalizeOutcome::Unsafe
        ));
    }

    #[test]
    fn s5_tar_extraction_rejects_traversal() {
        let data = build_tar(&[("../etc/passwd", b"pwned")]);
        let dir = tempdir().unwrap();
        let installer = ArchiveInstaller::new(ArchiveOptions::default());
        let cancel = CancelToken::new();
        let mut sink = crate::progress::null_sink;
        let err = installer
            .extract_tar_stream_to_dir(&data[..], dir.path(), "test", &cancel, &mut sink)
            .unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("UnsafePathError"));
        assert!(!dir.path().parent().unwrap().join("etc").exists());
    }

    #[test]
    fn secure_symlink_traversal_rejected() {
        let dir = tempdir().unwrap();
        let escape_target = dir.path().parent().unwrap().to_path_buf();

        let mut builder = tar::Builder::new(Vec::new());
        let mut link_header = tar::Header::new_gnu();
        link_header.set_entry_type(EntryType::Symlink);
        link_header.set_size(0);
        link_header.set_mode(0o777);
        link_header.set_cksum();
        builder
            .append_link(&mut link_header, "escape", &escape_target)
            .unwrap();

        let mut file_header = tar::Header::new_gnu();
        file_header.set_size(5);
        file_header.set_mode(0o644);
        file_header.set_cksum();
        builder
            .append_data(&mut file_header, "escape/pwned", &b"data!"[..])
            .unwrap();

        let data = builder.into_inner().unwrap();

        let installer = ArchiveInstaller::new(ArchiveOptions::default());
        let cancel = CancelToken::new();
        let mut sink = crate::progress::null_sink;
        let err = installer
            .extract_tar_stream_to_dir(&data[..], dir.path(), "test", &cancel, &mut sink)
            .unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("UnsafePathError"));
        assert!(!escape_target.join("pwned").exists());
    }

    #[test]
    fn extracts_regular_files_and_directories() {
        let data = build_tar(&[
            ("dir/", b""),
            ("dir/file.txt", b"hello world"),
        ]);
        let dir = tempdir().unwrap();
        let installer = ArchiveInstaller::new(ArchiveOptions::default());
        let cancel = CancelToken::new();
        let mut sink = crate::progress::null_sink;
        installer
            .extract_tar_stream_to_dir(&data[..], dir.path(), "test", &cancel, &mut sink)
            .unwrap();
        let contents = fs::read(dir.path().join("dir/file.txt")).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn cancellation_aborts_extraction() {
        let big = vec![0u8; 4 * 1024 * 1024];
        let data = build_tar(&[("big.bin", &big)]);
        let dir = tempdir().unwrap();
        let installer = ArchiveInstaller::new(ArchiveOptions::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = crate::progress::null_sink;
        let err = installer
            .extract_tar_stream_to_dir(&data[..], dir.path(), "test", &cancel, &mut sink)
            .unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("Cancelled"));
    }
}
