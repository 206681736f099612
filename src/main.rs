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

mod cmdline;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tempfile::TempDir;

use libotainstall::archive::ArchiveOptions;
use libotainstall::bundle::{DirBundle, InstallBundle};
use libotainstall::cancel::{install_signal_handlers, CancelToken};
use libotainstall::engine::{InstallEngine, RunOutcome};
use libotainstall::journal::{Journal, DEFAULT_JOURNAL_PATH};
use libotainstall::module::ModuleOptions;
use libotainstall::pipe::PipeOptions;
use libotainstall::progress::Progress;
use libotainstall::slot::TegraSlotControl;

use cmdline::Cli;

const PROGRESS_INTERVAL_BYTES: u64 = 4 * 1024 * 1024;
const FSYNC_INTERVAL_BYTES: u64 = 16 * 1024 * 1024;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match run(&cli) {
        Ok(RunOutcome::Completed) => ExitCode::from(0),
        Ok(RunOutcome::Failed) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<RunOutcome> {
    // stdin streaming stages the tar bundle to a scoped temp directory
    // before the engine ever sees it; the engine itself only ever reads
    // from an already-staged `InstallBundle` (spec 6).
    let _staging_guard;
    let bundle_root: std::path::PathBuf = if cli.input == "-" {
        let dir = TempDir::new().context("creating staging directory for stdin bundle")?;
        let path = dir.path().to_path_buf();
        tar::Archive::new(std::io::stdin())
            .unpack(&path)
            .context("unpacking stdin bundle")?;
        _staging_guard = Some(dir);
        path
    } else {
        _staging_guard = None;
        Path::new(&cli.input).to_path_buf()
    };

    let bundle = DirBundle::new(&bundle_root);
    let manifest_json = bundle.read_manifest()?;
    let manifest = libotainstall::manifest::Manifest::parse(&manifest_json)?;

    let slot_control = TegraSlotControl::new(
        cli.switch_cmd.clone().or_else(|| manifest.boot_switch_cmd.clone()),
    );

    let journal_path = cli
        .journal
        .clone()
        .unwrap_or_else(|| DEFAULT_JOURNAL_PATH.to_string());
    let journal = Journal::new(journal_path);

    let module_options = ModuleOptions {
        pipe: PipeOptions {
            progress_interval_bytes: PROGRESS_INTERVAL_BYTES,
            fsync_interval_bytes: FSYNC_INTERVAL_BYTES,
        },
        archive: ArchiveOptions::default(),
        verify_hash_enabled: true,
    };

    let cancel = CancelToken::new();
    install_signal_handlers(&cancel).context("installing signal handlers")?;

    let engine = InstallEngine::new(&slot_control, &module_options, &journal);
    let verbose = cli.verbose;
    let mut sink = move |p: &Progress| {
        if p.is_informational() {
            if verbose {
                eprintln!("{}", p.message);
            }
        } else {
            println!("{:.1}%: {}", p.percentage, p.message);
        }
    };

    engine.run(&bundle, &cancel, &mut sink)
}
