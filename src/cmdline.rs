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

//! CLI surface (spec 6): reference only, not part of the core engine.

use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "ota-installer", about = "A/B over-the-air update installer")]
pub struct Cli {
    /// Bundle directory, or `-` to stream a tar bundle from stdin.
    #[clap(short, long, value_name = "path|-")]
    pub input: String,

    /// Raise the log level.
    #[clap(short, long)]
    pub verbose: bool,

    /// Override the journal path (default /var/lib/updater/state.json).
    #[clap(long, value_name = "path")]
    pub journal: Option<String>,

    /// Override boot.switch_cmd regardless of what the manifest says.
    #[clap(long, value_name = "cmd")]
    pub switch_cmd: Option<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
