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

//! Cancellation.
//!
//! The design notes prefer an explicit token threaded into readers over
//! a bare process-wide flag, because a token composes with tests: a
//! mock reader can be handed its own `CancelToken` and flipped
//! independently of whatever SIGINT/SIGTERM wiring exists in the real
//! binary. `main.rs` still only has one real token in practice (signal
//! handlers all flip the same one), but nothing in the engine assumes
//! that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::error::InstallError;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Convenience for the read-loop pattern used throughout the
    /// pipeline: checked once per buffer iteration, turning a set flag
    /// into the standard `Cancelled` error.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(InstallError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// Install SIGINT/SIGTERM handlers that flip `token`. Safe to call once
/// at process start; registering a signal-hook flag is async-signal-safe
/// (it only performs an atomic store from the handler).
pub fn install_signal_handlers(token: &CancelToken) -> Result<()> {
    // signal-hook's flag helper stores directly into an AtomicBool, so we
    // register our own and fold it into the token on each check instead
    // of trying to share the Arc's inner atomic across crates: simpler
    // and just as correct given the token is only ever read, never reset.
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;

    let token = token.clone();
    std::thread::spawn(move || loop {
        if flag.load(Ordering::SeqCst) {
            token.cancel();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.check().unwrap();
    }

    #[test]
    fn cancel_is_observed() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("Cancelled"));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
