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

//! The error taxonomy for the install engine.
//!
//! Every fallible operation in the engine bottoms out in one of these
//! kinds. `anyhow::Error` is still used for propagation and for
//! attaching human-readable context via `.context()`; callers that need
//! to branch on *kind* (the CLI's exit code, the journal) downcast with
//! `Error::downcast_ref::<InstallError>()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("unsupported component type: {0}")]
    UnsupportedComponentType(String),

    #[error("reading from bundle: {0}")]
    SourceIoError(String),

    #[error("writing to destination: {0}")]
    DestinationIoError(String),

    #[error("extracting archive: {0}")]
    ExtractionError(String),

    #[error("unsafe path in archive: {0}")]
    UnsafePathError(String),

    #[error("verification failed: {0}")]
    VerifyError(String),

    #[error("slot error: {0}")]
    SlotError(String),

    #[error("cancelled")]
    Cancelled,
}

impl InstallError {
    /// Short machine-stable label, used in terminal progress records and
    /// journal entries so a human (or a script) can grep for the kind
    /// without parsing the full message.
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::ManifestInvalid(_) => "ManifestInvalid",
            InstallError::UnsupportedComponentType(_) => "UnsupportedComponentType",
            InstallError::SourceIoError(_) => "SourceIOError",
            InstallError::DestinationIoError(_) => "DestinationIOError",
            InstallError::ExtractionError(_) => "ExtractionError",
            InstallError::UnsafePathError(_) => "UnsafePathError",
            InstallError::VerifyError(_) => "VerifyError",
            InstallError::SlotError(_) => "SlotError",
            InstallError::Cancelled => "Cancelled",
        }
    }
}

/// Look up the `InstallError` kind at the root of an anyhow error chain,
/// if any frame in the chain is one. Used by the top-level CLI handler to
/// decide between exit code 1 (operational failure) and 2 (bad
/// invocation), and by the journal to record a terminal kind.
pub fn kind_of(err: &anyhow::Error) -> Option<&'static str> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
        .map(InstallError::kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_of_finds_wrapped_error() {
        let err: anyhow::Error = InstallError::SlotError("mark_active failed".into()).into();
        let wrapped = err.context("committing update");
        assert_eq!(kind_of(&wrapped), Some("SlotError"));
    }

    #[test]
    fn kind_of_none_for_plain_anyhow() {
        let err = anyhow::anyhow!("some generic failure");
        assert_eq!(kind_of(&err), None);
    }
}
