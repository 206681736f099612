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

//! The `Verifier` capability (spec 4.7): hash verification over the
//! exact byte stream about to be written, plus an optional signature
//! check gated behind a trust bundle.
//!
//! The source's signature verification was stubbed to always return
//! true, so there's nothing to port there beyond the contract shape.
//! Hash verification is real: it's the same digest-then-compare idiom
//! as `IgnitionHash::validate`, just generalized to run ahead of the
//! write instead of after a download.

use std::io::Read;

use anyhow::{Context, Result};
use openssl::sha::Sha256;

use crate::error::InstallError;
use crate::progress::{Progress, ProgressSink};

/// Consume `reader` to completion, computing its SHA-256 digest, and
/// compare against `expected_hex`. This is the engine's hash pre-pass:
/// it opens a *second* reader through the identical decompression
/// chain used for the real write, so the bytes hashed here are
/// guaranteed to be the bytes that will later be written.
pub fn verify_hash(
    mut reader: impl Read,
    expected_hex: &str,
    component_name: &str,
    progress: &mut ProgressSink,
) -> Result<()> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; crate::io::BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading {component_name} for hash verification"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let computed = hex::encode(hasher.finish());
    if !computed.eq_ignore_ascii_case(expected_hex) {
        progress(&Progress::terminal_error(
            "VerifyError",
            format!("{component_name}: hash mismatch"),
        ));
        return Err(InstallError::VerifyError(format!(
            "{component_name}: computed {computed} but expected {expected_hex}"
        ))
        .into());
    }
    Ok(())
}

/// Signature verification is a capability contract only (spec 4.7, 9):
/// the source never implemented it for real. Implementations wire this
/// to whatever trust bundle format the platform uses; the engine treats
/// `Ok(false)` and `Err(_)` identically -- both abort the component.
pub trait SignatureVerifier {
    fn verify(&self, artifact_path: &str, signature_path: &str, trust_bundle: &str)
        -> Result<bool>;
}

/// A verifier that has no keys configured and always fails closed. Used
/// when a manifest names a signature but the caller hasn't wired a real
/// verifier in; silently accepting would defeat the point of signing.
pub struct NoSignatureVerifier;

impl SignatureVerifier for NoSignatureVerifier {
    fn verify(&self, _artifact: &str, _signature: &str, _trust_bundle: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_hash_matches() {
        let data = b"the quick brown fox";
        let mut hasher = Sha256::new();
        hasher.update(data);
        let expected = hex::encode(hasher.finish());

        let mut sink = crate::progress::null_sink;
        verify_hash(&data[..], &expected, "test", &mut sink).unwrap();
    }

    #[test]
    fn verify_hash_mismatch() {
        let data = b"the quick brown fox";
        let mut sink = crate::progress::null_sink;
        let err = verify_hash(&data[..], &"0".repeat(64), "test", &mut sink).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some("VerifyError"));
    }

    #[test]
    fn no_signature_verifier_fails_closed() {
        let v = NoSignatureVerifier;
        assert!(!v.verify("a", "b", "c").unwrap());
    }
}
