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

use flate2::read::GzDecoder;
use std::io::{self, Read};

/// Decompression is selected by filename suffix, not by sniffing magic
/// bytes: the manifest names the exact file inside the bundle, and an
/// update bundle is a trusted-ish but adversarial-path input, not a
/// grab-bag of arbitrary files we need to autodetect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Identity,
    Gzip,
    Zstd,
}

impl CompressionKind {
    pub fn from_filename(filename: &str) -> Self {
        if filename.ends_with(".gz") {
            CompressionKind::Gzip
        } else if filename.ends_with(".zst") || filename.ends_with(".zstd") {
            CompressionKind::Zstd
        } else {
            CompressionKind::Identity
        }
    }
}

enum Decoder<'a, R: Read> {
    Identity(R),
    Gzip(Box<GzDecoder<R>>),
    Zstd(Box<zstd::stream::read::Decoder<'a, io::BufReader<R>>>),
}

/// Wraps a source `Reader` to expose decompressed bytes. One of the
/// three component types named in the manifest's filename suffix; an
/// unrecognized suffix falls back to identity rather than failing, so a
/// manifest can stage an already-uncompressed artifact under any name.
pub struct Decompressor<'a, R: Read>(Decoder<'a, R>);

impl<'a, R: Read> Decompressor<'a, R> {
    pub fn new(kind: CompressionKind, source: R) -> io::Result<Self> {
        let decoder = match kind {
            CompressionKind::Identity => Decoder::Identity(source),
            CompressionKind::Gzip => Decoder::Gzip(Box::new(GzDecoder::new(source))),
            CompressionKind::Zstd => {
                Decoder::Zstd(Box::new(zstd::stream::read::Decoder::new(source)?))
            }
        };
        Ok(Self(decoder))
    }

    pub fn for_filename(filename: &str, source: R) -> io::Result<Self> {
        Self::new(CompressionKind::from_filename(filename), source)
    }
}

impl<R: Read> Read for Decompressor<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            Decoder::Identity(r) => r.read(buf),
            Decoder::Gzip(r) => r.read(buf),
            Decoder::Zstd(r) => r.read(buf),
        }
    }
}
