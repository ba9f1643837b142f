// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use sha2::{Digest, Sha256};

/// A content hash paired with the size it was computed over. The dedup
/// index's authoritative key is `hash_str()`; `size_bytes` travels
/// alongside purely for metadata and sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Digest {
    bytes: [u8; 32],
    pub size_bytes: u64,
}

impl Sha256Digest {
    #[must_use]
    pub fn new(bytes: [u8; 32], size_bytes: u64) -> Self {
        Self { bytes, size_bytes }
    }

    #[must_use]
    pub fn hash_str(&self) -> String {
        hex::encode(self.bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Streaming SHA-256 accumulator. Fed chunk-by-chunk as data flows through
/// the buffered channel so hashing never requires buffering a whole item
/// in memory at once.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
    size_bytes: u64,
}

impl StreamingHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.size_bytes += chunk.len() as u64;
    }

    #[must_use]
    pub fn finalize(self) -> Sha256Digest {
        let result = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Sha256Digest::new(bytes, self.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_match_sha256_of_concatenated_chunks() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        let digest = hasher.finalize();
        assert_eq!(digest.size_bytes, 11);

        let mut whole = Sha256::new();
        whole.update(b"hello world");
        assert_eq!(digest.hash_str(), hex::encode(whole.finalize()));
    }
}
