//! Content digests.
//!
//! Every payload is identified by the SHA-256 of its bytes. The digest is the
//! deduplication key and the logical blob identifier; where the blob physically
//! lives is up to the [`BlobStore`](crate::BlobStore).

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{DedupError, Result};

/// Length of a content digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// SHA-256 digest of a payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a digest from a slice, `None` if it is not exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentDigest {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| DedupError::InvalidInput(format!("digest '{s}' is not hex: {e}")))?;
        ContentDigest::from_slice(&raw).ok_or_else(|| {
            DedupError::InvalidInput(format!(
                "digest '{s}' must be {} hex characters",
                DIGEST_LEN * 2
            ))
        })
    }
}

/// Incremental hasher that also measures the input length.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
    len: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> (ContentDigest, u64) {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.inner.finalize());
        (ContentDigest(out), self.len)
    }
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> ContentDigest {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize().0
}

/// Hashes a byte stream chunk by chunk, returning the digest and the number of
/// bytes read. The stream is never buffered as a whole.
pub async fn hash_stream<S>(mut stream: S) -> Result<(ContentDigest, u64)>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut hasher = Hasher::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finalize())
}
