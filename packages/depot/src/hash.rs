// BLAKE3 content digests
use blake3::{Hash, Hasher};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 16 * 1024;

/// Errors produced when parsing a digest string
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("invalid BLAKE3 digest length: expected 64 hex chars, got {0}")]
    Length(usize),

    #[error("invalid hex in digest: {0}")]
    Hex(String),
}

/// Content digest of an uploaded byte stream
///
/// Doubles as the content address of the physical object: two uploads with
/// equal digests (and sizes) share one stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(Hash);

impl Digest {
    /// Compute a digest from any blocking reader, 16KB at a time
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hasher = ContentHasher::new();
        let mut buffer = [0u8; CHUNK_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize())
    }

    /// Compute a digest from an async reader without buffering it whole
    pub async fn from_async_reader<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Self> {
        let mut hasher = ContentHasher::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize())
    }

    /// Compute a digest from a stream of byte chunks
    pub async fn from_stream<S>(mut stream: S) -> io::Result<Self>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = stream.next().await {
            hasher.update(&chunk?);
        }
        Ok(hasher.finalize())
    }

    /// Compute a digest from bytes already in memory
    pub fn from_bytes(data: &[u8]) -> Self {
        Digest(blake3::hash(data))
    }

    /// Hex representation without prefix
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Hex representation with the `blake3:` prefix
    pub fn to_string_prefixed(&self) -> String {
        format!("blake3:{}", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_prefixed())
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);

        if hex.len() != 64 {
            return Err(DigestParseError::Length(hex.len()));
        }

        let bytes = hex::decode(hex).map_err(|e| DigestParseError::Hex(e.to_string()))?;
        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&bytes);

        Ok(Digest(Hash::from(hash_bytes)))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string_prefixed())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher that also counts the bytes it has seen
#[derive(Default)]
pub struct ContentHasher {
    hasher: Hasher,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> Digest {
        Digest(self.hasher.finalize())
    }
}
