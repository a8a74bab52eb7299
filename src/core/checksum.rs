//! Checksum engine
//!
//! SHA-256 content digests for staged files and for data read back off tape.
//! The engine holds no state, so any number of workers may hash independent
//! streams concurrently.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Read buffer used when hashing a stream
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// 256-bit SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = StreamingDigest::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Error parsing a hex digest
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid digest '{0}': expected 64 hex characters")]
pub struct ParseDigestError(String);

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseDigestError(s.to_string()))?;
        Ok(Digest(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher fed block by block while a file streams to tape
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        StreamingDigest {
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

/// Stateless digest calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumEngine;

impl ChecksumEngine {
    pub fn new() -> Self {
        ChecksumEngine
    }

    /// Hash a stream to completion
    ///
    /// Any read error aborts the digest; a partial digest is never returned.
    pub fn digest<R: Read>(&self, mut reader: R) -> io::Result<Digest> {
        let mut hasher = StreamingDigest::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(hasher.finalize())
    }

    /// Hash a stream and compare against an expected digest
    pub fn verify<R: Read>(&self, expected: &Digest, reader: R) -> io::Result<bool> {
        Ok(self.digest(reader)? == *expected)
    }

    /// Hash a file on disk
    pub fn digest_file<P: AsRef<Path>>(&self, path: P) -> io::Result<Digest> {
        let file = File::open(path)?;
        self.digest(file)
    }
}
