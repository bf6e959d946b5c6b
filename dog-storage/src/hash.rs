//! Integrity checks for streamed object data.
//!
//! Hash functions are fed by absolute object offset, so data resent after a
//! reconnect is hashed exactly once and gaps are detected. Digests use the
//! service encoding: base64 of the big-endian CRC32C value and of the raw MD5
//! digest.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{StorageError, StorageResult};

/// Full-object checksums, base64 encoded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashValues {
    pub crc32c: Option<String>,
    pub md5: Option<String>,
}

impl HashValues {
    pub fn is_empty(&self) -> bool {
        self.crc32c.is_none() && self.md5.is_none()
    }

    /// Keep the values already set, fill the missing ones from `other`
    pub fn merge(&mut self, other: &HashValues) {
        if self.crc32c.is_none() {
            self.crc32c = other.crc32c.clone();
        }
        if self.md5.is_none() {
            self.md5 = other.md5.clone();
        }
    }
}

impl fmt::Display for HashValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "crc32c={}, md5={}",
            self.crc32c.as_deref().unwrap_or("<none>"),
            self.md5.as_deref().unwrap_or("<none>")
        )
    }
}

/// Encode a CRC32C value the way the service reports it
pub fn encode_crc32c(value: u32) -> String {
    STANDARD.encode(value.to_be_bytes())
}

/// Encode an MD5 digest the way the service reports it
pub fn encode_md5(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Incremental hash over object bytes addressed by absolute offset
pub trait HashFunction: Send {
    fn name(&self) -> &'static str;

    /// Feed `data` located at `offset`. `crc32c` is the checksum the service
    /// attached to this chunk, if any.
    fn update(&mut self, offset: i64, data: &[u8], crc32c: Option<u32>) -> StorageResult<()>;

    /// Final digests; calling this more than once returns the same values
    fn finish(&mut self) -> HashValues;
}

/// Returns the part of `data` past `minimum_offset`.
fn unseen_suffix(minimum_offset: i64, offset: i64, data: &[u8]) -> StorageResult<Option<&[u8]>> {
    if offset > minimum_offset {
        return Err(StorageError::failed_precondition(format!(
            "hash input has a gap: expected offset {}, got {}",
            minimum_offset, offset
        )));
    }
    let end = offset + data.len() as i64;
    if end <= minimum_offset {
        return Ok(None);
    }
    Ok(Some(&data[(minimum_offset - offset) as usize..]))
}

fn verify_chunk_crc32c(data: &[u8], expected: Option<u32>) -> StorageResult<()> {
    if let Some(expected) = expected {
        let actual = crc32c::crc32c(data);
        if actual != expected {
            return Err(StorageError::HashMismatch {
                received: encode_crc32c(expected),
                computed: encode_crc32c(actual),
            });
        }
    }
    Ok(())
}

/// CRC32C over the object, verifying per-chunk checksums on the way
#[derive(Debug, Default)]
pub struct Crc32cHashFunction {
    minimum_offset: i64,
    current: u32,
}

impl Crc32cHashFunction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashFunction for Crc32cHashFunction {
    fn name(&self) -> &'static str {
        "crc32c"
    }

    fn update(&mut self, offset: i64, data: &[u8], crc32c: Option<u32>) -> StorageResult<()> {
        verify_chunk_crc32c(data, crc32c)?;
        if let Some(suffix) = unseen_suffix(self.minimum_offset, offset, data)? {
            self.current = crc32c::crc32c_append(self.current, suffix);
            self.minimum_offset += suffix.len() as i64;
        }
        Ok(())
    }

    fn finish(&mut self) -> HashValues {
        HashValues {
            crc32c: Some(encode_crc32c(self.current)),
            md5: None,
        }
    }
}

/// MD5 over the object
pub struct Md5HashFunction {
    minimum_offset: i64,
    context: md5::Context,
    digest: Option<String>,
}

impl Md5HashFunction {
    pub fn new() -> Self {
        Self {
            minimum_offset: 0,
            context: md5::Context::new(),
            digest: None,
        }
    }
}

impl Default for Md5HashFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl HashFunction for Md5HashFunction {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn update(&mut self, offset: i64, data: &[u8], _crc32c: Option<u32>) -> StorageResult<()> {
        if self.digest.is_some() {
            return Err(StorageError::failed_precondition("md5 hash already finished"));
        }
        if let Some(suffix) = unseen_suffix(self.minimum_offset, offset, data)? {
            self.context.consume(suffix);
            self.minimum_offset += suffix.len() as i64;
        }
        Ok(())
    }

    fn finish(&mut self) -> HashValues {
        let digest = self
            .digest
            .get_or_insert_with(|| encode_md5(&self.context.clone().compute().0))
            .clone();
        HashValues {
            crc32c: None,
            md5: Some(digest),
        }
    }
}

/// Runs two hash functions side by side
pub struct CompositeHashFunction {
    a: Box<dyn HashFunction>,
    b: Box<dyn HashFunction>,
}

impl CompositeHashFunction {
    pub fn new(a: Box<dyn HashFunction>, b: Box<dyn HashFunction>) -> Self {
        Self { a, b }
    }
}

impl HashFunction for CompositeHashFunction {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn update(&mut self, offset: i64, data: &[u8], crc32c: Option<u32>) -> StorageResult<()> {
        self.a.update(offset, data, crc32c)?;
        self.b.update(offset, data, crc32c)
    }

    fn finish(&mut self) -> HashValues {
        let mut values = self.a.finish();
        values.merge(&self.b.finish());
        values
    }
}

/// Accepts everything, computes nothing
#[derive(Debug, Default)]
pub struct NullHashFunction;

impl HashFunction for NullHashFunction {
    fn name(&self) -> &'static str {
        "null"
    }

    fn update(&mut self, _offset: i64, _data: &[u8], _crc32c: Option<u32>) -> StorageResult<()> {
        Ok(())
    }

    fn finish(&mut self) -> HashValues {
        HashValues::default()
    }
}

/// Verifies per-chunk CRC32C values without digesting the object.
///
/// Suits reads that start anywhere in the object, where no full-object hash
/// can be computed.
#[derive(Debug, Default)]
pub struct ChunkCrc32cHashFunction;

impl HashFunction for ChunkCrc32cHashFunction {
    fn name(&self) -> &'static str {
        "chunk-crc32c"
    }

    fn update(&mut self, _offset: i64, data: &[u8], crc32c: Option<u32>) -> StorageResult<()> {
        verify_chunk_crc32c(data, crc32c)
    }

    fn finish(&mut self) -> HashValues {
        HashValues::default()
    }
}

/// Outcome of comparing received and computed digests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashValidationResult {
    pub received: HashValues,
    pub computed: HashValues,
    pub is_mismatch: bool,
}

impl HashValidationResult {
    pub fn into_result(self) -> StorageResult<()> {
        if self.is_mismatch {
            return Err(StorageError::HashMismatch {
                received: self.received.to_string(),
                computed: self.computed.to_string(),
            });
        }
        Ok(())
    }
}

/// Compares the checksums reported by the service against computed ones.
/// Only digests present on both sides are compared.
#[derive(Debug, Clone, Default)]
pub struct HashValidator {
    received: HashValues,
}

impl HashValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_hash_values(&mut self, received: &HashValues) {
        self.received.merge(received);
    }

    pub fn finish(&self, computed: HashValues) -> HashValidationResult {
        let differs = |a: &Option<String>, b: &Option<String>| matches!((a, b), (Some(a), Some(b)) if a != b);
        let is_mismatch =
            differs(&self.received.crc32c, &computed.crc32c) || differs(&self.received.md5, &computed.md5);
        HashValidationResult {
            received: self.received.clone(),
            computed,
            is_mismatch,
        }
    }
}
