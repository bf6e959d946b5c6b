use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

use crate::hash::HashValues;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Metadata describing one version of a stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub name: String,
    pub generation: i64,
    pub size: i64,
    pub content_type: Option<String>,
    pub crc32c: Option<String>,
    pub md5_hash: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    pub fn new<B: Into<String>, N: Into<String>>(bucket: B, name: N) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Full-object checksums as reported by the service
    pub fn hash_values(&self) -> HashValues {
        HashValues {
            crc32c: self.crc32c.clone(),
            md5: self.md5_hash.clone(),
        }
    }
}

/// Bytes delivered by one successful read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPayload {
    pub data: Bytes,
    /// Absolute offset of `data` within the object
    pub offset: i64,
    /// Object metadata, usually only present on the first payload of a stream
    pub metadata: Option<ObjectMetadata>,
    /// Full-object checksums reported by the service
    pub object_hash: Option<HashValues>,
}

impl ReadPayload {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_object_hash(mut self, hash: HashValues) -> Self {
        self.object_hash = Some(hash);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bytes handed to a writer connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePayload {
    pub data: Bytes,
}

impl WritePayload {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self { data: data.into() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for WritePayload {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for WritePayload {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<&'static str> for WritePayload {
    fn from(data: &'static str) -> Self {
        Self {
            data: Bytes::from_static(data.as_bytes()),
        }
    }
}

/// What the service has durably stored for an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistedState {
    /// Upload in progress with this many bytes persisted
    Size(i64),
    /// Upload finalized into this object
    Finalized(ObjectMetadata),
}

impl PersistedState {
    pub fn persisted_size(&self) -> i64 {
        match self {
            Self::Size(size) => *size,
            Self::Finalized(object) => object.size,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::Size(0)
    }
}

/// Headers and trailers returned by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcMetadata {
    pub headers: BTreeMap<String, String>,
    pub trailers: BTreeMap<String, String>,
}

impl RpcMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_trailer<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.trailers.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.trailers.is_empty()
    }
}
