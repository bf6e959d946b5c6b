use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::{
    HashValues, ObjectMetadata, PersistedState, RpcMetadata, StorageResult, WriteObjectRequest,
};

/// A started-on-demand bidirectional streaming RPC.
///
/// `start`, `read` and `write` report only whether the stream is still usable;
/// the definitive status of a broken stream comes from `finish`.
#[async_trait]
pub trait StreamingRpc<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Begin the stream, `false` if it never started
    async fn start(&self) -> bool;

    /// Next response, `None` once the stream has no more data
    async fn read(&self) -> Option<Resp>;

    /// Send one request, `false` if the stream is broken
    async fn write(&self, request: Req) -> bool;

    /// Final status of the stream
    async fn finish(&self) -> StorageResult<()>;

    /// Ask the transport to abort the stream; safe to call at any time
    fn cancel(&self);

    /// Headers and trailers received so far
    fn request_metadata(&self) -> RpcMetadata;
}

/// Shared handle to a bidi read stream
pub type BidiReadStream = Arc<dyn StreamingRpc<BidiReadRequest, BidiReadResponse>>;

/// Shared handle to a bidi write stream
pub type BidiWriteStream = Arc<dyn StreamingRpc<BidiWriteRequest, BidiWriteResponse>>;

/// Identifies the object opened by a bidi read stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadObjectSpec {
    pub bucket: String,
    pub object: String,
    pub generation: Option<i64>,
    /// Opaque handle returned by the service to speed up reopening
    pub read_handle: Option<Bytes>,
}

impl ReadObjectSpec {
    pub fn new<B: Into<String>, O: Into<String>>(bucket: B, object: O) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// One byte range requested on a bidi read stream; `length == 0` reads to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub read_id: i64,
    pub offset: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidiReadRequest {
    /// Only present on the first message of a stream
    pub spec: Option<ReadObjectSpec>,
    pub ranges: Vec<RangeRequest>,
}

/// A chunk of data for one requested range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeData {
    pub read_id: i64,
    pub offset: i64,
    pub data: Bytes,
    pub crc32c: Option<u32>,
    /// Last chunk of the range
    pub range_end: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidiReadResponse {
    pub metadata: Option<ObjectMetadata>,
    pub read_handle: Option<Bytes>,
    pub ranges: Vec<RangeData>,
}

/// First message of a write stream: resume an upload or start a new one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFirstMessage {
    UploadId(String),
    Spec(WriteObjectRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidiWriteRequest {
    pub first_message: Option<WriteFirstMessage>,
    pub write_offset: i64,
    pub data: Bytes,
    pub crc32c: Option<u32>,
    pub flush: bool,
    pub state_lookup: bool,
    pub finish_write: bool,
    pub object_checksums: Option<HashValues>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidiWriteResponse {
    pub upload_id: Option<String>,
    pub persisted: PersistedState,
}

/// Cancel `stream` and drain it in the background so the transport can
/// release its resources. Never blocks the caller.
pub(crate) fn spawn_cancel_and_drain<Req, Resp>(stream: Arc<dyn StreamingRpc<Req, Resp>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    stream.cancel();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                while stream.read().await.is_some() {}
                let status = stream.finish().await;
                debug!("Drained cancelled stream: {:?}", status);
            });
        }
        Err(_) => debug!("No runtime available, cancelled stream without draining"),
    }
}
