use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::rpc::{BidiReadRequest, BidiReadResponse, BidiReadStream};
use crate::{
    ObjectMetadata, PersistedState, ReadPayload, RpcMetadata, StorageError, StorageResult,
    WriteObjectRequest, WritePayload,
};

/// Pull-based source of object bytes
#[async_trait]
pub trait ReaderConnection: Send + Sync {
    /// `Ok(Some)` for data, `Ok(None)` at the end of the stream
    async fn read(&self) -> StorageResult<Option<ReadPayload>>;

    /// Abort the current stream; idempotent
    fn cancel(&self);

    fn request_metadata(&self) -> RpcMetadata;
}

/// Upload connection exposing the service's view of write progress
#[async_trait]
pub trait WriterConnection: Send + Sync {
    fn upload_id(&self) -> String;

    /// Persisted state as of the last successful query or open
    fn persisted_state(&self) -> PersistedState;

    async fn write(&self, payload: WritePayload) -> StorageResult<()>;

    /// Write and ask the service to persist everything sent so far
    async fn flush(&self, payload: WritePayload) -> StorageResult<()>;

    /// Ask the service how many bytes it has persisted
    async fn query(&self) -> StorageResult<i64>;

    async fn finalize(&self, payload: WritePayload) -> StorageResult<ObjectMetadata>;

    fn cancel(&self);

    fn request_metadata(&self) -> RpcMetadata;
}

/// Opens a reader positioned at `offset`, pinned to `generation` when known
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    async fn open(
        &self,
        generation: Option<i64>,
        offset: i64,
    ) -> StorageResult<Arc<dyn ReaderConnection>>;
}

/// Opens a writer connection for `request`
#[async_trait]
pub trait WriterFactory: Send + Sync {
    async fn open(&self, request: WriteObjectRequest) -> StorageResult<Arc<dyn WriterConnection>>;
}

/// A started bidi read stream and its first response
pub struct OpenedReadStream {
    pub stream: BidiReadStream,
    pub first_response: BidiReadResponse,
}

/// Opens bidi read streams for an object descriptor
#[async_trait]
pub trait DescriptorStreamFactory: Send + Sync {
    async fn open(&self, request: BidiReadRequest) -> StorageResult<OpenedReadStream>;
}

#[async_trait]
impl<F, Fut> ReaderFactory for F
where
    F: Fn(Option<i64>, i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StorageResult<Arc<dyn ReaderConnection>>> + Send + 'static,
{
    async fn open(
        &self,
        generation: Option<i64>,
        offset: i64,
    ) -> StorageResult<Arc<dyn ReaderConnection>> {
        (self)(generation, offset).await
    }
}

#[async_trait]
impl<F, Fut> WriterFactory for F
where
    F: Fn(WriteObjectRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StorageResult<Arc<dyn WriterConnection>>> + Send + 'static,
{
    async fn open(&self, request: WriteObjectRequest) -> StorageResult<Arc<dyn WriterConnection>> {
        (self)(request).await
    }
}

#[async_trait]
impl<F, Fut> DescriptorStreamFactory for F
where
    F: Fn(BidiReadRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StorageResult<OpenedReadStream>> + Send + 'static,
{
    async fn open(&self, request: BidiReadRequest) -> StorageResult<OpenedReadStream> {
        (self)(request).await
    }
}

/// Start `stream`, send `request` and wait for the first response.
///
/// Building block for [`DescriptorStreamFactory`] implementations.
pub async fn open_read_stream(
    stream: BidiReadStream,
    request: BidiReadRequest,
) -> StorageResult<OpenedReadStream> {
    if !stream.start().await {
        return Err(finish_error(&stream).await);
    }
    if !stream.write(request).await {
        return Err(finish_error(&stream).await);
    }
    match stream.read().await {
        Some(first_response) => Ok(OpenedReadStream {
            stream,
            first_response,
        }),
        None => Err(finish_error(&stream).await),
    }
}

async fn finish_error(stream: &BidiReadStream) -> StorageError {
    match stream.finish().await {
        Err(e) => e,
        Ok(()) => StorageError::unavailable("read stream closed before the first response"),
    }
}
