use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::WriterConnection;
use crate::hash::{HashFunction, NullHashFunction};
use crate::rpc::{spawn_cancel_and_drain, BidiWriteRequest, BidiWriteStream, WriteFirstMessage};
use crate::{
    ObjectMetadata, PersistedState, RpcMetadata, StatusCode, StorageError, StorageResult,
    WriteObjectRequest, WritePayload,
};

struct RpcWriterState {
    upload_id: String,
    /// Object offset of the next byte sent
    offset: i64,
    persisted: PersistedState,
    /// Full-object hash, only meaningful when the stream started at offset 0
    hash: Box<dyn HashFunction>,
}

/// [`WriterConnection`] over one bidi write stream
pub struct RpcWriterConnection {
    stream: BidiWriteStream,
    state: Mutex<RpcWriterState>,
}

impl RpcWriterConnection {
    /// Start `stream` for `request` and learn what the service has persisted.
    ///
    /// Requests carrying an upload id resume that upload, others start a new
    /// one described by the request.
    pub async fn open(
        stream: BidiWriteStream,
        request: WriteObjectRequest,
        hash: Box<dyn HashFunction>,
    ) -> StorageResult<Self> {
        if !stream.start().await {
            return Err(finish_error(&stream, "write stream did not start").await);
        }

        let first_message = match &request.upload_id {
            Some(upload_id) => WriteFirstMessage::UploadId(upload_id.clone()),
            None => WriteFirstMessage::Spec(request.clone()),
        };
        let opening = BidiWriteRequest {
            first_message: Some(first_message),
            write_offset: request.write_offset,
            state_lookup: true,
            ..Default::default()
        };
        if !stream.write(opening).await {
            return Err(finish_error(&stream, "write stream closed while opening").await);
        }
        let Some(response) = stream.read().await else {
            return Err(finish_error(&stream, "write stream closed before reporting state").await);
        };

        let upload_id = response
            .upload_id
            .or(request.upload_id)
            .unwrap_or_default();
        let offset = response.persisted.persisted_size();
        let hash: Box<dyn HashFunction> = if offset == 0 {
            hash
        } else {
            // Earlier bytes were never seen here
            Box::new(NullHashFunction)
        };
        debug!("Opened upload {} at offset {}", upload_id, offset);

        Ok(Self {
            stream,
            state: Mutex::new(RpcWriterState {
                upload_id,
                offset,
                persisted: response.persisted,
                hash,
            }),
        })
    }

    fn next_request(
        &self,
        payload: WritePayload,
        flush: bool,
        finish_write: bool,
    ) -> StorageResult<BidiWriteRequest> {
        let mut state = self.state.lock();
        let crc32c = crc32c::crc32c(&payload.data);
        let offset = state.offset;
        state.hash.update(offset, &payload.data, Some(crc32c))?;
        state.offset += payload.len() as i64;

        let object_checksums = if finish_write {
            Some(state.hash.finish()).filter(|values| !values.is_empty())
        } else {
            None
        };
        Ok(BidiWriteRequest {
            first_message: None,
            write_offset: offset,
            data: payload.data,
            crc32c: Some(crc32c),
            flush,
            state_lookup: flush || finish_write,
            finish_write,
            object_checksums,
        })
    }

    async fn send(&self, request: BidiWriteRequest) -> StorageResult<()> {
        if !self.stream.write(request).await {
            return Err(finish_error(&self.stream, "write stream closed").await);
        }
        Ok(())
    }

    async fn receive(&self) -> StorageResult<PersistedState> {
        match self.stream.read().await {
            Some(response) => {
                self.state.lock().persisted = response.persisted.clone();
                Ok(response.persisted)
            }
            None => Err(finish_error(&self.stream, "write stream closed without a response").await),
        }
    }
}

#[async_trait]
impl WriterConnection for RpcWriterConnection {
    fn upload_id(&self) -> String {
        self.state.lock().upload_id.clone()
    }

    fn persisted_state(&self) -> PersistedState {
        self.state.lock().persisted.clone()
    }

    async fn write(&self, payload: WritePayload) -> StorageResult<()> {
        let request = self.next_request(payload, false, false)?;
        self.send(request).await
    }

    async fn flush(&self, payload: WritePayload) -> StorageResult<()> {
        let mut request = self.next_request(payload, true, false)?;
        // The state comes back through `query`
        request.state_lookup = false;
        self.send(request).await
    }

    async fn query(&self) -> StorageResult<i64> {
        let request = self.next_request(WritePayload::empty(), true, false)?;
        self.send(request).await?;
        Ok(self.receive().await?.persisted_size())
    }

    async fn finalize(&self, payload: WritePayload) -> StorageResult<ObjectMetadata> {
        let request = self.next_request(payload, false, true)?;
        self.send(request).await?;
        match self.receive().await? {
            PersistedState::Finalized(object) => Ok(object),
            PersistedState::Size(size) => Err(StorageError::rpc(
                StatusCode::Internal,
                format!("finalize left the upload open at {} bytes", size),
            )),
        }
    }

    fn cancel(&self) {
        self.stream.cancel();
    }

    fn request_metadata(&self) -> RpcMetadata {
        self.stream.request_metadata()
    }
}

impl Drop for RpcWriterConnection {
    fn drop(&mut self) {
        if self.state.lock().persisted.is_finalized() {
            return;
        }
        spawn_cancel_and_drain(self.stream.clone());
    }
}

/// Status of a broken stream, `fallback` if the transport reported success
async fn finish_error(stream: &BidiWriteStream, fallback: &str) -> StorageError {
    match stream.finish().await {
        Err(e) => e,
        Ok(()) => StorageError::unavailable(fallback),
    }
}
