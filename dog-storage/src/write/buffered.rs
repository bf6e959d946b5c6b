use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::UploadProgress;
use crate::connection::{WriterConnection, WriterFactory};
use crate::{
    ObjectMetadata, PersistedState, RpcMetadata, StatusCode, StorageError, StorageResult,
    StreamConfig, WriteObjectRequest, WritePayload,
};

struct BufferState {
    conn: Arc<dyn WriterConnection>,
    progress: UploadProgress,
    cancelled: bool,
    terminal: Option<StorageError>,
}

impl BufferState {
    fn check_open(&self) -> StorageResult<()> {
        if let Some(e) = &self.terminal {
            return Err(e.clone());
        }
        if self.cancelled {
            return Err(StorageError::cancelled("writer cancelled"));
        }
        Ok(())
    }

    fn fail(&mut self, error: StorageError) -> StorageError {
        self.terminal = Some(error.clone());
        error
    }
}

/// Writer that batches small writes between two watermarks.
///
/// Bytes accumulate locally until the buffer reaches the high watermark. A
/// drain then writes everything above the low watermark, flushes the rest and
/// queries the persisted size, which must lie between what was acknowledged
/// before and what has been sent. Transient failures reopen the upload through
/// the factory and resend the unacknowledged bytes.
pub struct BufferedWriter {
    factory: Arc<dyn WriterFactory>,
    low_watermark: usize,
    high_watermark: usize,
    state: Mutex<BufferState>,
}

impl BufferedWriter {
    pub fn new(
        conn: Arc<dyn WriterConnection>,
        factory: Arc<dyn WriterFactory>,
        config: &StreamConfig,
    ) -> Self {
        let progress = UploadProgress::new(conn.as_ref());
        Self {
            factory,
            low_watermark: config.buffer_low_watermark,
            high_watermark: config.buffer_high_watermark,
            state: Mutex::new(BufferState {
                conn,
                progress,
                cancelled: false,
                terminal: None,
            }),
        }
    }

    /// Bytes held locally, acknowledged or not
    pub fn buffered(&self) -> usize {
        self.state.lock().progress.pending.len()
    }

    /// Returns the number of bytes now buffered
    fn append(&self, payload: WritePayload) -> StorageResult<usize> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.progress.persisted.is_finalized() {
            return Err(StorageError::failed_precondition("upload is already finalized"));
        }
        state.progress.pending.extend_from_slice(&payload.data);
        Ok(state.progress.pending.len())
    }

    #[instrument(skip(self))]
    async fn drain(&self, finalize: bool) -> StorageResult<Option<ObjectMetadata>> {
        loop {
            let (conn, head, tail) = {
                let state = self.state.lock();
                state.check_open()?;
                if let PersistedState::Finalized(object) = &state.progress.persisted {
                    // A reconnect found the upload already finalized
                    if finalize {
                        return Ok(Some(object.clone()));
                    }
                    return Err(StorageError::failed_precondition(
                        "upload was finalized while flushing",
                    ));
                }
                let unsent = state.progress.unsent();
                let split = unsent.len().saturating_sub(self.low_watermark);
                (
                    state.conn.clone(),
                    Bytes::copy_from_slice(&unsent[..split]),
                    Bytes::copy_from_slice(&unsent[split..]),
                )
            };

            match self.drain_once(conn, head, tail, finalize).await {
                Ok(object) => return Ok(object),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    async fn drain_once(
        &self,
        conn: Arc<dyn WriterConnection>,
        head: Bytes,
        tail: Bytes,
        finalize: bool,
    ) -> StorageResult<Option<ObjectMetadata>> {
        if !head.is_empty() {
            let size = head.len();
            conn.write(WritePayload::new(head)).await?;
            self.state.lock().progress.sent += size;
        }

        let size = tail.len();
        if finalize {
            let object = conn.finalize(WritePayload::new(tail)).await?;
            let mut state = self.state.lock();
            state.progress.sent += size;
            state.progress.finalized(object.clone())?;
            return Ok(Some(object));
        }

        conn.flush(WritePayload::new(tail)).await?;
        self.state.lock().progress.sent += size;
        let reported = conn.query().await?;
        self.state.lock().progress.acknowledge(reported)?;
        Ok(None)
    }

    /// Reopen the upload after a transient failure; anything else is terminal
    async fn recover(&self, error: StorageError) -> StorageResult<()> {
        let upload_id = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(state.fail(StorageError::cancelled("writer cancelled during drain")));
            }
            if !error.is_transient() {
                return Err(state.fail(error));
            }
            state.progress.upload_id.clone()
        };

        info!("Reopening upload {} after: {}", upload_id, error);
        let conn = match self.factory.open(WriteObjectRequest::resume(&upload_id)).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Could not reopen upload {}: {}", upload_id, e);
                return Err(self.state.lock().fail(e));
            }
        };

        let mut state = self.state.lock();
        if state.cancelled {
            conn.cancel();
            return Err(state.fail(StorageError::cancelled("writer cancelled during drain")));
        }
        if let Err(e) = state.progress.reconnected(conn.persisted_state()) {
            return Err(state.fail(e));
        }
        debug!(
            "Upload {} resumes at {}, resending {} bytes",
            upload_id,
            state.progress.acked,
            state.progress.pending.len()
        );
        state.conn = conn;
        Ok(())
    }
}

#[async_trait]
impl WriterConnection for BufferedWriter {
    fn upload_id(&self) -> String {
        self.state.lock().progress.upload_id.clone()
    }

    fn persisted_state(&self) -> PersistedState {
        self.state.lock().progress.persisted.clone()
    }

    async fn write(&self, payload: WritePayload) -> StorageResult<()> {
        if self.append(payload)? < self.high_watermark {
            return Ok(());
        }
        self.drain(false).await.map(|_| ())
    }

    async fn flush(&self, payload: WritePayload) -> StorageResult<()> {
        self.append(payload)?;
        self.drain(false).await.map(|_| ())
    }

    async fn query(&self) -> StorageResult<i64> {
        loop {
            let conn = {
                let state = self.state.lock();
                state.check_open()?;
                if let PersistedState::Finalized(object) = &state.progress.persisted {
                    return Ok(object.size);
                }
                state.conn.clone()
            };

            let result = match conn.query().await {
                Ok(reported) => self
                    .state
                    .lock()
                    .progress
                    .acknowledge(reported)
                    .map(|_| reported),
                Err(e) => Err(e),
            };
            match result {
                Ok(reported) => return Ok(reported),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    async fn finalize(&self, payload: WritePayload) -> StorageResult<ObjectMetadata> {
        if let PersistedState::Finalized(object) = self.persisted_state() {
            return Ok(object);
        }
        self.append(payload)?;
        self.drain(true).await?.ok_or_else(|| {
            StorageError::rpc(StatusCode::Internal, "finalize returned no object metadata")
        })
    }

    fn cancel(&self) {
        let conn = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.conn.clone()
        };
        conn.cancel();
    }

    fn request_metadata(&self) -> RpcMetadata {
        self.state.lock().conn.request_metadata()
    }
}
