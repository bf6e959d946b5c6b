use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::UploadProgress;
use crate::connection::{WriterConnection, WriterFactory};
use crate::{
    ObjectMetadata, PersistedState, RpcMetadata, StorageError, StorageResult, WriteObjectRequest,
    WritePayload,
};

struct ResumedState {
    conn: Arc<dyn WriterConnection>,
    progress: UploadProgress,
    cancelled: bool,
    terminal: Option<StorageError>,
}

impl ResumedState {
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

/// Unbuffered writer for streams that cannot be resumed in place.
///
/// Calls go straight to the connection. Bytes stay in memory until a query
/// acknowledges them, so an upload that is never queried is held in full
/// (see [`ResumedWriter::buffered`]). After a transient failure the stored
/// request template, patched with the upload id and the last acknowledged
/// offset, is handed to the factory for a brand new connection, and whatever
/// it has not persisted is sent again before the failed call completes.
pub struct ResumedWriter {
    factory: Arc<dyn WriterFactory>,
    template: WriteObjectRequest,
    state: Mutex<ResumedState>,
}

impl ResumedWriter {
    pub fn new(
        conn: Arc<dyn WriterConnection>,
        factory: Arc<dyn WriterFactory>,
        template: WriteObjectRequest,
    ) -> Self {
        let progress = UploadProgress::new(conn.as_ref());
        Self {
            factory,
            template,
            state: Mutex::new(ResumedState {
                conn,
                progress,
                cancelled: false,
                terminal: None,
            }),
        }
    }

    /// Bytes held until the service acknowledges them
    pub fn buffered(&self) -> usize {
        self.state.lock().progress.pending.len()
    }

    fn append(&self, payload: &WritePayload) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.progress.persisted.is_finalized() {
            return Err(StorageError::failed_precondition("upload is already finalized"));
        }
        state.progress.pending.extend_from_slice(&payload.data);
        Ok(())
    }

    /// Run `op` with the unsent bytes on the current connection, reconnecting
    /// after transient failures. Bytes a new connection already persisted are
    /// never sent twice.
    async fn with_resume<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        F: Fn(Arc<dyn WriterConnection>, Bytes) -> Fut + Send + Sync,
        Fut: Future<Output = StorageResult<T>> + Send,
        T: Send,
    {
        loop {
            let (conn, unsent) = {
                let state = self.state.lock();
                state.check_open()?;
                if state.progress.persisted.is_finalized() {
                    return Err(StorageError::failed_precondition("upload is already finalized"));
                }
                (
                    state.conn.clone(),
                    Bytes::copy_from_slice(state.progress.unsent()),
                )
            };

            let size = unsent.len();
            match op(conn, unsent).await {
                Ok(value) => {
                    self.state.lock().progress.sent += size;
                    return Ok(value);
                }
                Err(e) => self.recover(e).await?,
            }
        }
    }

    #[instrument(skip(self))]
    async fn recover(&self, error: StorageError) -> StorageResult<()> {
        let request = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(state.fail(StorageError::cancelled("writer cancelled")));
            }
            if !error.is_transient() {
                return Err(state.fail(error));
            }
            self.template
                .clone()
                .with_upload_id(state.progress.upload_id.clone())
                .with_write_offset(state.progress.acked)
        };

        info!(
            "Replacing connection for upload {:?} at offset {} after: {}",
            request.upload_id, request.write_offset, error
        );
        let conn = match self.factory.open(request).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Could not replace upload connection: {}", e);
                return Err(self.state.lock().fail(e));
            }
        };

        let mut state = self.state.lock();
        if state.cancelled {
            conn.cancel();
            return Err(state.fail(StorageError::cancelled("writer cancelled")));
        }
        if let Err(e) = state.progress.reconnected(conn.persisted_state()) {
            return Err(state.fail(e));
        }
        debug!(
            "Resending {} unacknowledged bytes from {}",
            state.progress.pending.len(),
            state.progress.acked
        );
        state.conn = conn;
        Ok(())
    }
}

#[async_trait]
impl WriterConnection for ResumedWriter {
    fn upload_id(&self) -> String {
        self.state.lock().progress.upload_id.clone()
    }

    fn persisted_state(&self) -> PersistedState {
        self.state.lock().progress.persisted.clone()
    }

    async fn write(&self, payload: WritePayload) -> StorageResult<()> {
        self.append(&payload)?;
        self.with_resume(|conn, unsent| async move {
            if unsent.is_empty() {
                return Ok(());
            }
            conn.write(WritePayload::new(unsent)).await
        })
        .await
    }

    async fn flush(&self, payload: WritePayload) -> StorageResult<()> {
        self.append(&payload)?;
        self.with_resume(|conn, unsent| async move { conn.flush(WritePayload::new(unsent)).await })
            .await
    }

    async fn query(&self) -> StorageResult<i64> {
        if let PersistedState::Finalized(object) = self.persisted_state() {
            return Ok(object.size);
        }
        let reported = self
            .with_resume(|conn, unsent| async move {
                if !unsent.is_empty() {
                    conn.write(WritePayload::new(unsent)).await?;
                }
                conn.query().await
            })
            .await?;
        let mut state = self.state.lock();
        match state.progress.acknowledge(reported) {
            Ok(()) => Ok(reported),
            Err(e) => Err(state.fail(e)),
        }
    }

    async fn finalize(&self, payload: WritePayload) -> StorageResult<ObjectMetadata> {
        if let PersistedState::Finalized(object) = self.persisted_state() {
            return Ok(object);
        }
        self.append(&payload)?;
        let result = self
            .with_resume(|conn, unsent| async move { conn.finalize(WritePayload::new(unsent)).await })
            .await;
        let object = match result {
            Ok(object) => object,
            // A replacement connection may find the upload already finalized
            Err(e) => match self.persisted_state() {
                PersistedState::Finalized(object) => return Ok(object),
                PersistedState::Size(_) => return Err(e),
            },
        };

        let mut state = self.state.lock();
        if let Err(e) = state.progress.finalized(object.clone()) {
            return Err(state.fail(e));
        }
        Ok(object)
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
