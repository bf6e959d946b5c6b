//! Write path: buffered and reconnecting writers, the bidi-stream connection
//! and the token-sequenced [`ObjectWriter`] handle.

mod buffered;
mod resumed;
mod rpc_writer;
mod writer;

pub use buffered::BufferedWriter;
pub use resumed::ResumedWriter;
pub use rpc_writer::RpcWriterConnection;
pub use writer::ObjectWriter;

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::connection::WriterConnection;
use crate::{ObjectMetadata, PersistedState, StorageError, StorageResult};

/// Fails with [`StorageError::Desync`] unless `reported` lies between the last
/// acknowledged size and the total number of bytes sent
pub(crate) fn reconcile(upload_id: &str, acked: i64, sent: i64, reported: i64) -> StorageResult<()> {
    if reported < acked || reported > sent {
        warn!(
            "Upload {} desync: persisted size {} outside [{}, {}]",
            upload_id, reported, acked, sent
        );
        return Err(StorageError::Desync {
            upload_id: upload_id.to_string(),
            resend_offset: acked,
            persisted_size: reported,
        });
    }
    Ok(())
}

/// Client-side view of an upload: what the service acknowledged and the bytes
/// past that point which may need resending
#[derive(Debug)]
pub(crate) struct UploadProgress {
    pub upload_id: String,
    pub acked: i64,
    /// Bytes past `acked`, oldest first
    pub pending: BytesMut,
    /// Prefix of `pending` already sent on the current connection
    pub sent: usize,
    pub persisted: PersistedState,
}

impl UploadProgress {
    pub fn new(conn: &dyn WriterConnection) -> Self {
        let persisted = conn.persisted_state();
        Self {
            upload_id: conn.upload_id(),
            acked: persisted.persisted_size(),
            pending: BytesMut::new(),
            sent: 0,
            persisted,
        }
    }

    pub fn unsent(&self) -> &[u8] {
        &self.pending[self.sent..]
    }

    /// Accept a persisted size reported by the service
    pub fn acknowledge(&mut self, reported: i64) -> StorageResult<()> {
        reconcile(
            &self.upload_id,
            self.acked,
            self.acked + self.sent as i64,
            reported,
        )?;
        let advance = (reported - self.acked) as usize;
        self.pending.advance(advance);
        self.sent -= advance;
        self.acked = reported;
        self.persisted = PersistedState::Size(reported);
        Ok(())
    }

    pub fn finalized(&mut self, object: ObjectMetadata) -> StorageResult<()> {
        reconcile(
            &self.upload_id,
            self.acked,
            self.acked + self.pending.len() as i64,
            object.size,
        )?;
        self.pending.clear();
        self.sent = 0;
        self.acked = object.size;
        self.persisted = PersistedState::Finalized(object);
        Ok(())
    }

    /// Adopt the state of a fresh connection; everything unacknowledged is
    /// sent again from the new persisted size.
    ///
    /// Bytes of the call that broke the old connection may have reached the
    /// service, so anything held locally counts as sent.
    pub fn reconnected(&mut self, state: PersistedState) -> StorageResult<()> {
        self.sent = self.pending.len();
        match state {
            PersistedState::Size(size) => self.acknowledge(size)?,
            PersistedState::Finalized(object) => self.finalized(object)?,
        }
        self.sent = 0;
        Ok(())
    }
}
