use std::sync::Arc;
use tracing::debug;

use crate::connection::WriterConnection;
use crate::token::{Token, TokenGate};
use crate::{ObjectMetadata, PersistedState, RpcMetadata, StorageResult, WritePayload};

/// User-facing write handle.
///
/// `write`, `flush` and `query` consume the current token and mint the next
/// one. `finalize` and every error are terminal.
pub struct ObjectWriter {
    conn: Arc<dyn WriterConnection>,
    gate: TokenGate,
}

impl ObjectWriter {
    /// Wrap `conn`, returning the handle and the token for its first call
    pub fn new(conn: Arc<dyn WriterConnection>) -> (Self, Token) {
        let gate = TokenGate::new();
        let token = gate.issue();
        (Self { conn, gate }, token)
    }

    pub fn upload_id(&self) -> String {
        self.conn.upload_id()
    }

    pub fn persisted_state(&self) -> PersistedState {
        self.conn.persisted_state()
    }

    pub async fn write(&self, token: Token, payload: WritePayload) -> StorageResult<Token> {
        self.gate.redeem(token)?;
        let result = self.conn.write(payload).await;
        self.advance(result).map(|(_, token)| token)
    }

    pub async fn flush(&self, token: Token, payload: WritePayload) -> StorageResult<Token> {
        self.gate.redeem(token)?;
        let result = self.conn.flush(payload).await;
        self.advance(result).map(|(_, token)| token)
    }

    /// Persisted size reported by the service
    pub async fn query(&self, token: Token) -> StorageResult<(i64, Token)> {
        self.gate.redeem(token)?;
        let result = self.conn.query().await;
        self.advance(result)
    }

    pub async fn finalize(&self, token: Token, payload: WritePayload) -> StorageResult<ObjectMetadata> {
        self.gate.redeem(token)?;
        let result = self.conn.finalize(payload).await;
        self.gate.close();
        result
    }

    pub fn cancel(&self) {
        self.conn.cancel();
    }

    pub fn request_metadata(&self) -> RpcMetadata {
        self.conn.request_metadata()
    }

    fn advance<T>(&self, result: StorageResult<T>) -> StorageResult<(T, Token)> {
        match result {
            Ok(value) => Ok((value, self.gate.issue())),
            Err(e) => {
                debug!("Write handle closed: {}", e);
                self.gate.close();
                Err(e)
            }
        }
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if self.gate.is_closed() {
            return;
        }
        // Stream connections drain themselves once the last reference goes
        self.gate.close();
        self.conn.cancel();
    }
}
