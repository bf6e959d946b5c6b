use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::ReaderConnection;
use crate::token::{Token, TokenGate};
use crate::{ByteStream, ReadPayload, RpcMetadata, StorageResult};

/// User-facing read handle.
///
/// Each `read` consumes the token minted by the previous call, so at most one
/// read is in flight. The end of the stream and any error are terminal: they
/// hand back [`Token::default()`] and close the handle.
///
/// ```rust,no_run
/// # use dog_storage::prelude::*;
/// # async fn run(conn: std::sync::Arc<dyn ReaderConnection>) -> StorageResult<()> {
/// let (reader, mut token) = ObjectReader::new(conn);
/// loop {
///     let (payload, next) = reader.read(token).await?;
///     let Some(payload) = payload else { break };
///     println!("{} bytes at {}", payload.len(), payload.offset);
///     token = next;
/// }
/// # Ok(())
/// # }
/// ```
pub struct ObjectReader {
    conn: Arc<dyn ReaderConnection>,
    gate: TokenGate,
}

impl ObjectReader {
    /// Wrap `conn`, returning the handle and the token for its first read
    pub fn new(conn: Arc<dyn ReaderConnection>) -> (Self, Token) {
        let gate = TokenGate::new();
        let token = gate.issue();
        (Self { conn, gate }, token)
    }

    pub async fn read(&self, token: Token) -> StorageResult<(Option<ReadPayload>, Token)> {
        self.gate.redeem(token)?;
        match self.conn.read().await {
            Ok(Some(payload)) => Ok((Some(payload), self.gate.issue())),
            Ok(None) => {
                self.gate.close();
                Ok((None, Token::default()))
            }
            Err(e) => {
                debug!("Read handle closed: {}", e);
                self.gate.close();
                Err(e)
            }
        }
    }

    /// Abort the underlying stream; the pending or next read resolves with
    /// the connection's cancellation status
    pub fn cancel(&self) {
        self.conn.cancel();
    }

    pub fn request_metadata(&self) -> RpcMetadata {
        self.conn.request_metadata()
    }

    /// Consume the handle as a stream of payload bytes
    pub fn into_stream(self, token: Token) -> ByteStream {
        Box::pin(async_stream::stream! {
            let mut token = token;
            loop {
                match self.read(token).await {
                    Ok((Some(payload), next)) => {
                        token = next;
                        yield Ok(payload.data);
                    }
                    Ok((None, _)) => break,
                    Err(e) => {
                        yield Err(std::io::Error::other(e));
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for ObjectReader {
    fn drop(&mut self) {
        if self.gate.is_closed() {
            return;
        }
        self.gate.close();
        self.conn.cancel();

        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    loop {
                        match conn.read().await {
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(e) => {
                                debug!("Drained dropped reader: {}", e);
                                break;
                            }
                        }
                    }
                });
            }
            Err(_) => warn!("Reader dropped outside a runtime, cancelled without draining"),
        }
    }
}
