use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::rpc::StreamingRpc;
use crate::{RpcMetadata, StorageResult, StreamConfig};

/// Source of relative timers
#[async_trait]
pub trait CompletionQueue: Send + Sync {
    /// Resolves once `duration` has elapsed; an error means the timer could
    /// not be armed
    async fn make_relative_timer(&self, duration: Duration) -> StorageResult<Instant>;
}

/// Timers backed by the tokio runtime
#[derive(Debug, Clone, Default)]
pub struct TokioCompletionQueue;

#[async_trait]
impl CompletionQueue for TokioCompletionQueue {
    async fn make_relative_timer(&self, duration: Duration) -> StorageResult<Instant> {
        tokio::time::sleep(duration).await;
        Ok(Instant::now())
    }
}

/// Bounds how long `start`, `read` and `write` may take on a wrapped stream.
///
/// When a timer wins the race the wrapped stream is cancelled and the call
/// reports failure; `finish` then returns the transport's status.
pub struct TimeoutGuardedStream<Req, Resp> {
    inner: Arc<dyn StreamingRpc<Req, Resp>>,
    cq: Arc<dyn CompletionQueue>,
    start_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<Req, Resp> TimeoutGuardedStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(inner: Arc<dyn StreamingRpc<Req, Resp>>, cq: Arc<dyn CompletionQueue>) -> Self {
        Self {
            inner,
            cq,
            start_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Wrap `inner` with the timeouts from `config`
    pub fn from_config(
        inner: Arc<dyn StreamingRpc<Req, Resp>>,
        cq: Arc<dyn CompletionQueue>,
        config: &StreamConfig,
    ) -> Self {
        Self::new(inner, cq)
            .with_start_timeout(config.start_timeout)
            .with_read_timeout(config.read_timeout)
            .with_write_timeout(config.write_timeout)
    }

    pub fn with_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    async fn race<T, F>(&self, op: F, timeout: Option<Duration>, on_timeout: T, what: &str) -> T
    where
        F: Future<Output = T> + Send,
    {
        let Some(duration) = timeout else {
            return op.await;
        };

        let timer = async {
            if let Err(e) = self.cq.make_relative_timer(duration).await {
                // Unarmed timers never fire
                debug!("Could not arm {} timer: {}", what, e);
                futures::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            result = op => result,
            _ = timer => {
                warn!("Stream {} timed out after {:?}, cancelling", what, duration);
                self.inner.cancel();
                on_timeout
            }
        }
    }
}

#[async_trait]
impl<Req, Resp> StreamingRpc<Req, Resp> for TimeoutGuardedStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn start(&self) -> bool {
        self.race(self.inner.start(), self.start_timeout, false, "start")
            .await
    }

    async fn read(&self) -> Option<Resp> {
        self.race(self.inner.read(), self.read_timeout, None, "read")
            .await
    }

    async fn write(&self, request: Req) -> bool {
        self.race(self.inner.write(request), self.write_timeout, false, "write")
            .await
    }

    async fn finish(&self) -> StorageResult<()> {
        self.inner.finish().await
    }

    fn cancel(&self) {
        self.inner.cancel();
    }

    fn request_metadata(&self) -> RpcMetadata {
        self.inner.request_metadata()
    }
}
