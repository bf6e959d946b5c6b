//! Scripted fakes of the transport and connection traits.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use dog_storage::{
    CompletionQueue, ObjectMetadata, PersistedState, ReadPayload, ReaderConnection, RpcMetadata,
    StorageError, StorageResult, StreamingRpc, WritePayload, WriterConnection,
};

/// Poll `condition` until it holds, failing the test after a second
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("Timeout waiting for condition");
}

// ---------------------------------------------------------------------------
// Readers

/// Reader returning a fixed script, then end of stream
pub struct ScriptedReader {
    script: Mutex<VecDeque<StorageResult<Option<ReadPayload>>>>,
    metadata: RpcMetadata,
    reads: AtomicUsize,
    cancels: AtomicUsize,
}

impl ScriptedReader {
    pub fn new(script: Vec<StorageResult<Option<ReadPayload>>>) -> Arc<Self> {
        Self::with_metadata(script, RpcMetadata::default())
    }

    pub fn with_metadata(
        script: Vec<StorageResult<Option<ReadPayload>>>,
        metadata: RpcMetadata,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            metadata,
            reads: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    /// Reader yielding one payload per string, then `ending`
    pub fn chunks(chunks: &[&'static str], ending: StorageResult<Option<ReadPayload>>) -> Arc<Self> {
        let mut script: Vec<_> = chunks
            .iter()
            .map(|chunk| Ok(Some(ReadPayload::new(Bytes::from_static(chunk.as_bytes())))))
            .collect();
        script.push(ending);
        Self::new(script)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl ReaderConnection for ScriptedReader {
    async fn read(&self) -> StorageResult<Option<ReadPayload>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(Ok(None))
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn request_metadata(&self) -> RpcMetadata {
        self.metadata.clone()
    }
}

// ---------------------------------------------------------------------------
// Writers

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterOp {
    Write(usize),
    Flush(usize),
    Query,
    Finalize(usize),
}

struct FakeWriterState {
    ops: Vec<WriterOp>,
    received: i64,
    queries: VecDeque<StorageResult<i64>>,
    failures: VecDeque<StorageError>,
    flush_failures: VecDeque<StorageError>,
    block_writes: bool,
}

/// Writer connection recording every call. Queries report everything
/// received unless scripted otherwise.
pub struct FakeWriter {
    upload_id: String,
    initial: PersistedState,
    state: Mutex<FakeWriterState>,
    entered: Notify,
    released: Notify,
    cancels: AtomicUsize,
}

impl FakeWriter {
    pub fn new(upload_id: &str, persisted: PersistedState) -> Arc<Self> {
        Arc::new(Self {
            upload_id: upload_id.to_string(),
            initial: persisted,
            state: Mutex::new(FakeWriterState {
                ops: Vec::new(),
                received: 0,
                queries: VecDeque::new(),
                failures: VecDeque::new(),
                flush_failures: VecDeque::new(),
                block_writes: false,
            }),
            entered: Notify::new(),
            released: Notify::new(),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn at(upload_id: &str, persisted_size: i64) -> Arc<Self> {
        Self::new(upload_id, PersistedState::Size(persisted_size))
    }

    pub fn script_query(&self, result: StorageResult<i64>) {
        self.state.lock().queries.push_back(result);
    }

    /// The next data-carrying call fails with `error`
    pub fn fail_next(&self, error: StorageError) {
        self.state.lock().failures.push_back(error);
    }

    /// The next flush fails with `error`
    pub fn fail_next_flush(&self, error: StorageError) {
        self.state.lock().flush_failures.push_back(error);
    }

    /// Writes park until the connection is cancelled
    pub fn block_writes(&self) {
        self.state.lock().block_writes = true;
    }

    /// Resolves once a write has parked
    pub async fn write_entered(&self) {
        self.entered.notified().await;
    }

    pub fn ops(&self) -> Vec<WriterOp> {
        self.state.lock().ops.clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    async fn accept(&self, op: WriterOp, size: usize) -> StorageResult<()> {
        let blocked = {
            let mut state = self.state.lock();
            let is_flush = matches!(op, WriterOp::Flush(_));
            state.ops.push(op);
            if is_flush {
                if let Some(error) = state.flush_failures.pop_front() {
                    return Err(error);
                }
            }
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.block_writes
        };
        if blocked {
            self.entered.notify_one();
            self.released.notified().await;
            return Err(StorageError::cancelled("fake writer cancelled"));
        }
        self.state.lock().received += size as i64;
        Ok(())
    }
}

#[async_trait]
impl WriterConnection for FakeWriter {
    fn upload_id(&self) -> String {
        self.upload_id.clone()
    }

    fn persisted_state(&self) -> PersistedState {
        self.initial.clone()
    }

    async fn write(&self, payload: WritePayload) -> StorageResult<()> {
        self.accept(WriterOp::Write(payload.len()), payload.len()).await
    }

    async fn flush(&self, payload: WritePayload) -> StorageResult<()> {
        self.accept(WriterOp::Flush(payload.len()), payload.len()).await
    }

    async fn query(&self) -> StorageResult<i64> {
        let mut state = self.state.lock();
        state.ops.push(WriterOp::Query);
        if let Some(result) = state.queries.pop_front() {
            return result;
        }
        Ok(self.initial.persisted_size() + state.received)
    }

    async fn finalize(&self, payload: WritePayload) -> StorageResult<ObjectMetadata> {
        self.accept(WriterOp::Finalize(payload.len()), payload.len())
            .await?;
        let size = self.initial.persisted_size() + self.state.lock().received;
        Ok(ObjectMetadata::new("test-bucket", "test-object")
            .with_generation(1)
            .with_size(size))
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.released.notify_one();
    }

    fn request_metadata(&self) -> RpcMetadata {
        RpcMetadata::new().with_header("x-upload-id", self.upload_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Streams

/// Bidi stream driven by the test: responses are pushed explicitly and
/// `start` can be held until released
pub struct ScriptedStream<Req, Resp> {
    hold_start: AtomicBool,
    start_ok: AtomicBool,
    start_released: Notify,
    hold_writes: AtomicBool,
    write_released: Notify,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Resp>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Resp>>>,
    writes: Mutex<Vec<Req>>,
    finish: Mutex<StorageResult<()>>,
    cancelled: AtomicBool,
    cancel_signal: Notify,
    cancels: AtomicUsize,
    metadata: Mutex<RpcMetadata>,
}

impl<Req, Resp> ScriptedStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            hold_start: AtomicBool::new(false),
            start_ok: AtomicBool::new(true),
            start_released: Notify::new(),
            hold_writes: AtomicBool::new(false),
            write_released: Notify::new(),
            responses: tokio::sync::Mutex::new(receiver),
            sender: Mutex::new(Some(sender)),
            writes: Mutex::new(Vec::new()),
            finish: Mutex::new(Ok(())),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            cancels: AtomicUsize::new(0),
            metadata: Mutex::new(RpcMetadata::default()),
        })
    }

    pub fn hold_start(&self) {
        self.hold_start.store(true, Ordering::SeqCst);
    }

    /// Let a held `start` complete with `ok`
    pub fn release_start(&self, ok: bool) {
        self.start_ok.store(ok, Ordering::SeqCst);
        self.start_released.notify_one();
    }

    pub fn hold_writes(&self) {
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, response: Resp) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(response);
        }
    }

    /// End the response stream with `status` once queued responses are read
    pub fn close(&self, status: StorageResult<()>) {
        *self.finish.lock() = status;
        self.sender.lock().take();
    }

    pub fn set_metadata(&self, metadata: RpcMetadata) {
        *self.metadata.lock() = metadata;
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn take_writes(&self) -> Vec<Req> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

#[async_trait]
impl<Req, Resp> StreamingRpc<Req, Resp> for ScriptedStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn start(&self) -> bool {
        if self.hold_start.load(Ordering::SeqCst) {
            self.start_released.notified().await;
        }
        self.start_ok.load(Ordering::SeqCst)
    }

    async fn read(&self) -> Option<Resp> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let mut responses = self.responses.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel_signal.notified() => None,
            response = responses.recv() => response,
        }
    }

    async fn write(&self, request: Req) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.writes.lock().push(request);
        if self.hold_writes.load(Ordering::SeqCst) {
            self.write_released.notified().await;
        }
        true
    }

    async fn finish(&self) -> StorageResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(StorageError::cancelled("stream cancelled"));
        }
        self.finish.lock().clone()
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_one();
    }

    fn request_metadata(&self) -> RpcMetadata {
        self.metadata.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Timers

/// Timers that fire only when the test says so
#[derive(Default)]
pub struct ManualCompletionQueue {
    timers: Mutex<Vec<oneshot::Sender<StorageResult<Instant>>>>,
    created: AtomicUsize,
}

impl ManualCompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn fire_all(&self) {
        for timer in self.timers.lock().drain(..) {
            let _ = timer.send(Ok(Instant::now()));
        }
    }

    pub fn fail_all(&self) {
        for timer in self.timers.lock().drain(..) {
            let _ = timer.send(Err(StorageError::unavailable("timer could not be armed")));
        }
    }
}

#[async_trait]
impl CompletionQueue for ManualCompletionQueue {
    async fn make_relative_timer(&self, _duration: Duration) -> StorageResult<Instant> {
        let (sender, receiver) = oneshot::channel();
        self.timers.lock().push(sender);
        self.created.fetch_add(1, Ordering::SeqCst);
        receiver
            .await
            .unwrap_or_else(|_| Err(StorageError::cancelled("timer dropped")))
    }
}
