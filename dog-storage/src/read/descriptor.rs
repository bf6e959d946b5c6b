use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::connection::{DescriptorStreamFactory, ReaderConnection};
use crate::policy::{ResumeAction, ResumePolicy};
use crate::read::ReadRange;
use crate::rpc::{BidiReadRequest, BidiReadResponse, BidiReadStream, RangeRequest, ReadObjectSpec};
use crate::{
    ObjectMetadata, ReadPayload, RpcMetadata, StorageError, StorageResult, StreamConfig,
};

struct DescriptorState {
    stream: Option<BidiReadStream>,
    /// Generation and read handle are filled in from the service responses
    spec: ReadObjectSpec,
    metadata: Option<ObjectMetadata>,
    active: HashMap<i64, Arc<ReadRange>>,
    next_read_id: i64,
    cancelled: bool,
    /// Set once the stream is gone for good
    terminal: Option<StorageResult<()>>,
}

struct DescriptorInner {
    factory: Arc<dyn DescriptorStreamFactory>,
    policy: Mutex<Box<dyn ResumePolicy>>,
    config: StreamConfig,
    state: Mutex<DescriptorState>,
}

/// Cancels the stream once the descriptor and all of its range readers are gone
struct DescriptorGuard {
    inner: Arc<DescriptorInner>,
}

impl Drop for DescriptorGuard {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

/// An open object serving many concurrent ranged reads over one bidi stream.
///
/// A background task routes response chunks to the matching [`ReadRange`] by
/// read id. When the stream breaks with a transient error and the resume
/// policy agrees, a new stream is opened for the same generation and every
/// unfinished range is requested again from where it stopped.
pub struct ObjectDescriptor {
    guard: Arc<DescriptorGuard>,
}

impl ObjectDescriptor {
    /// Open `spec` and start dispatching responses
    pub async fn open(
        factory: Arc<dyn DescriptorStreamFactory>,
        spec: ReadObjectSpec,
        mut policy: Box<dyn ResumePolicy>,
        config: StreamConfig,
    ) -> StorageResult<Self> {
        let opened = factory
            .open(BidiReadRequest {
                spec: Some(spec.clone()),
                ranges: Vec::new(),
            })
            .await?;
        policy.on_start_success();

        let inner = Arc::new(DescriptorInner {
            factory,
            policy: Mutex::new(policy),
            config,
            state: Mutex::new(DescriptorState {
                stream: Some(opened.stream.clone()),
                spec,
                metadata: None,
                active: HashMap::new(),
                next_read_id: 1,
                cancelled: false,
                terminal: None,
            }),
        });
        inner.on_response(opened.first_response);
        tokio::spawn(DescriptorInner::run(inner.clone(), opened.stream));

        Ok(Self {
            guard: Arc::new(DescriptorGuard { inner }),
        })
    }

    /// Metadata of the opened object version
    pub fn metadata(&self) -> Option<ObjectMetadata> {
        self.guard.inner.state.lock().metadata.clone()
    }

    /// Request `length` bytes at `offset` (`0` reads to the end of the object)
    pub async fn read_range(&self, offset: i64, length: i64) -> RangeReader {
        let inner = &self.guard.inner;
        let range = Arc::new(ReadRange::new(offset, length, inner.config.range_hash_function()));

        let (read_id, stream) = {
            let mut state = inner.state.lock();
            let read_id = state.next_read_id;
            state.next_read_id += 1;

            if state.cancelled {
                range.on_finish(Err(StorageError::cancelled("object descriptor cancelled")));
                (read_id, None)
            } else if let Some(terminal) = &state.terminal {
                range.on_finish(terminal.clone());
                (read_id, None)
            } else {
                state.active.insert(read_id, range.clone());
                // Without a stream the range goes out with the next resume
                (read_id, state.stream.clone())
            }
        };

        if let Some(stream) = stream {
            let request = BidiReadRequest {
                spec: None,
                ranges: vec![RangeRequest {
                    read_id,
                    offset,
                    length,
                }],
            };
            if !stream.write(request).await {
                debug!("Range {} request hit a broken stream, it will be resumed", read_id);
            }
        }

        RangeReader {
            read_id,
            range,
            guard: self.guard.clone(),
        }
    }

    /// Cancel the stream; unfinished ranges fail with `Cancelled`
    pub fn cancel(&self) {
        self.guard.inner.cancel();
    }
}

impl DescriptorInner {
    fn cancel(&self) {
        let stream = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.stream.clone()
        };
        if let Some(stream) = stream {
            stream.cancel();
        }
    }

    fn on_response(&self, response: BidiReadResponse) {
        let mut state = self.state.lock();
        if let Some(handle) = response.read_handle {
            state.spec.read_handle = Some(handle);
        }
        if let Some(metadata) = response.metadata {
            if state.spec.generation.is_none() {
                debug!("Pinning descriptor to generation {}", metadata.generation);
                state.spec.generation = Some(metadata.generation);
            }
            state.metadata = Some(metadata);
        }
        for data in response.ranges {
            let read_id = data.read_id;
            let Some(range) = state.active.get(&read_id).cloned() else {
                debug!("Dropping data for unknown read id {}", read_id);
                continue;
            };
            range.on_read(data);
            if range.is_done() {
                state.active.remove(&read_id);
            }
        }
    }

    async fn run(self: Arc<Self>, mut stream: BidiReadStream) {
        loop {
            while let Some(response) = stream.read().await {
                self.on_response(response);
            }
            let status = stream.finish().await;
            match self.on_stream_end(status).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Returns the replacement stream, or `None` once every range has been
    /// told how the descriptor ended
    #[instrument(skip(self))]
    async fn on_stream_end(&self, status: StorageResult<()>) -> Option<BidiReadStream> {
        if self.state.lock().cancelled {
            self.fail_all(Err(StorageError::cancelled("object descriptor cancelled")));
            return None;
        }
        let error = match status {
            Ok(()) => {
                self.fail_all(Ok(()));
                return None;
            }
            Err(e) => e,
        };
        if self.policy.lock().on_finish(&error) == ResumeAction::Stop {
            info!("Resume policy stopped object descriptor: {}", error);
            self.fail_all(Err(error));
            return None;
        }

        let (request, included) = {
            let mut state = self.state.lock();
            state.stream = None;
            let ranges: Vec<RangeRequest> = state
                .active
                .iter()
                .filter_map(|(read_id, range)| range.range_for_resume(*read_id))
                .collect();
            let included: HashSet<i64> = ranges.iter().map(|r| r.read_id).collect();
            let request = BidiReadRequest {
                spec: Some(state.spec.clone()),
                ranges,
            };
            (request, included)
        };

        debug!("Resuming {} ranges after: {}", included.len(), error);
        let opened = match self.factory.open(request).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Could not resume object descriptor: {}", e);
                self.fail_all(Err(e));
                return None;
            }
        };
        self.policy.lock().on_start_success();

        let late: Vec<RangeRequest> = {
            let mut state = self.state.lock();
            if state.cancelled {
                drop(state);
                opened.stream.cancel();
                self.fail_all(Err(StorageError::cancelled("object descriptor cancelled")));
                return None;
            }
            state.stream = Some(opened.stream.clone());
            state
                .active
                .iter()
                .filter(|(read_id, _)| !included.contains(read_id))
                .filter_map(|(read_id, range)| range.range_for_resume(*read_id))
                .collect()
        };
        self.on_response(opened.first_response);

        if !late.is_empty() {
            let request = BidiReadRequest {
                spec: None,
                ranges: late,
            };
            if !opened.stream.write(request).await {
                debug!("Resumed stream broke while adding ranges");
            }
        }
        Some(opened.stream)
    }

    fn fail_all(&self, status: StorageResult<()>) {
        let ranges: Vec<Arc<ReadRange>> = {
            let mut state = self.state.lock();
            state.stream = None;
            state.terminal = Some(status.clone());
            state.active.drain().map(|(_, range)| range).collect()
        };
        for range in ranges {
            range.on_finish(status.clone());
        }
    }
}

/// Reader for one range of an [`ObjectDescriptor`]
pub struct RangeReader {
    read_id: i64,
    range: Arc<ReadRange>,
    guard: Arc<DescriptorGuard>,
}

impl RangeReader {
    pub fn read_id(&self) -> i64 {
        self.read_id
    }
}

#[async_trait]
impl ReaderConnection for RangeReader {
    async fn read(&self) -> StorageResult<Option<ReadPayload>> {
        self.range.read().await
    }

    fn cancel(&self) {
        self.guard.inner.state.lock().active.remove(&self.read_id);
        self.range
            .on_finish(Err(StorageError::cancelled("range read cancelled")));
    }

    fn request_metadata(&self) -> RpcMetadata {
        let stream = self.guard.inner.state.lock().stream.clone();
        stream
            .map(|stream| stream.request_metadata())
            .unwrap_or_default()
    }
}
