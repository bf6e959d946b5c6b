use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ReaderConnection, ReaderFactory};
use crate::hash::{HashFunction, HashValidator};
use crate::policy::{ResumeAction, ResumePolicy};
use crate::{ReadPayload, RpcMetadata, StorageError, StorageResult};

struct ResumeState {
    active: Option<Arc<dyn ReaderConnection>>,
    /// Pinned by the first payload carrying metadata
    generation: Option<i64>,
    /// Next byte to request on reconnect
    offset: i64,
    /// Repeated verbatim once set
    terminal: Option<StorageResult<Option<ReadPayload>>>,
    cancelled: bool,
    last_metadata: RpcMetadata,
}

struct Integrity {
    hash: Box<dyn HashFunction>,
    validator: HashValidator,
}

/// Reader that transparently reopens its stream after transient failures.
///
/// Whether to reopen is decided by the injected [`ResumePolicy`]; this type
/// only tracks the offset and generation needed to continue where the broken
/// stream stopped, and validates checksums over the whole object.
pub struct ResumableReader {
    factory: Arc<dyn ReaderFactory>,
    policy: Mutex<Box<dyn ResumePolicy>>,
    integrity: Mutex<Integrity>,
    state: Mutex<ResumeState>,
}

impl ResumableReader {
    pub fn new(
        factory: Arc<dyn ReaderFactory>,
        policy: Box<dyn ResumePolicy>,
        hash: Box<dyn HashFunction>,
    ) -> Self {
        Self {
            factory,
            policy: Mutex::new(policy),
            integrity: Mutex::new(Integrity {
                hash,
                validator: HashValidator::new(),
            }),
            state: Mutex::new(ResumeState {
                active: None,
                generation: None,
                offset: 0,
                terminal: None,
                cancelled: false,
                last_metadata: RpcMetadata::default(),
            }),
        }
    }

    /// Generation pinned by the first successful read, if any
    pub fn generation(&self) -> Option<i64> {
        self.state.lock().generation
    }

    /// Bytes delivered so far
    pub fn offset(&self) -> i64 {
        self.state.lock().offset
    }

    fn stop(&self, result: StorageResult<Option<ReadPayload>>) -> StorageResult<Option<ReadPayload>> {
        let mut state = self.state.lock();
        state.active = None;
        state.terminal = Some(result.clone());
        result
    }

    #[instrument(skip(self))]
    async fn reconnect(&self, generation: Option<i64>, offset: i64) -> StorageResult<Arc<dyn ReaderConnection>> {
        let reader = self.factory.open(generation, offset).await?;
        self.policy.lock().on_start_success();

        let mut state = self.state.lock();
        if state.cancelled {
            reader.cancel();
            return Err(StorageError::cancelled("reader cancelled while reconnecting"));
        }
        state.active = Some(reader.clone());
        Ok(reader)
    }

    fn on_payload(&self, payload: &ReadPayload) -> StorageResult<()> {
        let mut integrity = self.integrity.lock();
        if let Some(hash) = &payload.object_hash {
            integrity.validator.process_hash_values(hash);
        }
        if let Some(metadata) = &payload.metadata {
            integrity.validator.process_hash_values(&metadata.hash_values());
        }
        integrity.hash.update(payload.offset, &payload.data, None)?;
        drop(integrity);

        let mut state = self.state.lock();
        if state.generation.is_none() {
            if let Some(metadata) = &payload.metadata {
                debug!("Pinning reads to generation {}", metadata.generation);
                state.generation = Some(metadata.generation);
            }
        }
        state.offset = payload.offset + payload.len() as i64;
        Ok(())
    }

    fn validate(&self) -> StorageResult<()> {
        let mut integrity = self.integrity.lock();
        let computed = integrity.hash.finish();
        integrity.validator.finish(computed).into_result()
    }
}

#[async_trait]
impl ReaderConnection for ResumableReader {
    async fn read(&self) -> StorageResult<Option<ReadPayload>> {
        loop {
            let (active, generation, offset) = {
                let state = self.state.lock();
                if let Some(terminal) = &state.terminal {
                    return terminal.clone();
                }
                if state.cancelled {
                    drop(state);
                    return self.stop(Err(StorageError::cancelled("reader cancelled")));
                }
                (state.active.clone(), state.generation, state.offset)
            };

            let reader = match active {
                Some(reader) => reader,
                None => match self.reconnect(generation, offset).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!("Reader factory failed at offset {}: {}", offset, e);
                        return self.stop(Err(e));
                    }
                },
            };

            match reader.read().await {
                Ok(Some(mut payload)) => {
                    // Every connection is opened at `offset`, so positions are ours to assign
                    payload.offset = offset;
                    if let Err(e) = self.on_payload(&payload) {
                        return self.stop(Err(e));
                    }
                    return Ok(Some(payload));
                }
                Ok(None) => {
                    self.state.lock().last_metadata = reader.request_metadata();
                    let result = self.validate().map(|_| None);
                    return self.stop(result);
                }
                Err(e) => {
                    let cancelled = {
                        let mut state = self.state.lock();
                        state.last_metadata = reader.request_metadata();
                        state.active = None;
                        state.cancelled
                    };
                    if cancelled {
                        return self.stop(Err(e));
                    }
                    if self.policy.lock().on_finish(&e) == ResumeAction::Stop {
                        info!("Resume policy stopped reader at offset {}: {}", offset, e);
                        return self.stop(Err(e));
                    }
                    debug!("Resuming read at offset {} after: {}", offset, e);
                }
            }
        }
    }

    fn cancel(&self) {
        let active = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.active.clone()
        };
        if let Some(reader) = active {
            reader.cancel();
        }
    }

    fn request_metadata(&self) -> RpcMetadata {
        let state = self.state.lock();
        match &state.active {
            Some(reader) => reader.request_metadata(),
            None => state.last_metadata.clone(),
        }
    }
}
