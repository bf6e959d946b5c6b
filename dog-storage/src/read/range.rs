use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

use crate::hash::HashFunction;
use crate::rpc::{RangeData, RangeRequest};
use crate::{ReadPayload, StorageError, StorageResult};

type Pull = oneshot::Sender<StorageResult<Option<ReadPayload>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeStatus {
    Active,
    Done,
}

struct RangeState {
    /// Next byte expected for this range
    offset: i64,
    /// Bytes still expected, `None` when the range runs to the end of the object
    remaining: Option<i64>,
    status: RangeStatus,
    queue: VecDeque<ReadPayload>,
    pending: Option<Pull>,
    /// Terminal status handed out once the queue is empty
    finish: Option<StorageResult<()>>,
}

/// Accumulates the chunks of one logical byte range carried by a shared stream.
///
/// The stream dispatcher calls [`ReadRange::on_read`] and
/// [`ReadRange::on_finish`] while a consumer pulls with [`ReadRange::read`].
/// Either side may go first: payloads queue up until pulled and a pull waits
/// for the next payload.
pub struct ReadRange {
    state: Mutex<RangeState>,
    hash: Mutex<Box<dyn HashFunction>>,
}

impl ReadRange {
    pub fn new(offset: i64, length: i64, hash: Box<dyn HashFunction>) -> Self {
        Self {
            state: Mutex::new(RangeState {
                offset,
                remaining: (length > 0).then_some(length),
                status: RangeStatus::Active,
                queue: VecDeque::new(),
                pending: None,
                finish: None,
            }),
            hash: Mutex::new(hash),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().status == RangeStatus::Done
    }

    /// What is left of this range, to be requested again on a new stream
    pub fn range_for_resume(&self, read_id: i64) -> Option<RangeRequest> {
        let state = self.state.lock();
        if state.status == RangeStatus::Done {
            return None;
        }
        Some(RangeRequest {
            read_id,
            offset: state.offset,
            length: state.remaining.unwrap_or(0),
        })
    }

    /// Next payload, `Ok(None)` once the range is complete
    pub async fn read(&self) -> StorageResult<Option<ReadPayload>> {
        let receiver = {
            let mut state = self.state.lock();
            if let Some(payload) = state.queue.pop_front() {
                return Ok(Some(payload));
            }
            if state.status == RangeStatus::Done {
                return match &state.finish {
                    Some(Err(e)) => Err(e.clone()),
                    _ => Ok(None),
                };
            }
            if state.pending.is_some() {
                return Err(StorageError::failed_precondition(
                    "a read is already pending on this range",
                ));
            }
            let (sender, receiver) = oneshot::channel();
            state.pending = Some(sender);
            receiver
        };

        receiver
            .await
            .unwrap_or_else(|_| Err(StorageError::cancelled("range reader dropped")))
    }

    /// Deliver one chunk from the stream
    pub fn on_read(&self, chunk: RangeData) {
        let mut state = self.state.lock();
        if state.status == RangeStatus::Done {
            debug!("Ignoring chunk at offset {} for a completed range", chunk.offset);
            return;
        }

        if let Err(e) = self.hash.lock().update(chunk.offset, &chunk.data, chunk.crc32c) {
            Self::complete(&mut state, Err(e));
            return;
        }

        let size = chunk.data.len() as i64;
        state.offset = chunk.offset + size;
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining = (*remaining - size).max(0);
        }
        let payload = ReadPayload::new(chunk.data).with_offset(chunk.offset);
        match state.pending.take() {
            Some(pull) => {
                if let Err(Ok(Some(unsent))) = pull.send(Ok(Some(payload))) {
                    state.queue.push_back(unsent);
                }
            }
            None => state.queue.push_back(payload),
        }

        // A bounded range is complete once its last byte arrives
        if chunk.range_end || state.remaining == Some(0) {
            Self::complete(&mut state, Ok(()));
        }
    }

    /// The stream ended before this range completed
    pub fn on_finish(&self, status: StorageResult<()>) {
        let mut state = self.state.lock();
        if state.status == RangeStatus::Done {
            return;
        }
        Self::complete(&mut state, status);
    }

    fn complete(state: &mut RangeState, status: StorageResult<()>) {
        state.status = RangeStatus::Done;
        if let Some(pull) = state.pending.take() {
            // A pending pull implies the queue is empty
            let _ = pull.send(status.clone().map(|_| None));
        }
        state.finish = Some(status);
    }
}
