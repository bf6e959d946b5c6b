//! # dog-storage: Resumable streaming data plane for object storage
//!
//! `dog-storage` moves object bytes to and from a remote store over
//! bidirectional streaming RPCs. It bounds how long each stream operation may
//! take, recovers from transient disconnects without the caller noticing,
//! sequences calls on a handle with single-use tokens, reconciles the upload
//! progress the service acknowledges and validates checksums end to end.
//!
//! ## Key Features
//!
//! - **Token sequencing**: `ObjectReader`/`ObjectWriter` accept exactly one call per issued token
//! - **Timeouts**: `TimeoutGuardedStream` cancels a stream whose start, read or write stalls
//! - **Resumable reads**: `ResumableReader` reconnects at the last offset, pinned to one generation
//! - **Ranged reads**: `ObjectDescriptor` serves many ranges over one stream and resumes them together
//! - **Buffered uploads**: `BufferedWriter` batches writes between watermarks and detects desyncs
//! - **Integrity**: CRC32C and MD5 validated across reconnects
//! - **Transport agnostic**: any gRPC stack fits behind the `StreamingRpc` trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_storage::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn open_at(generation: Option<i64>, offset: i64) -> StorageResult<Arc<dyn ReaderConnection>> { unimplemented!() }
//! # #[tokio::main]
//! # async fn main() -> StorageResult<()> {
//! let config = StreamConfig::from_env("DOG_STORAGE")?;
//!
//! // 1. Reconnect through a factory whenever the stream breaks
//! let reader = ResumableReader::new(
//!     Arc::new(open_at),
//!     config.resume_policy(),
//!     config.hash_function(),
//! );
//!
//! // 2. Hand the reader to a token-sequenced handle
//! let (handle, mut token) = ObjectReader::new(Arc::new(reader));
//! while let (Some(payload), next) = handle.read(token).await? {
//!     println!("{} bytes at offset {}", payload.len(), payload.offset);
//!     token = next;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  ObjectReader / ObjectWriter │  ← Token discipline
//! ├──────────────────────────────┤
//! │  ResumableReader             │
//! │  BufferedWriter              │  ← Recovery and reconciliation
//! │  ObjectDescriptor            │
//! ├──────────────────────────────┤
//! │  TimeoutGuardedStream        │  ← Per-operation deadlines
//! ├──────────────────────────────┤
//! │  StreamingRpc                │  ← Your transport
//! └──────────────────────────────┘
//! ```

mod config;
pub mod connection;
mod error;
pub mod hash;
#[cfg(feature = "tracing-basic")]
pub mod observability;
pub mod policy;
pub mod read;
pub mod rpc;
pub mod timeout;
pub mod token;
mod types;
mod upload;
pub mod write;

// Re-export main types for clean API
pub use config::StreamConfig;
pub use connection::{
    open_read_stream, DescriptorStreamFactory, OpenedReadStream, ReaderConnection, ReaderFactory,
    WriterConnection, WriterFactory,
};
pub use error::{ErrorKind, StatusCode, StorageError, StorageResult};
pub use hash::{HashFunction, HashValidator, HashValues};
pub use policy::{
    LimitedErrorCountResumePolicy, ResumeAction, ResumePolicy, StopOnConsecutiveErrorsResumePolicy,
};
pub use read::{ObjectDescriptor, ObjectReader, RangeReader, ReadRange, ResumableReader};
pub use rpc::StreamingRpc;
pub use timeout::{CompletionQueue, TimeoutGuardedStream, TokioCompletionQueue};
pub use token::Token;
pub use types::{ByteStream, ObjectMetadata, PersistedState, ReadPayload, RpcMetadata, WritePayload};
pub use upload::WriteObjectRequest;
pub use write::{BufferedWriter, ObjectWriter, ResumedWriter, RpcWriterConnection};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BufferedWriter, ObjectDescriptor, ObjectReader, ObjectWriter, ReaderConnection,
        ReaderFactory, ResumableReader, StorageError, StorageResult, StreamConfig, Token,
        WriteObjectRequest, WritePayload, WriterConnection, WriterFactory,
    };
}
