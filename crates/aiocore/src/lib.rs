//! Asynchronous operation core
//!
//! This crate tracks object operations from submission to durability and
//! batches primitive sub-operations into composite requests.
//!
//! # Architecture
//!
//! - `Operation`: builder for a composite read or write against one object
//! - `Completion`: per-request handle reporting the submitted and durable phases
//! - `Objecter`: schedules finalized operations onto a `Transport`
//! - Frame encoding/decoding for requests and demultiplexing of replies
//! - `MemStore`: in-memory `Transport` for tests and tooling

pub mod codec;
pub mod completion;
pub mod config;
pub mod demux;
pub mod error;
pub mod memstore;
pub mod objecter;
pub mod operation;
pub mod throttle;
pub mod tracker;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use completion::{Callback, Completion, CompletionEvent, Phase};
pub use config::{MemStoreConfig, ObjecterConfig};
pub use demux::SubOpResult;
pub use error::{errno, AioError, Failure, Result};
pub use memstore::{MemObject, MemStore};
pub use objecter::Objecter;
pub use operation::{Operation, SubOp};
pub use transport::{Ack, Reply, ReplyEntry, SerializedRequest, Transport, TransportError};
pub use types::{
    AllocHintFlags, ChecksumKind, CompareOp, CompletionId, ObjectAddress, OpFlags,
    OperationFlags, OperationKind, PoolId, SnapId, UTime, SNAP_HEAD,
};
