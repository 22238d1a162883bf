//! Abstract request/response channel to the object store
//!
//! Resolving [`Transport::send`] is the acknowledgment: the store accepted
//! and applied the batch and returned per-sub-operation results. Resolving
//! the returned [`Ack::commit`] future means the effect is durable.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::types::ObjectAddress;

/// A finalized batch ready for the wire
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    pub tid: u64,
    pub address: ObjectAddress,
    /// Framed request, see [`crate::codec`]
    pub payload: Bytes,
}

/// Result of one sub-operation as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyEntry {
    pub return_code: i32,
    pub outdata: Bytes,
}

impl ReplyEntry {
    pub fn ok(outdata: impl Into<Bytes>) -> Self {
        Self {
            return_code: 0,
            outdata: outdata.into(),
        }
    }

    pub fn err(return_code: i32) -> Self {
        Self {
            return_code,
            outdata: Bytes::new(),
        }
    }
}

/// Store acknowledgment for a whole batch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    /// Overall result; negative when the batch failed
    pub result: i32,
    /// Object version after the batch
    pub version: u64,
    pub entries: Vec<ReplyEntry>,
}

/// Resolves once the acknowledged batch is durable
pub type CommitFuture = BoxFuture<'static, Result<(), TransportError>>;

/// Acknowledgment plus the pending durability signal
pub struct Ack {
    pub reply: Reply,
    pub commit: CommitFuture,
}

impl Ack {
    pub fn new(reply: Reply, commit: CommitFuture) -> Self {
        Self { reply, commit }
    }

    /// Ack whose effect is durable as soon as it is acknowledged
    pub fn committed(reply: Reply) -> Self {
        Self {
            reply,
            commit: futures::future::ready(Ok(())).boxed(),
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// Channel-level failure with a stable error code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Request/response channel shared by all in-flight operations
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: SerializedRequest) -> Result<Ack, TransportError>;
}
