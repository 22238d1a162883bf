//! Result demultiplexing
//!
//! Reply entries are correlated to sub-operations strictly by position.
//! A reply with the wrong number of entries is a protocol violation fatal to
//! the whole completion.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::{self, OmapKeyPage, OmapPage, StatInfo};
use crate::error::{errno, AioError, Result};
use crate::operation::BatchManifest;
use crate::transport::Reply;
use crate::types::{OpCode, OpFlags, OperationFlags};

/// Outcome of one sub-operation, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubOpResult {
    pub index: usize,
    pub op: OpCode,
    pub return_code: i32,
    pub outdata: Option<Bytes>,
    pub bytes_transferred: Option<u64>,
    /// Skipped because an earlier sub-operation of an ordered batch failed
    pub aborted: bool,
}

/// Split a reply into per-sub-operation results
pub fn demux(manifest: &BatchManifest, reply: Reply) -> Result<Vec<SubOpResult>> {
    if reply.entries.len() != manifest.len() {
        warn!(
            "reply carries {} entries for {} sub-operations",
            reply.entries.len(),
            manifest.len()
        );
        return Err(AioError::ProtocolMismatch {
            expected: manifest.len(),
            actual: reply.entries.len(),
        });
    }

    let ordered = manifest.is_ordered();
    let failok = manifest.op_flags.contains(OpFlags::FAILOK);
    let returnvec = manifest.flags.contains(OperationFlags::RETURNVEC);
    let mut first_failure: Option<usize> = None;

    let results = manifest
        .ops
        .iter()
        .zip(reply.entries)
        .enumerate()
        .map(|(index, (entry, reply_entry))| {
            if first_failure.is_some() {
                return SubOpResult {
                    index,
                    op: entry.op,
                    return_code: errno::ECANCELED,
                    outdata: None,
                    bytes_transferred: None,
                    aborted: true,
                };
            }

            let code = reply_entry.return_code;
            let succeeded = code >= 0;
            let outdata = if entry.op.returns_data() && (succeeded || returnvec) {
                Some(reply_entry.outdata)
            } else {
                None
            };
            let bytes_transferred = match entry.op {
                OpCode::Read if succeeded => outdata.as_ref().map(|d| d.len() as u64),
                OpCode::Write | OpCode::WriteFull | OpCode::Append | OpCode::WriteSame
                    if succeeded =>
                {
                    Some(entry.payload_len as u64)
                }
                _ => None,
            };

            if ordered && !succeeded && !failok {
                debug!(
                    "sub-op {} ({}) failed with {}, aborting the rest of the batch",
                    index, entry.op, code
                );
                first_failure = Some(index);
            }

            SubOpResult {
                index,
                op: entry.op,
                return_code: code,
                outdata,
                bytes_transferred,
                aborted: false,
            }
        })
        .collect();

    Ok(results)
}

impl SubOpResult {
    pub fn is_ok(&self) -> bool {
        !self.aborted && self.return_code >= 0
    }

    /// Turn a failed or aborted result into an error
    pub fn check(&self) -> Result<&Self> {
        if self.aborted {
            return Err(AioError::Aborted { index: self.index });
        }
        if self.return_code < 0 {
            return Err(AioError::Remote {
                code: self.return_code,
            });
        }
        Ok(self)
    }

    fn output(&self, expected: &[OpCode]) -> Result<&Bytes> {
        if !expected.contains(&self.op) {
            return Err(AioError::InvalidOperation(format!(
                "sub-op {} is {}, not {}",
                self.index,
                self.op,
                expected
                    .iter()
                    .map(|op| op.name())
                    .collect::<Vec<_>>()
                    .join("/")
            )));
        }
        self.check()?;
        self.outdata.as_ref().ok_or_else(|| {
            AioError::Decoding(format!("sub-op {} returned no output", self.index))
        })
    }

    /// Bytes returned by a read
    pub fn data(&self) -> Result<Bytes> {
        self.output(&[OpCode::Read]).cloned()
    }

    pub fn stat(&self) -> Result<StatInfo> {
        codec::from_bytes(self.output(&[OpCode::Stat])?)
    }

    pub fn xattr(&self) -> Result<Bytes> {
        self.output(&[OpCode::GetXattr]).cloned()
    }

    pub fn xattrs(&self) -> Result<BTreeMap<String, Bytes>> {
        codec::from_bytes(self.output(&[OpCode::GetXattrs])?)
    }

    /// Entries from omap_get_vals or omap_get_vals_by_keys
    pub fn omap_vals(&self) -> Result<OmapPage> {
        let raw = self.output(&[OpCode::OmapGetVals, OpCode::OmapGetValsByKeys])?;
        if self.op == OpCode::OmapGetValsByKeys {
            return Ok(OmapPage {
                entries: codec::from_bytes(raw)?,
                more: false,
            });
        }
        codec::from_bytes(raw)
    }

    pub fn omap_keys(&self) -> Result<OmapKeyPage> {
        codec::from_bytes(self.output(&[OpCode::OmapGetKeys])?)
    }

    /// One checksum per chunk
    pub fn checksums(&self) -> Result<Vec<u64>> {
        codec::from_bytes(self.output(&[OpCode::Checksum])?)
    }

    pub fn exec_output(&self) -> Result<Bytes> {
        self.output(&[OpCode::Call]).cloned()
    }

    /// Offset of the first mismatching byte of a failed cmpext
    pub fn cmpext_mismatch(&self) -> Option<u64> {
        if self.op != OpCode::CmpExt || self.aborted || self.return_code > -errno::MAX_ERRNO {
            return None;
        }
        Some((-(self.return_code as i64) - errno::MAX_ERRNO as i64) as u64)
    }
}
