//! Composite operation builder
//!
//! An [`Operation`] accumulates an ordered list of [`SubOp`]s against one
//! object. It stays mutable until [`Operation::finalize`] serializes it into a
//! [`SerializedRequest`] plus the [`BatchManifest`] the demultiplexer needs to
//! correlate reply entries back to sub-operations.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use crate::codec::{self, RequestBody};
use crate::error::{AioError, Result};
use crate::transport::SerializedRequest;
use crate::types::{
    AllocHintFlags, ChecksumKind, CompareOp, ObjectAddress, OpCode, OpFlags, OperationFlags,
    OperationKind, UTime,
};

/// One primitive action inside a composite operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOp {
    // Guards and calls, legal on both kinds
    AssertExists,
    AssertVersion(u64),
    CompareExtent {
        offset: u64,
        data: Bytes,
    },
    CompareXattr {
        name: String,
        op: CompareOp,
        value: Bytes,
    },
    CompareOmapEntry {
        key: String,
        op: CompareOp,
        value: Bytes,
    },
    Exec {
        class: String,
        method: String,
        input: Bytes,
    },

    // Mutations
    Create {
        exclusive: bool,
    },
    Remove,
    Write {
        offset: u64,
        data: Bytes,
    },
    WriteFull(Bytes),
    Append(Bytes),
    WriteSame {
        offset: u64,
        write_len: u64,
        data: Bytes,
    },
    Truncate(u64),
    Zero {
        offset: u64,
        len: u64,
    },
    SetXattr {
        name: String,
        value: Bytes,
    },
    RemoveXattr(String),
    OmapSet(BTreeMap<String, Bytes>),
    OmapRemoveKeys(Vec<String>),
    OmapRemoveRange {
        start: String,
        end: String,
    },
    OmapClear,
    SetAllocHint {
        expected_object_size: u64,
        expected_write_size: u64,
        flags: AllocHintFlags,
    },

    // Reads
    /// Read `len` bytes at `offset`; a zero length reads to the end
    Read {
        offset: u64,
        len: u64,
    },
    Stat,
    GetXattr(String),
    GetXattrs,
    OmapGetVals {
        start_after: String,
        prefix: String,
        max: u64,
    },
    OmapGetKeys {
        start_after: String,
        max: u64,
    },
    OmapGetValsByKeys(Vec<String>),
    Checksum {
        kind: ChecksumKind,
        init: u64,
        offset: u64,
        len: u64,
        chunk_size: u64,
    },
}

impl SubOp {
    pub fn opcode(&self) -> OpCode {
        match self {
            SubOp::AssertExists => OpCode::AssertExists,
            SubOp::AssertVersion(_) => OpCode::AssertVersion,
            SubOp::CompareExtent { .. } => OpCode::CmpExt,
            SubOp::CompareXattr { .. } => OpCode::CmpXattr,
            SubOp::CompareOmapEntry { .. } => OpCode::OmapCmp,
            SubOp::Exec { .. } => OpCode::Call,
            SubOp::Create { .. } => OpCode::Create,
            SubOp::Remove => OpCode::Delete,
            SubOp::Write { .. } => OpCode::Write,
            SubOp::WriteFull(_) => OpCode::WriteFull,
            SubOp::Append(_) => OpCode::Append,
            SubOp::WriteSame { .. } => OpCode::WriteSame,
            SubOp::Truncate(_) => OpCode::Truncate,
            SubOp::Zero { .. } => OpCode::Zero,
            SubOp::SetXattr { .. } => OpCode::SetXattr,
            SubOp::RemoveXattr(_) => OpCode::RmXattr,
            SubOp::OmapSet(_) => OpCode::OmapSetVals,
            SubOp::OmapRemoveKeys(_) => OpCode::OmapRmKeys,
            SubOp::OmapRemoveRange { .. } => OpCode::OmapRmKeyRange,
            SubOp::OmapClear => OpCode::OmapClear,
            SubOp::SetAllocHint { .. } => OpCode::SetAllocHint,
            SubOp::Read { .. } => OpCode::Read,
            SubOp::Stat => OpCode::Stat,
            SubOp::GetXattr(_) => OpCode::GetXattr,
            SubOp::GetXattrs => OpCode::GetXattrs,
            SubOp::OmapGetVals { .. } => OpCode::OmapGetVals,
            SubOp::OmapGetKeys { .. } => OpCode::OmapGetKeys,
            SubOp::OmapGetValsByKeys(_) => OpCode::OmapGetValsByKeys,
            SubOp::Checksum { .. } => OpCode::Checksum,
        }
    }

    /// Whether this sub-operation may appear in an operation of `kind`
    pub fn is_legal_for(&self, kind: OperationKind) -> bool {
        match self {
            SubOp::AssertExists
            | SubOp::AssertVersion(_)
            | SubOp::CompareExtent { .. }
            | SubOp::CompareXattr { .. }
            | SubOp::CompareOmapEntry { .. }
            | SubOp::Exec { .. } => true,
            _ => match kind {
                OperationKind::Write => self.opcode().is_write(),
                OperationKind::Read => self.opcode().is_read(),
            },
        }
    }

    /// Bytes carried as input data (indata)
    pub fn payload_len(&self) -> usize {
        match self {
            SubOp::CompareExtent { data, .. }
            | SubOp::Write { data, .. }
            | SubOp::WriteFull(data)
            | SubOp::Append(data)
            | SubOp::WriteSame { data, .. } => data.len(),
            SubOp::CompareXattr { name, value, .. } | SubOp::SetXattr { name, value } => {
                name.len() + value.len()
            }
            SubOp::CompareOmapEntry { key, value, .. } => key.len() + value.len(),
            SubOp::Exec {
                class,
                method,
                input,
            } => class.len() + method.len() + input.len(),
            SubOp::RemoveXattr(name) | SubOp::GetXattr(name) => name.len(),
            SubOp::OmapSet(map) => map.iter().map(|(k, v)| k.len() + v.len()).sum(),
            SubOp::OmapRemoveKeys(keys) | SubOp::OmapGetValsByKeys(keys) => {
                keys.iter().map(String::len).sum()
            }
            SubOp::OmapRemoveRange { start, end } => start.len() + end.len(),
            _ => 0,
        }
    }

    /// Reject sub-operations the remote store could never apply
    fn validate(&self) -> Result<()> {
        let malformed = |what: &str| -> Result<()> {
            Err(AioError::InvalidOperation(format!(
                "{}: {}",
                self.opcode(),
                what
            )))
        };
        match self {
            SubOp::CompareXattr { name, .. }
            | SubOp::SetXattr { name, .. }
            | SubOp::RemoveXattr(name)
            | SubOp::GetXattr(name)
                if name.is_empty() =>
            {
                malformed("empty attribute name")
            }
            SubOp::Exec { class, method, .. } if class.is_empty() || method.is_empty() => {
                malformed("class and method must be named")
            }
            SubOp::WriteSame { data, .. } if data.is_empty() => malformed("empty pattern"),
            SubOp::Checksum { chunk_size: 0, .. } => malformed("zero chunk size"),
            SubOp::OmapRemoveRange { start, end } if start > end => {
                malformed("range start after end")
            }
            _ => Ok(()),
        }
    }
}

/// Calculate the in-flight budget for a set of sub-operations
///
/// Writes contribute their input data size; extent reads contribute the
/// number of bytes they expect back.
pub fn calc_op_budget(ops: &[SubOp]) -> usize {
    ops.iter()
        .map(|op| {
            if op.opcode().is_write() {
                return op.payload_len();
            }
            if let SubOp::Read { len, .. } = op {
                return usize::try_from(*len).unwrap_or(usize::MAX);
            }
            0
        })
        .fold(0, usize::saturating_add)
}

/// Per-sub-operation record kept for demultiplexing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub op: OpCode,
    pub payload_len: usize,
}

/// What the demultiplexer needs to know about a submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchManifest {
    pub kind: OperationKind,
    pub ops: Vec<ManifestEntry>,
    pub flags: OperationFlags,
    pub op_flags: OpFlags,
    pub budget: usize,
}

impl BatchManifest {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        self.flags.contains(OperationFlags::ORDERED)
    }
}

/// Output of [`Operation::finalize`]
#[derive(Debug, Clone)]
pub struct FinalizedOp {
    pub request: SerializedRequest,
    pub manifest: BatchManifest,
}

/// A composite read or write operation against one object
#[derive(Debug, Clone)]
pub struct Operation {
    kind: OperationKind,
    address: ObjectAddress,
    ops: Vec<SubOp>,
    flags: OperationFlags,
    op_flags: OpFlags,
    mtime: Option<UTime>,
    finalized: bool,
}

impl Operation {
    /// Create an empty write operation (rados_create_write_op)
    pub fn new_write(address: ObjectAddress) -> Self {
        Self::new(OperationKind::Write, address)
    }

    /// Create an empty read operation (rados_create_read_op)
    pub fn new_read(address: ObjectAddress) -> Self {
        Self::new(OperationKind::Read, address)
    }

    fn new(kind: OperationKind, address: ObjectAddress) -> Self {
        Self {
            kind,
            address,
            ops: Vec::new(),
            flags: OperationFlags::empty(),
            op_flags: OpFlags::empty(),
            mtime: None,
            finalized: false,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn address(&self) -> &ObjectAddress {
        &self.address
    }

    pub fn flags(&self) -> OperationFlags {
        self.flags
    }

    pub fn op_flags(&self) -> OpFlags {
        self.op_flags
    }

    pub fn ops(&self) -> &[SubOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.finalized {
            return Err(AioError::InvalidState(format!(
                "{} operation on {} already submitted",
                self.kind, self.address
            )));
        }
        Ok(())
    }

    /// Append a sub-operation, returning its index in the batch
    pub fn append(&mut self, op: SubOp) -> Result<usize> {
        self.ensure_mutable()?;
        if !op.is_legal_for(self.kind) {
            return Err(AioError::InvalidOperation(format!(
                "{} is not allowed in a {} operation",
                op.opcode(),
                self.kind
            )));
        }
        op.validate()?;
        self.ops.push(op);
        Ok(self.ops.len() - 1)
    }

    pub fn set_flags(&mut self, flags: OperationFlags) -> Result<()> {
        self.ensure_mutable()?;
        self.flags = flags;
        Ok(())
    }

    pub fn set_op_flags(&mut self, op_flags: OpFlags) -> Result<()> {
        self.ensure_mutable()?;
        self.op_flags = op_flags;
        Ok(())
    }

    /// Set the modification time applied by a write operation
    pub fn set_mtime(&mut self, mtime: UTime) -> Result<()> {
        self.ensure_mutable()?;
        if self.kind != OperationKind::Write {
            return Err(AioError::InvalidOperation(
                "mtime only applies to write operations".into(),
            ));
        }
        self.mtime = Some(mtime);
        Ok(())
    }

    // Guards

    pub fn assert_exists(&mut self) -> Result<usize> {
        self.append(SubOp::AssertExists)
    }

    pub fn assert_version(&mut self, version: u64) -> Result<usize> {
        self.append(SubOp::AssertVersion(version))
    }

    pub fn cmpext(&mut self, offset: u64, data: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::CompareExtent {
            offset,
            data: data.into(),
        })
    }

    pub fn cmpxattr(
        &mut self,
        name: impl Into<String>,
        op: CompareOp,
        value: impl Into<Bytes>,
    ) -> Result<usize> {
        self.append(SubOp::CompareXattr {
            name: name.into(),
            op,
            value: value.into(),
        })
    }

    pub fn omap_cmp(
        &mut self,
        key: impl Into<String>,
        op: CompareOp,
        value: impl Into<Bytes>,
    ) -> Result<usize> {
        self.append(SubOp::CompareOmapEntry {
            key: key.into(),
            op,
            value: value.into(),
        })
    }

    /// Call an object class method
    pub fn exec(
        &mut self,
        class: impl Into<String>,
        method: impl Into<String>,
        input: impl Into<Bytes>,
    ) -> Result<usize> {
        self.append(SubOp::Exec {
            class: class.into(),
            method: method.into(),
            input: input.into(),
        })
    }

    // Mutations

    pub fn create(&mut self, exclusive: bool) -> Result<usize> {
        self.append(SubOp::Create { exclusive })
    }

    pub fn remove(&mut self) -> Result<usize> {
        self.append(SubOp::Remove)
    }

    pub fn write(&mut self, offset: u64, data: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::Write {
            offset,
            data: data.into(),
        })
    }

    pub fn write_full(&mut self, data: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::WriteFull(data.into()))
    }

    pub fn append_data(&mut self, data: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::Append(data.into()))
    }

    /// Repeat `data` over `write_len` bytes starting at `offset`
    pub fn write_same(&mut self, offset: u64, write_len: u64, data: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::WriteSame {
            offset,
            write_len,
            data: data.into(),
        })
    }

    pub fn truncate(&mut self, size: u64) -> Result<usize> {
        self.append(SubOp::Truncate(size))
    }

    pub fn zero(&mut self, offset: u64, len: u64) -> Result<usize> {
        self.append(SubOp::Zero { offset, len })
    }

    pub fn set_xattr(&mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Result<usize> {
        self.append(SubOp::SetXattr {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn rm_xattr(&mut self, name: impl Into<String>) -> Result<usize> {
        self.append(SubOp::RemoveXattr(name.into()))
    }

    pub fn omap_set<K, V, I>(&mut self, entries: I) -> Result<usize>
    where
        K: Into<String>,
        V: Into<Bytes>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.append(SubOp::OmapSet(map))
    }

    pub fn omap_rm_keys<K, I>(&mut self, keys: I) -> Result<usize>
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        self.append(SubOp::OmapRemoveKeys(
            keys.into_iter().map(Into::into).collect(),
        ))
    }

    /// Remove omap keys in `[start, end)`
    pub fn omap_rm_range(&mut self, start: impl Into<String>, end: impl Into<String>) -> Result<usize> {
        self.append(SubOp::OmapRemoveRange {
            start: start.into(),
            end: end.into(),
        })
    }

    pub fn omap_clear(&mut self) -> Result<usize> {
        self.append(SubOp::OmapClear)
    }

    pub fn set_alloc_hint(
        &mut self,
        expected_object_size: u64,
        expected_write_size: u64,
        flags: AllocHintFlags,
    ) -> Result<usize> {
        self.append(SubOp::SetAllocHint {
            expected_object_size,
            expected_write_size,
            flags,
        })
    }

    // Reads

    pub fn read(&mut self, offset: u64, len: u64) -> Result<usize> {
        self.append(SubOp::Read { offset, len })
    }

    pub fn stat(&mut self) -> Result<usize> {
        self.append(SubOp::Stat)
    }

    pub fn get_xattr(&mut self, name: impl Into<String>) -> Result<usize> {
        self.append(SubOp::GetXattr(name.into()))
    }

    pub fn get_xattrs(&mut self) -> Result<usize> {
        self.append(SubOp::GetXattrs)
    }

    pub fn omap_get_vals(
        &mut self,
        start_after: impl Into<String>,
        prefix: impl Into<String>,
        max: u64,
    ) -> Result<usize> {
        self.append(SubOp::OmapGetVals {
            start_after: start_after.into(),
            prefix: prefix.into(),
            max,
        })
    }

    pub fn omap_get_keys(&mut self, start_after: impl Into<String>, max: u64) -> Result<usize> {
        self.append(SubOp::OmapGetKeys {
            start_after: start_after.into(),
            max,
        })
    }

    pub fn omap_get_vals_by_keys<K, I>(&mut self, keys: I) -> Result<usize>
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        self.append(SubOp::OmapGetValsByKeys(
            keys.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn checksum(
        &mut self,
        kind: ChecksumKind,
        init: u64,
        offset: u64,
        len: u64,
        chunk_size: u64,
    ) -> Result<usize> {
        self.append(SubOp::Checksum {
            kind,
            init,
            offset,
            len,
            chunk_size,
        })
    }

    /// Serialize the batch for transmission
    ///
    /// Called exactly once, at submission time. The sub-operations move into
    /// the serialized request and the operation stays immutable afterwards.
    pub fn finalize(&mut self, tid: u64) -> Result<FinalizedOp> {
        self.ensure_mutable()?;

        let manifest = BatchManifest {
            kind: self.kind,
            ops: self
                .ops
                .iter()
                .map(|op| ManifestEntry {
                    op: op.opcode(),
                    payload_len: op.payload_len(),
                })
                .collect(),
            flags: self.flags,
            op_flags: self.op_flags,
            budget: calc_op_budget(&self.ops),
        };

        let body = RequestBody {
            tid,
            address: self.address.clone(),
            kind: self.kind,
            flags: self.flags,
            op_flags: self.op_flags,
            mtime: self.mtime,
            ops: std::mem::take(&mut self.ops),
        };
        let payload = match codec::encode_request(&body) {
            Ok(payload) => payload,
            Err(e) => {
                // leave the operation as it was so the caller may retry
                self.ops = body.ops;
                return Err(e);
            }
        };
        self.finalized = true;

        debug!(
            "finalized {} operation tid={} on {}: {} ops, {} bytes, budget={}",
            self.kind,
            tid,
            self.address,
            manifest.len(),
            payload.len(),
            manifest.budget
        );

        Ok(FinalizedOp {
            request: SerializedRequest {
                tid,
                address: self.address.clone(),
                payload,
            },
            manifest,
        })
    }
}
