//! In-memory object store
//!
//! [`MemStore`] implements [`Transport`] by decoding each request frame and
//! applying its sub-operations to objects held in memory. It stands in for
//! the cluster in tests and in the command-line tool.
//!
//! Sub-operations of a batch are applied in order against one object while
//! its shard is locked. An unordered batch keeps going past failures; an
//! ordered batch stops at the first failure (unless FAILOK is set) and
//! reports the remaining sub-operations as cancelled. Nothing already applied
//! is rolled back. The overall result is the first failure code, or zero
//! with FAILOK.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::codec::{self, OmapKeyPage, OmapPage, RequestBody, StatInfo};
use crate::config::MemStoreConfig;
use crate::error::errno;
use crate::operation::SubOp;
use crate::transport::{Ack, Reply, ReplyEntry, SerializedRequest, Transport, TransportError};
use crate::types::{ChecksumKind, ObjectAddress, OpFlags, OperationFlags, OperationKind, PoolId, UTime};

/// Longest input accepted by the built-in `hello` class
const HELLO_MAX_INPUT: usize = 100;

/// Largest object the store will hold (osd_max_object_size)
pub const MAX_OBJECT_SIZE: u64 = 128 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    pool: PoolId,
    namespace: String,
    locator_key: Option<String>,
    oid: String,
}

impl From<&ObjectAddress> for ObjectKey {
    fn from(addr: &ObjectAddress) -> Self {
        Self {
            pool: addr.pool,
            namespace: addr.namespace.clone(),
            locator_key: addr.locator_key.clone(),
            oid: addr.oid.clone(),
        }
    }
}

/// Stored state of one object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemObject {
    pub data: Vec<u8>,
    pub xattrs: BTreeMap<String, Bytes>,
    pub omap: BTreeMap<String, Bytes>,
    pub version: u64,
    pub mtime: UTime,
}

/// Result of applying one sub-operation: output bytes or a negative errno
type OpOutcome = Result<Bytes, i32>;

/// Transport backed by in-memory objects
pub struct MemStore {
    shards: Vec<Mutex<HashMap<ObjectKey, MemObject>>>,
    ack_latency: Duration,
    commit_latency: Duration,
    jitter: Duration,
}

impl MemStore {
    pub fn new(config: &MemStoreConfig) -> Self {
        let shard_count = (config.memstore_shards.0 as usize).max(1);
        debug!(
            "Creating MemStore: shards={}, ack_latency={:?}, commit_latency={:?}",
            shard_count, config.memstore_ack_latency.0, config.memstore_commit_latency.0
        );
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            ack_latency: config.memstore_ack_latency.0,
            commit_latency: config.memstore_commit_latency.0,
            jitter: config.memstore_latency_jitter.0,
        }
    }

    fn shard(&self, addr: &ObjectAddress) -> &Mutex<HashMap<ObjectKey, MemObject>> {
        &self.shards[addr.placement_hash() as usize % self.shards.len()]
    }

    fn latency(&self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_micros() as u64);
        base + Duration::from_micros(extra)
    }

    /// Copy of an object's current state
    pub async fn get(&self, addr: &ObjectAddress) -> Option<MemObject> {
        self.shard(addr).lock().await.get(&ObjectKey::from(addr)).cloned()
    }

    pub async fn object_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.lock().await.len();
        }
        count
    }

    async fn apply(&self, body: &RequestBody) -> Reply {
        let mut shard = self.shard(&body.address).lock().await;
        let key = ObjectKey::from(&body.address);

        let mut slot = shard.get(&key).cloned();
        let existed = slot.is_some();
        let reply = apply_batch(body, &mut slot);

        match slot {
            Some(obj) => {
                shard.insert(key, obj);
            }
            None => {
                shard.remove(&key);
            }
        }
        trace!(
            "tid={} applied to {}: existed={}, result={}",
            body.tid,
            body.address,
            existed,
            reply.result
        );
        reply
    }
}

#[async_trait]
impl Transport for MemStore {
    async fn send(&self, request: SerializedRequest) -> Result<Ack, TransportError> {
        let body = codec::decode_request(&request.payload)
            .map_err(|e| TransportError::new(errno::EINVAL, e.to_string()))?;
        if body.tid != request.tid || body.address != request.address {
            return Err(TransportError::new(
                errno::EINVAL,
                format!("frame does not match request tid={}", request.tid),
            ));
        }

        let ack_latency = self.latency(self.ack_latency);
        if !ack_latency.is_zero() {
            tokio::time::sleep(ack_latency).await;
        }

        let reply = self.apply(&body).await;

        if body.kind == OperationKind::Read {
            return Ok(Ack::committed(reply));
        }
        let commit_latency = self.latency(self.commit_latency);
        let commit = async move {
            if !commit_latency.is_zero() {
                tokio::time::sleep(commit_latency).await;
            }
            Ok(())
        }
        .boxed();
        Ok(Ack::new(reply, commit))
    }
}

fn apply_batch(body: &RequestBody, slot: &mut Option<MemObject>) -> Reply {
    let ordered = body.flags.contains(OperationFlags::ORDERED);
    let failok = body.op_flags.contains(OpFlags::FAILOK);
    let exclusive = body.op_flags.contains(OpFlags::EXCL);

    let mut entries = Vec::with_capacity(body.ops.len());
    let mut first_failure = None;
    let mut stopped = false;
    let mut mutated = false;

    for op in &body.ops {
        if stopped {
            entries.push(ReplyEntry::err(errno::ECANCELED));
            continue;
        }
        let outcome = if body.address.snap.is_head() {
            apply_op(op, slot, exclusive)
        } else {
            // no snapshots are kept
            Err(errno::ENOENT)
        };
        if outcome.is_ok() && op.opcode().is_write() {
            mutated = true;
        }
        match outcome {
            Ok(outdata) => entries.push(ReplyEntry::ok(outdata)),
            Err(code) => {
                first_failure.get_or_insert(code);
                if ordered && !failok {
                    stopped = true;
                }
                entries.push(ReplyEntry::err(code));
            }
        }
    }

    if mutated {
        if let Some(obj) = slot.as_mut() {
            obj.version += 1;
            obj.mtime = body.mtime.unwrap_or_else(UTime::now);
        }
    }

    Reply {
        result: if failok { 0 } else { first_failure.unwrap_or(0) },
        version: slot.as_ref().map_or(0, |obj| obj.version),
        entries,
    }
}

fn existing(slot: &Option<MemObject>) -> Result<&MemObject, i32> {
    slot.as_ref().ok_or(errno::ENOENT)
}

fn existing_mut(slot: &mut Option<MemObject>) -> Result<&mut MemObject, i32> {
    slot.as_mut().ok_or(errno::ENOENT)
}

/// End of `offset..offset + len`; `-EFBIG` past the largest object
fn extent_end(offset: u64, len: u64) -> Result<usize, i32> {
    match offset.checked_add(len) {
        Some(end) if end <= MAX_OBJECT_SIZE => Ok(end as usize),
        _ => Err(errno::EFBIG),
    }
}

/// Clamp `offset..offset + len` to an object of `size` bytes
fn clamp_extent(offset: u64, len: u64, size: usize) -> (usize, usize) {
    let size = size as u64;
    let start = offset.min(size);
    let end = offset.saturating_add(len).min(size);
    (start as usize, end as usize)
}

/// Write `data` at `offset`, growing the object with zeros as needed
fn write_at(obj: &mut MemObject, offset: u64, data: &[u8]) -> Result<(), i32> {
    let end = extent_end(offset, data.len() as u64)?;
    let start = offset as usize;
    if obj.data.len() < end {
        obj.data.resize(end, 0);
    }
    obj.data[start..end].copy_from_slice(data);
    Ok(())
}

fn encode_output<T: codec::Denc>(value: &T) -> OpOutcome {
    codec::to_bytes(value).map_err(|_| errno::EIO)
}

fn apply_op(op: &SubOp, slot: &mut Option<MemObject>, exclusive: bool) -> OpOutcome {
    let empty = Ok(Bytes::new());

    match op {
        SubOp::AssertExists => existing(slot).and(empty),
        SubOp::AssertVersion(v) => {
            let obj = existing(slot)?;
            if *v < obj.version {
                Err(errno::ERANGE)
            } else if *v > obj.version {
                Err(errno::EOVERFLOW)
            } else {
                empty
            }
        }
        SubOp::CompareExtent { offset, data } => {
            let obj = existing(slot)?;
            let start = usize::try_from(*offset).unwrap_or(usize::MAX);
            let mismatch = data.iter().enumerate().find(|(i, b)| {
                obj.data.get(start.saturating_add(*i)).copied().unwrap_or(0) != **b
            });
            match mismatch {
                Some((i, _)) => {
                    let i = i32::try_from(i).unwrap_or(i32::MAX);
                    Err(-errno::MAX_ERRNO.saturating_add(i))
                }
                None => empty,
            }
        }
        SubOp::CompareXattr { name, op, value } => {
            let obj = existing(slot)?;
            let actual = obj.xattrs.get(name).ok_or(errno::ENODATA)?;
            if op.matches(actual, value) {
                empty
            } else {
                Err(errno::ECANCELED)
            }
        }
        SubOp::CompareOmapEntry { key, op, value } => {
            let obj = existing(slot)?;
            match obj.omap.get(key) {
                Some(actual) if op.matches(actual, value) => empty,
                _ => Err(errno::ECANCELED),
            }
        }
        SubOp::Exec {
            class,
            method,
            input,
        } => call_class(class, method, input),

        SubOp::Create { exclusive: excl } => {
            if slot.is_some() {
                if *excl || exclusive {
                    return Err(errno::EEXIST);
                }
                return empty;
            }
            *slot = Some(MemObject::default());
            empty
        }
        SubOp::Remove => {
            existing(slot)?;
            *slot = None;
            empty
        }
        SubOp::Write { offset, data } => {
            extent_end(*offset, data.len() as u64)?;
            write_at(slot.get_or_insert_with(MemObject::default), *offset, data)?;
            empty
        }
        SubOp::WriteFull(data) => {
            extent_end(0, data.len() as u64)?;
            slot.get_or_insert_with(MemObject::default).data = data.to_vec();
            empty
        }
        SubOp::Append(data) => {
            let size = slot.as_ref().map_or(0, |obj| obj.data.len() as u64);
            extent_end(size, data.len() as u64)?;
            slot.get_or_insert_with(MemObject::default)
                .data
                .extend_from_slice(data);
            empty
        }
        SubOp::WriteSame {
            offset,
            write_len,
            data,
        } => {
            if data.is_empty() || *write_len % data.len() as u64 != 0 {
                return Err(errno::EINVAL);
            }
            extent_end(*offset, *write_len)?;
            let pattern: Vec<u8> = data
                .iter()
                .copied()
                .cycle()
                .take(*write_len as usize)
                .collect();
            write_at(slot.get_or_insert_with(MemObject::default), *offset, &pattern)?;
            empty
        }
        SubOp::Truncate(size) => {
            let size = extent_end(*size, 0)?;
            slot.get_or_insert_with(MemObject::default)
                .data
                .resize(size, 0);
            empty
        }
        SubOp::Zero { offset, len } => {
            // zeroing never extends, and a missing object stays missing
            if let Some(obj) = slot.as_mut() {
                let (start, end) = clamp_extent(*offset, *len, obj.data.len());
                obj.data[start..end].fill(0);
            }
            empty
        }
        SubOp::SetXattr { name, value } => {
            slot.get_or_insert_with(MemObject::default)
                .xattrs
                .insert(name.clone(), value.clone());
            empty
        }
        SubOp::RemoveXattr(name) => {
            let obj = existing_mut(slot)?;
            obj.xattrs.remove(name).ok_or(errno::ENODATA)?;
            empty
        }
        SubOp::OmapSet(entries) => {
            let obj = slot.get_or_insert_with(MemObject::default);
            obj.omap
                .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            empty
        }
        SubOp::OmapRemoveKeys(keys) => {
            let obj = existing_mut(slot)?;
            for key in keys {
                obj.omap.remove(key);
            }
            empty
        }
        SubOp::OmapRemoveRange { start, end } => {
            let obj = existing_mut(slot)?;
            obj.omap
                .retain(|k, _| k.as_str() < start.as_str() || k.as_str() >= end.as_str());
            empty
        }
        SubOp::OmapClear => {
            existing_mut(slot)?.omap.clear();
            empty
        }
        SubOp::SetAllocHint { .. } => {
            slot.get_or_insert_with(MemObject::default);
            empty
        }

        SubOp::Read { offset, len } => {
            let obj = existing(slot)?;
            let len = if *len == 0 { u64::MAX } else { *len };
            let (start, end) = clamp_extent(*offset, len, obj.data.len());
            Ok(Bytes::copy_from_slice(&obj.data[start..end]))
        }
        SubOp::Stat => {
            let obj = existing(slot)?;
            encode_output(&StatInfo {
                size: obj.data.len() as u64,
                mtime: obj.mtime,
            })
        }
        SubOp::GetXattr(name) => existing(slot)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(errno::ENODATA),
        SubOp::GetXattrs => encode_output(&existing(slot)?.xattrs),
        SubOp::OmapGetVals {
            start_after,
            prefix,
            max,
        } => {
            let obj = existing(slot)?;
            let mut matching = obj
                .omap
                .iter()
                .filter(|(k, _)| k.as_str() > start_after.as_str() && k.starts_with(prefix.as_str()));
            let limit = page_limit(*max);
            let entries: BTreeMap<String, Bytes> = matching
                .by_ref()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let more = matching.next().is_some();
            encode_output(&OmapPage { entries, more })
        }
        SubOp::OmapGetKeys { start_after, max } => {
            let obj = existing(slot)?;
            let mut matching = obj
                .omap
                .keys()
                .filter(|k| k.as_str() > start_after.as_str());
            let keys: Vec<String> = matching.by_ref().take(page_limit(*max)).cloned().collect();
            let more = matching.next().is_some();
            encode_output(&OmapKeyPage { keys, more })
        }
        SubOp::OmapGetValsByKeys(keys) => {
            let obj = existing(slot)?;
            let found: BTreeMap<String, Bytes> = keys
                .iter()
                .filter_map(|k| obj.omap.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            encode_output(&found)
        }
        SubOp::Checksum {
            kind,
            init,
            offset,
            len,
            chunk_size,
        } => {
            let obj = existing(slot)?;
            checksum(&obj.data, *kind, *init, *offset, *len, *chunk_size)
        }
    }
}

/// Zero means no limit
fn page_limit(max: u64) -> usize {
    if max == 0 {
        usize::MAX
    } else {
        max as usize
    }
}

/// Checksum `len` bytes at `offset` in `chunk_size` pieces, each seeded with `init`
fn checksum(data: &[u8], kind: ChecksumKind, init: u64, offset: u64, len: u64, chunk_size: u64) -> OpOutcome {
    let size = data.len() as u64;
    let len = if len == 0 { size.saturating_sub(offset) } else { len };
    let end = match offset.checked_add(len) {
        Some(end) if end <= size => end,
        _ => return Err(errno::EINVAL),
    };
    if chunk_size == 0 || len % chunk_size != 0 {
        return Err(errno::EINVAL);
    }
    let range = &data[offset as usize..end as usize];
    let sums: Vec<u64> = range
        .chunks(chunk_size as usize)
        .map(|chunk| match kind {
            ChecksumKind::XxHash32 => xxh32(chunk, init as u32) as u64,
            ChecksumKind::XxHash64 => xxh64(chunk, init),
            ChecksumKind::Crc32c => crc32c::crc32c_append(init as u32, chunk) as u64,
        })
        .collect();
    encode_output(&sums)
}

/// Built-in object classes
fn call_class(class: &str, method: &str, input: &[u8]) -> OpOutcome {
    match (class, method) {
        ("hello", "say_hello") => {
            if input.len() > HELLO_MAX_INPUT {
                return Err(errno::EINVAL);
            }
            let name = if input.is_empty() {
                "world".to_string()
            } else {
                String::from_utf8_lossy(input).into_owned()
            };
            Ok(Bytes::from(format!("Hello, {}!", name)))
        }
        _ => Err(errno::EOPNOTSUPP),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompareOp, SnapId};

    fn body(kind: OperationKind, ops: Vec<SubOp>) -> RequestBody {
        RequestBody {
            tid: 1,
            address: ObjectAddress::new(1, "obj"),
            kind,
            flags: OperationFlags::empty(),
            op_flags: OpFlags::empty(),
            mtime: Some(UTime::new(100, 0)),
            ops,
        }
    }

    fn codes(reply: &Reply) -> Vec<i32> {
        reply.entries.iter().map(|e| e.return_code).collect()
    }

    #[test]
    fn test_write_then_read() {
        let mut slot = None;
        let reply = apply_batch(
            &body(
                OperationKind::Write,
                vec![
                    SubOp::Create { exclusive: true },
                    SubOp::Write {
                        offset: 2,
                        data: Bytes::from_static(b"cd"),
                    },
                    SubOp::SetXattr {
                        name: "a".into(),
                        value: Bytes::from_static(b"1"),
                    },
                ],
            ),
            &mut slot,
        );
        assert_eq!(reply.result, 0);
        assert_eq!(reply.version, 1);
        let obj = slot.as_ref().unwrap();
        assert_eq!(obj.data, b"\0\0cd");
        assert_eq!(obj.mtime, UTime::new(100, 0));

        let reply = apply_batch(
            &body(
                OperationKind::Read,
                vec![
                    SubOp::Read { offset: 2, len: 0 },
                    SubOp::GetXattr("a".into()),
                    SubOp::GetXattr("b".into()),
                ],
            ),
            &mut slot,
        );
        assert_eq!(codes(&reply), vec![0, 0, errno::ENODATA]);
        assert_eq!(reply.entries[0].outdata, Bytes::from_static(b"cd"));
        // reads don't bump the version
        assert_eq!(reply.version, 1);
    }

    #[test]
    fn test_exclusive_create() {
        let mut slot = Some(MemObject::default());
        let reply = apply_batch(
            &body(OperationKind::Write, vec![SubOp::Create { exclusive: true }]),
            &mut slot,
        );
        assert_eq!(reply.result, errno::EEXIST);

        let mut b = body(OperationKind::Write, vec![SubOp::Create { exclusive: false }]);
        b.op_flags = OpFlags::EXCL;
        assert_eq!(apply_batch(&b, &mut slot).result, errno::EEXIST);
    }

    #[test]
    fn test_unordered_continues_past_failure() {
        let mut slot = None;
        let reply = apply_batch(
            &body(
                OperationKind::Write,
                vec![
                    SubOp::WriteFull(Bytes::from_static(b"x")),
                    SubOp::RemoveXattr("missing".into()),
                    SubOp::Append(Bytes::from_static(b"y")),
                ],
            ),
            &mut slot,
        );
        assert_eq!(codes(&reply), vec![0, errno::ENODATA, 0]);
        assert_eq!(reply.result, errno::ENODATA);
        assert_eq!(slot.unwrap().data, b"xy");
    }

    #[test]
    fn test_ordered_stops_without_rollback() {
        let mut slot = None;
        let mut b = body(
            OperationKind::Write,
            vec![
                SubOp::WriteFull(Bytes::from_static(b"x")),
                SubOp::RemoveXattr("missing".into()),
                SubOp::Append(Bytes::from_static(b"y")),
            ],
        );
        b.flags = OperationFlags::ORDERED;
        let reply = apply_batch(&b, &mut slot);
        assert_eq!(codes(&reply), vec![0, errno::ENODATA, errno::ECANCELED]);
        // the first write stays applied
        assert_eq!(slot.unwrap().data, b"x");
    }

    #[test]
    fn test_failok_overall_success() {
        let mut slot = None;
        let mut b = body(OperationKind::Read, vec![SubOp::Stat]);
        b.op_flags = OpFlags::FAILOK;
        let reply = apply_batch(&b, &mut slot);
        assert_eq!(reply.result, 0);
        assert_eq!(codes(&reply), vec![errno::ENOENT]);
    }

    #[test]
    fn test_assert_version() {
        let mut slot = Some(MemObject {
            version: 5,
            ..Default::default()
        });
        let reply = apply_batch(
            &body(
                OperationKind::Read,
                vec![
                    SubOp::AssertVersion(5),
                    SubOp::AssertVersion(4),
                    SubOp::AssertVersion(6),
                ],
            ),
            &mut slot,
        );
        assert_eq!(codes(&reply), vec![0, errno::ERANGE, errno::EOVERFLOW]);
    }

    #[test]
    fn test_compare_ops() {
        let mut obj = MemObject {
            data: b"hello".to_vec(),
            ..Default::default()
        };
        obj.xattrs.insert("v".into(), Bytes::from_static(b"2"));
        obj.omap.insert("k".into(), Bytes::from_static(b"b"));
        let mut slot = Some(obj);

        let reply = apply_batch(
            &body(
                OperationKind::Read,
                vec![
                    SubOp::CompareExtent {
                        offset: 0,
                        data: Bytes::from_static(b"help"),
                    },
                    SubOp::CompareXattr {
                        name: "v".into(),
                        op: CompareOp::Gt,
                        value: Bytes::from_static(b"1"),
                    },
                    SubOp::CompareXattr {
                        name: "v".into(),
                        op: CompareOp::Eq,
                        value: Bytes::from_static(b"3"),
                    },
                    SubOp::CompareOmapEntry {
                        key: "k".into(),
                        op: CompareOp::Lt,
                        value: Bytes::from_static(b"c"),
                    },
                ],
            ),
            &mut slot,
        );
        assert_eq!(
            codes(&reply),
            vec![-(errno::MAX_ERRNO + 3), 0, errno::ECANCELED, 0]
        );
    }

    #[test]
    fn test_write_same_and_zero() {
        let mut slot = None;
        let reply = apply_batch(
            &body(
                OperationKind::Write,
                vec![
                    SubOp::WriteSame {
                        offset: 0,
                        write_len: 6,
                        data: Bytes::from_static(b"ab"),
                    },
                    SubOp::Zero { offset: 4, len: 10 },
                    SubOp::WriteSame {
                        offset: 0,
                        write_len: 5,
                        data: Bytes::from_static(b"ab"),
                    },
                ],
            ),
            &mut slot,
        );
        assert_eq!(codes(&reply), vec![0, 0, errno::EINVAL]);
        assert_eq!(slot.unwrap().data, b"abab\0\0");
    }

    #[test]
    fn test_omap_paging() {
        let mut obj = MemObject::default();
        for k in ["a1", "a2", "a3", "b1"] {
            obj.omap.insert(k.into(), Bytes::from(k.to_uppercase()));
        }
        let mut slot = Some(obj);
        let reply = apply_batch(
            &body(
                OperationKind::Read,
                vec![
                    SubOp::OmapGetVals {
                        start_after: "a1".into(),
                        prefix: "a".into(),
                        max: 1,
                    },
                    SubOp::OmapGetKeys {
                        start_after: String::new(),
                        max: 0,
                    },
                ],
            ),
            &mut slot,
        );
        let page: OmapPage = codec::from_bytes(&reply.entries[0].outdata).unwrap();
        assert_eq!(page.entries.keys().collect::<Vec<_>>(), vec!["a2"]);
        assert!(page.more);
        let keys: OmapKeyPage = codec::from_bytes(&reply.entries[1].outdata).unwrap();
        assert_eq!(keys.keys, vec!["a1", "a2", "a3", "b1"]);
        assert!(!keys.more);
    }

    #[test]
    fn test_omap_remove_range() {
        let mut obj = MemObject::default();
        for k in ["a", "b", "c", "d"] {
            obj.omap.insert(k.into(), Bytes::new());
        }
        let mut slot = Some(obj);
        apply_batch(
            &body(
                OperationKind::Write,
                vec![SubOp::OmapRemoveRange {
                    start: "b".into(),
                    end: "d".into(),
                }],
            ),
            &mut slot,
        );
        assert_eq!(
            slot.unwrap().omap.keys().collect::<Vec<_>>(),
            vec!["a", "d"]
        );
    }

    #[test]
    fn test_checksum() {
        let data = b"abcdefgh".to_vec();
        let out = checksum(&data, ChecksumKind::Crc32c, 0, 0, 0, 4).unwrap();
        let sums: Vec<u64> = codec::from_bytes(&out).unwrap();
        assert_eq!(
            sums,
            vec![
                crc32c::crc32c(b"abcd") as u64,
                crc32c::crc32c(b"efgh") as u64
            ]
        );
        let out = checksum(&data, ChecksumKind::XxHash64, 7, 0, 0, 8).unwrap();
        let sums: Vec<u64> = codec::from_bytes(&out).unwrap();
        assert_eq!(sums, vec![xxh64(b"abcdefgh", 7)]);

        let out = checksum(&data, ChecksumKind::XxHash32, 0, 4, 4, 2).unwrap();
        let sums: Vec<u64> = codec::from_bytes(&out).unwrap();
        assert_eq!(sums, vec![xxh32(b"ef", 0) as u64, xxh32(b"gh", 0) as u64]);

        assert_eq!(
            checksum(&data, ChecksumKind::Crc32c, 0, 4, u64::MAX, 4),
            Err(errno::EINVAL)
        );
        assert_eq!(
            checksum(&data, ChecksumKind::Crc32c, 0, 0, 6, 4),
            Err(errno::EINVAL)
        );
    }

    #[test]
    fn test_exec_hello() {
        assert_eq!(
            call_class("hello", "say_hello", b""),
            Ok(Bytes::from_static(b"Hello, world!"))
        );
        assert_eq!(
            call_class("hello", "say_hello", b"rust"),
            Ok(Bytes::from_static(b"Hello, rust!"))
        );
        assert_eq!(call_class("nope", "x", b""), Err(errno::EOPNOTSUPP));
        assert_eq!(
            call_class("hello", "say_hello", &[b'x'; 101]),
            Err(errno::EINVAL)
        );
    }

    #[test]
    fn test_remove_then_missing() {
        let mut slot = Some(MemObject::default());
        let reply = apply_batch(
            &body(OperationKind::Write, vec![SubOp::Remove, SubOp::Remove]),
            &mut slot,
        );
        assert_eq!(codes(&reply), vec![0, errno::ENOENT]);
        assert!(slot.is_none());
        assert_eq!(reply.version, 0);
    }

    #[test]
    fn test_snapshot_reads_find_nothing() {
        let mut slot = Some(MemObject::default());
        let mut b = body(OperationKind::Read, vec![SubOp::Stat]);
        b.address = b.address.at_snap(SnapId(4));
        assert_eq!(apply_batch(&b, &mut slot).result, errno::ENOENT);
    }

    #[tokio::test]
    async fn test_send_roundtrip() {
        let store = MemStore::new(&MemStoreConfig::default());
        let addr = ObjectAddress::new(3, "o").with_locator_key("k");

        let mut op = crate::operation::Operation::new_write(addr.clone());
        op.write_full(&b"payload"[..]).unwrap();
        let finalized = op.finalize(9).unwrap();

        let ack = store.send(finalized.request).await.unwrap();
        assert_eq!(ack.reply.result, 0);
        assert_eq!(ack.reply.entries.len(), 1);
        ack.commit.await.unwrap();

        let obj = store.get(&addr).await.unwrap();
        assert_eq!(obj.data, b"payload");
        assert_eq!(obj.version, 1);
        assert_eq!(store.object_count().await, 1);
        // the locator key is part of the identity
        assert!(store.get(&ObjectAddress::new(3, "o")).await.is_none());
    }

    #[tokio::test]
    async fn test_send_rejects_garbage() {
        let store = MemStore::new(&MemStoreConfig::default());
        let err = store
            .send(SerializedRequest {
                tid: 1,
                address: ObjectAddress::new(1, "x"),
                payload: Bytes::from_static(b"not a frame"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, errno::EINVAL);
    }
}
