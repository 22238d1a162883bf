//! Composite operation tests
//!
//! A scripted transport answers every sub-operation itself, failing the
//! ones it is told to, so these tests pin down how replies are split into
//! per-sub-operation results for ordered and unordered batches.

use std::collections::HashMap;
use std::sync::Arc;

use aiocore::codec;
use aiocore::{
    errno, Ack, AioError, ChecksumKind, CompareOp, Failure, MemStore, MemStoreConfig,
    ObjectAddress, Objecter, ObjecterConfig, OpFlags, Operation, OperationFlags, Phase, Reply,
    ReplyEntry, SerializedRequest, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

/// Succeeds every sub-operation except the scripted indexes
///
/// Mirrors store semantics: an ordered batch reports everything after the
/// first failure as cancelled, and the overall result is the first failure.
struct ScriptedTransport {
    failures: HashMap<usize, i32>,
}

impl ScriptedTransport {
    fn failing(index: usize, code: i32) -> Arc<Self> {
        Arc::new(Self {
            failures: HashMap::from([(index, code)]),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: SerializedRequest) -> Result<Ack, TransportError> {
        let body = codec::decode_request(&request.payload)
            .map_err(|e| TransportError::new(errno::EINVAL, e.to_string()))?;
        let ordered = body.flags.contains(OperationFlags::ORDERED);

        let mut first_failure = None;
        let entries = (0..body.ops.len())
            .map(|index| {
                if ordered && first_failure.is_some() {
                    return ReplyEntry::err(errno::ECANCELED);
                }
                match self.failures.get(&index) {
                    Some(&code) => {
                        first_failure.get_or_insert(code);
                        ReplyEntry::err(code)
                    }
                    None => ReplyEntry::ok(Bytes::from(format!("out{}", index))),
                }
            })
            .collect();

        Ok(Ack::committed(Reply {
            result: first_failure.unwrap_or(0),
            version: 7,
            entries,
        }))
    }
}

/// Answers one entry short of the request
struct ShortReplyTransport;

#[async_trait]
impl Transport for ShortReplyTransport {
    async fn send(&self, request: SerializedRequest) -> Result<Ack, TransportError> {
        let body = codec::decode_request(&request.payload)
            .map_err(|e| TransportError::new(errno::EINVAL, e.to_string()))?;
        Ok(Ack::committed(Reply {
            result: 0,
            version: 7,
            entries: (1..body.ops.len()).map(|_| ReplyEntry::ok(Bytes::new())).collect(),
        }))
    }
}

fn four_reads() -> Operation {
    let mut op = Operation::new_read(ObjectAddress::new(1, "batch"));
    for i in 0..4 {
        op.read(i * 10, 10).unwrap();
    }
    op
}

#[tokio::test]
async fn test_unordered_batch_reports_every_result() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let objecter = Objecter::new(
        ScriptedTransport::failing(2, errno::ENOENT),
        &ObjecterConfig::default(),
    )
    .unwrap();
    let completion = objecter.create_completion(None, None);
    objecter.submit(&mut four_reads(), &completion).unwrap();

    assert_eq!(
        completion.wait_for_phase(Phase::Durable).await.unwrap(),
        Phase::Failed
    );
    assert_eq!(
        completion.failure().unwrap(),
        Some(Failure::Remote {
            code: errno::ENOENT
        })
    );

    let results = completion.results().unwrap();
    info!("unordered results: {:?}", results);
    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i);
        assert!(!result.aborted);
        if i == 2 {
            assert_eq!(result.return_code, errno::ENOENT);
            assert!(matches!(
                result.data(),
                Err(AioError::Remote { code }) if code == errno::ENOENT
            ));
        } else {
            assert_eq!(result.return_code, 0);
            assert_eq!(result.data().unwrap(), Bytes::from(format!("out{}", i)));
            assert_eq!(result.bytes_transferred, Some(4));
        }
    }
}

#[tokio::test]
async fn test_ordered_batch_aborts_after_failure() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let objecter = Objecter::new(
        ScriptedTransport::failing(2, errno::ENOENT),
        &ObjecterConfig::default(),
    )
    .unwrap();
    let mut op = four_reads();
    op.set_flags(OperationFlags::ORDERED).unwrap();
    let completion = objecter.create_completion(None, None);
    objecter.submit(&mut op, &completion).unwrap();
    completion.wait_for_phase(Phase::Durable).await.unwrap();

    let results = completion.results().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok() && results[1].is_ok());
    assert_eq!(results[2].return_code, errno::ENOENT);
    assert!(!results[2].aborted);
    assert!(results[3].aborted);
    assert!(matches!(
        results[3].check(),
        Err(AioError::Aborted { index: 3 })
    ));
}

#[tokio::test]
async fn test_failok_batch_succeeds() {
    let objecter = Objecter::new(Arc::new(MemStore::new(&MemStoreConfig::default())), &ObjecterConfig::default())
        .unwrap();
    let mut op = Operation::new_read(ObjectAddress::new(1, "absent"));
    op.stat().unwrap();
    op.set_op_flags(OpFlags::FAILOK).unwrap();

    let results = objecter.operate(&mut op).await.unwrap();
    assert_eq!(results[0].return_code, errno::ENOENT);
}

#[tokio::test]
async fn test_ordered_guards_against_memstore() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let store = Arc::new(MemStore::new(&MemStoreConfig::default()));
    let objecter = Objecter::new(store.clone(), &ObjecterConfig::default()).unwrap();
    let addr = ObjectAddress::new(2, "guarded");

    let mut op = Operation::new_write(addr.clone());
    op.create(true).unwrap();
    op.set_xattr("state", &b"ready"[..]).unwrap();
    objecter.operate(&mut op).await.unwrap();

    // the guard fails, so the write after it must not land
    let mut op = Operation::new_write(addr.clone());
    op.cmpxattr("state", CompareOp::Eq, &b"busy"[..]).unwrap();
    op.write_full(&b"payload"[..]).unwrap();
    op.set_flags(OperationFlags::ORDERED).unwrap();
    let completion = objecter.create_completion(None, None);
    objecter.submit(&mut op, &completion).unwrap();
    assert_eq!(
        completion.wait_for_phase(Phase::Durable).await.unwrap(),
        Phase::Failed
    );
    let results = completion.results().unwrap();
    assert_eq!(results[0].return_code, errno::ECANCELED);
    assert!(results[1].aborted);
    assert!(store.get(&addr).await.unwrap().data.is_empty());

    // with a matching guard the write goes through
    let mut op = Operation::new_write(addr.clone());
    op.cmpxattr("state", CompareOp::Eq, &b"ready"[..]).unwrap();
    op.write_full(&b"payload"[..]).unwrap();
    op.set_flags(OperationFlags::ORDERED).unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert_eq!(store.get(&addr).await.unwrap().data, b"payload");
}

#[tokio::test]
async fn test_mixed_read_batch() {
    let store = Arc::new(MemStore::new(&MemStoreConfig::default()));
    let objecter = Objecter::new(store, &ObjecterConfig::default()).unwrap();
    let addr = ObjectAddress::new(3, "mixed").with_namespace("ns");

    let mut op = Operation::new_write(addr.clone());
    op.write_full(&b"0123456789abcdef"[..]).unwrap();
    op.set_xattr("a", &b"1"[..]).unwrap();
    op.set_xattr("b", &b"2"[..]).unwrap();
    op.omap_set([("k1", &b"v1"[..]), ("k2", &b"v2"[..]), ("x", &b"v3"[..])])
        .unwrap();
    let written = objecter.operate(&mut op).await.unwrap();
    assert_eq!(written[0].bytes_transferred, Some(16));

    let mut op = Operation::new_read(addr.clone());
    let read = op.read(4, 4).unwrap();
    let stat = op.stat().unwrap();
    let xattrs = op.get_xattrs().unwrap();
    let vals = op.omap_get_vals("", "k", 10).unwrap();
    let by_keys = op.omap_get_vals_by_keys(["x", "missing"]).unwrap();
    let keys = op.omap_get_keys("k1", 1).unwrap();
    let sums = op.checksum(ChecksumKind::Crc32c, 0, 0, 16, 8).unwrap();
    let cmp = op.cmpext(0, &b"0124"[..]).unwrap();
    let hello = op.exec("hello", "say_hello", &b"batch"[..]).unwrap();

    let completion = objecter.create_completion(None, None);
    objecter.submit(&mut op, &completion).unwrap();
    completion.wait_for_phase(Phase::Durable).await.unwrap();
    // the cmpext mismatch fails the batch, the other reads still answer
    assert!(matches!(
        completion.failure().unwrap(),
        Some(Failure::Remote { .. })
    ));
    let results = completion.results().unwrap();

    assert_eq!(results[read].data().unwrap(), Bytes::from_static(b"4567"));
    assert_eq!(results[read].bytes_transferred, Some(4));
    assert_eq!(results[stat].stat().unwrap().size, 16);
    assert_eq!(
        results[xattrs].xattrs().unwrap().keys().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    let page = results[vals].omap_vals().unwrap();
    assert_eq!(page.entries.len(), 2);
    assert!(!page.more);
    let found = results[by_keys].omap_vals().unwrap();
    assert_eq!(found.entries.len(), 1);
    assert_eq!(found.entries["x"], Bytes::from_static(b"v3"));
    let key_page = results[keys].omap_keys().unwrap();
    assert_eq!(key_page.keys, vec!["k2"]);
    assert!(key_page.more);
    assert_eq!(
        results[sums].checksums().unwrap(),
        vec![
            crc32c::crc32c(b"01234567") as u64,
            crc32c::crc32c(b"89abcdef") as u64
        ]
    );
    assert_eq!(results[cmp].cmpext_mismatch(), Some(3));
    assert_eq!(
        results[hello].exec_output().unwrap(),
        Bytes::from_static(b"Hello, batch!")
    );
}

#[tokio::test]
async fn test_operation_is_single_use() {
    let objecter = Objecter::new(Arc::new(MemStore::new(&MemStoreConfig::default())), &ObjecterConfig::default())
        .unwrap();
    let mut op = Operation::new_write(ObjectAddress::new(1, "once"));
    op.create(false).unwrap();
    objecter.operate(&mut op).await.unwrap();

    assert!(op.is_finalized());
    assert!(matches!(op.remove(), Err(AioError::InvalidState(_))));
    let completion = objecter.create_completion(None, None);
    assert!(matches!(
        objecter.submit(&mut op, &completion),
        Err(AioError::InvalidState(_))
    ));
    // the failed submission leaves the completion usable
    let mut other = Operation::new_write(ObjectAddress::new(1, "twice"));
    other.create(false).unwrap();
    objecter.submit(&mut other, &completion).unwrap();
    assert_eq!(
        completion.wait_for_phase(Phase::Durable).await.unwrap(),
        Phase::Durable
    );
}

#[tokio::test]
async fn test_read_op_rejects_mutations() {
    let mut op = Operation::new_read(ObjectAddress::new(1, "ro"));
    assert!(matches!(
        op.write_full(&b"x"[..]),
        Err(AioError::InvalidOperation(_))
    ));
    assert!(op.is_empty());
}

#[tokio::test]
async fn test_reply_entry_count_mismatch() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let objecter = Objecter::new(Arc::new(ShortReplyTransport), &ObjecterConfig::default()).unwrap();
    let completion = objecter.create_completion(None, None);
    objecter.submit(&mut four_reads(), &completion).unwrap();

    assert_eq!(
        completion.wait_for_phase(Phase::Durable).await,
        Ok(Phase::Failed)
    );
    assert_eq!(
        completion.failure().unwrap(),
        Some(Failure::Protocol {
            expected: 4,
            actual: 3
        })
    );
    assert_eq!(completion.return_value().unwrap(), errno::EPROTO);
    assert!(matches!(
        completion.results(),
        Err(AioError::ProtocolMismatch {
            expected: 4,
            actual: 3
        })
    ));
    completion.release().unwrap();
}
