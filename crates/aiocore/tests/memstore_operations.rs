//! End-to-end object operations against the in-memory store
//!
//! Configuration is loaded from conf text the same way the tool does it.

use std::sync::Arc;

use aioconfig::ConfFile;
use aiocore::memstore::MAX_OBJECT_SIZE;
use aiocore::{
    errno, AioError, ChecksumKind, MemStore, MemStoreConfig, ObjectAddress, Objecter,
    ObjecterConfig, Operation, UTime,
};
use bytes::Bytes;
use tracing::info;

const CONF: &str = "
[global]
objecter inflight ops = 16
rados osd op timeout = 5s

[client]
memstore commit latency = 2ms
memstore shards = 4
";

async fn setup() -> (Objecter, Arc<MemStore>) {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let conf = ConfFile::parse(CONF).expect("Failed to parse conf");
    let store = Arc::new(MemStore::new(&MemStoreConfig::load(&conf).unwrap()));
    let objecter = Objecter::new(store.clone(), &ObjecterConfig::load(&conf).unwrap())
        .expect("Failed to create objecter");
    assert_eq!(objecter.throttle().max_ops(), 16);
    (objecter, store)
}

async fn read_all(objecter: &Objecter, addr: &ObjectAddress) -> aiocore::Result<Bytes> {
    let mut op = Operation::new_read(addr.clone());
    op.read(0, 0)?;
    let results = objecter.operate(&mut op).await?;
    results[0].data()
}

#[tokio::test]
async fn test_data_mutations() {
    let (objecter, _store) = setup().await;
    let addr = ObjectAddress::new(1, "data");

    let mut op = Operation::new_write(addr.clone());
    op.write_full(&b"hello world"[..]).unwrap();
    op.append_data(&b"!!"[..]).unwrap();
    op.zero(0, 5).unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert_eq!(
        read_all(&objecter, &addr).await.unwrap(),
        Bytes::from_static(b"\0\0\0\0\0 world!!")
    );

    let mut op = Operation::new_write(addr.clone());
    op.truncate(3).unwrap();
    op.write_same(3, 4, &b"ab"[..]).unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert_eq!(
        read_all(&objecter, &addr).await.unwrap(),
        Bytes::from_static(b"\0\0\0abab")
    );

    let mut op = Operation::new_write(addr.clone());
    op.remove().unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert!(matches!(
        read_all(&objecter, &addr).await,
        Err(AioError::Remote { code }) if code == errno::ENOENT
    ));
}

#[tokio::test]
async fn test_versions_and_mtime() {
    let (objecter, store) = setup().await;
    let addr = ObjectAddress::new(1, "versioned");

    for i in 0..3u64 {
        let mut op = Operation::new_write(addr.clone());
        op.write(i, &b"x"[..]).unwrap();
        op.set_mtime(UTime::new(1_700_000_000 + i, 0)).unwrap();
        objecter.operate(&mut op).await.unwrap();
    }
    let obj = store.get(&addr).await.unwrap();
    assert_eq!(obj.version, 3);

    let mut op = Operation::new_read(addr.clone());
    op.assert_version(3).unwrap();
    let stat = op.stat().unwrap();
    let results = objecter.operate(&mut op).await.unwrap();
    let info = results[stat].stat().unwrap();
    info!("stat: {:?}", info);
    assert_eq!(info.size, 3);
    assert_eq!(info.mtime, UTime::new(1_700_000_002, 0));

    let mut op = Operation::new_read(addr.clone());
    op.assert_version(2).unwrap();
    assert!(matches!(
        objecter.operate(&mut op).await,
        Err(AioError::Remote { code }) if code == errno::ERANGE
    ));

    // a failed guard still leaves the version alone
    assert_eq!(store.get(&addr).await.unwrap().version, 3);
}

#[tokio::test]
async fn test_exclusive_create_and_assert_exists() {
    let (objecter, _store) = setup().await;
    let addr = ObjectAddress::new(1, "exclusive");

    let mut op = Operation::new_read(addr.clone());
    op.assert_exists().unwrap();
    assert!(matches!(
        objecter.operate(&mut op).await,
        Err(AioError::Remote { code }) if code == errno::ENOENT
    ));

    let mut op = Operation::new_write(addr.clone());
    op.create(true).unwrap();
    objecter.operate(&mut op).await.unwrap();

    let mut op = Operation::new_write(addr.clone());
    op.create(true).unwrap();
    assert!(matches!(
        objecter.operate(&mut op).await,
        Err(AioError::Remote { code }) if code == errno::EEXIST
    ));

    let mut op = Operation::new_write(addr.clone());
    op.create(false).unwrap();
    objecter.operate(&mut op).await.unwrap();
}

#[tokio::test]
async fn test_xattrs_and_omap() {
    let (objecter, store) = setup().await;
    let addr = ObjectAddress::new(1, "meta");

    let mut op = Operation::new_write(addr.clone());
    op.set_xattr("owner", &b"alice"[..]).unwrap();
    op.set_xattr("tmp", &b"1"[..]).unwrap();
    op.omap_set((0..10).map(|i| (format!("key{:02}", i), Bytes::from(vec![i as u8]))))
        .unwrap();
    objecter.operate(&mut op).await.unwrap();

    let mut op = Operation::new_write(addr.clone());
    op.rm_xattr("tmp").unwrap();
    op.omap_rm_keys(["key00"]).unwrap();
    op.omap_rm_range("key05", "key08").unwrap();
    objecter.operate(&mut op).await.unwrap();

    let obj = store.get(&addr).await.unwrap();
    assert_eq!(obj.xattrs.len(), 1);
    assert_eq!(
        obj.omap.keys().collect::<Vec<_>>(),
        vec!["key01", "key02", "key03", "key04", "key08", "key09"]
    );

    // page through the omap two keys at a time
    let mut seen = Vec::new();
    let mut start_after = String::new();
    loop {
        let mut op = Operation::new_read(addr.clone());
        op.omap_get_vals(start_after.clone(), "", 2).unwrap();
        let page = objecter.operate(&mut op).await.unwrap()[0]
            .omap_vals()
            .unwrap();
        seen.extend(page.entries.keys().cloned());
        match page.entries.keys().last() {
            Some(last) if page.more => start_after = last.clone(),
            _ => break,
        }
    }
    assert_eq!(seen.len(), 6);

    let mut op = Operation::new_read(addr.clone());
    op.get_xattr("owner").unwrap();
    op.omap_cmp("key01", aiocore::CompareOp::Eq, vec![1u8]).unwrap();
    let results = objecter.operate(&mut op).await.unwrap();
    assert_eq!(results[0].xattr().unwrap(), Bytes::from_static(b"alice"));

    let mut op = Operation::new_write(addr.clone());
    op.omap_clear().unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert!(store.get(&addr).await.unwrap().omap.is_empty());
}

#[tokio::test]
async fn test_namespaces_and_locator_keys() {
    let (objecter, store) = setup().await;
    let plain = ObjectAddress::new(1, "same");
    let other_ns = ObjectAddress::new(1, "same").with_namespace("other");
    let located = ObjectAddress::new(1, "same").with_locator_key("group");

    for (addr, data) in [(&plain, "a"), (&other_ns, "b"), (&located, "c")] {
        let mut op = Operation::new_write(addr.clone());
        op.write_full(data.to_string()).unwrap();
        objecter.operate(&mut op).await.unwrap();
    }
    assert_eq!(store.object_count().await, 3);
    assert_eq!(read_all(&objecter, &other_ns).await.unwrap(), Bytes::from_static(b"b"));
    assert_eq!(read_all(&objecter, &located).await.unwrap(), Bytes::from_static(b"c"));

    // objects sharing a locator key hash together
    assert_eq!(
        located.placement_hash(),
        ObjectAddress::new(1, "different").with_locator_key("group").placement_hash()
    );
}

#[tokio::test]
async fn test_unknown_class_method() {
    let (objecter, _store) = setup().await;
    let mut op = Operation::new_read(ObjectAddress::new(1, "cls"));
    op.exec("nosuch", "method", Bytes::new()).unwrap();
    assert!(matches!(
        objecter.operate(&mut op).await,
        Err(AioError::Remote { code }) if code == errno::EOPNOTSUPP
    ));
}

#[tokio::test]
async fn test_extents_past_the_object_are_clamped() {
    let (objecter, _store) = setup().await;
    let addr = ObjectAddress::new(1, "extents");

    let mut op = Operation::new_write(addr.clone());
    op.write_full(&b"0123456789"[..]).unwrap();
    objecter.operate(&mut op).await.unwrap();

    let mut op = Operation::new_read(addr.clone());
    op.read(5, u64::MAX).unwrap();
    op.read(u64::MAX, 3).unwrap();
    op.cmpext(u64::MAX, &b"\0"[..]).unwrap();
    let results = objecter.operate(&mut op).await.unwrap();
    assert_eq!(results[0].data().unwrap(), Bytes::from_static(b"56789"));
    assert!(results[1].data().unwrap().is_empty());

    let mut op = Operation::new_write(addr.clone());
    op.zero(5, u64::MAX).unwrap();
    objecter.operate(&mut op).await.unwrap();
    assert_eq!(
        read_all(&objecter, &addr).await.unwrap(),
        Bytes::from_static(b"01234\0\0\0\0\0")
    );

    let mut op = Operation::new_read(addr.clone());
    op.checksum(ChecksumKind::Crc32c, 0, 4, u64::MAX, 1).unwrap();
    assert!(matches!(
        objecter.operate(&mut op).await,
        Err(AioError::Remote { code }) if code == errno::EINVAL
    ));
}

#[tokio::test]
async fn test_growth_past_max_object_size_is_refused() {
    let (objecter, store) = setup().await;
    let addr = ObjectAddress::new(1, "bounded");

    let mut op = Operation::new_write(addr.clone());
    op.write_full(&b"seed"[..]).unwrap();
    objecter.operate(&mut op).await.unwrap();

    let mut truncate = Operation::new_write(addr.clone());
    truncate.truncate(u64::MAX).unwrap();
    let mut write = Operation::new_write(addr.clone());
    write.write(u64::MAX - 1, &b"xy"[..]).unwrap();
    let mut write_same = Operation::new_write(addr.clone());
    write_same.write_same(0, MAX_OBJECT_SIZE + 2, &b"ab"[..]).unwrap();
    let mut past_end = Operation::new_write(addr.clone());
    past_end.write(MAX_OBJECT_SIZE, &b"z"[..]).unwrap();

    for mut op in [truncate, write, write_same, past_end] {
        assert!(matches!(
            objecter.operate(&mut op).await,
            Err(AioError::Remote { code }) if code == errno::EFBIG
        ));
    }

    let obj = store.get(&addr).await.unwrap();
    assert_eq!(obj.data, b"seed".to_vec());
    assert_eq!(obj.version, 1);

    // an object that never existed is not created by a refused write
    let mut op = Operation::new_write(ObjectAddress::new(1, "never"));
    op.write(MAX_OBJECT_SIZE, &b"z"[..]).unwrap();
    assert!(objecter.operate(&mut op).await.is_err());
    assert!(store.get(&ObjectAddress::new(1, "never")).await.is_none());
}

#[tokio::test]
async fn test_checksum_kinds() {
    let (objecter, _store) = setup().await;
    let addr = ObjectAddress::new(1, "sums");

    let mut op = Operation::new_write(addr.clone());
    op.write_full(&b"abcdefgh"[..]).unwrap();
    objecter.operate(&mut op).await.unwrap();

    let mut op = Operation::new_read(addr.clone());
    let crc = op.checksum(ChecksumKind::Crc32c, 0, 0, 0, 4).unwrap();
    let xx32 = op.checksum(ChecksumKind::XxHash32, 0, 0, 0, 8).unwrap();
    let xx64 = op.checksum(ChecksumKind::XxHash64, 0, 0, 0, 8).unwrap();
    let results = objecter.operate(&mut op).await.unwrap();
    assert_eq!(results[crc].checksums().unwrap().len(), 2);
    assert_eq!(results[xx32].checksums().unwrap().len(), 1);
    assert_eq!(results[xx64].checksums().unwrap().len(), 1);
    assert_ne!(
        results[xx32].checksums().unwrap(),
        results[xx64].checksums().unwrap()
    );
}
