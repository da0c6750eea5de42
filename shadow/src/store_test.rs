use crate::{
    attributes::{AttrValue, SlotAttributes, ATTR_CLAIM_ID, ATTR_LAST_JOB_LEASE_RENEWAL},
    store::{memory::MemoryStore, JobStore, PeerRecord, StoreError},
};

fn record(node: usize) -> PeerRecord {
    let mut attributes = SlotAttributes::new();
    attributes.set(ATTR_CLAIM_ID, format!("claim-{node}"));
    attributes.set("Environment", AttrValue::Map(Default::default()));

    PeerRecord {
        node,
        address: format!("<10.0.0.{node}:9618>"),
        claim_id: format!("claim-{node}"),
        attributes,
    }
}

fn exercise<S: JobStore>(store: &mut S) {
    assert!(store.load_peers().expect("empty store").is_empty());

    for node in [1, 0, 2] {
        store.record_peer(&record(node)).expect("recorded");
    }

    store
        .update_attr(Some(1), ATTR_LAST_JOB_LEASE_RENEWAL, &AttrValue::Int(1700))
        .expect("known node");
    store
        .update_attr(None, "JobCurrentStartDate", &AttrValue::Int(1600))
        .expect("job attribute");

    let peers = store.load_peers().expect("three peers");
    assert_eq!(
        peers.iter().map(|peer| peer.node).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(peers[2], record(2));
    assert_eq!(
        peers[1].attributes.get_int(ATTR_LAST_JOB_LEASE_RENEWAL),
        Some(1700)
    );

    assert_eq!(
        store
            .lookup_attr(None, "JobCurrentStartDate")
            .expect("lookup"),
        Some(AttrValue::Int(1600))
    );
    assert_eq!(
        store
            .lookup_attr(Some(0), ATTR_CLAIM_ID)
            .expect("lookup"),
        Some(AttrValue::Str("claim-0".to_owned()))
    );
    assert_eq!(store.lookup_attr(Some(7), ATTR_CLAIM_ID).expect("lookup"), None);

    // recording again replaces the node
    let mut replaced = record(0);
    replaced.address = "<10.0.1.1:9618>".to_owned();
    store.record_peer(&replaced).expect("recorded");
    let peers = store.load_peers().expect("three peers");
    assert_eq!(peers.len(), 3);
    assert_eq!(peers[0].address, "<10.0.1.1:9618>");
}

#[test]
pub fn memory_store() {
    let mut store = MemoryStore::default();
    exercise(&mut store);
}

#[test]
pub fn memory_store_rejects_unknown_nodes() {
    let mut store = MemoryStore::default();

    assert!(matches!(
        store.update_attr(Some(4), ATTR_CLAIM_ID, &AttrValue::Int(1)),
        Err(StoreError::InvalidNode(4))
    ));
}

#[cfg(feature = "sqlite")]
#[test]
pub fn sqlite_store() {
    use crate::store::sqlite::SQLiteStore;

    let mut store = SQLiteStore::open_in_memory(42, 0).expect("in-memory database");
    store.init().expect("schema applied");

    exercise(&mut store);
    store.close().expect("closed");
}

#[cfg(feature = "sqlite")]
#[test]
pub fn sqlite_store_separates_jobs() {
    use crate::store::sqlite::SQLiteStore;
    use std::{env, fs};

    let path = env::temp_dir().join(format!("pshadow-store-{}.db", std::process::id()));

    let mut first = SQLiteStore::load(&path, 1, 0).expect("database");
    first.init().expect("schema applied");
    first.record_peer(&record(0)).expect("recorded");
    first.close().expect("closed");

    let mut second = SQLiteStore::load(&path, 2, 0).expect("database");
    second.init().expect("schema is idempotent");
    assert!(second.load_peers().expect("other job").is_empty());
    second.close().expect("closed");

    let first = SQLiteStore::load(&path, 1, 0).expect("database");
    assert_eq!(first.load_peers().expect("recorded job"), vec![record(0)]);
    first.close().expect("closed");

    let _ = fs::remove_file(&path);
}
