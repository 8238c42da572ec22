//! End-to-end scenarios exercising a `Store` the way a host application
//! would, across close/reopen boundaries.

use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use fragmenta::constants::{BlockType, Logic, Operator, SortOrder, TAG_CREATION_TIME};
use fragmenta::metadata::{BatchOp, Condition, MetadataBatch, MetadataQuery};
use fragmenta::store::{CreateOptions, OpenOptions, Store};
use fragmenta::{FragmentaError, WriteBlockOptions};
use tempfile::tempdir;

const USER_TAG: u16 = 0x1001;

/// Surfaces the crate's `log::warn!` diagnostics (lock contention, checksum
/// mismatches) on stderr when these tests run with `--nocapture`. Safe to
/// call from every test; `try_init` only installs the logger once.
fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn scenario_a_create_commit_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.frag");

    let store = Store::create(&path, CreateOptions { block_size: 4096, ..Default::default() }).unwrap();
    store.set_metadata(USER_TAG, "测试数据".as_bytes().to_vec()).unwrap();
    let block_id = store
        .write_block("数据块内容".as_bytes(), WriteBlockOptions { checksum: true, ..Default::default() })
        .unwrap();
    assert!(block_id >= 1);
    store.commit().unwrap();
    store.close().unwrap();

    let reopened = Store::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(reopened.get_metadata(USER_TAG).unwrap(), "测试数据".as_bytes());
    assert_eq!(reopened.read_block(block_id).unwrap(), "数据块内容".as_bytes());
}

#[test]
fn scenario_b_batch_atomicity() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("b.frag");

    let store = Store::create(&path, CreateOptions::default()).unwrap();
    store
        .batch_metadata(MetadataBatch {
            ops: vec![
                BatchOp::Set { tag: 0x1001, value: b"value1".to_vec() },
                BatchOp::Set { tag: 0x1002, value: b"value2".to_vec() },
                BatchOp::Set { tag: 0x1003, value: b"value3".to_vec() },
            ],
            atomic: true,
            rollback_on_error: true,
        })
        .unwrap();
    store.commit().unwrap();

    assert_eq!(store.get_metadata(0x1001).unwrap(), b"value1");
    assert_eq!(store.get_metadata(0x1002).unwrap(), b"value2");
    assert_eq!(store.get_metadata(0x1003).unwrap(), b"value3");

    store
        .batch_metadata(MetadataBatch {
            ops: vec![BatchOp::Delete { tag: 0x1001 }],
            atomic: true,
            rollback_on_error: true,
        })
        .unwrap();

    assert!(matches!(store.get_metadata(0x1001), Err(FragmentaError::MetadataNotFound { .. })));
    assert_eq!(store.get_metadata(0x1002).unwrap(), b"value2");
    assert_eq!(store.get_metadata(0x1003).unwrap(), b"value3");
}

#[test]
fn scenario_c_protected_tag() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("c.frag"), CreateOptions::default()).unwrap();

    let err = store.delete_metadata(TAG_CREATION_TIME).unwrap_err();
    assert!(matches!(err, FragmentaError::ProtectedMetadata { .. }));
    assert!(store.list_metadata().contains_key(&TAG_CREATION_TIME));
}

#[test]
fn scenario_d_query_and() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("d.frag"), CreateOptions::default()).unwrap();
    store.set_metadata(0x1000, b"doc".to_vec()).unwrap();
    store.set_metadata(0x1001, b"audio".to_vec()).unwrap();

    let query = MetadataQuery {
        conditions: vec![Condition { tag: 0x1000, operator: Operator::Contains, value: b"do".to_vec() }],
        logic: Logic::And,
        limit: 10,
        offset: 0,
        sort_by: None,
        sort_order: SortOrder::Asc,
    };
    let result = store.query_metadata(&query).unwrap();
    assert_eq!(result.total_count, 1);
    assert_eq!(result.return_count, 1);
    assert_eq!(result.entries[0].tag, 0x1000);
}

#[test]
fn scenario_e_checksum_corruption() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("e.frag");

    let store = Store::create(&path, CreateOptions::default()).unwrap();
    let block_id = store
        .write_block(b"sensitive payload", WriteBlockOptions { checksum: true, ..Default::default() })
        .unwrap();
    store.commit().unwrap();
    store.close().unwrap();

    // Flip one byte inside the payload on disk, past the 64-byte block header.
    let header = Store::open(&path, OpenOptions { read_only: true }).unwrap().get_header();
    let payload_offset = header.block_offset + 64;
    let mut file = FsOpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(payload_offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(payload_offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    drop(file);

    let reopened = Store::open(&path, OpenOptions::default()).unwrap();
    let err = reopened.read_block(block_id).unwrap_err();
    assert!(matches!(err, FragmentaError::ChecksumMismatch { .. }));
}

#[test]
fn scenario_f_block_link_chain() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("f.frag"), CreateOptions::default()).unwrap();

    let id1 = store.write_block(b"D1", WriteBlockOptions { block_type: BlockType::Normal, ..Default::default() }).unwrap();
    let id2 = store
        .write_block(b"D2", WriteBlockOptions { append_to_id: Some(id1), ..Default::default() })
        .unwrap();

    assert_eq!(store.get_block_info(id1).unwrap().next_block, id2);
    assert_eq!(store.get_block_info(id2).unwrap().previous_block, id1);

    store.delete_block(id1).unwrap();
    assert_eq!(store.get_block_info(id2).unwrap().previous_block, 0);
}
