//! End-to-end checks of the basic put/get/del cycle, snapshot
//! visibility, and the durability of committed data across reopens.

use cowdb::{Env, Tree, NO_OVERWRITE};
use tempfile::TempDir;

fn create_env() -> (TempDir, Env) {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().open(dir.path()).unwrap();
    (dir, env)
}

#[test]
fn fresh_environment_reads_nothing() {
    let (_dir, env) = create_env();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.id(), 0);
    assert_eq!(rtxn.get(Tree::main(), b"anything").unwrap(), None);

    let stat = rtxn.stat(Tree::main()).unwrap();
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.leaf_pages, 0);
}

#[test]
fn single_insert_commit_read() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    assert_eq!(wtxn.id(), 1);
    wtxn.put(Tree::main(), b"alpha", b"1", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.id(), 1);
    assert_eq!(rtxn.get(Tree::main(), b"alpha").unwrap(), Some(&b"1"[..]));

    let stat = rtxn.stat(Tree::main()).unwrap();
    assert_eq!(stat.depth, 1);
    assert_eq!(stat.entries, 1);
    assert_eq!(stat.leaf_pages, 1);
}

#[test]
fn overwrite_replaces_the_value() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"first", 0).unwrap();
    wtxn.put(Tree::main(), b"k", b"second-longer", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(
        rtxn.get(Tree::main(), b"k").unwrap(),
        Some(&b"second-longer"[..])
    );
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, 1);
}

#[test]
fn put_del_get_round_trip() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
    assert!(wtxn.del(Tree::main(), b"k", None).unwrap());
    assert_eq!(wtxn.get(Tree::main(), b"k").unwrap(), None);
    assert!(!wtxn.del(Tree::main(), b"k", None).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), None);
}

#[test]
fn deleting_the_only_entry_empties_the_tree() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"solo", b"v", 0).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    assert!(wtxn.del(Tree::main(), b"solo", None).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let stat = rtxn.stat(Tree::main()).unwrap();
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.leaf_pages, 0);
}

#[test]
fn no_overwrite_fails_cleanly_and_txn_stays_usable() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();

    let err = wtxn.put(Tree::main(), b"k", b"other", NO_OVERWRITE).unwrap_err();
    assert!(err.to_string().contains("key already exists"));

    // The failure was benign; the transaction keeps working.
    wtxn.put(Tree::main(), b"k2", b"v2", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"v"[..]));
    assert_eq!(rtxn.get(Tree::main(), b"k2").unwrap(), Some(&b"v2"[..]));
}

#[test]
fn abort_discards_everything() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"kept", b"1", 0).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"dropped", b"2", 0).unwrap();
    wtxn.abort();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"kept").unwrap(), Some(&b"1"[..]));
    assert_eq!(rtxn.get(Tree::main(), b"dropped").unwrap(), None);
    assert_eq!(rtxn.id(), 1);
}

#[test]
fn committed_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        for i in 0..50u32 {
            let key = format!("key{:04}", i);
            let val = format!("val{:04}", i);
            wtxn.put(Tree::main(), key.as_bytes(), val.as_bytes(), 0).unwrap();
        }
        wtxn.commit().unwrap();
    }

    let env = Env::options().open(dir.path()).unwrap();
    let rtxn = env.begin_ro_txn().unwrap();
    for i in 0..50u32 {
        let key = format!("key{:04}", i);
        let val = format!("val{:04}", i);
        assert_eq!(
            rtxn.get(Tree::main(), key.as_bytes()).unwrap(),
            Some(val.as_bytes()),
            "missing {}",
            key
        );
    }
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, 50);
}

#[test]
fn reopening_read_only_does_not_mutate_the_file() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        wtxn.put(Tree::main(), b"stable", b"bytes", 0).unwrap();
        wtxn.commit().unwrap();
    }
    let data_path = dir.path().join("data.cdb");
    let before = std::fs::read(&data_path).unwrap();

    for _ in 0..3 {
        let env = Env::options().read_only(true).open(dir.path()).unwrap();
        let rtxn = env.begin_ro_txn().unwrap();
        assert_eq!(rtxn.get(Tree::main(), b"stable").unwrap(), Some(&b"bytes"[..]));
    }

    let after = std::fs::read(&data_path).unwrap();
    assert_eq!(before, after, "read-only access changed the data file");
}

#[test]
fn snapshot_isolation_across_a_commit() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"a", b"1", 0).unwrap();
    wtxn.commit().unwrap();

    let old = env.begin_ro_txn().unwrap();
    assert_eq!(old.id(), 1);

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"b", b"2", 0).unwrap();
    wtxn.put(Tree::main(), b"a", b"rewritten", 0).unwrap();
    wtxn.commit().unwrap();

    // The old reader still sees exactly snapshot 1.
    assert_eq!(old.get(Tree::main(), b"a").unwrap(), Some(&b"1"[..]));
    assert_eq!(old.get(Tree::main(), b"b").unwrap(), None);

    // A fresh reader (the old one must end first: one slot per thread)
    // sees snapshot 2.
    drop(old);
    let new = env.begin_ro_txn().unwrap();
    assert_eq!(new.id(), 2);
    assert_eq!(new.get(Tree::main(), b"a").unwrap(), Some(&b"rewritten"[..]));
    assert_eq!(new.get(Tree::main(), b"b").unwrap(), Some(&b"2"[..]));
}

#[test]
fn environment_info_tracks_commits() {
    let (_dir, env) = create_env();

    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 0);
    assert_eq!(info.last_pgno, 1); // the two meta pages

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
    wtxn.commit().unwrap();

    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 1);
    assert!(info.last_pgno >= 2);
}

#[test]
fn empty_keys_are_rejected() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let err = wtxn.put(Tree::main(), b"", b"v", 0).unwrap_err();
    assert!(err.to_string().contains("key length"));
}

#[test]
fn oversized_keys_are_rejected() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let big_key = vec![0x61u8; env.max_key_size() + 1];
    let err = wtxn.put(Tree::main(), &big_key, b"v", 0).unwrap_err();
    assert!(err.to_string().contains("key length"));
}
