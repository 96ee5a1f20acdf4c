//! Named trees: creation, reopening by name, flag validation, drop, and
//! the interaction with the main tree that stores their records.

use cowdb::{Env, Tree, DUP_SORT, REVERSE_KEY};
use tempfile::TempDir;

fn create_env() -> (TempDir, Env) {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options()
        .map_size(64 << 20)
        .max_named_trees(4)
        .open(dir.path())
        .unwrap();
    (dir, env)
}

#[test]
fn create_put_reopen_by_name() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().max_named_trees(4).open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        let logs = wtxn.create_tree("logs", 0).unwrap();
        wtxn.put(logs, b"entry", b"payload", 0).unwrap();
        wtxn.commit().unwrap();
    }

    let env = Env::options().max_named_trees(4).open(dir.path()).unwrap();
    let rtxn = env.begin_ro_txn().unwrap();
    let logs = rtxn.open_tree("logs").unwrap();
    assert_eq!(rtxn.get(logs, b"entry").unwrap(), Some(&b"payload"[..]));
    assert_eq!(rtxn.stat(logs).unwrap().entries, 1);
}

#[test]
fn named_trees_are_independent_of_main() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let side = wtxn.create_tree("side", 0).unwrap();
    wtxn.put(Tree::main(), b"k", b"main-value", 0).unwrap();
    wtxn.put(side, b"k", b"side-value", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"main-value"[..]));
    assert_eq!(rtxn.get(side, b"k").unwrap(), Some(&b"side-value"[..]));

    // The record node lives in the main tree under the tree's name.
    assert!(rtxn.get(Tree::main(), b"side").unwrap().is_some());
}

#[test]
fn open_missing_tree_fails_cleanly() {
    let (_dir, env) = create_env();

    let rtxn = env.begin_ro_txn().unwrap();
    let err = rtxn.open_tree("absent").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn create_with_conflicting_flags_fails() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.create_tree("t", DUP_SORT).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let err = wtxn.create_tree("t", REVERSE_KEY).unwrap_err();
    assert!(err.to_string().contains("different flags"));
}

#[test]
fn registry_capacity_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().max_named_trees(2).open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.create_tree("one", 0).unwrap();
    wtxn.create_tree("two", 0).unwrap();
    let err = wtxn.create_tree("three", 0).unwrap_err();
    assert!(err.to_string().contains("named-tree table full"));
}

#[test]
fn clearing_a_tree_keeps_the_handle() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let t = wtxn.create_tree("t", 0).unwrap();
    for i in 0..300u32 {
        wtxn.put(t, &i.to_be_bytes(), b"x", 0).unwrap();
    }
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.drop_tree(t, false).unwrap();
    // Still usable in the same transaction.
    wtxn.put(t, b"fresh", b"start", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let stat = rtxn.stat(t).unwrap();
    assert_eq!(stat.entries, 1);
    assert_eq!(rtxn.get(t, b"fresh").unwrap(), Some(&b"start"[..]));
}

#[test]
fn deleting_a_tree_removes_record_and_frees_pages() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let t = wtxn.create_tree("doomed", 0).unwrap();
    for i in 0..300u32 {
        wtxn.put(t, &i.to_be_bytes(), &[0u8; 200], 0).unwrap();
    }
    wtxn.commit().unwrap();
    let b_id;

    {
        let mut wtxn = env.begin_rw_txn().unwrap();
        b_id = wtxn.id();
        wtxn.drop_tree(t, true).unwrap();
        wtxn.commit().unwrap();
    }

    let rtxn = env.begin_ro_txn().unwrap();
    // The record node is gone from the main tree.
    assert_eq!(rtxn.get(Tree::main(), b"doomed").unwrap(), None);
    // The dropped pages were recorded as freed by the dropping txn.
    let record = rtxn.get(Tree::free_list(), &b_id.to_ne_bytes()).unwrap();
    let record = record.expect("no freed-page record for the dropping txn");
    let count = u64::from_ne_bytes(record[..8].try_into().unwrap());
    assert!(count > 0);

    // The stale handle no longer resolves.
    assert!(rtxn.get(t, b"anything").is_err());
}

#[test]
fn main_tree_put_cannot_clobber_a_record_node() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.create_tree("guarded", 0).unwrap();
    let err = wtxn.put(Tree::main(), b"guarded", b"overwrite", 0).unwrap_err();
    assert!(err.to_string().contains("named tree"));
}
