//! Environment-level behaviors: comparator flags, reserve writes, write
//! cursors, durability modes, and map growth.

use cowdb::{Env, Tree, INTEGER_KEY, REVERSE_KEY};
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
fn integer_keys_sort_numerically() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let t = wtxn.create_tree("ints", INTEGER_KEY).unwrap();
    // 300 < 5 lexicographically on little-endian bytes, but not here.
    for n in [300u64, 5, 40_000, 7] {
        wtxn.put(t, &n.to_ne_bytes(), b"x", 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(t).unwrap();
    let mut order = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((k, _)) = entry {
        order.push(u64::from_ne_bytes(k.try_into().unwrap()));
        entry = cursor.next().unwrap();
    }
    assert_eq!(order, vec![5, 7, 300, 40_000]);
}

#[test]
fn integer_keys_must_be_integer_sized() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let t = wtxn.create_tree("ints", INTEGER_KEY).unwrap();
    let err = wtxn.put(t, b"abc", b"x", 0).unwrap_err();
    assert!(err.to_string().contains("integer keys"));
}

#[test]
fn reverse_keys_sort_from_the_tail() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let t = wtxn.create_tree("rev", REVERSE_KEY).unwrap();
    for k in [b"host.a".as_slice(), b"host.c", b"host.b"] {
        wtxn.put(t, k, b"x", 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(t).unwrap();
    let mut order = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((k, _)) = entry {
        order.push(k.to_vec());
        entry = cursor.next().unwrap();
    }
    assert_eq!(order, vec![b"host.a".to_vec(), b"host.b".to_vec(), b"host.c".to_vec()]);
}

#[test]
fn put_reserve_fills_in_place() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    {
        let slot = wtxn.put_reserve(Tree::main(), b"reserved", 16).unwrap();
        assert_eq!(slot.len(), 16);
        slot.copy_from_slice(b"0123456789abcdef");
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(
        rtxn.get(Tree::main(), b"reserved").unwrap(),
        Some(&b"0123456789abcdef"[..])
    );
}

#[test]
fn write_cursor_puts_and_deletes() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    {
        let mut cursor = wtxn.cursor(Tree::main()).unwrap();
        cursor.put(b"a", b"1", 0).unwrap();
        cursor.put(b"b", b"2", 0).unwrap();
        cursor.put(b"c", b"3", 0).unwrap();

        // The cursor is parked on the entry it wrote.
        let (k, v) = cursor.get_current().unwrap().unwrap();
        assert_eq!((k, v), (&b"c"[..], &b"3"[..]));

        assert!(cursor.set(b"b").unwrap().is_some());
        cursor.del(false).unwrap();

        // After a delete, next yields the successor entry.
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, b"c");
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"b").unwrap(), None);
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, 2);
}

#[test]
fn free_tree_rejects_direct_writes() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let err = wtxn.put(Tree::free_list(), b"k", b"v", 0).unwrap_err();
    assert!(err.to_string().contains("free tree"));
}

#[test]
fn no_sync_mode_still_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().no_sync(true).open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
    wtxn.commit().unwrap();

    env.sync(true).unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn no_meta_sync_mode_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().no_meta_sync(true).open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
        wtxn.commit().unwrap();
        env.sync(true).unwrap();
    }
    let env = Env::options().open(dir.path()).unwrap();
    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn map_can_grow_between_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().map_size(64 * 4096).open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let mut filled = 0;
    loop {
        let key = format!("k{:05}", filled);
        match wtxn.put(Tree::main(), key.as_bytes(), &[0u8; 900], 0) {
            Ok(()) => filled += 1,
            Err(e) => {
                assert!(e.to_string().contains("map full"));
                break;
            }
        }
    }
    drop(wtxn); // the failed transaction is poisoned; start over

    env.set_map_size(1024 * 4096).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..filled + 100 {
        let key = format!("k{:05}", i);
        wtxn.put(Tree::main(), key.as_bytes(), &[1u8; 900], 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, (filled + 100) as u64);
}

#[test]
fn read_only_env_refuses_writers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
        wtxn.commit().unwrap();
    }

    let env = Env::options().read_only(true).open(dir.path()).unwrap();
    let err = env.begin_rw_txn().unwrap_err();
    assert!(err.to_string().contains("read-only"));
    assert_eq!(
        env.begin_ro_txn().unwrap().get(Tree::main(), b"k").unwrap(),
        Some(&b"v"[..])
    );
}

#[test]
fn previous_snapshot_open_sees_the_older_meta() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Env::options().open(dir.path()).unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        wtxn.put(Tree::main(), b"k", b"first", 0).unwrap();
        wtxn.commit().unwrap();
        let mut wtxn = env.begin_rw_txn().unwrap();
        wtxn.put(Tree::main(), b"k", b"second", 0).unwrap();
        wtxn.commit().unwrap();
    }

    let env = Env::options().prev_snapshot(true).open(dir.path()).unwrap();
    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"first"[..]));
}
