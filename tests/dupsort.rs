//! Duplicate-value trees: sub-page growth, promotion to a sub-tree,
//! duplicate cursor movement, and fixed-size duplicate storage.

use cowdb::{Env, Tree, DUP_FIXED, DUP_SORT, INTEGER_DUP, NO_DUP_DATA};
use tempfile::TempDir;

fn create_env() -> (TempDir, Env, Tree) {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options()
        .map_size(64 << 20)
        .max_named_trees(4)
        .open(dir.path())
        .unwrap();
    let tree = {
        let mut wtxn = env.begin_rw_txn().unwrap();
        let tree = wtxn.create_tree("dups", DUP_SORT).unwrap();
        wtxn.commit().unwrap();
        tree
    };
    (dir, env, tree)
}

#[test]
fn second_value_converts_to_duplicates() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(tree, b"x", b"bb", 0).unwrap();
    wtxn.put(tree, b"x", b"aa", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    // get returns the first duplicate in the duplicate order.
    assert_eq!(rtxn.get(tree, b"x").unwrap(), Some(&b"aa"[..]));
    assert_eq!(rtxn.stat(tree).unwrap().entries, 2);

    let mut cursor = rtxn.cursor(tree).unwrap();
    assert!(cursor.set(b"x").unwrap().is_some());
    assert_eq!(cursor.dup_count().unwrap(), 2);
}

#[test]
fn duplicates_enumerate_in_order_through_promotion() {
    let (_dir, env, tree) = create_env();

    // 100 values under one key: the embedded sub-page overflows the
    // largest inline node long before that and must be promoted to a
    // sub-tree without losing order.
    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in (0..100).rev() {
        let v = format!("value-{:030}", i);
        wtxn.put(tree, b"x", v.as_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(tree).unwrap().entries, 100);

    let mut cursor = rtxn.cursor(tree).unwrap();
    assert!(cursor.set(b"x").unwrap().is_some());
    assert_eq!(cursor.dup_count().unwrap(), 100);

    let mut values = vec![cursor.get_current().unwrap().unwrap().1.to_vec()];
    while let Some((_, v)) = cursor.next_dup().unwrap() {
        values.push(v.to_vec());
    }
    let expected: Vec<Vec<u8>> = (0..100)
        .map(|i| format!("value-{:030}", i).into_bytes())
        .collect();
    assert_eq!(values, expected);
}

#[test]
fn next_crosses_keys_and_their_duplicates() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(tree, b"a", b"1", 0).unwrap();
    wtxn.put(tree, b"a", b"2", 0).unwrap();
    wtxn.put(tree, b"b", b"3", 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(tree).unwrap();

    let mut pairs = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((k, v)) = entry {
        pairs.push((k.to_vec(), v.to_vec()));
        entry = cursor.next().unwrap();
    }
    assert_eq!(
        pairs,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"a".to_vec(), b"2".to_vec()),
            (b"b".to_vec(), b"3".to_vec()),
        ]
    );

    // next_nodup skips the remaining duplicates of "a".
    assert!(cursor.first().unwrap().is_some());
    let (k, v) = cursor.next_nodup().unwrap().unwrap();
    assert_eq!((k, v), (&b"b"[..], &b"3"[..]));
}

#[test]
fn get_both_positions_on_an_exact_pair() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for v in [b"aaa".as_slice(), b"bbb", b"ddd"] {
        wtxn.put(tree, b"k", v, 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(tree).unwrap();

    assert!(cursor.get_both(b"k", b"bbb").unwrap().is_some());
    assert!(cursor.get_both(b"k", b"ccc").unwrap().is_none());

    let (_, v) = cursor.get_both_range(b"k", b"ccc").unwrap().unwrap();
    assert_eq!(v, b"ddd");
}

#[test]
fn no_dup_data_rejects_an_existing_pair() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(tree, b"k", b"v1", 0).unwrap();
    wtxn.put(tree, b"k", b"v2", 0).unwrap();

    let err = wtxn.put(tree, b"k", b"v1", NO_DUP_DATA).unwrap_err();
    assert!(err.to_string().contains("key already exists"));

    wtxn.put(tree, b"k", b"v3", NO_DUP_DATA).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(tree).unwrap().entries, 3);
}

#[test]
fn deleting_one_duplicate_keeps_the_rest() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for v in [b"a".as_slice(), b"b", b"c"] {
        wtxn.put(tree, b"k", v, 0).unwrap();
    }
    assert!(wtxn.del(tree, b"k", Some(b"b")).unwrap());
    assert!(!wtxn.del(tree, b"k", Some(b"zz")).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(tree).unwrap().entries, 2);
    let mut cursor = rtxn.cursor(tree).unwrap();
    assert!(cursor.set(b"k").unwrap().is_some());
    assert_eq!(cursor.dup_count().unwrap(), 2);
    assert!(cursor.get_both(b"k", b"b").unwrap().is_none());
}

#[test]
fn deleting_the_last_duplicate_removes_the_key() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(tree, b"k", b"only", 0).unwrap();
    assert!(wtxn.del(tree, b"k", Some(b"only")).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(tree, b"k").unwrap(), None);
    assert_eq!(rtxn.stat(tree).unwrap().entries, 0);
}

#[test]
fn deleting_a_key_drops_every_duplicate() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..60 {
        let v = format!("value-{:030}", i);
        wtxn.put(tree, b"k", v.as_bytes(), 0).unwrap();
    }
    wtxn.put(tree, b"other", b"stays", 0).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    assert!(wtxn.del(tree, b"k", None).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(tree, b"k").unwrap(), None);
    assert_eq!(rtxn.get(tree, b"other").unwrap(), Some(&b"stays"[..]));
    assert_eq!(rtxn.stat(tree).unwrap().entries, 1);
}

#[test]
fn write_cursor_navigates_duplicates() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    {
        let mut cursor = wtxn.cursor(tree).unwrap();
        for v in [b"a".as_slice(), b"b", b"c"] {
            cursor.put(b"k", v, 0).unwrap();
        }
        cursor.put(b"z", b"1", 0).unwrap();

        let (k, v) = cursor.set_key(b"k").unwrap().unwrap();
        assert_eq!((k, v), (&b"k"[..], &b"a"[..]));

        assert_eq!(cursor.last_dup().unwrap(), Some(&b"c"[..]));
        let (_, v) = cursor.prev_dup().unwrap().unwrap();
        assert_eq!(v, b"b");
        assert_eq!(cursor.first_dup().unwrap(), Some(&b"a"[..]));

        // From "z", the previous key's last duplicate.
        assert!(cursor.set_key(b"z").unwrap().is_some());
        let (k, v) = cursor.prev_nodup().unwrap().unwrap();
        assert_eq!((k, v), (&b"k"[..], &b"c"[..]));
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(tree).unwrap().entries, 4);
}

#[test]
fn fixed_size_duplicates_pack_and_enumerate() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options()
        .map_size(64 << 20)
        .max_named_trees(4)
        .open(dir.path())
        .unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let tree = wtxn
        .create_tree("fixed", DUP_SORT | DUP_FIXED | INTEGER_DUP)
        .unwrap();
    for i in (0..200u64).rev() {
        wtxn.put(tree, b"ids", &i.to_ne_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(tree).unwrap().entries, 200);

    let mut cursor = rtxn.cursor(tree).unwrap();
    assert!(cursor.set(b"ids").unwrap().is_some());
    assert_eq!(cursor.dup_count().unwrap(), 200);

    let mut values = vec![u64::from_ne_bytes(
        cursor.get_current().unwrap().unwrap().1.try_into().unwrap(),
    )];
    while let Some((_, v)) = cursor.next_dup().unwrap() {
        values.push(u64::from_ne_bytes(v.try_into().unwrap()));
    }
    let expected: Vec<u64> = (0..200).collect();
    assert_eq!(values, expected);
}

#[test]
fn fixed_size_duplicates_reject_other_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().max_named_trees(4).open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let tree = wtxn.create_tree("fixed", DUP_SORT | DUP_FIXED).unwrap();
    wtxn.put(tree, b"k", b"12345678", 0).unwrap();
    let err = wtxn.put(tree, b"k", b"123", 0).unwrap_err();
    assert!(err.to_string().contains("share one size"));
}

#[test]
fn oversized_duplicate_values_are_rejected() {
    let (_dir, env, tree) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    let huge = vec![0u8; env.max_key_size() + 1];
    let err = wtxn.put(tree, b"k", &huge, 0).unwrap_err();
    assert!(err.to_string().contains("exceeds the limit"));
}
