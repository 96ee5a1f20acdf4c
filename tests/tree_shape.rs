//! Structural behavior: splits under load, iteration order after
//! restructuring, rebalancing on bulk deletion, and overflow runs for
//! large values.

use cowdb::{Env, Tree, APPEND};
use tempfile::TempDir;

fn create_env() -> (TempDir, Env) {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().map_size(64 << 20).open(dir.path()).unwrap();
    (dir, env)
}

fn keyval(i: usize) -> (String, String) {
    (format!("k{:05}", i), format!("{:0100}", i))
}

#[test]
fn split_grows_depth_and_keeps_order() {
    let (_dir, env) = create_env();

    // 100-byte values on 4096-byte pages: a root leaf overflows well
    // before 100 entries.
    let mut wtxn = env.begin_rw_txn().unwrap();
    let mut inserted = 0;
    while wtxn.stat(Tree::main()).unwrap().depth < 2 {
        let (k, v) = keyval(inserted);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
        inserted += 1;
        assert!(inserted < 10_000, "split never happened");
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let stat = rtxn.stat(Tree::main()).unwrap();
    assert_eq!(stat.depth, 2);
    assert_eq!(stat.branch_pages, 1);
    assert!(stat.leaf_pages >= 2);
    assert_eq!(stat.entries, inserted as u64);

    // first -> next* returns the sorted key sequence, each exactly once.
    let mut cursor = rtxn.cursor(Tree::main()).unwrap();
    let mut seen = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((k, _)) = entry {
        seen.push(String::from_utf8(k.to_vec()).unwrap());
        entry = cursor.next().unwrap();
    }
    let expected: Vec<String> = (0..inserted).map(|i| keyval(i).0).collect();
    assert_eq!(seen, expected);
}

#[test]
fn reverse_iteration_mirrors_forward() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..500 {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(Tree::main()).unwrap();
    let mut reversed = Vec::new();
    let mut entry = cursor.last().unwrap();
    while let Some((k, _)) = entry {
        reversed.push(k.to_vec());
        entry = cursor.prev().unwrap();
    }
    assert_eq!(reversed.len(), 500);
    let mut forward: Vec<Vec<u8>> = (0..500).map(|i| keyval(i).0.into_bytes()).collect();
    forward.reverse();
    assert_eq!(reversed, forward);
}

#[test]
fn descending_inserts_produce_a_valid_tree() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in (0..800).rev() {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    for i in 0..800 {
        let (k, v) = keyval(i);
        assert_eq!(
            rtxn.get(Tree::main(), k.as_bytes()).unwrap(),
            Some(v.as_bytes()),
            "missing {}",
            k
        );
    }
}

#[test]
fn append_mode_loads_sorted_keys() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..2000 {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), APPEND).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, 2000);
    let (k, v) = keyval(1234);
    assert_eq!(rtxn.get(Tree::main(), k.as_bytes()).unwrap(), Some(v.as_bytes()));
}

#[test]
fn append_rejects_out_of_order_keys() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"m", b"1", APPEND).unwrap();
    let err = wtxn.put(Tree::main(), b"a", b"2", APPEND).unwrap_err();
    assert!(err.to_string().contains("appended in order"));

    // Benign: the transaction survives.
    wtxn.put(Tree::main(), b"z", b"3", APPEND).unwrap();
    wtxn.commit().unwrap();
}

#[test]
fn bulk_delete_rebalances_down_to_a_small_tree() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..1500 {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();
    let grown = env.stat().unwrap();
    assert!(grown.depth >= 2);

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..1499 {
        let (k, _) = keyval(i);
        assert!(wtxn.del(Tree::main(), k.as_bytes(), None).unwrap(), "{}", k);
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let stat = rtxn.stat(Tree::main()).unwrap();
    assert_eq!(stat.entries, 1);
    assert_eq!(stat.depth, 1, "root did not collapse");
    assert_eq!(stat.leaf_pages, 1);
    assert_eq!(stat.branch_pages, 0);
    let (k, v) = keyval(1499);
    assert_eq!(rtxn.get(Tree::main(), k.as_bytes()).unwrap(), Some(v.as_bytes()));
}

#[test]
fn interleaved_inserts_and_deletes_stay_consistent() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..600 {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
    }
    for i in (0..600).step_by(2) {
        let (k, _) = keyval(i);
        assert!(wtxn.del(Tree::main(), k.as_bytes(), None).unwrap());
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.stat(Tree::main()).unwrap().entries, 300);
    for i in 0..600 {
        let (k, v) = keyval(i);
        let got = rtxn.get(Tree::main(), k.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "{} should be deleted", k);
        } else {
            assert_eq!(got, Some(v.as_bytes()), "{} should exist", k);
        }
    }
}

#[test]
fn set_range_finds_the_least_greater_key() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in (0..100).step_by(10) {
        let (k, v) = keyval(i);
        wtxn.put(Tree::main(), k.as_bytes(), v.as_bytes(), 0).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let mut cursor = rtxn.cursor(Tree::main()).unwrap();

    let (k, _) = cursor.set_range(b"k00015").unwrap().unwrap();
    assert_eq!(k, keyval(20).0.as_bytes());

    let (k, _) = cursor.set_range(b"k00050").unwrap().unwrap();
    assert_eq!(k, keyval(50).0.as_bytes());

    assert!(cursor.set_range(b"k99999").unwrap().is_none());
}

#[test]
fn overflow_value_round_trip() {
    let (_dir, env) = create_env();

    // 5000 bytes of 0x41 on 4096-byte pages: a two-page overflow run.
    let blob = vec![0x41u8; 5000];
    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", &blob, 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let got = rtxn.get(Tree::main(), b"k").unwrap().unwrap();
    assert_eq!(got.len(), 5000);
    assert!(got.iter().all(|&b| b == 0x41));
    assert_eq!(rtxn.stat(Tree::main()).unwrap().overflow_pages, 2);
}

#[test]
fn overflow_overwrite_in_place_and_shrink() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", &vec![1u8; 9000], 0).unwrap();
    // Same transaction: the run is dirty, a smaller value reuses it.
    wtxn.put(Tree::main(), b"k", &vec![2u8; 8000], 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    let got = rtxn.get(Tree::main(), b"k").unwrap().unwrap();
    assert_eq!(got.len(), 8000);
    assert!(got.iter().all(|&b| b == 2));
    drop(rtxn);

    // Across transactions the committed run is immutable: overwriting
    // allocates a fresh run and frees the old one.
    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", &vec![3u8; 500], 0).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&vec![3u8; 500][..]));
    assert_eq!(rtxn.stat(Tree::main()).unwrap().overflow_pages, 0);
}

#[test]
fn deleting_an_overflow_value_releases_its_pages() {
    let (_dir, env) = create_env();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"big", &vec![7u8; 20_000], 0).unwrap();
    wtxn.commit().unwrap();
    assert!(env.stat().unwrap().overflow_pages > 0);

    let mut wtxn = env.begin_rw_txn().unwrap();
    assert!(wtxn.del(Tree::main(), b"big", None).unwrap());
    wtxn.commit().unwrap();

    assert_eq!(env.stat().unwrap().overflow_pages, 0);
}
