//! Reader-table behavior: slot limits, slot reuse, reset/renew, and
//! concurrent readers against a writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cowdb::{Env, Tree};

#[test]
fn reader_table_full_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    // no_tls so one thread can hold several slots at once.
    let env = Env::options()
        .max_readers(3)
        .no_tls(true)
        .open(dir.path())
        .unwrap();

    let _r1 = env.begin_ro_txn().unwrap();
    let _r2 = env.begin_ro_txn().unwrap();
    let _r3 = env.begin_ro_txn().unwrap();

    let err = env.begin_ro_txn().unwrap_err();
    assert!(err.to_string().contains("reader table full"));
}

#[test]
fn slots_are_released_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options()
        .max_readers(2)
        .no_tls(true)
        .open(dir.path())
        .unwrap();

    for _ in 0..10 {
        let a = env.begin_ro_txn().unwrap();
        let b = env.begin_ro_txn().unwrap();
        drop(a);
        drop(b);
    }
    // Ten rounds through two slots: nothing leaked.
    assert!(env.begin_ro_txn().is_ok());
}

#[test]
fn sequential_read_txns_reuse_one_slot_per_thread() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().open(dir.path()).unwrap();

    for _ in 0..5 {
        let rtxn = env.begin_ro_txn().unwrap();
        drop(rtxn);
    }
    // Thread-local reuse keeps the table at a single claimed slot.
    assert!(env.reader_list().len() <= 1);
}

#[test]
fn overlapping_readers_on_one_thread_need_no_tls() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().open(dir.path()).unwrap();

    let r1 = env.begin_ro_txn().unwrap();
    let err = env.begin_ro_txn().unwrap_err();
    assert!(err.to_string().contains("reader slot already in use"));
    drop(r1);
}

#[test]
fn reset_and_renew_move_the_snapshot_forward() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v1", 0).unwrap();
    wtxn.commit().unwrap();

    let mut rtxn = env.begin_ro_txn().unwrap();
    assert_eq!(rtxn.id(), 1);
    rtxn.reset();

    // A reset transaction rejects reads until renewed.
    assert!(rtxn.get(Tree::main(), b"k").is_err());

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v2", 0).unwrap();
    wtxn.commit().unwrap();

    rtxn.renew().unwrap();
    assert_eq!(rtxn.id(), 2);
    assert_eq!(rtxn.get(Tree::main(), b"k").unwrap(), Some(&b"v2"[..]));
}

#[test]
fn reader_list_reports_live_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::options().no_tls(true).open(dir.path()).unwrap();

    let mut wtxn = env.begin_rw_txn().unwrap();
    wtxn.put(Tree::main(), b"k", b"v", 0).unwrap();
    wtxn.commit().unwrap();

    assert!(env.reader_list().is_empty());
    let _r = env.begin_ro_txn().unwrap();
    let readers = env.reader_list();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].pid, std::process::id());
    assert_eq!(readers[0].txnid, 1);

    // No dead processes to evict.
    assert_eq!(env.reader_check().unwrap(), 0);
}

#[test]
fn readers_in_threads_race_a_writer() {
    let dir = tempfile::tempdir().unwrap();
    let env = Arc::new(
        Env::options()
            .map_size(64 << 20)
            .max_readers(16)
            .open(dir.path())
            .unwrap(),
    );

    let mut wtxn = env.begin_rw_txn().unwrap();
    for i in 0..200u32 {
        wtxn.put(Tree::main(), format!("k{:04}", i).as_bytes(), &i.to_ne_bytes(), 0)
            .unwrap();
    }
    wtxn.commit().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let env = Arc::clone(&env);
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let rtxn = env.begin_ro_txn().unwrap();
                // Whatever snapshot this is, it must be internally
                // complete: all 200 keys with matching values.
                for i in 0..200u32 {
                    let key = format!("k{:04}", i);
                    let v = rtxn.get(Tree::main(), key.as_bytes()).unwrap().unwrap();
                    assert_eq!(v.len(), 4);
                }
            }
        }));
    }

    for round in 0..20u32 {
        let mut wtxn = env.begin_rw_txn().unwrap();
        for i in 0..200u32 {
            let val = (round << 16 | i).to_ne_bytes();
            wtxn.put(Tree::main(), format!("k{:04}", i).as_bytes(), &val, 0)
                .unwrap();
        }
        wtxn.commit().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }
}
