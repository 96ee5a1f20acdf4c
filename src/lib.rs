//! # cowdb — Embedded Copy-on-Write Key-Value Store
//!
//! An embedded, transactional, ordered key-value store built on a
//! memory-mapped B+tree. Its defining commitment: readers observe a
//! stable point-in-time snapshot without taking any data-structure lock.
//! A reader dereferences pages straight out of the shared map; the single
//! writer never modifies a reachable page, it allocates fresh pages
//! (copy-on-write) and publishes a whole transaction with one atomic
//! meta-page write. Freed pages are recycled through a persistent free
//! tree keyed by the transaction that freed them, once no live reader can
//! still see them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cowdb::{Env, Tree};
//!
//! let env = Env::options()
//!     .map_size(1 << 30)
//!     .max_named_trees(4)
//!     .open("./db")?;
//!
//! let mut wtxn = env.begin_rw_txn()?;
//! wtxn.put(Tree::main(), b"alpha", b"1", 0)?;
//! wtxn.commit()?;
//!
//! let rtxn = env.begin_ro_txn()?;
//! assert_eq!(rtxn.get(Tree::main(), b"alpha")?, Some(&b"1"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Env / EnvOptions (open, meta pick, registry)  │
//! ├───────────────────────────────────────────────┤
//! │ RoTxn (snapshot)  │ RwTxn (COW + dirty list)  │
//! ├───────────────────────────────────────────────┤
//! │ B+tree: cursors, split/merge, duplicates      │
//! ├───────────────────────────────────────────────┤
//! │ Allocator: loose / reclaimed / fresh, spill   │
//! ├───────────────────────────────────────────────┤
//! │ Reader table (lock file, robust mutexes)      │
//! ├───────────────────────────────────────────────┤
//! │ Storage: page & node codec, meta, idl, mmap   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Any number of readers across threads and processes run concurrently
//! with each other and with at most one writer. A reader's entire
//! coordination is one slot in the mapped reader table; the writer scans
//! those slots (without locking) to learn the oldest snapshot still in
//! use, which bounds what the page allocator may reclaim. Commit
//! durability is tunable per environment: full sync, data-only sync, or
//! none (which can lose recent commits but never corrupts the file).
//!
//! This crate targets Unix systems: it relies on `pwritev`, `fcntl`
//! byte-range locks, `O_DSYNC`, and process-shared robust pthread
//! mutexes. The on-disk format is host-endian; the magic number doubles
//! as the byte-order check.

pub mod btree;
pub mod config;
pub mod env;
pub mod readers;
pub mod storage;
pub mod txn;

pub use btree::cursor::{Cursor, WriteCursor};
pub use btree::{
    cmp_bytes, cmp_bytes_reverse, cmp_integer, Comparator, Stat, Tree, APPEND, APPEND_DUP,
    CURRENT, DUP_FIXED, DUP_SORT, INTEGER_DUP, INTEGER_KEY, NO_DUP_DATA, NO_OVERWRITE,
    REVERSE_DUP, REVERSE_KEY,
};
pub use env::{Env, EnvInfo, EnvOptions};
pub use readers::ReaderInfo;
pub use txn::{NestedTxn, RoTxn, RwTxn};
