//! # Transactions
//!
//! Readers and the single writer share one discipline: a transaction is
//! anchored to a meta page and sees exactly the tree roots that meta
//! describes. Readers register a snapshot id in the reader table and then
//! dereference mapped pages without any further coordination; the writer
//! serializes behind the writer mutex, builds its changes in heap pages
//! tracked by a dirty list, and publishes them with a single meta write.
//!
//! ## Read Transactions
//!
//! `begin` claims (or reuses, via thread-local storage) a reader slot,
//! publishes the current committed txnid into it with a retry loop that
//! closes the race against a committing writer, and copies the two core
//! tree records out of the chosen meta. From then on every operation is
//! lock-free: failure to advance the snapshot is impossible because the
//! snapshot never moves.
//!
//! ## Write Transactions
//!
//! The writer keeps per-transaction state in a stack of [`WriteState`]
//! frames — one for the transaction itself plus one per live nested
//! transaction. Page lookup walks the frames newest-first before falling
//! back to the map, so a nested transaction shadows its parent's dirty
//! pages without copying them eagerly.
//!
//! Commit order is fixed: flush named-tree records into the main tree,
//! save the freed-page list into the free tree (an iterative fixed point,
//! see `alloc`), flush dirty pages with grouped vectored writes, fsync
//! unless disabled, and finally rewrite meta page `txnid mod 2`. Only the
//! meta write publishes anything; failure before it leaves the previous
//! snapshot untouched.
//!
//! A transaction that hit a non-benign error refuses further mutation and
//! turns `commit` into an abort.

pub mod alloc;

use std::cell::RefCell;

use eyre::{bail, ensure, Result};
use parking_lot::{MutexGuard, RwLockReadGuard};

use crate::btree::cursor::{self, Cursor, CursorState, WriteCursor};
use crate::btree::update;
use crate::btree::{
    default_dup_cmp, default_key_cmp, Comparator, Stat, Tree, DUP_FIXED, DUP_SORT,
    TREE_FLAGS_MASK,
};
use crate::config::{
    Pgno, TxnId, CORE_TREES, FREE_TREE, MAIN_TREE, MAX_KEY_SIZE, NUM_METAS, PAGE_HEADER_SIZE,
};
use crate::env::Env;
use crate::storage::idl::{DirtyList, IdList};
use crate::storage::meta::{MetaBody, TreeRecord};
use crate::storage::mmap::DataFile;
use crate::storage::node::{self, Node, N_OVERFLOW};
use crate::storage::page::PageHeader;

/// Tree-instance state bits within one transaction.
pub(crate) const TS_VALID: u8 = 0x01;
/// Named tree whose record must be re-read from the main tree before use.
pub(crate) const TS_STALE: u8 = 0x02;
/// Record changed this transaction; rewrite it into the main tree.
pub(crate) const TS_DIRTY: u8 = 0x04;
/// Created this transaction; forget the handle if it aborts.
pub(crate) const TS_NEW: u8 = 0x08;

/// One tree as seen by one transaction.
#[derive(Debug, Clone)]
pub(crate) struct TreeInstance {
    pub record: TreeRecord,
    pub state: u8,
    pub name: Option<String>,
    pub key_cmp: Comparator,
    pub dup_cmp: Comparator,
}

impl TreeInstance {
    fn core(record: TreeRecord, key_cmp: Comparator, dup_cmp: Comparator) -> Self {
        Self {
            record,
            state: TS_VALID,
            name: None,
            key_cmp,
            dup_cmp,
        }
    }
}

/// Everything a write transaction (or nested frame) owns exclusively.
pub(crate) struct WriteState {
    pub trees: RefCell<Vec<TreeInstance>>,
    pub dirty: DirtyList,
    /// Pages unreferenced as of this transaction, destined for the free
    /// tree under this txnid.
    pub free_pages: IdList,
    /// Pages dirtied and freed in the same transaction; reused directly.
    pub loose: Vec<Pgno>,
    /// Dirty pages flushed early, stored as `pgno << 1` (LSB = deleted).
    pub spilled: IdList,
    /// Pages read back from old free-tree records, ready for reuse.
    pub reclaim: IdList,
    /// Largest free-tree key merged into `reclaim` so far.
    pub last_reclaimed: TxnId,
    pub next_pgno: Pgno,
    /// Set while the free tree itself is being rewritten at commit.
    pub in_freelist_save: bool,
    /// Registry ids created by this frame.
    pub new_trees: Vec<usize>,
}

impl WriteState {
    fn child_of(parent: &WriteState) -> Self {
        Self {
            trees: RefCell::new(parent.trees.borrow().clone()),
            dirty: DirtyList::new(),
            free_pages: IdList::new(),
            loose: Vec::new(),
            spilled: IdList::new(),
            reclaim: parent.reclaim.clone(),
            last_reclaimed: parent.last_reclaimed,
            next_pgno: parent.next_pgno,
            in_freelist_save: false,
            new_trees: Vec::new(),
        }
    }
}

/// Page and tree access shared by read and write transactions; all of the
/// cursor machinery is generic over this.
pub(crate) trait TxnStore {
    fn page_size(&self) -> usize;
    /// One page, resolved dirty-first for writers, straight from the map
    /// for readers.
    fn page(&self, pgno: Pgno) -> Result<&[u8]>;
    /// A whole overflow run, contiguous.
    fn overflow_run(&self, pgno: Pgno) -> Result<&[u8]>;
    /// Current record of a tree, refreshing stale named trees.
    fn tree_record(&self, tree: usize) -> Result<TreeRecord>;
    fn tree_flags(&self, tree: usize) -> Result<u16>;
    fn key_cmp(&self, tree: usize) -> Result<Comparator>;
    fn dup_cmp(&self, tree: usize) -> Result<Comparator>;
}

/// Read both meta pages through the map and return the newest body (or
/// the previous one on request).
pub(crate) fn snapshot_meta(file: &DataFile, previous: bool) -> Result<MetaBody> {
    let mut bodies: [Option<MetaBody>; NUM_METAS] = [None, None];
    for (slot, body) in bodies.iter_mut().enumerate() {
        let page = file.page(slot as Pgno, 1)?;
        match MetaBody::from_page(page) {
            Ok(b) => *body = Some(*b),
            Err(e) => log::warn!("meta page {} unreadable: {:#}", slot, e),
        }
    }
    match (bodies[0], bodies[1]) {
        (Some(a), Some(b)) => {
            let pick = crate::storage::meta::pick(&a, &b, previous);
            Ok(if pick == 0 { a } else { b })
        }
        (Some(a), None) => Ok(a),
        (None, Some(b)) => Ok(b),
        (None, None) => bail!("both meta pages are corrupt; the file is not recoverable"),
    }
}

fn instantiate_core(meta: &MetaBody, env: &Env) -> Vec<TreeInstance> {
    let main_flags = meta.tree(MAIN_TREE).flags();
    vec![
        TreeInstance::core(
            *meta.tree(FREE_TREE),
            crate::btree::cmp_integer,
            crate::btree::cmp_integer,
        ),
        TreeInstance::core(
            *meta.tree(MAIN_TREE),
            env.main_key_cmp().unwrap_or_else(|| default_key_cmp(main_flags)),
            env.main_dup_cmp().unwrap_or_else(|| default_dup_cmp(main_flags)),
        ),
    ]
}

/// Extend a tree-instance vector to cover every registered handle,
/// adding stale placeholders for named trees this transaction has not
/// touched yet.
fn fill_named(trees: &mut Vec<TreeInstance>, env: &Env) {
    let defs = env.tree_defs();
    for id in trees.len()..defs.len() {
        let inst = match &defs[id] {
            Some(def) => TreeInstance {
                record: TreeRecord::new(def.flags),
                state: TS_STALE,
                name: Some(def.name.clone()),
                key_cmp: def.key_cmp.unwrap_or_else(|| default_key_cmp(def.flags)),
                dup_cmp: def.dup_cmp.unwrap_or_else(|| default_dup_cmp(def.flags)),
            },
            None => TreeInstance {
                // Tombstoned handle; never valid in this transaction.
                record: TreeRecord::new(0),
                state: 0,
                name: None,
                key_cmp: crate::btree::cmp_bytes,
                dup_cmp: crate::btree::cmp_bytes,
            },
        };
        trees.push(inst);
    }
}

fn refresh_stale<T: TxnStore>(txn: &T, inst: &TreeInstance) -> Result<TreeRecord> {
    let name = inst
        .name
        .as_deref()
        .ok_or_else(|| eyre::eyre!("tree handle is not usable in this transaction"))?;
    match cursor::lookup_tree_record(txn, name.as_bytes())? {
        Some(record) => {
            let stored = record.flags() & TREE_FLAGS_MASK;
            let expected = inst.record.flags() & TREE_FLAGS_MASK;
            ensure!(
                stored == expected,
                "tree '{}' was recreated with different flags ({:#06x} vs {:#06x}); reopen the handle",
                name,
                stored,
                expected
            );
            Ok(record)
        }
        None => bail!("tree '{}' not found in this snapshot", name),
    }
}

// ---------------------------------------------------------------------
// Read transactions
// ---------------------------------------------------------------------

pub struct RoTxn<'e> {
    pub(crate) env: &'e Env,
    pub(crate) file: RwLockReadGuard<'e, DataFile>,
    slot: usize,
    txnid: TxnId,
    trees: RefCell<Vec<TreeInstance>>,
    finished: bool,
}

impl std::fmt::Debug for RoTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoTxn").field("txnid", &self.txnid).finish_non_exhaustive()
    }
}

impl<'e> RoTxn<'e> {
    pub(crate) fn begin(env: &'e Env) -> Result<Self> {
        env.check_usable()?;
        let file = env.data_file().read();
        let slot = env.claim_reader_slot()?;
        let mut txnid = env.readers().publish(slot);
        let meta = snapshot_meta(&file, env.use_prev_snapshot())?;
        if meta.map_size() > file.map_size() {
            env.readers().retire(slot);
            bail!(
                "map resized to {} bytes by another process; reopen or grow the environment",
                meta.map_size()
            );
        }
        if meta.txnid() < txnid {
            // Previous-snapshot mode anchors below the published id;
            // pinning an older snapshot is always safe.
            txnid = meta.txnid();
            env.readers().publish_snapshot(slot, txnid);
        }
        let mut trees = instantiate_core(&meta, env);
        fill_named(&mut trees, env);
        Ok(Self {
            env,
            file,
            slot,
            txnid,
            trees: RefCell::new(trees),
            finished: false,
        })
    }

    /// Snapshot id this transaction observes.
    pub fn id(&self) -> TxnId {
        self.txnid
    }

    /// Look up a key. Returns a zero-copy slice into the snapshot.
    pub fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<&[u8]>> {
        ensure!(!self.finished, "transaction was reset; renew it first");
        cursor::tree_get(self, tree.id, key)
    }

    pub fn cursor(&self, tree: Tree) -> Result<Cursor<'_, Self>> {
        ensure!(!self.finished, "transaction was reset; renew it first");
        // Force instantiation errors (unknown handle, stale lookup) now.
        self.tree_record(tree.id)?;
        Ok(Cursor::new(self, tree.id))
    }

    /// Open an existing named tree in this snapshot.
    pub fn open_tree(&self, name: &str) -> Result<Tree> {
        ensure!(!self.finished, "transaction was reset; renew it first");
        let id = self.env.resolve_or_register(name, self)?;
        let mut trees = self.trees.borrow_mut();
        fill_named(&mut trees, self.env);
        drop(trees);
        self.tree_record(id)?;
        Ok(Tree { id })
    }

    pub fn stat(&self, tree: Tree) -> Result<Stat> {
        let record = self.tree_record(tree.id)?;
        Ok(record_stat(&record, self.file.page_size()))
    }

    /// Release the snapshot but keep the reader slot for a cheap `renew`.
    pub fn reset(&mut self) {
        if !self.finished {
            self.env.readers().retire(self.slot);
            self.finished = true;
        }
    }

    /// Re-arm a reset transaction at the current committed snapshot.
    pub fn renew(&mut self) -> Result<()> {
        ensure!(self.finished, "transaction is still live");
        self.txnid = self.env.readers().publish(self.slot);
        let meta = snapshot_meta(&self.file, self.env.use_prev_snapshot())?;
        if meta.map_size() > self.file.map_size() {
            self.env.readers().retire(self.slot);
            bail!(
                "map resized to {} bytes by another process; reopen or grow the environment",
                meta.map_size()
            );
        }
        let mut trees = instantiate_core(&meta, self.env);
        fill_named(&mut trees, self.env);
        self.trees = RefCell::new(trees);
        self.finished = false;
        Ok(())
    }
}

impl Drop for RoTxn<'_> {
    fn drop(&mut self) {
        self.env.readers().retire(self.slot);
        self.env.return_reader_slot(self.slot);
    }
}

impl TxnStore for RoTxn<'_> {
    fn page_size(&self) -> usize {
        self.file.page_size()
    }

    fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        self.file.page(pgno, 1)
    }

    fn overflow_run(&self, pgno: Pgno) -> Result<&[u8]> {
        let first = self.file.page(pgno, 1)?;
        let hdr = PageHeader::from_bytes(first)?;
        ensure!(
            hdr.is_overflow(),
            "page {} is not the head of an overflow run",
            pgno
        );
        let count = hdr.overflow_count();
        self.file.page(pgno, count)
    }

    fn tree_record(&self, tree: usize) -> Result<TreeRecord> {
        let state = {
            let trees = self.trees.borrow();
            ensure!(tree < trees.len(), "unknown tree handle {}", tree);
            trees[tree].state
        };
        if state & TS_STALE != 0 {
            let inst = self.trees.borrow()[tree].clone();
            let record = refresh_stale(self, &inst)?;
            let mut trees = self.trees.borrow_mut();
            trees[tree].record = record;
            trees[tree].state = TS_VALID;
            return Ok(record);
        }
        ensure!(state & TS_VALID != 0, "tree handle {} is not usable", tree);
        Ok(self.trees.borrow()[tree].record)
    }

    fn tree_flags(&self, tree: usize) -> Result<u16> {
        self.tree_record(tree).map(|r| r.flags())
    }

    fn key_cmp(&self, tree: usize) -> Result<Comparator> {
        let trees = self.trees.borrow();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        Ok(trees[tree].key_cmp)
    }

    fn dup_cmp(&self, tree: usize) -> Result<Comparator> {
        let trees = self.trees.borrow();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        Ok(trees[tree].dup_cmp)
    }
}

// ---------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------

pub struct RwTxn<'e> {
    pub(crate) env: &'e Env,
    pub(crate) file: RwLockReadGuard<'e, DataFile>,
    _local: MutexGuard<'e, ()>,
    txnid: TxnId,
    pub(crate) states: Vec<WriteState>,
    errored: bool,
    committed: bool,
}

impl std::fmt::Debug for RwTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwTxn").field("txnid", &self.txnid).finish_non_exhaustive()
    }
}

impl<'e> RwTxn<'e> {
    pub(crate) fn begin(env: &'e Env) -> Result<Self> {
        env.check_usable()?;
        ensure!(!env.is_read_only(), "environment is read-only");
        let local = env.writer_lock().lock();
        env.lock_writer_mutex()?;
        let file = env.data_file().read();

        // In previous-snapshot mode the writer continues from the older
        // meta; the flag only clears once a commit makes that permanent.
        let meta = match snapshot_meta(&file, env.use_prev_snapshot()) {
            Ok(m) => m,
            Err(e) => {
                env.readers().writer_mutex().unlock();
                return Err(e);
            }
        };
        if meta.map_size() > file.map_size() {
            env.readers().writer_mutex().unlock();
            bail!(
                "map resized to {} bytes by another process; reopen or grow the environment",
                meta.map_size()
            );
        }

        let txnid = meta.txnid() + 1;
        let mut trees = instantiate_core(&meta, env);
        fill_named(&mut trees, env);
        let state = WriteState {
            trees: RefCell::new(trees),
            dirty: DirtyList::new(),
            free_pages: IdList::new(),
            loose: Vec::new(),
            spilled: IdList::new(),
            reclaim: IdList::new(),
            last_reclaimed: 0,
            next_pgno: meta.last_pgno() + 1,
            in_freelist_save: false,
            new_trees: Vec::new(),
        };
        Ok(Self {
            env,
            file,
            _local: local,
            txnid,
            states: vec![state],
            errored: false,
            committed: false,
        })
    }

    /// The txnid this transaction will commit as.
    pub fn id(&self) -> TxnId {
        self.txnid
    }

    pub(crate) fn state(&self) -> &WriteState {
        self.states.last().unwrap()
    }

    pub(crate) fn state_mut(&mut self) -> &mut WriteState {
        self.states.last_mut().unwrap()
    }

    pub(crate) fn mark_error(&mut self) {
        self.errored = true;
    }

    pub(crate) fn guard_usable(&self) -> Result<()> {
        ensure!(
            !self.errored,
            "transaction is in an error state and can only be aborted"
        );
        Ok(())
    }

    /// Run a mutation, poisoning the transaction on non-benign failure.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.guard_usable()?;
        match f(self) {
            Ok(r) => Ok(r),
            Err(e) => {
                if !update::is_benign(&e) {
                    self.errored = true;
                }
                Err(e)
            }
        }
    }

    pub fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<&[u8]>> {
        self.guard_usable()?;
        cursor::tree_get(self, tree.id, key)
    }

    fn guard_user_tree(&self, tree: Tree) -> Result<()> {
        ensure!(
            tree.id != FREE_TREE,
            "the free tree is maintained by commit and cannot be written directly"
        );
        Ok(())
    }

    /// Insert or update a key.
    pub fn put(&mut self, tree: Tree, key: &[u8], data: &[u8], flags: u32) -> Result<()> {
        self.guard_user_tree(tree)?;
        self.mutate(|txn| {
            let mut state = CursorState::new(tree.id);
            update::cursor_put(txn, &mut state, key, data, flags)
        })
    }

    /// Insert a key with uninitialized data of `len` bytes and return the
    /// writable slice. The slice is only valid until the next mutation.
    pub fn put_reserve(&mut self, tree: Tree, key: &[u8], len: usize) -> Result<&mut [u8]> {
        self.guard_user_tree(tree)?;
        let (pgno, index) = self.mutate(|txn| {
            let mut state = CursorState::new(tree.id);
            update::cursor_put_reserve(txn, &mut state, key, len)?;
            let top = state.top_pos()?;
            Ok((top.pgno, top.index))
        })?;
        // Large reservations live on an overflow run; hand out its bytes,
        // not the page number stored inline.
        let overflow = {
            let pg = self.page(pgno)?;
            let nd = Node::at(pg, index)?;
            if nd.is_set(N_OVERFLOW) {
                Some(nd.overflow_pgno()?)
            } else {
                None
            }
        };
        match overflow {
            Some(first) => {
                let buf = self.dirty_page_mut(first)?;
                Ok(&mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len])
            }
            None => {
                let page = self.dirty_page_mut(pgno)?;
                node::data_mut(page, index)
            }
        }
    }

    /// Delete a key, or with `data` one specific duplicate. Returns false
    /// cleanly when nothing matched.
    pub fn del(&mut self, tree: Tree, key: &[u8], data: Option<&[u8]>) -> Result<bool> {
        self.guard_user_tree(tree)?;
        self.mutate(|txn| {
            let mut state = CursorState::new(tree.id);
            match data {
                None => {
                    if !cursor::seek_exact(txn, &mut state, key)? {
                        return Ok(false);
                    }
                    update::cursor_del(txn, &mut state, true)?;
                }
                Some(value) => {
                    if !cursor::seek_both(txn, &mut state, key, value, true)? {
                        return Ok(false);
                    }
                    update::cursor_del(txn, &mut state, false)?;
                }
            }
            Ok(true)
        })
    }

    pub fn cursor(&mut self, tree: Tree) -> Result<WriteCursor<'_, 'e>> {
        self.guard_usable()?;
        self.tree_record(tree.id)?;
        Ok(WriteCursor::new(self, tree.id))
    }

    /// Open an existing named tree, or create it with `create_tree`.
    pub fn open_tree(&mut self, name: &str) -> Result<Tree> {
        self.guard_usable()?;
        let id = self.env.resolve_or_register(name, self)?;
        {
            let mut trees = self.state().trees.borrow_mut();
            fill_named(&mut trees, self.env);
        }
        self.tree_record(id)?;
        Ok(Tree { id })
    }

    /// Create (or open, if present with matching flags) a named tree.
    pub fn create_tree(&mut self, name: &str, flags: u16) -> Result<Tree> {
        ensure!(
            flags & !TREE_FLAGS_MASK == 0,
            "invalid tree flags {:#06x}",
            flags
        );
        ensure!(
            flags & DUP_FIXED == 0 || flags & DUP_SORT != 0,
            "fixed-size duplicates require the duplicate-sort flag"
        );
        ensure!(
            !name.is_empty() && name.len() <= MAX_KEY_SIZE,
            "tree name must be 1..={} bytes",
            MAX_KEY_SIZE
        );
        self.guard_usable()?;

        if let Some(record) = cursor::lookup_tree_record(self, name.as_bytes())? {
            ensure!(
                record.flags() & TREE_FLAGS_MASK == flags,
                "tree '{}' exists with different flags ({:#06x})",
                name,
                record.flags()
            );
            let id = match self.env.find_tree_def(name) {
                Some(id) => id,
                None => self.env.register_tree(name, record.flags() & TREE_FLAGS_MASK)?,
            };
            let mut trees = self.state().trees.borrow_mut();
            fill_named(&mut trees, self.env);
            trees[id].record = record;
            trees[id].state = TS_VALID;
            return Ok(Tree { id });
        }

        let id = self.env.register_tree(name, flags)?;
        self.mutate(|txn| {
            let record = TreeRecord::new(flags);
            {
                let env = txn.env;
                let state = txn.state_mut();
                let mut trees = state.trees.borrow_mut();
                fill_named(&mut trees, env);
                trees[id].record = record;
                trees[id].state = TS_VALID | TS_DIRTY | TS_NEW;
                drop(trees);
                state.new_trees.push(id);
            }
            update::put_tree_record(txn, name.as_bytes(), &record)
        })?;
        Ok(Tree { id })
    }

    /// Free every page of a tree. With `delete`, also remove its record
    /// and invalidate the handle.
    pub fn drop_tree(&mut self, tree: Tree, delete: bool) -> Result<()> {
        ensure!(
            tree.id >= CORE_TREES || !delete,
            "the core trees cannot be deleted"
        );
        ensure!(tree.id != FREE_TREE, "the free tree cannot be dropped");
        self.mutate(|txn| update::tree_drop(txn, tree.id, delete))
    }

    pub fn stat(&self, tree: Tree) -> Result<Stat> {
        let record = self.tree_record(tree.id)?;
        Ok(record_stat(&record, self.file.page_size()))
    }

    // -- page access ---------------------------------------------------

    /// Whether the page is dirty in the active frame (writable in place).
    pub(crate) fn is_dirty(&self, pgno: Pgno) -> bool {
        self.state().dirty.get(pgno).is_some()
    }

    /// Whether an ancestor frame owns the page (dirty or spilled there),
    /// which makes it transaction-private even though the active frame
    /// must still shadow it before writing.
    pub(crate) fn owned_by_ancestor(&self, pgno: Pgno) -> bool {
        self.states[..self.states.len() - 1]
            .iter()
            .any(|s| s.dirty.get(pgno).is_some() || s.spilled.contains(pgno << 1))
    }

    /// Mutable page bytes; the page must be dirty in the active frame.
    pub(crate) fn dirty_page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        let psize = self.file.page_size();
        let entry = self
            .state_mut()
            .dirty
            .get_mut(pgno)
            .ok_or_else(|| eyre::eyre!("page {} is not writable (not touched)", pgno))?;
        let len = entry.count * psize;
        Ok(&mut entry.buf[..len])
    }

    /// Forget a handle this transaction can no longer use (deleted tree).
    pub(crate) fn invalidate_tree(&self, tree: usize) {
        let mut trees = self.state().trees.borrow_mut();
        if tree < trees.len() {
            trees[tree].state = 0;
            trees[tree].name = None;
        }
    }

    pub(crate) fn tree_instance(&self, tree: usize) -> Result<TreeInstance> {
        let trees = self.state().trees.borrow();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        Ok(trees[tree].clone())
    }

    /// Apply a mutation to a tree instance, marking it dirty.
    pub(crate) fn update_tree<R>(
        &self,
        tree: usize,
        f: impl FnOnce(&mut TreeRecord) -> R,
    ) -> Result<R> {
        let trees = &self.state().trees;
        let mut trees = trees.borrow_mut();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        let inst = &mut trees[tree];
        let r = f(&mut inst.record);
        inst.state |= TS_DIRTY | TS_VALID;
        inst.state &= !TS_STALE;
        Ok(r)
    }

    // -- nested transactions -------------------------------------------

    /// Start a nested transaction. The child shadows this transaction's
    /// dirty pages; until it commits or aborts, the parent is unusable
    /// (enforced by the mutable borrow).
    pub fn begin_nested(&mut self) -> Result<NestedTxn<'_, 'e>> {
        self.guard_usable()?;
        let child = WriteState::child_of(self.state());
        self.states.push(child);
        Ok(NestedTxn {
            txn: self,
            done: false,
        })
    }

    fn merge_child(&mut self) -> Result<()> {
        let WriteState {
            trees,
            mut dirty,
            free_pages,
            loose,
            spilled,
            reclaim,
            last_reclaimed,
            next_pgno,
            new_trees,
            ..
        } = self.states.pop().expect("nested frame present");
        let parent = self.states.last_mut().unwrap();
        parent.trees = trees;
        parent.next_pgno = next_pgno;
        parent.reclaim = reclaim;
        parent.last_reclaimed = last_reclaimed;
        for page in dirty.drain() {
            parent.dirty.remove(page.pgno);
            parent.dirty.insert(page)?;
        }
        for &id in free_pages.as_slice() {
            parent.free_pages.push(id);
        }
        parent.free_pages.sort();
        parent.loose.extend(loose);
        parent.spilled.merge(spilled.as_slice());
        parent.new_trees.extend(new_trees);
        Ok(())
    }

    fn discard_child(&mut self) {
        let child = self.states.pop().expect("nested frame present");
        for id in child.new_trees {
            self.env.tombstone_tree(id);
        }
    }

    // -- commit / abort ------------------------------------------------

    /// Commit. The meta write is the single publication point; any
    /// failure before it leaves the database exactly as it was.
    pub fn commit(mut self) -> Result<()> {
        if self.errored {
            // Drop runs the abort path.
            bail!("transaction is in an error state; commit aborted it");
        }
        assert_eq!(self.states.len(), 1, "nested transaction still open");

        let result = self.commit_inner();
        if result.is_err() {
            self.errored = true;
        } else {
            self.committed = true;
        }
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        // 1. Named-tree records whose roots or counters moved.
        let dirty_named: Vec<(usize, String)> = {
            let trees = self.state().trees.borrow();
            trees
                .iter()
                .enumerate()
                .skip(CORE_TREES)
                .filter(|(_, t)| t.state & TS_DIRTY != 0 && t.name.is_some())
                .map(|(id, t)| (id, t.name.clone().unwrap()))
                .collect()
        };
        for (id, name) in dirty_named {
            let record = self.tree_instance(id)?.record;
            update::put_tree_record(self, name.as_bytes(), &record)?;
        }

        // 2. Freed pages into the free tree (fixed point).
        alloc::freelist_save(self)?;

        // 3. Dirty pages to disk, grouped into contiguous runs.
        self.flush_dirty()?;

        // 4. Durability for the data pages.
        let flags = self.env.durability();
        if !flags.no_sync {
            self.file.sync(true)?;
        }

        // 5. The commit point.
        self.write_meta(flags.no_sync || flags.no_meta_sync)?;
        // This commit overwrote the newer meta, so a previous-snapshot
        // rollback (if any) is now permanent.
        self.env.clear_prev_snapshot();
        self.env.readers().set_last_txnid(self.txnid);
        Ok(())
    }

    fn flush_dirty(&mut self) -> Result<()> {
        use crate::config::{COMMIT_GROUP_BYTES, COMMIT_GROUP_PAGES};
        let psize = self.file.page_size();

        // Clear the dirty bit first: pages land on disk clean.
        let pgnos: Vec<Pgno> = self.state().dirty.iter().map(|e| e.pgno).collect();
        for pgno in pgnos {
            let page = self.dirty_page_mut(pgno)?;
            PageHeader::from_bytes_mut(page)?.clear_flags(crate::storage::page::P_DIRTY);
        }

        let state = self.states.last().unwrap();
        let mut run: Vec<&[u8]> = Vec::new();
        let mut run_first: Pgno = 0;
        let mut run_next: Pgno = 0;
        let mut run_bytes = 0usize;
        for entry in state.dirty.iter() {
            let len = entry.count * psize;
            let buf = &entry.buf[..len];
            let contiguous = !run.is_empty() && entry.pgno == run_next;
            if !contiguous
                || run.len() >= COMMIT_GROUP_PAGES
                || run_bytes + len > COMMIT_GROUP_BYTES
            {
                if !run.is_empty() {
                    self.file.write_run(run_first, &run)?;
                }
                run.clear();
                run_first = entry.pgno;
                run_bytes = 0;
            }
            if run.is_empty() {
                run_first = entry.pgno;
            }
            run.push(buf);
            run_next = entry.pgno + entry.count as u64;
            run_bytes += len;
        }
        if !run.is_empty() {
            self.file.write_run(run_first, &run)?;
        }
        Ok(())
    }

    fn write_meta(&mut self, skip_sync_fd: bool) -> Result<()> {
        let slot = (self.txnid % NUM_METAS as u64) as usize;
        let state = self.states.last().unwrap();
        let trees = state.trees.borrow();

        let mut body = snapshot_meta(&self.file, false)?;
        body.set_tree(FREE_TREE, trees[FREE_TREE].record);
        body.set_tree(MAIN_TREE, trees[MAIN_TREE].record);
        body.set_last_pgno(state.next_pgno - 1);
        body.set_map_size(self.file.map_size());
        body.set_txnid(self.txnid);
        drop(trees);

        // Pre-image of the slot, for the failure path.
        let old: Vec<u8> = self.file.page(slot as Pgno, 1)?
            [PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + crate::storage::meta::META_BODY_SIZE]
            .to_vec();

        use zerocopy::IntoBytes;
        let result = self
            .file
            .write_meta(slot, PAGE_HEADER_SIZE, body.as_bytes(), !skip_sync_fd);
        if let Err(e) = result {
            // Scribble the old bytes back through the plain descriptor so
            // the page cache cannot publish a half-written meta, then
            // poison the environment.
            log::warn!("meta write failed; restoring previous meta bytes: {:#}", e);
            let _ = self.file.write_meta(slot, PAGE_HEADER_SIZE, &old, false);
            self.env.set_fatal();
            return Err(e);
        }
        Ok(())
    }

    /// Abandon the transaction. Equivalent to dropping it.
    pub fn abort(self) {}
}

impl Drop for RwTxn<'_> {
    fn drop(&mut self) {
        // Dirty heap pages die with the states. The robust mutex is
        // released last, after the frames are gone.
        while self.states.len() > 1 {
            self.discard_child();
        }
        if !self.committed {
            // Handles registered for trees this transaction created never
            // reached the disk; forget them.
            for id in std::mem::take(&mut self.states[0].new_trees) {
                self.env.tombstone_tree(id);
            }
        }
        self.env.readers().writer_mutex().unlock();
    }
}

impl TxnStore for RwTxn<'_> {
    fn page_size(&self) -> usize {
        self.file.page_size()
    }

    fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        let psize = self.file.page_size();
        for state in self.states.iter().rev() {
            if let Some(entry) = state.dirty.get(pgno) {
                return Ok(&entry.buf[..psize]);
            }
        }
        self.file.page(pgno, 1)
    }

    fn overflow_run(&self, pgno: Pgno) -> Result<&[u8]> {
        for state in self.states.iter().rev() {
            if let Some(entry) = state.dirty.get(pgno) {
                return Ok(&entry.buf[..]);
            }
        }
        let first = self.file.page(pgno, 1)?;
        let hdr = PageHeader::from_bytes(first)?;
        ensure!(
            hdr.is_overflow(),
            "page {} is not the head of an overflow run",
            pgno
        );
        let count = hdr.overflow_count();
        self.file.page(pgno, count)
    }

    fn tree_record(&self, tree: usize) -> Result<TreeRecord> {
        let state = {
            let trees = self.state().trees.borrow();
            ensure!(tree < trees.len(), "unknown tree handle {}", tree);
            trees[tree].state
        };
        if state & TS_STALE != 0 {
            let inst = self.state().trees.borrow()[tree].clone();
            let record = refresh_stale(self, &inst)?;
            let mut trees = self.state().trees.borrow_mut();
            trees[tree].record = record;
            trees[tree].state = TS_VALID;
            return Ok(record);
        }
        ensure!(state & TS_VALID != 0, "tree handle {} is not usable", tree);
        Ok(self.state().trees.borrow()[tree].record)
    }

    fn tree_flags(&self, tree: usize) -> Result<u16> {
        self.tree_record(tree).map(|r| r.flags())
    }

    fn key_cmp(&self, tree: usize) -> Result<Comparator> {
        let trees = self.state().trees.borrow();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        Ok(trees[tree].key_cmp)
    }

    fn dup_cmp(&self, tree: usize) -> Result<Comparator> {
        let trees = self.state().trees.borrow();
        ensure!(tree < trees.len(), "unknown tree handle {}", tree);
        Ok(trees[tree].dup_cmp)
    }
}

/// Nested write transaction; dereferences to [`RwTxn`] so every operation
/// is available. Dropping without `commit` discards its changes.
pub struct NestedTxn<'p, 'e> {
    txn: &'p mut RwTxn<'e>,
    done: bool,
}

impl<'e> std::ops::Deref for NestedTxn<'_, 'e> {
    type Target = RwTxn<'e>;
    fn deref(&self) -> &RwTxn<'e> {
        self.txn
    }
}

impl<'e> std::ops::DerefMut for NestedTxn<'_, 'e> {
    fn deref_mut(&mut self) -> &mut RwTxn<'e> {
        self.txn
    }
}

impl NestedTxn<'_, '_> {
    /// Splice this transaction's changes into its parent.
    pub fn commit(mut self) -> Result<()> {
        ensure!(
            !self.txn.errored,
            "transaction is in an error state; the nested changes are discarded"
        );
        self.txn.merge_child()?;
        self.done = true;
        Ok(())
    }

    pub fn abort(mut self) {
        self.txn.discard_child();
        self.done = true;
    }
}

impl Drop for NestedTxn<'_, '_> {
    fn drop(&mut self) {
        if !self.done {
            self.txn.discard_child();
        }
    }
}

pub(crate) fn record_stat(record: &TreeRecord, page_size: usize) -> Stat {
    Stat {
        page_size,
        depth: record.depth(),
        branch_pages: record.branch_pages(),
        leaf_pages: record.leaf_pages(),
        overflow_pages: record.overflow_pages(),
        entries: record.entries(),
    }
}
