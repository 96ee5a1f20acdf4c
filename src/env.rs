//! # Environment
//!
//! An [`Env`] owns everything process-wide: the data file and its
//! read-only map, the mapped reader table, the named-tree registry, and
//! the in-process half of writer serialization. It is created by the
//! [`EnvOptions`] builder and may only be dropped once no transaction is
//! live (enforced by borrows — transactions hold `&Env`).
//!
//! ## Open Sequence
//!
//! 1. Attach the lock file (the first opener sizes it, initializes the
//!    shared mutexes, and wipes stale transient state).
//! 2. Open the data descriptors and read both meta pages with positioned
//!    reads at the minimum page size — the map cannot exist yet because
//!    the page size comes from the meta. An absent or empty file gets two
//!    fresh meta pages written and synced first.
//! 3. Validate magic and version, pick the newer meta (or the older one
//!    for a previous-snapshot open), and learn the real page size.
//! 4. Map the file at the effective map size: the largest of the
//!    configured size, the size recorded in the meta, and the pages
//!    already in use.
//! 5. Publish the committed txnid into the reader-table header.
//!
//! ## Caveats
//!
//! Do not open the same environment twice in one process: lock-file
//! liveness uses per-process `fcntl` locks, so a second handle would
//! treat the first one's state as its own. A poisoned environment (meta
//! write failure, a writer that died holding the mutex) refuses all
//! further transactions until reopened.

use std::cell::RefCell;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use zerocopy::IntoBytes;

use crate::btree::{Comparator, Stat, Tree, TREE_FLAGS_MASK};
use crate::config::{
    Pgno, TxnId, CORE_TREES, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, DEFAULT_PAGE_SIZE, MAIN_TREE,
    MAX_PAGE_SIZE, MIN_PAGE_SIZE, NUM_METAS, PAGE_HEADER_SIZE,
};
use crate::readers::mutex::LockState;
use crate::readers::{ReaderInfo, ReaderTable, NO_SNAPSHOT};
use crate::storage::meta::{MetaBody, META_BODY_SIZE};
use crate::storage::mmap::{self, DataFile};
use crate::storage::page::{PageHeader, P_META};
use crate::txn::{record_stat, snapshot_meta, RoTxn, RwTxn, TxnStore};

pub const DATA_FILE_NAME: &str = "data.cdb";
pub const LOCK_FILE_NAME: &str = "lock.cdb";
/// Suffix of the lock file in no-subdir mode.
pub const LOCK_SUFFIX: &str = "-lock";

static ENV_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Reader-slot cache: one slot per (environment, thread), reused
    /// across read transactions.
    static READER_SLOTS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

/// A named tree's registry entry; the id (index) is stable for the
/// environment's lifetime.
pub(crate) struct TreeDef {
    pub name: String,
    pub flags: u16,
    pub key_cmp: Option<Comparator>,
    pub dup_cmp: Option<Comparator>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Durability {
    pub no_sync: bool,
    pub no_meta_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: Pgno,
    pub last_txnid: TxnId,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// Builder for opening an environment.
pub struct EnvOptions {
    map_size: usize,
    max_readers: u32,
    max_named_trees: usize,
    page_size: usize,
    mode: u32,
    no_sync: bool,
    no_meta_sync: bool,
    no_subdir: bool,
    no_tls: bool,
    read_only: bool,
    prev_snapshot: bool,
    main_key_cmp: Option<Comparator>,
    main_dup_cmp: Option<Comparator>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_named_trees: 0,
            page_size: DEFAULT_PAGE_SIZE,
            mode: 0o644,
            no_sync: false,
            no_meta_sync: false,
            no_subdir: false,
            no_tls: false,
            read_only: false,
            prev_snapshot: false,
            main_key_cmp: None,
            main_dup_cmp: None,
        }
    }
}

impl EnvOptions {
    /// Size of the data map; also the upper bound on the file.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// How many named trees may be opened, beyond the two core trees.
    pub fn max_named_trees(mut self, trees: usize) -> Self {
        self.max_named_trees = trees;
        self
    }

    /// Page size used when the environment is created; ignored when
    /// opening an existing file.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Unix permissions for created files.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Skip both fsync and the synchronous meta write on commit. A crash
    /// loses recent transactions but never corrupts the file.
    pub fn no_sync(mut self, on: bool) -> Self {
        self.no_sync = on;
        self
    }

    /// fsync the data but write the meta through the plain descriptor.
    pub fn no_meta_sync(mut self, on: bool) -> Self {
        self.no_meta_sync = on;
        self
    }

    /// Treat the open path as the data file itself instead of a
    /// directory; the lock file gets a `-lock` suffix.
    pub fn no_subdir(mut self, on: bool) -> Self {
        self.no_subdir = on;
        self
    }

    /// Do not cache reader slots in thread-local storage. Required for
    /// multiple simultaneous read transactions on one thread; slots are
    /// then fully released at transaction end.
    pub fn no_tls(mut self, on: bool) -> Self {
        self.no_tls = on;
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    /// Open the previous snapshot (the older meta page) instead of the
    /// latest one.
    pub fn prev_snapshot(mut self, on: bool) -> Self {
        self.prev_snapshot = on;
        self
    }

    /// Custom total order for main-tree keys; must match the existing
    /// data.
    pub fn main_compare(mut self, cmp: Comparator) -> Self {
        self.main_key_cmp = Some(cmp);
        self
    }

    pub fn main_dup_compare(mut self, cmp: Comparator) -> Self {
        self.main_dup_cmp = Some(cmp);
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Env> {
        let path = path.as_ref();
        let (data_path, lock_path) = if self.no_subdir {
            let mut lock = path.as_os_str().to_os_string();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            ensure!(
                path.is_dir(),
                "environment path '{}' is not a directory (use no_subdir for single-file mode)",
                path.display()
            );
            (path.join(DATA_FILE_NAME), path.join(LOCK_FILE_NAME))
        };

        let readers = ReaderTable::open(&lock_path, self.max_readers, self.mode)?;
        let (file, sync_file) = mmap::open_files(&data_path, self.read_only, self.mode)?;

        let meta = match read_meta_bootstrap(&file, self.prev_snapshot)? {
            Some(meta) => meta,
            None => {
                ensure!(
                    !self.read_only,
                    "cannot create '{}': environment is read-only",
                    data_path.display()
                );
                ensure!(
                    self.page_size.is_power_of_two()
                        && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
                    "page size {} must be a power of two in [{}, {}]",
                    self.page_size,
                    MIN_PAGE_SIZE,
                    MAX_PAGE_SIZE
                );
                write_fresh_metas(&file, self.page_size, self.map_size)?
            }
        };

        let page_size = meta.page_size();
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "meta page records an invalid page size {}",
            page_size
        );
        let in_use = (meta.last_pgno() + 1) as usize * page_size;
        let map_size = self.map_size.max(meta.map_size()).max(in_use);

        let data_file = DataFile::new(file, sync_file, map_size, page_size, self.read_only)?;
        if readers.last_txnid() < meta.txnid() {
            readers.set_last_txnid(meta.txnid());
        }

        let defs: Vec<Option<TreeDef>> = (0..CORE_TREES)
            .map(|_| {
                Some(TreeDef {
                    name: String::new(),
                    flags: 0,
                    key_cmp: None,
                    dup_cmp: None,
                })
            })
            .collect();

        Ok(Env {
            file: RwLock::new(data_file),
            readers,
            tree_defs: RwLock::new(defs),
            write_lock: Mutex::new(()),
            page_size,
            max_named: self.max_named_trees,
            env_id: ENV_IDS.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            no_sync: self.no_sync,
            no_meta_sync: self.no_meta_sync,
            no_tls: self.no_tls,
            read_only: self.read_only,
            prev_snapshot: AtomicBool::new(self.prev_snapshot),
            fatal: AtomicBool::new(false),
            main_key_cmp: self.main_key_cmp,
            main_dup_cmp: self.main_dup_cmp,
        })
    }
}

fn read_fully_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).wrap_err("meta read failed"),
        }
    }
    Ok(done)
}

/// Read both meta pages before the map exists. `None` means the file is
/// empty (fresh environment).
fn read_meta_bootstrap(file: &std::fs::File, previous: bool) -> Result<Option<MetaBody>> {
    let mut buf = vec![0u8; MIN_PAGE_SIZE];
    let n = read_fully_at(file, &mut buf, 0)?;
    if n == 0 {
        return Ok(None);
    }
    ensure!(
        n >= PAGE_HEADER_SIZE + META_BODY_SIZE,
        "data file too short ({} bytes) to hold a meta page",
        n
    );
    let meta0 = *MetaBody::from_page(&buf)
        .wrap_err("first meta page is invalid; not a database file of this format")?;
    let page_size = meta0.page_size();
    ensure!(
        page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
        "meta page records an invalid page size {}",
        page_size
    );

    let mut buf1 = vec![0u8; MIN_PAGE_SIZE];
    let n1 = read_fully_at(file, &mut buf1, page_size as u64)?;
    let meta1 = if n1 >= PAGE_HEADER_SIZE + META_BODY_SIZE {
        match MetaBody::from_page(&buf1) {
            Ok(m) => Some(*m),
            Err(e) => {
                log::warn!("second meta page unreadable, using the first: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(Some(match meta1 {
        Some(m1) => {
            let pick = crate::storage::meta::pick(&meta0, &m1, previous);
            if pick == 0 {
                meta0
            } else {
                m1
            }
        }
        None => meta0,
    }))
}

/// Write the two initial meta pages of a fresh environment.
fn write_fresh_metas(file: &std::fs::File, page_size: usize, map_size: usize) -> Result<MetaBody> {
    let body = MetaBody::fresh(page_size, map_size);
    for slot in 0..NUM_METAS {
        let mut page = vec![0u8; page_size];
        {
            let hdr = PageHeader::from_bytes_mut(&mut page)?;
            hdr.set_pgno(slot as Pgno);
            hdr.set_flags(P_META);
        }
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_BODY_SIZE].copy_from_slice(body.as_bytes());
        file.write_all_at(&page, (slot * page_size) as u64)
            .wrap_err("failed to write initial meta pages")?;
    }
    file.sync_all().wrap_err("failed to sync initial meta pages")?;
    Ok(body)
}

pub struct Env {
    file: RwLock<DataFile>,
    readers: ReaderTable,
    tree_defs: RwLock<Vec<Option<TreeDef>>>,
    write_lock: Mutex<()>,
    page_size: usize,
    max_named: usize,
    env_id: u64,
    path: PathBuf,
    no_sync: bool,
    no_meta_sync: bool,
    no_tls: bool,
    read_only: bool,
    /// Anchor transactions to the older meta until the first write
    /// commit, which overwrites the newer one (rolling it back).
    prev_snapshot: AtomicBool,
    fatal: AtomicBool,
    main_key_cmp: Option<Comparator>,
    main_dup_cmp: Option<Comparator>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Env {
    pub fn options() -> EnvOptions {
        EnvOptions::default()
    }

    /// Begin a snapshot read transaction.
    pub fn begin_ro_txn(&self) -> Result<RoTxn<'_>> {
        RoTxn::begin(self)
    }

    /// Begin the (single) write transaction; blocks on the writer mutex.
    pub fn begin_rw_txn(&self) -> Result<RwTxn<'_>> {
        RwTxn::begin(self)
    }

    /// Flush OS buffers for the data file; needed when running with the
    /// relaxed durability modes. `force` syncs even under `no_sync`.
    pub fn sync(&self, force: bool) -> Result<()> {
        ensure!(!self.read_only, "environment is read-only");
        if self.no_sync && !force {
            return Ok(());
        }
        self.file.read().sync(!force)
    }

    /// Statistics of the main tree at the latest committed snapshot.
    pub fn stat(&self) -> Result<Stat> {
        let file = self.file.read();
        let meta = snapshot_meta(&file, false)?;
        Ok(record_stat(meta.tree(MAIN_TREE), file.page_size()))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let file = self.file.read();
        let meta = snapshot_meta(&file, false)?;
        Ok(EnvInfo {
            map_size: file.map_size(),
            last_pgno: meta.last_pgno(),
            last_txnid: meta.txnid(),
            max_readers: self.readers.max_readers(),
            num_readers: self.readers.reader_list().len() as u32,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hard limit on key length (and duplicate value length) for this
    /// environment's page size.
    pub fn max_key_size(&self) -> usize {
        crate::config::max_key_for(self.page_size)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Registered live readers.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers.reader_list()
    }

    /// Clear reader slots of dead processes; returns how many.
    pub fn reader_check(&self) -> Result<usize> {
        self.readers.check_stale()
    }

    /// Grow the map. Waits for every live transaction to finish.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        let mut file = self.file.write();
        file.remap(size)
    }

    /// Install comparators for a named tree (affects transactions begun
    /// afterwards). The order must match the data already stored.
    pub fn set_tree_compare(
        &self,
        tree: Tree,
        key_cmp: Option<Comparator>,
        dup_cmp: Option<Comparator>,
    ) -> Result<()> {
        ensure!(tree.id >= CORE_TREES, "core trees use fixed comparators");
        let mut defs = self.tree_defs.write();
        let def = defs
            .get_mut(tree.id)
            .and_then(|d| d.as_mut())
            .ok_or_else(|| eyre::eyre!("unknown tree handle {}", tree.id))?;
        def.key_cmp = key_cmp;
        def.dup_cmp = dup_cmp;
        Ok(())
    }

    // -- crate-internal plumbing ---------------------------------------

    pub(crate) fn check_usable(&self) -> Result<()> {
        ensure!(
            !self.fatal.load(Ordering::Acquire),
            "environment is in a fatal state; reopen it"
        );
        Ok(())
    }

    pub(crate) fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub(crate) fn use_prev_snapshot(&self) -> bool {
        self.prev_snapshot.load(Ordering::Acquire)
    }

    /// The first write commit makes the previous snapshot the current
    /// one; stop steering transactions at the older meta.
    pub(crate) fn clear_prev_snapshot(&self) {
        self.prev_snapshot.store(false, Ordering::Release);
    }

    pub(crate) fn data_file(&self) -> &RwLock<DataFile> {
        &self.file
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    pub(crate) fn writer_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    pub(crate) fn durability(&self) -> Durability {
        Durability {
            no_sync: self.no_sync,
            no_meta_sync: self.no_meta_sync,
        }
    }

    pub(crate) fn main_key_cmp(&self) -> Option<Comparator> {
        self.main_key_cmp
    }

    pub(crate) fn main_dup_cmp(&self) -> Option<Comparator> {
        self.main_dup_cmp
    }

    /// Acquire the cross-process writer mutex. A dead previous writer is
    /// recovered per the robust-mutex protocol but poisons the
    /// environment: its in-flight state is unknowable.
    pub(crate) fn lock_writer_mutex(&self) -> Result<()> {
        match self.readers.writer_mutex().lock()? {
            LockState::Acquired => Ok(()),
            LockState::OwnerDied => {
                log::warn!("writer died holding the writer mutex; environment marked fatal");
                let _ = self.readers.writer_mutex().mark_consistent();
                self.readers.writer_mutex().unlock();
                self.set_fatal();
                bail!(
                    "recovered the writer mutex from a dead writer; \
                     the environment is marked fatal, reopen it"
                )
            }
        }
    }

    /// Claim (or reuse via thread-local storage) a reader slot.
    pub(crate) fn claim_reader_slot(&self) -> Result<usize> {
        // SAFETY: pthread_self never fails; the id is only used as an
        // opaque diagnostic tag in the reader table.
        let tid = unsafe { libc::pthread_self() } as u64;
        if !self.no_tls {
            let cached = READER_SLOTS.with(|s| {
                s.borrow()
                    .iter()
                    .find(|(env, _)| *env == self.env_id)
                    .map(|(_, slot)| *slot)
            });
            if let Some(slot) = cached {
                ensure!(
                    self.readers.slot_snapshot(slot) == NO_SNAPSHOT,
                    "reader slot already in use by this thread \
                     (overlapping read transactions need the no-tls mode)"
                );
                return Ok(slot);
            }
        }
        let slot = self.readers.acquire_slot(tid)?;
        if !self.no_tls {
            READER_SLOTS.with(|s| s.borrow_mut().push((self.env_id, slot)));
        }
        Ok(slot)
    }

    /// A read transaction finished with its slot.
    pub(crate) fn return_reader_slot(&self, slot: usize) {
        if self.no_tls {
            self.readers.release_slot(slot);
        }
    }

    pub(crate) fn tree_defs(&self) -> RwLockReadGuard<'_, Vec<Option<TreeDef>>> {
        self.tree_defs.read()
    }

    pub(crate) fn find_tree_def(&self, name: &str) -> Option<usize> {
        self.tree_defs
            .read()
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.name == name))
    }

    /// Register a named tree, returning its stable id. Ids are never
    /// reused so stale handles fail instead of aliasing a new tree.
    pub(crate) fn register_tree(&self, name: &str, flags: u16) -> Result<usize> {
        let mut defs = self.tree_defs.write();
        if let Some(id) = defs
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.name == name))
        {
            return Ok(id);
        }
        let active = defs.iter().skip(CORE_TREES).filter(|d| d.is_some()).count();
        ensure!(
            active < self.max_named,
            "named-tree table full ({} trees); raise max_named_trees",
            self.max_named
        );
        defs.push(Some(TreeDef {
            name: name.to_string(),
            flags: flags & TREE_FLAGS_MASK,
            key_cmp: None,
            dup_cmp: None,
        }));
        Ok(defs.len() - 1)
    }

    pub(crate) fn tombstone_tree(&self, id: usize) {
        if id >= CORE_TREES {
            self.tree_defs.write()[id] = None;
        }
    }

    /// Resolve a name to a handle, registering it if the tree exists in
    /// the given transaction's snapshot.
    pub(crate) fn resolve_or_register<T: TxnStore>(&self, name: &str, txn: &T) -> Result<usize> {
        if let Some(id) = self.find_tree_def(name) {
            return Ok(id);
        }
        match crate::btree::cursor::lookup_tree_record(txn, name.as_bytes())? {
            Some(record) => self.register_tree(name, record.flags() & TREE_FLAGS_MASK),
            None => bail!("tree '{}' not found", name),
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        // Thread-local slots of this environment are unreachable once it
        // is gone; clear them in the shared table.
        self.readers.release_own_slots();
    }
}
