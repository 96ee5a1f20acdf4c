//! # Reader-Slot Table
//!
//! The lock file is a memory-mapped, process-shared table registering
//! every live read transaction so a writer can compute the oldest
//! snapshot still in use. Readers never take a data-structure lock: a
//! slot is claimed once (under the reader-table mutex), then published
//! and retired with plain atomic stores.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------------------------------+
//! | TableHeader: magic, format fingerprint,          |
//! |   last-committed txnid, active-slot count,       |
//! |   reader-table mutex, writer mutex               |
//! +--------------------------------------------------+  <- 64-byte aligned
//! | ReaderSlot 0: snapshot txnid, tid, pid (64 B)    |
//! | ReaderSlot 1                                     |
//! | ...                                              |
//! +--------------------------------------------------+
//! ```
//!
//! Slots are cache-line sized so two readers never share a line. The
//! format fingerprint folds in the lock version, slot and mutex geometry,
//! and the pid-lock scheme; any mismatch means a foreign build and the
//! open is refused.
//!
//! ## Claim/Release Ordering
//!
//! Claiming writes `tid`, then `snapshot = ∞`, then `pid`; releasing
//! clears `pid` first. An unlocked scanner therefore observes either a
//! fully valid slot or one it must skip — never a half-written one. The
//! oldest-snapshot scan runs without any lock: a stale read can only make
//! a page be reclaimed later than necessary, never earlier.
//!
//! ## PID Liveness
//!
//! Every attaching process takes an exclusive byte-range lock at offset
//! `pid` of the lock file. A slot whose pid byte can be locked by someone
//! else belongs to a dead process and may be cleared.

pub mod mutex;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use crate::config::{TxnId, LOCK_MAGIC, LOCK_VERSION};

use mutex::{LockState, SharedMutex};

/// Snapshot id published by a slot that holds no snapshot.
pub const NO_SNAPSHOT: TxnId = TxnId::MAX;

pub const SLOT_SIZE: usize = 64;

#[repr(C)]
struct TableHeader {
    magic: u32,
    format: u32,
    /// Txnid of the most recent commit; the value readers publish.
    txnid: AtomicU64,
    /// Upper bound on the slots ever claimed, so scans can stop early.
    num_readers: AtomicU32,
    _pad: u32,
    rmutex: SharedMutex,
    wmutex: SharedMutex,
}

#[repr(C, align(64))]
struct ReaderSlot {
    txnid: AtomicU64,
    tid: AtomicU64,
    pid: AtomicU32,
    _pad: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<ReaderSlot>() == SLOT_SIZE);

const fn slots_offset() -> usize {
    (std::mem::size_of::<TableHeader>() + SLOT_SIZE - 1) & !(SLOT_SIZE - 1)
}

/// Fingerprint of everything that must match between builds sharing one
/// lock file.
fn format_fingerprint() -> u32 {
    let mut f = LOCK_VERSION;
    for piece in [
        SLOT_SIZE as u32,
        std::mem::size_of::<TableHeader>() as u32,
        std::mem::size_of::<SharedMutex>() as u32,
        std::mem::align_of::<SharedMutex>() as u32,
        std::mem::size_of::<libc::pid_t>() as u32,
        1, // pid byte-range liveness locks in use
    ] {
        f = f.wrapping_mul(31).wrapping_add(piece);
    }
    f
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub pid: u32,
    pub tid: u64,
    pub txnid: TxnId,
}

pub struct ReaderTable {
    file: File,
    map: MmapMut,
    max_readers: u32,
    pid: u32,
}

impl ReaderTable {
    /// Open or create the lock file. The first opener (detected by an
    /// exclusive file lock) sizes the table and initializes the header
    /// and mutexes; everyone else validates and attaches.
    pub fn open(path: &Path, max_readers: u32, mode: u32) -> Result<Self> {
        ensure!(max_readers > 0, "max_readers must be at least 1");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;
        let pid = std::process::id();

        let exclusive = lock_range(&file, 0, 1, true, false)?;
        let max_readers = if exclusive {
            let size = slots_offset() + max_readers as usize * SLOT_SIZE;
            file.set_len(size as u64)
                .wrap_err("failed to size lock file")?;
            max_readers
        } else {
            // Wait for the initializer to finish, then attach.
            lock_range(&file, 0, 1, false, true)?;
            let len = file.metadata().wrap_err("lock file stat failed")?.len() as usize;
            ensure!(
                len >= slots_offset() + SLOT_SIZE,
                "lock file too small ({} bytes)",
                len
            );
            ((len - slots_offset()) / SLOT_SIZE) as u32
        };

        // SAFETY: the mapping is shared on purpose; all mutable state in
        // it is atomics and pthread mutexes, accessed only through
        // operations that are defined for shared memory.
        let mut map = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .wrap_err("failed to map lock file")?
        };

        if exclusive {
            // Drop whatever a previous incarnation left behind: slots of
            // dead processes and a stale committed txnid (the environment
            // re-seeds it from the meta page). All-zero is a valid state
            // for every atomic in the table.
            map.fill(0);
            // SAFETY: we hold the exclusive lock, nobody else is mapped.
            unsafe {
                let h = map.as_mut_ptr() as *mut TableHeader;
                std::ptr::addr_of_mut!((*h).magic).write(LOCK_MAGIC);
                std::ptr::addr_of_mut!((*h).format).write(format_fingerprint());
                SharedMutex::init(std::ptr::addr_of_mut!((*h).rmutex))?;
                SharedMutex::init(std::ptr::addr_of_mut!((*h).wmutex))?;
            }
            // Downgrade to shared so later openers can attach.
            lock_range(&file, 0, 1, false, true)?;
        }

        let table = Self {
            file,
            map,
            max_readers,
            pid,
        };
        let h = table.header();
        ensure!(
            h.magic == LOCK_MAGIC,
            "bad lock-file magic {:#010x} (byte order mismatch or not a lock file)",
            h.magic
        );
        ensure!(
            h.format == format_fingerprint(),
            "lock-file format fingerprint {:#010x} does not match this build ({:#010x})",
            h.format,
            format_fingerprint()
        );

        // Liveness beacon: an exclusive lock on our own pid offset. A
        // second environment handle in this process already holds it,
        // which is fine.
        let _ = lock_range(&table.file, pid as u64, 1, true, false)?;

        Ok(table)
    }

    fn header(&self) -> &TableHeader {
        // SAFETY: the map is page-aligned, at least header-sized (checked
        // at open), and initialized by the first opener.
        unsafe { &*(self.map.as_ptr() as *const TableHeader) }
    }

    fn slots(&self) -> &[ReaderSlot] {
        // SAFETY: the map holds exactly max_readers slots past the
        // aligned header; all fields are atomics.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(slots_offset()) as *const ReaderSlot,
                self.max_readers as usize,
            )
        }
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Txnid of the most recent commit, as published for readers.
    pub fn last_txnid(&self) -> TxnId {
        self.header().txnid.load(Ordering::Acquire)
    }

    pub fn set_last_txnid(&self, txnid: TxnId) {
        self.header().txnid.store(txnid, Ordering::Release);
    }

    pub fn writer_mutex(&self) -> &SharedMutex {
        &self.header().wmutex
    }

    /// Claim a free slot for this thread. Blocks on the reader-table
    /// mutex only; a dead previous holder is repaired in place.
    pub fn acquire_slot(&self, tid: u64) -> Result<usize> {
        let h = self.header();
        let died = match h.rmutex.lock()? {
            LockState::Acquired => false,
            LockState::OwnerDied => true,
        };
        if died {
            log::warn!("reader-table mutex owner died; evicting dead reader slots");
            let evicted = self.evict_dead_locked();
            if evicted > 0 {
                log::warn!("evicted {} dead reader slots", evicted);
            }
            h.rmutex.mark_consistent()?;
        }

        let slots = self.slots();
        let claimed = slots.iter().position(|s| s.pid.load(Ordering::Acquire) == 0);
        let result = match claimed {
            Some(i) => {
                let s = &slots[i];
                // Order matters for lock-free scanners: tid, snapshot,
                // then pid last.
                s.tid.store(tid, Ordering::Relaxed);
                s.txnid.store(NO_SNAPSHOT, Ordering::Release);
                s.pid.store(self.pid, Ordering::Release);
                if i as u32 >= h.num_readers.load(Ordering::Relaxed) {
                    h.num_readers.store(i as u32 + 1, Ordering::Release);
                }
                Ok(i)
            }
            None => Err(eyre::eyre!("reader table full ({} slots)", self.max_readers)),
        };
        h.rmutex.unlock();
        result
    }

    /// Publish the current committed txnid as this slot's snapshot,
    /// retrying around a racing writer so the slot never pins a snapshot
    /// older than what it returns.
    pub fn publish(&self, slot: usize) -> TxnId {
        let h = self.header();
        let s = &self.slots()[slot];
        loop {
            let t = h.txnid.load(Ordering::Acquire);
            s.txnid.store(t, Ordering::SeqCst);
            if h.txnid.load(Ordering::Acquire) == t {
                return t;
            }
        }
    }

    /// Snapshot currently published by a slot (`NO_SNAPSHOT` when idle).
    pub fn slot_snapshot(&self, slot: usize) -> TxnId {
        self.slots()[slot].txnid.load(Ordering::Acquire)
    }

    /// Publish an explicit snapshot id. Only valid for ids at or below
    /// the committed txnid (pinning older is always safe).
    pub fn publish_snapshot(&self, slot: usize, txnid: TxnId) {
        self.slots()[slot].txnid.store(txnid, Ordering::SeqCst);
    }

    /// Drop the snapshot but keep the slot claimed for reuse.
    pub fn retire(&self, slot: usize) {
        self.slots()[slot].txnid.store(NO_SNAPSHOT, Ordering::Release);
    }

    /// Give the slot back entirely. pid is cleared first so scanners
    /// skip the slot before its other fields change.
    pub fn release_slot(&self, slot: usize) {
        let s = &self.slots()[slot];
        s.pid.store(0, Ordering::Release);
        s.txnid.store(NO_SNAPSHOT, Ordering::Release);
        s.tid.store(0, Ordering::Relaxed);
    }

    /// Release every slot owned by this process; used when the
    /// environment closes with thread-local slots still claimed.
    pub fn release_own_slots(&self) {
        for (i, s) in self.slots().iter().enumerate() {
            if s.pid.load(Ordering::Acquire) == self.pid {
                self.release_slot(i);
            }
        }
    }

    /// Oldest snapshot any live reader holds, without taking a lock.
    /// Defaults to `fallback` (the writer's txnid minus one) when no
    /// reader is active.
    pub fn oldest(&self, fallback: TxnId) -> TxnId {
        let n = self
            .header()
            .num_readers
            .load(Ordering::Acquire)
            .min(self.max_readers) as usize;
        let mut oldest = fallback;
        for s in &self.slots()[..n] {
            if s.pid.load(Ordering::Acquire) != 0 {
                oldest = oldest.min(s.txnid.load(Ordering::Acquire));
            }
        }
        oldest
    }

    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        let n = self
            .header()
            .num_readers
            .load(Ordering::Acquire)
            .min(self.max_readers) as usize;
        self.slots()[..n]
            .iter()
            .filter(|s| s.pid.load(Ordering::Acquire) != 0)
            .map(|s| ReaderInfo {
                pid: s.pid.load(Ordering::Acquire),
                tid: s.tid.load(Ordering::Relaxed),
                txnid: s.txnid.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Clear slots whose owning process has exited, detected through the
    /// pid byte-range lock. Returns how many were cleared.
    pub fn check_stale(&self) -> Result<usize> {
        let mut dead: Vec<u32> = Vec::new();
        let n = self
            .header()
            .num_readers
            .load(Ordering::Acquire)
            .min(self.max_readers) as usize;
        for s in &self.slots()[..n] {
            let pid = s.pid.load(Ordering::Acquire);
            if pid != 0 && pid != self.pid && !dead.contains(&pid) && self.pid_is_dead(pid)? {
                dead.push(pid);
            }
        }
        if dead.is_empty() {
            return Ok(0);
        }

        let h = self.header();
        let died = matches!(h.rmutex.lock()?, LockState::OwnerDied);
        let mut cleared = 0;
        for (i, s) in self.slots()[..n].iter().enumerate() {
            if dead.contains(&s.pid.load(Ordering::Acquire)) {
                log::warn!(
                    "clearing reader slot {} of dead process {}",
                    i,
                    s.pid.load(Ordering::Relaxed)
                );
                self.release_slot(i);
                cleared += 1;
            }
        }
        if died {
            h.rmutex.mark_consistent()?;
        }
        h.rmutex.unlock();
        Ok(cleared)
    }

    /// Must hold the reader-table mutex.
    fn evict_dead_locked(&self) -> usize {
        let mut cleared = 0;
        for (i, s) in self.slots().iter().enumerate() {
            let pid = s.pid.load(Ordering::Acquire);
            if pid != 0 && pid != self.pid {
                if let Ok(true) = self.pid_is_dead(pid) {
                    self.release_slot(i);
                    cleared += 1;
                }
            }
        }
        cleared
    }

    fn pid_is_dead(&self, pid: u32) -> Result<bool> {
        let acquired = lock_range(&self.file, pid as u64, 1, true, false)?;
        if acquired {
            unlock_range(&self.file, pid as u64, 1)?;
        }
        Ok(acquired)
    }
}

fn lock_range(file: &File, start: u64, len: u64, exclusive: bool, wait: bool) -> Result<bool> {
    let op = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = (if exclusive { libc::F_WRLCK } else { libc::F_RDLCK }) as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), op, &fl) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EACCES) | Some(libc::EAGAIN) if !wait => return Ok(false),
            _ => return Err(err).wrap_err("lock-file range lock failed"),
        }
    }
}

fn unlock_range(file: &File, start: u64, len: u64) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_UNLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error()).wrap_err("lock-file range unlock failed")
    }
}
