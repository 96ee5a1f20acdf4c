//! # Page-Number Lists
//!
//! Two list shapes back the write path:
//!
//! - [`IdList`]: a set of page numbers kept sorted in descending order.
//!   Used for the pages freed by a transaction, the reclaimable set read
//!   back from the free tree, and the spill set. Descending order puts the
//!   smallest page numbers at the tail, which is where the allocator scans
//!   for contiguous runs so reuse prefers the front of the file.
//!
//! - [`DirtyList`]: the write transaction's modified pages, ordered by
//!   ascending page number so commit can group contiguous runs into single
//!   vectored writes. Each entry owns its heap buffer; overflow runs are
//!   one entry whose buffer spans the whole run.
//!
//! On disk a free-tree record is an `IdList` serialized as host-endian
//! words: a count followed by that many page numbers, descending.

use eyre::{bail, ensure, Result};

use crate::config::{Pgno, DIRTY_PAGES_MAX};

/// Sorted set of page numbers, descending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdList {
    ids: Vec<Pgno>,
}

impl IdList {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[Pgno] {
        &self.ids
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Append without maintaining order; callers sort before the list is
    /// searched or persisted.
    pub fn push(&mut self, id: Pgno) {
        self.ids.push(id);
    }

    /// Append a run of consecutive page numbers starting at `id`.
    pub fn push_run(&mut self, id: Pgno, count: usize) {
        for n in 0..count as Pgno {
            self.ids.push(id + n);
        }
    }

    pub fn sort(&mut self) {
        self.ids.sort_unstable_by(|a, b| b.cmp(a));
    }

    pub fn contains(&self, id: Pgno) -> bool {
        self.ids.binary_search_by(|probe| probe.cmp(&id).reverse()).is_ok()
    }

    /// Index of `id`, or of the position it would occupy.
    pub fn search(&self, id: Pgno) -> std::result::Result<usize, usize> {
        self.ids.binary_search_by(|probe| probe.cmp(&id).reverse())
    }

    pub fn remove(&mut self, id: Pgno) -> bool {
        match self.search(id) {
            Ok(at) => {
                self.ids.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    /// Merge another descending list into this one, preserving order.
    pub fn merge(&mut self, other: &[Pgno]) {
        let mut merged = Vec::with_capacity(self.ids.len() + other.len());
        let (mut a, mut b) = (self.ids.iter().peekable(), other.iter().peekable());
        loop {
            match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) => {
                    if x >= y {
                        merged.push(x);
                        a.next();
                        if x == y {
                            b.next();
                        }
                    } else {
                        merged.push(y);
                        b.next();
                    }
                }
                (Some(&&x), None) => {
                    merged.push(x);
                    a.next();
                }
                (None, Some(&&y)) => {
                    merged.push(y);
                    b.next();
                }
                (None, None) => break,
            }
        }
        self.ids = merged;
    }

    /// Pop the smallest page number.
    pub fn pop(&mut self) -> Option<Pgno> {
        self.ids.pop()
    }

    /// Drop the `count` smallest page numbers (the tail).
    pub fn truncate_tail(&mut self, count: usize) {
        let keep = self.ids.len().saturating_sub(count);
        self.ids.truncate(keep);
    }

    /// Find `count` consecutive page numbers, scanning from the tail
    /// (smallest first). Splices the run out and returns its first page.
    pub fn take_run(&mut self, count: usize) -> Option<Pgno> {
        if count == 0 || self.ids.len() < count {
            return None;
        }
        if count == 1 {
            return self.ids.pop();
        }
        // Descending order: a run of n consecutive pages occupies n
        // adjacent slots with ids[i] == ids[i + n - 1] + n - 1.
        let n = self.ids.len();
        let mut i = n;
        while i >= count {
            let last = i - 1;
            let first = i - count;
            if self.ids[first] == self.ids[last] + (count as Pgno - 1) {
                let start = self.ids[last];
                self.ids.drain(first..i);
                return Some(start);
            }
            i -= 1;
        }
        None
    }

    /// Serialize as host-endian words: count, then ids in order.
    pub fn write_to(&self, out: &mut [u8]) -> Result<()> {
        let need = (self.ids.len() + 1) * 8;
        ensure!(
            out.len() >= need,
            "buffer too small for id list: {} < {}",
            out.len(),
            need
        );
        out[..8].copy_from_slice(&(self.ids.len() as u64).to_ne_bytes());
        for (i, id) in self.ids.iter().enumerate() {
            let at = (i + 1) * 8;
            out[at..at + 8].copy_from_slice(&id.to_ne_bytes());
        }
        Ok(())
    }

    pub fn serialized_len(&self) -> usize {
        (self.ids.len() + 1) * 8
    }

    /// Parse a serialized list, validating the count against the record.
    pub fn read_from(data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= 8, "id list record shorter than its count word");
        let count = u64::from_ne_bytes(data[..8].try_into().unwrap()) as usize;
        ensure!(
            data.len() >= (count + 1) * 8,
            "id list record truncated: {} ids, {} bytes",
            count,
            data.len()
        );
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let at = (i + 1) * 8;
            ids.push(Pgno::from_ne_bytes(data[at..at + 8].try_into().unwrap()));
        }
        Ok(Self { ids })
    }
}

/// One modified page (or overflow run) owned by a write transaction.
#[derive(Debug)]
pub struct DirtyPage {
    pub pgno: Pgno,
    /// Pages spanned by `buf`; 1 except for overflow runs.
    pub count: usize,
    pub buf: Box<[u8]>,
}

/// Modified pages of a write transaction, ordered by ascending pgno.
#[derive(Debug, Default)]
pub struct DirtyList {
    entries: Vec<DirtyPage>,
}

impl DirtyList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, pgno: Pgno) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.pgno.cmp(&pgno))
    }

    pub fn insert(&mut self, page: DirtyPage) -> Result<()> {
        ensure!(
            self.entries.len() < DIRTY_PAGES_MAX,
            "dirty list full ({} pages)",
            DIRTY_PAGES_MAX
        );
        match self.position(page.pgno) {
            Ok(_) => bail!("page {} already dirty", page.pgno),
            Err(at) => self.entries.insert(at, page),
        }
        Ok(())
    }

    pub fn get(&self, pgno: Pgno) -> Option<&DirtyPage> {
        self.position(pgno).ok().map(|at| &self.entries[at])
    }

    pub fn get_mut(&mut self, pgno: Pgno) -> Option<&mut DirtyPage> {
        match self.position(pgno) {
            Ok(at) => Some(&mut self.entries[at]),
            Err(_) => None,
        }
    }

    pub fn remove(&mut self, pgno: Pgno) -> Option<DirtyPage> {
        self.position(pgno).ok().map(|at| self.entries.remove(at))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirtyPage> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DirtyPage> + '_ {
        self.entries.drain(..)
    }

    /// Room left before the list refuses new pages.
    pub fn room(&self) -> usize {
        DIRTY_PAGES_MAX - self.entries.len()
    }
}
