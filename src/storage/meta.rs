//! # Meta Pages and Tree Records
//!
//! The first two pages of the data file are the alternating meta pages.
//! The transaction committing id `N` rewrites meta page `N mod 2`, so the
//! newer of the two (larger txnid) is the current snapshot root and the
//! other one still describes the previous committed snapshot. Writing the
//! meta body is the commit point: everything else a transaction wrote is
//! unreachable until this single write lands.
//!
//! ## Meta Body Layout (after the 16-byte page header)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       4     magic        Host-endian magic / byte-order check
//! 4       4     version      Data-format version
//! 8       8     fixmap_addr  Reserved fixed mapping address (always 0)
//! 16      8     map_size     Size of the data map at commit time
//! 24      48    trees[0]     Free-tree record
//! 72      48    trees[1]     Main-tree record
//! 120     8     last_pgno    Highest page number in use
//! 128     8     txnid        Transaction that committed this meta
//! ```
//!
//! The page size of the file is recorded in the free-tree record's
//! fixed-key-size field, which is otherwise meaningless for the free tree.
//!
//! ## Tree Record (48 bytes)
//!
//! A tree record fully describes one B+tree: its flags, depth, page
//! counts, entry count, and root page. Two live in every meta; named
//! trees store theirs as the data of a node in the main tree.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{Pgno, TxnId, DATA_MAGIC, DATA_VERSION, INVALID_PGNO, PAGE_HEADER_SIZE};

use super::page::PageHeader;
use super::{U16, U32, U64};

pub const TREE_RECORD_SIZE: usize = 48;
pub const META_BODY_SIZE: usize = 136;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreeRecord {
    fixed_ksize: U32,
    flags: U16,
    depth: U16,
    branch_pages: U64,
    leaf_pages: U64,
    overflow_pages: U64,
    entries: U64,
    root: U64,
}

const _: () = assert!(std::mem::size_of::<TreeRecord>() == TREE_RECORD_SIZE);

impl TreeRecord {
    pub fn new(flags: u16) -> Self {
        Self {
            fixed_ksize: U32::new(0),
            flags: U16::new(flags),
            depth: U16::new(0),
            branch_pages: U64::new(0),
            leaf_pages: U64::new(0),
            overflow_pages: U64::new(0),
            entries: U64::new(0),
            root: U64::new(INVALID_PGNO),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        super::parse_zerocopy(data, "TreeRecord")
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        Self::from_bytes(data).map(|r| *r)
    }

    pub fn write_to(&self, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() >= TREE_RECORD_SIZE,
            "buffer too small for TreeRecord: {} < {}",
            out.len(),
            TREE_RECORD_SIZE
        );
        out[..TREE_RECORD_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn fixed_ksize(&self) -> usize {
        self.fixed_ksize.get() as usize
    }

    pub fn set_fixed_ksize(&mut self, ksize: usize) {
        self.fixed_ksize = U32::new(ksize as u32);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn depth(&self) -> usize {
        self.depth.get() as usize
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.depth = U16::new(depth as u16);
    }

    pub fn branch_pages(&self) -> u64 {
        self.branch_pages.get()
    }

    pub fn add_branch_pages(&mut self, delta: i64) {
        self.branch_pages = U64::new(self.branch_pages.get().wrapping_add_signed(delta));
    }

    pub fn leaf_pages(&self) -> u64 {
        self.leaf_pages.get()
    }

    pub fn add_leaf_pages(&mut self, delta: i64) {
        self.leaf_pages = U64::new(self.leaf_pages.get().wrapping_add_signed(delta));
    }

    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.get()
    }

    pub fn add_overflow_pages(&mut self, delta: i64) {
        self.overflow_pages = U64::new(self.overflow_pages.get().wrapping_add_signed(delta));
    }

    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    pub fn set_entries(&mut self, entries: u64) {
        self.entries = U64::new(entries);
    }

    pub fn add_entries(&mut self, delta: i64) {
        self.entries = U64::new(self.entries.get().wrapping_add_signed(delta));
    }

    pub fn root(&self) -> Pgno {
        self.root.get()
    }

    pub fn set_root(&mut self, root: Pgno) {
        self.root = U64::new(root);
    }

    pub fn is_empty(&self) -> bool {
        self.root.get() == INVALID_PGNO
    }

    /// Total pages referenced by this tree.
    pub fn total_pages(&self) -> u64 {
        self.branch_pages() + self.leaf_pages() + self.overflow_pages()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaBody {
    magic: U32,
    version: U32,
    fixmap_addr: U64,
    map_size: U64,
    trees: [TreeRecord; 2],
    last_pgno: U64,
    txnid: U64,
}

const _: () = assert!(std::mem::size_of::<MetaBody>() == META_BODY_SIZE);

impl MetaBody {
    /// Body of a freshly created environment: both trees empty, the first
    /// usable page right behind the meta pages.
    pub fn fresh(page_size: usize, map_size: usize) -> Self {
        let mut free = TreeRecord::new(0);
        free.set_fixed_ksize(page_size);
        Self {
            magic: U32::new(DATA_MAGIC),
            version: U32::new(DATA_VERSION),
            fixmap_addr: U64::new(0),
            map_size: U64::new(map_size as u64),
            trees: [free, TreeRecord::new(0)],
            last_pgno: U64::new(crate::config::NUM_METAS as u64 - 1),
            txnid: U64::new(0),
        }
    }

    /// Parse and validate the body embedded in a full meta page.
    pub fn from_page(page: &[u8]) -> Result<&Self> {
        let hdr = PageHeader::from_bytes(page)?;
        ensure!(
            hdr.is_set(super::page::P_META),
            "page {} is not a meta page (flags {:#06x})",
            hdr.pgno(),
            hdr.flags()
        );
        let body: &Self = super::parse_zerocopy(&page[PAGE_HEADER_SIZE..], "MetaBody")?;
        body.validate()?;
        Ok(body)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic.get() == DATA_MAGIC,
            "bad magic {:#010x} (byte order mismatch or not a database file)",
            self.magic.get()
        );
        ensure!(
            self.version.get() == DATA_VERSION,
            "unsupported data version {} (expected {})",
            self.version.get(),
            DATA_VERSION
        );
        Ok(())
    }

    pub fn map_size(&self) -> usize {
        self.map_size.get() as usize
    }

    pub fn set_map_size(&mut self, size: usize) {
        self.map_size = U64::new(size as u64);
    }

    /// Page size travels in the free-tree record's fixed-key-size field.
    pub fn page_size(&self) -> usize {
        self.trees[0].fixed_ksize()
    }

    pub fn tree(&self, which: usize) -> &TreeRecord {
        &self.trees[which]
    }

    pub fn set_tree(&mut self, which: usize, record: TreeRecord) {
        // The free slot's fixed_ksize carries the page size; never let a
        // record update clobber it.
        let psize = self.page_size();
        self.trees[which] = record;
        if which == 0 {
            self.trees[0].set_fixed_ksize(psize);
        }
    }

    pub fn last_pgno(&self) -> Pgno {
        self.last_pgno.get()
    }

    pub fn set_last_pgno(&mut self, pgno: Pgno) {
        self.last_pgno = U64::new(pgno);
    }

    pub fn txnid(&self) -> TxnId {
        self.txnid.get()
    }

    pub fn set_txnid(&mut self, txnid: TxnId) {
        self.txnid = U64::new(txnid);
    }
}

/// Choose between the two meta bodies: the newer one normally, the older
/// one when opening the previous snapshot.
pub fn pick(a: &MetaBody, b: &MetaBody, previous: bool) -> usize {
    let newer = if a.txnid() > b.txnid() { 0 } else { 1 };
    if previous {
        1 - newer
    } else {
        newer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_METAS;
    use crate::storage::page::P_META;

    #[test]
    fn record_and_body_sizes_are_fixed() {
        assert_eq!(std::mem::size_of::<TreeRecord>(), 48);
        assert_eq!(std::mem::size_of::<MetaBody>(), 136);
    }

    #[test]
    fn fresh_meta_has_empty_trees() {
        let meta = MetaBody::fresh(4096, 1 << 20);

        assert_eq!(meta.txnid(), 0);
        assert_eq!(meta.page_size(), 4096);
        assert_eq!(meta.last_pgno(), NUM_METAS as u64 - 1);
        assert!(meta.tree(0).is_empty());
        assert!(meta.tree(1).is_empty());
        assert_eq!(meta.tree(1).depth(), 0);
        meta.validate().unwrap();
    }

    #[test]
    fn set_tree_preserves_recorded_page_size() {
        let mut meta = MetaBody::fresh(8192, 1 << 20);
        let mut rec = TreeRecord::new(0);
        rec.set_root(7);

        meta.set_tree(0, rec);

        assert_eq!(meta.tree(0).root(), 7);
        assert_eq!(meta.page_size(), 8192);
    }

    #[test]
    fn validate_rejects_foreign_magic() {
        let mut meta = MetaBody::fresh(4096, 1 << 20);
        meta.magic = U32::new(0x1234_5678);

        let err = meta.validate().unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn from_page_requires_meta_kind() {
        let mut page = vec![0u8; 4096];
        {
            let hdr = PageHeader::from_bytes_mut(&mut page).unwrap();
            hdr.set_flags(P_META);
        }
        let body = MetaBody::fresh(4096, 1 << 20);
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_BODY_SIZE]
            .copy_from_slice(body.as_bytes());

        assert!(MetaBody::from_page(&page).is_ok());

        PageHeader::from_bytes_mut(&mut page).unwrap().set_flags(0);
        assert!(MetaBody::from_page(&page).is_err());
    }

    #[test]
    fn pick_prefers_larger_txnid() {
        let mut a = MetaBody::fresh(4096, 1 << 20);
        let mut b = MetaBody::fresh(4096, 1 << 20);
        a.set_txnid(4);
        b.set_txnid(5);

        assert_eq!(pick(&a, &b, false), 1);
        assert_eq!(pick(&a, &b, true), 0);
    }
}
