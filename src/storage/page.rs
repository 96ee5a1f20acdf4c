//! # Page Header Codec
//!
//! Every page of the data file begins with the same 16-byte header. The
//! header is read and written in place over memory-mapped or heap page
//! buffers through `zerocopy`, never deserialized into owned structs.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       8     pgno         Page number (free-link while loose in memory)
//! 8       2     fixed_ksize  Element size if this is a fixed-key leaf
//! 10      2     flags        Page kind bits plus transient bits
//! 12      2     lower        First free byte (offset array grows upward)
//! 14      2     upper        One past free space (node bodies grow downward)
//! ```
//!
//! On overflow pages the (`lower`, `upper`) pair is reinterpreted as one
//! 32-bit count of pages in the run.
//!
//! ## Heap Discipline
//!
//! Tree pages are slotted: a growing array of 2-byte node offsets sits
//! right after the header, node bodies are packed against the end of the
//! page, and (`lower`, `upper`) bound the free gap between them. All
//! offsets are absolute from the start of the page, which is why page
//! sizes are capped at 32 KiB.
//!
//! Duplicate sub-pages embedded inside a leaf node reuse this exact layout
//! over a smaller slice, so every accessor here takes the page as `&[u8]`
//! of whatever length and trusts `lower`/`upper` for bounds.
//!
//! ## Endianness
//!
//! All integers are host-endian: the file format is explicitly not
//! portable across byte orders and the magic number doubles as the
//! byte-order check. `zerocopy` native-endian wrappers keep the structs
//! `Unaligned` so they can sit at arbitrary mmap offsets.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{Pgno, PAGE_HEADER_SIZE};

use super::{U16, U64};

/// Interior page: nodes carry (key, child pgno).
pub const P_BRANCH: u16 = 0x01;
/// Terminal page: nodes carry (key, data).
pub const P_LEAF: u16 = 0x02;
/// Member of an overflow run holding one large value.
pub const P_OVERFLOW: u16 = 0x04;
/// One of the two alternating meta pages.
pub const P_META: u16 = 0x08;
/// Transient: page lives on the write transaction's dirty list.
pub const P_DIRTY: u16 = 0x10;
/// Leaf holding fixed-size keys packed without node headers.
pub const P_LEAF_FIXED: u16 = 0x20;
/// Leaf-shaped region embedded inside another page's node.
pub const P_SUB: u16 = 0x40;
/// Transient: dirtied then freed in the same transaction, reusable.
pub const P_LOOSE: u16 = 0x4000;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    pgno: U64,
    fixed_ksize: U16,
    flags: U16,
    lower: U16,
    upper: U16,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        super::parse_zerocopy(data, "PageHeader")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        super::parse_zerocopy_mut(data, "PageHeader")
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno.get()
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        self.pgno = U64::new(pgno);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn add_flags(&mut self, flags: u16) {
        self.flags = U16::new(self.flags.get() | flags);
    }

    pub fn clear_flags(&mut self, flags: u16) {
        self.flags = U16::new(self.flags.get() & !flags);
    }

    pub fn is_set(&self, flags: u16) -> bool {
        self.flags.get() & flags != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.is_set(P_LEAF)
    }

    pub fn is_fixed_leaf(&self) -> bool {
        self.is_set(P_LEAF_FIXED)
    }

    pub fn is_branch(&self) -> bool {
        self.is_set(P_BRANCH)
    }

    pub fn is_overflow(&self) -> bool {
        self.is_set(P_OVERFLOW)
    }

    pub fn is_sub(&self) -> bool {
        self.is_set(P_SUB)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_set(P_DIRTY)
    }

    /// Element size of a fixed-key leaf; zero elsewhere.
    pub fn fixed_ksize(&self) -> usize {
        self.fixed_ksize.get() as usize
    }

    pub fn set_fixed_ksize(&mut self, ksize: usize) {
        self.fixed_ksize = U16::new(ksize as u16);
    }

    pub fn lower(&self) -> usize {
        self.lower.get() as usize
    }

    pub fn set_lower(&mut self, lower: usize) {
        self.lower = U16::new(lower as u16);
    }

    pub fn upper(&self) -> usize {
        self.upper.get() as usize
    }

    pub fn set_upper(&mut self, upper: usize) {
        self.upper = U16::new(upper as u16);
    }

    /// Number of nodes (or fixed keys) on the page.
    pub fn num_keys(&self) -> usize {
        (self.lower() - PAGE_HEADER_SIZE) >> 1
    }

    /// Bytes remaining in the free gap.
    pub fn size_left(&self) -> usize {
        self.upper() - self.lower()
    }

    /// Space used, in thousandths of the page payload.
    pub fn fill(&self, page_size: usize) -> usize {
        let payload = page_size - PAGE_HEADER_SIZE;
        1000 * (payload - self.size_left()) / payload
    }

    /// Length of the overflow run starting at this page. Overlays the
    /// (`lower`, `upper`) pair.
    pub fn overflow_count(&self) -> usize {
        self.lower() | (self.upper() << 16)
    }

    pub fn set_overflow_count(&mut self, count: usize) {
        self.lower = U16::new((count & 0xFFFF) as u16);
        self.upper = U16::new((count >> 16) as u16);
    }

    /// Reset to an empty tree page spanning `size` bytes.
    pub fn init(&mut self, flags: u16, size: usize) {
        self.flags = U16::new(flags);
        self.fixed_ksize = U16::new(0);
        self.lower = U16::new(PAGE_HEADER_SIZE as u16);
        self.upper = U16::new(size as u16);
    }
}

/// Read the node-offset array entry at `index`.
pub fn node_offset(page: &[u8], index: usize) -> Result<usize> {
    let hdr = PageHeader::from_bytes(page)?;
    ensure!(
        index < hdr.num_keys(),
        "node index {} out of bounds (num_keys={}, page {})",
        index,
        hdr.num_keys(),
        hdr.pgno()
    );
    let at = PAGE_HEADER_SIZE + index * 2;
    Ok(u16::from_ne_bytes([page[at], page[at + 1]]) as usize)
}

pub fn set_node_offset(page: &mut [u8], index: usize, offset: usize) {
    let at = PAGE_HEADER_SIZE + index * 2;
    page[at..at + 2].copy_from_slice(&(offset as u16).to_ne_bytes());
}

/// Key slice at `index` of a fixed-key leaf.
pub fn fixed_key(page: &[u8], index: usize, ksize: usize) -> &[u8] {
    let at = PAGE_HEADER_SIZE + index * ksize;
    &page[at..at + ksize]
}

/// Structural validation of a tree page, used by cursors before trusting
/// a page read from the map.
pub fn validate_tree_page(page: &[u8], expect: u16) -> Result<()> {
    let hdr = PageHeader::from_bytes(page)?;
    ensure!(
        hdr.is_set(expect),
        "page {} has kind {:#06x}, expected {:#06x}",
        hdr.pgno(),
        hdr.flags(),
        expect
    );
    ensure!(
        hdr.lower() >= PAGE_HEADER_SIZE && hdr.lower() <= hdr.upper() && hdr.upper() <= page.len(),
        "page {} has corrupt bounds: lower={} upper={} len={}",
        hdr.pgno(),
        hdr.lower(),
        hdr.upper(),
        page.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 16);
    }

    #[test]
    fn init_resets_bounds_to_empty() {
        let mut buf = [0xFFu8; 64];
        let hdr = PageHeader::from_bytes_mut(&mut buf).unwrap();
        hdr.init(P_LEAF, 4096);

        assert!(hdr.is_leaf());
        assert_eq!(hdr.num_keys(), 0);
        assert_eq!(hdr.lower(), PAGE_HEADER_SIZE);
        assert_eq!(hdr.upper(), 4096);
        assert_eq!(hdr.size_left(), 4096 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn overflow_count_overlays_lower_and_upper() {
        let mut buf = [0u8; 16];
        let hdr = PageHeader::from_bytes_mut(&mut buf).unwrap();
        hdr.set_overflow_count(0x0003_0007);

        assert_eq!(hdr.overflow_count(), 0x0003_0007);
        assert_eq!(hdr.lower(), 0x0007);
        assert_eq!(hdr.upper(), 0x0003);
    }

    #[test]
    fn fill_is_zero_for_empty_page() {
        let mut buf = [0u8; 16];
        let hdr = PageHeader::from_bytes_mut(&mut buf).unwrap();
        hdr.init(P_LEAF, 4096);

        assert_eq!(hdr.fill(4096), 0);

        hdr.set_lower(PAGE_HEADER_SIZE + 2040);
        assert_eq!(hdr.fill(4096), 500);
    }

    #[test]
    fn node_offset_round_trip() {
        let mut page = vec![0u8; 512];
        let hdr = PageHeader::from_bytes_mut(&mut page).unwrap();
        hdr.init(P_LEAF, 512);
        hdr.set_lower(PAGE_HEADER_SIZE + 4);

        set_node_offset(&mut page, 0, 500);
        set_node_offset(&mut page, 1, 400);

        assert_eq!(node_offset(&page, 0).unwrap(), 500);
        assert_eq!(node_offset(&page, 1).unwrap(), 400);
        assert!(node_offset(&page, 2).is_err());
    }

    #[test]
    fn validate_rejects_kind_mismatch() {
        let mut page = vec![0u8; 512];
        PageHeader::from_bytes_mut(&mut page)
            .unwrap()
            .init(P_LEAF, 512);

        assert!(validate_tree_page(&page, P_LEAF).is_ok());
        let err = validate_tree_page(&page, P_BRANCH).unwrap_err();
        assert!(err.to_string().contains("kind"));
    }

    #[test]
    fn validate_rejects_crossed_bounds() {
        let mut page = vec![0u8; 512];
        {
            let hdr = PageHeader::from_bytes_mut(&mut page).unwrap();
            hdr.init(P_LEAF, 512);
            hdr.set_lower(400);
            hdr.set_upper(100);
        }

        let err = validate_tree_page(&page, P_LEAF).unwrap_err();
        assert!(err.to_string().contains("corrupt bounds"));
    }
}
