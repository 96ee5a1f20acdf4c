//! # Configuration Constants
//!
//! This module centralizes the format and tuning constants for the store.
//! Constants that depend on each other are co-located and the relationships
//! are documented; derived values are enforced through compile-time
//! assertions so a change to one side cannot silently break the other.
//!
//! ## Dependency Graph
//!
//! ```text
//! MIN_PAGE_SIZE (512) .. MAX_PAGE_SIZE (32768)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │     lower/upper are absolute 16-bit offsets, so a page must
//!       │     fit in an i16-addressable range: MAX_PAGE_SIZE <= 0x8000.
//!       │
//!       └─> node_max(page_size) — the largest inline node; anything
//!             bigger goes to an overflow run or a duplicate sub-tree.
//!
//! MAX_KEY_SIZE (511)
//!       │
//!       └─> duplicate values are keys of a sub-tree, so they share
//!           this limit.
//!
//! DIRTY_PAGES_MAX (2^17)
//!       │
//!       └─> SPILL_DENOMINATOR (8): when the dirty list approaches its
//!           capacity, ~1/8 of it is flushed early.
//! ```

/// Page number type. 48 bits are addressable through branch nodes.
pub type Pgno = u64;

/// Transaction identifier, strictly increasing across commits.
pub type TxnId = u64;

/// Reserved page number meaning "no page".
pub const INVALID_PGNO: Pgno = !0;

/// Branch nodes store child page numbers in 48 bits.
pub const MAX_PGNO: Pgno = 1 << 48;

/// Magic number of the data file. Stored host-endian, so it doubles as a
/// byte-order check when a file travels between machines.
pub const DATA_MAGIC: u32 = 0xBEEF_C0DE;

/// On-disk format version of the data file.
pub const DATA_VERSION: u32 = 1;

/// Magic number of the lock file.
pub const LOCK_MAGIC: u32 = 0xBEEF_C0DE;

/// Version of the lock-file format, folded into the format fingerprint.
pub const LOCK_VERSION: u32 = 2;

/// Size of the fixed page header preceding every page's payload.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of the fixed node header preceding key and data bytes.
pub const NODE_HEADER_SIZE: usize = 8;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. `lower`/`upper` in the page header are
/// absolute 16-bit offsets, so pages cannot exceed 32 KiB.
pub const MAX_PAGE_SIZE: usize = 0x8000;

/// Page size used when creating a new environment without an override.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// The first two pages of the data file are the alternating meta pages.
pub const NUM_METAS: usize = 2;

/// Tree slots always present in a transaction: the free tree and the main
/// tree, in that order.
pub const CORE_TREES: usize = 2;
pub const FREE_TREE: usize = 0;
pub const MAIN_TREE: usize = 1;

/// Hard limit on key length, shared by duplicate values (they become keys
/// of a duplicate sub-tree).
pub const MAX_KEY_SIZE: usize = 511;

/// Largest value storable in a non-duplicate tree.
pub const MAX_DATA_SIZE: usize = u32::MAX as usize;

/// Minimum number of keys on a branch page (the root may go lower while
/// the tree collapses).
pub const MIN_BRANCH_KEYS: usize = 2;

/// Pages whose fill drops below this (in thousandths) are rebalanced.
pub const FILL_THRESHOLD: usize = 250;

/// Default size of the data memory map.
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024;

/// Default number of reader slots in the lock file.
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Capacity of the write transaction's dirty list.
pub const DIRTY_PAGES_MAX: usize = 1 << 17;

/// Fraction of the dirty list flushed when it approaches capacity.
pub const SPILL_DENOMINATOR: usize = 8;

/// The allocator gives up a contiguous-run search after reading this many
/// free-tree records per requested page, to bound scans of a badly
/// fragmented free set.
pub const RECLAIM_SCAN_BUDGET: usize = 60;

/// Commit groups contiguous dirty pages into one positioned vectored
/// write, bounded by this many pages and bytes per call.
pub const COMMIT_GROUP_PAGES: usize = 64;
pub const COMMIT_GROUP_BYTES: usize = 1 << 30;

/// Deepest supported tree. 32 levels of even minimally-filled branch pages
/// exceed the 48-bit page-number space many times over.
pub const CURSOR_MAX_DEPTH: usize = 32;

/// Largest node (header + key + data) kept inline on a leaf page. Bigger
/// data moves to an overflow run; bigger duplicate sets become sub-trees.
pub const fn node_max(page_size: usize) -> usize {
    ((page_size - PAGE_HEADER_SIZE) / MIN_BRANCH_KEYS) & !1
}

/// Effective key-length limit for a page size: the compile-time cap, or
/// less on small pages where a maximal key would not leave room for a
/// tree record beside it in one node.
pub const fn max_key_for(page_size: usize) -> usize {
    let by_page = node_max(page_size) - NODE_HEADER_SIZE - 48;
    if by_page < MAX_KEY_SIZE {
        by_page
    } else {
        MAX_KEY_SIZE
    }
}

/// Number of page-number entries of a free-tree record that fit on a
/// single page; records reserved for leftover reclaimed pages are split at
/// this bound.
pub const fn max_free_entries_1pg(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / std::mem::size_of::<Pgno>() - 1
}

/// Number of pages in an overflow run holding `size` bytes of data.
pub const fn overflow_pages(size: usize, page_size: usize) -> usize {
    (PAGE_HEADER_SIZE - 1 + size) / page_size + 1
}

const _: () = assert!(MAX_PAGE_SIZE <= 0x8000, "lower/upper are 16-bit offsets");
const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two() && MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_PAGE_SIZE >= PAGE_HEADER_SIZE * 4);
const _: () = assert!(max_key_for(MIN_PAGE_SIZE) > 0);
const _: () = assert!(max_key_for(DEFAULT_PAGE_SIZE) == MAX_KEY_SIZE);
const _: () = assert!(MAX_KEY_SIZE < u16::MAX as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_max_is_half_the_payload_rounded_even() {
        assert_eq!(node_max(4096), (4096 - 16) / 2 & !1);
        assert_eq!(node_max(4096) % 2, 0);
    }

    #[test]
    fn overflow_pages_counts_header_of_first_page() {
        // 4096-byte pages: 4080 payload bytes in the first page.
        assert_eq!(overflow_pages(1, 4096), 1);
        assert_eq!(overflow_pages(4080, 4096), 1);
        assert_eq!(overflow_pages(4081, 4096), 2);
        assert_eq!(overflow_pages(5000, 4096), 2);
    }

    #[test]
    fn free_record_capacity_leaves_room_for_count_word() {
        assert_eq!(max_free_entries_1pg(4096), (4096 - 16) / 8 - 1);
    }
}
