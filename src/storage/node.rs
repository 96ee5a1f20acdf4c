//! # Node Codec
//!
//! Nodes are the entries of branch and leaf pages. Each node is addressed
//! through the page's offset array and starts with an 8-byte header,
//! followed immediately by the key bytes and, on leaves, the data bytes.
//!
//! ## Node Header Layout (8 bytes)
//!
//! ```text
//! Offset  Size  Field   Leaf meaning              Branch meaning
//! ------  ----  ------  ------------------------  -----------------------
//! 0       2     lo      data size, low 16 bits    child pgno, bits 0-15
//! 2       2     hi      data size, high 16 bits   child pgno, bits 16-31
//! 4       2     flags   node flags                child pgno, bits 32-47
//! 6       2     ksize   key length                key length
//! ```
//!
//! Branch pages therefore address at most 2^48 pages, and branch nodes
//! carry no flags. Nodes are kept 2-byte aligned by rounding every node
//! size up to even.
//!
//! ## Leaf Node Flags
//!
//! A leaf node's data field is interpreted according to its flags:
//!
//! - `N_OVERFLOW`: the data bytes are the 8-byte page number of an
//!   overflow run; `lo`/`hi` still carry the logical data size.
//! - `N_SUB_TREE`: the data bytes are a 48-byte tree record (a named tree
//!   or a promoted duplicate tree).
//! - `N_DUP`: the key has multiple values; data is a leaf-shaped sub-page,
//!   or combined with `N_SUB_TREE` a tree record for a duplicate tree.
//!
//! ## Insertion and Deletion
//!
//! `insert_node` shifts the offset array up by one slot, claims the node's
//! body from the top of the free gap (`upper` moves down), and writes
//! header, key, and data. `delete_node` is the inverse: it compacts the
//! heap in place by sliding every body below the removed one upward and
//! rewriting the offsets that pointed into the moved region.
//!
//! Callers check `size_left` before inserting; running out of space here
//! is reported as corruption, not as a split request.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{Pgno, NODE_HEADER_SIZE, PAGE_HEADER_SIZE};

use super::page::{self, PageHeader};
use super::U16;

/// Data bytes are the page number of an overflow run.
pub const N_OVERFLOW: u16 = 0x01;
/// Data bytes are a 48-byte tree record.
pub const N_SUB_TREE: u16 = 0x02;
/// The key has duplicate values stored in a sub-page or sub-tree.
pub const N_DUP: u16 = 0x04;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    lo: U16,
    hi: U16,
    flags: U16,
    ksize: U16,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Round a node size up to the 2-byte alignment every node keeps.
pub const fn even(n: usize) -> usize {
    (n + 1) & !1
}

/// Size an inline leaf node will occupy, excluding its offset slot.
pub const fn leaf_node_size(key_len: usize, data_len: usize) -> usize {
    even(NODE_HEADER_SIZE + key_len + data_len)
}

/// Size a branch node will occupy, excluding its offset slot.
pub const fn branch_node_size(key_len: usize) -> usize {
    even(NODE_HEADER_SIZE + key_len)
}

/// What to store in a freshly inserted node.
#[derive(Debug, Clone, Copy)]
pub enum NodeBody<'a> {
    /// Inline leaf data.
    Leaf { flags: u16, data: &'a [u8] },
    /// Inline leaf data of a given length, left uninitialized for the
    /// caller to fill through `data_mut`.
    LeafReserve { flags: u16, len: usize },
    /// Data lives on an overflow run; the node stores the run's first
    /// page number and remembers the logical data length.
    LeafOverflow { flags: u16, data_len: usize, pgno: Pgno },
    /// Branch entry pointing at a child page.
    Branch { child: Pgno },
}

impl NodeBody<'_> {
    /// Bytes the node body will occupy on the page for this content.
    pub fn node_size(&self, key_len: usize) -> usize {
        match *self {
            NodeBody::Leaf { data, .. } => leaf_node_size(key_len, data.len()),
            NodeBody::LeafReserve { len, .. } => leaf_node_size(key_len, len),
            NodeBody::LeafOverflow { .. } => leaf_node_size(key_len, std::mem::size_of::<Pgno>()),
            NodeBody::Branch { .. } => branch_node_size(key_len),
        }
    }
}

/// Read-only view of one node. Resolves lazily against the page slice so
/// key and data reads borrow the page, not the view.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    page: &'a [u8],
    offset: usize,
}

impl<'a> Node<'a> {
    pub fn at(page: &'a [u8], index: usize) -> Result<Self> {
        let offset = page::node_offset(page, index)?;
        ensure!(
            offset >= PAGE_HEADER_SIZE && offset + NODE_HEADER_SIZE <= page.len(),
            "node offset {} outside page (len={})",
            offset,
            page.len()
        );
        Ok(Self { page, offset })
    }

    fn header(&self) -> &'a NodeHeader {
        // at() checked the range
        NodeHeader::ref_from_bytes(&self.page[self.offset..self.offset + NODE_HEADER_SIZE]).unwrap()
    }

    pub fn flags(&self) -> u16 {
        self.header().flags.get()
    }

    pub fn is_set(&self, flags: u16) -> bool {
        self.flags() & flags != 0
    }

    pub fn key_len(&self) -> usize {
        self.header().ksize.get() as usize
    }

    pub fn key(&self) -> &'a [u8] {
        let start = self.offset + NODE_HEADER_SIZE;
        &self.page[start..start + self.key_len()]
    }

    /// Logical data length of a leaf node. For overflow nodes this is the
    /// value's length, not the 8 bytes stored inline.
    pub fn data_len(&self) -> usize {
        let hdr = self.header();
        hdr.lo.get() as usize | (hdr.hi.get() as usize) << 16
    }

    /// Inline data bytes of a leaf node.
    pub fn data(&self) -> Result<&'a [u8]> {
        let start = self.offset + NODE_HEADER_SIZE + self.key_len();
        let len = if self.is_set(N_OVERFLOW) {
            std::mem::size_of::<Pgno>()
        } else {
            self.data_len()
        };
        ensure!(
            start + len <= self.page.len(),
            "node data [{}, {}) extends past page end {}",
            start,
            start + len,
            self.page.len()
        );
        Ok(&self.page[start..start + len])
    }

    /// First page of the overflow run of an `N_OVERFLOW` node.
    pub fn overflow_pgno(&self) -> Result<Pgno> {
        ensure!(self.is_set(N_OVERFLOW), "node has no overflow run");
        let raw = self.data()?;
        Ok(Pgno::from_ne_bytes(raw.try_into().unwrap()))
    }

    /// Child page number of a branch node (48-bit).
    pub fn child(&self) -> Pgno {
        let hdr = self.header();
        hdr.lo.get() as Pgno | (hdr.hi.get() as Pgno) << 16 | (hdr.flags.get() as Pgno) << 32
    }

    /// Bytes this node occupies on its page, offset slot excluded.
    pub fn on_page_size(&self, branch: bool) -> usize {
        if branch {
            branch_node_size(self.key_len())
        } else if self.is_set(N_OVERFLOW) {
            leaf_node_size(self.key_len(), std::mem::size_of::<Pgno>())
        } else {
            leaf_node_size(self.key_len(), self.data_len())
        }
    }
}

fn header_mut(page: &mut [u8], index: usize) -> Result<(&mut NodeHeader, usize)> {
    let offset = page::node_offset(page, index)?;
    ensure!(
        offset + NODE_HEADER_SIZE <= page.len(),
        "node offset {} outside page (len={})",
        offset,
        page.len()
    );
    let hdr = NodeHeader::mut_from_bytes(&mut page[offset..offset + NODE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to map NodeHeader: {:?}", e))?;
    Ok((hdr, offset))
}

/// Rewrite the logical data size of a leaf node.
pub fn set_data_len(page: &mut [u8], index: usize, len: usize) -> Result<()> {
    let (hdr, _) = header_mut(page, index)?;
    hdr.lo = U16::new((len & 0xFFFF) as u16);
    hdr.hi = U16::new((len >> 16) as u16);
    Ok(())
}

/// Repoint a branch node at a different child page.
pub fn set_child(page: &mut [u8], index: usize, child: Pgno) -> Result<()> {
    let (hdr, _) = header_mut(page, index)?;
    hdr.lo = U16::new((child & 0xFFFF) as u16);
    hdr.hi = U16::new((child >> 16 & 0xFFFF) as u16);
    hdr.flags = U16::new((child >> 32 & 0xFFFF) as u16);
    Ok(())
}

/// Mutable access to the inline data bytes of a leaf node.
pub fn data_mut(page: &mut [u8], index: usize) -> Result<&mut [u8]> {
    let node = Node::at(page, index)?;
    let start = node.offset + NODE_HEADER_SIZE + node.key_len();
    let len = if node.is_set(N_OVERFLOW) {
        std::mem::size_of::<Pgno>()
    } else {
        node.data_len()
    };
    ensure!(
        start + len <= page.len(),
        "node data [{}, {}) extends past page end {}",
        start,
        start + len,
        page.len()
    );
    Ok(&mut page[start..start + len])
}

/// Insert a node at `index`, shifting higher offsets up by one.
///
/// The caller has verified there is room; failure here means the page
/// bookkeeping is corrupt.
pub fn insert_node(page: &mut [u8], index: usize, key: &[u8], body: NodeBody) -> Result<()> {
    let size = body.node_size(key.len());
    let (num_keys, lower, upper) = {
        let hdr = PageHeader::from_bytes(page)?;
        (hdr.num_keys(), hdr.lower(), hdr.upper())
    };
    ensure!(index <= num_keys, "insert index {} > num_keys {}", index, num_keys);
    ensure!(
        upper - lower >= size + 2,
        "page {} overfull: need {} bytes, {} left",
        PageHeader::from_bytes(page)?.pgno(),
        size + 2,
        upper - lower
    );

    // Open a slot in the offset array.
    let slot = PAGE_HEADER_SIZE + index * 2;
    page.copy_within(slot..PAGE_HEADER_SIZE + num_keys * 2, slot + 2);

    let at = upper - size;
    {
        let hdr =
            NodeHeader::mut_from_bytes(&mut page[at..at + NODE_HEADER_SIZE]).unwrap();
        hdr.ksize = U16::new(key.len() as u16);
        match body {
            NodeBody::Leaf { flags, data } => {
                hdr.lo = U16::new((data.len() & 0xFFFF) as u16);
                hdr.hi = U16::new((data.len() >> 16) as u16);
                hdr.flags = U16::new(flags);
            }
            NodeBody::LeafReserve { flags, len } => {
                hdr.lo = U16::new((len & 0xFFFF) as u16);
                hdr.hi = U16::new((len >> 16) as u16);
                hdr.flags = U16::new(flags);
            }
            NodeBody::LeafOverflow { flags, data_len, .. } => {
                hdr.lo = U16::new((data_len & 0xFFFF) as u16);
                hdr.hi = U16::new((data_len >> 16) as u16);
                hdr.flags = U16::new(flags | N_OVERFLOW);
            }
            NodeBody::Branch { child } => {
                hdr.lo = U16::new((child & 0xFFFF) as u16);
                hdr.hi = U16::new((child >> 16 & 0xFFFF) as u16);
                hdr.flags = U16::new((child >> 32 & 0xFFFF) as u16);
            }
        }
    }
    let key_at = at + NODE_HEADER_SIZE;
    page[key_at..key_at + key.len()].copy_from_slice(key);
    match body {
        NodeBody::Leaf { data, .. } => {
            let data_at = key_at + key.len();
            page[data_at..data_at + data.len()].copy_from_slice(data);
        }
        NodeBody::LeafOverflow { pgno, .. } => {
            let data_at = key_at + key.len();
            page[data_at..data_at + 8].copy_from_slice(&pgno.to_ne_bytes());
        }
        NodeBody::LeafReserve { .. } | NodeBody::Branch { .. } => {}
    }

    page::set_node_offset(page, index, at);
    let hdr = PageHeader::from_bytes_mut(page)?;
    hdr.set_lower(lower + 2);
    hdr.set_upper(at);
    Ok(())
}

/// Remove the node at `index`, compacting the body heap in place.
pub fn delete_node(page: &mut [u8], index: usize) -> Result<()> {
    let (num_keys, lower, upper, branch) = {
        let hdr = PageHeader::from_bytes(page)?;
        (hdr.num_keys(), hdr.lower(), hdr.upper(), hdr.is_branch())
    };
    ensure!(index < num_keys, "delete index {} >= num_keys {}", index, num_keys);

    let node = Node::at(page, index)?;
    let size = node.on_page_size(branch);
    let removed_at = node.offset;

    // Rewrite offsets: drop the removed slot, and shift every offset that
    // pointed below the removed body up by its size.
    for i in 0..num_keys - 1 {
        let src = if i < index { i } else { i + 1 };
        let mut off = page::node_offset(page, src)?;
        if off < removed_at {
            off += size;
        }
        page::set_node_offset(page, i, off);
    }

    // Slide the bodies below the removed one upward.
    page.copy_within(upper..removed_at, upper + size);

    let hdr = PageHeader::from_bytes_mut(page)?;
    hdr.set_lower(lower - 2);
    hdr.set_upper(upper + size);
    Ok(())
}

/// Insert a key into a fixed-key leaf, keeping the array packed.
pub fn insert_fixed_key(page: &mut [u8], index: usize, key: &[u8]) -> Result<()> {
    let (num_keys, lower, upper, ksize) = {
        let hdr = PageHeader::from_bytes(page)?;
        (hdr.num_keys(), hdr.lower(), hdr.upper(), hdr.fixed_ksize())
    };
    ensure!(key.len() == ksize, "fixed key size {} != {}", key.len(), ksize);
    ensure!(index <= num_keys, "insert index {} > num_keys {}", index, num_keys);
    ensure!(upper - lower >= ksize, "fixed-key page overfull");

    let at = PAGE_HEADER_SIZE + index * ksize;
    page.copy_within(at..PAGE_HEADER_SIZE + num_keys * ksize, at + ksize);
    page[at..at + ksize].copy_from_slice(key);

    // Each key costs ksize bytes in total; lower's share is the 2-byte
    // count step, upper absorbs the rest (negative for 1-byte keys).
    let hdr = PageHeader::from_bytes_mut(page)?;
    hdr.set_lower(lower + 2);
    hdr.set_upper((upper as isize - (ksize as isize - 2)) as usize);
    Ok(())
}

/// Remove a key from a fixed-key leaf.
pub fn delete_fixed_key(page: &mut [u8], index: usize) -> Result<()> {
    let (num_keys, lower, upper, ksize) = {
        let hdr = PageHeader::from_bytes(page)?;
        (hdr.num_keys(), hdr.lower(), hdr.upper(), hdr.fixed_ksize())
    };
    ensure!(index < num_keys, "delete index {} >= num_keys {}", index, num_keys);

    let at = PAGE_HEADER_SIZE + index * ksize;
    page.copy_within(at + ksize..PAGE_HEADER_SIZE + num_keys * ksize, at);

    let hdr = PageHeader::from_bytes_mut(page)?;
    hdr.set_lower(lower - 2);
    hdr.set_upper((upper as isize + (ksize as isize - 2)) as usize);
    Ok(())
}

/// Key at `index` of any leaf kind, fixed or slotted.
pub fn leaf_key<'a>(page: &'a [u8], index: usize) -> Result<&'a [u8]> {
    let hdr = PageHeader::from_bytes(page)?;
    if hdr.is_fixed_leaf() {
        let ksize = hdr.fixed_ksize();
        ensure!(
            index < hdr.num_keys(),
            "key index {} out of bounds (num_keys={})",
            index,
            hdr.num_keys()
        );
        Ok(page::fixed_key(page, index, ksize))
    } else {
        Ok(Node::at(page, index)?.key())
    }
}

/// Copy of the key at `index`, for paths that must outlive the page borrow.
pub fn leaf_key_owned(page: &[u8], index: usize) -> Result<Vec<u8>> {
    leaf_key(page, index).map(|k| k.to_vec())
}
