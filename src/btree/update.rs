//! # Tree Mutation
//!
//! Every mutation follows the same spine: position a cursor, flush part
//! of the dirty list if it is close to full, copy-on-write the page path,
//! apply the change, then re-derive the cursor position by key. Pages are
//! never edited through the map — the touch step guarantees every page on
//! the path is a heap buffer owned by the transaction.
//!
//! ## Split and Merge by Rebuild
//!
//! Structural changes (split, merge, borrow-one-node) collect a page's
//! nodes into owned entries, redistribute them, and rebuild the affected
//! pages from scratch. Rebuilding costs a memcpy per node but makes the
//! branch-page edge cases uniform: the implicit minus-infinity key at
//! index 0 is materialized from the parent separator whenever entries
//! change pages, and dropped again when a rebuilt page writes its first
//! entry.
//!
//! Split picks the index closest to the size midpoint (biased so both
//! halves satisfy the fill invariant); in append mode the new entry goes
//! alone onto the right sibling, which packs sorted bulk loads densely.
//! A page drops below a quarter full (or its minimum key count) and the
//! rebalancer either borrows one node from the fuller neighbor or merges
//! with it, recursing up when the parent underflows; a branch root left
//! with a single child is collapsed into it.
//!
//! ## Duplicates
//!
//! A key's second value converts its node into an embedded sub-page; an
//! embedded sub-page that outgrows the largest inline node is promoted
//! into a duplicate sub-tree whose 48-byte record replaces the node data.
//! Duplicate values are keys inside the sub-structure (data parts are
//! empty), so they share the key size limit, and fixed-size mode packs
//! them on fixed-key leaves without per-node headers.
//!
//! ## Large Values
//!
//! A value that would not leave room for two nodes per page is written to
//! a run of contiguous overflow pages; the leaf node keeps the run's
//! first page number and the logical length. Overwrites reuse a run in
//! place when it is long enough and owned by this transaction.

use eyre::{bail, ensure, Result};
use zerocopy::IntoBytes;

use crate::config::{
    node_max, overflow_pages, Pgno, CURSOR_MAX_DEPTH, FILL_THRESHOLD, INVALID_PGNO, MAIN_TREE,
    MAX_DATA_SIZE, MIN_BRANCH_KEYS, NODE_HEADER_SIZE, PAGE_HEADER_SIZE,
};
use crate::storage::meta::{TreeRecord, TREE_RECORD_SIZE};
use crate::storage::node::{self, Node, NodeBody, N_DUP, N_OVERFLOW, N_SUB_TREE};
use crate::storage::page::{self, PageHeader, P_BRANCH, P_DIRTY, P_LEAF, P_LEAF_FIXED, P_SUB};
use crate::txn::{RwTxn, TxnStore};

use super::cursor::{self, CursorPos, CursorState, PathStack, Target};
use super::{
    Comparator, APPEND, APPEND_DUP, CURRENT, DUP_FIXED, DUP_SORT, INTEGER_DUP, INTEGER_KEY,
    NO_DUP_DATA, NO_OVERWRITE,
};

/// Record under mutation; synced back to its owner (transaction tree
/// table or parent node) by the orchestrating function.
struct OpCtx {
    record: TreeRecord,
}

/// Benign failures leave the transaction usable; everything else poisons
/// it.
pub(crate) fn is_benign(err: &eyre::Report) -> bool {
    let msg = err.to_string();
    msg.contains("key already exists")
        || msg.contains("not found")
        || msg.contains("appended in order")
        || msg.contains("named tree")
}

// ---------------------------------------------------------------------
// Owned page images
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum OwnedBody {
    Leaf {
        flags: u16,
        data: Vec<u8>,
        /// Logical data length; differs from `data.len()` for overflow
        /// nodes, whose inline bytes are the run's page number.
        logical: usize,
    },
    Branch {
        child: Pgno,
    },
    Fixed,
}

#[derive(Debug, Clone)]
struct OwnedNode {
    key: Vec<u8>,
    body: OwnedBody,
}

impl OwnedNode {
    /// On-page footprint including the offset slot.
    fn cost(&self, fixed_ksize: usize) -> usize {
        match &self.body {
            OwnedBody::Leaf { data, .. } => node::leaf_node_size(self.key.len(), data.len()) + 2,
            OwnedBody::Branch { .. } => node::branch_node_size(self.key.len()) + 2,
            OwnedBody::Fixed => fixed_ksize,
        }
    }

    fn as_body(&self) -> NodeBody<'_> {
        match &self.body {
            OwnedBody::Leaf { flags, data, logical } => {
                if flags & N_OVERFLOW != 0 {
                    NodeBody::LeafOverflow {
                        flags: flags & !N_OVERFLOW,
                        data_len: *logical,
                        pgno: Pgno::from_ne_bytes(data[..8].try_into().unwrap()),
                    }
                } else {
                    NodeBody::Leaf { flags: *flags, data }
                }
            }
            OwnedBody::Branch { child } => NodeBody::Branch { child: *child },
            OwnedBody::Fixed => unreachable!("fixed keys are inserted through insert_fixed_key"),
        }
    }
}

#[derive(Debug)]
struct PageImage {
    entries: Vec<OwnedNode>,
    flags: u16,
    fixed_ksize: usize,
}

impl PageImage {
    fn is_branch(&self) -> bool {
        self.flags & P_BRANCH != 0
    }

    fn is_fixed(&self) -> bool {
        self.flags & P_LEAF_FIXED != 0
    }

    fn total_cost(&self) -> usize {
        self.entries.iter().map(|e| e.cost(self.fixed_ksize)).sum()
    }
}

/// Read every node of a page (or embedded sub-page slice) into owned
/// form. For branch pages `node0_key` materializes the implicit first
/// separator when the entries may change pages.
fn collect_slice(pg: &[u8], node0_key: Option<&[u8]>) -> Result<PageImage> {
    let hdr = PageHeader::from_bytes(pg)?;
    let flags = hdr.flags();
    let fixed_ksize = hdr.fixed_ksize();
    let n = hdr.num_keys();
    let mut entries = Vec::with_capacity(n);
    if hdr.is_fixed_leaf() {
        for i in 0..n {
            entries.push(OwnedNode {
                key: page::fixed_key(pg, i, fixed_ksize).to_vec(),
                body: OwnedBody::Fixed,
            });
        }
    } else {
        let branch = hdr.is_branch();
        for i in 0..n {
            let nd = Node::at(pg, i)?;
            let key = if branch && i == 0 {
                node0_key.map(|k| k.to_vec()).unwrap_or_default()
            } else {
                nd.key().to_vec()
            };
            let body = if branch {
                OwnedBody::Branch { child: nd.child() }
            } else {
                OwnedBody::Leaf {
                    flags: nd.flags(),
                    data: nd.data()?.to_vec(),
                    logical: nd.data_len(),
                }
            };
            entries.push(OwnedNode { key, body });
        }
    }
    Ok(PageImage { entries, flags, fixed_ksize })
}

fn collect_page(txn: &RwTxn, pgno: Pgno, node0_key: Option<&[u8]>) -> Result<PageImage> {
    collect_slice(txn.page(pgno)?, node0_key)
}

/// Rewrite a dirty page from owned entries. Branch index 0 keys are
/// dropped back to the implicit form.
fn rebuild_page(txn: &mut RwTxn, pgno: Pgno, img_flags: u16, fixed_ksize: usize, entries: &[OwnedNode]) -> Result<()> {
    let psize = txn.page_size();
    let pg = txn.dirty_page_mut(pgno)?;
    let hdr = PageHeader::from_bytes_mut(pg)?;
    let keep = hdr.pgno();
    hdr.init(img_flags | P_DIRTY, psize);
    hdr.set_pgno(keep);
    let branch = img_flags & P_BRANCH != 0;
    let fixed = img_flags & P_LEAF_FIXED != 0;
    if fixed {
        hdr.set_fixed_ksize(fixed_ksize);
    }
    for (i, e) in entries.iter().enumerate() {
        if fixed {
            node::insert_fixed_key(pg, i, &e.key)?;
        } else {
            let key: &[u8] = if branch && i == 0 { b"" } else { &e.key };
            node::insert_node(pg, i, key, e.as_body())?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Insertion with split
// ---------------------------------------------------------------------

fn page_room(txn: &RwTxn, pgno: Pgno) -> Result<usize> {
    Ok(PageHeader::from_bytes(txn.page(pgno)?)?.size_left())
}

/// Insert a node at an explicit position of the page at `stack[level]`,
/// splitting as needed. The stack above `level` must be valid; the stack
/// at and below `level` is stale after a split.
fn insert_into_page(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    level: usize,
    index: usize,
    key: &[u8],
    body: NodeBody,
    append: bool,
) -> Result<()> {
    let pos = stack[level];
    if page_room(txn, pos.pgno)? >= body.node_size(key.len()) + 2 {
        let pg = txn.dirty_page_mut(pos.pgno)?;
        return node::insert_node(pg, index, key, body);
    }
    let entry = OwnedNode {
        key: key.to_vec(),
        body: match body {
            NodeBody::Leaf { flags, data } => OwnedBody::Leaf {
                flags,
                data: data.to_vec(),
                logical: data.len(),
            },
            NodeBody::LeafReserve { flags, len } => OwnedBody::Leaf {
                flags,
                data: vec![0u8; len],
                logical: len,
            },
            NodeBody::LeafOverflow { flags, data_len, pgno } => OwnedBody::Leaf {
                flags: flags | N_OVERFLOW,
                data: pgno.to_ne_bytes().to_vec(),
                logical: data_len,
            },
            NodeBody::Branch { child } => OwnedBody::Branch { child },
        },
    };
    split_insert(txn, ctx, stack, level, index, entry, append)
}

fn insert_fixed_into_page(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    level: usize,
    index: usize,
    key: &[u8],
    append: bool,
) -> Result<()> {
    let pos = stack[level];
    let ksize = {
        let hdr = PageHeader::from_bytes(txn.page(pos.pgno)?)?;
        hdr.fixed_ksize()
    };
    if page_room(txn, pos.pgno)? >= ksize {
        let pg = txn.dirty_page_mut(pos.pgno)?;
        return node::insert_fixed_key(pg, index, key);
    }
    let entry = OwnedNode { key: key.to_vec(), body: OwnedBody::Fixed };
    split_insert(txn, ctx, stack, level, index, entry, append)
}

/// Split the page at `stack[level]`, inserting the new entry, and push
/// the separator into the parent (recursively splitting it when full).
/// Page paths at and below `level` are stale afterwards; callers re-seek.
fn split_insert(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    level: usize,
    index: usize,
    entry: OwnedNode,
    append: bool,
) -> Result<()> {
    let psize = txn.page_size();
    let capacity = psize - PAGE_HEADER_SIZE;
    let pos = stack[level];

    let mut img = collect_page(txn, pos.pgno, None)?;
    img.entries.insert(index, entry);
    let count = img.entries.len();
    ensure!(count >= 2, "splitting a page with a single entry");

    let costs: Vec<usize> = img.entries.iter().map(|e| e.cost(img.fixed_ksize)).collect();
    let total: usize = costs.iter().sum();

    let mut split = if append && index == count - 1 {
        // Sorted bulk load: keep the left page packed, start fresh on the
        // right.
        count - 1
    } else {
        let half = total / 2;
        let mut acc = 0usize;
        let mut s = count - 1;
        for (i, c) in costs[..count - 1].iter().enumerate() {
            acc += c;
            if acc >= half {
                s = i + 1;
                break;
            }
        }
        s.clamp(1, count - 1)
    };

    let prefix = |s: usize| -> usize { costs[..s].iter().sum() };
    while prefix(split) > capacity && split > 1 {
        split -= 1;
    }
    while total - prefix(split) > capacity && split < count - 1 {
        split += 1;
    }
    ensure!(
        prefix(split) <= capacity && total - prefix(split) <= capacity,
        "page {} cannot be split: entries too large",
        pos.pgno
    );

    let separator = img.entries[split].key.clone();
    let kind_flags = img.flags & (P_BRANCH | P_LEAF | P_LEAF_FIXED);
    let right_pgno = txn.page_new(kind_flags, 1)?;
    if img.is_branch() {
        ctx.record.add_branch_pages(1);
    } else {
        ctx.record.add_leaf_pages(1);
    }
    if img.is_fixed() {
        let pg = txn.dirty_page_mut(right_pgno)?;
        PageHeader::from_bytes_mut(pg)?.set_fixed_ksize(img.fixed_ksize);
    }

    let right_entries = img.entries.split_off(split);
    rebuild_page(txn, pos.pgno, img.flags, img.fixed_ksize, &img.entries)?;
    rebuild_page(txn, right_pgno, kind_flags, img.fixed_ksize, &right_entries)?;

    if level == 0 {
        let root = txn.page_new(P_BRANCH, 1)?;
        ctx.record.add_branch_pages(1);
        ctx.record.set_depth(ctx.record.depth() + 1);
        ctx.record.set_root(root);
        ensure!(
            ctx.record.depth() <= CURSOR_MAX_DEPTH,
            "tree deeper than {} levels",
            CURSOR_MAX_DEPTH
        );
        let pg = txn.dirty_page_mut(root)?;
        node::insert_node(pg, 0, b"", NodeBody::Branch { child: pos.pgno })?;
        node::insert_node(pg, 1, &separator, NodeBody::Branch { child: right_pgno })?;
        Ok(())
    } else {
        let pidx = stack[level - 1].index + 1;
        insert_into_page(
            txn,
            ctx,
            stack,
            level - 1,
            pidx,
            &separator,
            NodeBody::Branch { child: right_pgno },
            append,
        )
    }
}

/// Replace the separator at `index` of the branch page at `stack[level]`.
/// A larger key may force a split of that page.
fn update_separator(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    level: usize,
    index: usize,
    key: &[u8],
) -> Result<()> {
    if index == 0 {
        // The leftmost separator is implicit; nothing to store.
        return Ok(());
    }
    let pos = stack[level];
    let child = {
        let pg = txn.page(pos.pgno)?;
        Node::at(pg, index)?.child()
    };
    {
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::delete_node(pg, index)?;
    }
    insert_into_page(txn, ctx, stack, level, index, key, NodeBody::Branch { child }, false)
}

// ---------------------------------------------------------------------
// Rebalancing
// ---------------------------------------------------------------------

/// Restore the fill invariants for the page at the top of `stack` after a
/// deletion, borrowing from or merging with a neighbor and recursing up.
fn rebalance(txn: &mut RwTxn, ctx: &mut OpCtx, stack: &mut PathStack) -> Result<()> {
    let psize = txn.page_size();
    let level = stack.len() - 1;
    let pos = stack[level];
    let (nkeys, fill, is_leaf) = {
        let hdr = PageHeader::from_bytes(txn.page(pos.pgno)?)?;
        (hdr.num_keys(), hdr.fill(psize), hdr.is_leaf())
    };
    let min_keys = if is_leaf { 1 } else { MIN_BRANCH_KEYS };
    if fill >= FILL_THRESHOLD && nkeys >= min_keys {
        return Ok(());
    }

    if level == 0 {
        if is_leaf && nkeys == 0 {
            txn.page_free(pos.pgno)?;
            ctx.record.add_leaf_pages(-1);
            ctx.record.set_root(INVALID_PGNO);
            ctx.record.set_depth(0);
            stack.clear();
        } else if !is_leaf && nkeys == 1 {
            let child = {
                let pg = txn.page(pos.pgno)?;
                Node::at(pg, 0)?.child()
            };
            txn.page_free(pos.pgno)?;
            ctx.record.add_branch_pages(-1);
            ctx.record.set_depth(ctx.record.depth() - 1);
            ctx.record.set_root(child);
            stack.clear();
        }
        return Ok(());
    }

    let parent = stack[level - 1];
    let pnkeys = PageHeader::from_bytes(txn.page(parent.pgno)?)?.num_keys();
    ensure!(
        pnkeys >= 2,
        "branch page {} has a single child above an underfull page",
        parent.pgno
    );
    let from_left = parent.index > 0;
    let sib_pidx = if from_left { parent.index - 1 } else { parent.index + 1 };
    let sib_child = {
        let pg = txn.page(parent.pgno)?;
        Node::at(pg, sib_pidx)?.child()
    };

    // Bring the sibling into this transaction; its parent entry follows.
    let mut sibstack: PathStack = stack[..level].iter().copied().collect();
    sibstack[level - 1].index = sib_pidx;
    sibstack.push(CursorPos { pgno: sib_child, index: 0 });
    txn.page_touch(&mut sibstack)?;
    let sib_pgno = sibstack[level].pgno;

    let (sib_keys, sib_fill) = {
        let hdr = PageHeader::from_bytes(txn.page(sib_pgno)?)?;
        (hdr.num_keys(), hdr.fill(psize))
    };

    if sib_fill >= FILL_THRESHOLD && sib_keys > min_keys {
        return borrow_node(txn, ctx, stack, level, sib_pgno, sib_pidx, from_left, is_leaf);
    }

    // Merge right into left.
    let (left_pgno, right_pgno, right_pidx) = if from_left {
        (sib_pgno, pos.pgno, parent.index)
    } else {
        (pos.pgno, sib_pgno, sib_pidx)
    };
    let right_sep = {
        let pg = txn.page(parent.pgno)?;
        Node::at(pg, right_pidx)?.key().to_vec()
    };
    let right_img = collect_page(txn, right_pgno, if is_leaf { None } else { Some(&right_sep) })?;
    let mut left_img = collect_page(txn, left_pgno, None)?;

    let capacity = psize - PAGE_HEADER_SIZE;
    if left_img.total_cost() + right_img.total_cost() > capacity {
        // Rare: the neighbor is at minimum keys but carries huge nodes.
        // Redistribution keeps both pages legal even when a merge would
        // not fit.
        return borrow_node(txn, ctx, stack, level, sib_pgno, sib_pidx, from_left, is_leaf);
    }

    left_img.entries.extend(right_img.entries);
    rebuild_page(txn, left_pgno, left_img.flags, left_img.fixed_ksize, &left_img.entries)?;
    {
        let pg = txn.dirty_page_mut(parent.pgno)?;
        node::delete_node(pg, right_pidx)?;
    }
    txn.page_free(right_pgno)?;
    if is_leaf {
        ctx.record.add_leaf_pages(-1);
    } else {
        ctx.record.add_branch_pages(-1);
    }

    stack.truncate(level);
    rebalance(txn, ctx, stack)
}

/// Move one node from the neighbor into the underfull page and fix the
/// parent separator.
fn borrow_node(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    level: usize,
    sib_pgno: Pgno,
    sib_pidx: usize,
    from_left: bool,
    is_leaf: bool,
) -> Result<()> {
    let parent = stack[level - 1];
    let pos = stack[level];

    if from_left {
        let cur_sep = if is_leaf {
            None
        } else {
            let pg = txn.page(parent.pgno)?;
            Some(Node::at(pg, parent.index)?.key().to_vec())
        };
        let mut cur_img = collect_page(txn, pos.pgno, cur_sep.as_deref())?;
        let mut sib_img = collect_page(txn, sib_pgno, None)?;
        ensure!(sib_img.entries.len() > 1, "neighbor too small to lend a node");
        let moved = sib_img.entries.pop().unwrap();
        let new_sep = moved.key.clone();
        cur_img.entries.insert(0, moved);
        rebuild_page(txn, sib_pgno, sib_img.flags, sib_img.fixed_ksize, &sib_img.entries)?;
        rebuild_page(txn, pos.pgno, cur_img.flags, cur_img.fixed_ksize, &cur_img.entries)?;
        update_separator(txn, ctx, stack, level - 1, parent.index, &new_sep)
    } else {
        let sib_sep = {
            let pg = txn.page(parent.pgno)?;
            Node::at(pg, sib_pidx)?.key().to_vec()
        };
        let mut sib_img = collect_page(txn, sib_pgno, if is_leaf { None } else { Some(&sib_sep) })?;
        ensure!(sib_img.entries.len() > 1, "neighbor too small to lend a node");
        let mut cur_img = collect_page(txn, pos.pgno, None)?;
        let moved = sib_img.entries.remove(0);
        let new_sib_sep = sib_img.entries[0].key.clone();
        cur_img.entries.push(moved);
        rebuild_page(txn, sib_pgno, sib_img.flags, sib_img.fixed_ksize, &sib_img.entries)?;
        rebuild_page(txn, pos.pgno, cur_img.flags, cur_img.fixed_ksize, &cur_img.entries)?;
        update_separator(txn, ctx, stack, level - 1, sib_pidx, &new_sib_sep)
    }
}

// ---------------------------------------------------------------------
// Put
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum PutData<'a> {
    Value(&'a [u8]),
    Reserve(usize),
}

impl PutData<'_> {
    fn len(&self) -> usize {
        match self {
            PutData::Value(v) => v.len(),
            PutData::Reserve(n) => *n,
        }
    }
}

fn spill_need(depth: usize, extra_pages: usize) -> usize {
    2 * (depth + 4) + extra_pages
}

pub(crate) fn cursor_put(
    txn: &mut RwTxn,
    state: &mut CursorState,
    key: &[u8],
    data: &[u8],
    flags: u32,
) -> Result<()> {
    put_impl(txn, state, key, PutData::Value(data), flags)
}

/// Insert a key with space for `len` data bytes, left for the caller to
/// fill through the final cursor position.
pub(crate) fn cursor_put_reserve(
    txn: &mut RwTxn,
    state: &mut CursorState,
    key: &[u8],
    len: usize,
) -> Result<()> {
    put_impl(txn, state, key, PutData::Reserve(len), 0)
}

fn put_impl(
    txn: &mut RwTxn,
    state: &mut CursorState,
    key: &[u8],
    data: PutData,
    flags: u32,
) -> Result<()> {
    let tree = state.tree;
    let tflags = txn.tree_flags(tree)?;
    let dupsort = tflags & DUP_SORT != 0;
    let psize = txn.page_size();
    let nmax = node_max(psize);

    let max_key = crate::config::max_key_for(psize);
    ensure!(
        !key.is_empty() && key.len() <= max_key,
        "key length {} outside 1..={}",
        key.len(),
        max_key
    );
    if tflags & INTEGER_KEY != 0 {
        ensure!(
            key.len() == 8 || key.len() == 4,
            "integer keys must be 4 or 8 bytes, got {}",
            key.len()
        );
    }
    let limit = if dupsort { max_key } else { MAX_DATA_SIZE };
    ensure!(
        data.len() <= limit,
        "value length {} exceeds the limit {}",
        data.len(),
        limit
    );
    if dupsort {
        ensure!(
            matches!(data, PutData::Value(_)),
            "reserve is not supported on duplicate-sorted trees"
        );
    }

    if flags & CURRENT != 0 {
        return put_current(txn, state, data, flags);
    }

    let exact = cursor::seek(&*txn, state, key)?.unwrap_or(false);
    if exact && flags & NO_OVERWRITE != 0 && !dupsort {
        bail!("key already exists");
    }
    if flags & APPEND != 0 && !exact {
        let cmp = txn.key_cmp(tree)?;
        let mut last = CursorState::new(tree);
        if cursor::seek_last(&*txn, &mut last)? {
            if let Some((lk, _)) = cursor::current_entry(&*txn, &last)? {
                ensure!(
                    cmp(key, lk).is_gt(),
                    "keys must be appended in order"
                );
            }
        }
    }

    let depth = txn.tree_record(tree)?.depth();
    let extra = if !dupsort && NODE_HEADER_SIZE + key.len() + data.len() > nmax {
        overflow_pages(data.len(), psize)
    } else {
        0
    };
    txn.spill_check(&state.keep_pgnos(), spill_need(depth, extra))?;

    let mut ctx = OpCtx { record: txn.tree_record(tree)? };

    if state.stack.is_empty() {
        let root = txn.page_new(P_LEAF, 1)?;
        ctx.record.set_root(root);
        ctx.record.set_depth(1);
        ctx.record.add_leaf_pages(1);
        state.stack.push(CursorPos { pgno: root, index: 0 });
        state.initialized = true;
    } else if let Some(root) = txn.page_touch(&mut state.stack)? {
        ctx.record.set_root(root);
    }

    let mut stack: PathStack = state.stack.clone();
    if dupsort {
        let PutData::Value(value) = data else { unreachable!() };
        dup_put(txn, &mut ctx, &mut stack, tree, tflags, key, value, flags, exact)?;
    } else {
        plain_put(txn, &mut ctx, &mut stack, key, data, flags, exact)?;
    }
    txn.update_tree(tree, |r| *r = ctx.record)?;

    // The stack is stale after splits and rebuilds; re-derive it.
    state.reset();
    ensure!(
        cursor::seek_exact(&*txn, state, key)?,
        "inserted key is missing on re-seek"
    );
    if dupsort {
        if let PutData::Value(value) = data {
            if state.sub.is_some() {
                ensure!(
                    cursor::sub_seek(&*txn, state, value, true)?,
                    "inserted duplicate is missing on re-seek"
                );
            }
        }
    }
    Ok(())
}

/// Overwrite the entry under the cursor without repositioning.
fn put_current(txn: &mut RwTxn, state: &mut CursorState, data: PutData, _flags: u32) -> Result<()> {
    ensure!(
        state.initialized && !state.deleted && !state.at_end,
        "cursor is not positioned on an entry"
    );
    let tree = state.tree;
    let depth = txn.tree_record(tree)?.depth();
    txn.spill_check(&state.keep_pgnos(), spill_need(depth, 0))?;

    let mut ctx = OpCtx { record: txn.tree_record(tree)? };
    if let Some(root) = txn.page_touch(&mut state.stack)? {
        ctx.record.set_root(root);
    }
    let pos = state.top_pos()?;
    let (nflags, key) = {
        let pg = txn.page(pos.pgno)?;
        let nd = Node::at(pg, pos.index)?;
        (nd.flags(), nd.key().to_vec())
    };
    ensure!(
        nflags & N_SUB_TREE == 0 || nflags & N_DUP != 0,
        "key holds a named tree"
    );

    if nflags & N_DUP != 0 {
        // Replace the current duplicate in place; sizes must match since
        // values order the sub-structure.
        let PutData::Value(value) = data else {
            bail!("reserve is not supported on duplicate-sorted trees")
        };
        let current = cursor::sub_current(&*txn, state)?;
        ensure!(
            current.len() == value.len(),
            "replacing a duplicate in place requires equal sizes"
        );
        let (is_tree, sub_index, sub_stack) = {
            let sub = state.sub.as_ref().unwrap();
            let idx = if sub.is_tree {
                sub.stack.last().unwrap().index
            } else {
                sub.pos
            };
            (sub.is_tree, idx, sub.stack.clone())
        };
        if is_tree {
            let mut sstack = sub_stack;
            txn.page_touch(&mut sstack)?;
            let spgno = sstack[sstack.len() - 1].pgno;
            let pg = txn.dirty_page_mut(spgno)?;
            let (fixed, ksize) = {
                let hdr = PageHeader::from_bytes(pg)?;
                (hdr.is_fixed_leaf(), hdr.fixed_ksize())
            };
            if fixed {
                let at = PAGE_HEADER_SIZE + sub_index * ksize;
                pg[at..at + ksize].copy_from_slice(value);
            } else {
                let (off, klen) = {
                    let nd = Node::at(pg, sub_index)?;
                    (page::node_offset(pg, sub_index)?, nd.key_len())
                };
                ensure!(klen == value.len(), "duplicate size changed underfoot");
                let at = off + NODE_HEADER_SIZE;
                pg[at..at + klen].copy_from_slice(value);
            }
            state.sub.as_mut().unwrap().stack = sstack;
        } else {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            let sp = node::data_mut(pg, pos.index)?;
            let (fixed, ksize) = {
                let hdr = PageHeader::from_bytes(sp)?;
                (hdr.is_fixed_leaf(), hdr.fixed_ksize())
            };
            if fixed {
                let at = PAGE_HEADER_SIZE + sub_index * ksize;
                sp[at..at + ksize].copy_from_slice(value);
            } else {
                let (off, klen) = {
                    let nd = Node::at(sp, sub_index)?;
                    (page::node_offset(sp, sub_index)?, nd.key_len())
                };
                ensure!(klen == value.len(), "duplicate size changed underfoot");
                let at = off + NODE_HEADER_SIZE;
                sp[at..at + klen].copy_from_slice(value);
            }
        }
        txn.update_tree(tree, |r| *r = ctx.record)?;
        return Ok(());
    }

    let mut stack: PathStack = state.stack.clone();
    plain_put(txn, &mut ctx, &mut stack, &key, data, 0, true)?;
    txn.update_tree(tree, |r| *r = ctx.record)?;
    state.reset();
    ensure!(
        cursor::seek_exact(&*txn, state, &key)?,
        "overwritten key is missing on re-seek"
    );
    Ok(())
}

fn plain_put(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    key: &[u8],
    data: PutData,
    flags: u32,
    exact: bool,
) -> Result<()> {
    let psize = txn.page_size();
    if exact {
        let pos = *stack.last().unwrap();
        let (nflags, old_len, ov_pgno) = {
            let pg = txn.page(pos.pgno)?;
            let nd = Node::at(pg, pos.index)?;
            let ov = if nd.is_set(N_OVERFLOW) {
                Some(nd.overflow_pgno()?)
            } else {
                None
            };
            (nd.flags(), nd.data_len(), ov)
        };
        ensure!(nflags & N_DUP == 0, "duplicate node in a plain tree");
        ensure!(nflags & N_SUB_TREE == 0, "key holds a named tree");

        if let Some(first) = ov_pgno {
            let need = overflow_pages(data.len(), psize);
            txn.unspill_run(first)?;
            let (count, dirty) = {
                let pg = txn.page(first)?;
                let hdr = PageHeader::from_bytes(pg)?;
                (hdr.overflow_count(), txn.is_dirty(first))
            };
            if count >= need && dirty {
                // Overwrite the run in place.
                {
                    let pg = txn.dirty_page_mut(pos.pgno)?;
                    node::set_data_len(pg, pos.index, data.len())?;
                }
                if let PutData::Value(v) = data {
                    let buf = txn.dirty_page_mut(first)?;
                    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + v.len()].copy_from_slice(v);
                }
                return Ok(());
            }
            let freed = txn.free_overflow(first)?;
            ctx.record.add_overflow_pages(-(freed as i64));
        } else if data.len() == old_len {
            if let PutData::Value(v) = data {
                let pg = txn.dirty_page_mut(pos.pgno)?;
                node::data_mut(pg, pos.index)?.copy_from_slice(v);
            }
            return Ok(());
        }
        {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            node::delete_node(pg, pos.index)?;
        }
        return insert_value(txn, ctx, stack, key, data, flags, false);
    }
    insert_value(txn, ctx, stack, key, data, flags, true)
}

fn insert_value(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    key: &[u8],
    data: PutData,
    flags: u32,
    new_entry: bool,
) -> Result<()> {
    let psize = txn.page_size();
    let nmax = node_max(psize);
    let level = stack.len() - 1;
    let index = stack[level].index;
    let append = flags & APPEND != 0;

    if NODE_HEADER_SIZE + key.len() + data.len() > nmax {
        let pages = overflow_pages(data.len(), psize);
        let first = txn.page_new(crate::storage::page::P_OVERFLOW, pages)?;
        if let PutData::Value(v) = data {
            let buf = txn.dirty_page_mut(first)?;
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + v.len()].copy_from_slice(v);
        }
        ctx.record.add_overflow_pages(pages as i64);
        insert_into_page(
            txn,
            ctx,
            stack,
            level,
            index,
            key,
            NodeBody::LeafOverflow { flags: 0, data_len: data.len(), pgno: first },
            append,
        )?;
    } else {
        let body = match data {
            PutData::Value(v) => NodeBody::Leaf { flags: 0, data: v },
            PutData::Reserve(len) => NodeBody::LeafReserve { flags: 0, len },
        };
        insert_into_page(txn, ctx, stack, level, index, key, body, append)?;
    }
    if new_entry {
        ctx.record.add_entries(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Duplicate puts
// ---------------------------------------------------------------------

fn subtree_record(tflags: u16, value_len: usize) -> TreeRecord {
    let mut flags = 0u16;
    if tflags & DUP_FIXED != 0 {
        flags |= DUP_FIXED;
        if tflags & INTEGER_DUP != 0 {
            flags |= INTEGER_KEY;
        }
    }
    let mut rec = TreeRecord::new(flags);
    if tflags & DUP_FIXED != 0 {
        rec.set_fixed_ksize(value_len);
    }
    rec
}

/// Insert a value into a duplicate sub-tree (values are keys there).
/// Returns false when the value already existed.
fn sub_tree_put(
    txn: &mut RwTxn,
    rec: &mut TreeRecord,
    dcmp: Comparator,
    value: &[u8],
    flags: u32,
) -> Result<bool> {
    let fixed = rec.flags() & DUP_FIXED != 0;
    if fixed {
        ensure!(
            rec.fixed_ksize() == value.len(),
            "fixed-size duplicates must share one size ({} != {})",
            value.len(),
            rec.fixed_ksize()
        );
    }
    let mut sstack = PathStack::new();
    match cursor::descend_raw(txn, rec, dcmp, &mut sstack, Target::Key(value))? {
        None => {
            let mut pf = P_LEAF;
            if fixed {
                pf |= P_LEAF_FIXED;
            }
            let root = txn.page_new(pf, 1)?;
            if fixed {
                let pg = txn.dirty_page_mut(root)?;
                PageHeader::from_bytes_mut(pg)?.set_fixed_ksize(value.len());
            }
            rec.set_root(root);
            rec.set_depth(1);
            rec.add_leaf_pages(1);
            sstack.push(CursorPos { pgno: root, index: 0 });
        }
        Some(true) => {
            if flags & NO_DUP_DATA != 0 {
                bail!("key already exists");
            }
            return Ok(false);
        }
        Some(false) => {
            if let Some(root) = txn.page_touch(&mut sstack)? {
                rec.set_root(root);
            }
        }
    }
    let mut sctx = OpCtx { record: *rec };
    let level = sstack.len() - 1;
    let index = sstack[level].index;
    let append = flags & APPEND_DUP != 0;
    if fixed {
        insert_fixed_into_page(txn, &mut sctx, &mut sstack, level, index, value, append)?;
    } else {
        insert_into_page(
            txn,
            &mut sctx,
            &mut sstack,
            level,
            index,
            value,
            NodeBody::Leaf { flags: 0, data: &[] },
            append,
        )?;
    }
    sctx.record.add_entries(1);
    *rec = sctx.record;
    Ok(true)
}

/// Build an embedded sub-page image from sorted duplicate values.
fn build_subpage(entries: &[OwnedNode], fixed: bool, ksize: usize) -> Result<Vec<u8>> {
    let content: usize = if fixed {
        entries.len() * ksize
    } else {
        entries
            .iter()
            .map(|e| node::leaf_node_size(e.key.len(), 0) + 2)
            .sum()
    };
    let size = node::even(PAGE_HEADER_SIZE + content);
    let mut sp = vec![0u8; size];
    {
        let hdr = PageHeader::from_bytes_mut(&mut sp)?;
        let mut flags = P_LEAF | P_SUB;
        if fixed {
            flags |= P_LEAF_FIXED;
        }
        hdr.init(flags, size);
        if fixed {
            hdr.set_fixed_ksize(ksize);
        }
    }
    for (i, e) in entries.iter().enumerate() {
        if fixed {
            node::insert_fixed_key(&mut sp, i, &e.key)?;
        } else {
            node::insert_node(&mut sp, i, &e.key, NodeBody::Leaf { flags: 0, data: &[] })?;
        }
    }
    Ok(sp)
}

/// Move an embedded sub-page's values into a fresh sub-tree root.
fn promote_subpage(
    txn: &mut RwTxn,
    entries: &[OwnedNode],
    tflags: u16,
    ksize: usize,
) -> Result<TreeRecord> {
    let fixed = tflags & DUP_FIXED != 0;
    let mut rec = subtree_record(tflags, ksize);
    let mut pf = P_LEAF;
    if fixed {
        pf |= P_LEAF_FIXED;
    }
    let root = txn.page_new(pf, 1)?;
    {
        let pg = txn.dirty_page_mut(root)?;
        if fixed {
            PageHeader::from_bytes_mut(pg)?.set_fixed_ksize(ksize);
        }
        for (i, e) in entries.iter().enumerate() {
            if fixed {
                node::insert_fixed_key(pg, i, &e.key)?;
            } else {
                node::insert_node(pg, i, &e.key, NodeBody::Leaf { flags: 0, data: &[] })?;
            }
        }
    }
    rec.set_root(root);
    rec.set_depth(1);
    rec.add_leaf_pages(1);
    rec.set_entries(entries.len() as u64);
    Ok(rec)
}

#[allow(clippy::too_many_arguments)]
fn dup_put(
    txn: &mut RwTxn,
    ctx: &mut OpCtx,
    stack: &mut PathStack,
    tree: usize,
    tflags: u16,
    key: &[u8],
    value: &[u8],
    flags: u32,
    exact: bool,
) -> Result<()> {
    let psize = txn.page_size();
    let nmax = node_max(psize);
    let dcmp = txn.dup_cmp(tree)?;
    let fixed = tflags & DUP_FIXED != 0;
    if fixed {
        // Fixed-key leaves account two of each element's bytes against
        // the offset counter, so elements must be at least that big.
        ensure!(
            value.len() >= 2,
            "fixed-size duplicates need at least 2 bytes, got {}",
            value.len()
        );
    }
    let level = stack.len() - 1;
    let index = stack[level].index;
    let append = flags & APPEND != 0;

    if !exact {
        if NODE_HEADER_SIZE + key.len() + value.len() > nmax {
            // Too big to ever sit inline: open with a sub-tree.
            let mut rec = subtree_record(tflags, value.len());
            let inserted = sub_tree_put(txn, &mut rec, dcmp, value, flags)?;
            debug_assert!(inserted);
            insert_into_page(
                txn,
                ctx,
                stack,
                level,
                index,
                key,
                NodeBody::Leaf { flags: N_DUP | N_SUB_TREE, data: rec.as_bytes() },
                append,
            )?;
        } else {
            insert_into_page(
                txn,
                ctx,
                stack,
                level,
                index,
                key,
                NodeBody::Leaf { flags: 0, data: value },
                append,
            )?;
        }
        ctx.record.add_entries(1);
        return Ok(());
    }

    let pos = *stack.last().unwrap();
    let (nflags, old_data) = {
        let pg = txn.page(pos.pgno)?;
        let nd = Node::at(pg, pos.index)?;
        (nd.flags(), nd.data()?.to_vec())
    };

    if nflags & N_SUB_TREE != 0 {
        ensure!(nflags & N_DUP != 0, "key holds a named tree");
        let mut rec = TreeRecord::read_from(&old_data)?;
        let inserted = sub_tree_put(txn, &mut rec, dcmp, value, flags)?;
        {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            node::data_mut(pg, pos.index)?[..TREE_RECORD_SIZE].copy_from_slice(rec.as_bytes());
        }
        if inserted {
            ctx.record.add_entries(1);
        }
        return Ok(());
    }

    if nflags & N_DUP == 0 {
        // Second value for a single-valued key.
        ensure!(nflags & N_OVERFLOW == 0, "oversized value in a duplicate-sorted tree");
        if fixed {
            ensure!(
                old_data.len() == value.len(),
                "fixed-size duplicates must share one size ({} != {})",
                value.len(),
                old_data.len()
            );
        }
        if dcmp(&old_data, value).is_eq() {
            if flags & (NO_DUP_DATA | NO_OVERWRITE) != 0 {
                bail!("key already exists");
            }
            if old_data.len() == value.len() {
                let pg = txn.dirty_page_mut(pos.pgno)?;
                node::data_mut(pg, pos.index)?.copy_from_slice(value);
                return Ok(());
            }
            {
                let pg = txn.dirty_page_mut(pos.pgno)?;
                node::delete_node(pg, pos.index)?;
            }
            return insert_value(txn, ctx, stack, key, PutData::Value(value), 0, false);
        }

        let mut pair = vec![
            OwnedNode { key: old_data.clone(), body: if fixed { OwnedBody::Fixed } else { OwnedBody::Leaf { flags: 0, data: Vec::new(), logical: 0 } } },
            OwnedNode { key: value.to_vec(), body: if fixed { OwnedBody::Fixed } else { OwnedBody::Leaf { flags: 0, data: Vec::new(), logical: 0 } } },
        ];
        if dcmp(&pair[0].key, &pair[1].key).is_gt() {
            pair.swap(0, 1);
        }
        let ksize = value.len();
        let sp = build_subpage(&pair, fixed, ksize)?;
        {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            node::delete_node(pg, pos.index)?;
        }
        if NODE_HEADER_SIZE + key.len() + sp.len() > nmax {
            let rec = promote_subpage(txn, &pair, tflags, ksize)?;
            insert_into_page(
                txn,
                ctx,
                stack,
                level,
                pos.index,
                key,
                NodeBody::Leaf { flags: N_DUP | N_SUB_TREE, data: rec.as_bytes() },
                false,
            )?;
        } else {
            insert_into_page(
                txn,
                ctx,
                stack,
                level,
                pos.index,
                key,
                NodeBody::Leaf { flags: N_DUP, data: &sp },
                false,
            )?;
        }
        ctx.record.add_entries(1);
        return Ok(());
    }

    // Growing an embedded sub-page.
    let mut img = collect_slice(&old_data, None)?;
    let ksize = if img.is_fixed() { img.fixed_ksize } else { value.len() };
    if img.is_fixed() {
        ensure!(
            value.len() == img.fixed_ksize,
            "fixed-size duplicates must share one size ({} != {})",
            value.len(),
            img.fixed_ksize
        );
    }
    let (at, dup_exact) = cursor::leaf_search(&old_data, value, dcmp)?;
    if dup_exact {
        if flags & NO_DUP_DATA != 0 {
            bail!("key already exists");
        }
        return Ok(());
    }
    img.entries.insert(
        at,
        OwnedNode {
            key: value.to_vec(),
            body: if img.is_fixed() {
                OwnedBody::Fixed
            } else {
                OwnedBody::Leaf { flags: 0, data: Vec::new(), logical: 0 }
            },
        },
    );
    let fixed_sub = img.is_fixed();
    let sp = build_subpage(&img.entries, fixed_sub, ksize)?;
    {
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::delete_node(pg, pos.index)?;
    }
    if NODE_HEADER_SIZE + key.len() + sp.len() > nmax {
        let rec = promote_subpage(txn, &img.entries, tflags, ksize)?;
        insert_into_page(
            txn,
            ctx,
            stack,
            level,
            pos.index,
            key,
            NodeBody::Leaf { flags: N_DUP | N_SUB_TREE, data: rec.as_bytes() },
            false,
        )?;
    } else {
        insert_into_page(
            txn,
            ctx,
            stack,
            level,
            pos.index,
            key,
            NodeBody::Leaf { flags: N_DUP, data: &sp },
            false,
        )?;
    }
    ctx.record.add_entries(1);
    Ok(())
}

// ---------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------

pub(crate) fn cursor_del(txn: &mut RwTxn, state: &mut CursorState, delete_dups: bool) -> Result<()> {
    del_impl(txn, state, delete_dups, false)
}

fn del_impl(
    txn: &mut RwTxn,
    state: &mut CursorState,
    delete_dups: bool,
    allow_record: bool,
) -> Result<()> {
    ensure!(
        state.initialized && !state.deleted && !state.at_end,
        "cursor is not positioned on an entry"
    );
    let tree = state.tree;
    let depth = txn.tree_record(tree)?.depth();
    txn.spill_check(&state.keep_pgnos(), spill_need(depth, 0))?;

    let mut ctx = OpCtx { record: txn.tree_record(tree)? };
    let mut stack: PathStack = state.stack.clone();
    if let Some(root) = txn.page_touch(&mut stack)? {
        ctx.record.set_root(root);
    }

    let pos = *stack.last().unwrap();
    let (nflags, key, nkeys) = {
        let pg = txn.page(pos.pgno)?;
        let hdr = PageHeader::from_bytes(pg)?;
        let nd = Node::at(pg, pos.index)?;
        (nd.flags(), nd.key().to_vec(), hdr.num_keys())
    };
    ensure!(
        allow_record || nflags & N_SUB_TREE == 0 || nflags & N_DUP != 0,
        "key holds a named tree"
    );

    // Removing one duplicate of several.
    if nflags & N_DUP != 0 && !delete_dups {
        let value = cursor::sub_current(&*txn, state)?.to_vec();
        let emptied = dup_del_one(txn, &mut stack, tree, &value)?;
        if !emptied {
            ctx.record.add_entries(-1);
            txn.update_tree(tree, |r| *r = ctx.record)?;
            state.reset();
            state.initialized = true;
            if cursor::seek_exact(&*txn, state, &key)? {
                if cursor::sub_seek(&*txn, state, &value, false)? {
                    // Parked on the successor duplicate.
                    state.deleted = true;
                }
                // Otherwise: past the last duplicate; `next` moves to the
                // next key naturally.
            } else {
                state.at_end = true;
            }
            return Ok(());
        }
        // Last duplicate went away; fall through and drop the node. The
        // sub-tree pages were already freed by its own rebalancing.
    }

    let entry_delta: i64 = if nflags & N_DUP != 0 {
        if delete_dups {
            // Whole duplicate set goes; release its storage.
            if nflags & N_SUB_TREE != 0 {
                let rec = {
                    let pg = txn.page(pos.pgno)?;
                    TreeRecord::read_from(Node::at(pg, pos.index)?.data()?)?
                };
                if rec.root() != INVALID_PGNO {
                    free_pages_below(txn, rec.root())?;
                }
                rec.entries() as i64
            } else {
                let pg = txn.page(pos.pgno)?;
                PageHeader::from_bytes(Node::at(pg, pos.index)?.data()?)?.num_keys() as i64
            }
        } else {
            1 // the dup_del_one path emptied the set down to this node
        }
    } else {
        1
    };

    if nflags & N_OVERFLOW != 0 {
        let first = {
            let pg = txn.page(pos.pgno)?;
            Node::at(pg, pos.index)?.overflow_pgno()?
        };
        let freed = txn.free_overflow(first)?;
        ctx.record.add_overflow_pages(-(freed as i64));
    }

    {
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::delete_node(pg, pos.index)?;
    }
    ctx.record.add_entries(-entry_delta);

    // A removed first entry shifts the parent separator.
    let remaining = nkeys - 1;
    if pos.index == 0 && remaining > 0 && stack.len() > 1 {
        let plevel = stack.len() - 2;
        let pidx = stack[plevel].index;
        if pidx > 0 {
            let newkey = {
                let pg = txn.page(pos.pgno)?;
                node::leaf_key(pg, 0)?.to_vec()
            };
            update_separator(txn, &mut ctx, &mut stack, plevel, pidx, &newkey)?;
        }
    }

    rebalance(txn, &mut ctx, &mut stack)?;
    txn.update_tree(tree, |r| *r = ctx.record)?;

    // Park on the successor, flagged so `next` does not skip it.
    state.reset();
    if ctx.record.root() == INVALID_PGNO || !cursor::seek_range(&*txn, state, &key)? {
        state.at_end = true;
    }
    state.initialized = true;
    state.deleted = true;
    Ok(())
}

/// Delete one value from the duplicate set under the cursor. True when
/// the set became empty (caller removes the node).
fn dup_del_one(
    txn: &mut RwTxn,
    stack: &mut PathStack,
    tree: usize,
    value: &[u8],
) -> Result<bool> {
    let pos = *stack.last().unwrap();
    let dcmp = txn.dup_cmp(tree)?;
    let (is_tree, data) = {
        let pg = txn.page(pos.pgno)?;
        let nd = Node::at(pg, pos.index)?;
        (nd.is_set(N_SUB_TREE), nd.data()?.to_vec())
    };

    if is_tree {
        let mut rec = TreeRecord::read_from(&data)?;
        let mut sstack = PathStack::new();
        let found = cursor::descend_raw(txn, &rec, dcmp, &mut sstack, Target::Key(value))?;
        ensure!(
            matches!(found, Some(true)),
            "duplicate value vanished during delete"
        );
        if let Some(root) = txn.page_touch(&mut sstack)? {
            rec.set_root(root);
        }
        let spos = *sstack.last().unwrap();
        let fixed = {
            let pg = txn.page(spos.pgno)?;
            PageHeader::from_bytes(pg)?.is_fixed_leaf()
        };
        let snkeys = {
            let pg = txn.dirty_page_mut(spos.pgno)?;
            if fixed {
                node::delete_fixed_key(pg, spos.index)?;
            } else {
                node::delete_node(pg, spos.index)?;
            }
            PageHeader::from_bytes(pg)?.num_keys()
        };
        rec.add_entries(-1);
        let mut sctx = OpCtx { record: rec };
        if spos.index == 0 && snkeys > 0 && sstack.len() > 1 {
            let plevel = sstack.len() - 2;
            let pidx = sstack[plevel].index;
            if pidx > 0 {
                let newkey = {
                    let pg = txn.page(spos.pgno)?;
                    node::leaf_key(pg, 0)?.to_vec()
                };
                update_separator(txn, &mut sctx, &mut sstack, plevel, pidx, &newkey)?;
            }
        }
        rebalance(txn, &mut sctx, &mut sstack)?;
        if sctx.record.entries() == 0 {
            return Ok(true);
        }
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::data_mut(pg, pos.index)?[..TREE_RECORD_SIZE]
            .copy_from_slice(sctx.record.as_bytes());
        Ok(false)
    } else {
        let mut img = collect_slice(&data, None)?;
        let (at, exact) = cursor::leaf_search(&data, value, dcmp)?;
        ensure!(exact, "duplicate value vanished during delete");
        if img.entries.len() == 1 {
            return Ok(true);
        }
        img.entries.remove(at);
        let fixed = img.is_fixed();
        let key = {
            let pg = txn.page(pos.pgno)?;
            Node::at(pg, pos.index)?.key().to_vec()
        };
        let sp = build_subpage(&img.entries, fixed, img.fixed_ksize)?;
        {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            node::delete_node(pg, pos.index)?;
        }
        // Shrinking always fits where the old node did.
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::insert_node(pg, pos.index, &key, NodeBody::Leaf { flags: N_DUP, data: &sp })?;
        Ok(false)
    }
}

// ---------------------------------------------------------------------
// Named-tree records, drop, and helpers for the free-tree save
// ---------------------------------------------------------------------

/// Write (or overwrite in place) a named tree's record node in the main
/// tree.
pub(crate) fn put_tree_record(txn: &mut RwTxn, name: &[u8], record: &TreeRecord) -> Result<()> {
    let mut state = CursorState::new(MAIN_TREE);
    let exact = cursor::seek(&*txn, &mut state, name)?.unwrap_or(false);
    let depth = txn.tree_record(MAIN_TREE)?.depth();
    txn.spill_check(&state.keep_pgnos(), spill_need(depth, 0))?;

    let mut ctx = OpCtx { record: txn.tree_record(MAIN_TREE)? };
    if state.stack.is_empty() {
        let root = txn.page_new(P_LEAF, 1)?;
        ctx.record.set_root(root);
        ctx.record.set_depth(1);
        ctx.record.add_leaf_pages(1);
        state.stack.push(CursorPos { pgno: root, index: 0 });
    } else if let Some(root) = txn.page_touch(&mut state.stack)? {
        ctx.record.set_root(root);
    }
    let mut stack: PathStack = state.stack.clone();
    let pos = *stack.last().unwrap();
    if exact {
        {
            let pg = txn.page(pos.pgno)?;
            let nd = Node::at(pg, pos.index)?;
            ensure!(
                nd.is_set(N_SUB_TREE),
                "key exists in the main tree but is not a named tree"
            );
        }
        let pg = txn.dirty_page_mut(pos.pgno)?;
        node::data_mut(pg, pos.index)?[..TREE_RECORD_SIZE].copy_from_slice(record.as_bytes());
    } else {
        let last = stack.len() - 1;
        insert_into_page(
            txn,
            &mut ctx,
            &mut stack,
            last,
            pos.index,
            name,
            NodeBody::Leaf { flags: N_SUB_TREE, data: record.as_bytes() },
            false,
        )?;
        ctx.record.add_entries(1);
    }
    txn.update_tree(MAIN_TREE, |r| *r = ctx.record)
}

/// Free every page reachable from `pgno`, including overflow runs and
/// duplicate sub-structures hanging off leaf nodes.
fn free_pages_below(txn: &mut RwTxn, pgno: Pgno) -> Result<()> {
    let mut children: Vec<Pgno> = Vec::new();
    let mut overflows: Vec<Pgno> = Vec::new();
    let mut subtrees: Vec<Pgno> = Vec::new();
    {
        let pg = txn.page(pgno)?;
        let hdr = PageHeader::from_bytes(pg)?;
        if hdr.is_branch() {
            for i in 0..hdr.num_keys() {
                children.push(Node::at(pg, i)?.child());
            }
        } else if !hdr.is_fixed_leaf() {
            for i in 0..hdr.num_keys() {
                let nd = Node::at(pg, i)?;
                if nd.is_set(N_OVERFLOW) {
                    overflows.push(nd.overflow_pgno()?);
                } else if nd.is_set(N_DUP) && nd.is_set(N_SUB_TREE) {
                    let rec = TreeRecord::read_from(nd.data()?)?;
                    if rec.root() != INVALID_PGNO {
                        subtrees.push(rec.root());
                    }
                } else if nd.is_set(N_SUB_TREE) {
                    let rec = TreeRecord::read_from(nd.data()?)?;
                    if rec.root() != INVALID_PGNO {
                        subtrees.push(rec.root());
                    }
                }
            }
        }
    }
    for child in children {
        free_pages_below(txn, child)?;
    }
    for first in overflows {
        txn.free_overflow(first)?;
    }
    for root in subtrees {
        free_pages_below(txn, root)?;
    }
    txn.page_free(pgno)
}

/// Empty a tree, optionally deleting its record from the main tree.
pub(crate) fn tree_drop(txn: &mut RwTxn, tree: usize, delete: bool) -> Result<()> {
    let record = txn.tree_record(tree)?;
    if record.root() != INVALID_PGNO {
        free_pages_below(txn, record.root())?;
    }

    if tree == MAIN_TREE {
        // Dropping the main tree wipes the named-tree records with it.
        txn.update_tree(MAIN_TREE, |r| {
            let flags = r.flags();
            *r = TreeRecord::new(flags);
        })?;
        return Ok(());
    }
    if !delete {
        txn.update_tree(tree, |r| {
            let flags = r.flags();
            *r = TreeRecord::new(flags);
        })?;
        return Ok(());
    }

    let name = txn
        .tree_instance(tree)?
        .name
        .ok_or_else(|| eyre::eyre!("core trees cannot be deleted"))?;
    let mut state = CursorState::new(MAIN_TREE);
    ensure!(
        cursor::seek_exact(&*txn, &mut state, name.as_bytes())?,
        "record of tree '{}' not found in the main tree",
        name
    );
    del_impl(txn, &mut state, true, true)?;
    txn.invalidate_tree(tree);
    txn.env.tombstone_tree(tree);
    Ok(())
}

/// Make every page of the cursor's main path writable (the free-tree save
/// touches record paths before rewriting them).
pub(crate) fn touch_cursor(txn: &mut RwTxn, state: &mut CursorState) -> Result<()> {
    let tree = state.tree;
    if let Some(root) = txn.page_touch(&mut state.stack)? {
        txn.update_tree(tree, |r| r.set_root(root))?;
    }
    Ok(())
}

/// Fill the data of a reserved record in place; shorter fills only write
/// a prefix (the record keeps its reserved length).
pub(crate) fn record_fill(txn: &mut RwTxn, pos: CursorPos, bytes: &[u8]) -> Result<()> {
    // A spill between the reservation and this fill may have pushed the
    // record's pages out of the dirty list; pull them back.
    txn.unspill_run(pos.pgno)?;
    let (ovf, dlen) = {
        let pg = txn.page(pos.pgno)?;
        let nd = Node::at(pg, pos.index)?;
        let ovf = if nd.is_set(N_OVERFLOW) {
            Some(nd.overflow_pgno()?)
        } else {
            None
        };
        (ovf, nd.data_len())
    };
    if let Some(first) = ovf {
        txn.unspill_run(first)?;
    }
    ensure!(
        bytes.len() <= dlen,
        "fill of {} bytes exceeds the reserved {}",
        bytes.len(),
        dlen
    );
    match ovf {
        Some(first) => {
            let buf = txn.dirty_page_mut(first)?;
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        }
        None => {
            let pg = txn.dirty_page_mut(pos.pgno)?;
            node::data_mut(pg, pos.index)?[..bytes.len()].copy_from_slice(bytes);
        }
    }
    Ok(())
}
