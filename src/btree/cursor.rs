//! # Cursors
//!
//! A cursor is a stack of (page number, index) pairs from the root of a
//! tree down to one entry of one leaf. Pages are re-resolved through the
//! transaction on every access — the stack never holds pointers, so a
//! copy-on-write or spill can move a page without invalidating anything
//! beyond the numbers the write path fixes up.
//!
//! ## Search
//!
//! Descent binary-searches each page through the tree's comparator.
//! Branch pages carry an implicit minus-infinity separator at index 0:
//! the key stored there is ignored, and the search over separators starts
//! at index 1. Positioned cursors first check whether the target still
//! lies within the current leaf's first and last keys and skip the full
//! descent when it does.
//!
//! ## Sideways Movement
//!
//! `next`/`prev` bump the leaf index and, at the page edge, climb to the
//! deepest ancestor with a sibling, then descend its edge path. The climb
//! is bounded by the tree depth.
//!
//! ## Duplicate Sub-Cursors
//!
//! When a cursor parks on a node whose data holds duplicates, a secondary
//! position is initialized on demand: an index into the embedded
//! sub-page, or a full page stack over the duplicate sub-tree. Duplicate
//! values are the keys of that sub-structure; their data parts are empty.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::config::{Pgno, CURSOR_MAX_DEPTH, INVALID_PGNO, MAIN_TREE, PAGE_HEADER_SIZE};
use crate::storage::meta::TreeRecord;
use crate::storage::node::{self, Node, N_DUP, N_OVERFLOW, N_SUB_TREE};
use crate::storage::page::{self, PageHeader};
use crate::txn::{RwTxn, TxnStore};

use super::Comparator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CursorPos {
    pub pgno: Pgno,
    pub index: usize,
}

pub(crate) type PathStack = SmallVec<[CursorPos; 8]>;

/// Secondary position over one key's duplicate values.
#[derive(Debug, Clone)]
pub(crate) struct SubCursor {
    /// True when the duplicates live in their own sub-tree; false for an
    /// embedded sub-page.
    pub is_tree: bool,
    /// The sub-tree's record (meaningless for embedded sub-pages).
    pub record: TreeRecord,
    pub stack: PathStack,
    /// Index within the embedded sub-page.
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    pub tree: usize,
    pub stack: PathStack,
    pub initialized: bool,
    pub at_end: bool,
    /// The entry under the cursor was just deleted; the index already
    /// points at its successor.
    pub deleted: bool,
    pub sub: Option<SubCursor>,
}

impl CursorState {
    pub(crate) fn new(tree: usize) -> Self {
        Self {
            tree,
            stack: SmallVec::new(),
            initialized: false,
            at_end: false,
            deleted: false,
            sub: None,
        }
    }

    pub(crate) fn top_pos(&self) -> Result<CursorPos> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| eyre::eyre!("cursor is not positioned"))
    }

    /// Pages this cursor references; they must survive a spill.
    pub(crate) fn keep_pgnos(&self) -> Vec<Pgno> {
        let mut keep: Vec<Pgno> = self.stack.iter().map(|p| p.pgno).collect();
        if let Some(sub) = &self.sub {
            keep.extend(sub.stack.iter().map(|p| p.pgno));
        }
        keep
    }

    pub(crate) fn reset(&mut self) {
        self.stack.clear();
        self.initialized = false;
        self.at_end = false;
        self.deleted = false;
        self.sub = None;
    }
}

// ---------------------------------------------------------------------
// In-page search
// ---------------------------------------------------------------------

/// First index whose key is >= `key`, plus exactness. Works on slotted
/// and fixed-key leaves, including embedded sub-pages.
pub(crate) fn leaf_search(page: &[u8], key: &[u8], cmp: Comparator) -> Result<(usize, bool)> {
    let n = PageHeader::from_bytes(page)?.num_keys();
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp(node::leaf_key(page, mid)?, key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            _ => hi = mid,
        }
    }
    let exact = lo < n && cmp(node::leaf_key(page, lo)?, key).is_eq();
    Ok((lo, exact))
}

/// Child slot of a branch page for `key`; index 0 is the implicit
/// minus-infinity separator.
pub(crate) fn branch_child_index(page: &[u8], key: &[u8], cmp: Comparator) -> Result<usize> {
    let n = PageHeader::from_bytes(page)?.num_keys();
    let mut lo = 1usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp(Node::at(page, mid)?.key(), key) {
            std::cmp::Ordering::Greater => hi = mid,
            _ => lo = mid + 1,
        }
    }
    Ok(lo - 1)
}

// ---------------------------------------------------------------------
// Descent
// ---------------------------------------------------------------------

pub(crate) enum Target<'a> {
    Key(&'a [u8]),
    First,
    Last,
}

/// Walk from a root to a leaf, pushing the path. For `Key` targets the
/// leaf index is the insertion point; returns exactness.
pub(crate) fn descend_raw<T: TxnStore>(
    txn: &T,
    record: &TreeRecord,
    cmp: Comparator,
    stack: &mut PathStack,
    target: Target,
) -> Result<Option<bool>> {
    stack.clear();
    if record.root() == INVALID_PGNO {
        return Ok(None);
    }
    let mut pgno = record.root();
    loop {
        ensure!(
            stack.len() < CURSOR_MAX_DEPTH,
            "tree deeper than {} levels (corrupt tree)",
            CURSOR_MAX_DEPTH
        );
        let pg = txn.page(pgno)?;
        let hdr = PageHeader::from_bytes(pg)?;
        if hdr.is_leaf() {
            page::validate_tree_page(pg, page::P_LEAF)?;
            let n = hdr.num_keys();
            let (index, exact) = match target {
                Target::Key(key) => leaf_search(pg, key, cmp)?,
                Target::First => (0, true),
                Target::Last => (n.saturating_sub(1), true),
            };
            stack.push(CursorPos { pgno, index });
            return Ok(Some(exact));
        }
        page::validate_tree_page(pg, page::P_BRANCH)?;
        let n = hdr.num_keys();
        ensure!(n >= 1, "branch page {} has no children", pgno);
        let index = match target {
            Target::Key(key) => branch_child_index(pg, key, cmp)?,
            Target::First => 0,
            Target::Last => n - 1,
        };
        let child = Node::at(pg, index)?.child();
        stack.push(CursorPos { pgno, index });
        pgno = child;
    }
}

/// Move the path to the adjacent leaf. Returns false at the tree edge.
pub(crate) fn sibling<T: TxnStore>(txn: &T, stack: &mut PathStack, right: bool) -> Result<bool> {
    if stack.len() < 2 {
        return Ok(false);
    }
    // Deepest ancestor that can still move sideways.
    let mut level = stack.len() - 1;
    let move_level = loop {
        if level == 0 {
            return Ok(false);
        }
        let parent = stack[level - 1];
        let n = PageHeader::from_bytes(txn.page(parent.pgno)?)?.num_keys();
        let movable = if right {
            parent.index + 1 < n
        } else {
            parent.index > 0
        };
        if movable {
            break level - 1;
        }
        level -= 1;
    };
    if right {
        stack[move_level].index += 1;
    } else {
        stack[move_level].index -= 1;
    }
    stack.truncate(move_level + 1);

    // Edge path down to the leaf.
    loop {
        let top = *stack.last().unwrap();
        let pg = txn.page(top.pgno)?;
        if PageHeader::from_bytes(pg)?.is_leaf() {
            return Ok(true);
        }
        ensure!(
            stack.len() < CURSOR_MAX_DEPTH,
            "tree deeper than {} levels (corrupt tree)",
            CURSOR_MAX_DEPTH
        );
        let child = Node::at(pg, top.index)?.child();
        let cpg = txn.page(child)?;
        let n = PageHeader::from_bytes(cpg)?.num_keys();
        ensure!(n >= 1, "empty page {} inside the tree", child);
        let index = if right { 0 } else { n - 1 };
        stack.push(CursorPos { pgno: child, index });
    }
}

// ---------------------------------------------------------------------
// Positioning over one tree
// ---------------------------------------------------------------------

fn main_cmp<T: TxnStore>(txn: &T, state: &CursorState) -> Result<Comparator> {
    txn.key_cmp(state.tree)
}

/// Position at the smallest key. False on an empty tree.
pub(crate) fn seek_first<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    state.reset();
    let record = txn.tree_record(state.tree)?;
    let cmp = main_cmp(txn, state)?;
    if descend_raw(txn, &record, cmp, &mut state.stack, Target::First)?.is_none() {
        return Ok(false);
    }
    state.initialized = true;
    init_sub(txn, state, false)?;
    Ok(true)
}

pub(crate) fn seek_last<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    state.reset();
    let record = txn.tree_record(state.tree)?;
    let cmp = main_cmp(txn, state)?;
    if descend_raw(txn, &record, cmp, &mut state.stack, Target::Last)?.is_none() {
        return Ok(false);
    }
    state.initialized = true;
    init_sub(txn, state, true)?;
    Ok(true)
}

/// Whether `key` falls inside the currently loaded leaf, allowing the
/// descent to be skipped.
fn within_current_leaf<T: TxnStore>(
    txn: &T,
    state: &CursorState,
    key: &[u8],
    cmp: Comparator,
) -> Result<bool> {
    if !state.initialized || state.stack.is_empty() {
        return Ok(false);
    }
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let hdr = PageHeader::from_bytes(pg)?;
    if !hdr.is_leaf() || hdr.num_keys() == 0 {
        return Ok(false);
    }
    let first = node::leaf_key(pg, 0)?;
    let last = node::leaf_key(pg, hdr.num_keys() - 1)?;
    Ok(cmp(key, first).is_ge() && cmp(key, last).is_le())
}

/// Core lookup. Positions at the first entry >= `key` (insertion point on
/// miss) and reports exactness; the stack may end past the leaf's last
/// entry.
pub(crate) fn seek<T: TxnStore>(
    txn: &T,
    state: &mut CursorState,
    key: &[u8],
) -> Result<Option<bool>> {
    let record = txn.tree_record(state.tree)?;
    let cmp = main_cmp(txn, state)?;

    if within_current_leaf(txn, state, key, cmp)? {
        let top = state.top_pos()?;
        let (index, exact) = leaf_search(txn.page(top.pgno)?, key, cmp)?;
        let level = state.stack.len() - 1;
        state.stack[level].index = index;
        state.at_end = false;
        state.deleted = false;
        state.sub = None;
        state.initialized = true;
        return Ok(Some(exact));
    }

    state.reset();
    let exact = descend_raw(txn, &record, cmp, &mut state.stack, Target::Key(key))?;
    if exact.is_some() {
        state.initialized = true;
    }
    Ok(exact)
}

/// Exact-match positioning; initializes the duplicate position on hit.
pub(crate) fn seek_exact<T: TxnStore>(
    txn: &T,
    state: &mut CursorState,
    key: &[u8],
) -> Result<bool> {
    match seek(txn, state, key)? {
        Some(true) => {
            init_sub(txn, state, false)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Position at the least key >= `key`.
pub(crate) fn seek_range<T: TxnStore>(
    txn: &T,
    state: &mut CursorState,
    key: &[u8],
) -> Result<bool> {
    if seek(txn, state, key)?.is_none() {
        return Ok(false);
    }
    let top = state.top_pos()?;
    let n = PageHeader::from_bytes(txn.page(top.pgno)?)?.num_keys();
    if top.index >= n {
        // Ran off this leaf; the next leaf's first entry is the answer.
        if !sibling(txn, &mut state.stack, true)? {
            state.at_end = true;
            return Ok(false);
        }
    }
    init_sub(txn, state, false)?;
    Ok(true)
}

/// Position at `key` with a specific duplicate `value`. With `exact` the
/// value must match; otherwise the least duplicate >= `value` is chosen.
pub(crate) fn seek_both<T: TxnStore>(
    txn: &T,
    state: &mut CursorState,
    key: &[u8],
    value: &[u8],
    exact: bool,
) -> Result<bool> {
    if !seek_exact(txn, state, key)? {
        return Ok(false);
    }
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let nd = Node::at(pg, top.index)?;
    let dcmp = txn.dup_cmp(state.tree)?;
    if !nd.is_set(N_DUP) {
        let data = if nd.is_set(N_OVERFLOW) {
            let run = txn.overflow_run(nd.overflow_pgno()?)?;
            &run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + nd.data_len()]
        } else {
            nd.data()?
        };
        let ord = dcmp(data, value);
        return Ok(if exact { ord.is_eq() } else { ord.is_ge() });
    }
    sub_seek(txn, state, value, exact)
}

// ---------------------------------------------------------------------
// Duplicate sub-cursor
// ---------------------------------------------------------------------

/// Slice of the embedded sub-page under the cursor's current node.
pub(crate) fn sub_page<'a, T: TxnStore>(txn: &'a T, state: &CursorState) -> Result<&'a [u8]> {
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    Node::at(pg, top.index)?.data()
}

/// Set up the duplicate position for the node under the cursor, parked on
/// the first (or last) value.
pub(crate) fn init_sub<T: TxnStore>(txn: &T, state: &mut CursorState, last: bool) -> Result<()> {
    state.sub = None;
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let hdr = PageHeader::from_bytes(pg)?;
    if hdr.is_fixed_leaf() || top.index >= hdr.num_keys() {
        return Ok(());
    }
    let nd = Node::at(pg, top.index)?;
    if !nd.is_set(N_DUP) {
        return Ok(());
    }

    if nd.is_set(N_SUB_TREE) {
        let record = TreeRecord::read_from(nd.data()?)?;
        let dcmp = txn.dup_cmp(state.tree)?;
        let mut stack = PathStack::new();
        let target = if last { Target::Last } else { Target::First };
        ensure!(
            descend_raw(txn, &record, dcmp, &mut stack, target)?.is_some(),
            "duplicate sub-tree of page {} is empty",
            top.pgno
        );
        state.sub = Some(SubCursor {
            is_tree: true,
            record,
            stack,
            pos: 0,
        });
    } else {
        let sp = nd.data()?;
        let n = PageHeader::from_bytes(sp)?.num_keys();
        ensure!(n > 0, "empty duplicate sub-page on page {}", top.pgno);
        state.sub = Some(SubCursor {
            is_tree: false,
            record: TreeRecord::new(0),
            stack: PathStack::new(),
            pos: if last { n - 1 } else { 0 },
        });
    }
    Ok(())
}

/// Advance within the duplicates of the current key.
pub(crate) fn sub_next<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    let Some(sub) = state.sub.as_ref() else {
        return Ok(false);
    };
    if sub.is_tree {
        let mut stack = std::mem::take(&mut state.sub.as_mut().unwrap().stack);
        let moved = step_in_stack(txn, &mut stack, true)?;
        state.sub.as_mut().unwrap().stack = stack;
        Ok(moved)
    } else {
        let n = PageHeader::from_bytes(sub_page(txn, state)?)?.num_keys();
        let sub = state.sub.as_mut().unwrap();
        if sub.pos + 1 < n {
            sub.pos += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

pub(crate) fn sub_prev<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    let Some(sub) = state.sub.as_ref() else {
        return Ok(false);
    };
    if sub.is_tree {
        let mut stack = std::mem::take(&mut state.sub.as_mut().unwrap().stack);
        let moved = step_in_stack(txn, &mut stack, false)?;
        state.sub.as_mut().unwrap().stack = stack;
        Ok(moved)
    } else {
        let sub = state.sub.as_mut().unwrap();
        if sub.pos > 0 {
            sub.pos -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Position the sub-cursor at `value` (exact or least >=).
pub(crate) fn sub_seek<T: TxnStore>(
    txn: &T,
    state: &mut CursorState,
    value: &[u8],
    exact: bool,
) -> Result<bool> {
    let dcmp = txn.dup_cmp(state.tree)?;
    let Some(sub) = state.sub.as_ref() else {
        bail!("cursor is not parked on a duplicate node");
    };
    if sub.is_tree {
        let record = sub.record;
        let mut stack = PathStack::new();
        let hit = descend_raw(txn, &record, dcmp, &mut stack, Target::Key(value))?;
        let Some(hit_exact) = hit else {
            return Ok(false);
        };
        if exact && !hit_exact {
            return Ok(false);
        }
        if !hit_exact {
            let top = *stack.last().unwrap();
            let n = PageHeader::from_bytes(txn.page(top.pgno)?)?.num_keys();
            if top.index >= n && !sibling(txn, &mut stack, true)? {
                return Ok(false);
            }
        }
        state.sub.as_mut().unwrap().stack = stack;
        Ok(true)
    } else {
        let (index, hit_exact) = leaf_search(sub_page(txn, state)?, value, dcmp)?;
        let n = PageHeader::from_bytes(sub_page(txn, state)?)?.num_keys();
        if exact && !hit_exact {
            return Ok(false);
        }
        if index >= n {
            return Ok(false);
        }
        state.sub.as_mut().unwrap().pos = index;
        Ok(true)
    }
}

/// Current duplicate value.
pub(crate) fn sub_current<'a, T: TxnStore>(txn: &'a T, state: &CursorState) -> Result<&'a [u8]> {
    let sub = state
        .sub
        .as_ref()
        .ok_or_else(|| eyre::eyre!("cursor is not parked on a duplicate node"))?;
    if sub.is_tree {
        let top = sub
            .stack
            .last()
            .ok_or_else(|| eyre::eyre!("duplicate cursor is not positioned"))?;
        node::leaf_key(txn.page(top.pgno)?, top.index)
    } else {
        node::leaf_key(sub_page(txn, state)?, sub.pos)
    }
}

/// Number of values stored under the current key.
pub(crate) fn dup_count<T: TxnStore>(txn: &T, state: &CursorState) -> Result<u64> {
    ensure!(state.initialized && !state.deleted, "cursor is not positioned");
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let nd = Node::at(pg, top.index)?;
    if !nd.is_set(N_DUP) {
        return Ok(1);
    }
    if nd.is_set(N_SUB_TREE) {
        Ok(TreeRecord::read_from(nd.data()?)?.entries())
    } else {
        Ok(PageHeader::from_bytes(nd.data()?)?.num_keys() as u64)
    }
}

fn step_in_stack<T: TxnStore>(txn: &T, stack: &mut PathStack, right: bool) -> Result<bool> {
    let top = stack.len() - 1;
    let pos = stack[top];
    let n = PageHeader::from_bytes(txn.page(pos.pgno)?)?.num_keys();
    if right {
        if pos.index + 1 < n {
            stack[top].index += 1;
            return Ok(true);
        }
    } else if pos.index > 0 {
        stack[top].index -= 1;
        return Ok(true);
    }
    sibling(txn, stack, right)
}

// ---------------------------------------------------------------------
// Whole-cursor stepping
// ---------------------------------------------------------------------

/// Advance to the next entry of the main tree (skipping remaining
/// duplicates of the current key).
pub(crate) fn step_next<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    ensure!(state.initialized, "cursor is not positioned");
    if state.at_end {
        return Ok(false);
    }
    let top = state.stack.len() - 1;
    let pos = state.stack[top];
    let n = PageHeader::from_bytes(txn.page(pos.pgno)?)?.num_keys();
    if state.deleted {
        state.deleted = false;
        if pos.index < n {
            init_sub(txn, state, false)?;
            return Ok(true);
        }
    } else if pos.index + 1 < n {
        state.stack[top].index += 1;
        init_sub(txn, state, false)?;
        return Ok(true);
    }
    if sibling(txn, &mut state.stack, true)? {
        init_sub(txn, state, false)?;
        Ok(true)
    } else {
        state.at_end = true;
        Ok(false)
    }
}

pub(crate) fn step_prev<T: TxnStore>(txn: &T, state: &mut CursorState) -> Result<bool> {
    ensure!(state.initialized, "cursor is not positioned");
    state.at_end = false;
    state.deleted = false;
    let top = state.stack.len() - 1;
    let pos = state.stack[top];
    if pos.index > 0 {
        state.stack[top].index -= 1;
        init_sub(txn, state, true)?;
        return Ok(true);
    }
    if sibling(txn, &mut state.stack, false)? {
        init_sub(txn, state, true)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// (key, data) under the cursor, zero-copy.
pub(crate) fn current_entry<'a, T: TxnStore>(
    txn: &'a T,
    state: &CursorState,
) -> Result<Option<(&'a [u8], &'a [u8])>> {
    if !state.initialized || state.at_end || state.deleted {
        return Ok(None);
    }
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let hdr = PageHeader::from_bytes(pg)?;
    if top.index >= hdr.num_keys() {
        return Ok(None);
    }
    if hdr.is_fixed_leaf() {
        let key = page::fixed_key(pg, top.index, hdr.fixed_ksize());
        return Ok(Some((key, &[])));
    }
    let nd = Node::at(pg, top.index)?;
    let key = nd.key();
    let data: &'a [u8] = if nd.is_set(N_DUP) {
        sub_current(txn, state)?
    } else if nd.is_set(N_OVERFLOW) {
        let run = txn.overflow_run(nd.overflow_pgno()?)?;
        &run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + nd.data_len()]
    } else {
        nd.data()?
    };
    Ok(Some((key, data)))
}

/// Point lookup through a throwaway cursor.
pub(crate) fn tree_get<'a, T: TxnStore>(
    txn: &'a T,
    tree: usize,
    key: &[u8],
) -> Result<Option<&'a [u8]>> {
    let mut state = CursorState::new(tree);
    if !seek_exact(txn, &mut state, key)? {
        return Ok(None);
    }
    Ok(current_entry(txn, &state)?.map(|(_, d)| d))
}

/// Resolve a named tree's record through the main tree.
pub(crate) fn lookup_tree_record<T: TxnStore>(
    txn: &T,
    name: &[u8],
) -> Result<Option<TreeRecord>> {
    let mut state = CursorState::new(MAIN_TREE);
    if !seek_exact(txn, &mut state, name)? {
        return Ok(None);
    }
    let top = state.top_pos()?;
    let pg = txn.page(top.pgno)?;
    let nd = Node::at(pg, top.index)?;
    ensure!(
        nd.is_set(N_SUB_TREE) && !nd.is_set(N_DUP),
        "key exists in the main tree but is not a named tree"
    );
    TreeRecord::read_from(nd.data()?).map(Some)
}

// ---------------------------------------------------------------------
// Public cursors
// ---------------------------------------------------------------------

/// Read cursor over one tree. Multiple read cursors may coexist on one
/// transaction; every returned slice borrows from the transaction's
/// snapshot.
pub struct Cursor<'t, T: TxnStore> {
    txn: &'t T,
    state: CursorState,
}

type Entry<'t> = Option<(&'t [u8], &'t [u8])>;

impl<'t, T: TxnStore> Cursor<'t, T> {
    pub(crate) fn new(txn: &'t T, tree: usize) -> Self {
        Self {
            txn,
            state: CursorState::new(tree),
        }
    }

    pub fn first(&mut self) -> Result<Entry<'t>> {
        if !seek_first(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    pub fn last(&mut self) -> Result<Entry<'t>> {
        if !seek_last(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Next duplicate of the current key, then the next key.
    pub fn next(&mut self) -> Result<Entry<'t>> {
        if !self.state.initialized {
            return self.first();
        }
        if !self.state.deleted && sub_next(self.txn, &mut self.state)? {
            return current_entry(self.txn, &self.state);
        }
        if !step_next(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    pub fn prev(&mut self) -> Result<Entry<'t>> {
        if !self.state.initialized {
            return self.last();
        }
        if sub_prev(self.txn, &mut self.state)? {
            return current_entry(self.txn, &self.state);
        }
        if !step_prev(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Position at `key` exactly; returns its (first) data.
    pub fn set(&mut self, key: &[u8]) -> Result<Option<&'t [u8]>> {
        if !seek_exact(self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        Ok(current_entry(self.txn, &self.state)?.map(|(_, d)| d))
    }

    /// Like `set`, returning the stored key slice as well.
    pub fn set_key(&mut self, key: &[u8]) -> Result<Entry<'t>> {
        if !seek_exact(self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Position at the least key >= `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Entry<'t>> {
        if !seek_range(self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    pub fn get_current(&self) -> Result<Entry<'t>> {
        current_entry(self.txn, &self.state)
    }

    /// First duplicate of the current key.
    pub fn first_dup(&mut self) -> Result<Option<&'t [u8]>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        init_sub(self.txn, &mut self.state, false)?;
        Ok(current_entry(self.txn, &self.state)?.map(|(_, d)| d))
    }

    pub fn last_dup(&mut self) -> Result<Option<&'t [u8]>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        init_sub(self.txn, &mut self.state, true)?;
        Ok(current_entry(self.txn, &self.state)?.map(|(_, d)| d))
    }

    /// Next duplicate of the current key only.
    pub fn next_dup(&mut self) -> Result<Entry<'t>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        if !sub_next(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    pub fn prev_dup(&mut self) -> Result<Entry<'t>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        if !sub_prev(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// First duplicate of the next key.
    pub fn next_nodup(&mut self) -> Result<Entry<'t>> {
        if !self.state.initialized {
            return self.first();
        }
        if !step_next(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Last duplicate of the previous key.
    pub fn prev_nodup(&mut self) -> Result<Entry<'t>> {
        if !self.state.initialized {
            return self.last();
        }
        if !step_prev(self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Position at an exact (key, value) pair.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Entry<'t>> {
        if !seek_both(self.txn, &mut self.state, key, value, true)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    /// Position at `key` with the least duplicate >= `value`.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Entry<'t>> {
        if !seek_both(self.txn, &mut self.state, key, value, false)? {
            return Ok(None);
        }
        current_entry(self.txn, &self.state)
    }

    pub fn dup_count(&self) -> Result<u64> {
        dup_count(self.txn, &self.state)
    }
}

/// Write cursor: the only cursor a write transaction exposes, holding the
/// transaction exclusively so splits and merges only ever have one stack
/// to fix up.
pub struct WriteCursor<'t, 'e> {
    txn: &'t mut RwTxn<'e>,
    pub(crate) state: CursorState,
}

impl<'t, 'e> WriteCursor<'t, 'e> {
    pub(crate) fn new(txn: &'t mut RwTxn<'e>, tree: usize) -> Self {
        Self {
            txn,
            state: CursorState::new(tree),
        }
    }

    pub fn first(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_first(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn last(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_last(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn next(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !self.state.initialized {
            return self.first();
        }
        if !self.state.deleted && sub_next(&*self.txn, &mut self.state)? {
            return current_entry(&*self.txn, &self.state);
        }
        if !step_next(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn prev(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !self.state.initialized {
            return self.last();
        }
        if sub_prev(&*self.txn, &mut self.state)? {
            return current_entry(&*self.txn, &self.state);
        }
        if !step_prev(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<&[u8]>> {
        if !seek_exact(&*self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        Ok(current_entry(&*self.txn, &self.state)?.map(|(_, d)| d))
    }

    /// Like `set`, returning the stored key slice as well.
    pub fn set_key(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_exact(&*self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_range(&*self.txn, &mut self.state, key)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn get_current(&self) -> Result<Option<(&[u8], &[u8])>> {
        current_entry(&*self.txn, &self.state)
    }

    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_both(&*self.txn, &mut self.state, key, value, true)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        if !seek_both(&*self.txn, &mut self.state, key, value, false)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    /// First duplicate of the current key.
    pub fn first_dup(&mut self) -> Result<Option<&[u8]>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        init_sub(&*self.txn, &mut self.state, false)?;
        Ok(current_entry(&*self.txn, &self.state)?.map(|(_, d)| d))
    }

    pub fn last_dup(&mut self) -> Result<Option<&[u8]>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        init_sub(&*self.txn, &mut self.state, true)?;
        Ok(current_entry(&*self.txn, &self.state)?.map(|(_, d)| d))
    }

    pub fn next_dup(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        if !sub_next(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn prev_dup(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        ensure!(self.state.initialized, "cursor is not positioned");
        if !sub_prev(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn next_nodup(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !self.state.initialized {
            return self.first();
        }
        if !step_next(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    /// Last duplicate of the previous key.
    pub fn prev_nodup(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if !self.state.initialized {
            return self.last();
        }
        if !step_prev(&*self.txn, &mut self.state)? {
            return Ok(None);
        }
        current_entry(&*self.txn, &self.state)
    }

    pub fn dup_count(&self) -> Result<u64> {
        dup_count(&*self.txn, &self.state)
    }

    /// Insert or update through the cursor; the cursor ends positioned on
    /// the written entry.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: u32) -> Result<()> {
        ensure!(
            self.state.tree != crate::config::FREE_TREE,
            "the free tree is maintained by commit and cannot be written directly"
        );
        self.txn.guard_usable()?;
        let result = super::update::cursor_put(self.txn, &mut self.state, key, data, flags);
        if let Err(e) = &result {
            if !super::update::is_benign(e) {
                self.txn.mark_error();
            }
        }
        result
    }

    /// Delete the entry (or with `delete_dups` every duplicate) under the
    /// cursor.
    pub fn del(&mut self, delete_dups: bool) -> Result<()> {
        ensure!(
            self.state.tree != crate::config::FREE_TREE,
            "the free tree is maintained by commit and cannot be written directly"
        );
        self.txn.guard_usable()?;
        ensure!(
            self.state.initialized && !self.state.deleted,
            "cursor is not positioned on an entry"
        );
        let result = super::update::cursor_del(self.txn, &mut self.state, delete_dups);
        if let Err(e) = &result {
            if !super::update::is_benign(e) {
                self.txn.mark_error();
            }
        }
        result
    }
}
