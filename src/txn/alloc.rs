//! # Page Allocation, Copy-on-Write, Spill, and Reclamation
//!
//! The writer never mutates a mapped page. Every page it touches is first
//! copied into a heap buffer on the dirty list under a fresh page number
//! (copy-on-write), and the old page number joins the transaction's freed
//! list. At commit the freed list is saved into the free tree keyed by the
//! committing txnid; a later writer may reclaim those pages once no
//! reader's snapshot can still see them.
//!
//! ## Allocation Order
//!
//! 1. **Loose pages** — dirtied and freed in this same transaction; the
//!    buffer is still on the dirty list and is reused as-is.
//! 2. **Reclaimed runs** — the in-memory `reclaim` list holds page
//!    numbers read back from old free-tree records, sorted descending so
//!    the smallest numbers sit at the tail where contiguous runs are
//!    searched first.
//! 3. **Free-tree records** — read the next record whose key exceeds
//!    `last_reclaimed`, but only while its key is older than the oldest
//!    live reader snapshot; the reader table is re-scanned once before
//!    giving up on a record.
//! 4. **Fresh pages** — extend past `next_pgno`; "map full" when the
//!    configured map is exhausted.
//!
//! The record-merging loop is bounded by [`RECLAIM_SCAN_BUDGET`] per
//! requested page so a badly fragmented free set cannot stall a writer.
//!
//! ## Spill
//!
//! When the dirty list approaches capacity, about an eighth of it is
//! flushed to disk early. Spilled page numbers are remembered shifted
//! left by one (the low bit marks later deletion); touching a spilled
//! page pulls it back as a dirty page under its own number. Pages
//! referenced by the live cursor stack and pages owned by an ancestor
//! nested frame are never spilled.
//!
//! ## Saving the Free List
//!
//! Saving freed pages itself dirties free-tree pages and can free more,
//! so `freelist_save` iterates to a fixed point: delete the records this
//! writer consumed, rewrite the record for this txnid (reserve first,
//! fill once stable), then park any unused reclaimed pages back under old
//! keys, splitting records at the one-page capacity. While it runs the
//! allocator stops reading the free tree, closing the recursion.

use eyre::{ensure, Result};

use crate::btree::cursor::{self, CursorState};
use crate::btree::update;
use crate::config::{
    max_free_entries_1pg, Pgno, TxnId, FREE_TREE, PAGE_HEADER_SIZE, RECLAIM_SCAN_BUDGET,
    SPILL_DENOMINATOR,
};
use crate::storage::idl::{DirtyPage, IdList};
use crate::storage::node::{self, Node};
use crate::storage::page::{PageHeader, P_DIRTY, P_LOOSE, P_OVERFLOW};

use super::{RwTxn, TxnStore};

impl RwTxn<'_> {
    /// Reserve `count` contiguous page numbers, preferring reclaimed
    /// pages over growing the file.
    pub(crate) fn alloc_pgno(&mut self, count: usize) -> Result<Pgno> {
        ensure!(count > 0, "cannot allocate an empty run");
        let mut budget = RECLAIM_SCAN_BUDGET.saturating_mul(count);
        let mut oldest: Option<TxnId> = None;
        let mut rescanned = false;

        loop {
            if let Some(pgno) = self.state_mut().reclaim.take_run(count) {
                return Ok(pgno);
            }
            if self.state().in_freelist_save || budget == 0 {
                break;
            }
            budget -= 1;

            let last = self.state().last_reclaimed;
            let Some((key, list)) = read_free_record_after(self, last)? else {
                break;
            };
            let limit =
                *oldest.get_or_insert_with(|| self.env.readers().oldest(self.txnid - 1));
            if key >= limit {
                if rescanned {
                    break;
                }
                // A reader may have ended since the snapshot scan; look
                // once more before giving up on this record.
                rescanned = true;
                let fresh = self.env.readers().oldest(self.txnid - 1);
                oldest = Some(fresh);
                if key >= fresh {
                    break;
                }
            }
            self.state_mut().reclaim.merge(list.as_slice());
            self.state_mut().last_reclaimed = key;
        }

        let next = self.state().next_pgno;
        let max = self.file.max_pgs();
        ensure!(
            next + count as u64 <= max,
            "map full: need {} pages at {}, map holds {} pages",
            count,
            next,
            max
        );
        self.state_mut().next_pgno = next + count as u64;
        Ok(next)
    }

    /// Allocate a zeroed dirty page (or overflow run) ready for writing.
    pub(crate) fn page_new(&mut self, flags: u16, count: usize) -> Result<Pgno> {
        let psize = self.file.page_size();

        if count == 1 {
            if let Some(pgno) = self.state_mut().loose.pop() {
                let page = self.dirty_page_mut(pgno)?;
                page[PAGE_HEADER_SIZE..].fill(0);
                let hdr = PageHeader::from_bytes_mut(page)?;
                hdr.init(flags | P_DIRTY, psize);
                hdr.set_pgno(pgno);
                return Ok(pgno);
            }
        }

        let pgno = self.alloc_pgno(count)?;
        let mut buf = vec![0u8; count * psize].into_boxed_slice();
        {
            let hdr = PageHeader::from_bytes_mut(&mut buf)?;
            if flags & P_OVERFLOW != 0 {
                hdr.set_flags(flags | P_DIRTY);
                hdr.set_overflow_count(count);
            } else {
                hdr.init(flags | P_DIRTY, psize);
            }
            hdr.set_pgno(pgno);
        }
        self.state_mut().dirty.insert(DirtyPage { pgno, count, buf })?;
        Ok(pgno)
    }

    /// Release one tree page. Pages this transaction itself dirtied turn
    /// loose and are reused directly; everything else joins the freed
    /// list destined for the free tree.
    pub(crate) fn page_free(&mut self, pgno: Pgno) -> Result<()> {
        let pn = pgno << 1;
        if self.state().dirty.get(pgno).is_some() && !self.owned_by_ancestor(pgno) {
            let page = self.dirty_page_mut(pgno)?;
            PageHeader::from_bytes_mut(page)?.add_flags(P_LOOSE);
            self.state_mut().loose.push(pgno);
            return Ok(());
        }
        if self.state_mut().spilled.remove(pn) {
            // Keep the number, flagged deleted, so the spill set still
            // records that the on-disk copy is ours.
            let state = self.state_mut();
            state.spilled.push(pn | 1);
            state.spilled.sort();
        }
        self.state_mut().free_pages.push(pgno);
        Ok(())
    }

    /// Release a whole overflow run. Runs this transaction allocated (or
    /// just spilled) go back to the reclaim list; committed runs join the
    /// freed list. Returns the run length.
    pub(crate) fn free_overflow(&mut self, first: Pgno) -> Result<usize> {
        let (count, dirty_here) = {
            let page = self.page(first)?;
            let hdr = PageHeader::from_bytes(page)?;
            ensure!(
                hdr.is_overflow(),
                "page {} is not the head of an overflow run",
                first
            );
            (hdr.overflow_count(), self.state().dirty.get(first).is_some())
        };
        let pn = first << 1;
        let spilled_here = self.state().spilled.contains(pn);
        let reclaim_ready = self.state().last_reclaimed > 0;

        if reclaim_ready && (dirty_here || spilled_here) && !self.owned_by_ancestor(first) {
            if dirty_here {
                self.state_mut().dirty.remove(first);
            } else {
                let state = self.state_mut();
                state.spilled.remove(pn);
                state.spilled.push(pn | 1);
                state.spilled.sort();
            }
            let mut run = IdList::new();
            run.push_run(first, count);
            run.sort();
            self.state_mut().reclaim.merge(run.as_slice());
        } else {
            if spilled_here {
                let state = self.state_mut();
                state.spilled.remove(pn);
                state.spilled.push(pn | 1);
                state.spilled.sort();
            }
            self.state_mut().free_pages.push_run(first, count);
        }
        Ok(count)
    }

    /// Make every page on the cursor stack writable, copy-on-writing
    /// clean pages and pulling spilled ones back in. Parent pointers
    /// follow the moved pages; a moved root is returned for the caller to
    /// store in whichever record owns this tree.
    pub(crate) fn page_touch(&mut self, stack: &mut [cursor::CursorPos]) -> Result<Option<Pgno>> {
        let psize = self.file.page_size();
        let mut new_root = None;
        for level in 0..stack.len() {
            let pgno = stack[level].pgno;
            if self.state().dirty.get(pgno).is_some() {
                continue;
            }

            let pn = pgno << 1;
            let spilled_here = self.state().spilled.contains(pn);
            if spilled_here || self.owned_by_ancestor(pgno) {
                // The page already belongs to this transaction; shadow it
                // under the same number.
                let mut buf = vec![0u8; psize].into_boxed_slice();
                buf.copy_from_slice(self.page(pgno)?);
                PageHeader::from_bytes_mut(&mut buf)?.add_flags(P_DIRTY);
                if spilled_here {
                    self.state_mut().spilled.remove(pn);
                }
                self.state_mut()
                    .dirty
                    .insert(DirtyPage { pgno, count: 1, buf })?;
                continue;
            }

            // Loose pages come first, as in every allocation; their
            // buffers already sit on the dirty list.
            let new_pgno = match self.state_mut().loose.pop() {
                Some(reused) => {
                    let old = self.page(pgno)?.to_vec();
                    let page = self.dirty_page_mut(reused)?;
                    page.copy_from_slice(&old);
                    let hdr = PageHeader::from_bytes_mut(page)?;
                    hdr.set_pgno(reused);
                    hdr.add_flags(P_DIRTY);
                    hdr.clear_flags(P_LOOSE);
                    reused
                }
                None => {
                    let fresh = self.alloc_pgno(1)?;
                    let mut buf = vec![0u8; psize].into_boxed_slice();
                    buf.copy_from_slice(self.page(pgno)?);
                    {
                        let hdr = PageHeader::from_bytes_mut(&mut buf)?;
                        hdr.set_pgno(fresh);
                        hdr.add_flags(P_DIRTY);
                    }
                    self.state_mut()
                        .dirty
                        .insert(DirtyPage { pgno: fresh, count: 1, buf })?;
                    fresh
                }
            };
            self.state_mut().free_pages.push(pgno);

            if level == 0 {
                new_root = Some(new_pgno);
            } else {
                let parent = stack[level - 1];
                let ppage = self.dirty_page_mut(parent.pgno)?;
                node::set_child(ppage, parent.index, new_pgno)?;
            }
            stack[level].pgno = new_pgno;
        }
        Ok(new_root)
    }

    /// Pull a spilled page (or overflow run) back into the dirty list
    /// under its own number. No-op when the page was never spilled.
    pub(crate) fn unspill_run(&mut self, first: Pgno) -> Result<bool> {
        let pn = first << 1;
        if !self.state().spilled.contains(pn) {
            return Ok(false);
        }
        let psize = self.file.page_size();
        let count = {
            let hdr = PageHeader::from_bytes(self.page(first)?)?;
            if hdr.is_overflow() {
                hdr.overflow_count()
            } else {
                1
            }
        };
        let mut buf = vec![0u8; count * psize].into_boxed_slice();
        buf.copy_from_slice(self.file.page(first, count)?);
        PageHeader::from_bytes_mut(&mut buf)?.add_flags(P_DIRTY);
        self.state_mut().spilled.remove(pn);
        self.state_mut()
            .dirty
            .insert(DirtyPage { pgno: first, count, buf })?;
        Ok(true)
    }

    /// Flush part of the dirty list early when the next operation might
    /// not fit. `keep` pins the pages the live cursor references.
    pub(crate) fn spill_check(&mut self, keep: &[Pgno], need: usize) -> Result<()> {
        if self.state().dirty.room() > need {
            return Ok(());
        }
        let total = self.state().dirty.len();
        let want = (total / SPILL_DENOMINATOR).max(need).min(total);

        // Tail first: highest page numbers are the least likely to be
        // touched again by an ordered workload.
        let candidates: Vec<(Pgno, bool)> = self
            .state()
            .dirty
            .iter()
            .map(|e| {
                let loose = PageHeader::from_bytes(&e.buf)
                    .map(|h| h.is_set(P_LOOSE))
                    .unwrap_or(false);
                (e.pgno, loose)
            })
            .collect();

        let mut spilled = 0usize;
        for &(pgno, loose) in candidates.iter().rev() {
            if spilled >= want {
                break;
            }
            if loose || keep.contains(&pgno) || self.owned_by_ancestor(pgno) {
                continue;
            }
            let mut entry = self
                .state_mut()
                .dirty
                .remove(pgno)
                .expect("candidate came from the dirty list");
            PageHeader::from_bytes_mut(&mut entry.buf)?.clear_flags(P_DIRTY);
            self.file.write_run(pgno, &[&entry.buf])?;
            self.state_mut().spilled.push(pgno << 1);
            spilled += entry.count;
        }
        self.state_mut().spilled.sort();
        Ok(())
    }
}

/// Read the free-tree record with the smallest key greater than `last`.
fn read_free_record_after(txn: &RwTxn, last: TxnId) -> Result<Option<(TxnId, IdList)>> {
    let mut state = CursorState::new(FREE_TREE);
    let target = (last + 1).to_ne_bytes();
    if !cursor::seek_range(txn, &mut state, &target)? {
        return Ok(None);
    }
    let pos = state.top_pos()?;
    let page = txn.page(pos.pgno)?;
    let node = Node::at(page, pos.index)?;
    let key = node.key();
    ensure!(
        key.len() == 8,
        "free-tree key has length {} (corrupt free tree)",
        key.len()
    );
    let id = TxnId::from_ne_bytes(key.try_into().unwrap());
    let data_len = node.data_len();
    let list = if node.is_set(node::N_OVERFLOW) {
        let run = txn.overflow_run(node.overflow_pgno()?)?;
        IdList::read_from(&run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data_len])?
    } else {
        IdList::read_from(node.data()?)?
    };
    Ok(Some((id, list)))
}

/// Persist the transaction's freed pages into the free tree; see the
/// module docs for the fixed-point structure.
pub(crate) fn freelist_save(txn: &mut RwTxn) -> Result<()> {
    txn.state_mut().in_freelist_save = true;
    let result = freelist_save_inner(txn);
    txn.state_mut().in_freelist_save = false;
    result
}

fn freelist_save_inner(txn: &mut RwTxn) -> Result<()> {
    let maxfree = max_free_entries_1pg(txn.file.page_size()) as i64;
    let mut pglast: TxnId = 0;
    let mut head_id: TxnId = 0;
    let mut total_room: i64 = 0;
    let mut head_room: i64 = 0;
    let mut own_saved = 0usize;
    let mut extra_round = true;

    if txn.state().last_reclaimed > 0 {
        // The first record will be deleted below; make sure its path is
        // ours before the bookkeeping starts.
        let mut st = CursorState::new(FREE_TREE);
        if cursor::seek_first(txn, &mut st)? {
            update::touch_cursor(txn, &mut st)?;
        }
    }

    loop {
        // Without a consumed record there is no old key to park loose
        // pages under; fold them into this transaction's freed list
        // (they reappear below as a growth of `free_pages`).
        if txn.state().last_reclaimed == 0 && !txn.state().loose.is_empty() {
            let loose: Vec<Pgno> = std::mem::take(&mut txn.state_mut().loose);
            for pgno in loose {
                txn.state_mut().dirty.remove(pgno);
                txn.state_mut().free_pages.push(pgno);
            }
            txn.state_mut().free_pages.sort();
        }

        // Records this writer consumed are spent; delete them.
        while pglast < txn.state().last_reclaimed {
            let mut st = CursorState::new(FREE_TREE);
            ensure!(
                cursor::seek_first(txn, &mut st)?,
                "free tree lost a record this writer consumed"
            );
            let pos = st.top_pos()?;
            let key = {
                let page = txn.page(pos.pgno)?;
                Node::at(page, pos.index)?.key().to_vec()
            };
            ensure!(key.len() == 8, "free-tree key has length {}", key.len());
            pglast = TxnId::from_ne_bytes(key[..8].try_into().unwrap());
            head_id = pglast;
            total_room = 0;
            head_room = 0;
            ensure!(
                pglast <= txn.state().last_reclaimed,
                "free tree holds an unconsumed record {} below the consumed bound {}",
                pglast,
                txn.state().last_reclaimed
            );
            update::cursor_del(txn, &mut st, true)?;
        }

        // This transaction's own freed pages, under its txnid. Reserving
        // may free more pages, so loop until the list stops growing.
        if own_saved < txn.state().free_pages.len() {
            if own_saved == 0 {
                let mut st = CursorState::new(FREE_TREE);
                if cursor::seek_last(txn, &mut st)? {
                    update::touch_cursor(txn, &mut st)?;
                }
            }
            let key = txn.id().to_ne_bytes();
            loop {
                own_saved = txn.state().free_pages.len();
                let len = (own_saved + 1) * 8;
                let mut st = CursorState::new(FREE_TREE);
                update::cursor_put_reserve(txn, &mut st, &key, len)?;
                if txn.state().free_pages.len() == own_saved {
                    txn.state_mut().free_pages.sort();
                    let mut bytes = vec![0u8; len];
                    txn.state().free_pages.write_to(&mut bytes)?;
                    update::record_fill(txn, st.top_pos()?, &bytes)?;
                    break;
                }
            }
            continue;
        }

        // Park unused reclaimed pages (plus loose, returned below) under
        // keys in (0, last_reclaimed], splitting at one page per record.
        let park = (txn.state().reclaim.len() + txn.state().loose.len()) as i64;
        if total_room >= park {
            if total_room == park || !extra_round {
                break;
            }
            extra_round = false;
        } else if head_room >= maxfree && head_id > 1 {
            // Current record is already a full page; start another.
            head_id -= 1;
            head_room = 0;
        }
        total_room -= head_room;
        head_room = park - total_room;
        if head_room > maxfree && head_id > 1 {
            head_room /= head_id as i64;
            head_room += maxfree - head_room % (maxfree + 1);
        } else if head_room < 0 {
            head_room = 0;
        }
        let key = head_id.to_ne_bytes();
        let len = (head_room as usize + 1) * 8;
        let mut st = CursorState::new(FREE_TREE);
        update::cursor_put_reserve(txn, &mut st, &key, len)?;
        // A crash between here and the fill must read an empty list.
        update::record_fill(txn, st.top_pos()?, &0u64.to_ne_bytes())?;
        total_room += head_room;
    }

    // Loose pages still alive join the reclaimed set; their buffers need
    // not be written anywhere.
    if !txn.state().loose.is_empty() {
        let loose: Vec<Pgno> = std::mem::take(&mut txn.state_mut().loose);
        let mut list = IdList::new();
        for pgno in loose {
            txn.state_mut().dirty.remove(pgno);
            list.push(pgno);
        }
        list.sort();
        txn.state_mut().reclaim.merge(list.as_slice());
    }

    // Fill the reserved records, smallest keys taking the smallest pages.
    let mut remaining = txn.state().reclaim.len();
    if remaining > 0 {
        let mut st = CursorState::new(FREE_TREE);
        let mut found = cursor::seek_first(txn, &mut st)?;
        while found && remaining > 0 {
            let pos = st.top_pos()?;
            let (key_id, reserved) = {
                let page = txn.page(pos.pgno)?;
                let node = Node::at(page, pos.index)?;
                let key = node.key();
                ensure!(key.len() == 8, "free-tree key has length {}", key.len());
                (
                    TxnId::from_ne_bytes(key.try_into().unwrap()),
                    node.data_len(),
                )
            };
            if key_id > txn.state().last_reclaimed {
                // Reserved records all carry keys at or below the consumed
                // bound; past it sit this transaction's own record and
                // records other writers saved.
                break;
            }
            let slots = reserved / 8 - 1;
            let take = slots.min(remaining);
            if take > 0 {
                let at = txn.state().reclaim.len() - take;
                let mut bytes = Vec::with_capacity((take + 1) * 8);
                bytes.extend_from_slice(&(take as u64).to_ne_bytes());
                for &id in &txn.state().reclaim.as_slice()[at..] {
                    bytes.extend_from_slice(&id.to_ne_bytes());
                }
                update::record_fill(txn, pos, &bytes)?;
                txn.state_mut().reclaim.truncate_tail(take);
                remaining -= take;
            }
            found = cursor::step_next(txn, &mut st)?;
        }
        ensure!(
            remaining == 0,
            "reserved free-tree records too small for {} leftover reclaimed pages",
            remaining
        );
    }
    Ok(())
}
