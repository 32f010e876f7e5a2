use std::collections::BTreeMap;
use std::mem::size_of;

use fnv::{FnvHashMap, FnvHashSet};

use crate::error::Result;
use crate::page::{merge_pgids, page_header_size, Page, PageId, FREELIST_PAGE_FLAG};
use crate::transaction::TxId;

/// Tracks page ids available for reuse. Ids freed by a transaction stay
/// pending until no open reader can still observe the version that used
/// them; `allocs` remembers which transaction handed out an id so that
/// alloc-free lifetimes fully between two readers can be reclaimed early.
#[derive(Debug, Default, Clone)]
pub(crate) struct FreeList {
    ids: Vec<PageId>,
    pending: BTreeMap<TxId, Vec<PageId>>,
    allocs: FnvHashMap<PageId, TxId>,
    cache: FnvHashSet<PageId>,
}

impl FreeList {
    pub(crate) fn new() -> FreeList {
        FreeList::default()
    }

    /// Serialized size in bytes, including the extra count slot once the
    /// id count no longer fits the page header's u16.
    pub(crate) fn size(&self) -> usize {
        let mut n = self.count();
        if n >= 0xFFFF {
            n += 1;
        }
        page_header_size() + size_of::<PageId>() * n
    }

    pub(crate) fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    /// Sorted union of free and pending ids, as serialized to disk.
    /// Pending ids are included because their freeing transactions cannot
    /// have survived the crash that makes this list authoritative.
    pub(crate) fn copy_all(&self) -> Vec<PageId> {
        let mut pending: Vec<PageId> = self.pending.values().flatten().copied().collect();
        pending.sort_unstable();
        merge_pgids(&self.ids, &pending)
    }

    /// Returns the start of the lowest run of `n` contiguous free ids, or
    /// 0 when no run fits (the caller extends the file instead).
    pub(crate) fn allocate(&mut self, txid: TxId, n: usize) -> PageId {
        assert!(n > 0, "zero-page allocation");
        if self.ids.is_empty() {
            return 0;
        }
        let mut initial: PageId = 0;
        let mut previd: PageId = 0;
        let mut found: Option<usize> = None;
        for (i, &id) in self.ids.iter().enumerate() {
            assert!(id > 1, "invalid page allocation: {}", id);
            if previd == 0 || id - previd != 1 {
                initial = id;
            }
            if (id - initial) + 1 == n as PageId {
                found = Some(i);
                break;
            }
            previd = id;
        }
        let idx = match found {
            Some(i) => i,
            None => return 0,
        };
        self.ids.drain(idx + 1 - n..=idx);
        for i in 0..n as PageId {
            let id = initial + i;
            self.cache.remove(&id);
            self.allocs.insert(id, txid);
        }
        initial
    }

    /// Queues a page and its overflow run as freed by `txid`. Freeing a
    /// page twice is an internal bug and halts.
    pub(crate) fn free(&mut self, txid: TxId, p: &Page) {
        assert!(p.id > 1, "cannot free meta page {}", p.id);
        let ids = self.pending.entry(txid).or_default();
        for id in p.id..=p.id + p.overflow as PageId {
            assert!(self.cache.insert(id), "page {} already freed", id);
            ids.push(id);
        }
    }

    /// Moves every id pending under a transaction `<= txid` to the free
    /// list.
    pub(crate) fn release(&mut self, txid: TxId) {
        let keys: Vec<TxId> = self.pending.range(..=txid).map(|(&k, _)| k).collect();
        let mut m: Vec<PageId> = Vec::new();
        for k in keys {
            m.extend(self.pending.remove(&k).unwrap());
        }
        for id in &m {
            self.allocs.remove(id);
        }
        m.sort_unstable();
        self.ids = merge_pgids(&self.ids, &m);
    }

    /// Releases pending ids whose allocation and free both happened
    /// inside `[begin, end]` — a window no open reader overlaps. Ids
    /// without a recorded allocation are left for `release`.
    pub(crate) fn release_range(&mut self, begin: TxId, end: TxId) {
        if begin > end {
            return;
        }
        let keys: Vec<TxId> = self.pending.range(begin..=end).map(|(&k, _)| k).collect();
        let mut m: Vec<PageId> = Vec::new();
        for k in keys {
            let allocs = &self.allocs;
            let ids = self.pending.get_mut(&k).unwrap();
            ids.retain(|id| {
                if allocs.get(id).copied().unwrap_or(0) >= begin {
                    m.push(*id);
                    false
                } else {
                    true
                }
            });
            if ids.is_empty() {
                self.pending.remove(&k);
            }
        }
        for id in &m {
            self.allocs.remove(id);
        }
        m.sort_unstable();
        self.ids = merge_pgids(&self.ids, &m);
    }

    /// Undoes a transaction's effect on the list: its freed pages are no
    /// longer pending and every id it took from the free list goes back.
    pub(crate) fn rollback(&mut self, txid: TxId) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
        let mut taken: Vec<PageId> = self
            .allocs
            .iter()
            .filter(|(_, &t)| t == txid)
            .map(|(&id, _)| id)
            .collect();
        taken.sort_unstable();
        for id in taken {
            self.allocs.remove(&id);
            if self.cache.insert(id) {
                if let Err(i) = self.ids.binary_search(&id) {
                    self.ids.insert(i, id);
                }
            }
        }
    }

    pub(crate) fn freed(&self, pgid: PageId) -> bool {
        self.cache.contains(&pgid)
    }

    pub(crate) fn init(&mut self, ids: &[PageId]) {
        self.ids = ids.to_vec();
        self.ids.sort_unstable();
        self.reindex();
    }

    pub(crate) fn read(&mut self, p: &Page) -> Result<()> {
        let list = p.freelist()?;
        self.ids = list.to_vec();
        self.ids.sort_unstable();
        self.reindex();
        Ok(())
    }

    pub(crate) fn write(&self, p: &mut Page) {
        p.flags = FREELIST_PAGE_FLAG;
        let ids = self.copy_all();
        let count = ids.len();
        if count == 0 {
            p.count = 0;
        } else if count < 0xFFFF {
            p.count = count as u16;
            p.freelist_mut(count).copy_from_slice(&ids);
        } else {
            p.count = 0xFFFF;
            let dst = p.freelist_mut(count + 1);
            dst[0] = count as PageId;
            dst[1..].copy_from_slice(&ids);
        }
    }

    /// Rebuilds from a freelist page read off disk, keeping ids that are
    /// still pending for transactions that remain open out of the free
    /// set.
    pub(crate) fn reload(&mut self, p: &Page) -> Result<()> {
        let list = p.freelist()?;
        let mut ids = list.to_vec();
        ids.sort_unstable();
        let pcache: FnvHashSet<PageId> = self.pending.values().flatten().copied().collect();
        ids.retain(|id| !pcache.contains(id));
        self.ids = ids;
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.cache = self.ids.iter().copied().collect();
        for ids in self.pending.values() {
            self.cache.extend(ids.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{OwnedPage, LEAF_PAGE_FLAG};

    fn freelist_from_vec(v: Vec<PageId>) -> FreeList {
        let mut f = FreeList::new();
        f.ids = v;
        f.ids.sort_unstable();
        f.reindex();
        f
    }

    fn page_with(id: PageId, overflow: u32) -> OwnedPage {
        let mut op = OwnedPage::new(64);
        let p = op.page_mut();
        p.id = id;
        p.flags = LEAF_PAGE_FLAG;
        p.overflow = overflow;
        op
    }

    #[test]
    fn allocate_contiguous_runs() {
        let mut f = freelist_from_vec(vec![2, 4, 6, 8, 9, 10]);
        assert_eq!(f.allocate(1, 4), 0);
        assert_eq!(f.allocate(1, 1), 2);
        assert_eq!(f.allocate(1, 1), 4);
        assert_eq!(f.allocate(1, 3), 8);
        assert_eq!(f.ids, vec![6]);
        assert_eq!(f.allocate(1, 1), 6);
        assert!(f.ids.is_empty());
        assert_eq!(f.allocate(1, 1), 0);
    }

    #[test]
    fn allocate_tracks_owner_and_cache() {
        let mut f = freelist_from_vec(vec![5, 6, 7]);
        assert_eq!(f.allocate(9, 2), 5);
        assert_eq!(f.allocs.get(&5), Some(&9));
        assert_eq!(f.allocs.get(&6), Some(&9));
        assert!(!f.freed(5));
        assert!(f.freed(7));
    }

    #[test]
    fn free_queues_overflow_run() {
        let mut f = FreeList::new();
        f.free(7, page_with(12, 2).page());
        assert_eq!(f.pending.get(&7), Some(&vec![12, 13, 14]));
        assert!(f.freed(13));
        assert_eq!(f.free_count(), 0);
        assert_eq!(f.pending_count(), 3);
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn double_free_panics() {
        let mut f = FreeList::new();
        f.free(7, page_with(12, 0).page());
        f.free(8, page_with(12, 0).page());
    }

    #[test]
    fn release_merges_sorted() {
        let mut f = FreeList::new();
        f.free(1, page_with(9, 0).page());
        f.free(2, page_with(5, 0).page());
        f.free(3, page_with(7, 0).page());
        f.release(2);
        assert_eq!(f.ids, vec![5, 9]);
        assert_eq!(f.pending_count(), 1);
        f.release(3);
        assert_eq!(f.ids, vec![5, 7, 9]);
        assert!(f.pending.is_empty());
    }

    #[test]
    fn release_range_requires_alloc_inside_window() {
        let mut f = freelist_from_vec(vec![4, 5]);
        // page 4: allocated at tx 5, freed at tx 6 — fully inside (5, 7)
        assert_eq!(f.allocate(5, 1), 4);
        f.free(6, page_with(4, 0).page());
        // page 9: allocation unknown, freed at tx 6
        f.free(6, page_with(9, 0).page());

        f.release_range(5, 7);
        assert_eq!(f.ids, vec![4, 5]);
        assert_eq!(f.pending.get(&6), Some(&vec![9]));
        // a plain release still reclaims the remainder
        f.release(6);
        assert_eq!(f.ids, vec![4, 5, 9]);
    }

    #[test]
    fn rollback_restores_taken_and_pending() {
        let mut f = freelist_from_vec(vec![4, 5, 6]);
        assert_eq!(f.allocate(3, 2), 4);
        f.free(3, page_with(20, 1).page());
        f.rollback(3);
        assert_eq!(f.ids, vec![4, 5, 6]);
        assert!(f.pending.is_empty());
        assert!(!f.freed(20));
        assert!(f.allocs.is_empty());
    }

    #[test]
    fn write_read_roundtrip() {
        let mut f = freelist_from_vec(vec![3, 7]);
        f.free(2, page_with(11, 1).page());

        let mut op = OwnedPage::new(4096);
        f.write(op.page_mut());
        assert_eq!(op.page().count, 4);

        let mut loaded = FreeList::new();
        loaded.read(op.page()).unwrap();
        assert_eq!(loaded.ids, vec![3, 7, 11, 12]);
        assert!(loaded.freed(12));
    }

    #[test]
    fn reload_keeps_open_pending_out() {
        let mut f = freelist_from_vec(vec![3, 7]);
        let mut op = OwnedPage::new(4096);
        f.write(op.page_mut());

        // tx 5 freed page 7 after that freelist was written and is still
        // open during the reload
        let mut current = FreeList::new();
        current.free(5, page_with(7, 0).page());
        current.reload(op.page()).unwrap();
        assert_eq!(current.ids, vec![3]);
        assert!(current.freed(7));
    }

    #[test]
    fn size_counts_header_and_slots() {
        let f = freelist_from_vec(vec![2, 3, 4]);
        assert_eq!(f.size(), page_header_size() + 3 * size_of::<PageId>());
    }
}
