use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use memmap::Mmap;
use parking_lot::MutexGuard;

use crate::bucket::Bucket;
use crate::cursor::{Buckets, Cursor};
use crate::data::RawPtr;
use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::meta::{Meta, PGID_NO_FREELIST};
use crate::page::{OwnedPage, Page, PageId};

pub(crate) type TxId = u64;

/// Work counters accumulated over one transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxStats {
    /// Pages allocated.
    pub page_count: u64,
    /// Bytes allocated for pages.
    pub page_alloc: u64,
    /// Nodes materialized from pages.
    pub node_count: u64,
    pub split: u64,
    pub spill: u64,
    pub rebalance: u64,
    /// Dirty pages written at commit.
    pub write: u64,
}

/// An isolated view of the database: a consistent snapshot for readers,
/// exclusive mutability for the single writer.
///
/// Values handed out by a transaction (from `get`, cursors, …) borrow
/// from it and go away when it ends. Dropping a write transaction
/// without calling [`commit`](Transaction::commit) rolls it back.
pub struct Transaction<'db> {
    pub(crate) inner: Box<TransactionInner>,
    file: Option<MutexGuard<'db, File>>,
}

pub(crate) struct TransactionInner {
    pub(crate) db: RawPtr<DbInner>,
    pub(crate) writable: bool,
    closed: Cell<bool>,
    pub(crate) meta: RefCell<Meta>,
    data: Arc<Mmap>,
    root: Option<Box<Bucket>>,
    pub(crate) pages: RefCell<BTreeMap<PageId, OwnedPage>>,
    pub(crate) stats: RefCell<TxStats>,
    commit_handlers: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db DbInner, writable: bool) -> Result<Transaction<'db>> {
        // the file mutex doubles as the singleton writer lock
        let file = if writable { Some(db.file.lock()) } else { None };
        let data = db.data.read().clone();
        let mut meta = db.meta()?;
        if writable {
            meta.txid += 1;
            let ro = db.open_ro_txs.lock();
            let mut fl = db.freelist.lock();
            if ro.is_empty() {
                fl.release(meta.txid - 1);
            } else {
                // reclaim everything older than the oldest reader, plus
                // short-lived pages falling between two readers
                fl.release(ro[0].saturating_sub(1));
                let mut minid = ro[0] + 1;
                for &t in ro.iter().skip(1) {
                    fl.release_range(minid, t.saturating_sub(1));
                    minid = t + 1;
                }
                fl.release_range(minid, TxId::MAX);
            }
        } else {
            let mut ro = db.open_ro_txs.lock();
            ro.push(meta.txid);
            ro.sort_unstable();
        }
        let mut inner = Box::new(TransactionInner {
            db: RawPtr::new(db),
            writable,
            closed: Cell::new(false),
            meta: RefCell::new(meta),
            data,
            root: None,
            pages: RefCell::new(BTreeMap::new()),
            stats: RefCell::new(TxStats::default()),
            commit_handlers: RefCell::new(Vec::new()),
        });
        let root_header = inner.meta.borrow().root;
        let tx_ptr = RawPtr::new(&*inner);
        inner.root = Some(Box::new(Bucket::new(root_header, tx_ptr)));
        Ok(Transaction { inner, file })
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    pub fn id(&self) -> TxId {
        self.inner.meta.borrow().txid
    }

    /// Current size of the database: high water mark times page size.
    pub fn size(&self) -> u64 {
        let meta = self.inner.meta.borrow();
        meta.pgid * meta.page_size as u64
    }

    pub fn stats(&self) -> TxStats {
        *self.inner.stats.borrow()
    }

    /// Registers a function to run after a successful commit.
    pub fn on_commit<F: FnOnce() + 'static>(&mut self, handler: F) {
        self.inner
            .commit_handlers
            .borrow_mut()
            .push(Box::new(handler));
    }

    /// Root-level bucket lookup.
    pub fn bucket(&self, name: &[u8]) -> Result<&Bucket> {
        self.inner.root().bucket(name).ok_or(Error::BucketNotFound)
    }

    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<&mut Bucket> {
        self.inner
            .root_mut()
            .bucket_mut(name)
            .ok_or(Error::BucketNotFound)
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<&mut Bucket> {
        self.inner.root_mut().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<&mut Bucket> {
        self.inner.root_mut().create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.inner.root_mut().delete_bucket(name)
    }

    /// Cursor over the root bucket.
    pub fn cursor(&self) -> Cursor<'_> {
        self.inner.root().cursor()
    }

    /// Names of the root-level buckets.
    pub fn buckets(&self) -> Buckets<'_> {
        self.inner.root().buckets()
    }

    /// Makes every change durable: rebalances and spills the tree,
    /// rewrites the freelist, writes dirty pages and finally swaps the
    /// meta page. Any failure before the meta write leaves the previous
    /// state authoritative.
    pub fn commit(mut self) -> Result<()> {
        if !self.inner.writable {
            return Err(Error::TxReadOnly);
        }
        if self.inner.closed.get() {
            return Err(Error::TxClosed);
        }
        let file = self.file.take().expect("writer holds the file lock");
        match self.inner.commit_inner(&file) {
            Ok(()) => {
                self.inner.closed.set(true);
                drop(file);
                self.inner.run_commit_handlers();
                Ok(())
            }
            Err(e) => {
                self.inner.close();
                Err(e)
            }
        }
    }

    /// Discards the transaction. Read transactions just unregister;
    /// write transactions drop their dirty state and restore the shared
    /// freelist.
    pub fn rollback(self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::TxClosed);
        }
        self.inner.close();
        Ok(())
    }
}

impl<'db> Drop for Transaction<'db> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl TransactionInner {
    pub(crate) fn db(&self) -> &DbInner {
        &self.db
    }

    pub(crate) fn root(&self) -> &Bucket {
        self.root.as_deref().expect("root bucket")
    }

    pub(crate) fn root_mut(&mut self) -> &mut Bucket {
        self.root.as_deref_mut().expect("root bucket")
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.db().page_size
    }

    pub(crate) fn meta_pgid(&self) -> PageId {
        self.meta.borrow().pgid
    }

    /// Resolves a page id: the transaction's own dirty copy wins over
    /// the mapped file.
    pub(crate) fn page(&self, id: PageId) -> Result<RawPtr<Page>> {
        if let Some(op) = self.pages.borrow().get(&id) {
            return Ok(RawPtr::new(op.page()));
        }
        if id >= self.meta.borrow().pgid {
            return Err(Error::Corrupted);
        }
        let page_size = self.page_size();
        let p = Page::from_buf(&self.data, id, page_size);
        p.validate(page_size)?;
        Ok(RawPtr::new(p))
    }

    /// Hands out `count` contiguous pages as one dirty buffer, from the
    /// freelist when a run fits, else by raising the high water mark.
    pub(crate) fn allocate(&self, count: usize) -> Result<(PageId, RawPtr<Page>)> {
        let txid = self.meta.borrow().txid;
        let mut pgid = self.db().freelist.lock().allocate(txid, count);
        if pgid == 0 {
            let mut meta = self.meta.borrow_mut();
            pgid = meta.pgid;
            meta.pgid += count as PageId;
        }
        let mut op = OwnedPage::new(count * self.page_size() as usize);
        {
            let p = op.page_mut();
            p.id = pgid;
            p.overflow = (count - 1) as u32;
        }
        let mut pages = self.pages.borrow_mut();
        pages.insert(pgid, op);
        let ptr = RawPtr::new(pages.get(&pgid).unwrap().page());
        drop(pages);
        {
            let mut stats = self.stats.borrow_mut();
            stats.page_count += count as u64;
            stats.page_alloc += (count as u64) * self.page_size();
        }
        Ok((pgid, ptr))
    }

    /// Posts a page (and its overflow run) to the freelist under this
    /// transaction's id.
    pub(crate) fn free_page(&self, pgid: PageId) {
        let txid = self.meta.borrow().txid;
        let page = self.page(pgid).expect("freeable page");
        self.db().freelist.lock().free(txid, &page);
    }

    fn commit_inner(&self, file: &File) -> Result<()> {
        let db = self.db();

        self.root().rebalance();
        self.root().spill()?;
        {
            let mut meta = self.meta.borrow_mut();
            meta.root = self.root().ibucket.get();
        }

        // retire the old freelist page, persist the new state
        {
            let old = self.meta.borrow().freelist;
            if old != PGID_NO_FREELIST {
                self.free_page(old);
            }
            if db.options.no_freelist_sync {
                self.meta.borrow_mut().freelist = PGID_NO_FREELIST;
            } else {
                let page_size = self.page_size() as usize;
                let size = db.freelist.lock().size();
                let count = (size + page_size - 1) / page_size;
                let (pgid, page) = self.allocate(count)?;
                db.freelist.lock().write(unsafe { page.as_mut() });
                self.meta.borrow_mut().freelist = pgid;
            }
        }

        // grow the file and remap before the new space becomes reachable
        let required = self.meta.borrow().pgid * self.page_size();
        if required > self.data.len() as u64 {
            db.resize(file, required)?;
        }

        // dirty pages in ascending id order
        {
            let pages = self.pages.borrow();
            let page_size = self.page_size();
            for (&id, op) in pages.iter() {
                file.write_all_at(op.bytes(), id * page_size)?;
                self.stats.borrow_mut().write += 1;
            }
        }
        if !db.options.no_sync {
            file.sync_all()?;
        }

        // the meta swap is the commit point
        {
            let mut op = OwnedPage::new(self.page_size() as usize);
            let mut meta = self.meta.borrow_mut();
            meta.write(op.page_mut());
            file.write_all_at(op.bytes(), (meta.txid % 2) * self.page_size())?;
        }
        if !db.options.no_sync {
            file.sync_all()?;
        }

        // retire pending pages no snapshot can still reach
        {
            let ro = db.open_ro_txs.lock();
            let mut fl = db.freelist.lock();
            match ro.first() {
                Some(&min) => fl.release(min.saturating_sub(1)),
                None => fl.release(self.meta.borrow().txid.saturating_sub(1)),
            }
        }
        Ok(())
    }

    fn run_commit_handlers(&self) {
        let handlers: Vec<Box<dyn FnOnce()>> =
            self.commit_handlers.borrow_mut().drain(..).collect();
        for h in handlers {
            h();
        }
    }

    fn rollback_inner(&self) {
        let db = self.db();
        {
            let mut fl = db.freelist.lock();
            let txid = self.meta.borrow().txid;
            fl.rollback(txid);
            if let Ok(meta) = db.meta() {
                if meta.freelist != PGID_NO_FREELIST {
                    let data = db.data.read().clone();
                    let p = Page::from_buf(&data, meta.freelist, db.page_size);
                    let _ = fl.reload(p);
                }
            }
        }
        self.pages.borrow_mut().clear();
    }

    fn close(&self) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);
        if self.writable {
            self.rollback_inner();
        } else {
            let db = self.db();
            let mut ro = db.open_ro_txs.lock();
            let txid = self.meta.borrow().txid;
            if let Ok(i) = ro.binary_search(&txid) {
                ro.remove(i);
            }
        }
    }
}
