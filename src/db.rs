use std::fs::File;
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnv::FnvHashSet;
use fs2::FileExt as Fs2FileExt;
use memmap::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::bucket::IBucket;
use crate::error::{Error, Result};
use crate::free_list::FreeList;
use crate::meta::{Meta, MAGIC, PGID_NO_FREELIST, VERSION};
use crate::page::{
    OwnedPage, Page, PageId, BUCKET_LEAF_FLAG, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG,
    META_PAGE_FLAG,
};
use crate::transaction::{Transaction, TxId};

/// Largest supported mapping: 256 TiB.
pub(crate) const MAX_MAP_SIZE: u64 = 1 << 48;
/// Growth step once the doubling phase tops out at 1 GiB.
pub(crate) const MAX_MMAP_STEP: u64 = 1 << 30;

/// Options controlling how a database file is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) timeout: Duration,
    pub(crate) no_grow_sync: bool,
    pub(crate) no_freelist_sync: bool,
    pub(crate) read_only: bool,
    pub(crate) initial_mmap_size: u64,
    pub(crate) page_size: u64,
    pub(crate) no_sync: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            timeout: Duration::ZERO,
            no_grow_sync: false,
            no_freelist_sync: false,
            read_only: false,
            initial_mmap_size: 0,
            page_size: 0,
            no_sync: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Maximum time to wait for the file lock; zero waits forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip the fsync that follows file growth.
    pub fn no_grow_sync(mut self, v: bool) -> Self {
        self.no_grow_sync = v;
        self
    }

    /// Do not persist the freelist; it is rebuilt by a reachability walk
    /// on the next open.
    pub fn no_freelist_sync(mut self, v: bool) -> Self {
        self.no_freelist_sync = v;
        self
    }

    /// Open with a shared lock; write transactions fail.
    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    /// Floor for the first mapping length.
    pub fn initial_mmap_size(mut self, size: u64) -> Self {
        self.initial_mmap_size = size;
        self
    }

    /// Page size used when creating a new file. Existing files keep the
    /// size they were created with. Must be a power of two.
    pub fn page_size(mut self, size: u64) -> Self {
        self.page_size = size;
        self
    }

    /// Skip data and meta fsync on commit, trading durability for
    /// throughput.
    pub fn no_sync(mut self, v: bool) -> Self {
        self.no_sync = v;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<DB> {
        let path = path.as_ref();
        let page_size = if self.page_size > 0 {
            self.page_size
        } else {
            page_size::get() as u64
        };
        if !page_size.is_power_of_two() || page_size < 512 {
            return Err(Error::Invalid);
        }

        if !path.exists() && !self.read_only {
            init_db_file(path, page_size)?;
        }
        let mut oo = std::fs::OpenOptions::new();
        oo.read(true);
        if !self.read_only {
            oo.write(true);
        }
        let file = oo.open(path)?;
        lock_file(&file, self.read_only, self.timeout)?;

        // existing files dictate their own page size
        let page_size = read_page_size(&file).unwrap_or(page_size);
        if !page_size.is_power_of_two() {
            return Err(Error::Invalid);
        }

        let file_len = file.metadata()?.len();
        if !self.read_only {
            let min = file_len.max(self.initial_mmap_size).max(4 * page_size);
            let target = mmap_size(page_size, min)?;
            if file_len < target {
                file.allocate(target)?;
                if !self.no_grow_sync {
                    file.sync_all()?;
                }
            }
        }
        let mmap = unsafe { Mmap::map(&file)? };

        let inner = DbInner {
            data: RwLock::new(Arc::new(mmap)),
            file: Mutex::new(file),
            freelist: Mutex::new(FreeList::new()),
            open_ro_txs: Mutex::new(Vec::new()),
            page_size,
            options: self.clone(),
            path: path.to_path_buf(),
        };
        let meta = inner.meta()?;

        let needs_freelist_commit = {
            let mut fl = inner.freelist.lock();
            if meta.freelist == PGID_NO_FREELIST {
                *fl = inner.rebuild_freelist(&meta)?;
                !self.no_freelist_sync && !self.read_only
            } else {
                let data = inner.data.read().clone();
                let p = Page::from_buf(&data, meta.freelist, page_size);
                p.validate(page_size)?;
                fl.read(p)?;
                false
            }
        };

        let db = DB(Arc::new(inner));
        if needs_freelist_commit {
            // the previous instance never wrote its freelist; one no-op
            // commit puts it on disk
            let tx = db.tx(true)?;
            tx.commit()?;
        }
        Ok(db)
    }
}

/// Handle to an open database file. Clones share one underlying store
/// and may be moved across threads; one writer and any number of readers
/// can run concurrently.
#[derive(Clone)]
pub struct DB(pub(crate) Arc<DbInner>);

impl DB {
    /// Opens (creating if missing) with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DB> {
        OpenOptions::new().open(path)
    }

    /// Begins a transaction. Writable transactions block until the
    /// current writer (if any) finishes.
    pub fn tx(&self, writable: bool) -> Result<Transaction<'_>> {
        if writable && self.0.options.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        Transaction::new(&self.0, writable)
    }

    /// Runs a closure in a write transaction, committing on success and
    /// rolling back on error.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = self.tx(true)?;
        match f(&mut tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Runs a closure in a read-only transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.tx(false)?;
        let r = f(&tx);
        let _ = tx.rollback();
        r
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn is_read_only(&self) -> bool {
        self.0.options.read_only
    }

    pub fn page_size(&self) -> u64 {
        self.0.page_size
    }
}

pub(crate) struct DbInner {
    /// The mmap latch: readers clone the `Arc` under a shared lock, a
    /// resize swaps it under the exclusive lock. Old maps stay alive as
    /// long as some transaction still holds their `Arc`.
    pub(crate) data: RwLock<Arc<Mmap>>,
    pub(crate) file: Mutex<File>,
    pub(crate) freelist: Mutex<FreeList>,
    pub(crate) open_ro_txs: Mutex<Vec<TxId>>,
    pub(crate) page_size: u64,
    pub(crate) options: OpenOptions,
    path: PathBuf,
}

impl DbInner {
    /// The current meta: the valid one with the higher txid; either slot
    /// alone suffices when its twin is corrupt.
    pub(crate) fn meta(&self) -> Result<Meta> {
        let data = self.data.read().clone();
        if (data.len() as u64) < 2 * self.page_size {
            return Err(Error::Corrupted);
        }
        let meta0 = Page::from_buf(&data, 0, self.page_size).meta().ok().copied();
        let meta1 = Page::from_buf(&data, 1, self.page_size).meta().ok().copied();
        let valid0 = meta0.filter(|m| m.validate().is_ok());
        let valid1 = meta1.filter(|m| m.validate().is_ok());
        match (valid0, valid1) {
            (Some(a), Some(b)) => Ok(if a.txid >= b.txid { a } else { b }),
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (None, None) => Err(Error::Invalid),
        }
    }

    /// Grows the file to cover `min` bytes and remaps. Readers blocked
    /// only for the pointer swap; their old maps remain valid.
    pub(crate) fn resize(&self, file: &File, min: u64) -> Result<()> {
        let target = mmap_size(self.page_size, min)?;
        file.allocate(target)?;
        if !self.options.no_grow_sync {
            file.sync_all()?;
        }
        let mmap = unsafe { Mmap::map(file)? };
        *self.data.write() = Arc::new(mmap);
        Ok(())
    }

    /// Reconstructs the freelist when it was never persisted: every page
    /// in `[2, pgid)` not reachable from the root tree is free.
    fn rebuild_freelist(&self, meta: &Meta) -> Result<FreeList> {
        let data = self.data.read().clone();
        let mut reachable = FnvHashSet::default();
        reachable.insert(0);
        reachable.insert(1);
        self.mark_reachable(&data, meta.root.root, &mut reachable)?;
        let free: Vec<PageId> = (2..meta.pgid)
            .filter(|id| !reachable.contains(id))
            .collect();
        let mut fl = FreeList::new();
        fl.init(&free);
        Ok(fl)
    }

    fn mark_reachable(
        &self,
        data: &Mmap,
        pgid: PageId,
        set: &mut FnvHashSet<PageId>,
    ) -> Result<()> {
        if (pgid + 1) * self.page_size > data.len() as u64 {
            return Err(Error::Corrupted);
        }
        let p = Page::from_buf(data, pgid, self.page_size);
        p.validate(self.page_size)?;
        for id in pgid..=pgid + p.overflow as PageId {
            set.insert(id);
        }
        if p.is_branch() {
            for e in p.branch_elements()? {
                self.mark_reachable(data, e.pgid, set)?;
            }
        } else if p.is_leaf() {
            for e in p.leaf_elements()? {
                if e.flags & BUCKET_LEAF_FLAG != 0 {
                    let value = e.value();
                    let header =
                        unsafe { std::ptr::read_unaligned(value.as_ptr() as *const IBucket) };
                    if header.root != 0 {
                        self.mark_reachable(data, header.root, set)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Formats an empty database: both meta slots (txid 0 and 1 so the
/// higher-txid rule picks slot 1 deterministically), an empty freelist at
/// page 2 and an empty root leaf at page 3.
fn init_db_file(path: &Path, page_size: u64) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    let mut buf = OwnedPage::new((page_size * 4) as usize);
    for i in 0..2u64 {
        let p = Page::from_buf_mut(buf.bytes_mut(), i, page_size);
        p.id = i;
        p.flags = META_PAGE_FLAG;
        let m = p.meta_mut();
        m.magic = MAGIC;
        m.version = VERSION;
        m.page_size = page_size as u32;
        m.flags = 0;
        m.root = IBucket {
            root: 3,
            sequence: 0,
        };
        m.freelist = 2;
        m.pgid = 4;
        m.txid = i;
        m.checksum = m.sum64();
    }
    {
        let p = Page::from_buf_mut(buf.bytes_mut(), 2, page_size);
        p.id = 2;
        p.flags = FREELIST_PAGE_FLAG;
        p.count = 0;
    }
    {
        let p = Page::from_buf_mut(buf.bytes_mut(), 3, page_size);
        p.id = 3;
        p.flags = LEAF_PAGE_FLAG;
        p.count = 0;
    }
    file.write_all(buf.bytes())?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn lock_file(file: &File, read_only: bool, timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        if read_only {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        return Ok(());
    }
    let start = Instant::now();
    loop {
        let locked = if read_only {
            fs2::FileExt::try_lock_shared(file)
        } else {
            fs2::FileExt::try_lock_exclusive(file)
        };
        match locked {
            Ok(()) => return Ok(()),
            Err(_) if start.elapsed() < timeout => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return Err(Error::LockTimeout),
        }
    }
}

/// Page size as recorded in meta slot 0, when the file already carries
/// one. Used so an open never trusts the configured size over the file's.
fn read_page_size(file: &File) -> Option<u64> {
    let mut op = OwnedPage::new(4096);
    let n = file.read_at(op.bytes_mut(), 0).ok()?;
    if n < crate::page::page_header_size() + size_of::<Meta>() {
        return None;
    }
    let p = op.page();
    let meta = p.meta().ok()?;
    if meta.magic != MAGIC {
        return None;
    }
    Some(meta.page_size as u64)
}

/// Mapping size for at least `size` bytes: double from 32 KiB up to
/// 1 GiB, then step by whole gigabytes, always page-aligned and capped at
/// 256 TiB.
pub(crate) fn mmap_size(page_size: u64, size: u64) -> Result<u64> {
    for i in 15..=30u32 {
        if size <= 1 << i {
            return Ok(1 << i);
        }
    }
    if size > MAX_MAP_SIZE {
        return Err(Error::Corrupted);
    }
    let mut sz = size;
    let remainder = sz % MAX_MMAP_STEP;
    if remainder > 0 {
        sz += MAX_MMAP_STEP - remainder;
    }
    if sz % page_size != 0 {
        sz = ((sz / page_size) + 1) * page_size;
    }
    if sz > MAX_MAP_SIZE {
        sz = MAX_MAP_SIZE;
    }
    Ok(sz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_size_doubles_then_steps() {
        assert_eq!(mmap_size(4096, 0).unwrap(), 1 << 15);
        assert_eq!(mmap_size(4096, 16 * 1024).unwrap(), 1 << 15);
        assert_eq!(mmap_size(4096, (1 << 15) + 1).unwrap(), 1 << 16);
        assert_eq!(mmap_size(4096, 1 << 30).unwrap(), 1 << 30);
        assert_eq!(mmap_size(4096, (1 << 30) + 1).unwrap(), 2 << 30);
        assert_eq!(mmap_size(4096, (3 << 30) + 5).unwrap(), 4 << 30);
    }

    #[test]
    fn mmap_size_rejects_oversize() {
        assert!(mmap_size(4096, MAX_MAP_SIZE + 1).is_err());
        assert_eq!(mmap_size(4096, MAX_MAP_SIZE).unwrap(), MAX_MAP_SIZE);
    }

    #[test]
    fn mmap_size_is_page_aligned() {
        let sz = mmap_size(4096, (1 << 30) + 123).unwrap();
        assert_eq!(sz % 4096, 0);
    }
}
