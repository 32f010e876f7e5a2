use std::cell::{Cell, RefCell};
use std::mem::size_of;
use std::ptr::copy_nonoverlapping;

use either::Either;
use fnv::FnvHashMap;

use crate::cursor::{Buckets, Cursor};
use crate::data::RawPtr;
use crate::error::{Error, Result};
use crate::node::{Node, NodeType, WeakNode};
use crate::page::{
    page_header_size, OwnedPage, Page, PageId, BUCKET_LEAF_FLAG, LEAF_ELEMENT_SIZE,
    LEAF_PAGE_FLAG,
};
use crate::transaction::TransactionInner;
use crate::utils::struct_to_slice;

pub(crate) const BUCKET_HEADER_SIZE: usize = size_of::<IBucket>();

/// On-disk identity of a bucket, stored as the leaf value in the parent.
/// `root == 0` marks an inline bucket whose root page follows the header
/// inside the same value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IBucket {
    pub(crate) root: PageId,
    pub(crate) sequence: u64,
}

/// A named collection of ordered key/value pairs and nested buckets.
///
/// Write-mode buckets own the materialized nodes of their B+tree; all
/// handles are only valid for the life of the transaction that produced
/// them.
pub struct Bucket {
    pub(crate) ibucket: Cell<IBucket>,
    pub(crate) tx: RawPtr<TransactionInner>,
    buckets: RefCell<FnvHashMap<Vec<u8>, Box<Bucket>>>,
    pub(crate) root_node: RefCell<Option<Node>>,
    pub(crate) nodes: RefCell<FnvHashMap<PageId, Node>>,
    inline_page: RefCell<Option<OwnedPage>>,
    fill_percent: Cell<f64>,
}

impl Bucket {
    pub(crate) const DEFAULT_FILL_PERCENT: f64 = 0.5;
    pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
    pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;

    pub const MAX_KEY_SIZE: usize = 32768;
    pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

    pub(crate) fn new(ibucket: IBucket, tx: RawPtr<TransactionInner>) -> Bucket {
        Bucket {
            ibucket: Cell::new(ibucket),
            tx,
            buckets: RefCell::new(FnvHashMap::default()),
            root_node: RefCell::new(None),
            nodes: RefCell::new(FnvHashMap::default()),
            inline_page: RefCell::new(None),
            fill_percent: Cell::new(Self::DEFAULT_FILL_PERCENT),
        }
    }

    pub(crate) fn tx(&self) -> &TransactionInner {
        &self.tx
    }

    pub(crate) fn writable(&self) -> bool {
        self.tx().writable
    }

    pub(crate) fn root_id(&self) -> PageId {
        self.ibucket.get().root
    }

    pub(crate) fn fill_percent(&self) -> f64 {
        self.fill_percent.get()
    }

    /// Target page fill ratio used when splitting nodes. Lower values
    /// leave room for future inserts, higher values pack pages densely.
    pub fn set_fill_percent(&mut self, fill_percent: f64) {
        self.fill_percent
            .set(fill_percent.clamp(Self::MIN_FILL_PERCENT, Self::MAX_FILL_PERCENT));
    }

    pub fn sequence(&self) -> u64 {
        self.ibucket.get().sequence
    }

    pub fn set_sequence(&mut self, v: u64) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        self.materialize_root();
        let mut ib = self.ibucket.get();
        ib.sequence = v;
        self.ibucket.set(ib);
        Ok(())
    }

    /// Increments and returns the bucket's sequence counter.
    pub fn next_sequence(&mut self) -> Result<u64> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        self.materialize_root();
        let mut ib = self.ibucket.get();
        ib.sequence += 1;
        self.ibucket.set(ib);
        Ok(ib.sequence)
    }

    /// Looks up a plain value. Returns nothing for missing keys and for
    /// keys naming a sub-bucket.
    pub fn get<'a>(&'a self, key: &[u8]) -> Option<&'a [u8]> {
        if key.is_empty() {
            return None;
        }
        let mut c = self.cursor();
        let (k, v, flags) = c.seek_entry(key)?;
        if flags & BUCKET_LEAF_FLAG != 0 {
            return None;
        }
        let found: &[u8] = k.slice();
        if found != key {
            return None;
        }
        Some(v.slice())
    }

    /// Inserts or replaces a value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, true).map(|_| ())
    }

    /// Inserts only when the key is absent; returns whether it was
    /// stored.
    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.put_with(key, value, false)
    }

    fn put_with(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > Self::MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > Self::MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        let mut c = self.cursor();
        if let Some((k, _, flags)) = c.seek_entry(key) {
            let found: &[u8] = k.slice();
            if found == key {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::IncompatibleValue);
                }
                if !overwrite {
                    return Ok(false);
                }
            }
        }
        c.node().put(key, key, value, 0, 0);
        Ok(true)
    }

    /// Removes a key. Missing keys are a no-op; keys naming a sub-bucket
    /// must go through `delete_bucket`.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        let mut c = self.cursor();
        match c.seek_entry(key) {
            Some((k, _, flags)) if k.slice() == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::IncompatibleValue);
                }
                c.node().del(key);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns the named sub-bucket, if present.
    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.bucket_ptr(name).map(|p| unsafe { &*p })
    }

    pub fn bucket_mut(&mut self, name: &[u8]) -> Option<&mut Bucket> {
        self.bucket_ptr(name).map(|p| unsafe { &mut *p })
    }

    fn bucket_ptr(&self, name: &[u8]) -> Option<*mut Bucket> {
        if let Some(b) = self.buckets.borrow_mut().get_mut(name) {
            return Some(&mut **b as *mut Bucket);
        }
        let value: &[u8] = {
            let mut c = self.cursor();
            let (k, v, flags) = c.seek_entry(name)?;
            let found: &[u8] = k.slice();
            if found != name || flags & BUCKET_LEAF_FLAG == 0 {
                return None;
            }
            v.slice()
        };
        let child = self.open_bucket(value);
        let mut cache = self.buckets.borrow_mut();
        let boxed = cache
            .entry(name.to_vec())
            .or_insert_with(|| Box::new(child));
        Some(&mut **boxed as *mut Bucket)
    }

    /// Materializes a bucket from its serialized header. Inline roots are
    /// copied into an aligned buffer since the parent's value bytes carry
    /// no alignment guarantee.
    fn open_bucket(&self, value: &[u8]) -> Bucket {
        let ibucket = unsafe { std::ptr::read_unaligned(value.as_ptr() as *const IBucket) };
        let child = Bucket::new(ibucket, self.tx);
        if ibucket.root == 0 {
            let page = OwnedPage::from_bytes(&value[BUCKET_HEADER_SIZE..]);
            *child.inline_page.borrow_mut() = Some(page);
        }
        child
    }

    /// Creates an empty sub-bucket under the given name.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<&mut Bucket> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        {
            let mut c = self.cursor();
            if let Some((k, _, flags)) = c.seek_entry(name) {
                let found: &[u8] = k.slice();
                if found == name {
                    if flags & BUCKET_LEAF_FLAG != 0 {
                        return Err(Error::BucketExists);
                    }
                    return Err(Error::IncompatibleValue);
                }
            }
            let value = Bucket::empty_inline_value();
            c.node().put(name, name, &value, 0, BUCKET_LEAF_FLAG);
        }
        *self.inline_page.borrow_mut() = None;
        self.bucket_mut(name).ok_or(Error::BucketNotFound)
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<&mut Bucket> {
        match self.create_bucket(name) {
            Ok(_) => {}
            Err(Error::BucketExists) => {}
            Err(e) => return Err(e),
        }
        self.bucket_mut(name).ok_or(Error::BucketNotFound)
    }

    /// Removes a sub-bucket and everything beneath it, returning every
    /// page of its tree to the freelist.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxReadOnly);
        }
        {
            let mut c = self.cursor();
            match c.seek_entry(name) {
                Some((k, _, flags)) if k.slice() == name => {
                    if flags & BUCKET_LEAF_FLAG == 0 {
                        return Err(Error::IncompatibleValue);
                    }
                }
                _ => return Err(Error::BucketNotFound),
            }
        }

        let child = self.bucket_ptr(name).ok_or(Error::BucketNotFound)?;
        let child = unsafe { &mut *child };
        for sub in child.bucket_names() {
            child.delete_bucket(&sub)?;
        }
        child.nodes.borrow_mut().clear();
        *child.root_node.borrow_mut() = None;
        child.free();
        self.buckets.borrow_mut().remove(name);

        let mut c = self.cursor();
        let _ = c.seek_entry(name);
        c.node().del(name);
        Ok(())
    }

    /// Iterates the bucket's plain key/value pairs in key order.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Iterates only the names of nested buckets.
    pub fn buckets(&self) -> Buckets<'_> {
        Buckets::new(self)
    }

    fn bucket_names(&self) -> Vec<Vec<u8>> {
        let mut names = Vec::new();
        let mut c = self.cursor();
        let mut item = c.first_entry();
        while let Some((k, _, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                names.push(k.slice().to_vec());
            }
            item = c.next_entry();
        }
        names
    }

    /// Serialized value of a freshly created bucket: a zeroed header
    /// followed by an empty inline leaf page.
    fn empty_inline_value() -> Vec<u8> {
        let mut op = OwnedPage::new(BUCKET_HEADER_SIZE + page_header_size());
        unsafe {
            let p = &mut *(op.bytes_mut().as_mut_ptr().add(BUCKET_HEADER_SIZE) as *mut Page);
            p.flags = LEAF_PAGE_FLAG;
        }
        op.bytes().to_vec()
    }

    /// Resolves a page id to the materialized node shadowing it (write
    /// transactions) or the underlying page.
    pub(crate) fn page_node(&self, id: PageId) -> Result<crate::cursor::PageNode> {
        use crate::cursor::PageNode;
        if self.root_id() == 0 {
            assert!(id == 0, "inline bucket asked for page {}", id);
            if let Some(root) = self.root_node.borrow().as_ref() {
                return Ok(PageNode::from(root.clone()));
            }
            let inline = self.inline_page.borrow();
            if let Some(op) = inline.as_ref() {
                return Ok(PageNode::from(RawPtr::new(op.page())));
            }
            return Err(Error::Corrupted);
        }
        if self.writable() {
            if let Some(n) = self.nodes.borrow().get(&id) {
                return Ok(PageNode::from(n.clone()));
            }
        }
        let page = self.tx().page(id)?;
        Ok(PageNode::from(page))
    }

    /// Fetches (materializing if needed) the mutable node for a page.
    pub(crate) fn node(&self, pgid: PageId, parent: WeakNode) -> Node {
        assert!(self.writable(), "node materialization in a read-only tx");
        if let Some(n) = self.nodes.borrow().get(&pgid) {
            return n.clone();
        }
        let n = Node::new(RawPtr::new(self), NodeType::Leaf);
        match parent.upgrade() {
            Some(p) => {
                n.set_parent(parent.clone());
                p.0.children.borrow_mut().push(n.clone());
            }
            None => {
                *self.root_node.borrow_mut() = Some(n.clone());
            }
        }
        if self.root_id() == 0 {
            let inline = self.inline_page.borrow();
            let op = inline.as_ref().expect("inline bucket page");
            n.read(op.page()).expect("inline root page");
        } else {
            let page = self.tx().page(pgid).expect("mapped page");
            n.read(&page).expect("mapped page");
        }
        self.nodes.borrow_mut().insert(pgid, n.clone());
        self.tx().stats.borrow_mut().node_count += 1;
        n
    }

    pub(crate) fn set_root_node(&self, n: Node) {
        *self.root_node.borrow_mut() = Some(n);
    }

    fn materialize_root(&self) {
        if self.root_node.borrow().is_some() {
            return;
        }
        let _ = self.node(self.root_id(), WeakNode::new());
    }

    pub(crate) fn rebalance(&self) {
        let nodes: Vec<Node> = self.nodes.borrow().values().cloned().collect();
        for n in nodes {
            n.rebalance();
        }
        for child in self.buckets.borrow().values() {
            child.rebalance();
        }
    }

    /// Writes every modified node of this bucket (and its children) into
    /// newly allocated pages, updating each child's header value in this
    /// bucket on the way.
    pub(crate) fn spill(&self) -> Result<()> {
        let names: Vec<Vec<u8>> = {
            let mut ks: Vec<Vec<u8>> = self.buckets.borrow().keys().cloned().collect();
            ks.sort();
            ks
        };
        for name in names {
            let (value, skip) = {
                let cache = self.buckets.borrow();
                let child = cache.get(&name).expect("cached sub-bucket");
                let value = if child.inlineable() {
                    child.free();
                    child.write_inline()
                } else {
                    child.spill()?;
                    let ib = child.ibucket.get();
                    unsafe { struct_to_slice(&ib) }.to_vec()
                };
                let skip = child.root_node.borrow().is_none();
                (value, skip)
            };
            if skip {
                continue;
            }
            let mut c = self.cursor();
            match c.seek_entry(&name) {
                Some((k, _, flags)) if k.slice() == &name[..] => {
                    assert!(
                        flags & BUCKET_LEAF_FLAG != 0,
                        "bucket header slot holds a plain value"
                    );
                }
                _ => panic!("bucket header not found during spill"),
            }
            c.node().put(&name, &name, &value, 0, BUCKET_LEAF_FLAG);
        }

        let root_node = self.root_node.borrow().clone();
        if let Some(root) = root_node {
            root.spill()?;
            // every root split re-points root_node at the new top
            let new_root = self
                .root_node
                .borrow()
                .clone()
                .expect("root node after spill");
            let pgid = new_root.pgid();
            assert!(
                pgid < self.tx().meta_pgid(),
                "root page {} outside high water mark",
                pgid
            );
            *self.root_node.borrow_mut() = Some(new_root);
            let mut ib = self.ibucket.get();
            ib.root = pgid;
            self.ibucket.set(ib);
        }
        Ok(())
    }

    /// True when the whole bucket fits inside its parent's leaf value: a
    /// single leaf root, no nested buckets, under a quarter page.
    fn inlineable(&self) -> bool {
        let root = self.root_node.borrow();
        let n = match root.as_ref() {
            Some(n) if n.is_leaf() => n,
            _ => return false,
        };
        let max = self.max_inline_bucket_size();
        let mut size = page_header_size();
        for inode in n.0.inodes.borrow().iter() {
            size += LEAF_ELEMENT_SIZE + inode.key().len() + inode.value().len();
            if inode.is_bucket() {
                return false;
            }
            if size > max {
                return false;
            }
        }
        true
    }

    fn max_inline_bucket_size(&self) -> usize {
        self.tx().page_size() as usize / 4
    }

    /// Serializes the bucket into an inline value: header plus root page.
    fn write_inline(&self) -> Vec<u8> {
        let root = self.root_node.borrow();
        let n = root.as_ref().expect("inline write without a root node");
        let mut op = OwnedPage::new(BUCKET_HEADER_SIZE + n.size());
        let ib = self.ibucket.get();
        unsafe {
            copy_nonoverlapping(
                struct_to_slice(&ib).as_ptr(),
                op.bytes_mut().as_mut_ptr(),
                BUCKET_HEADER_SIZE,
            );
            let p = &mut *(op.bytes_mut().as_mut_ptr().add(BUCKET_HEADER_SIZE) as *mut Page);
            n.write(p);
        }
        op.bytes().to_vec()
    }

    /// Returns every page of this bucket's tree to the freelist.
    pub(crate) fn free(&self) {
        if self.root_id() == 0 {
            return;
        }
        let tx = self.tx();
        self.for_each_page_node(&mut |pn| match pn {
            Either::Left(page) => tx.free_page(page.id),
            Either::Right(node) => node.free(),
        });
        let mut ib = self.ibucket.get();
        ib.root = 0;
        self.ibucket.set(ib);
    }

    fn for_each_page_node<F: FnMut(Either<&Page, &Node>)>(&self, f: &mut F) {
        {
            let inline = self.inline_page.borrow();
            if let Some(op) = inline.as_ref() {
                f(Either::Left(op.page()));
                return;
            }
        }
        self.walk_page_node(self.root_id(), f);
    }

    fn walk_page_node<F: FnMut(Either<&Page, &Node>)>(&self, pgid: PageId, f: &mut F) {
        let pn = self.page_node(pgid).expect("reachable page");
        let child_ids: Vec<PageId> = match pn.upgrade() {
            Either::Left(page) => {
                f(Either::Left(page));
                if page.is_branch() {
                    page.branch_elements()
                        .expect("branch elements")
                        .iter()
                        .map(|e| e.pgid)
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Either::Right(node) => {
                f(Either::Right(node));
                if !node.is_leaf() {
                    node.0.inodes.borrow().iter().map(|i| i.pgid()).collect()
                } else {
                    Vec::new()
                }
            }
        };
        for id in child_ids {
            self.walk_page_node(id, f);
        }
    }
}
