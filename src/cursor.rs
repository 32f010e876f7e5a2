use either::Either;

use crate::bucket::Bucket;
use crate::data::{Entry, RawPtr};
use crate::error::{Error, Result};
use crate::node::{Node, WeakNode};
use crate::page::{Page, PageId, BUCKET_LEAF_FLAG};

/// A cursor frame's backing store: a materialized node when the write
/// transaction has one, otherwise the mapped page.
#[derive(Clone, Debug)]
pub(crate) struct PageNode(pub(crate) Either<RawPtr<Page>, Node>);

impl From<Node> for PageNode {
    fn from(node: Node) -> Self {
        Self(Either::Right(node))
    }
}

impl From<RawPtr<Page>> for PageNode {
    fn from(page: RawPtr<Page>) -> Self {
        Self(Either::Left(page))
    }
}

impl PageNode {
    pub(crate) fn upgrade(&self) -> Either<&Page, &Node> {
        match &self.0 {
            Either::Left(p) => Either::Left(p),
            Either::Right(n) => Either::Right(n),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        match self.upgrade() {
            Either::Left(p) => p.is_leaf(),
            Either::Right(n) => n.is_leaf(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        match self.upgrade() {
            Either::Left(p) => p.count as usize,
            Either::Right(n) => n.0.inodes.borrow().len(),
        }
    }
}

#[derive(Clone)]
struct ElemRef {
    page_node: PageNode,
    index: usize,
}

impl ElemRef {
    fn is_leaf(&self) -> bool {
        self.page_node.is_leaf()
    }

    fn count(&self) -> usize {
        self.page_node.count()
    }
}

fn pair<'a>((k, v, flags): (Entry, Entry, u32)) -> (&'a [u8], Option<&'a [u8]>) {
    let value = if flags & BUCKET_LEAF_FLAG != 0 {
        None
    } else {
        Some(v.slice())
    };
    (k.slice(), value)
}

/// Stack-based walker over one bucket's B+tree. Keys and values it hands
/// out borrow from the owning transaction and stay valid until the
/// transaction ends or the bucket is mutated.
///
/// Iterating a `Cursor` yields only plain key/value pairs; sub-bucket
/// entries surface through [`Bucket::buckets`] or the positioning
/// methods, which report them with no value.
pub struct Cursor<'b> {
    bucket: &'b Bucket,
    stack: Vec<ElemRef>,
}

impl<'b> Cursor<'b> {
    pub(crate) fn new(bucket: &'b Bucket) -> Cursor<'b> {
        Cursor {
            bucket,
            stack: Vec::new(),
        }
    }

    pub fn bucket(&self) -> &Bucket {
        self.bucket
    }

    /// Positions at the first key in the bucket.
    pub fn first(&mut self) -> Option<(&'b [u8], Option<&'b [u8]>)> {
        self.first_entry().map(pair)
    }

    /// Positions at the last key in the bucket.
    pub fn last(&mut self) -> Option<(&'b [u8], Option<&'b [u8]>)> {
        self.last_entry().map(pair)
    }

    /// Moves to the key at or just after `key`. Callers compare the
    /// returned key against the target to tell a hit from a miss.
    pub fn seek(&mut self, key: &[u8]) -> Option<(&'b [u8], Option<&'b [u8]>)> {
        self.seek_entry(key).map(pair)
    }

    pub fn next(&mut self) -> Option<(&'b [u8], Option<&'b [u8]>)> {
        self.next_entry().map(pair)
    }

    pub fn prev(&mut self) -> Option<(&'b [u8], Option<&'b [u8]>)> {
        self.prev_entry().map(pair)
    }

    /// Removes the element under the cursor. Sub-bucket entries are
    /// rejected; use `delete_bucket` on the parent instead.
    pub fn delete(&mut self) -> Result<()> {
        if !self.bucket.writable() {
            return Err(Error::TxReadOnly);
        }
        let (k, _, flags) = self.key_value().ok_or(Error::KeyRequired)?;
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue);
        }
        let key = k.slice().to_vec();
        self.node().del(&key);
        Ok(())
    }

    pub(crate) fn first_entry(&mut self) -> Option<(Entry, Entry, u32)> {
        self.stack.clear();
        let pn = self.bucket.page_node(self.bucket.root_id()).ok()?;
        self.stack.push(ElemRef {
            page_node: pn,
            index: 0,
        });
        self.descend_first();
        if self.stack.last()?.count() == 0 {
            return self.next_entry();
        }
        self.key_value()
    }

    pub(crate) fn last_entry(&mut self) -> Option<(Entry, Entry, u32)> {
        self.stack.clear();
        let pn = self.bucket.page_node(self.bucket.root_id()).ok()?;
        let count = pn.count();
        self.stack.push(ElemRef {
            page_node: pn,
            index: count.saturating_sub(1),
        });
        self.descend_last();
        if self.stack.last()?.count() == 0 {
            return self.prev_entry();
        }
        self.key_value()
    }

    pub(crate) fn seek_entry(&mut self, key: &[u8]) -> Option<(Entry, Entry, u32)> {
        self.stack.clear();
        self.search(key, self.bucket.root_id());
        let top = self.stack.last()?;
        // the target may sort past this leaf's end; continue in the next
        if top.index >= top.count() {
            return self.next_entry();
        }
        self.key_value()
    }

    pub(crate) fn next_entry(&mut self) -> Option<(Entry, Entry, u32)> {
        loop {
            let mut found: Option<usize> = None;
            for j in (0..self.stack.len()).rev() {
                let elem = &mut self.stack[j];
                if elem.index + 1 < elem.count() {
                    elem.index += 1;
                    found = Some(j);
                    break;
                }
            }
            let j = found?;
            self.stack.truncate(j + 1);
            self.descend_first();
            if self.stack.last()?.count() == 0 {
                continue;
            }
            return self.key_value();
        }
    }

    pub(crate) fn prev_entry(&mut self) -> Option<(Entry, Entry, u32)> {
        loop {
            let mut found: Option<usize> = None;
            for j in (0..self.stack.len()).rev() {
                let elem = &mut self.stack[j];
                if elem.index > 0 && elem.count() > 0 {
                    elem.index -= 1;
                    found = Some(j);
                    break;
                }
            }
            let j = found?;
            self.stack.truncate(j + 1);
            self.descend_last();
            if self.stack.last()?.count() == 0 {
                continue;
            }
            return self.key_value();
        }
    }

    /// Descends to the leftmost leaf under the top frame.
    fn descend_first(&mut self) {
        loop {
            let top = self.stack.last().expect("cursor stack");
            if top.is_leaf() {
                break;
            }
            let pgid = match top.page_node.upgrade() {
                Either::Left(p) => p.branch_element(top.index).pgid,
                Either::Right(n) => n.0.inodes.borrow()[top.index].pgid(),
            };
            let pn = self.bucket.page_node(pgid).expect("descendant page");
            self.stack.push(ElemRef {
                page_node: pn,
                index: 0,
            });
        }
    }

    /// Descends to the rightmost leaf under the top frame.
    fn descend_last(&mut self) {
        loop {
            let top = self.stack.last().expect("cursor stack");
            if top.is_leaf() {
                break;
            }
            let pgid = match top.page_node.upgrade() {
                Either::Left(p) => p.branch_element(top.index).pgid,
                Either::Right(n) => n.0.inodes.borrow()[top.index].pgid(),
            };
            let pn = self.bucket.page_node(pgid).expect("descendant page");
            let count = pn.count();
            self.stack.push(ElemRef {
                page_node: pn,
                index: count.saturating_sub(1),
            });
        }
    }

    fn search(&mut self, key: &[u8], pgid: PageId) {
        let pn = self.bucket.page_node(pgid).expect("searchable page");
        let leaf = pn.is_leaf();
        self.stack.push(ElemRef {
            page_node: pn,
            index: 0,
        });
        if leaf {
            self.nsearch(key);
            return;
        }
        // largest branch element with key <= target
        let (index, child) = {
            let top = self.stack.last().unwrap();
            match top.page_node.upgrade() {
                Either::Left(p) => {
                    let elems = p.branch_elements().expect("branch page");
                    let index = match elems.binary_search_by(|e| e.key().cmp(key)) {
                        Ok(i) => i,
                        Err(i) => i.saturating_sub(1),
                    };
                    (index, elems[index].pgid)
                }
                Either::Right(n) => {
                    let inodes = n.0.inodes.borrow();
                    let index = match inodes.binary_search_by(|i| i.key().cmp(key)) {
                        Ok(i) => i,
                        Err(i) => i.saturating_sub(1),
                    };
                    (index, inodes[index].pgid())
                }
            }
        };
        self.stack.last_mut().unwrap().index = index;
        self.search(key, child);
    }

    /// Leaf-level search: first element >= key; may land one past the
    /// end.
    fn nsearch(&mut self, key: &[u8]) {
        let index = {
            let top = self.stack.last().unwrap();
            match top.page_node.upgrade() {
                Either::Left(p) => {
                    let elems = p.leaf_elements().expect("leaf page");
                    match elems.binary_search_by(|e| e.key().cmp(key)) {
                        Ok(i) | Err(i) => i,
                    }
                }
                Either::Right(n) => {
                    let inodes = n.0.inodes.borrow();
                    match inodes.binary_search_by(|i| i.key().cmp(key)) {
                        Ok(i) | Err(i) => i,
                    }
                }
            }
        };
        self.stack.last_mut().unwrap().index = index;
    }

    fn key_value(&self) -> Option<(Entry, Entry, u32)> {
        let top = self.stack.last()?;
        if top.count() == 0 || top.index >= top.count() {
            return None;
        }
        match top.page_node.upgrade() {
            Either::Left(p) => {
                let elem = p.leaf_element(top.index);
                Some((
                    Entry::from_slice(elem.key()),
                    Entry::from_slice(elem.value()),
                    elem.flags,
                ))
            }
            Either::Right(n) => {
                let inodes = n.0.inodes.borrow();
                let inode = &inodes[top.index];
                Some((
                    Entry::from_slice(inode.key()),
                    Entry::from_slice(inode.value()),
                    inode.flags(),
                ))
            }
        }
    }

    /// Materializes the node path down to the current leaf.
    pub(crate) fn node(&mut self) -> Node {
        assert!(!self.stack.is_empty(), "cursor not positioned");
        {
            let top = self.stack.last().unwrap();
            if top.is_leaf() {
                if let Either::Right(n) = &top.page_node.0 {
                    return n.clone();
                }
            }
        }
        let mut n = {
            let first = &self.stack[0];
            match &first.page_node.0 {
                Either::Right(node) => node.clone(),
                Either::Left(page) => self.bucket.node(page.id, WeakNode::new()),
            }
        };
        for i in 0..self.stack.len() - 1 {
            debug_assert!(!n.is_leaf(), "expected a branch on the cursor path");
            n = n.child_at(self.stack[i].index);
        }
        debug_assert!(n.is_leaf());
        n
    }
}

impl<'b> Iterator for Cursor<'b> {
    type Item = (&'b [u8], &'b [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = if self.stack.is_empty() {
                self.first_entry()
            } else {
                self.next_entry()
            };
            let (k, v, flags) = item?;
            if flags & BUCKET_LEAF_FLAG != 0 {
                continue;
            }
            return Some((k.slice(), v.slice()));
        }
    }
}

/// Iterator over the names of a bucket's direct sub-buckets, in order.
pub struct Buckets<'b> {
    cursor: Cursor<'b>,
}

impl<'b> Buckets<'b> {
    pub(crate) fn new(bucket: &'b Bucket) -> Buckets<'b> {
        Buckets {
            cursor: Cursor::new(bucket),
        }
    }
}

impl<'b> Iterator for Buckets<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = if self.cursor.stack.is_empty() {
                self.cursor.first_entry()
            } else {
                self.cursor.next_entry()
            };
            let (k, _, flags) = item?;
            if flags & BUCKET_LEAF_FLAG == 0 {
                continue;
            }
            return Some(k.slice());
        }
    }
}
