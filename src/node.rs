use std::cell::{Cell, RefCell};
use std::ptr::copy_nonoverlapping;
use std::rc::{Rc, Weak};

use crate::bucket::Bucket;
use crate::data::RawPtr;
use crate::error::Result;
use crate::inode::Inode;
use crate::page::{
    page_header_size, Page, PageId, BranchPageElement, LeafPageElement, BRANCH_ELEMENT_SIZE,
    BRANCH_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG, MIN_KEYS_PER_PAGE,
};
use crate::transaction::TransactionInner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeType {
    Branch,
    Leaf,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::Leaf
    }
}

/// Mutable in-memory shadow of a page, alive for one write transaction.
/// Shared handles let the parent/child graph reference the same node from
/// several frames; the bucket's node cache and each parent's `children`
/// vector hold the owning references.
#[derive(Clone, Debug, Default)]
pub(crate) struct Node(pub(crate) Rc<NodeInner>);

#[derive(Clone, Debug, Default)]
pub(crate) struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub(crate) fn new() -> Self {
        Self(Weak::new())
    }

    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }

    pub(crate) fn from(n: &Node) -> Self {
        Self(Rc::downgrade(&n.0))
    }
}

#[derive(Debug, Default)]
pub(crate) struct NodeInner {
    bucket: RawPtr<Bucket>,
    pub(crate) pgid: Cell<PageId>,
    node_type: Cell<NodeType>,
    unbalanced: Cell<bool>,
    spilled: Cell<bool>,
    /// Key this node is filed under in its parent (first key at read
    /// time; updated on spill).
    pub(crate) key: RefCell<Vec<u8>>,
    pub(crate) inodes: RefCell<Vec<Inode>>,
    pub(crate) children: RefCell<Vec<Node>>,
    parent: RefCell<WeakNode>,
}

impl Node {
    pub(crate) fn new(bucket: RawPtr<Bucket>, node_type: NodeType) -> Node {
        Node(Rc::new(NodeInner {
            bucket,
            node_type: Cell::new(node_type),
            ..Default::default()
        }))
    }

    fn bucket(&self) -> &Bucket {
        &self.0.bucket
    }

    fn bucket_mut(&self) -> &mut Bucket {
        unsafe { self.0.bucket.as_mut() }
    }

    fn tx(&self) -> &TransactionInner {
        self.bucket().tx()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.0.node_type.get() == NodeType::Leaf
    }

    pub(crate) fn pgid(&self) -> PageId {
        self.0.pgid.get()
    }

    pub(crate) fn parent(&self) -> Option<Node> {
        self.0.parent.borrow().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: WeakNode) {
        *self.0.parent.borrow_mut() = parent;
    }

    fn min_keys(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            2
        }
    }

    fn page_elem_size(&self) -> usize {
        if self.is_leaf() {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Bytes needed to serialize this node.
    pub(crate) fn size(&self) -> usize {
        let elem = self.page_elem_size();
        let mut size = page_header_size();
        for inode in self.0.inodes.borrow().iter() {
            size += elem + inode.key().len() + inode.value().len();
        }
        size
    }

    fn size_less_than(&self, v: usize) -> bool {
        let elem = self.page_elem_size();
        let mut size = page_header_size();
        for inode in self.0.inodes.borrow().iter() {
            size += elem + inode.key().len() + inode.value().len();
            if size >= v {
                return false;
            }
        }
        true
    }

    /// Inserts or replaces an element. `old_key` locates the slot,
    /// `new_key` is what gets stored.
    pub(crate) fn put(&self, old_key: &[u8], new_key: &[u8], value: &[u8], pgid: PageId, flags: u32) {
        debug_assert!(!old_key.is_empty(), "put: zero-length old key");
        debug_assert!(!new_key.is_empty(), "put: zero-length new key");
        let inode = match self.0.node_type.get() {
            NodeType::Branch => Inode::branch(new_key.to_vec(), pgid),
            NodeType::Leaf => Inode::leaf(flags, new_key.to_vec(), value.to_vec()),
        };
        let mut inodes = self.0.inodes.borrow_mut();
        match inodes.binary_search_by(|i| i.key().cmp(old_key)) {
            Ok(i) => inodes[i] = inode,
            Err(i) => inodes.insert(i, inode),
        }
    }

    pub(crate) fn del(&self, key: &[u8]) {
        let mut inodes = self.0.inodes.borrow_mut();
        if let Ok(i) = inodes.binary_search_by(|n| n.key().cmp(key)) {
            inodes.remove(i);
            self.0.unbalanced.set(true);
        }
    }

    pub(crate) fn read(&self, p: &Page) -> Result<()> {
        self.0.pgid.set(p.id);
        self.0.node_type.set(if p.is_leaf() {
            NodeType::Leaf
        } else {
            NodeType::Branch
        });
        let inodes: Vec<Inode> = if p.is_leaf() {
            p.leaf_elements()?
                .iter()
                .map(|e| Inode::leaf(e.flags, e.key().to_vec(), e.value().to_vec()))
                .collect()
        } else {
            p.branch_elements()?
                .iter()
                .map(|e| Inode::branch(e.key().to_vec(), e.pgid))
                .collect()
        };
        *self.0.key.borrow_mut() = inodes.first().map(|i| i.key().to_vec()).unwrap_or_default();
        *self.0.inodes.borrow_mut() = inodes;
        Ok(())
    }

    /// Serializes into a page buffer. The caller has already sized the
    /// buffer (`1 + overflow` pages) and set `id`/`overflow`.
    pub(crate) fn write(&self, p: &mut Page) {
        p.flags = if self.is_leaf() {
            LEAF_PAGE_FLAG
        } else {
            BRANCH_PAGE_FLAG
        };
        let inodes = self.0.inodes.borrow();
        assert!(inodes.len() < 0xFFFF, "inode overflow: {}", inodes.len());
        p.count = inodes.len() as u16;
        if p.count == 0 {
            return;
        }
        // element array first, then keys and values
        let mut addr = unsafe { p.data_ptr_mut().add(self.page_elem_size() * inodes.len()) };
        match self.0.node_type.get() {
            NodeType::Branch => {
                let elems = p.branch_elements_mut();
                for (i, inode) in inodes.iter().enumerate() {
                    let elem = &mut elems[i];
                    let elem_addr = elem as *const BranchPageElement as usize;
                    elem.pos = (addr as usize - elem_addr) as u32;
                    elem.ksize = inode.key().len() as u32;
                    elem.pgid = inode.pgid();
                    unsafe {
                        copy_nonoverlapping(inode.key().as_ptr(), addr, inode.key().len());
                        addr = addr.add(inode.key().len());
                    }
                }
            }
            NodeType::Leaf => {
                let elems = p.leaf_elements_mut();
                for (i, inode) in inodes.iter().enumerate() {
                    let elem = &mut elems[i];
                    let elem_addr = elem as *const LeafPageElement as usize;
                    elem.pos = (addr as usize - elem_addr) as u32;
                    elem.flags = inode.flags();
                    elem.ksize = inode.key().len() as u32;
                    elem.vsize = inode.value().len() as u32;
                    unsafe {
                        copy_nonoverlapping(inode.key().as_ptr(), addr, inode.key().len());
                        addr = addr.add(inode.key().len());
                        copy_nonoverlapping(inode.value().as_ptr(), addr, inode.value().len());
                        addr = addr.add(inode.value().len());
                    }
                }
            }
        }
    }

    /// Splits into a chain of siblings each fitting one page.
    fn split(&self, page_size: usize) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut node = self.clone();
        loop {
            let next = node.split_two(page_size);
            nodes.push(node);
            match next {
                Some(n) => node = n,
                None => break,
            }
        }
        nodes
    }

    fn split_two(&self, page_size: usize) -> Option<Node> {
        if self.0.inodes.borrow().len() <= MIN_KEYS_PER_PAGE * 2 || self.size_less_than(page_size)
        {
            return None;
        }
        let fill = self
            .bucket()
            .fill_percent()
            .clamp(Bucket::MIN_FILL_PERCENT, Bucket::MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let (split_index, _) = self.split_index(threshold);

        // splitting the root grows the tree by one level
        if self.parent().is_none() {
            let parent = Node::new(self.0.bucket, NodeType::Branch);
            self.set_parent(WeakNode::from(&parent));
            parent.0.children.borrow_mut().push(self.clone());
            self.bucket().set_root_node(parent);
        }
        let next = Node::new(self.0.bucket, self.0.node_type.get());
        let parent = self.parent().unwrap();
        next.set_parent(WeakNode::from(&parent));
        parent.0.children.borrow_mut().push(next.clone());

        let moved: Vec<Inode> = self.0.inodes.borrow_mut().drain(split_index..).collect();
        *next.0.inodes.borrow_mut() = moved;
        self.tx().stats.borrow_mut().split += 1;
        Some(next)
    }

    /// Highest index whose prefix stays within `threshold` bytes while
    /// leaving the minimum key count on both sides.
    fn split_index(&self, threshold: usize) -> (usize, usize) {
        let elem_size = self.page_elem_size();
        let inodes = self.0.inodes.borrow();
        let mut index = 0;
        let mut size = page_header_size();
        for (i, inode) in inodes
            .iter()
            .enumerate()
            .take(inodes.len() - MIN_KEYS_PER_PAGE)
        {
            index = i;
            let el = elem_size + inode.key().len() + inode.value().len();
            if i >= MIN_KEYS_PER_PAGE && size + el > threshold {
                break;
            }
            size += el;
        }
        (index, size)
    }

    /// Writes this node and its children to freshly allocated dirty
    /// pages, bottom-up. Every page on the modified path is rewritten,
    /// which is what makes the tree copy-on-write.
    pub(crate) fn spill(&self) -> Result<()> {
        if self.0.spilled.get() {
            return Ok(());
        }
        {
            let mut children = self.0.children.borrow_mut();
            children.sort_by(|a, b| a.0.key.borrow().cmp(&b.0.key.borrow()));
        }
        let children: Vec<Node> = self.0.children.borrow().clone();
        for child in &children {
            child.spill()?;
        }
        self.0.children.borrow_mut().clear();

        let tx = self.tx();
        let page_size = tx.page_size() as usize;
        let nodes = self.split(page_size);
        for node in &nodes {
            if node.0.pgid.get() > 0 {
                tx.free_page(node.0.pgid.get());
                node.0.pgid.set(0);
            }
            let count = (node.size() + page_size - 1) / page_size;
            let (pgid, page) = tx.allocate(count)?;
            node.0.pgid.set(pgid);
            node.write(unsafe { page.as_mut() });
            node.0.spilled.set(true);
            tx.stats.borrow_mut().spill += 1;

            // reindex under the parent
            if let Some(parent) = node.parent() {
                let old_key = {
                    let k = node.0.key.borrow();
                    if k.is_empty() {
                        node.0.inodes.borrow()[0].key().to_vec()
                    } else {
                        k.clone()
                    }
                };
                let new_key = node.0.inodes.borrow()[0].key().to_vec();
                parent.put(&old_key, &new_key, &[], node.0.pgid.get(), 0);
                *node.0.key.borrow_mut() = new_key;
            }
        }
        // a root split created an unspilled parent above us
        if let Some(parent) = self.parent() {
            if parent.0.pgid.get() == 0 {
                self.0.children.borrow_mut().clear();
                return parent.spill();
            }
        }
        Ok(())
    }

    /// Merges underfilled nodes with a sibling; the root collapses into
    /// its only child instead.
    pub(crate) fn rebalance(&self) {
        if !self.0.unbalanced.get() {
            return;
        }
        self.0.unbalanced.set(false);
        self.tx().stats.borrow_mut().rebalance += 1;

        let threshold = self.tx().page_size() as usize / 4;
        if self.size() > threshold && self.0.inodes.borrow().len() > self.min_keys() {
            return;
        }

        if self.parent().is_none() {
            let collapse = !self.is_leaf() && self.0.inodes.borrow().len() == 1;
            if collapse {
                let child_pgid = self.0.inodes.borrow()[0].pgid();
                let child = self.bucket_mut().node(child_pgid, WeakNode::from(self));

                self.0.node_type.set(child.0.node_type.get());
                *self.0.inodes.borrow_mut() = child.0.inodes.borrow_mut().drain(..).collect();
                *self.0.children.borrow_mut() = child.0.children.borrow_mut().drain(..).collect();

                {
                    let inodes = self.0.inodes.borrow();
                    for inode in inodes.iter() {
                        if let Some(gc) = self.bucket().nodes.borrow().get(&inode.pgid()) {
                            gc.set_parent(WeakNode::from(self));
                        }
                    }
                }
                child.set_parent(WeakNode::new());
                self.bucket().nodes.borrow_mut().remove(&child.pgid());
                child.free();
            }
            return;
        }

        if self.0.inodes.borrow().is_empty() {
            let key = self.0.key.borrow().clone();
            let parent = self.parent().unwrap();
            parent.del(&key);
            parent.remove_child(self);
            self.bucket().nodes.borrow_mut().remove(&self.pgid());
            self.free();
            parent.rebalance();
            return;
        }

        let parent = self.parent().unwrap();
        let merge_into_self = parent.child_index(self) == 0;
        // always merge towards the left sibling so split keys stay monotone
        if merge_into_self {
            let target = self.next_sibling().unwrap();
            {
                let target_inodes = target.0.inodes.borrow();
                for inode in target_inodes.iter() {
                    let child = self.bucket().nodes.borrow().get(&inode.pgid()).cloned();
                    if let Some(child) = child {
                        if let Some(cp) = child.parent() {
                            cp.remove_child(&child);
                        }
                        child.set_parent(WeakNode::from(self));
                        self.0.children.borrow_mut().push(child.clone());
                    }
                }
            }
            self.0
                .inodes
                .borrow_mut()
                .append(&mut target.0.inodes.borrow_mut());
            parent.del(&target.0.key.borrow());
            parent.remove_child(&target);
            self.bucket().nodes.borrow_mut().remove(&target.pgid());
            target.free();
        } else {
            let target = self.prev_sibling().unwrap();
            {
                let inodes = self.0.inodes.borrow();
                for inode in inodes.iter() {
                    let child = self.bucket().nodes.borrow().get(&inode.pgid()).cloned();
                    if let Some(child) = child {
                        if let Some(cp) = child.parent() {
                            cp.remove_child(&child);
                        }
                        child.set_parent(WeakNode::from(&target));
                        target.0.children.borrow_mut().push(child.clone());
                    }
                }
            }
            target
                .0
                .inodes
                .borrow_mut()
                .append(&mut self.0.inodes.borrow_mut());
            parent.del(&self.0.key.borrow());
            parent.remove_child(self);
            self.bucket().nodes.borrow_mut().remove(&self.pgid());
            self.free();
        }
        parent.rebalance();
    }

    pub(crate) fn child_at(&self, index: usize) -> Node {
        assert!(!self.is_leaf(), "child_at on a leaf node");
        let pgid = self.0.inodes.borrow()[index].pgid();
        self.bucket_mut().node(pgid, WeakNode::from(self))
    }

    /// Index this child occupies (or would occupy) among the inodes.
    fn child_index(&self, child: &Node) -> usize {
        let key = child.0.key.borrow();
        let inodes = self.0.inodes.borrow();
        match inodes.binary_search_by(|i| i.key().cmp(&key)) {
            Ok(i) => i,
            Err(i) => i,
        }
    }

    fn next_sibling(&self) -> Option<Node> {
        let parent = self.parent()?;
        let index = parent.child_index(self);
        if index + 1 >= parent.0.inodes.borrow().len() {
            return None;
        }
        Some(parent.child_at(index + 1))
    }

    fn prev_sibling(&self) -> Option<Node> {
        let parent = self.parent()?;
        let index = parent.child_index(self);
        if index == 0 {
            return None;
        }
        Some(parent.child_at(index - 1))
    }

    pub(crate) fn remove_child(&self, target: &Node) {
        let mut children = self.0.children.borrow_mut();
        if let Some(i) = children.iter().position(|c| Rc::ptr_eq(&c.0, &target.0)) {
            children.remove(i);
        }
    }

    /// Returns this node's page to the freelist.
    pub(crate) fn free(&self) {
        if self.0.pgid.get() != 0 {
            self.tx().free_page(self.0.pgid.get());
            self.0.pgid.set(0);
        }
    }
}
