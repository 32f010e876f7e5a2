use either::Either;

use crate::page::{PageId, BUCKET_LEAF_FLAG};

/// One element of an in-memory node: a branch pointer or a leaf pair.
#[derive(Debug, Clone)]
pub(crate) struct Inode(pub(crate) Either<BranchINode, LeafINode>);

impl Inode {
    pub(crate) fn branch(key: Vec<u8>, pgid: PageId) -> Inode {
        Inode(Either::Left(BranchINode { key, pgid }))
    }

    pub(crate) fn leaf(flags: u32, key: Vec<u8>, value: Vec<u8>) -> Inode {
        Inode(Either::Right(LeafINode { flags, key, value }))
    }

    pub(crate) fn key(&self) -> &[u8] {
        match &self.0 {
            Either::Left(b) => &b.key,
            Either::Right(l) => &l.key,
        }
    }

    pub(crate) fn value(&self) -> &[u8] {
        match &self.0 {
            Either::Left(_) => &[],
            Either::Right(l) => &l.value,
        }
    }

    pub(crate) fn pgid(&self) -> PageId {
        match &self.0 {
            Either::Left(b) => b.pgid,
            Either::Right(_) => 0,
        }
    }

    pub(crate) fn flags(&self) -> u32 {
        match &self.0 {
            Either::Left(_) => 0,
            Either::Right(l) => l.flags,
        }
    }

    pub(crate) fn is_bucket(&self) -> bool {
        self.flags() & BUCKET_LEAF_FLAG != 0
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BranchINode {
    pub(crate) key: Vec<u8>,
    pub(crate) pgid: PageId,
}

#[derive(Debug, Clone)]
pub(crate) struct LeafINode {
    pub(crate) flags: u32,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}
