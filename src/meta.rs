use std::hash::Hasher;

use fnv::FnvHasher;
use memoffset::offset_of;

use crate::bucket::IBucket;
use crate::error::{Error, Result};
use crate::page::{Page, PageId, META_PAGE_FLAG};
use crate::transaction::TxId;
use crate::utils::struct_to_slice;

pub(crate) const MAGIC: u32 = 0xED0CDAED;
pub(crate) const VERSION: u32 = 2;

/// Stored in `Meta::freelist` when the freelist is not persisted
/// (NoFreelistSync); the list is rebuilt by a reachability walk on open.
pub(crate) const PGID_NO_FREELIST: PageId = PageId::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Meta {
    pub(crate) magic: u32,
    pub(crate) version: u32,
    pub(crate) page_size: u32,
    pub(crate) flags: u32,
    pub(crate) root: IBucket,
    pub(crate) freelist: PageId,
    /// One past the highest allocated page id.
    pub(crate) pgid: PageId,
    pub(crate) txid: TxId,
    pub(crate) checksum: u64,
}

impl Meta {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Invalid);
        }
        if self.version != VERSION {
            return Err(Error::Invalid);
        }
        if self.checksum != 0 && self.checksum != self.sum64() {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// FNV-1a (64-bit) over every field preceding the checksum.
    pub(crate) fn sum64(&self) -> u64 {
        let mut h = FnvHasher::default();
        let bytes = unsafe { struct_to_slice(self) };
        h.write(&bytes[..offset_of!(Meta, checksum)]);
        h.finish()
    }

    /// Serializes into the meta slot derived from the transaction id.
    pub(crate) fn write(&mut self, p: &mut Page) {
        assert!(
            self.root.root < self.pgid,
            "root bucket pgid {} above high water mark {}",
            self.root.root,
            self.pgid
        );
        p.id = self.txid % 2;
        p.flags = META_PAGE_FLAG;
        self.checksum = self.sum64();
        *p.meta_mut() = *self;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::OwnedPage;

    fn sample() -> Meta {
        let mut m = Meta {
            magic: MAGIC,
            version: VERSION,
            page_size: 4096,
            flags: 0,
            root: IBucket {
                root: 3,
                sequence: 0,
            },
            freelist: 2,
            pgid: 4,
            txid: 1,
            checksum: 0,
        };
        m.checksum = m.sum64();
        m
    }

    #[test]
    fn checksum_covers_fields() {
        let m = sample();
        assert!(m.validate().is_ok());

        let mut tampered = m;
        tampered.pgid += 1;
        assert!(tampered.validate().is_err());

        let mut bad_magic = m;
        bad_magic.magic = 0xDEADBEEF;
        assert!(bad_magic.validate().is_err());
    }

    #[test]
    fn write_targets_alternating_slot() {
        let mut op = OwnedPage::new(4096);
        let mut m = sample();
        m.write(op.page_mut());
        assert_eq!(op.page().id, 1);
        assert_eq!(op.page().flags, META_PAGE_FLAG);
        assert!(op.page().meta().unwrap().validate().is_ok());

        m.txid = 2;
        m.write(op.page_mut());
        assert_eq!(op.page().id, 0);
    }
}
