use std::fmt;
use std::ops::{Deref, DerefMut};
use std::slice::from_raw_parts;

/// Non-owning back-pointer used inside a single transaction's object
/// graph (node -> bucket, bucket -> transaction). The pointee always
/// outlives the holder: buckets and nodes are dropped together with the
/// transaction that materialized them.
pub(crate) struct RawPtr<T>(*mut T);

impl<T> RawPtr<T> {
    pub(crate) fn new(t: &T) -> Self {
        Self(t as *const T as *mut T)
    }

    pub(crate) fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    /// Detaches a mutable borrow from `self`. The caller is responsible
    /// for not aliasing another live `&mut` to the same pointee.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut<'a>(&self) -> &'a mut T {
        &mut *self.0
    }
}

impl<T> Clone for RawPtr<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<T> Copy for RawPtr<T> {}

impl<T> Default for RawPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Deref for RawPtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.0 }
    }
}

impl<T> DerefMut for RawPtr<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.0 }
    }
}

impl<T> fmt::Debug for RawPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPtr({:p})", self.0)
    }
}

/// Byte view into transaction-owned storage: either the mapped file or a
/// node's inode buffers. Valid for the life of the owning transaction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry {
    ptr: *const u8,
    len: usize,
}

impl Entry {
    pub(crate) fn from_slice(s: &[u8]) -> Entry {
        Entry {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    /// Reborrows the view with the caller's lifetime. The caller ties it
    /// to a borrow of the transaction (or something the transaction owns).
    pub(crate) fn slice<'a>(self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { from_raw_parts(self.ptr, self.len) }
    }
}
