//! The oversize side-chain: a singly-linked list of individually mapped
//! blocks, one per allocation too big for the arena's primary bump region.
//!
//! Each block stores its own metadata in the first page(s) of its mapping
//! and keeps that header read-only except during the narrow window where a
//! link pointer is being rewritten.  This avoids a second allocation per
//! oversize block at the cost of an `mprotect` on every structural change
//! to the chain.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::os::{self, Protection};

/// The header that lives at the base of every oversize mapping.
#[repr(C)]
struct RawHeader {
    payload: *mut u8,
    payload_size: usize,
    header_size: usize,
    next: *mut RawHeader,
}

// The header must stay well under one page: `push_new` rounds it up to a
// full page regardless, but a header that outgrew a page would silently
// eat a second page of every oversize mapping.
static_assertions::const_assert!(std::mem::size_of::<RawHeader>() <= 128);

impl RawHeader {
    unsafe fn mapping_base(node: NonNull<RawHeader>) -> NonNull<u8> {
        node.cast()
    }

    unsafe fn mapping_size(node: NonNull<RawHeader>) -> usize {
        let h = node.as_ref();
        h.header_size + h.payload_size
    }
}

/// A handle to one node in the chain.  Opaque outside this module; arenas
/// only ever hold the chain's head.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHandle(NonNull<RawHeader>);

/// The oversize chain owned by one arena.  `None` means the chain is empty.
#[derive(Default)]
pub struct LargeBlockList {
    head: Option<BlockHandle>,
}

impl LargeBlockList {
    pub const fn new() -> Self {
        LargeBlockList { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the payload pointer of the block at the top of the chain.
    pub fn head_payload(&self) -> Option<NonNull<u8>> {
        self.head
            .map(|h| NonNull::new(unsafe { h.0.as_ref().payload }).expect("payload is non-null"))
    }

    /// Allocates a fresh oversize block of `payload_size` bytes and pushes
    /// it onto the front of the chain, returning its payload pointer.
    #[requires(payload_size > 0, "oversize blocks must not be empty")]
    pub fn push_new(&mut self, payload_size: usize) -> Result<NonNull<u8>> {
        let header_struct_size = std::mem::size_of::<RawHeader>();
        // `header_size` must itself be a page multiple: `mprotect` rounds
        // its length up to a whole number of pages, so a header shorter
        // than a page would have the kernel extend the read-only
        // protection into the start of the payload.
        let header_size = os::page_align_up(header_struct_size);
        let rounded_payload = os::page_align_up(payload_size);
        let total_size = header_size + rounded_payload;

        let mapping = os::reserve_commit(total_size)?;
        let header_ptr = mapping.as_ptr() as *mut RawHeader;
        let payload_ptr = unsafe { mapping.as_ptr().add(header_size) };

        let next_raw = self.head.map_or(std::ptr::null_mut(), |h| h.0.as_ptr());
        unsafe {
            header_ptr.write(RawHeader {
                payload: payload_ptr,
                // Store the rounded capacity, not the caller's requested
                // size: `mapping_size` reconstructs the release length as
                // `header_size + payload_size`, which must equal
                // `total_size` exactly.
                payload_size: rounded_payload,
                header_size,
                next: next_raw,
            });
        }

        os::protect(mapping, header_size, Protection::ReadOnly)?;

        let handle = BlockHandle(NonNull::new(header_ptr).expect("mapping base is non-null"));
        self.head = Some(handle);
        Ok(NonNull::new(payload_ptr).expect("payload is non-null"))
    }

    /// Tears down exactly `handle`, without touching its neighbors.
    fn destroy_one(handle: BlockHandle) -> Result<()> {
        let node = handle.0;
        let base = unsafe { RawHeader::mapping_base(node) };
        let size = unsafe { RawHeader::mapping_size(node) };
        let header_size = unsafe { node.as_ref().header_size };

        // Header must be writable before we can zero it; failures here
        // are surfaced, but we still attempt the release below so a
        // protect failure doesn't also leak the mapping.
        let unprotect_result = os::protect(base, header_size, Protection::ReadWrite);
        if unprotect_result.is_ok() {
            unsafe {
                node.as_ptr().write(RawHeader {
                    payload: std::ptr::null_mut(),
                    payload_size: 0,
                    header_size: 0,
                    next: std::ptr::null_mut(),
                });
            }
        }

        os::release(base, size)?;
        unprotect_result
    }

    /// Pops the head of the chain, destroying its mapping.  No-op if the
    /// chain is already empty.
    pub fn pop_head(&mut self) -> Result<()> {
        if let Some(head) = self.head.take() {
            let next = unsafe { head.0.as_ref().next };
            Self::destroy_one(head)?;
            self.head = NonNull::new(next).map(BlockHandle);
        }
        Ok(())
    }

    /// Tears down every node in the chain, iteratively: the chain can be
    /// arbitrarily long and is entirely caller-controlled, so recursing one
    /// stack frame per node (as the oversize chain's original destroy loop
    /// does) risks overflowing the stack.
    pub fn destroy_all(&mut self) -> Result<()> {
        let mut cursor = self.head.take();
        let mut first_err = None;

        while let Some(handle) = cursor {
            let next = unsafe { handle.0.as_ref().next };
            if let Err(e) = Self::destroy_one(handle) {
                log::debug!("failed to release an oversize block: {}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            cursor = NonNull::new(next).map(BlockHandle);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Removes the single node whose payload begins at `target` from the
    /// chain and destroys it.  Used when a scratch subarena that was
    /// backed by an oversize block is destroyed or merged.
    pub fn delete_by_payload(&mut self, target: NonNull<u8>) -> Result<()> {
        let Some(head) = self.head else {
            return Err(Error::InvalidParams("oversize chain is empty"));
        };

        if unsafe { head.0.as_ref().payload } == target.as_ptr() {
            return self.pop_head();
        }

        let mut prev = head;
        let mut cursor = unsafe { NonNull::new(prev.0.as_ref().next).map(BlockHandle) };

        while let Some(curr) = cursor {
            if unsafe { curr.0.as_ref().payload } == target.as_ptr() {
                let next = unsafe { curr.0.as_ref().next };

                let prev_header_size = unsafe { prev.0.as_ref().header_size };
                let prev_base = unsafe { RawHeader::mapping_base(prev.0) };
                os::protect(prev_base, prev_header_size, Protection::ReadWrite)?;
                unsafe {
                    prev.0.as_ptr().as_mut().unwrap().next = next;
                }
                os::protect(prev_base, prev_header_size, Protection::ReadOnly)?;

                return Self::destroy_one(curr);
            }

            prev = curr;
            cursor = unsafe { NonNull::new(curr.0.as_ref().next).map(BlockHandle) };
        }

        Err(Error::InvalidParams("no oversize block matches that address"))
    }

    /// Splices `other`'s nodes onto the tail of `self`, consuming `other`.
    pub fn merge(&mut self, mut other: LargeBlockList) -> Result<()> {
        let Some(other_head) = other.head.take() else {
            return Ok(());
        };

        let Some(self_head) = self.head else {
            self.head = Some(other_head);
            return Ok(());
        };

        let mut tail = self_head;
        while let Some(next) = unsafe { NonNull::new(tail.0.as_ref().next).map(BlockHandle) } {
            tail = next;
        }

        let tail_header_size = unsafe { tail.0.as_ref().header_size };
        let tail_base = unsafe { RawHeader::mapping_base(tail.0) };
        os::protect(tail_base, tail_header_size, Protection::ReadWrite)?;
        unsafe {
            tail.0.as_ptr().as_mut().unwrap().next = other_head.0.as_ptr();
        }
        os::protect(tail_base, tail_header_size, Protection::ReadOnly)?;

        Ok(())
    }
}

impl Drop for LargeBlockList {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_all() {
            log::warn!("oversize chain leaked on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_round_trip() {
        let mut list = LargeBlockList::new();
        assert!(list.is_empty());

        let p1 = list.push_new(100).expect("first block");
        unsafe { std::ptr::write_bytes(p1.as_ptr(), 0xAA, 100) };

        let p2 = list.push_new(200).expect("second block");
        assert_ne!(p1.as_ptr(), p2.as_ptr());
        assert_eq!(list.head_payload(), Some(p2));

        list.pop_head().expect("pop head");
        assert_eq!(list.head_payload(), Some(p1));

        list.pop_head().expect("pop head");
        assert!(list.is_empty());
    }

    #[test]
    fn destroy_all_is_iterative_and_empties_the_list() {
        let mut list = LargeBlockList::new();
        for i in 0..64 {
            list.push_new(64 + i).expect("block");
        }

        list.destroy_all().expect("destroy_all");
        assert!(list.is_empty());
    }

    #[test]
    fn delete_by_payload_splices_out_the_middle() {
        let mut list = LargeBlockList::new();
        let p1 = list.push_new(64).expect("block 1");
        let p2 = list.push_new(64).expect("block 2");
        let p3 = list.push_new(64).expect("block 3");

        // Chain order is LIFO: p3 -> p2 -> p1.
        list.delete_by_payload(p2).expect("delete middle");
        assert_eq!(list.head_payload(), Some(p3));

        list.pop_head().expect("pop p3");
        assert_eq!(list.head_payload(), Some(p1));
    }

    #[test]
    fn delete_by_payload_rejects_unknown_address() {
        let mut list = LargeBlockList::new();
        list.push_new(64).expect("block");

        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(list.delete_by_payload(bogus).is_err());
    }

    #[test]
    fn merge_concatenates_chains() {
        let mut a = LargeBlockList::new();
        let mut b = LargeBlockList::new();

        let pa = a.push_new(64).expect("a block");
        let pb = b.push_new(64).expect("b block");

        a.merge(b).expect("merge");
        assert_eq!(a.head_payload(), Some(pa));

        a.pop_head().expect("pop a head");
        assert_eq!(a.head_payload(), Some(pb));
    }
}
