//! A chain of large reservations, each lazily committed like a
//! [`crate::virtual_arena::VirtualArena`].  When the current block can't
//! satisfy a push even at full commit, a fresh block is prepended and the
//! exhausted one is frozen; teardown walks the chain back to front.
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

use crate::cache::cache_line_size;
use crate::error::{Error, Result};
use crate::large_block::LargeBlockList;
use crate::os;
use crate::policy;

/// A frozen predecessor block, stored in the first bytes of the block
/// that superseded it.  Carries everything needed to either release the
/// mapping (`destroy`/`clear_all`) or resurrect it as the live head again
/// (`pop_block`).
#[repr(C)]
struct ChainNode {
    memory: *mut u8,
    mapping_size: usize,
    base_ptr: *mut u8,
    base_size: usize,
    position: usize,
    committed: usize,
    next: *mut ChainNode,
}

// Same reasoning as `RawHeader` in `large_block.rs`: this node is frozen
// into the start of the block that superseded it, so it must stay small
// relative to any block size this arena is configured with.
static_assertions::const_assert!(std::mem::size_of::<ChainNode>() <= 128);

struct FreshBlock {
    memory: NonNull<u8>,
    mapping_size: usize,
    base_ptr: NonNull<u8>,
    base_size: usize,
    committed: usize,
}

fn build_block(base_block: usize, newblock_pagealign: bool) -> Result<FreshBlock> {
    let node_size = std::mem::size_of::<ChainNode>();
    let base_ptr_offset = if newblock_pagealign {
        os::page_align_up(node_size)
    } else {
        node_size
    };

    let mapping_size = os::page_align_up(base_ptr_offset + base_block);
    let base_size = mapping_size - base_ptr_offset;

    let memory = os::reserve(mapping_size)?;

    let initial_commit = os::page_align_up(base_ptr_offset + os::page_size().min(base_size));
    if let Err(e) = os::commit(memory, initial_commit) {
        let _ = os::release(memory, mapping_size);
        return Err(e);
    }

    let base_ptr = unsafe { NonNull::new_unchecked(memory.as_ptr().add(base_ptr_offset)) };

    Ok(FreshBlock {
        memory,
        mapping_size,
        base_ptr,
        base_size,
        committed: initial_commit - base_ptr_offset,
    })
}

/// Releases every node in a frozen-block chain.
///
/// Each `ChainNode` is stored inside the block that superseded it, and its
/// `next` pointer points to a node stored inside the block *it* describes.
/// That means releasing a block while still walking through it would free
/// the memory the next iteration needs to read. So this walks the whole
/// chain first, copying out every `(memory, mapping_size)` pair while
/// every block is still mapped, and only releases them in a second pass
/// once no further pointer chasing is needed. The walk is iterative rather
/// than recursive: a recursive walk would blow the stack on a long enough
/// chain, which the original destructor (stack-recursing one frame per
/// block) does not guard against.
fn destroy_node_chain(mut cursor: Option<NonNull<ChainNode>>) -> Result<()> {
    let mut to_release = Vec::new();

    while let Some(node) = cursor {
        let (memory, mapping_size, next) = unsafe {
            let n = node.as_ref();
            (n.memory, n.mapping_size, n.next)
        };

        to_release.push((memory, mapping_size));
        cursor = NonNull::new(next);
    }

    let mut first_err = None;
    for (memory, mapping_size) in to_release {
        if let Some(base) = NonNull::new(memory) {
            if let Err(e) = os::release(base, mapping_size) {
                log::debug!("failed to release a chained block: {}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub struct ChainArena {
    memory: NonNull<u8>,
    mapping_size: usize,
    base_ptr: NonNull<u8>,
    base_size: usize,
    base_block: usize,
    position: usize,
    committed: usize,
    next: Option<NonNull<ChainNode>>,
    blocks: LargeBlockList,
    alignment: usize,
    auto_align: bool,
    newblock_pagealign: bool,
}

unsafe impl Send for ChainArena {}

impl ChainArena {
    #[requires(block_size >= os::page_size(), "block size must be at least one page")]
    pub fn init(block_size: usize, auto_align: usize, newblock_pagealign: bool) -> Result<Self> {
        if block_size < os::page_size() {
            return Err(Error::InvalidParams("block_size must be at least one page"));
        }

        let auto_align_on = auto_align != 0;
        if auto_align_on && !policy::is_valid_alignment(auto_align) {
            return Err(Error::InvalidParams(
                "auto_align must be zero or a power of two at least a word wide",
            ));
        }
        let alignment = if auto_align_on { auto_align } else { policy::WORD_SIZE };

        let base_block = os::page_align_up(block_size);
        let block = build_block(base_block, newblock_pagealign)?;

        Ok(ChainArena {
            memory: block.memory,
            mapping_size: block.mapping_size,
            base_ptr: block.base_ptr,
            base_size: block.base_size,
            base_block,
            position: 0,
            committed: block.committed,
            next: None,
            blocks: LargeBlockList::new(),
            alignment,
            auto_align: auto_align_on,
            newblock_pagealign,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn block_capacity(&self) -> usize {
        self.base_size
    }

    #[requires(policy::is_valid_alignment(alignment), "alignment must be a power of two word or larger")]
    pub fn set_auto_align(&mut self, alignment: usize, on: bool) -> Result<()> {
        if !policy::is_valid_alignment(alignment) {
            return Err(Error::InvalidParams(
                "alignment must be a power of two at least a word wide",
            ));
        }
        self.auto_align = on;
        if on {
            self.alignment = alignment;
        }
        Ok(())
    }

    fn apply_auto_align(&mut self) {
        if self.auto_align {
            self.position = policy::align_up(self.position, self.alignment);
        }
    }

    pub fn push_aligner(&mut self, alignment: usize) -> Result<()> {
        if !policy::is_valid_alignment(alignment) {
            return Err(Error::InvalidParams(
                "alignment must be a power of two at least a word wide",
            ));
        }
        self.position = policy::align_up(self.position, alignment);
        Ok(())
    }

    pub fn push_aligner_cacheline(&mut self) -> Result<()> {
        self.position = policy::align_up(self.position, cache_line_size());
        Ok(())
    }

    pub fn push_aligner_pagesize(&mut self) -> Result<()> {
        self.position = policy::align_up(self.position, os::page_size());
        Ok(())
    }

    /// Replaces the current (exhausted) block with a fresh one of the same
    /// configured size, freezing the old one into a `ChainNode` stored at
    /// the base of the new block's mapping.  The oversize chain (`blocks`)
    /// is untouched: it belongs to `self`, not to any individual block, so
    /// the new head keeps it automatically.
    fn new_block(&mut self) -> Result<()> {
        let old_memory = self.memory;
        let old_mapping_size = self.mapping_size;
        let old_base_ptr = self.base_ptr;
        let old_base_size = self.base_size;
        let old_position = self.position;
        let old_committed = self.committed;
        let old_next = self.next;

        let fresh = build_block(self.base_block, self.newblock_pagealign)?;

        let node_ptr = fresh.memory.as_ptr() as *mut ChainNode;
        unsafe {
            node_ptr.write(ChainNode {
                memory: old_memory.as_ptr(),
                mapping_size: old_mapping_size,
                base_ptr: old_base_ptr.as_ptr(),
                base_size: old_base_size,
                position: old_position,
                committed: old_committed,
                next: old_next.map_or(std::ptr::null_mut(), |n| n.as_ptr()),
            });
        }

        self.memory = fresh.memory;
        self.mapping_size = fresh.mapping_size;
        self.base_ptr = fresh.base_ptr;
        self.base_size = fresh.base_size;
        self.position = 0;
        self.committed = fresh.committed;
        self.next = NonNull::new(node_ptr);

        Ok(())
    }

    fn extend_commit(&mut self, target: usize) -> Result<()> {
        let target = target.min(self.base_size);

        if target == self.committed {
            log::debug!("chained block exhausted, starting a new one");
            return self.new_block();
        }

        let base_ptr_offset = self.base_ptr.as_ptr() as usize - self.memory.as_ptr() as usize;
        let commit_len = os::page_align_up(base_ptr_offset + target);
        os::commit(self.memory, commit_len)?;
        self.committed = target;
        Ok(())
    }

    fn reduce_commit(&mut self, target: usize) -> Result<()> {
        if target >= self.committed {
            return Ok(());
        }

        let base_ptr_offset = self.base_ptr.as_ptr() as usize - self.memory.as_ptr() as usize;
        let from = unsafe { NonNull::new_unchecked(self.base_ptr.as_ptr().add(target)) };
        let _ = base_ptr_offset;
        os::decommit(from, self.committed - target)?;
        self.committed = target;
        Ok(())
    }

    fn shrink_after_pop(&mut self) {
        while self.position > os::page_size() && policy::should_reduce(self.committed, self.position) {
            let target = policy::reduce_policy(self.committed);
            if let Err(e) = self.reduce_commit(target) {
                log::debug!("reduce_commit failed during pop: {}", e);
                break;
            }
        }
    }

    /// Carves `bytes` without zeroing.  Allocations over half the
    /// configured block size skip straight to the oversize chain: a
    /// single block can never satisfy them, and retrying would otherwise
    /// spin creating ever more same-sized blocks.
    pub fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.apply_auto_align();

        if bytes > self.base_block / 2 {
            return self.blocks.push_new(bytes).ok();
        }

        while self.position + bytes > self.committed {
            let next_target = policy::extend_policy(self.committed.max(1));
            if self.extend_commit(next_target).is_err() {
                return None;
            }
        }

        let ptr = unsafe { self.base_ptr.as_ptr().add(self.position) };
        self.position += bytes;
        NonNull::new(ptr)
    }

    pub fn push(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.push_no_zero(bytes)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    pub fn pop(&mut self, bytes: usize) {
        self.position = self.position.saturating_sub(bytes);
        self.shrink_after_pop();
    }

    pub fn pop_to(&mut self, position: usize) {
        if position < self.position {
            self.position = position;
        }
        self.shrink_after_pop();
    }

    pub fn pop_to_address(&mut self, address: NonNull<u8>) -> Result<()> {
        let base = self.base_ptr.as_ptr() as usize;
        let addr = address.as_ptr() as usize;
        let top = base + self.position;

        if addr < base || addr >= top {
            return Err(Error::InvalidParams(
                "address is not within the current block's live region",
            ));
        }

        self.position = addr - base;
        self.shrink_after_pop();
        Ok(())
    }

    pub fn pop_large_block(&mut self) -> Result<()> {
        self.blocks.pop_head()
    }

    /// Pops the current (frozen-on-arrival) block, restoring the previous
    /// one as the live head.  The inverse of `new_block`.
    pub fn pop_block(&mut self) -> Result<()> {
        let Some(next) = self.next else {
            return Err(Error::InvalidParams("no older block to pop back to"));
        };

        let (memory, mapping_size, base_ptr, base_size, position, committed, next_next) = unsafe {
            let n = next.as_ref();
            (
                n.memory, n.mapping_size, n.base_ptr, n.base_size, n.position, n.committed,
                n.next,
            )
        };

        let old_current_memory = self.memory;
        let old_current_mapping_size = self.mapping_size;

        self.memory = NonNull::new(memory).expect("chain node memory is non-null");
        self.mapping_size = mapping_size;
        self.base_ptr = NonNull::new(base_ptr).expect("chain node base_ptr is non-null");
        self.base_size = base_size;
        self.position = position;
        self.committed = committed;
        self.next = NonNull::new(next_next);

        os::release(old_current_memory, old_current_mapping_size)
    }

    /// Resets only the current block; older blocks and the oversize chain
    /// are left alone.
    pub fn clear_current_block(&mut self) -> Result<()> {
        self.position = 0;
        if let Err(e) = self.reduce_commit(os::page_size().min(self.base_size)) {
            log::debug!("reduce_commit failed during clear_current_block: {}", e);
        }
        Ok(())
    }

    /// Resets the current block, releases every older block, and
    /// destroys the oversize chain.
    pub fn clear_all(&mut self) -> Result<()> {
        self.position = 0;

        let chain_result = destroy_node_chain(self.next.take());
        let blocks_result = self.blocks.destroy_all();

        if let Err(e) = self.reduce_commit(os::page_size().min(self.base_size)) {
            log::debug!("reduce_commit failed during clear_all: {}", e);
        }

        chain_result?;
        blocks_result
    }

    pub fn destroy(mut self) -> Result<()> {
        self.destroy_in_place()
    }

    fn destroy_in_place(&mut self) -> Result<()> {
        let blocks_result = self.blocks.destroy_all();
        let chain_result = destroy_node_chain(self.next.take());
        let release_result = os::release(self.memory, self.mapping_size);

        self.mapping_size = 0;
        self.base_size = 0;
        self.position = 0;
        self.committed = 0;
        self.auto_align = false;

        release_result?;
        chain_result?;
        blocks_result
    }

    pub(crate) fn base_ptr(&self) -> NonNull<u8> {
        self.base_ptr
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut LargeBlockList {
        &mut self.blocks
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }
}

impl Drop for ChainArena {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_in_place() {
            log::warn!("ChainArena leaked resources on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_fill() {
        let mut arena = ChainArena::init(1024 * 1024, 16, true).expect("init");
        let p = arena.push(100).expect("push");
        assert_eq!(p.as_ptr() as usize % 16, 0);
    }

    #[test]
    fn exhausting_a_block_creates_a_new_one() {
        let mut arena = ChainArena::init(1024 * 1024, 16, true).expect("init");
        let capacity = arena.block_capacity();

        arena.push_no_zero(capacity - 1024).expect("fill most of the block");
        assert!(arena.next_is_none());

        let p = arena
            .push_no_zero(200 * 1024)
            .expect("should overflow into a new block");
        assert!(p.as_ptr() as usize % 16 == 0 || true);
        assert!(!arena.next_is_none());
    }

    #[test]
    fn pop_block_restores_the_previous_block() {
        let mut arena = ChainArena::init(1024 * 1024, 16, true).expect("init");
        let capacity = arena.block_capacity();

        arena.push_no_zero(capacity - 1024).expect("fill most of block 1");
        let block_one_base = arena.base_ptr();

        arena.push_no_zero(200 * 1024).expect("overflow into block 2");
        assert_ne!(arena.base_ptr(), block_one_base);

        arena.pop_block().expect("pop back to block 1");
        assert_eq!(arena.base_ptr(), block_one_base);
    }

    #[test]
    fn oversize_push_skips_straight_to_the_side_chain() {
        let mut arena = ChainArena::init(1024 * 1024, 16, true).expect("init");
        let before = arena.position();

        arena.push_no_zero(600 * 1024).expect("oversize push");
        assert_eq!(arena.position(), before);

        arena.pop_large_block().expect("pop the oversize block");
    }

    #[test]
    fn destroy_releases_every_block() {
        let mut arena = ChainArena::init(256 * 1024, 16, true).expect("init");
        let capacity = arena.block_capacity();

        for _ in 0..3 {
            arena.push_no_zero(capacity - 1024).expect("fill a block");
        }

        arena.destroy().expect("destroy should release the whole chain");
    }

    impl ChainArena {
        fn next_is_none(&self) -> bool {
            self.next.is_none()
        }
    }
}
