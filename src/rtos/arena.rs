//! Kernel storage arena
//!
//! A first-fit free-list allocator over a fixed static region. It backs
//! thread stacks that were not supplied by the caller and the storage of
//! message queues and memory pools created without one. Free blocks are
//! chained through the region itself; allocation never touches the heap
//! (there is none).

use core::ptr::NonNull;

use crate::rtos::config::CFG_ARENA_SIZE;
use crate::rtos::critical::CriticalSection;
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};

/// Granularity and alignment of every arena block.
const ALIGN: usize = 8;

#[repr(C)]
struct FreeBlock {
    size: usize,
    next: Option<NonNull<FreeBlock>>,
}

struct ArenaState {
    head: Option<NonNull<FreeBlock>>,
    initialized: bool,
}

unsafe impl Send for ArenaState {}

static ARENA: CsCell<ArenaState> = CsCell::new(ArenaState {
    head: None,
    initialized: false,
});

static mut ARENA_MEM: [u64; CFG_ARENA_SIZE / 8] = [0; CFG_ARENA_SIZE / 8];

#[inline]
fn round_up(bytes: usize) -> usize {
    let bytes = bytes.max(core::mem::size_of::<FreeBlock>());
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

fn ensure_init(state: &mut ArenaState) {
    if state.initialized {
        return;
    }
    let base = (&raw mut ARENA_MEM) as *mut FreeBlock;
    unsafe {
        (*base).size = CFG_ARENA_SIZE;
        (*base).next = None;
    }
    state.head = NonNull::new(base);
    state.initialized = true;
}

/// Allocate `bytes` from the arena, 8-byte aligned.
pub(crate) fn alloc(cs: &CriticalSection, bytes: usize) -> Result<NonNull<u8>> {
    if bytes == 0 {
        return Err(Error::Invalid);
    }
    let bytes = round_up(bytes);

    let state = ARENA.get(cs);
    ensure_init(state);

    let mut prev: Option<NonNull<FreeBlock>> = None;
    let mut cur = state.head;
    while let Some(block) = cur {
        let block_ref = unsafe { block.as_ref() };
        if block_ref.size >= bytes {
            let remainder = block_ref.size - bytes;
            let replacement = if remainder >= core::mem::size_of::<FreeBlock>() {
                // Split: the tail of this block stays free.
                let tail = unsafe {
                    let tail = block.as_ptr().cast::<u8>().add(bytes).cast::<FreeBlock>();
                    (*tail).size = remainder;
                    (*tail).next = block_ref.next;
                    NonNull::new_unchecked(tail)
                };
                Some(tail)
            } else {
                block_ref.next
            };

            match prev {
                Some(mut p) => unsafe { p.as_mut().next = replacement },
                None => state.head = replacement,
            }
            return Ok(block.cast());
        }
        prev = cur;
        cur = block_ref.next;
    }

    Err(Error::NoMemory)
}

/// Return a block previously obtained from [`alloc`].
///
/// The list is kept address-sorted and adjacent blocks are coalesced.
pub(crate) fn free(cs: &CriticalSection, ptr: NonNull<u8>, bytes: usize) {
    let bytes = round_up(bytes);
    let state = ARENA.get(cs);
    ensure_init(state);

    let block = ptr.cast::<FreeBlock>();

    let mut prev: Option<NonNull<FreeBlock>> = None;
    let mut cur = state.head;
    while let Some(c) = cur {
        if c.as_ptr() > block.as_ptr() {
            break;
        }
        prev = cur;
        cur = unsafe { c.as_ref().next };
    }

    unsafe {
        let mut b = block;
        b.as_mut().size = bytes;
        b.as_mut().next = cur;

        // Merge with the following block when contiguous.
        if let Some(n) = cur {
            if b.as_ptr().cast::<u8>().add(bytes) == n.as_ptr().cast::<u8>() {
                b.as_mut().size = bytes + n.as_ref().size;
                b.as_mut().next = n.as_ref().next;
            }
        }

        match prev {
            Some(mut p) => {
                // Merge with the preceding block when contiguous.
                let p_end = p.as_ptr().cast::<u8>().add(p.as_ref().size);
                if p_end == b.as_ptr().cast::<u8>() {
                    p.as_mut().size += b.as_ref().size;
                    p.as_mut().next = b.as_ref().next;
                } else {
                    p.as_mut().next = Some(b);
                }
            }
            None => state.head = Some(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtos::critical::critical_section;

    // One test body: the arena is a process-wide static and the harness
    // runs separate tests concurrently.
    #[test]
    fn alloc_free_cycle() {
        critical_section(|cs| {
            let a = alloc(cs, 128).unwrap();
            let b = alloc(cs, 256).unwrap();
            assert_ne!(a, b);
            assert_eq!(a.as_ptr() as usize % ALIGN, 0);
            free(cs, a, 128);
            free(cs, b, 256);
            // After coalescing, a large block is available again.
            let c = alloc(cs, CFG_ARENA_SIZE / 2).unwrap();
            free(cs, c, CFG_ARENA_SIZE / 2);

            assert_eq!(alloc(cs, CFG_ARENA_SIZE * 2), Err(Error::NoMemory));
            assert_eq!(alloc(cs, 0), Err(Error::Invalid));
        });
    }
}
