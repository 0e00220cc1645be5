//! Memory pool
//!
//! Fixed-block allocator. Free blocks are chained through their own
//! first word into a LIFO list, so the pool needs no bookkeeping
//! storage of its own. Exhausted allocations may block; freeing hands
//! the block straight to the highest-priority waiting allocator.

use core::ptr::NonNull;

use crate::rtos::arena;
use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::sched;
use crate::rtos::types::{Ticks, WaitKind};
use crate::rtos::waitlist::{self, WaitList};

const ALIGN: usize = 8;

struct PoolState {
    storage: *mut u8,
    storage_owned: bool,
    blocks: usize,
    block_size: usize,
    /// Free blocks remaining.
    free_count: usize,
    /// Intrusive LIFO through the blocks themselves.
    free: *mut u8,
    waiters: WaitList,
}

unsafe impl Send for PoolState {}

/// Fixed-block memory pool
pub struct MemoryPool {
    name: &'static str,
    state: CsCell<PoolState>,
}

impl MemoryPool {
    /// Effective size of one block: rounded up so a free block can hold
    /// its list link and blocks stay 8-byte aligned.
    pub const fn block_bytes(block_size: usize) -> usize {
        let min = core::mem::size_of::<*mut u8>();
        let size = if block_size < min { min } else { block_size };
        (size + ALIGN - 1) & !(ALIGN - 1)
    }

    /// Bytes of backing storage needed for `blocks` blocks.
    pub const fn storage_bytes(blocks: usize, block_size: usize) -> usize {
        blocks * Self::block_bytes(block_size)
    }

    pub const fn new(name: &'static str) -> Self {
        MemoryPool {
            name,
            state: CsCell::new(PoolState {
                storage: core::ptr::null_mut(),
                storage_owned: false,
                blocks: 0,
                block_size: 0,
                free_count: 0,
                free: core::ptr::null_mut(),
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size the pool and attach its storage.
    ///
    /// `storage` must hold [`storage_bytes`](Self::storage_bytes) and be
    /// 8-byte aligned; `None` takes a region from the kernel arena.
    pub fn create(
        &self,
        blocks: usize,
        block_size: usize,
        storage: Option<&'static mut [u8]>,
    ) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if blocks == 0 || block_size == 0 {
            return Err(Error::Invalid);
        }

        let need = Self::storage_bytes(blocks, block_size);

        critical_section(|cs| {
            let st = self.state.get(cs);
            if !st.storage.is_null() {
                return Err(Error::Invalid);
            }

            let (base, owned) = match storage {
                Some(region) => {
                    if region.len() < need || region.as_ptr() as usize % ALIGN != 0 {
                        return Err(Error::Invalid);
                    }
                    (region.as_mut_ptr(), false)
                }
                None => (arena::alloc(cs, need)?.as_ptr(), true),
            };

            st.storage = base;
            st.storage_owned = owned;
            st.blocks = blocks;
            st.block_size = Self::block_bytes(block_size);
            build_free_list(st);
            Ok(())
        })
    }

    /// Take a block, blocking while the pool is exhausted.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        self.alloc_common(None, true)
    }

    /// Take a block without blocking; `Err(Again)` when exhausted.
    pub fn try_alloc(&self) -> Result<NonNull<u8>> {
        self.alloc_common(None, false)
    }

    /// Take a block, giving up after `ticks`.
    pub fn timed_alloc(&self, ticks: Ticks) -> Result<NonNull<u8>> {
        self.alloc_common(Some(ticks), true)
    }

    fn alloc_common(&self, timeout: Option<Ticks>, block: bool) -> Result<NonNull<u8>> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if block {
            waitlist::blocking_allowed()?;
        }

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|cs| {
            let st = self.state.get(cs);

            if st.storage.is_null() {
                return Some(Err(Error::Invalid));
            }

            if let Some(b) = pop_free(st) {
                return Some(Ok(b));
            }

            if !block {
                return Some(Err(Error::Again));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            unsafe {
                waitlist::park_current(
                    Some(&mut st.waiters),
                    WaitKind::Mempool,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            None
        });

        match step {
            Some(r) => r,
            None => match waitlist::finish_wait() {
                // A freeing thread handed us its block.
                Ok(()) => critical_section(|_cs| match kernel::current_thread() {
                    Some(cur) => {
                        let ptr = unsafe { cur.as_ref().msg_ptr };
                        NonNull::new(ptr).ok_or(Error::NotRecoverable)
                    }
                    None => Err(Error::NotPermitted),
                }),
                Err(e) => Err(e),
            },
        }
    }

    /// Return a block to the pool.
    ///
    /// Pointers outside the pool region, or not on a block boundary,
    /// are rejected with `Invalid`.
    pub fn free(&self, block: NonNull<u8>) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);

            if st.storage.is_null() {
                return Err(Error::Invalid);
            }

            let base = st.storage as usize;
            let addr = block.as_ptr() as usize;
            let span = st.blocks * st.block_size;
            if addr < base || addr >= base + span || (addr - base) % st.block_size != 0 {
                return Err(Error::Invalid);
            }

            if let Some(w) = st.waiters.head() {
                let t = unsafe { &mut *w.as_ptr() };
                t.msg_ptr = block.as_ptr();
                unsafe { waitlist::unpark(w, Ok(())) };
            } else {
                push_free(st, block.as_ptr());
            }
            Ok(())
        })?;

        sched::reschedule();
        Ok(())
    }

    /// Number of blocks.
    pub fn capacity(&self) -> usize {
        critical_section(|cs| self.state.get(cs).blocks)
    }

    /// Blocks currently free.
    pub fn count(&self) -> usize {
        critical_section(|cs| self.state.get(cs).free_count)
    }

    /// Effective block size in bytes.
    pub fn block_size(&self) -> usize {
        critical_section(|cs| self.state.get(cs).block_size)
    }

    pub fn empty(&self) -> bool {
        self.count() == 0
    }

    pub fn full(&self) -> bool {
        critical_section(|cs| {
            let st = self.state.get(cs);
            st.blocks != 0 && st.free_count == st.blocks
        })
    }

    /// Rebuild the free list and fail every parked allocator with
    /// `NotRecoverable`. Outstanding blocks are forgotten.
    pub fn reset(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);
            if st.storage.is_null() {
                return Err(Error::Invalid);
            }

            build_free_list(st);
            unsafe { waitlist::unpark_all(&mut st.waiters, Err(Error::NotRecoverable)) };
            Ok(())
        })?;

        sched::reschedule();
        Ok(())
    }
}

unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

// ============ Free list ============

fn build_free_list(st: &mut PoolState) {
    st.free = core::ptr::null_mut();
    st.free_count = 0;
    for i in (0..st.blocks).rev() {
        let block = unsafe { st.storage.add(i * st.block_size) };
        push_free(st, block);
    }
}

fn push_free(st: &mut PoolState, block: *mut u8) {
    unsafe {
        block.cast::<*mut u8>().write(st.free);
    }
    st.free = block;
    st.free_count += 1;
}

fn pop_free(st: &mut PoolState) -> Option<NonNull<u8>> {
    let block = NonNull::new(st.free)?;
    st.free = unsafe { block.as_ptr().cast::<*mut u8>().read() };
    st.free_count -= 1;
    Some(block)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    // Leaked u64 storage keeps the required 8-byte alignment.
    fn leak_storage(bytes: usize) -> &'static mut [u8] {
        let v: &'static mut [u64] =
            Box::leak(std::vec![0u64; bytes.div_ceil(8)].into_boxed_slice());
        unsafe { core::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), bytes) }
    }

    #[test]
    fn alloc_free_lifo() {
        let pool = MemoryPool::new("t");
        let bytes = MemoryPool::storage_bytes(4, 16);
        pool.create(4, 16, Some(leak_storage(bytes))).unwrap();

        assert_eq!(pool.capacity(), 4);
        assert!(pool.full());

        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.count(), 2);

        // LIFO: the most recently freed block comes back first.
        pool.free(a).unwrap();
        assert_eq!(pool.try_alloc().unwrap(), a);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert!(pool.full());
    }

    #[test]
    fn exhaustion_and_bad_free() {
        let pool = MemoryPool::new("t");
        let bytes = MemoryPool::storage_bytes(2, 8);
        pool.create(2, 8, Some(leak_storage(bytes))).unwrap();

        let a = pool.try_alloc().unwrap();
        let _b = pool.try_alloc().unwrap();
        assert_eq!(pool.try_alloc(), Err(Error::Again));

        // Outside the region.
        let mut outside = 0u64;
        let bad = NonNull::new((&mut outside as *mut u64).cast::<u8>()).unwrap();
        assert_eq!(pool.free(bad), Err(Error::Invalid));

        // Misaligned interior pointer.
        let inner = NonNull::new(unsafe { a.as_ptr().add(1) }).unwrap();
        assert_eq!(pool.free(inner), Err(Error::Invalid));

        assert_eq!(pool.free(a), Ok(()));
    }

    #[test]
    fn reset_restores_all_blocks() {
        let pool = MemoryPool::new("t");
        let bytes = MemoryPool::storage_bytes(3, 32);
        pool.create(3, 32, Some(leak_storage(bytes))).unwrap();

        let _ = pool.try_alloc().unwrap();
        let _ = pool.try_alloc().unwrap();
        assert_eq!(pool.count(), 1);

        pool.reset().unwrap();
        assert_eq!(pool.count(), 3);
    }
}
