//! Port layer - CPU-specific primitives
//!
//! The rest of the kernel is monomorphic over exactly one port: context
//! switch, initial stack frame construction and SysTick configuration.
//! Non-ARM builds get inert stubs so the data structures can run under
//! the host test harness.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;

#[cfg(target_arch = "arm")]
pub use cortex_m4::*;

#[cfg(not(target_arch = "arm"))]
pub mod stub {
    use crate::rtos::thread::Thread;
    use crate::rtos::types::StackElement;

    /// Hand the CPU to the first thread. Never returns on real
    /// hardware; the stub falls straight through.
    ///
    /// # Safety
    /// The scheduler must be fully initialised.
    pub unsafe fn start_first_thread() {}

    /// Request a context switch from thread level.
    pub fn ctx_sw() {}

    /// Request a context switch from interrupt level.
    pub fn int_ctx_sw() {}

    /// Build the initial context for a new thread.
    ///
    /// # Safety
    /// `stk_base` must point to `stk_size` writable stack elements.
    pub unsafe fn stack_init(
        _thread: *mut Thread,
        stk_base: *mut StackElement,
        stk_size: usize,
    ) -> *mut StackElement {
        unsafe { stk_base.add(stk_size - 1) }
    }

    /// Configure the tick timer.
    pub fn systick_init(_reload: u32) {}
}

#[cfg(not(target_arch = "arm"))]
pub use stub::*;
