//! Preemptive RTOS kernel for single-core Cortex-M microcontrollers
//!
//! A real-time operating system core providing:
//! - Fixed-priority preemptive scheduling, FIFO within a priority level
//! - POSIX-flavoured synchronization primitives (mutex with priority
//!   inheritance / ceiling / robustness, condition variable, semaphore,
//!   event flags, per-thread signal flags)
//! - Priority message queues and fixed-block memory pools
//! - A 64-bit tick clock with ordered timeouts and user timers whose
//!   callbacks run in thread context

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod rtos;
pub mod sync;
pub mod port;

// ============ Re-exports ============

pub use rtos::config;
pub use rtos::critical;
pub use rtos::error;
pub use rtos::error::{Error, Result};
pub use rtos::types;
pub use rtos::types::*;
pub use rtos::scheduler;
pub use rtos::thread;
pub use rtos::thread::{this_thread, Thread};
pub use rtos::clock;
pub use rtos::clock::{rtclock, sysclock};
pub use rtos::timer;
pub use rtos::timer::Timer;

pub use sync::condvar::ConditionVariable;
pub use sync::evflags::EventFlags;
pub use sync::mempool::MemoryPool;
pub use sync::mqueue::MessageQueue;
pub use sync::mutex::Mutex;
pub use sync::semaphore::Semaphore;

#[cfg(all(feature = "pac", target_arch = "arm"))]
pub use stm32_metapac as pac;
