//! Compile-time configuration
//!
//! These constants control resource limits and timing of the kernel.

/// System tick rate in Hz.
pub const CFG_SYSTICK_FREQUENCY_HZ: u32 = 1000;

/// Core clock in Hz, used to derive the SysTick reload value.
pub const CFG_CORE_CLOCK_HZ: u32 = 16_000_000;

/// Priority pre-scaler; the scheduler handles `16 << CFG_PRIO_SHIFT` levels.
pub const CFG_PRIO_SHIFT: u32 = 0;

/// Minimum thread stack size in bytes.
pub const CFG_STACK_SIZE_MIN: usize = 256;

/// Default stack size in bytes, used when a thread is created without a
/// user-supplied stack region.
pub const CFG_STACK_SIZE_DEFAULT: usize = 1024;

/// Stack size of the kernel-created main thread, in bytes.
pub const CFG_MAIN_STACK_SIZE: usize = 2048;

/// Stack size of the idle thread, in bytes.
pub const CFG_IDLE_STACK_SIZE: usize = 512;

/// Stack size of the timer dispatch thread, in bytes.
pub const CFG_TIMER_STACK_SIZE: usize = 1024;

/// Size of the kernel arena backing default stacks and internally
/// acquired queue/pool storage, in bytes.
pub const CFG_ARENA_SIZE: usize = 16 * 1024;

/// Maximum recursion depth of a recursive mutex.
pub const CFG_MUTEX_RECURSION_MAX: u16 = u16::MAX;

/// Pattern pre-filled into thread stacks so the untouched high-water
/// prefix can be measured.
pub const CFG_STACK_SENTINEL: u32 = 0xA5A5_A5A5;

/// Per-thread user storage.
///
/// Applications that need to attach data to every thread replace this
/// with their own struct; the kernel never inspects it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserStorage;

impl UserStorage {
    pub const fn new() -> Self {
        UserStorage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values() {
        assert!(CFG_SYSTICK_FREQUENCY_HZ >= 10, "tick rate too slow");
        assert!(CFG_SYSTICK_FREQUENCY_HZ <= 10_000, "tick rate too fast");
        assert!(CFG_STACK_SIZE_MIN >= 128, "stack floor too small");
        assert!(CFG_STACK_SIZE_DEFAULT >= CFG_STACK_SIZE_MIN);
        assert!(CFG_MAIN_STACK_SIZE >= CFG_STACK_SIZE_MIN);
        assert!(CFG_ARENA_SIZE >= 2 * CFG_STACK_SIZE_DEFAULT);
    }
}
