//! Interrupt-mask critical sections
//!
//! The kernel's shortest lock: every piece of state reachable from ISRs
//! is mutated only while interrupts are masked. The guard saves the
//! prior mask state, so sections nest without re-enabling early.

use core::sync::atomic::{AtomicU32, Ordering};

/// Nesting depth, also used as the host-side interrupt mask emulation.
static DEPTH: AtomicU32 = AtomicU32::new(0);

/// RAII interrupt-mask guard
///
/// Creating the guard disables interrupts and records whether they were
/// enabled before; dropping it restores exactly that state.
pub struct CriticalSection {
    was_active: bool,
}

impl CriticalSection {
    /// Enter a critical section.
    #[inline(always)]
    pub fn enter() -> Self {
        #[cfg(target_arch = "arm")]
        let was_active = {
            let active = cortex_m::register::primask::read().is_active();
            cortex_m::interrupt::disable();
            active
        };

        #[cfg(not(target_arch = "arm"))]
        let was_active = DEPTH.load(Ordering::Acquire) == 0;

        DEPTH.fetch_add(1, Ordering::AcqRel);
        CriticalSection { was_active }
    }

    /// Check whether the caller is inside a critical section.
    #[inline(always)]
    pub fn is_active() -> bool {
        DEPTH.load(Ordering::Acquire) > 0
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::AcqRel);

        #[cfg(target_arch = "arm")]
        if self.was_active {
            unsafe { cortex_m::interrupt::enable() };
        }

        #[cfg(not(target_arch = "arm"))]
        let _ = self.was_active;
    }
}

/// Execute a closure with interrupts disabled.
///
/// The closure receives a reference to the guard, which gates access to
/// [`CsCell`](super::cs_cell::CsCell)-protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// RAII inverse of [`CriticalSection`]
///
/// Temporarily re-enables interrupts inside a critical section, for long
/// operations that must not keep ISRs locked out. The surrounding
/// critical section's data may be mutated by ISRs while this guard
/// lives; on drop the mask is re-asserted.
pub struct UncriticalSection {
    _private: (),
}

impl UncriticalSection {
    /// Re-enable interrupts; requires an enclosing critical section.
    #[inline(always)]
    pub fn enter(_cs: &CriticalSection) -> Self {
        debug_assert!(CriticalSection::is_active());

        #[cfg(target_arch = "arm")]
        unsafe {
            cortex_m::interrupt::enable()
        };

        UncriticalSection { _private: () }
    }
}

impl Drop for UncriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        #[cfg(target_arch = "arm")]
        cortex_m::interrupt::disable();
    }
}

/// Execute a closure with interrupts briefly re-enabled inside a
/// critical section.
#[inline]
pub fn uncritical_section<F, R>(cs: &CriticalSection, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _uc = UncriticalSection::enter(cs);
    f()
}

/// Check if currently executing in an ISR (handler mode).
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(target_arch = "arm")]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0
    }

    #[cfg(not(target_arch = "arm"))]
    {
        crate::rtos::kernel::int_nesting() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_nest() {
        let outer = CriticalSection::enter();
        assert!(CriticalSection::is_active());
        {
            let _inner = CriticalSection::enter();
            assert!(CriticalSection::is_active());
        }
        // Inner exit must not end the outer section.
        assert!(CriticalSection::is_active());
        drop(outer);
    }

    #[test]
    fn uncritical_requires_critical() {
        let r = critical_section(|cs| uncritical_section(cs, || 7));
        assert_eq!(r, 7);
    }
}
