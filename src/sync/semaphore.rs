//! Counting and binary semaphores
//!
//! Resource counter with direct handoff: a post with parked waiters
//! wakes exactly one and leaves the count untouched, so the count can
//! only be positive while the wait list is empty. `post` may be invoked
//! from ISRs, which makes the semaphore the primitive of choice for
//! signalling events out of interrupt handlers.

use core::ptr::NonNull;

use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::sched;
use crate::rtos::types::{Ticks, WaitKind};
use crate::rtos::waitlist::{self, WaitList};

/// Semaphore creation attributes
#[derive(Clone, Copy)]
pub struct Attributes {
    pub initial: i32,
    pub max: i32,
}

impl Attributes {
    /// Counting semaphore attributes.
    pub const fn counting(initial: i32, max: i32) -> Self {
        Attributes { initial, max }
    }

    /// Binary semaphore attributes: the count is clamped to 0 or 1.
    pub const fn binary(initial: i32) -> Self {
        Attributes {
            initial: if initial > 0 { 1 } else { 0 },
            max: 1,
        }
    }
}

struct SemState {
    count: i32,
    initial: i32,
    max: i32,
    waiters: WaitList,
}

/// Counting semaphore
pub struct Semaphore {
    name: &'static str,
    state: CsCell<SemState>,
}

impl Semaphore {
    /// Create a counting semaphore with the largest representable
    /// maximum.
    pub const fn new(name: &'static str, initial: i32) -> Self {
        Self::with_attributes(name, &Attributes::counting(initial, i32::MAX))
    }

    /// Create a semaphore with explicit attributes.
    pub const fn with_attributes(name: &'static str, attr: &Attributes) -> Self {
        Semaphore {
            name,
            state: CsCell::new(SemState {
                count: attr.initial,
                initial: attr.initial,
                max: attr.max,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Create a binary semaphore.
    pub const fn binary(name: &'static str, initial: i32) -> Self {
        Self::with_attributes(name, &Attributes::binary(initial))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current count.
    pub fn value(&self) -> i32 {
        critical_section(|cs| self.state.get(cs).count)
    }

    /// Release the semaphore. May be invoked from ISRs.
    ///
    /// With parked waiters the highest-priority one is handed the token
    /// directly; otherwise the count increments, failing with
    /// `Overflow` past the maximum.
    pub fn post(&self) -> Result<()> {
        critical_section(|cs| {
            let st = self.state.get(cs);

            if let Some(w) = st.waiters.head() {
                unsafe { waitlist::unpark(w, Ok(())) };
                Ok(())
            } else if st.count >= st.max {
                Err(Error::Overflow)
            } else {
                st.count += 1;
                Ok(())
            }
        })?;

        sched::reschedule();
        Ok(())
    }

    /// Acquire, blocking while the count is zero.
    pub fn wait(&self) -> Result<()> {
        self.wait_common(None, true)
    }

    /// Acquire without blocking; `Err(Again)` when unavailable.
    pub fn try_wait(&self) -> Result<()> {
        self.wait_common(None, false)
    }

    /// Acquire, giving up after `ticks`.
    pub fn timed_wait(&self, ticks: Ticks) -> Result<()> {
        self.wait_common(Some(ticks), true)
    }

    fn wait_common(&self, timeout: Option<Ticks>, block: bool) -> Result<()> {
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

            if st.count > 0 {
                st.count -= 1;
                return Some(Ok(()));
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
                    WaitKind::Semaphore,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            None
        });

        match step {
            Some(r) => r,
            // A waking post handed us the token directly.
            None => waitlist::finish_wait(),
        }
    }

    /// Return the count to its initial value.
    ///
    /// Every parked waiter fails with `NotRecoverable`; the semaphore
    /// itself is usable again immediately.
    pub fn reset(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);
            st.count = st.initial;
            unsafe { waitlist::unpark_all(&mut st.waiters, Err(Error::NotRecoverable)) };
        });

        sched::reschedule();
        Ok(())
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_without_contention() {
        let sem = Semaphore::new("t", 2);
        assert_eq!(sem.value(), 2);
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Err(Error::Again));
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn post_past_max_overflows() {
        let sem = Semaphore::with_attributes("t", &Attributes::counting(0, 1));
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.post(), Err(Error::Overflow));
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn binary_clamps_initial() {
        let sem = Semaphore::binary("t", 7);
        assert_eq!(sem.value(), 1);
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Err(Error::Again));
    }

    #[test]
    fn reset_restores_initial() {
        let sem = Semaphore::new("t", 3);
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.reset(), Ok(()));
        assert_eq!(sem.value(), 3);
    }
}
