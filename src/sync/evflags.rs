//! Event flags
//!
//! A shared bitmask any thread may wait on. Raising flags wakes, in
//! priority order, every waiter whose all/any predicate now holds; a
//! waiter's clear mode consumes its matched bits atomically at wake, so
//! later waiters see the already-reduced mask.

use core::ptr::NonNull;

use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::sched;
use crate::rtos::types::{
    flags_consumed, flags_satisfied, mode, FlagsMask, FlagsMode, Ticks, WaitKind,
};
use crate::rtos::waitlist::{self, WaitList};

struct EvFlagsState {
    flags: FlagsMask,
    waiters: WaitList,
}

/// Broadcast event flags
pub struct EventFlags {
    name: &'static str,
    state: CsCell<EvFlagsState>,
}

impl EventFlags {
    pub const fn new(name: &'static str) -> Self {
        EventFlags {
            name,
            state: CsCell::new(EvFlagsState {
                flags: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Raise flags and wake every waiter whose predicate now holds.
    /// May be invoked from ISRs. Returns the resulting mask.
    pub fn raise(&self, mask: FlagsMask) -> Result<FlagsMask> {
        if mask == 0 {
            return Err(Error::Invalid);
        }

        let after = critical_section(|cs| {
            let st = self.state.get(cs);
            st.flags |= mask;

            // Walk in wake order; each satisfied waiter may consume
            // bits, changing what the rest observe.
            let mut cur = st.waiters.head();
            while let Some(w) = cur {
                let next = unsafe { w.as_ref().wait_next };
                let t = unsafe { &mut *w.as_ptr() };

                if flags_satisfied(t.flags_wait_mask, t.flags_wait_mode, st.flags) {
                    t.flags_ready = st.flags;
                    if t.flags_wait_mode & mode::CLEAR != 0 {
                        st.flags &= !flags_consumed(t.flags_wait_mask, st.flags);
                    }
                    unsafe { waitlist::unpark(w, Ok(())) };
                }

                cur = next;
            }

            st.flags
        });

        sched::reschedule();
        Ok(after)
    }

    /// Clear flags, returning the previous mask.
    pub fn clear(&self, mask: FlagsMask) -> Result<FlagsMask> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if mask == 0 {
            return Err(Error::Invalid);
        }

        Ok(critical_section(|cs| {
            let st = self.state.get(cs);
            let prev = st.flags;
            st.flags &= !mask;
            prev
        }))
    }

    /// Peek at the flags; `mode::CLEAR` consumes the selected bits.
    /// A zero mask selects all flags.
    pub fn get(&self, mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        Ok(critical_section(|cs| {
            let st = self.state.get(cs);
            let selected = if mask == 0 { st.flags } else { st.flags & mask };
            if flg_mode & mode::CLEAR != 0 {
                st.flags &= !selected;
            }
            selected
        }))
    }

    /// Whether any thread is parked on these flags.
    pub fn waiting(&self) -> bool {
        critical_section(|cs| !self.state.get(cs).waiters.is_empty())
    }

    /// Wait until the expected flags are raised.
    pub fn wait(&self, mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
        self.wait_common(mask, flg_mode, None, true)
    }

    /// Check the predicate without blocking; `Err(Again)` on failure.
    pub fn try_wait(&self, mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
        self.wait_common(mask, flg_mode, None, false)
    }

    /// Wait for the expected flags with a deadline.
    pub fn timed_wait(
        &self,
        mask: FlagsMask,
        flg_mode: FlagsMode,
        ticks: Ticks,
    ) -> Result<FlagsMask> {
        self.wait_common(mask, flg_mode, Some(ticks), true)
    }

    fn wait_common(
        &self,
        mask: FlagsMask,
        flg_mode: FlagsMode,
        timeout: Option<Ticks>,
        block: bool,
    ) -> Result<FlagsMask> {
        if block {
            waitlist::blocking_allowed()?;
        } else if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|cs| {
            let st = self.state.get(cs);

            if flags_satisfied(mask, flg_mode, st.flags) {
                let observed = st.flags;
                if flg_mode & mode::CLEAR != 0 {
                    st.flags &= !flags_consumed(mask, st.flags);
                }
                return Some(Ok(observed));
            }

            if !block {
                return Some(Err(Error::Again));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            let cur = match crate::rtos::kernel::current_thread() {
                Some(c) => c,
                None => return Some(Err(Error::NotPermitted)),
            };
            unsafe {
                let t = &mut *cur.as_ptr();
                t.flags_wait_mask = mask;
                t.flags_wait_mode = flg_mode;

                waitlist::park_current(
                    Some(&mut st.waiters),
                    WaitKind::EventFlags,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            None
        });

        match step {
            Some(r) => r,
            None => match waitlist::finish_wait() {
                Ok(()) => Ok(critical_section(|_cs| {
                    match crate::rtos::kernel::current_thread() {
                        Some(cur) => unsafe { cur.as_ref().flags_ready },
                        None => 0,
                    }
                })),
                Err(e) => Err(e),
            },
        }
    }
}

unsafe impl Send for EventFlags {}
unsafe impl Sync for EventFlags {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_clear_get() {
        let ev = EventFlags::new("t");
        assert_eq!(ev.raise(0), Err(Error::Invalid));
        assert_eq!(ev.raise(0b0011), Ok(0b0011));
        assert_eq!(ev.raise(0b0100), Ok(0b0111));

        assert_eq!(ev.get(0b0010, 0), Ok(0b0010));
        assert_eq!(ev.get(0, 0), Ok(0b0111));

        assert_eq!(ev.clear(0b0001), Ok(0b0111));
        assert_eq!(ev.get(0, 0), Ok(0b0110));

        // CLEAR consumes what it returns.
        assert_eq!(ev.get(0b0010, mode::CLEAR), Ok(0b0010));
        assert_eq!(ev.get(0, 0), Ok(0b0100));
    }

    #[test]
    fn try_wait_predicates() {
        let ev = EventFlags::new("t");
        let _ = ev.raise(0b0101);

        assert_eq!(ev.try_wait(0b0001, mode::ALL), Ok(0b0101));
        assert_eq!(ev.try_wait(0b0011, mode::ALL), Err(Error::Again));
        assert_eq!(ev.try_wait(0b0011, mode::ANY), Ok(0b0101));

        // Consuming variant takes only the requested bits.
        assert_eq!(ev.try_wait(0b0100, mode::ANY | mode::CLEAR), Ok(0b0101));
        assert_eq!(ev.get(0, 0), Ok(0b0001));

        assert!(!ev.waiting());
    }
}
