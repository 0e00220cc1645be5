//! Condition variable
//!
//! A waitset paired with a mutex the caller holds: `wait` releases the
//! mutex and parks in one critical section, so a signal between the
//! release and the park cannot be lost, and re-acquires the mutex
//! before returning. Waiters never wake spuriously.

use core::ptr::NonNull;

use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::sched;
use crate::rtos::types::{Ticks, WaitKind};
use crate::rtos::waitlist::{self, WaitList};
use crate::sync::mutex::Mutex;

struct CondvarState {
    waiters: WaitList,
}

/// Condition variable
pub struct ConditionVariable {
    name: &'static str,
    state: CsCell<CondvarState>,
}

impl ConditionVariable {
    pub const fn new(name: &'static str) -> Self {
        ConditionVariable {
            name,
            state: CsCell::new(CondvarState {
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wake the highest-priority earliest waiter; a no-op with none.
    pub fn signal(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);
            if let Some(w) = st.waiters.head() {
                unsafe { waitlist::unpark(w, Ok(())) };
            }
        });

        sched::reschedule();
        Ok(())
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);
            unsafe { waitlist::unpark_all(&mut st.waiters, Ok(())) };
        });

        sched::reschedule();
        Ok(())
    }

    /// Release `mutex`, park until signalled, re-acquire `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_common(mutex, None)
    }

    /// [`wait`](Self::wait) with a deadline; the mutex is re-acquired
    /// even when the wait times out.
    pub fn timed_wait(&self, mutex: &Mutex, ticks: Ticks) -> Result<()> {
        self.wait_common(mutex, Some(ticks))
    }

    fn wait_common(&self, mutex: &Mutex, timeout: Option<Ticks>) -> Result<()> {
        waitlist::blocking_allowed()?;

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        // An expired deadline times out before the mutex is released.
        if waitlist::deadline_elapsed(deadline) {
            return Err(Error::TimedOut);
        }

        // Atomically: unlock the mutex and park on the waitset.
        critical_section(|cs| {
            mutex.unlock()?;

            let st = self.state.get(cs);
            unsafe {
                waitlist::park_current(
                    Some(&mut st.waiters),
                    WaitKind::Condvar,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            Ok(())
        })?;

        let reason = waitlist::finish_wait();

        // Whatever ended the wait, the caller expects to hold the mutex.
        mutex.lock().and(reason)
    }
}

unsafe impl Send for ConditionVariable {}
unsafe impl Sync for ConditionVariable {}
