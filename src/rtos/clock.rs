//! Clocks, the sleep list and the tick handler
//!
//! The SysTick-driven system clock is the kernel's only time source: a
//! monotone 64-bit tick counter advanced exclusively by the tick
//! handler. Timed waits of every primitive are entries in one sleep
//! list, ordered by wakeup tick; the tick handler retires the expired
//! prefix, fires due user timers and requests a scheduler pass. The
//! real-time clock is a non-steady seconds counter derived from the same
//! ticks plus an adjustable offset.

use core::ptr::NonNull;

use crate::rtos::critical::{critical_section, CriticalSection};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::thread::Thread;
use crate::rtos::types::{Ticks, WaitKind};
use crate::rtos::waitlist;

struct ClockState {
    ticks: u64,
    sleep_head: Option<NonNull<Thread>>,
    sleep_tail: Option<NonNull<Thread>>,
    /// Real-time clock offset: seconds since the epoch at tick zero.
    rt_offset: u64,
}

unsafe impl Send for ClockState {}

static CLOCK: CsCell<ClockState> = CsCell::new(ClockState {
    ticks: 0,
    sleep_head: None,
    sleep_tail: None,
    rt_offset: 0,
});

pub(crate) fn reset() {
    critical_section(|cs| {
        let clk = CLOCK.get(cs);
        clk.ticks = 0;
        clk.sleep_head = None;
        clk.sleep_tail = None;
    });
}

// ============ Sleep list ============

/// Enter the sleep list at the given wakeup instant.
///
/// The list is kept ordered by wakeup tick, FIFO among equal ticks.
///
/// # Safety
/// Caller holds a critical section; the thread is not on the sleep list.
pub(crate) unsafe fn sleep_insert(thread: NonNull<Thread>, wakeup: u64) {
    let clk = unsafe { CLOCK.get_unchecked() };
    let t = unsafe { &mut *thread.as_ptr() };

    t.wakeup_tick = wakeup;

    let mut prev: Option<NonNull<Thread>> = None;
    let mut cur = clk.sleep_head;
    while let Some(c) = cur {
        let c_ref = unsafe { c.as_ref() };
        if c_ref.wakeup_tick > wakeup {
            break;
        }
        prev = cur;
        cur = c_ref.sleep_next;
    }

    t.sleep_prev = prev;
    t.sleep_next = cur;

    match prev {
        Some(p) => unsafe { (*p.as_ptr()).sleep_next = Some(thread) },
        None => clk.sleep_head = Some(thread),
    }

    match cur {
        Some(c) => unsafe { (*c.as_ptr()).sleep_prev = Some(thread) },
        None => clk.sleep_tail = Some(thread),
    }

    t.in_sleep_list = true;
}

/// Leave the sleep list (event arrived before the timeout).
///
/// # Safety
/// Caller holds a critical section; the thread is on the sleep list.
pub(crate) unsafe fn sleep_remove(thread: NonNull<Thread>) {
    let clk = unsafe { CLOCK.get_unchecked() };
    let t = unsafe { &mut *thread.as_ptr() };

    match t.sleep_prev {
        Some(prev) => unsafe { (*prev.as_ptr()).sleep_next = t.sleep_next },
        None => clk.sleep_head = t.sleep_next,
    }

    match t.sleep_next {
        Some(next) => unsafe { (*next.as_ptr()).sleep_prev = t.sleep_prev },
        None => clk.sleep_tail = t.sleep_prev,
    }

    t.sleep_prev = None;
    t.sleep_next = None;
    t.in_sleep_list = false;
}

// ============ Tick handler ============

/// Advance time by one tick and retire the expired sleep-list prefix.
fn advance_locked(cs: &CriticalSection) -> u64 {
    let now = {
        let clk = CLOCK.get(cs);
        clk.ticks += 1;
        clk.ticks
    };

    loop {
        let expired = {
            let clk = CLOCK.get(cs);
            match clk.sleep_head {
                Some(t) if unsafe { t.as_ref().wakeup_tick } <= now => Some(t),
                _ => None,
            }
        };
        match expired {
            Some(t) => unsafe { waitlist::unpark(t, Err(Error::TimedOut)) },
            None => break,
        }
    }

    now
}

/// The kernel tick handler; the port layer calls this from the SysTick
/// interrupt.
pub fn tick_handler() {
    if !kernel::is_started() {
        return;
    }

    kernel::interrupts_enter();

    critical_section(|cs| {
        let now = advance_locked(cs);
        crate::rtos::timer::on_tick(now);
    });

    kernel::interrupts_exit();
}

/// SysTick interrupt entry.
#[cfg(target_arch = "arm")]
#[no_mangle]
pub extern "C" fn SysTick() {
    tick_handler();
}

// ============ System clock ============

/// The steady SysTick-derived clock.
pub mod sysclock {
    use super::*;
    use crate::rtos::config::CFG_SYSTICK_FREQUENCY_HZ;

    /// Tick frequency in Hz.
    pub const FREQUENCY_HZ: u32 = CFG_SYSTICK_FREQUENCY_HZ;

    /// Ticks since startup.
    pub fn now() -> u64 {
        critical_section(|cs| CLOCK.get(cs).ticks)
    }

    /// Convert microseconds to ticks, rounding up so a converted sleep
    /// never returns early.
    pub const fn ticks_cast(microsec: u64) -> u32 {
        let num = microsec * FREQUENCY_HZ as u64 + 1_000_000 - 1;
        (num / 1_000_000) as u32
    }

    /// Sleep for a number of ticks.
    ///
    /// Runs the entire duration and reports it as `Err(TimedOut)`; an
    /// event arriving earlier cuts the sleep short with
    /// `Err(Interrupted)`.
    pub fn sleep_for(ticks: Ticks) -> Result<()> {
        let deadline = now().wrapping_add(ticks as u64);
        sleep_until(deadline)
    }

    /// Sleep until an absolute tick instant.
    pub fn sleep_until(instant: u64) -> Result<()> {
        waitlist::blocking_allowed()?;

        let parked = critical_section(|_cs| {
            if instant <= unsafe { CLOCK.get_unchecked() }.ticks {
                return false;
            }
            unsafe {
                waitlist::park_current(None, WaitKind::Sleep, core::ptr::null(), Some(instant));
            }
            true
        });

        if !parked {
            return Err(Error::TimedOut);
        }

        match waitlist::finish_wait() {
            // Woken by an event before the deadline.
            Ok(()) => Err(Error::Interrupted),
            Err(e) => Err(e),
        }
    }

    /// Wait for an event, giving up after a number of ticks.
    ///
    /// Returns `Ok` when some event wakes the thread before the
    /// deadline, `Err(TimedOut)` otherwise.
    pub fn wait_for(ticks: Ticks) -> Result<()> {
        waitlist::blocking_allowed()?;

        let deadline = now().wrapping_add(ticks as u64);
        let parked = critical_section(|_cs| {
            if waitlist::deadline_elapsed(Some(deadline)) {
                return false;
            }
            unsafe {
                waitlist::park_current(None, WaitKind::Sleep, core::ptr::null(), Some(deadline));
            }
            true
        });

        if !parked {
            return Err(Error::TimedOut);
        }

        waitlist::finish_wait()
    }
}

// ============ Real-time clock ============

/// Seconds-resolution wall clock; adjustable, hence not steady.
pub mod rtclock {
    use super::*;
    use crate::rtos::config::CFG_SYSTICK_FREQUENCY_HZ;

    /// Prepare the real-time clock.
    ///
    /// Without battery-backed hardware the clock starts at the epoch;
    /// call [`adjust`] with the real time once it is known.
    pub fn initialize() -> Result<()> {
        Ok(())
    }

    /// Seconds since the epoch.
    pub fn now() -> u64 {
        critical_section(|cs| {
            let clk = CLOCK.get(cs);
            clk.rt_offset + clk.ticks / CFG_SYSTICK_FREQUENCY_HZ as u64
        })
    }

    /// Step the clock so that `now()` returns `secs`.
    pub fn adjust(secs: u64) {
        critical_section(|cs| {
            let clk = CLOCK.get(cs);
            let elapsed = clk.ticks / CFG_SYSTICK_FREQUENCY_HZ as u64;
            clk.rt_offset = secs.saturating_sub(elapsed);
        });
    }

    /// Sleep for a number of seconds.
    pub fn sleep_for(secs: u32) -> Result<()> {
        sysclock::sleep_for(secs.saturating_mul(CFG_SYSTICK_FREQUENCY_HZ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtos::types::ThreadState;

    #[test]
    fn ticks_cast_never_undershoots() {
        // converted ticks x period >= microseconds
        let period_us = 1_000_000 / sysclock::FREQUENCY_HZ as u64;
        for us in [0u64, 1, 999, 1000, 1001, 1500, 3500, 10_000, 1_000_000] {
            let ticks = sysclock::ticks_cast(us) as u64;
            assert!(
                ticks * period_us >= us,
                "ticks_cast({}) = {} undershoots",
                us,
                ticks
            );
        }
        assert_eq!(sysclock::ticks_cast(0), 0);
        assert_eq!(sysclock::ticks_cast(1), 1);
    }

    #[test]
    fn sleep_list_is_tick_ordered() {
        static mut TA: Thread = Thread::new();
        static mut TB: Thread = Thread::new();
        static mut TC: Thread = Thread::new();

        critical_section(|cs| {
            let a = NonNull::new(&raw mut TA).unwrap();
            let b = NonNull::new(&raw mut TB).unwrap();
            let c = NonNull::new(&raw mut TC).unwrap();

            unsafe {
                (*a.as_ptr()).state = ThreadState::Waiting;
                (*b.as_ptr()).state = ThreadState::Waiting;
                (*c.as_ptr()).state = ThreadState::Waiting;

                sleep_insert(a, 30);
                sleep_insert(b, 10);
                sleep_insert(c, 20);

                let clk = CLOCK.get(cs);
                assert_eq!(clk.sleep_head, Some(b));
                assert_eq!((*b.as_ptr()).sleep_next, Some(c));
                assert_eq!((*c.as_ptr()).sleep_next, Some(a));

                sleep_remove(c);
                assert_eq!((*b.as_ptr()).sleep_next, Some(a));

                sleep_remove(b);
                sleep_remove(a);
                assert!(CLOCK.get(cs).sleep_head.is_none());

                (*a.as_ptr()).state = ThreadState::Undefined;
                (*b.as_ptr()).state = ThreadState::Undefined;
                (*c.as_ptr()).state = ThreadState::Undefined;
            }
        });
    }
}
