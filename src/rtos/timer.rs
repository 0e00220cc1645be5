//! User timers
//!
//! One-shot and periodic callbacks keyed on the system clock. The tick
//! handler never calls user code: expired timers move to a fired list
//! and a signal flag wakes the dedicated dispatch thread, which runs
//! the callbacks in thread context. Callbacks may therefore use every
//! blocking primitive.

use core::ptr::NonNull;

use crate::rtos::config::CFG_TIMER_STACK_SIZE;
use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::thread::{self, this_thread, Thread};
use crate::rtos::types::{mode, priority, FlagsMask, StackElement, TimerFn, TimerRun, Ticks};

/// Timer creation attributes
#[derive(Clone, Copy)]
pub struct Attributes {
    pub run: TimerRun,
}

impl Attributes {
    /// One-shot timer attributes.
    pub const fn once() -> Self {
        Attributes {
            run: TimerRun::Once,
        }
    }

    /// Periodic timer attributes.
    pub const fn periodic() -> Self {
        Attributes {
            run: TimerRun::Periodic,
        }
    }
}

struct TimerState {
    func: TimerFn,
    arg: *mut (),
    run: TimerRun,
    period: Ticks,
    expiry: u64,
    active: bool,
    in_fired: bool,
    next: Option<NonNull<Timer>>,
    prev: Option<NonNull<Timer>>,
}

/// User timer
pub struct Timer {
    name: &'static str,
    state: CsCell<TimerState>,
}

impl Timer {
    /// Create a stopped one-shot timer.
    pub const fn new(name: &'static str, func: TimerFn, arg: *mut ()) -> Self {
        Self::with_attributes(name, &Attributes::once(), func, arg)
    }

    /// Create a stopped timer with explicit attributes.
    pub const fn with_attributes(
        name: &'static str,
        attr: &Attributes,
        func: TimerFn,
        arg: *mut (),
    ) -> Self {
        Timer {
            name,
            state: CsCell::new(TimerState {
                func,
                arg,
                run: attr.run,
                period: 0,
                expiry: 0,
                active: false,
                in_fired: false,
                next: None,
                prev: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arm the timer to fire after `ticks`; a periodic timer keeps
    /// firing every `ticks` thereafter. Rearming an armed timer moves
    /// its expiry.
    pub fn start(&self, ticks: Ticks) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if ticks == 0 {
            return Err(Error::Invalid);
        }

        let this = NonNull::from(self);

        critical_section(|_cs| {
            let sched = unsafe { SCHEDULE.get_unchecked() };
            unsafe {
                unlink(sched, this);

                let st = state_of(this);
                st.period = ticks;
                st.expiry = crate::rtos::clock::sysclock::now().wrapping_add(ticks as u64);
                st.active = true;

                schedule_insert(sched, this);
            }
            Ok(())
        })
    }

    /// Disarm the timer.
    pub fn stop(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        let this = NonNull::from(self);

        critical_section(|_cs| {
            let sched = unsafe { SCHEDULE.get_unchecked() };
            let st = unsafe { state_of(this) };

            if !st.active && !st.in_fired {
                return Err(Error::Again);
            }

            unsafe { unlink(sched, this) };
            st.active = false;
            Ok(())
        })
    }
}

unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

// ============ Expiry schedule ============

struct TimerSchedule {
    /// Armed timers, ordered by expiry tick.
    head: Option<NonNull<Timer>>,
    /// Expired timers awaiting the dispatch thread.
    fired: Option<NonNull<Timer>>,
}

unsafe impl Send for TimerSchedule {}

static SCHEDULE: CsCell<TimerSchedule> = CsCell::new(TimerSchedule {
    head: None,
    fired: None,
});

pub(crate) fn reset() {
    critical_section(|cs| {
        let sched = SCHEDULE.get(cs);
        sched.head = None;
        sched.fired = None;
    });
}

/// # Safety
/// Caller holds a critical section.
unsafe fn state_of(timer: NonNull<Timer>) -> &'static mut TimerState {
    unsafe { &mut *(*timer.as_ptr()).state.as_ptr() }
}

/// Insert into the armed list, keeping expiry order.
unsafe fn schedule_insert(sched: &mut TimerSchedule, timer: NonNull<Timer>) {
    let expiry = unsafe { state_of(timer).expiry };

    let mut prev: Option<NonNull<Timer>> = None;
    let mut cur = sched.head;
    while let Some(c) = cur {
        let c_st = unsafe { state_of(c) };
        if c_st.expiry > expiry {
            break;
        }
        prev = cur;
        cur = c_st.next;
    }

    let st = unsafe { state_of(timer) };
    st.prev = prev;
    st.next = cur;

    match prev {
        Some(p) => unsafe { state_of(p).next = Some(timer) },
        None => sched.head = Some(timer),
    }
    if let Some(c) = cur {
        unsafe { state_of(c).prev = Some(timer) };
    }
}

/// Remove from whichever list the timer occupies.
unsafe fn unlink(sched: &mut TimerSchedule, timer: NonNull<Timer>) {
    let st = unsafe { state_of(timer) };

    if st.in_fired {
        // Singly-linked scan of the fired list.
        let mut prev: Option<NonNull<Timer>> = None;
        let mut cur = sched.fired;
        while let Some(c) = cur {
            if c == timer {
                match prev {
                    Some(p) => unsafe { state_of(p).next = st.next },
                    None => sched.fired = st.next,
                }
                break;
            }
            prev = cur;
            cur = unsafe { state_of(c).next };
        }
        st.in_fired = false;
    } else if st.active {
        match st.prev {
            Some(p) => unsafe { state_of(p).next = st.next },
            None => {
                if sched.head == Some(timer) {
                    sched.head = st.next;
                }
            }
        }
        if let Some(n) = st.next {
            unsafe { state_of(n).prev = st.prev };
        }
    }

    st.next = None;
    st.prev = None;
}

/// Move expired timers to the fired list and poke the dispatch thread.
///
/// Called from the tick handler, inside its critical section.
pub(crate) fn on_tick(now: u64) {
    let sched = unsafe { SCHEDULE.get_unchecked() };
    let mut any = false;

    while let Some(t) = sched.head {
        let st = unsafe { state_of(t) };
        if st.expiry > now {
            break;
        }

        sched.head = st.next;
        if let Some(n) = st.next {
            unsafe { state_of(n).prev = None };
        }

        st.active = false;
        st.prev = None;
        st.next = sched.fired;
        st.in_fired = true;
        sched.fired = Some(t);

        any = true;
    }

    if any {
        let dispatch = unsafe { &*(&raw const DISPATCH_THREAD) };
        let _ = thread::sig_raise(dispatch, DISPATCH_SIG);
    }
}

// ============ Dispatch thread ============

const DISPATCH_SIG: FlagsMask = 0x01;

static mut DISPATCH_THREAD: Thread = Thread::new();
static mut DISPATCH_STACK: [StackElement; CFG_TIMER_STACK_SIZE / 4] =
    [0; CFG_TIMER_STACK_SIZE / 4];

fn dispatch_entry(_: *mut ()) -> *mut () {
    loop {
        let _ = this_thread::sig_wait(DISPATCH_SIG, mode::ANY | mode::CLEAR);

        loop {
            // Pop one fired timer and requeue it if periodic; the
            // callback itself runs outside the critical section.
            let fired = critical_section(|cs| {
                let sched = SCHEDULE.get(cs);
                let t = sched.fired?;
                let st = unsafe { state_of(t) };

                sched.fired = st.next;
                st.next = None;
                st.in_fired = false;

                if st.run == TimerRun::Periodic {
                    st.expiry =
                        crate::rtos::clock::sysclock::now().wrapping_add(st.period as u64);
                    st.active = true;
                    unsafe { schedule_insert(sched, t) };
                }

                Some((st.func, st.arg))
            });

            match fired {
                Some((func, arg)) => func(arg),
                None => break,
            }
        }
    }
}

/// Create the dispatch thread; runs just below the error sentinel so
/// timer callbacks preempt every user thread.
///
/// # Safety-adjacent
/// Called once from `scheduler::start`, inside its critical section.
pub(crate) fn spawn_dispatch_thread() -> Result<()> {
    unsafe {
        thread::spawn_internal(
            &raw mut DISPATCH_THREAD,
            "timer",
            dispatch_entry,
            core::ptr::null_mut(),
            priority::ISR,
            (&raw mut DISPATCH_STACK).cast(),
            CFG_TIMER_STACK_SIZE / 4,
            false,
        )
    }
}
