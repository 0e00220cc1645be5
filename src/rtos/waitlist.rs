//! Wait lists and the blocking protocol
//!
//! Every blocking primitive parks threads through this one protocol.
//! Parking happens under the primitive's critical section: the caller
//! leaves the ready queue, enters the primitive's wait list (ordered by
//! priority, FIFO within a level), optionally enters the clock sleep
//! list, and becomes `Waiting`. The actual context switch fires when the
//! critical section ends. Unparking reverses all of it in one critical
//! section and records why the thread woke.

use core::ptr::NonNull;

use crate::rtos::clock;
use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::sched;
use crate::rtos::thread::Thread;
use crate::rtos::types::{ThreadState, Ticks, WaitKind};

/// Priority-ordered queue of parked threads
///
/// Highest priority first; equal priorities keep park order, so the head
/// is always the thread a single wake must pick.
pub(crate) struct WaitList {
    head: Option<NonNull<Thread>>,
    tail: Option<NonNull<Thread>>,
}

impl WaitList {
    pub const fn new() -> Self {
        WaitList {
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Highest-priority, earliest-parked waiter.
    #[inline]
    pub fn head(&self) -> Option<NonNull<Thread>> {
        self.head
    }

    /// Insert keeping (priority DESC, park order ASC).
    pub fn insert(&mut self, thread: NonNull<Thread>) {
        let prio = unsafe { thread.as_ref().prio };

        let mut prev: Option<NonNull<Thread>> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let c_ref = unsafe { c.as_ref() };
            if prio > c_ref.prio {
                break;
            }
            prev = cur;
            cur = c_ref.wait_next;
        }

        let t = unsafe { &mut *thread.as_ptr() };
        t.wait_prev = prev;
        t.wait_next = cur;
        t.wait_list = self as *mut WaitList;

        match prev {
            Some(p) => unsafe { (*p.as_ptr()).wait_next = Some(thread) },
            None => self.head = Some(thread),
        }

        match cur {
            Some(c) => unsafe { (*c.as_ptr()).wait_prev = Some(thread) },
            None => self.tail = Some(thread),
        }
    }

    /// Unlink a thread.
    pub fn remove(&mut self, thread: NonNull<Thread>) {
        let t = unsafe { &mut *thread.as_ptr() };

        match t.wait_prev {
            Some(prev) => unsafe { (*prev.as_ptr()).wait_next = t.wait_next },
            None => self.head = t.wait_next,
        }

        match t.wait_next {
            Some(next) => unsafe { (*next.as_ptr()).wait_prev = t.wait_prev },
            None => self.tail = t.wait_prev,
        }

        t.wait_prev = None;
        t.wait_next = None;
        t.wait_list = core::ptr::null_mut();
    }

    /// Re-sort one member after its effective priority changed.
    pub fn reposition(&mut self, thread: NonNull<Thread>) {
        self.remove(thread);
        self.insert(thread);
    }
}

unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

// ============ Blocking protocol ============

/// Check that the caller may block at all.
pub(crate) fn blocking_allowed() -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }
    if !kernel::is_started() {
        return Err(Error::NotPermitted);
    }
    if kernel::is_locked() {
        return Err(Error::NotPermitted);
    }
    Ok(())
}

/// Absolute wakeup instant for a relative timeout.
pub(crate) fn deadline_after(timeout: Option<Ticks>) -> Option<u64> {
    timeout.map(|t| clock::sysclock::now().wrapping_add(t as u64))
}

/// Whether a timed wait's deadline has already passed.
///
/// Every timed primitive checks this before parking, so an expired
/// deadline fails with `TimedOut` at once instead of sleeping until the
/// next tick retires it.
pub(crate) fn deadline_elapsed(deadline: Option<u64>) -> bool {
    match deadline {
        Some(d) => d <= clock::sysclock::now(),
        None => false,
    }
}

/// Park the current thread.
///
/// Performs steps (a)–(e) of the protocol; the caller has already
/// re-checked its condition. The context switch itself happens once the
/// caller's critical section unwinds.
///
/// # Safety
/// Caller holds a critical section and runs in thread context with the
/// scheduler started and unlocked.
pub(crate) unsafe fn park_current(
    list: Option<&mut WaitList>,
    kind: WaitKind,
    obj: *const (),
    deadline: Option<u64>,
) {
    let cur = match kernel::current_thread() {
        Some(c) => c,
        None => return,
    };

    unsafe {
        sched::rdy_remove(cur);

        let t = &mut *cur.as_ptr();
        t.wait_kind = kind;
        t.wait_obj = obj;
        t.wakeup = Ok(());

        match list {
            Some(l) => l.insert(cur),
            None => t.wait_list = core::ptr::null_mut(),
        }

        if let Some(d) = deadline {
            clock::sleep_insert(cur, d);
        }

        t.state = ThreadState::Waiting;
    }

    sched::reschedule();
}

/// Unpark a thread, recording the wakeup reason.
///
/// Removes it from its wait list and the sleep list, readies it and
/// reinserts it into the ready queue. Safe to call for a thread that
/// already woke; that is a no-op.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn unpark(thread: NonNull<Thread>, reason: Result<()>) {
    let t = unsafe { &mut *thread.as_ptr() };

    if t.state != ThreadState::Waiting {
        return;
    }

    let abandoned_mutex = t.wait_kind == WaitKind::Mutex && reason.is_err();
    let mutex_obj = t.wait_obj;

    unsafe {
        if !t.wait_list.is_null() {
            (*t.wait_list).remove(thread);
        }

        if t.in_sleep_list {
            clock::sleep_remove(thread);
        }

        t.wait_kind = WaitKind::None;
        t.wait_obj = core::ptr::null();
        t.wakeup = reason;
        t.state = ThreadState::Ready;

        sched::rdy_insert(thread);

        // A waiter that left a contended mutex may deflate the owner's
        // inherited priority.
        if abandoned_mutex {
            crate::sync::mutex::waiter_left(mutex_obj);
        }
    }
}

/// Unpark every thread on a wait list with the same reason.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn unpark_all(list: &mut WaitList, reason: Result<()>) {
    while let Some(t) = list.head() {
        unsafe { unpark(t, reason) };
    }
}

/// Collect the wakeup reason after returning from a park.
pub(crate) fn finish_wait() -> Result<()> {
    critical_section(|_cs| match kernel::current_thread() {
        Some(cur) => unsafe { cur.as_ref().wakeup },
        None => Ok(()),
    })
}
