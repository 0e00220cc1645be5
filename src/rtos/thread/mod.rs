//! Thread management
//!
//! Creation, termination, join/detach, priorities and the per-thread
//! signal flags. The current thread's operations live in [`this_thread`].

mod tcb;

pub use tcb::Thread;

use core::ptr::NonNull;

use crate::rtos::arena;
use crate::rtos::clock;
use crate::rtos::config::{CFG_STACK_SENTINEL, CFG_STACK_SIZE_DEFAULT, CFG_STACK_SIZE_MIN};
use crate::rtos::critical::{critical_section, is_isr_context, CriticalSection};
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::sched;
use crate::rtos::types::{
    flags_consumed, flags_satisfied, mode, priority, FlagsMask, FlagsMode, Priority, StackElement,
    ThreadFn, ThreadState, Ticks, WaitKind,
};
use crate::rtos::waitlist;

/// Thread creation attributes
#[derive(Clone, Copy)]
pub struct Attributes {
    /// Stack region; `null` asks the kernel to acquire one.
    pub stack_addr: *mut StackElement,
    /// Stack size in bytes; 0 selects the default size.
    pub stack_size_bytes: usize,
    /// Assigned priority.
    pub priority: Priority,
}

impl Attributes {
    /// Default attributes: kernel stack of default size, normal priority.
    pub const fn new() -> Self {
        Attributes {
            stack_addr: core::ptr::null_mut(),
            stack_size_bytes: 0,
            priority: priority::NORMAL,
        }
    }

    pub const fn with_priority(mut self, prio: Priority) -> Self {
        self.priority = prio;
        self
    }

    pub const fn with_stack(mut self, addr: *mut StackElement, size_bytes: usize) -> Self {
        self.stack_addr = addr;
        self.stack_size_bytes = size_bytes;
        self
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a thread and make it ready.
///
/// The control block must be reusable (`Undefined`, `Terminated` or
/// `Destroyed`). When the attributes carry no stack region one of
/// default size is taken from the kernel arena and released when the
/// thread is reaped.
pub fn create(
    thread: &'static mut Thread,
    name: &'static str,
    entry: ThreadFn,
    arg: *mut (),
    attr: &Attributes,
) -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    if attr.priority < priority::LOWEST || attr.priority > priority::HIGHEST {
        return Err(Error::Invalid);
    }

    if !thread.is_reusable() {
        return Err(Error::Invalid);
    }

    let (stack_base, stack_bytes, stack_owned) = if attr.stack_addr.is_null() {
        let bytes = if attr.stack_size_bytes == 0 {
            CFG_STACK_SIZE_DEFAULT
        } else {
            attr.stack_size_bytes.max(CFG_STACK_SIZE_MIN)
        };
        let ptr = critical_section(|cs| arena::alloc(cs, bytes))?;
        (ptr.as_ptr().cast::<StackElement>(), bytes, true)
    } else {
        if attr.stack_size_bytes < CFG_STACK_SIZE_MIN {
            return Err(Error::Invalid);
        }
        (attr.stack_addr, attr.stack_size_bytes, false)
    };

    critical_section(|_cs| unsafe {
        spawn_internal(
            thread as *mut Thread,
            name,
            entry,
            arg,
            attr.priority,
            stack_base,
            stack_bytes / core::mem::size_of::<StackElement>(),
            stack_owned,
        )
    })?;

    if kernel::is_started() {
        sched::reschedule();
    }

    Ok(())
}

/// Construct a thread in place and enqueue it ready.
///
/// # Safety
/// Caller holds a critical section; `thread` and the stack region are
/// valid and unused.
pub(crate) unsafe fn spawn_internal(
    thread: *mut Thread,
    name: &'static str,
    entry: ThreadFn,
    arg: *mut (),
    prio: Priority,
    stack_base: *mut StackElement,
    stack_elems: usize,
    stack_owned: bool,
) -> Result<()> {
    if thread.is_null() || stack_base.is_null() || stack_elems == 0 {
        return Err(Error::Invalid);
    }

    let t = unsafe { &mut *thread };
    t.init();

    t.name = name;
    t.prio = prio;
    t.base_prio = prio;
    t.entry = Some(entry);
    t.entry_arg = arg;
    t.state = ThreadState::Inactive;

    // Sentinel fill enables stack_available()'s high-water scan.
    unsafe {
        for i in 0..stack_elems {
            stack_base.add(i).write(CFG_STACK_SENTINEL);
        }
    }

    t.stack_base = stack_base;
    t.stack_size = stack_elems;
    t.stack_owned = stack_owned;
    t.stack_ptr = unsafe { crate::port::stack_init(thread, stack_base, stack_elems) };

    t.state = ThreadState::Ready;

    let handle = unsafe { NonNull::new_unchecked(thread) };
    unsafe { sched::rdy_insert(handle) };

    Ok(())
}

/// Runs a thread's entry function and terminates it with the returned
/// exit value. The port layer points every initial context here.
pub(crate) extern "C" fn thread_invoke(thread: *mut Thread) -> ! {
    let (entry, arg) = unsafe { ((*thread).entry, (*thread).entry_arg) };
    let exit_value = match entry {
        Some(f) => f(arg),
        None => core::ptr::null_mut(),
    };
    this_thread::exit(exit_value)
}

// ============ Termination ============

/// Tear a thread out of every kernel structure and mark it terminated.
///
/// # Safety
/// Caller holds a critical section.
unsafe fn finish_thread(cs: &CriticalSection, thread: NonNull<Thread>, exit_value: *mut ()) {
    let t = unsafe { &mut *thread.as_ptr() };

    t.exit_value = exit_value;

    // The owner of a robust mutex dying is observable by the next
    // acquirer; stalled mutexes are left as they are.
    unsafe { crate::sync::mutex::release_owned_on_death(thread) };

    unsafe {
        match t.state {
            ThreadState::Ready | ThreadState::Running => sched::rdy_remove(thread),
            ThreadState::Waiting => {
                if !t.wait_list.is_null() {
                    (*t.wait_list).remove(thread);
                }
                if t.in_sleep_list {
                    clock::sleep_remove(thread);
                }
            }
            _ => {}
        }
    }

    t.wait_kind = WaitKind::None;
    t.state = ThreadState::Terminated;

    if let Some(joiner) = t.joiner.take() {
        unsafe { waitlist::unpark(joiner, Ok(())) };
    } else if t.detached {
        unsafe { destroy(cs, thread) };
    }
}

/// Reap a terminated thread: release an arena stack and mark the
/// control block reusable.
///
/// # Safety
/// Caller holds a critical section; the thread is `Terminated`.
unsafe fn destroy(cs: &CriticalSection, thread: NonNull<Thread>) {
    let t = unsafe { &mut *thread.as_ptr() };

    if t.stack_owned {
        if let Some(base) = NonNull::new(t.stack_base.cast::<u8>()) {
            arena::free(cs, base, t.stack_size * core::mem::size_of::<StackElement>());
        }
        t.stack_owned = false;
    }
    t.stack_base = core::ptr::null_mut();
    t.stack_ptr = core::ptr::null_mut();
    t.state = ThreadState::Destroyed;
}

/// Wait for a thread to terminate and collect its exit value.
pub fn join(thread: &Thread, exit: Option<&mut *mut ()>) -> Result<()> {
    waitlist::blocking_allowed()?;

    let target = NonNull::from(thread).cast::<Thread>();

    let step = critical_section(|cs| {
        let t = unsafe { &mut *target.as_ptr() };

        if Some(target) == kernel::current_thread() {
            return Some(Err(Error::Deadlock));
        }
        if t.detached || t.joiner.is_some() {
            return Some(Err(Error::Invalid));
        }

        match t.state {
            ThreadState::Undefined | ThreadState::Inactive | ThreadState::Destroyed => {
                Some(Err(Error::Invalid))
            }
            ThreadState::Terminated => {
                let value = t.exit_value;
                unsafe { destroy(cs, target) };
                Some(Ok(value))
            }
            _ => {
                t.joiner = kernel::current_thread();
                unsafe {
                    waitlist::park_current(None, WaitKind::Join, target.as_ptr().cast(), None)
                };
                None
            }
        }
    });

    let value = match step {
        Some(r) => r?,
        None => match waitlist::finish_wait() {
            Ok(()) => critical_section(|cs| {
                let t = unsafe { &mut *target.as_ptr() };
                let value = t.exit_value;
                unsafe { destroy(cs, target) };
                value
            }),
            Err(e) => {
                // The join was abandoned; unregister as joiner.
                critical_section(|_cs| {
                    let t = unsafe { &mut *target.as_ptr() };
                    if t.joiner == kernel::current_thread() {
                        t.joiner = None;
                    }
                });
                return Err(e);
            }
        },
    };

    if let Some(out) = exit {
        *out = value;
    }
    Ok(())
}

/// Mark that no joiner will come; the thread self-reaps on termination.
pub fn detach(thread: &Thread) -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    critical_section(|cs| {
        let t = unsafe { &mut *target.as_ptr() };

        if t.joiner.is_some() {
            return Err(Error::Invalid);
        }

        match t.state {
            ThreadState::Undefined | ThreadState::Destroyed => Err(Error::Invalid),
            ThreadState::Terminated => {
                unsafe { destroy(cs, target) };
                Ok(())
            }
            _ => {
                t.detached = true;
                Ok(())
            }
        }
    })
}

/// Force a thread to terminate, releasing its resources.
pub fn kill(thread: &Thread) -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    if Some(target) == kernel::current_thread() {
        this_thread::exit(core::ptr::null_mut());
    }

    critical_section(|cs| {
        let t = unsafe { target.as_ref() };
        match t.state {
            ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed => {
                Err(Error::Invalid)
            }
            _ => {
                unsafe { finish_thread(cs, target, core::ptr::null_mut()) };
                Ok(())
            }
        }
    })?;

    sched::reschedule();
    Ok(())
}

/// Wake a parked thread with reason `Interrupted`.
///
/// A thread that is not waiting is left alone.
pub fn interrupt(thread: &Thread) -> Result<()> {
    let target = NonNull::from(thread).cast::<Thread>();

    critical_section(|_cs| unsafe {
        if target.as_ref().is_waiting() {
            waitlist::unpark(target, Err(Error::Interrupted));
        }
    });

    sched::reschedule();
    Ok(())
}

/// Check whether the thread's latest wait ended by interruption.
pub fn interrupted(thread: &Thread) -> bool {
    critical_section(|_cs| thread.wakeup == Err(Error::Interrupted))
}

/// Why the thread's latest wait ended: `Ok` for an event, otherwise the
/// error its blocking call reported.
pub fn wakeup_reason(thread: &Thread) -> Result<()> {
    critical_section(|_cs| thread.wakeup)
}

/// Wake a thread parked in `wait_for` before its deadline.
///
/// May be invoked from ISRs. Threads parked on a primitive are not
/// affected; their wait lists own their wakeup.
pub fn wakeup(thread: &Thread) {
    let target = NonNull::from(thread).cast::<Thread>();

    critical_section(|_cs| unsafe {
        let t = target.as_ref();
        if t.is_waiting() && t.wait_kind == WaitKind::Sleep {
            waitlist::unpark(target, Ok(()));
        }
    });

    sched::reschedule();
}

// ============ Priority ============

/// Assigned (base) priority.
pub fn sched_prio(thread: &Thread) -> Priority {
    critical_section(|_cs| thread.base_prio)
}

/// Change the assigned priority; the effective priority follows unless
/// a mutex protocol keeps it boosted.
pub fn set_sched_prio(thread: &Thread, prio: Priority) -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    if prio < priority::LOWEST || prio > priority::HIGHEST {
        return Err(Error::Invalid);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    critical_section(|_cs| unsafe {
        (*target.as_ptr()).base_prio = prio;
        crate::sync::mutex::refresh_effective_prio(target);
    });

    sched::reschedule();
    Ok(())
}

/// Apply a computed effective priority, keeping whichever list the
/// thread occupies correctly ordered.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn apply_effective_prio(thread: NonNull<Thread>, eff: Priority) {
    let t = unsafe { &mut *thread.as_ptr() };

    if t.prio == eff {
        return;
    }

    match t.state {
        ThreadState::Ready | ThreadState::Running => unsafe {
            sched::rdy_change_prio(thread, eff);
        },
        ThreadState::Waiting if !t.wait_list.is_null() => unsafe {
            t.prio = eff;
            (*t.wait_list).reposition(thread);
        },
        _ => t.prio = eff,
    }
}

// ============ Stack accounting ============

/// Bytes of stack never touched since creation, measured from the
/// sentinel prefix still intact above the stack base.
pub fn stack_available(thread: &Thread) -> usize {
    critical_section(|_cs| {
        if thread.stack_base.is_null() {
            return 0;
        }
        let mut untouched = 0usize;
        for i in 0..thread.stack_size {
            if unsafe { thread.stack_base.add(i).read() } != CFG_STACK_SENTINEL {
                break;
            }
            untouched += 1;
        }
        untouched * core::mem::size_of::<StackElement>()
    })
}

// ============ Signal flags ============

/// Raise signal flags on a thread, waking it when its pending flag wait
/// becomes satisfied. May be invoked from ISRs.
pub fn sig_raise(thread: &Thread, mask: FlagsMask) -> Result<FlagsMask> {
    if mask == 0 {
        return Err(Error::Invalid);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    let prev = critical_section(|_cs| {
        let t = unsafe { &mut *target.as_ptr() };
        let prev = t.sig_mask;
        t.sig_mask |= mask;

        if t.is_waiting()
            && t.wait_kind == WaitKind::SigFlags
            && flags_satisfied(t.flags_wait_mask, t.flags_wait_mode, t.sig_mask)
        {
            t.flags_ready = t.sig_mask;
            if t.flags_wait_mode & mode::CLEAR != 0 {
                t.sig_mask &= !flags_consumed(t.flags_wait_mask, t.sig_mask);
            }
            unsafe { waitlist::unpark(target, Ok(())) };
        }
        prev
    });

    sched::reschedule();
    Ok(prev)
}

/// Clear signal flags, returning the previously raised set.
pub fn sig_clear(thread: &Thread, mask: FlagsMask) -> Result<FlagsMask> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }
    if mask == 0 {
        return Err(Error::Invalid);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    Ok(critical_section(|_cs| {
        let t = unsafe { &mut *target.as_ptr() };
        let prev = t.sig_mask;
        t.sig_mask &= !mask;
        prev
    }))
}

/// Peek at signal flags; with `mode::CLEAR` the selected bits are
/// consumed. A zero mask selects all flags.
pub fn sig_get(thread: &Thread, mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    let target = NonNull::from(thread).cast::<Thread>();

    Ok(critical_section(|_cs| {
        let t = unsafe { &mut *target.as_ptr() };
        let selected = if mask == 0 { t.sig_mask } else { t.sig_mask & mask };
        if flg_mode & mode::CLEAR != 0 {
            t.sig_mask &= !selected;
        }
        selected
    }))
}

/// Operations on the calling thread
pub mod this_thread {
    use super::*;

    /// The current running thread, when the scheduler has one.
    pub fn thread() -> Option<&'static Thread> {
        kernel::current_thread().map(|t| unsafe { &*t.as_ptr() })
    }

    /// Yield execution to the next ready thread of equal priority.
    pub fn yield_now() -> Result<()> {
        sched::yield_now()
    }

    /// Terminate the calling thread with an exit value.
    pub fn exit(exit_value: *mut ()) -> ! {
        critical_section(|cs| {
            if let Some(cur) = kernel::current_thread() {
                unsafe { super::finish_thread(cs, cur, exit_value) };
            }
            sched::reschedule();
        });

        loop {
            #[cfg(target_arch = "arm")]
            cortex_m::asm::wfi();
            #[cfg(not(target_arch = "arm"))]
            core::hint::spin_loop();
        }
    }

    /// Check if the previous wait ended because the full duration
    /// elapsed rather than by an event.
    pub fn is_timeout() -> bool {
        critical_section(|_cs| match kernel::current_thread() {
            Some(cur) => unsafe { cur.as_ref().wakeup == Err(Error::TimedOut) },
            None => false,
        })
    }

    /// Wait until the expected signal flags are raised.
    pub fn sig_wait(mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
        sig_wait_common(mask, flg_mode, None, true)
    }

    /// Check for the expected signal flags without blocking.
    ///
    /// A zero mask observes (and with `mode::CLEAR` consumes) whatever
    /// is currently raised; `Err(Again)` when nothing is.
    pub fn try_sig_wait(mask: FlagsMask, flg_mode: FlagsMode) -> Result<FlagsMask> {
        sig_wait_common(mask, flg_mode, None, false)
    }

    /// Wait for signal flags with a deadline.
    pub fn timed_sig_wait(mask: FlagsMask, flg_mode: FlagsMode, ticks: Ticks) -> Result<FlagsMask> {
        sig_wait_common(mask, flg_mode, Some(ticks), true)
    }

    fn sig_wait_common(
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

        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|_cs| {
            let cur = match kernel::current_thread() {
                Some(c) => c,
                None => return Some(Err(Error::NotPermitted)),
            };
            let t = unsafe { &mut *cur.as_ptr() };

            if flags_satisfied(mask, flg_mode, t.sig_mask) {
                let flags = t.sig_mask;
                if flg_mode & mode::CLEAR != 0 {
                    t.sig_mask &= !flags_consumed(mask, t.sig_mask);
                }
                return Some(Ok(flags));
            }

            if !block {
                return Some(Err(Error::Again));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            t.flags_wait_mask = mask;
            t.flags_wait_mode = flg_mode;
            unsafe {
                waitlist::park_current(None, WaitKind::SigFlags, core::ptr::null(), deadline)
            };
            None
        });

        match step {
            Some(r) => r,
            None => match waitlist::finish_wait() {
                Ok(()) => Ok(critical_section(|_cs| match kernel::current_thread() {
                    Some(cur) => unsafe { cur.as_ref().flags_ready },
                    None => 0,
                })),
                Err(e) => Err(e),
            },
        }
    }
}
