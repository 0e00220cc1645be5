//! Global kernel state and lifecycle
//!
//! Owns the process-wide scheduler state: the started/locked flags, the
//! ready queue and priority bitmap, the current/next thread pointers the
//! port layer switches between, and the idle and main threads. This
//! state lives from `initialize()` until power-off.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[cfg(feature = "stats")]
use core::sync::atomic::AtomicU32;

use crate::rtos::config::{
    CFG_CORE_CLOCK_HZ, CFG_IDLE_STACK_SIZE, CFG_MAIN_STACK_SIZE, CFG_SYSTICK_FREQUENCY_HZ,
};
use crate::rtos::critical::{critical_section, is_isr_context, CriticalSection};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::sched::{PrioTable, ReadyList};
use crate::rtos::thread::{self, Thread};
use crate::rtos::types::{priority, Priority, StackElement, ThreadFn};

// ============ Kernel flags ============

/// Atomic kernel flags
pub struct KernelFlags {
    initialized: AtomicBool,
    started: AtomicBool,
    int_nesting: AtomicU8,
    sched_locked: AtomicBool,
}

impl KernelFlags {
    const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            int_nesting: AtomicU8::new(0),
            sched_locked: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.int_nesting.store(0, Ordering::SeqCst);
        self.sched_locked.store(false, Ordering::SeqCst);
    }
}

pub(crate) static KERNEL: KernelFlags = KernelFlags::new();

// ============ Scheduler state ============

/// Ready queue: per-priority FIFO lists plus the non-empty bitmap.
pub struct SchedState {
    pub(crate) prio_tbl: PrioTable,
    pub(crate) ready: [ReadyList; priority::LEVELS],
}

impl SchedState {
    const fn new() -> Self {
        Self {
            prio_tbl: PrioTable::new(),
            ready: [const { ReadyList::new() }; priority::LEVELS],
        }
    }

    fn reset(&mut self) {
        self.prio_tbl.init();
        for list in self.ready.iter_mut() {
            list.init();
        }
    }
}

pub(crate) static SCHED: CsCell<SchedState> = CsCell::new(SchedState::new());

// ============ CPU switch state ============

/// Thread pointers the context-switch primitive operates on.
#[repr(C)]
pub struct CpuState {
    /// The running thread; updated by every context switch.
    pub current: *mut Thread,
    /// The thread the next switch hands the CPU to.
    pub next: *mut Thread,
}

impl CpuState {
    const fn new() -> Self {
        Self {
            current: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        }
    }
}

/// Global CPU switch state; read and written by the port layer.
#[no_mangle]
#[used]
pub static mut CPU_STATE: CpuState = CpuState::new();

// ============ Statistics ============

#[cfg(feature = "stats")]
static SWITCH_COUNT: AtomicU32 = AtomicU32::new(0);

#[inline(always)]
pub(crate) fn note_context_switch() {
    #[cfg(feature = "stats")]
    SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Number of context switches requested since `initialize`.
#[cfg(feature = "stats")]
pub fn context_switches() -> u32 {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

// ============ Idle & main threads ============

static mut IDLE_THREAD: Thread = Thread::new();
static mut IDLE_STACK: [StackElement; CFG_IDLE_STACK_SIZE / 4] = [0; CFG_IDLE_STACK_SIZE / 4];

static mut MAIN_THREAD: Thread = Thread::new();
static mut MAIN_STACK: [StackElement; CFG_MAIN_STACK_SIZE / 4] = [0; CFG_MAIN_STACK_SIZE / 4];

fn idle_entry(_: *mut ()) -> *mut () {
    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::wfi();
        #[cfg(not(target_arch = "arm"))]
        core::hint::spin_loop();
    }
}

// ============ Lifecycle ============

/// Initialise the kernel.
///
/// Resets all scheduler state and creates the idle thread. Must be called
/// before any other kernel function.
pub fn initialize() -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }
    if KERNEL.started.load(Ordering::Acquire) {
        return Err(Error::NotPermitted);
    }

    KERNEL.reset();
    crate::rtos::clock::reset();
    crate::rtos::timer::reset();

    critical_section(|cs| {
        SCHED.get(cs).reset();

        unsafe {
            CPU_STATE.current = core::ptr::null_mut();
            CPU_STATE.next = core::ptr::null_mut();
        }

        unsafe {
            thread::spawn_internal(
                &raw mut IDLE_THREAD,
                "idle",
                idle_entry,
                core::ptr::null_mut(),
                priority::IDLE,
                (&raw mut IDLE_STACK).cast(),
                CFG_IDLE_STACK_SIZE / 4,
                false,
            )?;
        }

        KERNEL.initialized.store(true, Ordering::SeqCst);
        Ok(())
    })
}

/// Start the scheduler.
///
/// Creates the main thread around the application entry `main` and the
/// timer dispatch thread, then switches to the highest-priority ready
/// thread. On success this function never returns.
pub fn start(main: ThreadFn, arg: *mut ()) -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }
    if !KERNEL.initialized.load(Ordering::Acquire) {
        return Err(Error::NotPermitted);
    }
    if KERNEL.started.load(Ordering::Acquire) {
        return Err(Error::NotPermitted);
    }

    critical_section(|cs| {
        unsafe {
            thread::spawn_internal(
                &raw mut MAIN_THREAD,
                "main",
                main,
                arg,
                priority::NORMAL,
                (&raw mut MAIN_STACK).cast(),
                CFG_MAIN_STACK_SIZE / 4,
                false,
            )?;
        }

        crate::rtos::timer::spawn_dispatch_thread()?;

        let sched = SCHED.get(cs);
        let high = sched.prio_tbl.highest();
        let first = sched.ready[high as usize]
            .head()
            .ok_or(Error::NotRecoverable)?;

        unsafe {
            CPU_STATE.current = core::ptr::null_mut();
            CPU_STATE.next = first.as_ptr();
        }

        KERNEL.started.store(true, Ordering::SeqCst);
        Ok(())
    })?;

    crate::port::systick_init(CFG_CORE_CLOCK_HZ / CFG_SYSTICK_FREQUENCY_HZ);

    unsafe { crate::port::start_first_thread() };

    // Only the host stub ever falls through to here.
    Ok(())
}

/// Check if the scheduler was started.
#[inline(always)]
pub fn is_started() -> bool {
    KERNEL.started.load(Ordering::Acquire)
}

// ============ Scheduler lock ============

/// Scheduler lock status, as returned by [`lock`].
pub type Status = bool;

/// Lock the scheduler and return the previous status.
///
/// While locked, context switches are deferred; interrupts keep running.
/// This is not a substitute for a critical section on ISR-shared data.
pub fn lock() -> Status {
    critical_section(|_cs| KERNEL.sched_locked.swap(true, Ordering::SeqCst))
}

/// Restore the scheduler lock to a previous status.
///
/// Passing back the value returned by the matching [`lock`] makes the
/// pair nestable; the outermost restore triggers the deferred
/// reschedule.
pub fn unlock(status: Status) {
    critical_section(|_cs| KERNEL.sched_locked.store(status, Ordering::SeqCst));

    if !status {
        crate::rtos::sched::reschedule();
    }
}

/// Check if the scheduler is locked.
#[inline(always)]
pub fn is_locked() -> bool {
    KERNEL.sched_locked.load(Ordering::SeqCst)
}

/// RAII scheduler lock
pub struct SchedLock {
    status: Status,
}

impl SchedLock {
    pub fn acquire() -> Self {
        SchedLock { status: lock() }
    }
}

impl Drop for SchedLock {
    fn drop(&mut self) {
        unlock(self.status);
    }
}

// ============ ISR nesting ============

/// Note entry into an interrupt handler.
pub fn interrupts_enter() {
    if is_started() {
        KERNEL.int_nesting.fetch_add(1, Ordering::Relaxed);
    }
}

/// Note exit from an interrupt handler.
///
/// At the end of the outermost handler, if a higher-priority thread
/// became ready, a tail-chained context switch is requested.
pub fn interrupts_exit() {
    if !is_started() {
        return;
    }

    let _cs = CriticalSection::enter();

    let nesting = KERNEL.int_nesting.load(Ordering::Relaxed);
    if nesting == 0 {
        return;
    }
    KERNEL.int_nesting.store(nesting - 1, Ordering::Relaxed);

    if nesting - 1 == 0 && !is_locked() {
        unsafe {
            let high = prio_table().highest();
            if let Some(next) = ready_list(high).head() {
                if Some(next) != current_thread() {
                    set_next_thread(next);
                    note_context_switch();
                    crate::port::int_ctx_sw();
                }
            }
        }
    }
}

pub(crate) fn int_nesting() -> u8 {
    KERNEL.int_nesting.load(Ordering::Relaxed)
}

// ============ Accessors for other kernel modules ============

/// # Safety
/// Caller must be inside a critical section.
#[inline(always)]
pub(crate) unsafe fn prio_table() -> &'static mut PrioTable {
    unsafe { &mut SCHED.get_unchecked().prio_tbl }
}

/// # Safety
/// Caller must be inside a critical section.
#[inline(always)]
pub(crate) unsafe fn ready_list(prio: Priority) -> &'static mut ReadyList {
    unsafe { &mut SCHED.get_unchecked().ready[prio as usize] }
}

/// The running thread, if the scheduler has one.
#[inline]
pub(crate) fn current_thread() -> Option<NonNull<Thread>> {
    unsafe { NonNull::new(CPU_STATE.current) }
}

/// # Safety
/// Caller must be inside a critical section.
#[inline]
pub(crate) unsafe fn set_next_thread(thread: NonNull<Thread>) {
    unsafe { CPU_STATE.next = thread.as_ptr() };
}

// ============ Test support ============

#[cfg(test)]
pub(crate) fn test_force_started(started: bool) {
    KERNEL.started.store(started, Ordering::SeqCst);
}

/// # Safety
/// Host-test only; pretends `thread` is the running thread.
#[cfg(test)]
pub(crate) unsafe fn test_set_current(thread: *mut Thread) {
    unsafe { CPU_STATE.current = thread };
}
