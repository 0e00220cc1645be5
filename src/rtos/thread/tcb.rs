//! Thread control block
//!
//! All bookkeeping for one thread. Every list the kernel keeps threads
//! on (ready queue, wait lists, clock sleep list) chains through links
//! stored here, so parking a thread never allocates.

use core::ptr::NonNull;

use crate::rtos::config::UserStorage;
use crate::rtos::error::Result;
use crate::rtos::types::{
    FlagsMask, FlagsMode, MsgPrio, Priority, StackElement, ThreadFn, ThreadState, WaitKind,
};
use crate::rtos::waitlist::WaitList;

/// Thread control block
#[repr(C)]
pub struct Thread {
    // ============ Stack ============
    /// Saved stack pointer; must stay first, the port layer stores the
    /// outgoing SP here during a context switch.
    pub(crate) stack_ptr: *mut StackElement,
    /// Base of the stack region.
    pub(crate) stack_base: *mut StackElement,
    /// Stack size in elements.
    pub(crate) stack_size: usize,
    /// Whether the stack came from the kernel arena.
    pub(crate) stack_owned: bool,

    // ============ Identity ============
    pub(crate) name: &'static str,

    // ============ Ready queue links ============
    pub(crate) ready_next: Option<NonNull<Thread>>,
    pub(crate) ready_prev: Option<NonNull<Thread>>,

    // ============ Wait list links ============
    pub(crate) wait_next: Option<NonNull<Thread>>,
    pub(crate) wait_prev: Option<NonNull<Thread>>,
    /// The wait list this thread is parked on, if any.
    pub(crate) wait_list: *mut WaitList,
    pub(crate) wait_kind: WaitKind,
    /// The primitive being waited on; interpreted per `wait_kind`.
    pub(crate) wait_obj: *const (),

    // ============ Sleep list links ============
    pub(crate) sleep_next: Option<NonNull<Thread>>,
    pub(crate) sleep_prev: Option<NonNull<Thread>>,
    pub(crate) wakeup_tick: u64,
    pub(crate) in_sleep_list: bool,

    // ============ Scheduling ============
    /// Effective priority (after inheritance/ceiling boosts).
    pub(crate) prio: Priority,
    /// Assigned priority.
    pub(crate) base_prio: Priority,
    pub(crate) state: ThreadState,

    // ============ Entry & exit ============
    pub(crate) entry: Option<ThreadFn>,
    pub(crate) entry_arg: *mut (),
    pub(crate) exit_value: *mut (),
    pub(crate) joiner: Option<NonNull<Thread>>,
    pub(crate) detached: bool,

    /// Why the latest wait ended: `Ok` for an event, otherwise the error
    /// the blocking call must report.
    pub(crate) wakeup: Result<()>,

    // ============ Signal / event flags ============
    pub(crate) sig_mask: FlagsMask,
    pub(crate) flags_wait_mask: FlagsMask,
    pub(crate) flags_wait_mode: FlagsMode,
    /// Flags observed at the instant the wait was satisfied.
    pub(crate) flags_ready: FlagsMask,

    // ============ Message transfer while parked ============
    pub(crate) msg_ptr: *mut u8,
    pub(crate) msg_size: usize,
    pub(crate) msg_prio: MsgPrio,

    // ============ Owned mutexes (priority inheritance) ============
    /// Head of the intrusive list of mutexes this thread holds.
    pub(crate) mutex_head: *const (),

    // ============ User storage ============
    pub(crate) user_storage: UserStorage,
}

impl Thread {
    /// Create an empty, [`Undefined`](ThreadState::Undefined) thread.
    pub const fn new() -> Self {
        Thread {
            stack_ptr: core::ptr::null_mut(),
            stack_base: core::ptr::null_mut(),
            stack_size: 0,
            stack_owned: false,

            name: "",

            ready_next: None,
            ready_prev: None,

            wait_next: None,
            wait_prev: None,
            wait_list: core::ptr::null_mut(),
            wait_kind: WaitKind::None,
            wait_obj: core::ptr::null(),

            sleep_next: None,
            sleep_prev: None,
            wakeup_tick: 0,
            in_sleep_list: false,

            prio: 0,
            base_prio: 0,
            state: ThreadState::Undefined,

            entry: None,
            entry_arg: core::ptr::null_mut(),
            exit_value: core::ptr::null_mut(),
            joiner: None,
            detached: false,

            wakeup: Ok(()),

            sig_mask: 0,
            flags_wait_mask: 0,
            flags_wait_mode: 0,
            flags_ready: 0,

            msg_ptr: core::ptr::null_mut(),
            msg_size: 0,
            msg_prio: 0,

            mutex_head: core::ptr::null(),

            user_storage: UserStorage::new(),
        }
    }

    /// Reinitialise to the construction state.
    pub(crate) fn init(&mut self) {
        *self = Self::new();
    }

    /// Thread name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Scheduler state.
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Effective priority.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.prio
    }

    /// Address of the per-thread user storage.
    #[inline]
    pub fn user_storage(&self) -> *mut UserStorage {
        &self.user_storage as *const UserStorage as *mut UserStorage
    }

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.state == ThreadState::Waiting
    }

    /// Reuse of the control block is allowed from `Terminated` on.
    #[inline]
    pub(crate) fn is_reusable(&self) -> bool {
        matches!(
            self.state,
            ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed
        )
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}
