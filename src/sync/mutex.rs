//! Mutex with priority-inversion protocols and robustness
//!
//! POSIX-shaped ownership lock. The type selects relock behaviour
//! (normal / errorcheck / recursive), the protocol selects the
//! priority-inversion mitigation (inheritance or ceiling), and a robust
//! mutex makes its owner's death observable to the next acquirer.
//!
//! A thread's effective priority is derived from its base priority and
//! every mutex it holds; it is recomputed on each lock/unlock edge and
//! on every change to a contended wait list.

use core::ptr::NonNull;

use crate::rtos::config::CFG_MUTEX_RECURSION_MAX;
use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::sched;
use crate::rtos::thread::{self, Thread};
use crate::rtos::types::{priority, Priority, ThreadState, Ticks, WaitKind};
use crate::rtos::waitlist::{self, WaitList};

/// Relock behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Type {
    /// Relocking by the owner deadlocks (reported when detected).
    Normal,
    /// Relocking by the owner fails immediately with `Deadlock`.
    Errorcheck,
    /// Relocking by the owner nests, up to the recursion maximum.
    Recursive,
}

/// Priority-inversion protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    /// Ownership does not affect scheduling.
    None,
    /// The owner inherits the highest priority blocked on any of its
    /// inherit-mutexes.
    Inherit,
    /// The owner runs at least at the mutex's priority ceiling.
    Protect,
}

/// Owner-death behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Robustness {
    /// An owner dying while holding the lock wedges it.
    Stalled,
    /// The next acquirer is told the previous owner died.
    Robust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consistency {
    Consistent,
    /// Owner died; the next acquirer must mark the state consistent.
    Inconsistent,
    /// Unlocked while inconsistent; unusable until destroyed.
    NotRecoverable,
}

/// Mutex creation attributes
#[derive(Clone, Copy)]
pub struct Attributes {
    pub mx_type: Type,
    pub protocol: Protocol,
    pub robustness: Robustness,
    pub priority_ceiling: Priority,
}

impl Attributes {
    /// Plain normal mutex, no protocol, stalled.
    pub const fn normal() -> Self {
        Attributes {
            mx_type: Type::Normal,
            protocol: Protocol::None,
            robustness: Robustness::Stalled,
            priority_ceiling: priority::HIGHEST,
        }
    }

    pub const fn errorcheck() -> Self {
        Attributes {
            mx_type: Type::Errorcheck,
            ..Self::normal()
        }
    }

    pub const fn recursive() -> Self {
        Attributes {
            mx_type: Type::Recursive,
            ..Self::normal()
        }
    }

    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub const fn with_robustness(mut self, robustness: Robustness) -> Self {
        self.robustness = robustness;
        self
    }

    pub const fn with_ceiling(mut self, ceiling: Priority) -> Self {
        self.priority_ceiling = ceiling;
        self
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::normal()
    }
}

struct MutexState {
    owner: Option<NonNull<Thread>>,
    count: u16,
    mx_type: Type,
    protocol: Protocol,
    robustness: Robustness,
    ceiling: Priority,
    consistency: Consistency,
    waiters: WaitList,
    /// Next mutex in the owner's held-mutex list.
    next_owned: *const (),
}

unsafe impl Send for MutexState {}

/// Ownership lock
pub struct Mutex {
    name: &'static str,
    state: CsCell<MutexState>,
}

impl Mutex {
    /// Create a normal mutex.
    pub const fn new(name: &'static str) -> Self {
        Self::with_attributes(name, &Attributes::normal())
    }

    /// Create a mutex with explicit attributes.
    pub const fn with_attributes(name: &'static str, attr: &Attributes) -> Self {
        Mutex {
            name,
            state: CsCell::new(MutexState {
                owner: None,
                count: 0,
                mx_type: attr.mx_type,
                protocol: attr.protocol,
                robustness: attr.robustness,
                ceiling: attr.priority_ceiling,
                consistency: Consistency::Consistent,
                waiters: WaitList::new(),
                next_owned: core::ptr::null(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire, blocking for as long as it takes.
    pub fn lock(&self) -> Result<()> {
        self.lock_common(None, true)
    }

    /// Acquire without blocking; `Err(Busy)` on contention.
    pub fn try_lock(&self) -> Result<()> {
        self.lock_common(None, false)
    }

    /// Acquire, giving up after `ticks`.
    pub fn timed_lock(&self, ticks: Ticks) -> Result<()> {
        self.lock_common(Some(ticks), true)
    }

    fn lock_common(&self, timeout: Option<Ticks>, block: bool) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if block {
            waitlist::blocking_allowed()?;
        }

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|_cs| {
            let cur = match kernel::current_thread() {
                Some(c) => c,
                None => return Some(Err(Error::NotPermitted)),
            };
            let st = unsafe { state_of(this.as_ptr()) };

            if st.consistency == Consistency::NotRecoverable {
                return Some(Err(Error::NotRecoverable));
            }

            if st.protocol == Protocol::Protect
                && unsafe { cur.as_ref().base_prio } > st.ceiling
            {
                return Some(Err(Error::Invalid));
            }

            if st.owner.is_none() {
                unsafe { acquire(st, this, cur) };
                return if st.consistency == Consistency::Inconsistent {
                    Some(Err(Error::OwnerDead))
                } else {
                    Some(Ok(()))
                };
            }

            if st.owner == Some(cur) {
                return Some(match st.mx_type {
                    Type::Normal | Type::Errorcheck => Err(Error::Deadlock),
                    Type::Recursive => {
                        if st.count == CFG_MUTEX_RECURSION_MAX {
                            Err(Error::Again)
                        } else {
                            st.count += 1;
                            Ok(())
                        }
                    }
                });
            }

            if !block {
                return Some(Err(Error::Busy));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            unsafe {
                waitlist::park_current(
                    Some(&mut st.waiters),
                    WaitKind::Mutex,
                    this.as_ptr().cast(),
                    deadline,
                );
            }

            // Our arrival may raise the owner's inherited priority.
            if st.protocol == Protocol::Inherit {
                if let Some(owner) = st.owner {
                    unsafe { refresh_effective_prio(owner) };
                    sched::reschedule();
                }
            }

            None
        });

        match step {
            Some(r) => r,
            // `Ok` and `OwnerDead` both mean ownership was handed over.
            None => waitlist::finish_wait(),
        }
    }

    /// Release the mutex.
    ///
    /// A recursive mutex is released only when its recursion count
    /// returns to zero; the highest-priority earliest waiter then
    /// receives ownership.
    pub fn unlock(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        let this = NonNull::from(self);

        critical_section(|_cs| {
            let cur = match kernel::current_thread() {
                Some(c) => c,
                None => return Err(Error::NotPermitted),
            };
            let st = unsafe { state_of(this.as_ptr()) };

            if st.owner != Some(cur) {
                return Err(Error::NotPermitted);
            }

            if st.mx_type == Type::Recursive && st.count > 1 {
                st.count -= 1;
                return Ok(());
            }

            unsafe { unlink_owned(cur, this) };
            st.count = 0;

            if st.robustness == Robustness::Robust
                && st.consistency == Consistency::Inconsistent
            {
                // Unlocking without marking consistent finishes the mutex.
                st.consistency = Consistency::NotRecoverable;
                st.owner = None;
                unsafe {
                    waitlist::unpark_all(&mut st.waiters, Err(Error::NotRecoverable));
                    refresh_effective_prio(cur);
                }
                return Ok(());
            }

            match st.waiters.head() {
                Some(w) => unsafe {
                    waitlist::unpark(w, Ok(()));
                    acquire(st, this, w);
                },
                None => st.owner = None,
            }

            unsafe { refresh_effective_prio(cur) };
            Ok(())
        })?;

        sched::reschedule();
        Ok(())
    }

    /// Mark the state protected by a robust mutex consistent again.
    ///
    /// Only the thread that acquired it with `OwnerDead` may do so,
    /// before its unlock.
    pub fn consistent(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        let this = NonNull::from(self);

        critical_section(|_cs| {
            let st = unsafe { state_of(this.as_ptr()) };

            if st.robustness != Robustness::Robust
                || st.consistency != Consistency::Inconsistent
            {
                return Err(Error::Invalid);
            }
            if st.owner != kernel::current_thread() {
                return Err(Error::NotPermitted);
            }

            st.consistency = Consistency::Consistent;
            Ok(())
        })
    }

    /// The owning thread, if any.
    pub fn owner(&self) -> Option<&Thread> {
        critical_section(|_cs| {
            let st = unsafe { state_of(NonNull::from(self).as_ptr()) };
            st.owner.map(|o| unsafe { &*o.as_ptr() })
        })
    }

    /// Current priority ceiling.
    pub fn prio_ceiling(&self) -> Priority {
        critical_section(|_cs| unsafe { state_of(NonNull::from(self).as_ptr()) }.ceiling)
    }

    /// Change the priority ceiling, returning the previous one.
    pub fn set_prio_ceiling(&self, ceiling: Priority) -> Result<Priority> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if ceiling >= priority::ERROR {
            return Err(Error::Invalid);
        }

        let this = NonNull::from(self);

        let prev = critical_section(|_cs| {
            let st = unsafe { state_of(this.as_ptr()) };
            let prev = st.ceiling;
            st.ceiling = ceiling;
            if let Some(owner) = st.owner {
                unsafe { refresh_effective_prio(owner) };
            }
            prev
        });

        sched::reschedule();
        Ok(prev)
    }

    /// Reinitialise the mutex.
    ///
    /// Any owner loses it, every waiter fails with `NotRecoverable` and
    /// the consistency state is cleared.
    pub fn reset(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        let this = NonNull::from(self);

        critical_section(|_cs| {
            let st = unsafe { state_of(this.as_ptr()) };

            if let Some(owner) = st.owner.take() {
                unsafe {
                    unlink_owned(owner, this);
                    refresh_effective_prio(owner);
                }
            }
            st.count = 0;
            st.consistency = Consistency::Consistent;
            unsafe { waitlist::unpark_all(&mut st.waiters, Err(Error::NotRecoverable)) };
            Ok(())
        })?;

        sched::reschedule();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_recursion_count(&self) -> u16 {
        critical_section(|_cs| unsafe { state_of(NonNull::from(self).as_ptr()) }.count)
    }
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

// ============ Internal machinery ============

/// # Safety
/// Caller holds a critical section.
unsafe fn state_of(mutex: *const Mutex) -> &'static mut MutexState {
    unsafe { &mut *(*mutex).state.as_ptr() }
}

/// Hand ownership to `thread` and track it on its held-mutex list.
///
/// # Safety
/// Caller holds a critical section; the mutex is unowned.
unsafe fn acquire(st: &mut MutexState, mutex: NonNull<Mutex>, thread: NonNull<Thread>) {
    let t = unsafe { &mut *thread.as_ptr() };

    st.owner = Some(thread);
    st.count = 1;
    st.next_owned = t.mutex_head;
    t.mutex_head = mutex.as_ptr().cast();

    if st.protocol != Protocol::None {
        unsafe { refresh_effective_prio(thread) };
    }
}

/// Remove a mutex from a thread's held-mutex list.
///
/// # Safety
/// Caller holds a critical section.
unsafe fn unlink_owned(thread: NonNull<Thread>, mutex: NonNull<Mutex>) {
    let t = unsafe { &mut *thread.as_ptr() };
    let target: *const () = mutex.as_ptr().cast();

    let mut link = &mut t.mutex_head;
    while !link.is_null() {
        let m = (*link) as *const Mutex;
        let st = unsafe { state_of(m) };
        if *link == target {
            *link = st.next_owned;
            st.next_owned = core::ptr::null();
            return;
        }
        link = &mut st.next_owned;
    }
}

/// Recompute a thread's effective priority from its base priority and
/// held mutexes, then walk the inheritance chain while the thread is
/// itself blocked on an inherit-mutex.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn refresh_effective_prio(thread: NonNull<Thread>) {
    let mut next = Some(thread);
    let mut depth = 0;

    while let Some(th) = next {
        depth += 1;
        if depth > priority::LEVELS {
            break;
        }

        let t = unsafe { &mut *th.as_ptr() };
        let mut eff = t.base_prio;

        let mut m = t.mutex_head as *const Mutex;
        while !m.is_null() {
            let st = unsafe { state_of(m) };
            match st.protocol {
                Protocol::Protect => eff = eff.max(st.ceiling),
                Protocol::Inherit => {
                    if let Some(w) = st.waiters.head() {
                        eff = eff.max(unsafe { w.as_ref().prio });
                    }
                }
                Protocol::None => {}
            }
            m = st.next_owned as *const Mutex;
        }

        unsafe { thread::apply_effective_prio(th, eff) };

        next = if t.state == ThreadState::Waiting && t.wait_kind == WaitKind::Mutex {
            let m = t.wait_obj as *const Mutex;
            if m.is_null() {
                None
            } else {
                let st = unsafe { state_of(m) };
                if st.protocol == Protocol::Inherit {
                    st.owner
                } else {
                    None
                }
            }
        } else {
            None
        };
    }
}

/// A waiter left a contended mutex (timeout or interruption); the
/// owner's inherited priority may deflate.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn waiter_left(obj: *const ()) {
    let m = obj as *const Mutex;
    if m.is_null() {
        return;
    }
    let st = unsafe { state_of(m) };
    if st.protocol == Protocol::Inherit {
        if let Some(owner) = st.owner {
            unsafe { refresh_effective_prio(owner) };
        }
    }
}

/// Called when a thread terminates still holding mutexes.
///
/// Robust mutexes become inconsistent and pass to their next waiter
/// with `OwnerDead`; stalled mutexes are left as POSIX leaves them.
///
/// # Safety
/// Caller holds a critical section.
pub(crate) unsafe fn release_owned_on_death(thread: NonNull<Thread>) {
    let t = unsafe { &mut *thread.as_ptr() };

    let mut m = t.mutex_head as *const Mutex;
    let mut kept: *const () = core::ptr::null();

    while !m.is_null() {
        let st = unsafe { state_of(m) };
        let next = st.next_owned as *const Mutex;

        if st.robustness == Robustness::Robust {
            st.next_owned = core::ptr::null();
            st.count = 0;
            st.consistency = Consistency::Inconsistent;

            match st.waiters.head() {
                Some(w) => unsafe {
                    waitlist::unpark(w, Err(Error::OwnerDead));
                    acquire(st, NonNull::new_unchecked(m.cast_mut()), w);
                },
                None => st.owner = None,
            }
        } else {
            // Stalled: the lock stays wedged on the dead owner.
            st.next_owned = kept;
            kept = m.cast();
        }

        m = next;
    }

    t.mutex_head = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtos::critical::critical_section;
    use crate::rtos::types::ThreadState;

    // One test body: these tests impersonate the running thread through
    // process-wide state, which must not race other tests.
    #[test]
    fn mutex_state_machine() {
        static mut TA: Thread = Thread::new();
        static mut TB: Thread = Thread::new();
        static mut TH: Thread = Thread::new();

        let a = &raw mut TA;
        let b = &raw mut TB;
        let h = &raw mut TH;

        unsafe {
            (*a).prio = 3;
            (*a).base_prio = 3;
            (*a).state = ThreadState::Inactive;
            (*b).prio = 4;
            (*b).base_prio = 4;
            (*b).state = ThreadState::Inactive;
        }

        kernel::test_force_started(true);
        unsafe { kernel::test_set_current(a) };

        // Recursive: count nests and only the last unlock releases.
        let mr = Mutex::with_attributes("r", &Attributes::recursive());
        assert_eq!(mr.lock(), Ok(()));
        assert_eq!(mr.lock(), Ok(()));
        assert_eq!(mr.test_recursion_count(), 2);
        assert_eq!(mr.unlock(), Ok(()));
        assert!(mr.owner().is_some());
        assert_eq!(mr.unlock(), Ok(()));
        assert!(mr.owner().is_none());
        assert_eq!(mr.test_recursion_count(), 0);

        // Errorcheck: self-relock reports deadlock at once.
        let me = Mutex::with_attributes("e", &Attributes::errorcheck());
        assert_eq!(me.lock(), Ok(()));
        assert_eq!(me.lock(), Err(Error::Deadlock));

        // Non-owner unlock and contended try_lock.
        unsafe { kernel::test_set_current(b) };
        assert_eq!(me.unlock(), Err(Error::NotPermitted));
        assert_eq!(me.try_lock(), Err(Error::Busy));
        unsafe { kernel::test_set_current(a) };
        assert_eq!(me.unlock(), Ok(()));

        // Protect: the owner runs at the ceiling, and a thread whose
        // base priority exceeds the ceiling may not lock at all.
        let mp = Mutex::with_attributes(
            "p",
            &Attributes::normal().with_protocol(Protocol::Protect).with_ceiling(5),
        );
        assert_eq!(mp.lock(), Ok(()));
        assert_eq!(unsafe { (*a).prio }, 5);
        assert_eq!(mp.unlock(), Ok(()));
        assert_eq!(unsafe { (*a).prio }, 3);

        unsafe { (*a).base_prio = 8 };
        assert_eq!(mp.lock(), Err(Error::Invalid));
        unsafe { (*a).base_prio = 3 };

        // Inherit: a high-priority waiter boosts the owner; the boost
        // drops when the waiter leaves.
        let mi = Mutex::with_attributes(
            "i",
            &Attributes::normal().with_protocol(Protocol::Inherit),
        );
        assert_eq!(mi.lock(), Ok(()));
        unsafe {
            (*h).prio = 10;
            (*h).base_prio = 10;
            (*h).state = ThreadState::Waiting;
            (*h).wait_kind = WaitKind::Mutex;
            (*h).wait_obj = (&mi as *const Mutex).cast();
        }

        critical_section(|_cs| unsafe {
            let st = state_of(&mi);
            st.waiters.insert(NonNull::new_unchecked(h));
            refresh_effective_prio(NonNull::new_unchecked(a));
            assert_eq!((*a).prio, 10);

            st.waiters.remove(NonNull::new_unchecked(h));
            waiter_left((&mi as *const Mutex).cast());
            assert_eq!((*a).prio, 3);
        });

        unsafe {
            (*h).state = ThreadState::Undefined;
            (*h).wait_kind = WaitKind::None;
            (*h).wait_obj = core::ptr::null();
        }
        assert_eq!(mi.unlock(), Ok(()));

        // Robust: owner death is observable; unlocking while still
        // inconsistent finishes the mutex for good.
        let mx = Mutex::with_attributes(
            "x",
            &Attributes::normal().with_robustness(Robustness::Robust),
        );
        assert_eq!(mx.lock(), Ok(()));
        critical_section(|_cs| unsafe { release_owned_on_death(NonNull::new_unchecked(a)) });
        unsafe { kernel::test_set_current(b) };
        assert_eq!(mx.lock(), Err(Error::OwnerDead));
        assert_eq!(mx.unlock(), Ok(()));
        assert_eq!(mx.lock(), Err(Error::NotRecoverable));
        assert_eq!(mx.reset(), Ok(()));
        assert_eq!(mx.lock(), Ok(()));
        assert_eq!(mx.unlock(), Ok(()));

        // Robust recovery: marking consistent before unlock heals it.
        unsafe { kernel::test_set_current(a) };
        let my = Mutex::with_attributes(
            "y",
            &Attributes::normal().with_robustness(Robustness::Robust),
        );
        assert_eq!(my.lock(), Ok(()));
        critical_section(|_cs| unsafe { release_owned_on_death(NonNull::new_unchecked(a)) });
        unsafe { kernel::test_set_current(b) };
        assert_eq!(my.lock(), Err(Error::OwnerDead));
        assert_eq!(my.consistent(), Ok(()));
        assert_eq!(my.unlock(), Ok(()));
        assert_eq!(my.lock(), Ok(()));
        assert_eq!(my.unlock(), Ok(()));

        unsafe { kernel::test_set_current(core::ptr::null_mut()) };
        kernel::test_force_started(false);
    }
}
