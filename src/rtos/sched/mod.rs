//! Scheduler module
//!
//! Fixed-priority preemptive scheduling with FIFO order inside a level
//! and an explicit yield for cooperative rotation.

mod prio;
mod ready_list;

pub use prio::PrioTable;
pub use ready_list::ReadyList;

use core::ptr::NonNull;

use crate::rtos::critical::{critical_section, is_isr_context, CriticalSection};
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::thread::Thread;
use crate::rtos::types::Priority;

/// Main scheduling point
///
/// Determines the highest-priority ready thread and requests a context
/// switch when it differs from the current one. Called after every
/// operation that may have changed readiness: an unpark, a post, a
/// priority change, an expiring timeout.
///
/// Inside an ISR this is a no-op; the switch decision is made once, on
/// interrupt exit. While the scheduler is locked switches stay deferred.
pub fn reschedule() {
    if !kernel::is_started() {
        return;
    }

    if is_isr_context() {
        return;
    }

    if kernel::is_locked() {
        return;
    }

    let _cs = CriticalSection::enter();

    let high_prio = unsafe { kernel::prio_table().highest() };

    unsafe {
        if let Some(next) = kernel::ready_list(high_prio).head() {
            if Some(next) != kernel::current_thread() {
                kernel::set_next_thread(next);
                kernel::note_context_switch();
                crate::port::ctx_sw();
            }
        }
    }
}

/// Yield the CPU to the next ready thread of the same priority.
///
/// The calling thread is rotated to the tail of its level; with no other
/// thread at this level the call is a cheap no-op.
pub fn yield_now() -> Result<()> {
    if is_isr_context() {
        return Err(Error::NotPermitted);
    }

    if !kernel::is_started() {
        return Err(Error::NotPermitted);
    }

    critical_section(|_cs| {
        unsafe {
            if let Some(cur) = kernel::current_thread() {
                let prio = cur.as_ref().prio;
                let list = kernel::ready_list(prio);

                if list.head() != list.tail() {
                    list.remove(cur);
                    list.insert_tail(cur);
                }
            }
        }
    });

    reschedule();
    Ok(())
}

/// Make a thread ready.
///
/// # Safety
/// Caller holds a critical section; the thread is not on any ready list.
pub(crate) unsafe fn rdy_insert(thread: NonNull<Thread>) {
    let prio = unsafe { thread.as_ref().prio };

    unsafe {
        kernel::ready_list(prio).insert_tail(thread);
        kernel::prio_table().insert(prio);
    }
}

/// Remove a thread from the ready queue.
///
/// # Safety
/// Caller holds a critical section; the thread is on its priority's list.
pub(crate) unsafe fn rdy_remove(thread: NonNull<Thread>) {
    let prio = unsafe { thread.as_ref().prio };

    unsafe {
        let list = kernel::ready_list(prio);
        list.remove(thread);

        if list.is_empty() {
            kernel::prio_table().remove(prio);
        }
    }
}

/// Move a ready thread to a different priority level.
///
/// The running thread enters its new level at the head, so a priority
/// boost never hands the CPU to an equal-priority peer.
///
/// # Safety
/// Caller holds a critical section; the thread is on its priority's list.
pub(crate) unsafe fn rdy_change_prio(thread: NonNull<Thread>, new_prio: Priority) {
    let t = unsafe { &mut *thread.as_ptr() };
    let old_prio = t.prio;

    if old_prio == new_prio {
        return;
    }

    unsafe {
        let old_list = kernel::ready_list(old_prio);
        old_list.remove(thread);
        if old_list.is_empty() {
            kernel::prio_table().remove(old_prio);
        }
    }

    t.prio = new_prio;

    unsafe {
        let new_list = kernel::ready_list(new_prio);
        if Some(thread) == kernel::current_thread() {
            new_list.insert_head(thread);
        } else {
            new_list.insert_tail(thread);
        }
        kernel::prio_table().insert(new_prio);
    }
}
