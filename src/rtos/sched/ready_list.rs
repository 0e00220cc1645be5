//! Ready list - doubly linked list of threads at one priority level
//!
//! Each priority level has its own list. Threads are appended at the
//! tail and scheduled from the head, giving FIFO order within a level.

use core::ptr::NonNull;

use crate::rtos::thread::Thread;

/// Ready list for a single priority level
pub struct ReadyList {
    head: Option<NonNull<Thread>>,
    tail: Option<NonNull<Thread>>,
}

impl ReadyList {
    pub const fn new() -> Self {
        ReadyList {
            head: None,
            tail: None,
        }
    }

    pub fn init(&mut self) {
        self.head = None;
        self.tail = None;
    }

    /// First thread to be scheduled at this level.
    #[inline]
    pub fn head(&self) -> Option<NonNull<Thread>> {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> Option<NonNull<Thread>> {
        self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a thread (FIFO order).
    ///
    /// Caller must hold a critical section and guarantee the thread is
    /// not already on any ready list.
    pub fn insert_tail(&mut self, thread: NonNull<Thread>) {
        let t = unsafe { &mut *thread.as_ptr() };

        t.ready_next = None;
        t.ready_prev = self.tail;

        match self.tail {
            Some(tail) => {
                unsafe { (*tail.as_ptr()).ready_next = Some(thread) };
            }
            None => {
                self.head = Some(thread);
            }
        }

        self.tail = Some(thread);
    }

    /// Prepend a thread, making it run next at this level.
    pub fn insert_head(&mut self, thread: NonNull<Thread>) {
        let t = unsafe { &mut *thread.as_ptr() };

        t.ready_prev = None;
        t.ready_next = self.head;

        match self.head {
            Some(head) => {
                unsafe { (*head.as_ptr()).ready_prev = Some(thread) };
            }
            None => {
                self.tail = Some(thread);
            }
        }

        self.head = Some(thread);
    }

    /// Unlink a thread from this list.
    pub fn remove(&mut self, thread: NonNull<Thread>) {
        let t = unsafe { &mut *thread.as_ptr() };

        match t.ready_prev {
            Some(prev) => {
                unsafe { (*prev.as_ptr()).ready_next = t.ready_next };
            }
            None => {
                self.head = t.ready_next;
            }
        }

        match t.ready_next {
            Some(next) => {
                unsafe { (*next.as_ptr()).ready_prev = t.ready_prev };
            }
            None => {
                self.tail = t.ready_prev;
            }
        }

        t.ready_prev = None;
        t.ready_next = None;
    }
}

impl Default for ReadyList {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: only modified within critical sections.
unsafe impl Send for ReadyList {}
unsafe impl Sync for ReadyList {}
