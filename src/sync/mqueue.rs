//! Message queue
//!
//! Fixed-size message slots carried in a caller-supplied (or arena)
//! region. Delivery order is message priority first, arrival order
//! within a priority. Senders block on a full queue, receivers on an
//! empty one; where a peer is already parked the payload is handed over
//! directly. `try_send` is the one flavour ISRs may call.

use core::ptr::NonNull;

use crate::rtos::arena;
use crate::rtos::critical::{critical_section, is_isr_context};
use crate::rtos::cs_cell::CsCell;
use crate::rtos::error::{Error, Result};
use crate::rtos::kernel;
use crate::rtos::sched;
use crate::rtos::types::{MsgPrio, Ticks, WaitKind};
use crate::rtos::waitlist::{self, WaitList};

const ALIGN: usize = 8;

#[repr(C)]
struct MsgSlot {
    next: Option<NonNull<MsgSlot>>,
    prev: Option<NonNull<MsgSlot>>,
    len: usize,
    prio: MsgPrio,
}

const fn header_bytes() -> usize {
    (core::mem::size_of::<MsgSlot>() + ALIGN - 1) & !(ALIGN - 1)
}

const fn slot_stride(msg_size: usize) -> usize {
    header_bytes() + ((msg_size + ALIGN - 1) & !(ALIGN - 1))
}

unsafe fn payload(slot: NonNull<MsgSlot>) -> *mut u8 {
    unsafe { slot.as_ptr().cast::<u8>().add(header_bytes()) }
}

struct MqState {
    storage: *mut u8,
    storage_bytes: usize,
    storage_owned: bool,
    msgs: usize,
    msg_size: usize,
    count: usize,
    /// LIFO of unused slots.
    free: Option<NonNull<MsgSlot>>,
    /// Enqueued messages, (priority DESC, arrival ASC).
    ready_head: Option<NonNull<MsgSlot>>,
    ready_tail: Option<NonNull<MsgSlot>>,
    senders: WaitList,
    receivers: WaitList,
}

unsafe impl Send for MqState {}

/// Priority message queue
pub struct MessageQueue {
    name: &'static str,
    state: CsCell<MqState>,
}

impl MessageQueue {
    /// Bytes of backing storage needed for `msgs` messages of
    /// `msg_size` bytes.
    pub const fn storage_bytes(msgs: usize, msg_size: usize) -> usize {
        msgs * slot_stride(msg_size)
    }

    pub const fn new(name: &'static str) -> Self {
        MessageQueue {
            name,
            state: CsCell::new(MqState {
                storage: core::ptr::null_mut(),
                storage_bytes: 0,
                storage_owned: false,
                msgs: 0,
                msg_size: 0,
                count: 0,
                free: None,
                ready_head: None,
                ready_tail: None,
                senders: WaitList::new(),
                receivers: WaitList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size the queue and attach its storage.
    ///
    /// `storage` must hold [`storage_bytes`](Self::storage_bytes) and be
    /// 8-byte aligned; passing `None` takes a region from the kernel
    /// arena instead.
    pub fn create(
        &self,
        msgs: usize,
        msg_size: usize,
        storage: Option<&'static mut [u8]>,
    ) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if msgs == 0 || msg_size == 0 {
            return Err(Error::Invalid);
        }

        let need = Self::storage_bytes(msgs, msg_size);

        critical_section(|cs| {
            let st = self.state.get(cs);
            if !st.storage.is_null() {
                return Err(Error::Invalid);
            }

            let (base, owned) = match storage {
                Some(region) => {
                    if region.len() < need || region.as_ptr() as usize % ALIGN != 0 {
                        return Err(Error::Invalid);
                    }
                    (region.as_mut_ptr(), false)
                }
                None => (arena::alloc(cs, need)?.as_ptr(), true),
            };

            st.storage = base;
            st.storage_bytes = need;
            st.storage_owned = owned;
            st.msgs = msgs;
            st.msg_size = msg_size;
            st.count = 0;
            build_free_list(st);
            Ok(())
        })
    }

    /// Enqueue a message, blocking while the queue is full.
    pub fn send(&self, msg: &[u8], mprio: MsgPrio) -> Result<()> {
        self.send_common(msg, mprio, None, true)
    }

    /// Enqueue without blocking; `Err(Again)` when full. ISR-safe.
    pub fn try_send(&self, msg: &[u8], mprio: MsgPrio) -> Result<()> {
        self.send_common(msg, mprio, None, false)
    }

    /// Enqueue with a deadline.
    pub fn timed_send(&self, msg: &[u8], mprio: MsgPrio, ticks: Ticks) -> Result<()> {
        self.send_common(msg, mprio, Some(ticks), true)
    }

    /// Dequeue the highest-priority oldest message, blocking while the
    /// queue is empty. Returns the message length and priority.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, MsgPrio)> {
        self.receive_common(buf, None, true)
    }

    /// Dequeue without blocking; `Err(Again)` when empty.
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<(usize, MsgPrio)> {
        self.receive_common(buf, None, false)
    }

    /// Dequeue with a deadline.
    pub fn timed_receive(&self, buf: &mut [u8], ticks: Ticks) -> Result<(usize, MsgPrio)> {
        self.receive_common(buf, Some(ticks), true)
    }

    fn send_common(
        &self,
        msg: &[u8],
        mprio: MsgPrio,
        timeout: Option<Ticks>,
        block: bool,
    ) -> Result<()> {
        if block {
            waitlist::blocking_allowed()?;
        }

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|cs| {
            let st = self.state.get(cs);

            if st.storage.is_null() {
                return Some(Err(Error::Invalid));
            }
            if msg.len() > st.msg_size {
                return Some(Err(Error::MsgSize));
            }

            // A parked receiver takes the payload without a slot.
            if let Some(r) = st.receivers.head() {
                let t = unsafe { &mut *r.as_ptr() };
                unsafe {
                    core::ptr::copy_nonoverlapping(msg.as_ptr(), t.msg_ptr, msg.len());
                }
                t.msg_size = msg.len();
                t.msg_prio = mprio;
                unsafe { waitlist::unpark(r, Ok(())) };
                return Some(Ok(()));
            }

            if let Some(slot) = pop_free(st) {
                unsafe {
                    core::ptr::copy_nonoverlapping(msg.as_ptr(), payload(slot), msg.len());
                    (*slot.as_ptr()).len = msg.len();
                    (*slot.as_ptr()).prio = mprio;
                }
                ready_insert(st, slot);
                st.count += 1;
                return Some(Ok(()));
            }

            if !block {
                return Some(Err(Error::Again));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            let cur = match kernel::current_thread() {
                Some(c) => c,
                None => return Some(Err(Error::NotPermitted)),
            };
            unsafe {
                let t = &mut *cur.as_ptr();
                t.msg_ptr = msg.as_ptr().cast_mut();
                t.msg_size = msg.len();
                t.msg_prio = mprio;

                waitlist::park_current(
                    Some(&mut st.senders),
                    WaitKind::QueueSend,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            None
        });

        let result = match step {
            Some(r) => r,
            // The message was taken while we were parked.
            None => waitlist::finish_wait(),
        };

        if result.is_ok() {
            sched::reschedule();
        }
        result
    }

    fn receive_common(
        &self,
        buf: &mut [u8],
        timeout: Option<Ticks>,
        block: bool,
    ) -> Result<(usize, MsgPrio)> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }
        if block {
            waitlist::blocking_allowed()?;
        }

        let this = NonNull::from(self);
        let deadline = waitlist::deadline_after(timeout);

        let step = critical_section(|cs| {
            let st = self.state.get(cs);

            if st.storage.is_null() {
                return Some(Err(Error::Invalid));
            }
            if buf.len() < st.msg_size {
                return Some(Err(Error::MsgSize));
            }

            if let Some(slot) = pop_ready(st) {
                let (len, prio) = unsafe { ((*slot.as_ptr()).len, (*slot.as_ptr()).prio) };
                if len > st.msg_size {
                    push_free(st, slot);
                    st.count -= 1;
                    return Some(Err(Error::BadMsg));
                }
                unsafe {
                    core::ptr::copy_nonoverlapping(payload(slot), buf.as_mut_ptr(), len);
                }

                // Refill the freed slot from the longest-waiting sender.
                if let Some(s) = st.senders.head() {
                    let t = unsafe { &mut *s.as_ptr() };
                    unsafe {
                        core::ptr::copy_nonoverlapping(t.msg_ptr, payload(slot), t.msg_size);
                        (*slot.as_ptr()).len = t.msg_size;
                        (*slot.as_ptr()).prio = t.msg_prio;
                    }
                    ready_insert(st, slot);
                    unsafe { waitlist::unpark(s, Ok(())) };
                } else {
                    push_free(st, slot);
                    st.count -= 1;
                }

                return Some(Ok((len, prio)));
            }

            if !block {
                return Some(Err(Error::Again));
            }

            if waitlist::deadline_elapsed(deadline) {
                return Some(Err(Error::TimedOut));
            }

            let cur = match kernel::current_thread() {
                Some(c) => c,
                None => return Some(Err(Error::NotPermitted)),
            };
            unsafe {
                let t = &mut *cur.as_ptr();
                t.msg_ptr = buf.as_mut_ptr();
                t.msg_size = buf.len();

                waitlist::park_current(
                    Some(&mut st.receivers),
                    WaitKind::QueueRecv,
                    this.as_ptr().cast(),
                    deadline,
                );
            }
            None
        });

        let result = match step {
            Some(r) => r,
            None => match waitlist::finish_wait() {
                Ok(()) => critical_section(|_cs| match kernel::current_thread() {
                    Some(cur) => {
                        let t = unsafe { cur.as_ref() };
                        Ok((t.msg_size, t.msg_prio))
                    }
                    None => Err(Error::NotPermitted),
                }),
                Err(e) => Err(e),
            },
        };

        if result.is_ok() {
            sched::reschedule();
        }
        result
    }

    /// Number of message slots.
    pub fn capacity(&self) -> usize {
        critical_section(|cs| self.state.get(cs).msgs)
    }

    /// Messages currently enqueued.
    pub fn length(&self) -> usize {
        critical_section(|cs| self.state.get(cs).count)
    }

    /// Fixed message payload size in bytes.
    pub fn msg_size(&self) -> usize {
        critical_section(|cs| self.state.get(cs).msg_size)
    }

    pub fn empty(&self) -> bool {
        self.length() == 0
    }

    pub fn full(&self) -> bool {
        critical_section(|cs| {
            let st = self.state.get(cs);
            st.msgs != 0 && st.count == st.msgs
        })
    }

    /// Discard every message and fail every parked thread with
    /// `NotRecoverable`; the queue is usable again immediately.
    pub fn reset(&self) -> Result<()> {
        if is_isr_context() {
            return Err(Error::NotPermitted);
        }

        critical_section(|cs| {
            let st = self.state.get(cs);
            if st.storage.is_null() {
                return Err(Error::Invalid);
            }

            st.count = 0;
            build_free_list(st);
            unsafe {
                waitlist::unpark_all(&mut st.senders, Err(Error::NotRecoverable));
                waitlist::unpark_all(&mut st.receivers, Err(Error::NotRecoverable));
            }
            Ok(())
        })?;

        sched::reschedule();
        Ok(())
    }
}

unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

// ============ Slot lists ============

fn build_free_list(st: &mut MqState) {
    st.free = None;
    st.ready_head = None;
    st.ready_tail = None;

    let stride = slot_stride(st.msg_size);
    for i in (0..st.msgs).rev() {
        let slot = unsafe { st.storage.add(i * stride) }.cast::<MsgSlot>();
        let slot = unsafe { NonNull::new_unchecked(slot) };
        unsafe {
            (*slot.as_ptr()).prev = None;
            (*slot.as_ptr()).len = 0;
            (*slot.as_ptr()).prio = 0;
            (*slot.as_ptr()).next = st.free;
        }
        st.free = Some(slot);
    }
}

fn pop_free(st: &mut MqState) -> Option<NonNull<MsgSlot>> {
    let slot = st.free?;
    st.free = unsafe { (*slot.as_ptr()).next };
    unsafe { (*slot.as_ptr()).next = None };
    Some(slot)
}

fn push_free(st: &mut MqState, slot: NonNull<MsgSlot>) {
    unsafe {
        (*slot.as_ptr()).prev = None;
        (*slot.as_ptr()).next = st.free;
    }
    st.free = Some(slot);
}

/// Insert keeping (priority DESC, arrival ASC).
fn ready_insert(st: &mut MqState, slot: NonNull<MsgSlot>) {
    let prio = unsafe { (*slot.as_ptr()).prio };

    let mut prev: Option<NonNull<MsgSlot>> = None;
    let mut cur = st.ready_head;
    while let Some(c) = cur {
        if prio > unsafe { (*c.as_ptr()).prio } {
            break;
        }
        prev = cur;
        cur = unsafe { (*c.as_ptr()).next };
    }

    unsafe {
        (*slot.as_ptr()).prev = prev;
        (*slot.as_ptr()).next = cur;
    }

    match prev {
        Some(p) => unsafe { (*p.as_ptr()).next = Some(slot) },
        None => st.ready_head = Some(slot),
    }
    match cur {
        Some(c) => unsafe { (*c.as_ptr()).prev = Some(slot) },
        None => st.ready_tail = Some(slot),
    }
}

fn pop_ready(st: &mut MqState) -> Option<NonNull<MsgSlot>> {
    let slot = st.ready_head?;
    let next = unsafe { (*slot.as_ptr()).next };

    st.ready_head = next;
    match next {
        Some(n) => unsafe { (*n.as_ptr()).prev = None },
        None => st.ready_tail = None,
    }

    unsafe {
        (*slot.as_ptr()).next = None;
        (*slot.as_ptr()).prev = None;
    }
    Some(slot)
}
