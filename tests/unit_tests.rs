//! Unit tests for the kernel's host-runnable surface
//!
//! These run on the build host against the stub port: data structures,
//! non-blocking operation flavours and the clock arithmetic. Scheduling
//! itself (preemption, context switches) only runs on the target.

#[cfg(test)]
mod error_tests {
    use osplus::error::Error;

    #[test]
    fn codes_are_posix_shaped() {
        assert_eq!(Error::NotPermitted.code(), 1);
        assert_eq!(Error::Interrupted.code(), 4);
        assert_eq!(Error::Again.code(), 11);
        assert_eq!(Error::Busy.code(), 16);
        assert_eq!(Error::Invalid.code(), 22);
        assert_eq!(Error::Deadlock.code(), 35);
        assert_eq!(Error::BadMsg.code(), 74);
        assert_eq!(Error::Overflow.code(), 75);
        assert_eq!(Error::MsgSize.code(), 90);
        assert_eq!(Error::TimedOut.code(), 110);
        assert_eq!(Error::OwnerDead.code(), 130);
        assert_eq!(Error::NotRecoverable.code(), 131);
    }

    #[test]
    fn errors_format() {
        let err = Error::OwnerDead;
        let _ = format!("{:?}", err);
    }
}

#[cfg(test)]
mod types_tests {
    use osplus::types::*;

    #[test]
    fn state_machine_values() {
        assert_eq!(ThreadState::Undefined as u8, 0);
        assert_eq!(ThreadState::Terminated as u8, 5);
        assert_ne!(ThreadState::Ready, ThreadState::Running);
    }

    #[test]
    fn reserved_priorities() {
        assert_eq!(priority::NONE, 0);
        assert_eq!(priority::IDLE, 1);
        assert!(priority::HIGHEST > priority::REALTIME);
        assert_eq!(priority::ERROR as usize, priority::LEVELS - 1);
    }

    #[test]
    fn flag_modes_combine() {
        let m = mode::ANY | mode::CLEAR;
        assert_ne!(m & mode::ANY, 0);
        assert_ne!(m & mode::CLEAR, 0);
        assert_eq!(m & mode::ALL, 0);
    }
}

#[cfg(test)]
mod clock_tests {
    use osplus::sysclock;

    #[test]
    fn ticks_cast_round_trip_never_undershoots() {
        let period_us = 1_000_000u64 / sysclock::FREQUENCY_HZ as u64;
        for us in [1u64, 2, 999, 1000, 1001, 2500, 3500, 99_999, 1_000_000] {
            let ticks = sysclock::ticks_cast(us) as u64;
            assert!(ticks * period_us >= us);
            // ...and stays within one tick of the exact value.
            assert!(ticks * period_us < us + period_us);
        }
    }
}

#[cfg(test)]
mod queue_tests {
    use osplus::error::Error;
    use osplus::MessageQueue;

    const MSGS: usize = 4;
    const MSG_SIZE: usize = 8;
    const WORDS: usize = MessageQueue::storage_bytes(MSGS, MSG_SIZE) / 8;

    fn storage() -> &'static mut [u8] {
        let v: &'static mut [u64] = Box::leak(vec![0u64; WORDS].into_boxed_slice());
        unsafe { core::slice::from_raw_parts_mut(v.as_mut_ptr().cast(), WORDS * 8) }
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let q = MessageQueue::new("q");
        q.create(MSGS, MSG_SIZE, Some(storage())).unwrap();

        // Priorities [3, 7, 5, 7] must come out [7, 7, 5, 3], the two
        // 7s in insertion order.
        q.try_send(b"first", 3).unwrap();
        q.try_send(b"second", 7).unwrap();
        q.try_send(b"third", 5).unwrap();
        q.try_send(b"fourth", 7).unwrap();

        assert!(q.full());
        assert_eq!(q.try_send(b"x", 1), Err(Error::Again));

        let mut buf = [0u8; MSG_SIZE];

        let (len, prio) = q.try_receive(&mut buf).unwrap();
        assert_eq!((&buf[..len], prio), (&b"second"[..], 7));

        let (len, prio) = q.try_receive(&mut buf).unwrap();
        assert_eq!((&buf[..len], prio), (&b"fourth"[..], 7));

        let (len, prio) = q.try_receive(&mut buf).unwrap();
        assert_eq!((&buf[..len], prio), (&b"third"[..], 5));

        let (len, prio) = q.try_receive(&mut buf).unwrap();
        assert_eq!((&buf[..len], prio), (&b"first"[..], 3));

        assert!(q.empty());
        assert_eq!(q.try_receive(&mut buf), Err(Error::Again));
    }

    #[test]
    fn length_checks() {
        let q = MessageQueue::new("q");
        q.create(MSGS, MSG_SIZE, Some(storage())).unwrap();

        // Oversized message.
        assert_eq!(q.try_send(b"123456789", 0), Err(Error::MsgSize));

        // Undersized receive buffer.
        q.try_send(b"ok", 0).unwrap();
        let mut small = [0u8; 4];
        assert_eq!(q.try_receive(&mut small), Err(Error::MsgSize));

        let mut buf = [0u8; MSG_SIZE];
        assert_eq!(q.try_receive(&mut buf), Ok((2, 0)));
    }

    #[test]
    fn reset_discards_messages() {
        let q = MessageQueue::new("q");
        q.create(MSGS, MSG_SIZE, Some(storage())).unwrap();

        q.try_send(b"a", 1).unwrap();
        q.try_send(b"b", 2).unwrap();
        assert_eq!(q.length(), 2);

        q.reset().unwrap();
        assert!(q.empty());
        assert_eq!(q.capacity(), MSGS);
        assert_eq!(q.msg_size(), MSG_SIZE);

        // Usable again after the reset.
        q.try_send(b"c", 1).unwrap();
        let mut buf = [0u8; MSG_SIZE];
        assert_eq!(q.try_receive(&mut buf), Ok((1, 1)));
    }

    #[test]
    fn create_validation() {
        let q = MessageQueue::new("q");
        assert_eq!(q.try_send(b"x", 0), Err(Error::Invalid));
        assert_eq!(q.create(0, MSG_SIZE, None), Err(Error::Invalid));

        let q2 = MessageQueue::new("q2");
        let short: &'static mut [u8] = Box::leak(vec![0u8; 8].into_boxed_slice());
        assert_eq!(q2.create(MSGS, MSG_SIZE, Some(short)), Err(Error::Invalid));
    }
}

#[cfg(test)]
mod sem_tests {
    use osplus::error::Error;
    use osplus::sync::semaphore::Attributes;
    use osplus::Semaphore;

    #[test]
    fn net_count_without_waiters() {
        // With no waiters a post strictly increments, capped at max.
        let sem = Semaphore::with_attributes("s", &Attributes::counting(0, 2));
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.post(), Err(Error::Overflow));
        assert_eq!(sem.value(), 2);

        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.value(), 1);
    }
}

#[cfg(test)]
mod condvar_tests {
    use osplus::ConditionVariable;

    #[test]
    fn signal_without_waiter_is_noop() {
        let cv = ConditionVariable::new("cv");
        assert_eq!(cv.signal(), Ok(()));
        assert_eq!(cv.broadcast(), Ok(()));
    }
}

#[cfg(test)]
mod kernel_tests {
    use osplus::error::Error;
    use osplus::rtos::kernel;
    use osplus::thread::{self, Attributes, Thread};
    use osplus::types::{mode, priority, ThreadState};
    use osplus::Timer;

    static mut WORKER: Thread = Thread::new();

    fn worker_entry(_: *mut ()) -> *mut () {
        core::ptr::null_mut()
    }

    fn main_entry(_: *mut ()) -> *mut () {
        core::ptr::null_mut()
    }

    fn timer_cb(_: *mut ()) {}

    // One test body: kernel bootstrap mutates process-wide state.
    #[test]
    fn bootstrap_and_thread_lifecycle() {
        kernel::initialize().unwrap();
        assert!(!kernel::is_started());

        // Reserved priorities are rejected.
        let worker = unsafe { &mut *(&raw mut WORKER) };
        let bad = Attributes::new().with_priority(priority::IDLE);
        assert_eq!(
            thread::create(worker, "w", worker_entry, core::ptr::null_mut(), &bad),
            Err(Error::Invalid)
        );

        // Default attributes take an arena stack and leave the thread
        // ready.
        let worker = unsafe { &mut *(&raw mut WORKER) };
        thread::create(worker, "w", worker_entry, core::ptr::null_mut(), &Attributes::new())
            .unwrap();

        let worker = unsafe { &*(&raw const WORKER) };
        assert_eq!(worker.state(), ThreadState::Ready);
        assert_eq!(worker.name(), "w");
        assert_eq!(thread::sched_prio(worker), priority::NORMAL);

        // The whole stack is still sentinel-filled minus the initial
        // context frame.
        let avail = thread::stack_available(worker);
        assert!(avail > 0);

        // Priority changes are validated and applied.
        assert_eq!(thread::set_sched_prio(worker, priority::ERROR), Err(Error::Invalid));
        thread::set_sched_prio(worker, priority::HIGH).unwrap();
        assert_eq!(thread::sched_prio(worker), priority::HIGH);

        // Signal flags accumulate, peek and clear.
        assert_eq!(thread::sig_raise(worker, 0), Err(Error::Invalid));
        assert_eq!(thread::sig_raise(worker, 0b0101), Ok(0));
        assert_eq!(thread::sig_raise(worker, 0b0010), Ok(0b0101));
        assert_eq!(thread::sig_get(worker, 0, 0), Ok(0b0111));
        assert_eq!(thread::sig_get(worker, 0b0001, mode::CLEAR), Ok(0b0001));
        assert_eq!(thread::sig_clear(worker, 0b0110), Ok(0b0110));
        assert_eq!(thread::sig_get(worker, 0, 0), Ok(0));

        // Scheduler lock nests by status restore.
        assert!(!osplus::scheduler::is_locked());
        let outer = osplus::scheduler::lock();
        let inner = osplus::scheduler::lock();
        assert!(inner);
        osplus::scheduler::unlock(inner);
        assert!(osplus::scheduler::is_locked());
        osplus::scheduler::unlock(outer);
        assert!(!osplus::scheduler::is_locked());

        // Timers arm and disarm against the clock schedule.
        static TIMER: Timer = Timer::new("t", timer_cb, core::ptr::null_mut());
        assert_eq!(TIMER.start(0), Err(Error::Invalid));
        assert_eq!(TIMER.start(10), Ok(()));
        assert_eq!(TIMER.stop(), Ok(()));
        assert_eq!(TIMER.stop(), Err(Error::Again));

        // Start brings up the main thread; on the stub port it returns.
        osplus::scheduler::start(main_entry, core::ptr::null_mut()).unwrap();
        assert!(kernel::is_started());

        // Handler-mode guard: thread creation is forbidden from ISRs.
        kernel::interrupts_enter();
        static mut ISR_THREAD: Thread = Thread::new();
        let isr_thread = unsafe { &mut *(&raw mut ISR_THREAD) };
        assert_eq!(
            thread::create(isr_thread, "i", worker_entry, core::ptr::null_mut(), &Attributes::new()),
            Err(Error::NotPermitted)
        );
        assert_eq!(osplus::scheduler::yield_now(), Err(Error::NotPermitted));
        kernel::interrupts_exit();

        assert_eq!(osplus::scheduler::yield_now(), Ok(()));
    }
}
