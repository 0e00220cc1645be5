//! Producer-consumer over a priority message queue

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod app {
    use cortex_m_rt::entry;
    use defmt::info;

    use osplus::thread::{self, Attributes, Thread};
    use osplus::types::priority;
    use osplus::{sysclock, MessageQueue};

    static QUEUE: MessageQueue = MessageQueue::new("events");

    static mut PRODUCER: Thread = Thread::new();
    static mut CONSUMER: Thread = Thread::new();

    fn producer_entry(_: *mut ()) -> *mut () {
        let mut n: u32 = 0;
        loop {
            n += 1;
            let prio = (n % 4) as u8;
            let _ = QUEUE.send(&n.to_le_bytes(), prio);
            info!("[P] sent #{} prio {}", n, prio);
            let _ = sysclock::sleep_for(200);
        }
    }

    fn consumer_entry(_: *mut ()) -> *mut () {
        let mut buf = [0u8; 4];
        loop {
            if let Ok((_, prio)) = QUEUE.receive(&mut buf) {
                let n = u32::from_le_bytes(buf);
                info!("[C] got #{} prio {}", n, prio);
            }
        }
    }

    fn main_entry(_: *mut ()) -> *mut () {
        QUEUE.create(8, 4, None).expect("queue storage");

        unsafe {
            thread::create(
                &mut *(&raw mut PRODUCER),
                "producer",
                producer_entry,
                core::ptr::null_mut(),
                &Attributes::new().with_priority(priority::NORMAL),
            )
            .unwrap();
            thread::create(
                &mut *(&raw mut CONSUMER),
                "consumer",
                consumer_entry,
                core::ptr::null_mut(),
                &Attributes::new().with_priority(priority::ABOVE_NORMAL),
            )
            .unwrap();
        }

        core::ptr::null_mut()
    }

    #[entry]
    fn main() -> ! {
        info!("producer-consumer demo");

        osplus::scheduler::initialize().expect("kernel init");
        let _ = osplus::scheduler::start(main_entry, core::ptr::null_mut());

        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
