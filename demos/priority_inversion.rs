//! Priority inheritance keeping a low-priority owner off the floor
//!
//! L (low) holds an inherit-mutex while H (high) wants it; M (medium)
//! would starve L forever without the protocol. With inheritance L runs
//! at H's priority until it unlocks.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod app {
    use cortex_m_rt::entry;
    use defmt::info;

    use osplus::sync::mutex::{Attributes as MutexAttributes, Protocol};
    use osplus::thread::{self, Attributes, Thread};
    use osplus::types::priority;
    use osplus::{sysclock, Mutex};

    static LOCK: Mutex =
        Mutex::with_attributes("shared", &MutexAttributes::normal().with_protocol(Protocol::Inherit));

    static mut LOW: Thread = Thread::new();
    static mut MID: Thread = Thread::new();
    static mut HIGH: Thread = Thread::new();

    fn low_entry(_: *mut ()) -> *mut () {
        loop {
            let _ = LOCK.lock();
            info!("[L] holding at effective prio {}", thread::this_thread::thread().map(|t| t.priority()).unwrap_or(0));
            // Busy section long enough for H to contend.
            for _ in 0..50_000 {
                cortex_m::asm::nop();
            }
            let _ = LOCK.unlock();
            let _ = sysclock::sleep_for(50);
        }
    }

    fn mid_entry(_: *mut ()) -> *mut () {
        loop {
            for _ in 0..10_000 {
                cortex_m::asm::nop();
            }
            let _ = sysclock::sleep_for(10);
        }
    }

    fn high_entry(_: *mut ()) -> *mut () {
        loop {
            let _ = sysclock::sleep_for(20);
            let _ = LOCK.lock();
            info!("[H] acquired");
            let _ = LOCK.unlock();
        }
    }

    fn main_entry(_: *mut ()) -> *mut () {
        unsafe {
            thread::create(
                &mut *(&raw mut LOW),
                "low",
                low_entry,
                core::ptr::null_mut(),
                &Attributes::new().with_priority(priority::LOW),
            )
            .unwrap();
            thread::create(
                &mut *(&raw mut MID),
                "mid",
                mid_entry,
                core::ptr::null_mut(),
                &Attributes::new().with_priority(priority::NORMAL),
            )
            .unwrap();
            thread::create(
                &mut *(&raw mut HIGH),
                "high",
                high_entry,
                core::ptr::null_mut(),
                &Attributes::new().with_priority(priority::HIGH),
            )
            .unwrap();
        }

        core::ptr::null_mut()
    }

    #[entry]
    fn main() -> ! {
        info!("priority inversion demo");

        osplus::scheduler::initialize().expect("kernel init");
        let _ = osplus::scheduler::start(main_entry, core::ptr::null_mut());

        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
