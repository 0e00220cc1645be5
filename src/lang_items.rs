//! Language items and default exception handlers

// With the defmt feature on ARM targets, route logging through RTT and
// panics through probe-rs.
#[cfg(all(feature = "defmt", target_arch = "arm"))]
use defmt_rtt as _;

#[cfg(all(feature = "defmt", target_arch = "arm"))]
use panic_probe as _;

// Defmt panic handler
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[defmt::panic_handler]
fn defmt_panic() -> ! {
    cortex_m::asm::udf()
}

// Panic handler when defmt is disabled
#[cfg(all(not(feature = "defmt"), target_arch = "arm"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop { cortex_m::asm::udf(); }
}

// Default HardFault handler
#[cfg(target_arch = "arm")]
#[cortex_m_rt::exception]
unsafe fn HardFault(_ef: &cortex_m_rt::ExceptionFrame) -> ! {
    loop { cortex_m::asm::udf(); }
}

// Defmt timestamp: the system tick counter, truncated to 32 bits
#[cfg(all(feature = "defmt", target_arch = "arm"))]
defmt::timestamp!("{=u64}", crate::rtos::clock::sysclock::now());
