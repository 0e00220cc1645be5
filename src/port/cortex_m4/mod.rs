//! Cortex-M4 port
//!
//! Context switching rides on the PendSV exception: the switch request
//! only pends the exception, the processor tail-chains it after the
//! current ISR (or as soon as interrupts re-enable), and the handler
//! saves the outgoing context on the outgoing thread's process stack.

#![allow(named_asm_labels)]

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;

use crate::rtos::thread::Thread;
use crate::rtos::types::{StackElement, ThreadState};

/// Interrupt stack for MSP
#[no_mangle]
static mut INTERRUPT_STACK: [u64; 256] = [0xDEADBEEF_DEADBEEF; 256];

/// Configure the SysTick timer.
///
/// `reload` is core-clock cycles per kernel tick.
pub fn systick_init(reload: u32) {
    let mut p = unsafe { cortex_m::Peripherals::steal() };

    p.SYST.set_reload(reload - 1);
    p.SYST.clear_current();
    p.SYST.set_clock_source(SystClkSource::Core);
    p.SYST.enable_interrupt();
    p.SYST.enable_counter();
}

/// Switch to the first thread; never returns.
///
/// # Safety
/// The scheduler must be fully initialised with a next thread selected.
#[no_mangle]
#[allow(static_mut_refs)]
pub unsafe fn start_first_thread() {
    unsafe {
        let mut scb = cortex_m::Peripherals::steal().SCB;

        // PendSV and SysTick at the lowest exception priority.
        scb.set_priority(SystemHandler::PendSV, 0xF0);
        scb.set_priority(SystemHandler::SysTick, 0xF0);

        // Dedicated interrupt stack on MSP; threads run on PSP.
        let msp_top = &INTERRUPT_STACK as *const _ as u32
            + core::mem::size_of_val(&INTERRUPT_STACK) as u32;

        asm!("msr msp, {0}", in(reg) msp_top);
        asm!("msr psp, {0}", in(reg) 0);

        crate::rtos::kernel::CPU_STATE.current = core::ptr::null_mut();

        cortex_m::interrupt::enable();
        cortex_m::peripheral::SCB::set_pendsv();
    }

    loop {
        cortex_m::asm::wfi();
    }
}

/// Request a context switch from thread level.
#[inline(always)]
pub fn ctx_sw() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Request a context switch from interrupt level.
#[inline(always)]
pub fn int_ctx_sw() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Context stored on the thread stack around a switch
#[repr(C, align(4))]
struct SwitchFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

const FRAME_WORDS: usize = 17;

/// Build the initial context for a new thread.
///
/// The frame enters [`thread_invoke`], which runs the entry function
/// and terminates the thread with its return value.
///
/// # Safety
/// `stk_base` must point to `stk_size` writable, unused stack elements.
pub unsafe fn stack_init(
    thread: *mut Thread,
    stk_base: *mut StackElement,
    stk_size: usize,
) -> *mut StackElement {
    unsafe {
        let stk_top = stk_base.add(stk_size);
        let stk_aligned = ((stk_top as usize) & !7) as *mut u32;

        let frame_ptr = stk_aligned.sub(FRAME_WORDS) as *mut SwitchFrame;

        (*frame_ptr) = SwitchFrame {
            r4: 0x0404_0404,
            r5: 0x0505_0505,
            r6: 0x0606_0606,
            r7: 0x0707_0707,
            r8: 0x0808_0808,
            r9: 0x0909_0909,
            r10: 0x1010_1010,
            r11: 0x1111_1111,
            exc_return: 0xFFFF_FFFD,
            r0: thread as u32,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: thread_return as *const () as u32,
            pc: (crate::rtos::thread::thread_invoke as usize as u32) | 1,
            xpsr: 0x0100_0000,
        };

        // One word below the frame to match PendSV's "add r0, r0, #4".
        (frame_ptr as *mut u32).sub(1) as *mut StackElement
    }
}

/// Swap the current/next thread pointers; called from PendSV.
/// Returns the incoming thread's stack pointer.
#[inline(never)]
#[no_mangle]
unsafe extern "C" fn pendsv_switch_context(cur_sp: *mut u32) -> *mut u32 {
    unsafe {
        let outgoing = crate::rtos::kernel::CPU_STATE.current;

        if !outgoing.is_null() {
            (*outgoing).stack_ptr = cur_sp;
            if (*outgoing).state == ThreadState::Running {
                (*outgoing).state = ThreadState::Ready;
            }
        }

        let incoming = crate::rtos::kernel::CPU_STATE.next;
        crate::rtos::kernel::CPU_STATE.current = incoming;

        if incoming.is_null() {
            core::ptr::null_mut()
        } else {
            (*incoming).state = ThreadState::Running;
            (*incoming).stack_ptr
        }
    }
}

/// PendSV exception handler - performs the full context switch
///
/// 1. Save R4-R11, LR onto the outgoing thread's PSP (skipped for the
///    very first switch)
/// 2. Swap the kernel's thread pointers
/// 3. Restore R4-R11, LR from the incoming thread's stack
/// 4. Exception return
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    use crate::rtos::kernel::CPU_STATE;

    naked_asm!(
        "cpsid i",
        "dsb",
        "isb",

        "mrs r0, psp",

        "ldr r1, ={cpu_state}",
        "ldr r1, [r1]",
        "cbz r1, 1f",

        "stmdb r0!, {{r4-r11, lr}}",

        "sub r0, r0, #4",

        "1:",
        "bl pendsv_switch_context",

        "cbz r0, 2f",
        "add r0, r0, #4",
        "ldmia r0!, {{r4-r11, lr}}",

        "msr psp, r0",

        "2:",
        "cpsie i",
        "dsb",
        "isb",

        "bx lr",

        cpu_state = sym CPU_STATE,
    );
}

/// Landing pad if an entry function ever returns around the trampoline.
#[no_mangle]
fn thread_return() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}
