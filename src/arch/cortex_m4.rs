//! # Cortex-M4 Port Layer
//!
//! Board-independent [`Platform`] for ARM Cortex-M4 parts.
//!
//! ## Time Base
//!
//! SysTick fires at `TICK_HZ` (1024 Hz) and bumps a free-running 32-bit tick
//! counter. The scheduler reads deltas of that counter; wraparound is
//! handled by wrapping subtraction, so the counter never needs resetting.
//!
//! ## Idle
//!
//! `idle(n)` sleeps with WFI until `n` ticks have passed or an ISR has raised
//! a preempt through [`platform_ot_preempt`](crate::kernel::platform_ot_preempt).
//! Every SysTick and every peripheral interrupt wakes the core, so the
//! loop re-checks both conditions after each wakeup.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: priority 0xFF (lowest), so it never delays radio or host-link ISRs
//!
//! ## Stack Swap (multi-context)
//!
//! Tasks owning a [`SavedStack`](crate::task::SavedStack) get PSP pointed at
//! their region while dispatched. An I/O interrupt arriving mid-task stacks
//! its frame there, so the task's locals survive an ISR that preempts a task
//! back into the scheduler.

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use portable_atomic::{AtomicU32, Ordering};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::PREEMPT;
use crate::scheduler::Platform;
#[cfg(feature = "multi-context")]
use crate::task::{SavedStack, TaskId};

/// Ticks since SysTick was started.
static TICKS: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Put SysTick at the lowest exception priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        core::ptr::write_volatile(shpr3, val | (0xFF << 24));
    }
}

/// Current tick count.
#[inline]
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: the scheduler time base.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    TICKS.fetch_add(1, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Scheduler platform backed by SysTick and WFI.
pub struct CortexM4Platform {
    syst: SYST,
    last: u32,
    wake_in: u32,
    #[cfg(feature = "multi-context")]
    outer_psp: Option<u32>,
}

impl CortexM4Platform {
    /// Take SysTick and start the tick.
    pub fn new(mut syst: SYST) -> Self {
        configure_systick(&mut syst);
        set_interrupt_priorities();
        Self {
            syst,
            last: ticks(),
            wake_in: 0,
            #[cfg(feature = "multi-context")]
            outer_psp: None,
        }
    }

    /// Give SysTick back, stopping the tick.
    pub fn free(mut self) -> SYST {
        self.syst.disable_interrupt();
        self.syst.disable_counter();
        self.syst
    }

    /// Ticks requested by the most recent `program_wakeup`.
    #[inline]
    pub fn wake_in(&self) -> u32 {
        self.wake_in
    }
}

impl Platform for CortexM4Platform {
    fn elapsed_ticks(&mut self) -> u32 {
        let now = ticks();
        let elapsed = now.wrapping_sub(self.last);
        self.last = now;
        elapsed
    }

    fn program_wakeup(&mut self, ticks: u32) {
        self.wake_in = ticks;
    }

    fn idle(&mut self, ticks: u32) {
        let start = self::ticks();
        while self::ticks().wrapping_sub(start) < ticks && !PREEMPT.is_pending() {
            cortex_m::asm::wfi();
        }
    }

    fn take_preempts(&mut self) -> u32 {
        PREEMPT.take()
    }

    #[cfg(feature = "multi-context")]
    fn switch_stack(&mut self, _task: TaskId, stack: &mut SavedStack) {
        let base = stack.words_mut().as_ptr() as u32;
        match self.outer_psp.take() {
            None => {
                // Swap in: PSP moves onto the task's saved stack pointer
                self.outer_psp = Some(cortex_m::register::psp::read());
                let sp = stack.sp_ptr() as u32;
                unsafe { cortex_m::register::psp::write(sp) };
            }
            Some(outer) => {
                // Swap out: remember where the task left PSP
                let psp = cortex_m::register::psp::read();
                let offset = (psp.wrapping_sub(base) / 4) as usize;
                stack.swap_sp(offset);
                unsafe { cortex_m::register::psp::write(outer) };
            }
        }
    }
}
