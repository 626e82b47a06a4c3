//! # otkern Configuration
//!
//! Compile-time constants governing the scheduler, the deferred-call queue
//! and the session stack. All tables are sized here; nothing is allocated at
//! runtime unless the `alloc` feature is enabled for System Queues.

/// Scheduler tick rate in Hz. One tick is 1/1024 s (a "ti").
pub const TICK_HZ: u32 = 1024;

/// log2 of the ti-per-sti ratio. One "sti" (short tick) is 32 ti.
pub const STI_SHIFT: u32 = 5;

/// Convert ti to sti, rounding down.
#[inline]
pub const fn ti_to_sti(ti: u32) -> u32 {
    ti >> STI_SHIFT
}

/// Convert sti to ti.
#[inline]
pub const fn sti_to_ti(sti: u32) -> u32 {
    sti << STI_SHIFT
}

/// Longest sleep a single scheduler pass may request from the platform.
/// Bounds wake latency and keeps tick accounting from overflowing across
/// long idle stretches.
pub const SYS_RUN_MAX: u32 = 65_535;

/// Longest delay any single `set_next` may request, and the floor applied to
/// accumulated overshoot (`next_event >= -SYS_EVENT_MAX`).
pub const SYS_EVENT_MAX: i32 = 0x3FFF_FFFF;

/// Number of I/O tasks (radio, MPipe). They lead the task table.
pub const NUM_IO_TASKS: usize = 2;

/// Number of built-in kernel tasks after the I/O tasks (OTAt).
pub const NUM_KERNEL_TASKS: usize = 1;

/// Number of application exotasks registered alongside the kernel tasks.
pub const NUM_EXOTASKS: usize = 4;

/// Total task markers: I/O + kernel + exotasks + the external task.
/// The scheduler's bitmasks are 32 bits wide.
pub const TASK_COUNT: usize = NUM_IO_TASKS + NUM_KERNEL_TASKS + NUM_EXOTASKS + 1;

const _: () = assert!(TASK_COUNT <= 32);

/// Capacity of the deferred-call (OTAt) System Queue.
pub const OTAT_QUEUE_SIZE: usize = 8;

/// Number of session records in the session stack.
pub const SESSION_STACK_SIZE: usize = 4;

/// Ticks a scheduled session may run late before the session runner
/// flushes it. Sessions late by this much or less always run.
pub const SESSION_LATE_LIMIT: i32 = 1;

/// Ticks the MPipe task waits for TX completion before resetting the driver.
pub const MPIPE_TIMEOUT: i32 = 512;

/// Largest MPipe frame, in bytes, in either direction.
pub const MPIPE_FRAME_MAX: usize = 256;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sti_conversion() {
        assert_eq!(ti_to_sti(1024), 32);
        assert_eq!(ti_to_sti(31), 0);
        assert_eq!(sti_to_ti(3), 96);
    }

    #[test]
    fn test_task_table_layout() {
        assert_eq!(TASK_COUNT, 8);
        assert!(SYS_RUN_MAX as i64 <= SYS_EVENT_MAX as i64);
    }
}
