//! # Task Markers
//!
//! A task marker is the small, fixed record the scheduler keeps for every
//! schedulable unit of work: which phase the task is in, how long it expects
//! to run once started, how much delay it can tolerate, and how many ticks
//! remain until it is due.
//!
//! Markers live in a fixed table inside the [`Scheduler`](crate::scheduler::Scheduler),
//! one slot per [`TaskId`]. The table order is the priority order:
//!
//! ```text
//!   index:  0      1      2      3 .. 3+NUM_EXOTASKS   last
//!           RADIO  MPIPE  OTAT   exotasks              EXTERNAL
//!           └─ Io ─┘      └──── Kernel ────────┘       External
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   register()        activate(event != 0)         event = 0
//!  ──────────► Idle ─────────────────────► Enabled ──────────► Teardown
//!                ▲                                               │
//!                └───────────────── dispatch(event 0) ───────────┘
//! ```
//!
//! Setting `event = 0` never frees anything: the scheduler hands the task one
//! last dispatch with `event == 0` (its destroy variant) and then stops
//! scheduling it until it is activated again.

use crate::config::{NUM_EXOTASKS, NUM_IO_TASKS, NUM_KERNEL_TASKS, SYS_EVENT_MAX, TASK_COUNT};

// ---------------------------------------------------------------------------
// Task identity and priority policy
// ---------------------------------------------------------------------------

/// Index of a task marker in the scheduler table.
///
/// IDs are only constructed through the associated constants and
/// [`TaskId::exotask`], so an out-of-range slot cannot be named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u8);

impl TaskId {
    /// Radio I/O task. Owns the session stack and runs session dialogs.
    pub const RADIO: TaskId = TaskId(0);
    /// MPipe host-bridge I/O task.
    pub const MPIPE: TaskId = TaskId(1);
    /// Deferred-call scheduler.
    pub const OTAT: TaskId = TaskId(NUM_IO_TASKS as u8);
    /// External (user) task. Always last, lowest priority.
    pub const EXTERNAL: TaskId = TaskId((TASK_COUNT - 1) as u8);

    /// The `n`th application exotask, if it exists in this build.
    pub const fn exotask(n: usize) -> Option<TaskId> {
        if n < NUM_EXOTASKS {
            Some(TaskId((NUM_IO_TASKS + NUM_KERNEL_TASKS + n) as u8))
        } else {
            None
        }
    }

    /// Task for a table index.
    pub const fn from_index(index: usize) -> Option<TaskId> {
        if index < TASK_COUNT {
            Some(TaskId(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Bit for this task in 32-bit task masks.
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << self.0
    }

    /// Exotask number, if this is an exotask.
    pub const fn exotask_number(self) -> Option<usize> {
        let i = self.0 as usize;
        if i >= NUM_IO_TASKS + NUM_KERNEL_TASKS && i < TASK_COUNT - 1 {
            Some(i - NUM_IO_TASKS - NUM_KERNEL_TASKS)
        } else {
            None
        }
    }

    /// Fixed priority class of this slot.
    pub const fn class(self) -> PriorityClass {
        let i = self.0 as usize;
        if i < NUM_IO_TASKS {
            PriorityClass::Io
        } else if i < TASK_COUNT - 1 {
            PriorityClass::Kernel
        } else {
            PriorityClass::External
        }
    }

    /// All task IDs in priority order.
    pub fn all() -> impl Iterator<Item = TaskId> {
        (0..TASK_COUNT as u8).map(TaskId)
    }
}

/// Priority class of a task marker. Variants are ordered from most to
/// least urgent, so `Io < Kernel < External`.
///
/// Among simultaneously due tasks the scheduler dispatches the lowest class
/// first and, inside a class, the lowest table index first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    /// Radio and MPipe. Latency-intolerant by construction.
    Io,
    /// OTAt and application exotasks.
    Kernel,
    /// The external/user task.
    External,
}

// ---------------------------------------------------------------------------
// Per-task static parameters
// ---------------------------------------------------------------------------

/// Timing budget a task declares when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Ticks the task needs once it starts running.
    pub reserve: u8,
    /// Ticks of delay the task can tolerate past its due time.
    /// `0` means it must not be delayed at all.
    pub latency: u8,
}

impl TaskConfig {
    pub const fn new(reserve: u8, latency: u8) -> Self {
        Self { reserve, latency }
    }
}

/// Event value reserved for "off / destroy".
pub const EVENT_OFF: u8 = 0;

/// `next_event` value of a task that is enabled but has no timed event.
/// Parked tasks are never clocked and only run after a preempt.
pub const NEVER: i32 = i32::MAX;

/// Task callback used when `dynamic-dispatch` is enabled.
#[cfg(feature = "dynamic-dispatch")]
pub type TaskFn = fn(TaskId, &mut crate::scheduler::Scheduler);

// ---------------------------------------------------------------------------
// Saved stacks (multi-context flavor)
// ---------------------------------------------------------------------------

/// A task-private stack for the multi-context flavor.
///
/// The marker owns the memory exclusively. `sp` is a word offset into
/// `words`; the platform port swaps it with the live stack pointer when the
/// task is dispatched and swaps it back when the task returns.
#[cfg(feature = "multi-context")]
#[derive(Debug)]
pub struct SavedStack {
    words: &'static mut [u32],
    sp: usize,
}

#[cfg(feature = "multi-context")]
impl SavedStack {
    /// Wrap `words` as an empty, full-descending stack. The initial stack
    /// pointer is the top of the region rounded down to 8 bytes.
    pub fn new(words: &'static mut [u32]) -> Self {
        let sp = words.len() & !1;
        Self { words, sp }
    }

    /// Saved stack pointer as a word offset from the bottom of the region.
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Store a new stack pointer, returning the previous one. Offsets past
    /// the top of the region are clamped to it.
    pub fn swap_sp(&mut self, sp: usize) -> usize {
        core::mem::replace(&mut self.sp, sp.min(self.words.len()))
    }

    /// Size of the region in words.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Raw address of the saved stack pointer, for the port layer.
    pub fn sp_ptr(&mut self) -> *mut u32 {
        // `sp` never exceeds `len`, so this stays within or one past the region
        self.words.as_mut_ptr().wrapping_add(self.sp)
    }

    /// Mutable access to the stack words, used to pre-build exception frames.
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut *self.words
    }
}

// ---------------------------------------------------------------------------
// Task marker
// ---------------------------------------------------------------------------

/// Scheduling record for one task.
#[derive(Debug)]
pub struct TaskMarker {
    /// Phase selector. `0` is off/destroy; other values belong to the task.
    pub event: u8,
    /// Task-private progress marker. Cleared by [`Scheduler::resync`](crate::scheduler::Scheduler::resync).
    pub cursor: u8,
    /// Ticks the task needs once it starts.
    pub reserve: u8,
    /// Ticks of delay the task tolerates.
    pub latency: u8,
    /// Ticks until due, relative to the last scheduler pass. Negative values
    /// record overshoot; [`NEVER`] marks a parked task.
    pub next_event: i32,
    /// Saved stack, swapped in while the task runs.
    #[cfg(feature = "multi-context")]
    pub stack: Option<SavedStack>,
    /// Optional callback. When `None` the static dispatch table is used.
    #[cfg(feature = "dynamic-dispatch")]
    pub callback: Option<TaskFn>,
}

impl TaskMarker {
    /// An unregistered marker. Used to initialize the static table.
    pub const EMPTY: TaskMarker = TaskMarker {
        event: EVENT_OFF,
        cursor: 0,
        reserve: 0,
        latency: 0,
        next_event: NEVER,
        #[cfg(feature = "multi-context")]
        stack: None,
        #[cfg(feature = "dynamic-dispatch")]
        callback: None,
    };

    /// Reset the marker for a fresh registration.
    pub fn init(&mut self, config: TaskConfig) {
        self.event = EVENT_OFF;
        self.cursor = 0;
        self.reserve = config.reserve;
        self.latency = config.latency;
        self.next_event = NEVER;
    }

    /// True when the task has a non-zero event.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.event != EVENT_OFF
    }

    /// True when the task is parked (enabled, no timed event).
    #[inline]
    pub fn is_parked(&self) -> bool {
        self.next_event == NEVER
    }

    /// True when an enabled task has reached its due time.
    #[inline]
    pub fn is_due(&self) -> bool {
        self.is_enabled() && self.next_event <= 0
    }

    /// Ticks until due with overshoot clamped to zero, or `None` when the
    /// task is disabled or parked.
    #[inline]
    pub fn due_in(&self) -> Option<i32> {
        if !self.is_enabled() || self.is_parked() {
            None
        } else {
            Some(self.next_event.max(0))
        }
    }

    /// Schedule the task `ticks` from now, bounded by `SYS_EVENT_MAX`.
    #[inline]
    pub fn set_next(&mut self, ticks: i32) {
        self.next_event = ticks.clamp(-SYS_EVENT_MAX, SYS_EVENT_MAX);
    }

    /// Subtract `elapsed` ticks. Parked markers are untouched; overshoot is
    /// floored at `-SYS_EVENT_MAX`.
    #[inline]
    pub fn clock(&mut self, elapsed: u32) {
        if self.is_parked() {
            return;
        }
        let elapsed = elapsed.min(SYS_EVENT_MAX as u32) as i32;
        self.next_event = self.next_event.saturating_sub(elapsed).max(-SYS_EVENT_MAX);
    }

    /// Ticks by which the task is past due (0 if not due).
    #[inline]
    pub fn overshoot(&self) -> u32 {
        if self.is_parked() || self.next_event >= 0 {
            0
        } else {
            self.next_event.unsigned_abs()
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_matches_table() {
        assert_eq!(TaskId::RADIO.class(), PriorityClass::Io);
        assert_eq!(TaskId::MPIPE.class(), PriorityClass::Io);
        assert_eq!(TaskId::OTAT.class(), PriorityClass::Kernel);
        assert_eq!(TaskId::exotask(0).map(TaskId::class), Some(PriorityClass::Kernel));
        assert_eq!(TaskId::EXTERNAL.class(), PriorityClass::External);
        assert!(PriorityClass::Io < PriorityClass::Kernel);
        assert!(PriorityClass::Kernel < PriorityClass::External);

        let ids: [TaskId; TASK_COUNT] = core::array::from_fn(|i| TaskId::from_index(i).unwrap());
        for pair in ids.windows(2) {
            assert!(pair[0].class() <= pair[1].class(), "table order must be priority order");
        }
    }

    #[test]
    fn test_exotask_ids() {
        let first = TaskId::exotask(0).unwrap();
        assert_eq!(first.index(), TaskId::OTAT.index() + 1);
        assert_eq!(first.exotask_number(), Some(0));
        assert!(TaskId::exotask(NUM_EXOTASKS).is_none());
        assert_eq!(TaskId::EXTERNAL.exotask_number(), None);
        assert_eq!(TaskId::OTAT.exotask_number(), None);
        assert!(TaskId::from_index(TASK_COUNT).is_none());
    }

    #[test]
    fn test_marker_init_is_disabled() {
        let mut marker = TaskMarker::EMPTY;
        marker.event = 3;
        marker.cursor = 7;
        marker.init(TaskConfig::new(2, 5));

        assert!(!marker.is_enabled());
        assert!(!marker.is_due());
        assert_eq!(marker.cursor, 0);
        assert_eq!(marker.reserve, 2);
        assert_eq!(marker.latency, 5);
        assert_eq!(marker.due_in(), None);
    }

    #[test]
    fn test_clock_keeps_overshoot() {
        let mut marker = TaskMarker::EMPTY;
        marker.event = 1;
        marker.set_next(10);
        marker.clock(4);
        assert_eq!(marker.next_event, 6);
        marker.clock(9);
        assert_eq!(marker.next_event, -3);
        assert!(marker.is_due());
        assert_eq!(marker.overshoot(), 3);
        assert_eq!(marker.due_in(), Some(0), "overshoot is clamped to due");
    }

    #[test]
    fn test_clock_floor_and_bounds() {
        let mut marker = TaskMarker::EMPTY;
        marker.event = 1;
        marker.set_next(i32::MAX - 1);
        assert_eq!(marker.next_event, SYS_EVENT_MAX);

        marker.set_next(0);
        marker.clock(u32::MAX);
        marker.clock(u32::MAX);
        assert_eq!(marker.next_event, -SYS_EVENT_MAX);
    }

    #[test]
    fn test_parked_marker_is_not_clocked() {
        let mut marker = TaskMarker::EMPTY;
        marker.event = 1;
        marker.next_event = NEVER;
        marker.clock(1000);
        assert!(marker.is_parked());
        assert!(!marker.is_due());
        assert_eq!(marker.due_in(), None);
        assert_eq!(marker.overshoot(), 0);
    }

    #[cfg(feature = "multi-context")]
    #[test]
    fn test_saved_stack_swap() {
        let words: &'static mut [u32] = Box::leak(vec![0u32; 33].into_boxed_slice());
        let mut stack = SavedStack::new(words);
        assert_eq!(stack.sp(), 32, "initial sp is 8-byte aligned");
        assert_eq!(stack.swap_sp(10), 32);
        assert_eq!(stack.sp(), 10);
        assert_eq!(stack.swap_sp(100), 10);
        assert_eq!(stack.sp(), 33);
    }
}
