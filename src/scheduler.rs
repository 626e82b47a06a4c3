//! # Scheduler
//!
//! Cooperative, tick-resolution scheduler over the fixed task-marker table.
//!
//! ## Scheduling Algorithm
//!
//! Each call to [`Scheduler::run`] is one scheduler pass:
//! 1. **Clock**: read the ticks elapsed since the previous pass from the
//!    platform and subtract them from every enabled task's `next_event`.
//!    Overshoot is kept (floored at `-SYS_EVENT_MAX`) so tasks that do their
//!    own delta accounting can see how late they are.
//! 2. **Absorb preempts**: every task an ISR flagged through the platform is
//!    made due now.
//! 3. **Teardown**: any task whose `event` dropped to 0 gets one last
//!    dispatch (its destroy variant) and is then no longer scheduled.
//! 4. **Select**: among due tasks (`next_event <= 0`, overshoot clamped to 0)
//!    pick the first in table order, which is the fixed priority order
//!    I/O → kernel/exotasks → external.
//! 5. **Latency gate**: if the candidate's `reserve` would push a
//!    higher-priority task past `next_event + latency`, the candidate waits.
//! 6. **Dispatch** the candidate (plain call; in the multi-context flavor its
//!    saved stack is swapped in around the call).
//! 7. **Wait**: compute `min(next_event)` over enabled tasks, capped at
//!    `SYS_RUN_MAX`, hand it to the platform, idle, and return it.
//!
//! Running tasks are never interrupted by the scheduler; a callback runs to
//! completion before the next decision.

use log::{debug, trace, warn};

use crate::config::{SYS_RUN_MAX, TASK_COUNT};
#[cfg(feature = "multi-context")]
use crate::task::SavedStack;
#[cfg(feature = "dynamic-dispatch")]
use crate::task::TaskFn;
use crate::task::{TaskConfig, TaskId, TaskMarker, EVENT_OFF, NEVER};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Hardware services the scheduler needs from the board port.
pub trait Platform {
    /// Ticks elapsed since the previous call. Each call restarts the
    /// measurement.
    fn elapsed_ticks(&mut self) -> u32;

    /// Reprogram the wakeup timer to fire `ticks` from now.
    fn program_wakeup(&mut self, _ticks: u32) {}

    /// Power hook: nothing is due for `ticks`. The sleep depth is the
    /// platform's choice.
    fn idle(&mut self, _ticks: u32) {}

    /// Drain preempt requests raised from interrupt context, one bit per
    /// [`TaskId`].
    fn take_preempts(&mut self) -> u32 {
        0
    }

    /// Swap the live stack pointer with the one saved in `stack`. Called once
    /// before and once after dispatching a task that owns a stack.
    #[cfg(feature = "multi-context")]
    fn switch_stack(&mut self, _task: TaskId, _stack: &mut SavedStack) {}
}

/// Static dispatch table: runs the task behind a [`TaskId`].
///
/// The task reads its phase from `sched.marker(task).event`. A dispatch with
/// `event == 0` is the task's teardown.
pub trait Dispatch {
    fn dispatch(&mut self, task: TaskId, sched: &mut Scheduler);
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The task-marker table plus the bookkeeping for one scheduling context.
///
/// ## Design Notes
///
/// - Markers are stored inline in a fixed-size array, one per [`TaskId`]
/// - `live` remembers which tasks have been seen enabled, so a drop to
///   `event == 0` can be turned into exactly one teardown dispatch
/// - `elapsed` accumulates clocked ticks per task for [`take_elapsed`](Self::take_elapsed)
pub struct Scheduler {
    tasks: [TaskMarker; TASK_COUNT],
    registered: u32,
    live: u32,
    elapsed: [u32; TASK_COUNT],
    uptime: u64,
    current: Option<TaskId>,
    paused: bool,
    dispatching: bool,
    faulted: bool,
}

impl Scheduler {
    /// Create a scheduler with every slot unregistered.
    pub const fn new() -> Self {
        Self {
            tasks: [TaskMarker::EMPTY; TASK_COUNT],
            registered: 0,
            live: 0,
            elapsed: [0; TASK_COUNT],
            uptime: 0,
            current: None,
            paused: false,
            dispatching: false,
            faulted: false,
        }
    }

    // --- Registration --------------------------------------------------

    /// Assign `task` its slot with the given timing budget. The task starts
    /// disabled (`event == 0`). Re-registering resets the marker.
    pub fn register(&mut self, task: TaskId, config: TaskConfig) {
        let i = task.index();
        self.tasks[i].init(config);
        #[cfg(feature = "dynamic-dispatch")]
        {
            self.tasks[i].callback = None;
        }
        self.registered |= task.bit();
        self.live &= !task.bit();
        self.elapsed[i] = 0;
        debug!("sched: registered {:?} reserve={} latency={}", task, config.reserve, config.latency);
    }

    /// Register `task` with a callback that replaces the static dispatch
    /// table entry.
    #[cfg(feature = "dynamic-dispatch")]
    pub fn register_callback(&mut self, task: TaskId, config: TaskConfig, callback: TaskFn) {
        self.register(task, config);
        self.tasks[task.index()].callback = Some(callback);
    }

    /// Give `task` a private stack (multi-context flavor).
    #[cfg(feature = "multi-context")]
    pub fn attach_stack(&mut self, task: TaskId, stack: SavedStack) {
        self.tasks[task.index()].stack = Some(stack);
    }

    #[inline]
    pub fn is_registered(&self, task: TaskId) -> bool {
        self.registered & task.bit() != 0
    }

    // --- Marker access -------------------------------------------------

    #[inline]
    pub fn marker(&self, task: TaskId) -> &TaskMarker {
        &self.tasks[task.index()]
    }

    /// Direct marker access for the task's own state machine. Changes to
    /// `event` are picked up at the next dispatch point.
    #[inline]
    pub fn marker_mut(&mut self, task: TaskId) -> &mut TaskMarker {
        &mut self.tasks[task.index()]
    }

    /// Task currently being dispatched, if any.
    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Ticks accounted since the scheduler was created.
    #[inline]
    pub fn uptime(&self) -> u64 {
        self.uptime
    }

    // --- Timing control ------------------------------------------------

    /// Set the task's phase. `EVENT_OFF` disables it; its teardown runs at
    /// the next dispatch point. Returns false for unregistered tasks.
    pub fn set_event(&mut self, task: TaskId, event: u8) -> bool {
        if !self.is_registered(task) {
            return false;
        }
        let marker = &mut self.tasks[task.index()];
        marker.event = event;
        if event != EVENT_OFF {
            self.live |= task.bit();
        }
        true
    }

    /// Make the task due `ticks` from now. Ignored (returns false) for
    /// disabled tasks: a disabled task needs a fresh `activate`.
    pub fn set_next(&mut self, task: TaskId, ticks: i32) -> bool {
        if !self.is_registered(task) || !self.tasks[task.index()].is_enabled() {
            return false;
        }
        self.tasks[task.index()].set_next(ticks);
        trace!("sched: {:?} next in {}", task, ticks);
        true
    }

    /// Set the phase and due time together.
    pub fn activate(&mut self, task: TaskId, event: u8, ticks: i32) -> bool {
        self.set_event(task, event) && (event == EVENT_OFF || self.set_next(task, ticks))
    }

    /// Force the task to be considered at the next dispatch point.
    #[inline]
    pub fn preempt(&mut self, task: TaskId) -> bool {
        self.set_next(task, 0)
    }

    /// Keep the task enabled with no timed event. It runs again only after a
    /// preempt or `set_next`.
    pub fn park(&mut self, task: TaskId) -> bool {
        if !self.is_registered(task) || !self.tasks[task.index()].is_enabled() {
            return false;
        }
        self.tasks[task.index()].next_event = NEVER;
        true
    }

    /// Disable the task. Killing a task that is already off does nothing.
    pub fn kill(&mut self, task: TaskId) {
        if self.is_registered(task) && self.tasks[task.index()].is_enabled() {
            self.tasks[task.index()].event = EVENT_OFF;
            debug!("sched: kill {:?}", task);
        }
    }

    /// Ticks the scheduler has clocked off `task` since the previous call.
    /// Tasks use this to clock their own queues against wall time.
    #[inline]
    pub fn take_elapsed(&mut self, task: TaskId) -> u32 {
        core::mem::take(&mut self.elapsed[task.index()])
    }

    /// Global resynchronization: every task's cursor restarts at 0.
    pub fn resync(&mut self) {
        self.tasks.iter_mut().for_each(|t| t.cursor = 0);
        debug!("sched: resync");
    }

    // --- Global control ------------------------------------------------

    /// Stop dispatching. Time keeps being accounted while paused.
    pub fn pause(&mut self) {
        self.paused = true;
        debug!("sched: paused");
    }

    pub fn resume(&mut self) {
        self.paused = false;
        debug!("sched: resumed");
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Called from a fault path before logging and reset. After this, `run`
    /// returns immediately without dispatching.
    pub fn fault_stop(&mut self) {
        self.faulted = true;
        self.paused = true;
        warn!("sched: stopped by fault, current task {:?}", self.current);
    }

    #[inline]
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    // --- Scheduler pass ------------------------------------------------

    /// One scheduler pass. Returns the ticks until the scheduler next needs
    /// to run, which is also passed to `platform.program_wakeup`.
    ///
    /// Re-entrant calls (from inside a task or a fault path) and calls after
    /// [`fault_stop`](Self::fault_stop) dispatch nothing and return
    /// `SYS_RUN_MAX`.
    pub fn run<P, D>(&mut self, platform: &mut P, tasks: &mut D) -> u32
    where
        P: Platform + ?Sized,
        D: Dispatch + ?Sized,
    {
        if self.dispatching || self.faulted {
            return SYS_RUN_MAX;
        }

        let elapsed = platform.elapsed_ticks();
        self.advance(elapsed);

        let preempts = platform.take_preempts();
        if preempts != 0 {
            for task in TaskId::all().filter(|t| preempts & t.bit() != 0) {
                self.preempt(task);
            }
        }
        self.observe();

        if self.paused {
            platform.program_wakeup(SYS_RUN_MAX);
            return SYS_RUN_MAX;
        }

        for task in TaskId::all() {
            if self.teardown_pending(task) {
                self.teardown(task, platform, tasks);
            }
        }

        if let Some(task) = self.select() {
            match self.latency_blocker(task) {
                Some(blocker) => {
                    warn!("sched: {:?} deferred, reserve would overrun {:?}", task, blocker);
                }
                None => {
                    self.dispatch_one(task, platform, tasks);
                    self.observe();
                    if self.teardown_pending(task) {
                        self.teardown(task, platform, tasks);
                    }
                }
            }
        }

        let wait = self.next_wait();
        platform.program_wakeup(wait);
        if wait > 0 {
            platform.idle(wait);
        }
        wait
    }

    /// Ticks until the next enabled task is due, capped at `SYS_RUN_MAX`.
    pub fn next_wait(&self) -> u32 {
        if TaskId::all().any(|t| self.teardown_pending(t)) {
            return 0;
        }
        self.tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| self.registered & (1u32 << *i) != 0)
            .filter_map(|(_, t)| t.due_in())
            .min()
            .map_or(SYS_RUN_MAX, |w| (w as u32).min(SYS_RUN_MAX))
    }

    /// The task that would be dispatched now, ignoring the latency gate.
    ///
    /// Due tasks all share the clamped key 0, so the winner is the first due
    /// task in table order.
    pub fn select(&self) -> Option<TaskId> {
        TaskId::all().find(|&t| self.is_registered(t) && self.tasks[t.index()].is_due() && !self.tasks[t.index()].is_parked())
    }

    /// A higher-priority, not yet due task whose latency budget would be
    /// violated if `task` ran for its declared reserve.
    pub fn latency_blocker(&self, task: TaskId) -> Option<TaskId> {
        let reserve = self.tasks[task.index()].reserve as i32;
        if reserve == 0 {
            return None;
        }
        TaskId::all().take_while(|t| t.index() < task.index()).find(|&t| {
            let m = &self.tasks[t.index()];
            self.is_registered(t)
                && t.class() < task.class()
                && m.due_in().map_or(false, |due| due > 0 && reserve > due + m.latency as i32)
        })
    }

    fn advance(&mut self, elapsed: u32) {
        self.uptime += elapsed as u64;
        if elapsed == 0 {
            return;
        }
        for (i, marker) in self.tasks.iter_mut().enumerate() {
            if self.registered & (1u32 << i) != 0 && marker.is_enabled() {
                marker.clock(elapsed);
                self.elapsed[i] = self.elapsed[i].saturating_add(elapsed);
            }
        }
    }

    /// Record tasks enabled by direct marker writes.
    fn observe(&mut self) {
        for (i, marker) in self.tasks.iter().enumerate() {
            if marker.is_enabled() {
                self.live |= self.registered & (1u32 << i);
            }
        }
    }

    #[inline]
    fn teardown_pending(&self, task: TaskId) -> bool {
        self.live & task.bit() != 0 && !self.tasks[task.index()].is_enabled()
    }

    fn teardown<P, D>(&mut self, task: TaskId, platform: &mut P, tasks: &mut D)
    where
        P: Platform + ?Sized,
        D: Dispatch + ?Sized,
    {
        debug!("sched: teardown {:?}", task);
        self.dispatch_one(task, platform, tasks);
        let marker = &mut self.tasks[task.index()];
        if !marker.is_enabled() {
            marker.next_event = NEVER;
            marker.cursor = 0;
            self.live &= !task.bit();
            self.elapsed[task.index()] = 0;
        }
    }

    #[cfg_attr(not(feature = "multi-context"), allow(unused_variables))]
    fn dispatch_one<P, D>(&mut self, task: TaskId, platform: &mut P, tasks: &mut D)
    where
        P: Platform + ?Sized,
        D: Dispatch + ?Sized,
    {
        let i = task.index();
        trace!("sched: dispatch {:?} event={} next={}", task, self.tasks[i].event, self.tasks[i].next_event);
        self.current = Some(task);
        self.dispatching = true;

        #[cfg(feature = "multi-context")]
        let mut stack = self.tasks[i].stack.take();
        #[cfg(feature = "multi-context")]
        if let Some(stack) = stack.as_mut() {
            platform.switch_stack(task, stack);
        }

        #[cfg(feature = "dynamic-dispatch")]
        let callback = self.tasks[i].callback;
        #[cfg(feature = "dynamic-dispatch")]
        match callback {
            Some(callback) => callback(task, self),
            None => tasks.dispatch(task, self),
        }
        #[cfg(not(feature = "dynamic-dispatch"))]
        tasks.dispatch(task, self);

        #[cfg(feature = "multi-context")]
        if let Some(mut stack) = stack {
            platform.switch_stack(task, &mut stack);
            self.tasks[i].stack.get_or_insert(stack);
        }

        self.dispatching = false;
        self.current = None;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
