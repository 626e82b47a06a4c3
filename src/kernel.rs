//! # Kernel
//!
//! Composition of the built-in tasks into one static dispatch table, the
//! ISR preempt entry point, and the firmware main loop.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► Scheduler::new()             ← task table
//!         ├─► KernelTasks::new(..)         ← radio, MPipe, OTAt, app tasks
//!         ├─► KernelTasks::register(..)    ← markers for the built-ins
//!         ├─► app registers its exotasks / external task
//!         └─► kernel::run_forever(..)      ← one scheduler pass per wakeup
//!               ├─► Platform::elapsed_ticks / take_preempts
//!               ├─► dispatch through KernelTasks
//!               └─► Platform::program_wakeup / idle
//! ```
//!
//! Interrupt handlers never touch the scheduler directly. They call
//! [`platform_ot_preempt`], which only sets a bit in [`PREEMPT`]; the next
//! pass turns the bit into `preempt(task)`.

use log::warn;

use crate::mpipe::{MpipeDriver, MpipeTask};
use crate::otat::Otat;
use crate::scheduler::{Dispatch, Platform, Scheduler};
use crate::session::Dll;
use crate::sync::PreemptMask;
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// ISR preempt hook
// ---------------------------------------------------------------------------

/// Preempt requests raised from interrupt context, drained by the platform's
/// `take_preempts`.
pub static PREEMPT: PreemptMask = PreemptMask::new();

/// Force `task` to be considered at the next scheduler pass.
///
/// Safe from any ISR, including with interrupts already disabled: it is a
/// single atomic OR.
#[inline]
pub fn platform_ot_preempt(task: TaskId) {
    PREEMPT.request(task);
}

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

/// Application tasks: the exotasks and the external task.
pub trait TaskSet {
    fn run(&mut self, task: TaskId, sched: &mut Scheduler);
}

/// Task set for builds without application tasks. Any dispatch to it shuts
/// the task down.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoApp;

impl TaskSet for NoApp {
    fn run(&mut self, task: TaskId, sched: &mut Scheduler) {
        if sched.marker(task).is_enabled() {
            warn!("kernel: no application task for {:?}", task);
            sched.kill(task);
        }
    }
}

/// Static dispatch table for the whole node.
pub struct KernelTasks<'q, D: MpipeDriver, A: TaskSet> {
    pub dll: Dll,
    pub mpipe: MpipeTask<D>,
    pub otat: Otat<'q>,
    pub app: A,
}

impl<'q, D: MpipeDriver, A: TaskSet> KernelTasks<'q, D, A> {
    pub fn new(dll: Dll, mpipe: MpipeTask<D>, otat: Otat<'q>, app: A) -> Self {
        Self { dll, mpipe, otat, app }
    }

    /// Register the radio, MPipe and OTAt markers.
    pub fn register(&self, sched: &mut Scheduler) {
        self.dll.register(sched);
        self.mpipe.register(sched);
        self.otat.register(sched);
    }
}

impl<D: MpipeDriver, A: TaskSet> Dispatch for KernelTasks<'_, D, A> {
    fn dispatch(&mut self, task: TaskId, sched: &mut Scheduler) {
        match task {
            TaskId::RADIO => self.dll.run(sched),
            TaskId::MPIPE => self.mpipe.run(sched),
            TaskId::OTAT => self.otat.run(sched),
            _ => self.app.run(task, sched),
        }
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Run scheduler passes forever. The platform's `idle` does the waiting.
pub fn run_forever<P, D>(sched: &mut Scheduler, platform: &mut P, tasks: &mut D) -> !
where
    P: Platform,
    D: Dispatch,
{
    loop {
        sched.run(platform, tasks);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
