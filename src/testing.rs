//! Host-side test doubles.

use crate::scheduler::Platform;
#[cfg(feature = "multi-context")]
use crate::task::{SavedStack, TaskId};

/// Scripted platform: time only moves when a test calls [`advance`](Self::advance)
/// or, with `idle_advances`, when the scheduler idles.
pub(crate) struct MockPlatform {
    pub now: u32,
    last: u32,
    /// Every wakeup the scheduler programmed, in order.
    pub wakeups: Vec<u32>,
    /// Every idle request, in order.
    pub idles: Vec<u32>,
    /// When set, `idle(n)` advances the clock by `n`.
    pub idle_advances: bool,
    /// Pending ISR preempt bits, drained by the next pass.
    pub preempts: u32,
    #[cfg(feature = "multi-context")]
    pub swaps: Vec<TaskId>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: 0,
            last: 0,
            wakeups: Vec::new(),
            idles: Vec::new(),
            idle_advances: false,
            preempts: 0,
            #[cfg(feature = "multi-context")]
            swaps: Vec::new(),
        }
    }

    pub fn advance(&mut self, ticks: u32) {
        self.now = self.now.wrapping_add(ticks);
    }
}

impl Platform for MockPlatform {
    fn elapsed_ticks(&mut self) -> u32 {
        let elapsed = self.now.wrapping_sub(self.last);
        self.last = self.now;
        elapsed
    }

    fn program_wakeup(&mut self, ticks: u32) {
        self.wakeups.push(ticks);
    }

    fn idle(&mut self, ticks: u32) {
        self.idles.push(ticks);
        if self.idle_advances {
            self.advance(ticks);
        }
    }

    fn take_preempts(&mut self) -> u32 {
        core::mem::take(&mut self.preempts)
    }

    #[cfg(feature = "multi-context")]
    fn switch_stack(&mut self, task: TaskId, stack: &mut SavedStack) {
        self.swaps.push(task);
        let sp = stack.sp();
        stack.swap_sp(sp);
    }
}
