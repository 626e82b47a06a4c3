//! # OTAt Deferred-Call Scheduler
//!
//! One kernel task that turns a [`SysQueue`] of zero-argument callbacks into
//! a cron-like facility. Each queued call fires a fixed number of ticks after
//! it was scheduled, measured against wall-clock ticks, not against when the
//! previous call happened to run.
//!
//! ## State Machine
//!
//! ```text
//!              schedule()
//!                  │
//!                  ▼
//!   ┌──────► RunDue (2) ── top due ──► call ──► Account (1)
//!   │          │   ▲                                │
//!   │   early  │   └────── next node in N ticks ────┘
//!   │          ▼
//!   └──── re-arm for top                 queue empty ──► Destroy (0)
//! ```
//!
//! - **RunDue** captures `delta0` (every tick the scheduler clocked off the
//!   task, overshoot included) with interrupts masked, clocks the queue by it
//!   and runs the top call if it is due.
//! - **Account** runs on the very next pass, folds the call's own run time
//!   into the queue, and arms the task for the new top node.
//! - **Destroy** clears the queue. It runs as the scheduler's teardown
//!   dispatch after the task is killed or drains its queue.
//!
//! Because every accounting step clocks the queue by the true elapsed time,
//! lateness on one call is absorbed by that call alone.

use log::{debug, trace, warn};

use crate::scheduler::Scheduler;
use crate::sync::IrqGuard;
use crate::sysqueue::{QueueError, QueueNode, SysQueue};
use crate::task::{TaskConfig, TaskId, EVENT_OFF};

/// A deferred call.
pub type OtatCall = fn();

/// Timing budget OTAt registers with. Deferred calls are expected to be
/// short; OTAt itself tolerates being delayed.
pub const OTAT_CONFIG: TaskConfig = TaskConfig::new(1, u8::MAX);

/// `event` values of the OTAt task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtatState {
    Destroy = 0,
    Account = 1,
    RunDue = 2,
}

impl OtatState {
    pub const fn from_event(event: u8) -> Option<Self> {
        match event {
            0 => Some(Self::Destroy),
            1 => Some(Self::Account),
            2 => Some(Self::RunDue),
            _ => None,
        }
    }
}

/// The deferred-call task and its queue.
pub struct Otat<'q> {
    queue: SysQueue<'q, OtatCall>,
    last_lateness: u32,
    fired: u32,
}

impl<'q> Otat<'q> {
    pub fn new(queue: SysQueue<'q, OtatCall>) -> Self {
        Self {
            queue,
            last_lateness: 0,
            fired: 0,
        }
    }

    /// Register the OTAt task marker. It stays off until something is
    /// scheduled.
    pub fn register(&self, sched: &mut Scheduler) {
        sched.register(TaskId::OTAT, OTAT_CONFIG);
    }

    /// Run `call` `ticks` from now. `tag` identifies the call for
    /// [`cancel`](Self::cancel). Fails with [`QueueError::Full`] and leaves
    /// the queue untouched when no slot is free.
    pub fn schedule(&mut self, sched: &mut Scheduler, call: OtatCall, tag: u16, ticks: u16) -> Result<(), QueueError> {
        self.resync(sched);
        if self.queue.push(QueueNode::new(call, ticks, tag)).is_none() {
            warn!("otat: no slot for tag {}", tag);
            return Err(QueueError::Full);
        }
        debug!("otat: tag {} in {} ticks", tag, ticks);
        self.arm(sched);
        Ok(())
    }

    /// Remove every pending call carrying `tag`. Returns how many were
    /// removed.
    pub fn cancel(&mut self, sched: &mut Scheduler, tag: u16) -> usize {
        self.resync(sched);
        let removed = self.queue.flush(|n| n.ext == tag);
        if removed > 0 {
            debug!("otat: cancelled {} call(s) with tag {}", removed, tag);
            self.arm(sched);
        }
        removed
    }

    /// Stop the task and drop every pending call. A later
    /// [`schedule`](Self::schedule) starts from an empty queue.
    pub fn kill(&mut self, sched: &mut Scheduler) {
        {
            let _irq = IrqGuard::new();
            sched.take_elapsed(TaskId::OTAT);
        }
        self.destroy();
        self.last_lateness = 0;
        sched.kill(TaskId::OTAT);
    }

    /// Number of calls waiting.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Ticks the most recent call was dispatched past its due time.
    #[inline]
    pub fn last_lateness(&self) -> u32 {
        self.last_lateness
    }

    /// Calls run since creation.
    #[inline]
    pub fn fired(&self) -> u32 {
        self.fired
    }

    /// Ticks until the next call, if any, relative to the last accounting.
    pub fn next_due(&self) -> Option<u16> {
        self.queue.top().map(|n| n.counter)
    }

    /// Task entry point, one step of the state machine.
    pub fn run(&mut self, sched: &mut Scheduler) {
        let event = sched.marker(TaskId::OTAT).event;
        let state = OtatState::from_event(event).unwrap_or_else(|| {
            warn!("otat: unknown event {}, running due calls", event);
            OtatState::RunDue
        });
        match state {
            OtatState::Destroy => self.destroy(),
            OtatState::Account => self.account(sched),
            OtatState::RunDue => self.run_due(sched),
        }
    }

    fn destroy(&mut self) {
        if self.queue.notempty() {
            debug!("otat: dropping {} pending call(s)", self.queue.len());
        }
        self.queue.clear();
    }

    fn account(&mut self, sched: &mut Scheduler) {
        self.resync(sched);
        self.arm(sched);
    }

    fn run_due(&mut self, sched: &mut Scheduler) {
        let (delta0, overshoot) = {
            let _irq = IrqGuard::new();
            (sched.take_elapsed(TaskId::OTAT), sched.marker(TaskId::OTAT).overshoot())
        };
        self.queue.clock(delta0);

        match self.queue.top().map(|n| n.counter) {
            Some(0) => {
                self.queue.activate();
                if let Some(node) = self.queue.pop() {
                    self.last_lateness = overshoot;
                    self.fired = self.fired.wrapping_add(1);
                    trace!("otat: run tag {} late by {}", node.ext, overshoot);
                    (node.handle)();
                }
                sched.activate(TaskId::OTAT, OtatState::Account as u8, 0);
            }
            Some(_) => self.arm(sched),
            None => {
                debug!("otat: queue empty, stopping");
                sched.marker_mut(TaskId::OTAT).event = EVENT_OFF;
            }
        }
    }

    /// Bring the queue up to the present using the ticks the scheduler
    /// clocked off the task since the last accounting.
    fn resync(&mut self, sched: &mut Scheduler) {
        let elapsed = {
            let _irq = IrqGuard::new();
            sched.take_elapsed(TaskId::OTAT)
        };
        if elapsed > 0 {
            self.queue.clock(elapsed);
        }
    }

    /// Point the task marker at the top node, or stop the task when the queue
    /// is empty.
    fn arm(&mut self, sched: &mut Scheduler) {
        match self.queue.top() {
            Some(node) => {
                sched.activate(TaskId::OTAT, OtatState::RunDue as u8, node.counter as i32);
            }
            None => sched.kill(TaskId::OTAT),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OTAT_QUEUE_SIZE;
    use crate::scheduler::Dispatch;
    use crate::testing::MockPlatform;
    use std::cell::{Cell, RefCell};

    thread_local! {
        static NOW: Cell<u64> = const { Cell::new(0) };
        static FIRED: RefCell<Vec<(char, u64)>> = const { RefCell::new(Vec::new()) };
    }

    fn record(name: char) {
        let now = NOW.with(Cell::get);
        FIRED.with(|f| f.borrow_mut().push((name, now)));
    }

    fn call_a() {
        record('a');
    }

    fn call_b() {
        record('b');
    }

    fn call_c() {
        record('c');
    }

    fn fired() -> Vec<(char, u64)> {
        FIRED.with(|f| f.borrow().clone())
    }

    struct OtatOnly<'a, 'q>(&'a mut Otat<'q>);

    impl Dispatch for OtatOnly<'_, '_> {
        fn dispatch(&mut self, task: TaskId, sched: &mut Scheduler) {
            if task == TaskId::OTAT {
                NOW.with(|n| n.set(sched.uptime()));
                self.0.run(sched);
            }
        }
    }

    fn setup(storage: &mut [Option<QueueNode<OtatCall>>]) -> (Scheduler, Otat<'_>) {
        NOW.with(|n| n.set(0));
        FIRED.with(|f| f.borrow_mut().clear());
        let mut sched = Scheduler::new();
        let otat = Otat::new(SysQueue::init(storage).unwrap());
        otat.register(&mut sched);
        (sched, otat)
    }

    #[test]
    fn test_state_from_event() {
        assert_eq!(OtatState::from_event(0), Some(OtatState::Destroy));
        assert_eq!(OtatState::from_event(1), Some(OtatState::Account));
        assert_eq!(OtatState::from_event(2), Some(OtatState::RunDue));
        assert_eq!(OtatState::from_event(3), None);
    }

    #[test]
    fn test_schedule_arms_task() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        assert!(!sched.marker(TaskId::OTAT).is_enabled());

        otat.schedule(&mut sched, call_a, 1, 40).unwrap();
        otat.schedule(&mut sched, call_b, 2, 10).unwrap();
        let marker = sched.marker(TaskId::OTAT);
        assert_eq!(marker.event, OtatState::RunDue as u8);
        assert_eq!(marker.next_event, 10, "armed for the earliest call");
        assert_eq!(otat.pending(), 2);
    }

    #[test]
    fn test_lateness_does_not_accumulate() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();

        otat.schedule(&mut sched, call_a, 1, 100).unwrap();
        otat.schedule(&mut sched, call_b, 2, 200).unwrap();

        // The kernel gets to OTAt 5 ticks late for the first call
        platform.advance(105);
        assert_eq!(sched.run(&mut platform, &mut OtatOnly(&mut otat)), 0);
        assert_eq!(fired(), vec![('a', 105)]);
        assert_eq!(otat.last_lateness(), 5);

        // The call itself takes 7 ticks, measured by the accounting pass
        platform.advance(7);
        let wait = sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(wait, 88, "second call still targets tick 200");

        platform.advance(88);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(fired(), vec![('a', 105), ('b', 200)]);
        assert_eq!(otat.last_lateness(), 0);
    }

    #[test]
    fn test_late_second_call_only_carries_own_delay() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();

        otat.schedule(&mut sched, call_a, 1, 100).unwrap();
        otat.schedule(&mut sched, call_b, 2, 200).unwrap();

        platform.advance(105);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        sched.run(&mut platform, &mut OtatOnly(&mut otat));

        // 3 ticks of dispatch delay on the second call
        platform.advance(98);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        let times = fired();
        assert_eq!(times[1].0, 'b');
        assert!(times[1].1 <= 200 + 3, "b ran at {}", times[1].1);
        assert_eq!(otat.last_lateness(), 3);
    }

    #[test]
    fn test_queue_drains_then_task_stops() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();
        platform.idle_advances = true;

        otat.schedule(&mut sched, call_a, 1, 3).unwrap();
        otat.schedule(&mut sched, call_c, 1, 3).unwrap();
        for _ in 0..8 {
            sched.run(&mut platform, &mut OtatOnly(&mut otat));
        }
        assert_eq!(fired(), vec![('a', 3), ('c', 3)], "equal due times fire in insertion order");
        assert_eq!(otat.fired(), 2);
        assert_eq!(otat.pending(), 0);
        assert!(!sched.marker(TaskId::OTAT).is_enabled());
        assert_eq!(sched.next_wait(), crate::config::SYS_RUN_MAX);
    }

    #[test]
    fn test_cancel_by_tag() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);

        otat.schedule(&mut sched, call_a, 7, 10).unwrap();
        otat.schedule(&mut sched, call_b, 8, 20).unwrap();
        otat.schedule(&mut sched, call_c, 7, 30).unwrap();

        assert_eq!(otat.cancel(&mut sched, 7), 2);
        assert_eq!(otat.pending(), 1);
        assert_eq!(sched.marker(TaskId::OTAT).next_event, 20, "re-armed for the survivor");
        assert_eq!(otat.cancel(&mut sched, 7), 0);
    }

    #[test]
    fn test_schedule_full_queue() {
        let mut storage = [None; 2];
        let (mut sched, mut otat) = setup(&mut storage);
        otat.schedule(&mut sched, call_a, 1, 10).unwrap();
        otat.schedule(&mut sched, call_b, 2, 20).unwrap();
        assert_eq!(otat.schedule(&mut sched, call_c, 3, 5), Err(QueueError::Full));
        assert_eq!(otat.pending(), 2);
        assert_eq!(otat.next_due(), Some(10));
    }

    #[test]
    fn test_kill_drops_pending_calls() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();

        otat.schedule(&mut sched, call_a, 1, 50).unwrap();
        otat.kill(&mut sched);
        assert_eq!(otat.pending(), 0, "kill clears the queue");
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(otat.pending(), 0);
        assert!(fired().is_empty());

        // Rescheduling afterwards starts from a clean slate
        otat.schedule(&mut sched, call_b, 2, 0).unwrap();
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(fired(), vec![('b', 0)]);
    }

    #[test]
    fn test_schedule_after_kill_does_not_revive_calls() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();
        platform.idle_advances = true;

        otat.schedule(&mut sched, call_a, 1, 5).unwrap();
        otat.kill(&mut sched);
        otat.schedule(&mut sched, call_b, 2, 50).unwrap();
        assert_eq!(otat.pending(), 1);
        assert_eq!(sched.marker(TaskId::OTAT).next_event, 50);

        for _ in 0..10 {
            sched.run(&mut platform, &mut OtatOnly(&mut otat));
        }
        assert_eq!(fired(), vec![('b', 50)], "the killed call never fires");
        assert_eq!(otat.pending(), 0);
    }

    #[test]
    fn test_schedule_while_waiting_uses_elapsed_time() {
        let mut storage = [None; OTAT_QUEUE_SIZE];
        let (mut sched, mut otat) = setup(&mut storage);
        let mut platform = MockPlatform::new();

        otat.schedule(&mut sched, call_a, 1, 100).unwrap();
        platform.advance(60);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));

        // 60 ticks in, a call for 20 ticks from now lands before the first
        otat.schedule(&mut sched, call_b, 2, 20).unwrap();
        assert_eq!(otat.next_due(), Some(20));
        assert_eq!(sched.marker(TaskId::OTAT).next_event, 20);

        platform.advance(20);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(sched.marker(TaskId::OTAT).next_event, 20, "first call remains at tick 100");
        platform.advance(20);
        sched.run(&mut platform, &mut OtatOnly(&mut otat));
        assert_eq!(fired(), vec![('b', 80), ('a', 100)]);
    }
}
