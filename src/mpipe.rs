//! # MPipe Task
//!
//! I/O task bridging a host link (UART, USB CDC) into the kernel. The wire
//! transport belongs to an [`MpipeDriver`]; this task only sequences it.
//!
//! ```text
//!            open()
//!   Off(0) ─────────► Listen(1) ◄──────────────── TxDone(4)
//!                      │   ▲  ▲                       ▲
//!          frame ready │   │  └── no reply ──┐        │ tx complete
//!                      ▼   │                 │        │
//!                    RxDone(2) ── reply ──► TxBusy(3) ┘
//!                                              │
//!                                  timeout ──► reset ──► Listen(1)
//! ```
//!
//! RX and TX-complete interrupts call
//! [`platform_ot_preempt`](crate::kernel::platform_ot_preempt) with
//! [`TaskId::MPIPE`]; while listening the task is parked and only runs on
//! such a preempt.

use log::{debug, trace, warn};

use crate::config::{MPIPE_FRAME_MAX, MPIPE_TIMEOUT};
use crate::scheduler::Scheduler;
use crate::task::{TaskConfig, TaskId};

/// Host-link transport.
pub trait MpipeDriver {
    /// Arm reception.
    fn listen(&mut self);
    /// Copy a completely received frame into `buf`, returning its length.
    fn take_frame(&mut self, buf: &mut [u8]) -> Option<usize>;
    /// Start sending `frame`. Returns false if the transmitter refused it.
    fn transmit(&mut self, frame: &[u8]) -> bool;
    /// True once the frame passed to `transmit` has gone out.
    fn tx_complete(&mut self) -> bool;
    /// Abort any transfer and return to a known state.
    fn reset(&mut self);
    /// Power the link down.
    fn close(&mut self);
}

/// Consumer of received frames. Writes an optional reply into the second
/// buffer and returns its length.
pub type FrameHandler = fn(&[u8], &mut [u8]) -> Option<usize>;

/// MPipe relies on ISR preempts for promptness; it needs one tick per step.
pub const MPIPE_CONFIG: TaskConfig = TaskConfig::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MpipeState {
    Off = 0,
    Listen = 1,
    RxDone = 2,
    TxBusy = 3,
    TxDone = 4,
}

impl MpipeState {
    pub const fn from_event(event: u8) -> Option<Self> {
        match event {
            0 => Some(Self::Off),
            1 => Some(Self::Listen),
            2 => Some(Self::RxDone),
            3 => Some(Self::TxBusy),
            4 => Some(Self::TxDone),
            _ => None,
        }
    }
}

/// Where a state hands control next.
enum Next {
    Now(MpipeState),
    After(MpipeState, i32),
    Park(MpipeState),
}

/// Link counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MpipeStats {
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub timeouts: u32,
}

pub struct MpipeTask<D: MpipeDriver> {
    driver: D,
    handler: FrameHandler,
    rx: [u8; MPIPE_FRAME_MAX],
    tx: [u8; MPIPE_FRAME_MAX],
    pending_rx: usize,
    tx_started: u64,
    stats: MpipeStats,
}

impl<D: MpipeDriver> MpipeTask<D> {
    pub fn new(driver: D, handler: FrameHandler) -> Self {
        Self {
            driver,
            handler,
            rx: [0; MPIPE_FRAME_MAX],
            tx: [0; MPIPE_FRAME_MAX],
            pending_rx: 0,
            tx_started: 0,
            stats: MpipeStats::default(),
        }
    }

    pub fn register(&self, sched: &mut Scheduler) {
        sched.register(TaskId::MPIPE, MPIPE_CONFIG);
    }

    /// Start the link. The task begins listening at the next pass.
    pub fn open(&mut self, sched: &mut Scheduler) {
        sched.activate(TaskId::MPIPE, MpipeState::Listen as u8, 0);
    }

    /// Stop the link; the driver is closed by the teardown dispatch.
    pub fn close(&mut self, sched: &mut Scheduler) {
        sched.kill(TaskId::MPIPE);
    }

    #[inline]
    pub fn stats(&self) -> MpipeStats {
        self.stats
    }

    #[inline]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[inline]
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Task entry point.
    pub fn run(&mut self, sched: &mut Scheduler) {
        let event = sched.marker(TaskId::MPIPE).event;
        let Some(state) = MpipeState::from_event(event) else {
            warn!("mpipe: unknown event {}, resetting", event);
            self.driver.reset();
            sched.activate(TaskId::MPIPE, MpipeState::Listen as u8, 0);
            return;
        };

        let next = match state {
            MpipeState::Off => {
                debug!("mpipe: closed");
                self.driver.close();
                return;
            }
            MpipeState::Listen => self.listen(),
            MpipeState::RxDone => self.rx_done(sched),
            MpipeState::TxBusy => self.tx_busy(sched),
            MpipeState::TxDone => {
                self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
                Next::Now(MpipeState::Listen)
            }
        };

        match next {
            Next::Now(state) => {
                sched.activate(TaskId::MPIPE, state as u8, 0);
            }
            Next::After(state, ticks) => {
                sched.activate(TaskId::MPIPE, state as u8, ticks);
            }
            Next::Park(state) => {
                sched.set_event(TaskId::MPIPE, state as u8);
                sched.park(TaskId::MPIPE);
            }
        }
    }

    fn listen(&mut self) -> Next {
        match self.driver.take_frame(&mut self.rx) {
            Some(len) => {
                trace!("mpipe: rx {} bytes", len);
                self.stats.rx_frames = self.stats.rx_frames.wrapping_add(1);
                self.pending_rx = len;
                Next::Now(MpipeState::RxDone)
            }
            None => {
                self.driver.listen();
                Next::Park(MpipeState::Listen)
            }
        }
    }

    fn rx_done(&mut self, sched: &Scheduler) -> Next {
        let len = core::mem::take(&mut self.pending_rx).min(MPIPE_FRAME_MAX);
        let Some(reply) = (self.handler)(&self.rx[..len], &mut self.tx) else {
            return Next::Now(MpipeState::Listen);
        };
        let reply = reply.min(MPIPE_FRAME_MAX);
        if !self.driver.transmit(&self.tx[..reply]) {
            warn!("mpipe: transmitter refused {} bytes", reply);
            self.driver.reset();
            return Next::Now(MpipeState::Listen);
        }
        trace!("mpipe: tx {} bytes", reply);
        self.tx_started = sched.uptime();
        Next::After(MpipeState::TxBusy, MPIPE_TIMEOUT)
    }

    fn tx_busy(&mut self, sched: &Scheduler) -> Next {
        if self.driver.tx_complete() {
            return Next::Now(MpipeState::TxDone);
        }
        let waited = sched.uptime().saturating_sub(self.tx_started);
        if waited < MPIPE_TIMEOUT as u64 {
            // Woken by an unrelated preempt
            return Next::After(MpipeState::TxBusy, MPIPE_TIMEOUT - waited as i32);
        }
        warn!("mpipe: tx timeout after {} ticks", waited);
        self.stats.timeouts = self.stats.timeouts.wrapping_add(1);
        self.driver.reset();
        Next::Now(MpipeState::Listen)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
