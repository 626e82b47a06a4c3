//! # Session Stack
//!
//! A bounded pool of communication sessions plus the radio task that runs
//! them (the data-link layer runner, [`Dll`]).
//!
//! A session is one pending or in-progress dialog: addressing (channel,
//! subnet, flags), the protocol phase in [`NetState`], and the applet that is
//! called when the session comes due. The stack never interprets the applet
//! or the phase bits; the network layer moves them along.
//!
//! ## Ordering
//!
//! ```text
//!   slots: [ s0 | s1 | -- | s3 ]      top = min (max(counter, 0), order)
//!               counter: ticks until due, negative once late
//!               order:   queue position, set on allocation and on requeue
//! ```
//!
//! Every due session ranks the same, however late it is, so due sessions
//! run FIFO in queue order. A scheduled session that has come due keeps
//! its place ahead of immediate sessions queued after it.
//!
//! Handles ([`SessionId`]) carry the slot and the allocation sequence
//! number. The sequence number never changes while the session lives, so
//! a handle stays valid across requeues and never aliases a newer session.

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::config::{SESSION_LATE_LIMIT, SESSION_STACK_SIZE};
use crate::scheduler::Scheduler;
use crate::sync::IrqGuard;
use crate::task::{TaskConfig, TaskId, EVENT_OFF};

bitflags! {
    /// Protocol phase and mode bits of a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NetState: u16 {
        /// Fresh session, no frame built yet.
        const INIT      = 1 << 0;
        /// Request transmit phase.
        const REQTX     = 1 << 1;
        /// Listening for a response.
        const RESPRX    = 1 << 2;
        /// Response transmit phase (responder side).
        const RESPTX    = 1 << 3;
        /// Dialog finished.
        const DONE      = 1 << 7;
        /// Background frames (advertising flood).
        const BG        = 1 << 8;
        /// Stream of frames without per-frame contention.
        const STREAM    = 1 << 9;
        /// Marked for removal at the next flush.
        const SCRAP     = 1 << 15;
    }
}

bitflags! {
    /// Wire-level session flags. Unnamed bits are carried through as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u8 {
        const CRYPTO    = 1 << 0;
        const VID       = 1 << 1;
        const ACK       = 1 << 2;
        const LISTEN    = 1 << 7;
        const _ = !0;
    }
}

/// Session entry point, called when the session comes due.
pub type Applet = fn(&mut Session);

/// Runtime network defaults. Masked template bits fall back to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub subnet: u8,
    pub flags: SessionFlags,
    /// Channel used for advertising floods when a template leaves it 0.
    pub bg_channel: u8,
    /// Channel used for requests when a template leaves it 0.
    pub req_channel: u8,
}

impl NetConfig {
    pub const fn new(subnet: u8, flags: SessionFlags, bg_channel: u8, req_channel: u8) -> Self {
        Self {
            subnet,
            flags,
            bg_channel,
            req_channel,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new(0xFF, SessionFlags::empty(), 0x10, 0x10)
    }
}

/// Typed handle into a [`SessionStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    slot: u8,
    seq: u32,
}

impl SessionId {
    #[inline]
    pub fn slot(self) -> usize {
        self.slot as usize
    }
}

/// One session record.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub channel: u8,
    pub subnet: u8,
    pub flags: SessionFlags,
    pub netstate: NetState,
    /// Protocol scratch, e.g. which sub-protocol built the frame.
    pub extra: u16,
    pub applet: Applet,
    /// Ticks until due. Goes negative once the session is late.
    pub counter: i32,
    seq: u32,
    order: u32,
    scheduled: bool,
    requeue: Option<i32>,
}

impl Session {
    /// True if the session was created with a non-zero offset. Only
    /// scheduled sessions are flushed for running late.
    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// Ticks past due (0 if not yet due).
    #[inline]
    pub fn lateness(&self) -> u32 {
        if self.counter < 0 {
            self.counter.unsigned_abs()
        } else {
            0
        }
    }

    /// Ask the runner to keep this session and call its applet again
    /// `ticks` from now instead of retiring it.
    pub fn continue_after(&mut self, ticks: u16) {
        self.requeue = Some(ticks as i32);
    }

    /// Mark the session for removal.
    pub fn scrap(&mut self) {
        self.netstate.insert(NetState::SCRAP);
    }

    #[inline]
    fn key(&self) -> (i32, u32) {
        (self.counter.max(0), self.order)
    }
}

/// Default applet for advertising floods. The flood is driven by the
/// network layer from the session's `BG | STREAM` bits.
pub fn bg_flood(session: &mut Session) {
    trace!("session: flood on channel {:#04x}", session.channel);
    session.netstate.remove(NetState::INIT);
}

// ---------------------------------------------------------------------------
// Session stack
// ---------------------------------------------------------------------------

/// Fixed-capacity session pool.
pub struct SessionStack<const N: usize> {
    slots: [Option<Session>; N],
    next_seq: u32,
}

impl<const N: usize> SessionStack<N> {
    pub const fn new() -> Self {
        Self {
            slots: [None; N],
            next_seq: 0,
        }
    }

    /// Unallocated slots.
    pub fn numfree(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Allocated sessions.
    pub fn count(&self) -> usize {
        N - self.numfree()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Allocate a session due `offset` ticks from now. Returns `None` when
    /// the stack is exhausted. Addressing beyond the channel is left at its
    /// zero value for the caller to fill in.
    pub fn session_new(&mut self, applet: Applet, offset: u16, channel: u8, netstate: NetState) -> Option<SessionId> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            warn!("session: stack exhausted ({} slots)", N);
            return None;
        };
        let seq = self.bump_seq();
        self.slots[slot] = Some(Session {
            channel,
            subnet: 0,
            flags: SessionFlags::empty(),
            netstate,
            extra: 0,
            applet,
            counter: offset as i32,
            seq,
            order: seq,
            scheduled: offset > 0,
            requeue: None,
        });
        debug!("session: new #{} slot {} channel {:#04x} in {} ticks", seq, slot, channel, offset);
        Some(SessionId { slot: slot as u8, seq })
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots
            .get(id.slot())
            .and_then(Option::as_ref)
            .filter(|s| s.seq == id.seq)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .filter(|s| s.seq == id.seq)
    }

    /// Subtract `elapsed` ticks from every session. Counters may go negative.
    pub fn refresh(&mut self, elapsed: u32) {
        let elapsed = elapsed.min(i32::MAX as u32) as i32;
        self.slots
            .iter_mut()
            .flatten()
            .for_each(|s| s.counter = s.counter.saturating_sub(elapsed));
    }

    /// The session that comes due first.
    pub fn top(&self) -> Option<SessionId> {
        self.ordered().next()
    }

    /// The session after [`top`](Self::top).
    pub fn follower(&self) -> Option<SessionId> {
        self.ordered().nth(1)
    }

    /// Remove and return the top session.
    pub fn pop(&mut self) -> Option<Session> {
        let id = self.top()?;
        self.drop_session(id)
    }

    /// Retire one session. Stale handles are ignored.
    pub fn drop_session(&mut self, id: SessionId) -> Option<Session> {
        self.get(id)?;
        let session = self.slots[id.slot()].take();
        debug!("session: retired #{} slot {}", id.seq, id.slot);
        session
    }

    /// Remove every session marked [`NetState::SCRAP`]. Returns how many
    /// were removed.
    pub fn flush(&mut self) -> usize {
        self.flush_where(|s| s.netstate.contains(NetState::SCRAP))
    }

    /// Remove every session matching `predicate`.
    pub fn flush_where<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&Session) -> bool,
    {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, &predicate) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// True if a live session uses `channel`.
    pub fn occupied(&self, channel: u8) -> bool {
        self.slots.iter().flatten().any(|s| s.channel == channel)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Live sessions in due order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> + '_ {
        self.ordered().filter_map(move |id| self.get(id))
    }

    fn ordered(&self) -> impl Iterator<Item = SessionId> + '_ {
        let mut ids: [Option<(i32, u32, u8, u32)>; N] = [None; N];
        for (i, slot) in self.slots.iter().enumerate() {
            ids[i] = slot.as_ref().map(|s| {
                let (counter, order) = s.key();
                (counter, order, i as u8, s.seq)
            });
        }
        ids.sort_unstable_by_key(|k| k.map_or((i32::MAX, u32::MAX, u8::MAX), |(c, o, slot, _)| (c, o, slot)));
        ids.into_iter().flatten().map(|(_, _, slot, seq)| SessionId { slot, seq })
    }

    fn bump_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}

impl<const N: usize> Default for SessionStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Radio task (session runner)
// ---------------------------------------------------------------------------

/// `event` value of the radio task while it has sessions to run.
pub const RADIO_RUN: u8 = 1;

/// Radio tasks must not be delayed and need two ticks per session step.
pub const RADIO_CONFIG: TaskConfig = TaskConfig::new(2, 0);

/// Data-link layer: owns the session stack and runs sessions as the radio
/// I/O task.
pub struct Dll {
    pub sessions: SessionStack<SESSION_STACK_SIZE>,
    pub netconf: NetConfig,
    pub(crate) flood_applet: Applet,
    completed: u32,
    dropped_late: u32,
}

impl Dll {
    pub fn new(netconf: NetConfig) -> Self {
        Self {
            sessions: SessionStack::new(),
            netconf,
            flood_applet: bg_flood,
            completed: 0,
            dropped_late: 0,
        }
    }

    /// Replace the applet advertising floods are created with.
    pub fn with_flood_applet(mut self, applet: Applet) -> Self {
        self.flood_applet = applet;
        self
    }

    pub fn register(&self, sched: &mut Scheduler) {
        sched.register(TaskId::RADIO, RADIO_CONFIG);
    }

    /// Sessions whose applet returned without requeueing.
    #[inline]
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Scheduled sessions removed for running too late.
    #[inline]
    pub fn dropped_late(&self) -> u32 {
        self.dropped_late
    }

    /// Stop the radio task and drop every session. Sessions opened after
    /// this re-enable the task from an empty stack.
    pub fn kill(&mut self, sched: &mut Scheduler) {
        {
            let _irq = IrqGuard::new();
            sched.take_elapsed(TaskId::RADIO);
        }
        if self.sessions.count() > 0 {
            debug!("session: radio killed, dropping {} session(s)", self.sessions.count());
        }
        self.sessions.clear();
        sched.kill(TaskId::RADIO);
    }

    /// Radio task entry point.
    pub fn run(&mut self, sched: &mut Scheduler) {
        if sched.marker(TaskId::RADIO).event == EVENT_OFF {
            if self.sessions.count() > 0 {
                debug!("session: radio off, dropping {} session(s)", self.sessions.count());
            }
            self.sessions.clear();
            return;
        }

        self.resync(sched);

        let scrapped = self.sessions.flush();
        let late = self
            .sessions
            .flush_where(|s| s.is_scheduled() && s.counter < -SESSION_LATE_LIMIT);
        if late > 0 {
            warn!("session: flushed {} late session(s)", late);
            self.dropped_late = self.dropped_late.wrapping_add(late as u32);
        }
        if scrapped > 0 {
            trace!("session: flushed {} scrapped session(s)", scrapped);
        }

        if let Some(id) = self.sessions.top() {
            self.run_session(id);
        }
        self.rearm(sched);
    }

    fn run_session(&mut self, id: SessionId) {
        let order = self.sessions.bump_seq();
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.counter > 0 {
            return;
        }
        trace!("session: run #{} late by {}", id.seq, session.lateness());
        session.requeue = None;
        (session.applet)(session);

        match session.requeue.take() {
            Some(ticks) if !session.netstate.contains(NetState::SCRAP) => {
                session.counter = ticks;
                session.order = order;
            }
            _ => {
                self.sessions.drop_session(id);
                self.completed = self.completed.wrapping_add(1);
            }
        }
    }

    /// Bring session counters up to the present.
    pub(crate) fn resync(&mut self, sched: &mut Scheduler) {
        let elapsed = {
            let _irq = IrqGuard::new();
            sched.take_elapsed(TaskId::RADIO)
        };
        if elapsed > 0 {
            self.sessions.refresh(elapsed);
        }
    }

    /// Point the radio marker at the next due session, or park it.
    pub(crate) fn rearm(&mut self, sched: &mut Scheduler) {
        match self.sessions.top().and_then(|id| self.sessions.get(id)) {
            Some(session) => {
                sched.activate(TaskId::RADIO, RADIO_RUN, session.counter.max(0));
            }
            None => {
                sched.park(TaskId::RADIO);
            }
        }
    }
}

impl Default for Dll {
    fn default() -> Self {
        Self::new(NetConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
