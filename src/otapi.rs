//! # Task API
//!
//! Session constructors used by application and protocol code. Every
//! constructor resolves addressing through [`compose`], so the three entry
//! points produce identical subnet and flag values for identical templates:
//!
//! ```text
//!   effective = (defaults & !mask) | (requested & mask)
//! ```
//!
//! The constructors only allocate and queue sessions; the dialog itself runs
//! later, when the scheduler dispatches the radio task.

use log::{debug, warn};

use crate::scheduler::Scheduler;
use crate::session::{Applet, Dll, NetConfig, NetState, SessionFlags, SessionId};

/// Addressing requested for a session. Bits outside the masks come from the
/// network defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionTemplate {
    /// Request channel. 0 selects the default request channel.
    pub channel: u8,
    pub subnet: u8,
    pub subnetmask: u8,
    pub flags: u8,
    pub flagmask: u8,
}

/// Advertising flood parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvertTemplate {
    /// Flood length in ticks. 0 skips the flood.
    pub duration: u16,
    /// Advertising channel. 0 selects the default background channel.
    pub channel: u8,
    pub subnet: u8,
}

/// Merge requested bits into defaults under `mask`.
#[inline]
pub const fn compose(defaults: u8, requested: u8, mask: u8) -> u8 {
    (defaults & !mask) | (requested & mask)
}

/// Effective subnet and flags for a session built from `template`, with
/// `subnet` as the requested subnet.
fn addressing(netconf: &NetConfig, template: &SessionTemplate, subnet: u8) -> (u8, SessionFlags) {
    let subnet = compose(netconf.subnet, subnet, template.subnetmask);
    let flags = compose(netconf.flags.bits(), template.flags, template.flagmask);
    (subnet, SessionFlags::from_bits_retain(flags))
}

fn pick(channel: u8, default: u8) -> u8 {
    if channel == 0 {
        default
    } else {
        channel
    }
}

impl Dll {
    /// Queue a request dialog to start as soon as the radio task is free.
    /// Returns `None` when no session is free.
    pub fn task_immediate(&mut self, sched: &mut Scheduler, template: &SessionTemplate, applet: Applet) -> Option<SessionId> {
        self.open(sched, template, applet, 0)
    }

    /// Queue a request dialog `offset` ticks from now. Returns `None` when no
    /// session is free.
    pub fn task_schedule(
        &mut self,
        sched: &mut Scheduler,
        template: &SessionTemplate,
        applet: Applet,
        offset: u16,
    ) -> Option<SessionId> {
        self.open(sched, template, applet, offset)
    }

    /// Queue an advertising flood followed by the request session.
    ///
    /// Needs two free sessions even when `advert.duration == 0`, which skips
    /// the flood and allocates only the request. Nothing is allocated unless
    /// two sessions are free. Returns the request session.
    pub fn task_advertise(
        &mut self,
        sched: &mut Scheduler,
        advert: &AdvertTemplate,
        template: &SessionTemplate,
        applet: Applet,
    ) -> Option<SessionId> {
        if self.sessions.numfree() < 2 {
            warn!("otapi: advertise needs 2 free sessions, {} available", self.sessions.numfree());
            return None;
        }
        self.resync(sched);

        if advert.duration != 0 {
            let channel = pick(advert.channel, self.netconf.bg_channel);
            let state = NetState::BG | NetState::STREAM | NetState::INIT | NetState::REQTX;
            let flood = self.sessions.session_new(self.flood_applet, 0, channel, state)?;
            let (subnet, flags) = addressing(&self.netconf, template, advert.subnet);
            if let Some(session) = self.sessions.get_mut(flood) {
                session.subnet = subnet;
                session.flags = flags;
            }
            debug!("otapi: flood on {:#04x} for {} ticks", channel, advert.duration);
        }

        let channel = pick(template.channel, self.netconf.req_channel);
        let request = self.sessions.session_new(applet, advert.duration, channel, NetState::REQTX)?;
        let (subnet, flags) = addressing(&self.netconf, template, template.subnet);
        if let Some(session) = self.sessions.get_mut(request) {
            session.subnet = subnet;
            session.flags = flags;
        }
        self.rearm(sched);
        Some(request)
    }

    fn open(&mut self, sched: &mut Scheduler, template: &SessionTemplate, applet: Applet, offset: u16) -> Option<SessionId> {
        self.resync(sched);
        let channel = pick(template.channel, self.netconf.req_channel);
        let id = self
            .sessions
            .session_new(applet, offset, channel, NetState::INIT | NetState::REQTX)?;
        let (subnet, flags) = addressing(&self.netconf, template, template.subnet);
        if let Some(session) = self.sessions.get_mut(id) {
            session.subnet = subnet;
            session.flags = flags;
        }
        self.rearm(sched);
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SESSION_STACK_SIZE;
    use crate::session::Session;
    use crate::task::TaskId;

    fn applet(_: &mut Session) {}

    fn setup() -> (Scheduler, Dll) {
        let mut sched = Scheduler::new();
        let dll = Dll::new(NetConfig::new(0xAA, SessionFlags::from_bits_retain(0x50), 0x20, 0x30));
        dll.register(&mut sched);
        (sched, dll)
    }

    fn template() -> SessionTemplate {
        SessionTemplate {
            channel: 0x31,
            subnet: 0x3C,
            subnetmask: 0x0F,
            flags: 0x03,
            flagmask: 0x0F,
        }
    }

    fn fill(dll: &mut Dll, leave_free: usize) {
        while dll.sessions.numfree() > leave_free {
            dll.sessions.session_new(applet, 100, 0x40, NetState::INIT).unwrap();
        }
    }

    #[test]
    fn test_compose_mask() {
        assert_eq!(compose(0xAA, 0x3C, 0x0F), 0xAC);
        assert_eq!(compose(0xAA, 0x3C, 0x00), 0xAA);
        assert_eq!(compose(0xAA, 0x3C, 0xFF), 0x3C);
    }

    #[test]
    fn test_every_constructor_composes_alike() {
        let (mut sched, mut dll) = setup();
        let t = template();
        let advert = AdvertTemplate {
            duration: 0,
            channel: 0,
            subnet: 0,
        };

        let a = dll.task_immediate(&mut sched, &t, applet).unwrap();
        let b = dll.task_schedule(&mut sched, &t, applet, 12).unwrap();
        let c = dll.task_advertise(&mut sched, &advert, &t, applet).unwrap();
        for id in [a, b, c] {
            let s = dll.sessions.get(id).unwrap();
            assert_eq!(s.subnet, 0xAC);
            assert_eq!(s.flags.bits(), 0x53);
            assert_eq!(s.channel, 0x31);
        }
    }

    #[test]
    fn test_immediate_and_scheduled_sessions() {
        let (mut sched, mut dll) = setup();
        let t = SessionTemplate::default();

        let now = dll.task_immediate(&mut sched, &t, applet).unwrap();
        let later = dll.task_schedule(&mut sched, &t, applet, 40).unwrap();
        let s = dll.sessions.get(now).unwrap();
        assert_eq!(s.netstate, NetState::INIT | NetState::REQTX);
        assert_eq!(s.counter, 0);
        assert!(!s.is_scheduled());
        assert_eq!(s.channel, 0x30, "channel 0 takes the default request channel");
        assert_eq!(s.subnet, 0xAA, "an empty mask keeps the default subnet");
        assert_eq!(dll.sessions.get(later).map(|s| s.counter), Some(40));

        let radio = sched.marker(TaskId::RADIO);
        assert!(radio.is_enabled());
        assert_eq!(radio.next_event, 0, "radio armed for the immediate session");
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let (mut sched, mut dll) = setup();
        fill(&mut dll, 0);
        assert!(dll.task_immediate(&mut sched, &template(), applet).is_none());
        assert!(dll.task_schedule(&mut sched, &template(), applet, 5).is_none());
        assert_eq!(dll.sessions.numfree(), 0);
    }

    #[test]
    fn test_advertise_with_one_free_allocates_nothing() {
        let (mut sched, mut dll) = setup();
        fill(&mut dll, 1);
        let advert = AdvertTemplate {
            duration: 64,
            channel: 0x22,
            subnet: 0x3C,
        };
        assert!(dll.task_advertise(&mut sched, &advert, &template(), applet).is_none());
        assert_eq!(dll.sessions.numfree(), 1);
        assert_eq!(dll.sessions.count(), SESSION_STACK_SIZE - 1);
    }

    #[test]
    fn test_advertise_allocates_flood_and_request() {
        let (mut sched, mut dll) = setup();
        let advert = AdvertTemplate {
            duration: 64,
            channel: 0,
            subnet: 0x3C,
        };
        let before = dll.sessions.numfree();
        let request = dll.task_advertise(&mut sched, &advert, &template(), applet).unwrap();
        assert_eq!(dll.sessions.numfree(), before - 2);

        let flood = dll.sessions.top().unwrap();
        assert_ne!(flood, request);
        let f = dll.sessions.get(flood).unwrap();
        assert_eq!(f.netstate, NetState::BG | NetState::STREAM | NetState::INIT | NetState::REQTX);
        assert_eq!(f.channel, 0x20, "flood uses the default background channel");
        assert_eq!(f.subnet, 0xAC);
        assert_eq!(f.counter, 0);

        let r = dll.sessions.get(request).unwrap();
        assert_eq!(r.netstate, NetState::REQTX);
        assert_eq!(r.channel, 0x31);
        assert_eq!(r.counter, 64, "request follows the flood");
        assert_eq!(dll.sessions.follower(), Some(request));
    }

    #[test]
    fn test_advertise_without_flood() {
        let (mut sched, mut dll) = setup();
        fill(&mut dll, 1);
        let advert = AdvertTemplate::default();
        assert!(dll.task_advertise(&mut sched, &advert, &template(), applet).is_none());
        assert_eq!(dll.sessions.numfree(), 1, "a flood-less advert still needs two free");

        dll.sessions.clear();
        fill(&mut dll, 2);
        let request = dll.task_advertise(&mut sched, &advert, &template(), applet).unwrap();
        assert_eq!(dll.sessions.numfree(), 1, "only the request session is allocated");
        let r = dll.sessions.get(request).unwrap();
        assert_eq!(r.netstate, NetState::REQTX);
        assert_eq!(r.counter, 0);
    }

    #[test]
    fn test_sessions_run_in_order_through_scheduler() {
        use crate::scheduler::Dispatch;
        use crate::testing::MockPlatform;
        use std::cell::RefCell;

        thread_local! {
            static RAN: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
        }
        fn note(s: &mut Session) {
            RAN.with(|r| r.borrow_mut().push(s.channel));
        }
        struct Radio<'a>(&'a mut Dll);
        impl Dispatch for Radio<'_> {
            fn dispatch(&mut self, task: TaskId, sched: &mut Scheduler) {
                if task == TaskId::RADIO {
                    self.0.run(sched);
                }
            }
        }

        let (mut sched, mut dll) = setup();
        dll.flood_applet = note;
        let mut platform = MockPlatform::new();
        platform.idle_advances = true;

        let mut t = template();
        t.channel = 0x35;
        dll.task_schedule(&mut sched, &t, note, 30).unwrap();
        t.channel = 0x31;
        let advert = AdvertTemplate {
            duration: 10,
            channel: 0x22,
            subnet: 0,
        };
        dll.task_advertise(&mut sched, &advert, &t, note).unwrap();

        for _ in 0..8 {
            sched.run(&mut platform, &mut Radio(&mut dll));
        }
        assert_eq!(RAN.with(|r| r.borrow().clone()), vec![0x22, 0x31, 0x35]);
        assert_eq!(dll.sessions.count(), 0);
    }
}
