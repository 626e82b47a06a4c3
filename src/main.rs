//! # otkern Demo Firmware
//!
//! A node with every built-in task wired up:
//!
//! | Task | Slot | Behavior |
//! |------|------|----------|
//! | Radio (`Dll`) | I/O | Runs an advertising flood, then its request session |
//! | MPipe | I/O | Loopback host link, echoes frames |
//! | OTAt | Kernel | One-second heartbeat via deferred calls |
//! | Exotask 0 | Kernel | Sensor poll every 250 ms |
//! | External | External | Re-queues a beacon request every 4 s |
//!
//! Build with `--features rt` for a `thumbv7em-none-eabihf` target.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use otkern::arch::cortex_m4::CortexM4Platform;
use otkern::config::{OTAT_QUEUE_SIZE, TICK_HZ};
use otkern::kernel::{self, KernelTasks, TaskSet};
use otkern::mpipe::{MpipeDriver, MpipeTask};
use otkern::otapi::{AdvertTemplate, SessionTemplate};
use otkern::otat::{Otat, OtatCall};
use otkern::scheduler::Scheduler;
use otkern::session::{Dll, NetConfig, Session, SessionFlags};
use otkern::sysqueue::{QueueNode, SysQueue};
use otkern::task::{TaskConfig, TaskId};

static HEARTBEATS: AtomicU32 = AtomicU32::new(0);
static BEACONS: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Host link
// ---------------------------------------------------------------------------

/// Loopback link: whatever is transmitted is received again.
struct Loopback {
    frame: [u8; 32],
    len: Option<usize>,
}

impl MpipeDriver for Loopback {
    fn listen(&mut self) {}

    fn take_frame(&mut self, buf: &mut [u8]) -> Option<usize> {
        let len = self.len.take()?;
        buf[..len].copy_from_slice(&self.frame[..len]);
        Some(len)
    }

    fn transmit(&mut self, frame: &[u8]) -> bool {
        let len = frame.len().min(self.frame.len());
        self.frame[..len].copy_from_slice(&frame[..len]);
        kernel::platform_ot_preempt(TaskId::MPIPE);
        true
    }

    fn tx_complete(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.len = None;
    }

    fn close(&mut self) {}
}

fn echo(frame: &[u8], reply: &mut [u8]) -> Option<usize> {
    let len = frame.len().min(reply.len());
    reply[..len].copy_from_slice(&frame[..len]);
    Some(len)
}

// ---------------------------------------------------------------------------
// Application tasks
// ---------------------------------------------------------------------------

struct App {
    samples: u32,
}

impl TaskSet for App {
    fn run(&mut self, task: TaskId, sched: &mut Scheduler) {
        if !sched.marker(task).is_enabled() {
            return;
        }
        match task.exotask_number() {
            Some(0) => {
                self.samples = self.samples.wrapping_add(1);
                sched.set_next(task, (TICK_HZ / 4) as i32);
            }
            Some(_) => sched.kill(task),
            None => {
                BEACONS.fetch_add(1, Ordering::Relaxed);
                sched.set_next(task, (TICK_HZ * 4) as i32);
            }
        }
    }
}

fn heartbeat() {
    HEARTBEATS.fetch_add(1, Ordering::Relaxed);
}

fn beacon(session: &mut Session) {
    session.extra = BEACONS.load(Ordering::Relaxed) as u16;
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().expect("core peripherals taken twice");
    let mut platform = CortexM4Platform::new(cp.SYST);

    let mut slots: [Option<QueueNode<OtatCall>>; OTAT_QUEUE_SIZE] = [None; OTAT_QUEUE_SIZE];
    let otat = Otat::new(SysQueue::init(&mut slots).expect("OTAt queue has slots"));
    let dll = Dll::new(NetConfig::new(0xF0, SessionFlags::empty(), 0x07, 0x10));
    let mpipe = MpipeTask::new(
        Loopback {
            frame: [0; 32],
            len: None,
        },
        echo,
    );
    let mut tasks = KernelTasks::new(dll, mpipe, otat, App { samples: 0 });

    let mut sched = Scheduler::new();
    tasks.register(&mut sched);
    let sensor = TaskId::exotask(0).expect("build has exotasks");
    sched.register(sensor, TaskConfig::new(1, 32));
    sched.register(TaskId::EXTERNAL, TaskConfig::new(4, 255));
    sched.activate(sensor, 1, 0);
    sched.activate(TaskId::EXTERNAL, 1, TICK_HZ as i32);

    tasks.mpipe.open(&mut sched);
    tasks
        .otat
        .schedule(&mut sched, heartbeat, 1, TICK_HZ as u16)
        .expect("heartbeat queued");
    let advert = AdvertTemplate {
        duration: 64,
        channel: 0,
        subnet: 0,
    };
    let request = SessionTemplate {
        subnet: 0x05,
        subnetmask: 0x0F,
        ..SessionTemplate::default()
    };
    tasks
        .dll
        .task_advertise(&mut sched, &advert, &request, beacon)
        .expect("advert sessions free");

    kernel::run_forever(&mut sched, &mut platform, &mut tasks)
}
