//! # otkern: Cooperative Tick Kernel for Low-Power Radio Nodes
//!
//! A tick-resolution cooperative scheduler, a deferred-call facility and a
//! bounded communication-session core for microcontrollers without an OS.
//!
//! ## Overview
//!
//! Work is split into *tasks*, each described by a small
//! [`TaskMarker`](task::TaskMarker): a phase (`event`), a timing budget
//! (`reserve`, `latency`) and ticks until due (`next_event`). Every scheduler
//! pass subtracts the elapsed ticks, runs the highest-priority due task to
//! completion and tells the platform how long it may sleep.
//!
//! Protocol dialogs are *sessions* allocated from a fixed stack and run by
//! the radio task. Many cheap timers share one task through OTAt, a
//! cron-like queue of deferred calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │        Application (exotasks · external task)           │
//! ├────────────────────────────────────────────────────────┤
//! │    Task API (otapi.rs)        Kernel table (kernel.rs)  │
//! │    immediate · schedule ·     KernelTasks · preempt ·   │
//! │    advertise                  run_forever               │
//! ├──────────────┬──────────────┬─────────────┬────────────┤
//! │ Sessions     │ OTAt         │ MPipe       │ Sync       │
//! │ session.rs   │ otat.rs      │ mpipe.rs    │ sync.rs    │
//! │ ─ stack      │ ─ schedule() │ ─ states 0-4│ ─ IrqGuard │
//! │ ─ Dll::run() │ ─ run()      │             │ ─ Preempt  │
//! ├──────────────┴──────┬───────┴─────────────┴────────────┤
//! │ Scheduler           │  System Queue (sysqueue.rs)       │
//! │ scheduler.rs        │  sorted · extend · clock · pop    │
//! ├─────────────────────┴──────────────────────────────────┤
//! │              Task Model (task.rs)                       │
//! │    TaskId · PriorityClass · TaskMarker · SavedStack     │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │    SysTick time base · WFI idle · PSP swap             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Priority Policy
//!
//! Table order is priority order: radio and MPipe (I/O), then OTAt and the
//! exotasks, then the external task. Among due tasks the first in table
//! order runs. A due task whose `reserve` would push a higher-priority
//! task past its latency budget waits for a later pass.
//!
//! ## Memory Model
//!
//! - **No heap** by default: the task table, queues and session stack are
//!   fixed arrays. The `alloc` feature lets a System Queue own its storage.
//! - **Explicit singletons**: the scheduler and every subsystem are plain
//!   values passed by reference, so tests build independent instances.
//! - **Critical sections**: the `critical-section` crate, backed by
//!   `cortex-m`'s single-core implementation on target.
//!
//! ## Features
//!
//! - `dynamic-dispatch` (default): per-task callbacks override the table.
//! - `multi-context`: per-task saved stacks swapped around dispatch.
//! - `alloc`: heap-backed System Queues.
//! - `rt`: the demo firmware binary.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod task;
pub mod sync;
pub mod sysqueue;
pub mod scheduler;
pub mod otat;
pub mod session;
pub mod otapi;
pub mod mpipe;
pub mod kernel;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;

#[cfg(test)]
mod testing;
