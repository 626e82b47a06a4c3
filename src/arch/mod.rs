//! # Architecture Abstraction Layer
//!
//! Hardware [`Platform`](crate::scheduler::Platform) implementations. Only
//! built for bare-metal ARM targets; host builds use the scheduler with a
//! test platform instead.

pub mod cortex_m4;
