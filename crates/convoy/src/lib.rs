//! Convoy - operator tooling for coordinated repository loops.
//!
//! Every command maps onto one `convoy_core` operation. `convoy supervise`
//! hosts the deadlock detector, health checks, orphan sweeps and the
//! decision coordinator in one long-running process.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
