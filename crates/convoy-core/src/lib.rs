//! # Convoy Core
//!
//! Coordination substrate for autonomous loops that share one repository.
//!
//! Every component talks through a shared `SQLite` store:
//!
//! - [`events`] - durable append-only event log with per-subscriber cursors
//! - [`locks`] - exclusive TTL-bounded resource locks
//! - [`deadlock`] - wait-for graph cycle detection and victim selection
//! - [`checkpoint`] - snapshot and rollback over [`vcs`] primitives
//! - [`regression`] - passing history and blame attribution
//! - [`health`] - heartbeats and degradation transitions
//! - [`orphan`] - reconciliation sweeps
//! - [`coordinator`] - conflict policy and human decisions
//! - [`session`] - loop-side client: heartbeats, locks, checkpoints, directives
//! - [`supervisor`] - the long-running monitor that drives the periodic tasks
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod deadlock;
mod error;
pub mod events;
pub mod health;
pub mod locks;
pub mod orphan;
pub mod priority;
pub mod regression;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod vcs;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{load_config, load_config_file, CoordinationConfig};
pub use coordinator::{
    Coordinator, Decision, DecisionAction, DecisionKind, DecisionOption, DecisionStatus, NewDecision,
    PausedOwner, TickReport,
};
pub use deadlock::{Deadlock, DeadlockDetector, LowestPriorityPolicy, VictimPolicy, WaitEdge};
pub use error::{Error, ErrorClass, Result};
pub use events::{Event, EventFilter, EventLog, EventPriority, EventType, NewEvent, StartAt};
pub use health::{ComponentHealth, HealthManager, HealthStatus, HealthThresholds, HealthTransition};
pub use locks::{AcquireRequest, Acquisition, Lock, LockManager, PendingRequest};
pub use orphan::{OrphanCleaner, SweepFailure, SweepPass, SweepReport};
pub use priority::Priorities;
pub use regression::{PassingRecord, Regression, RegressionMonitor, Verifier};
pub use session::{Directive, DirectiveEffect, LoopSession, WorkOutcome, WorkUnit};
pub use store::Store;
pub use supervisor::{shutdown_signal, CycleReport, Supervisor};
pub use vcs::{CommitInfo, GitRepository, InMemoryRepository, VersionControl};
