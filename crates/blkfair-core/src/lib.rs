//! blkfair-core: proportional-share block I/O scheduling.
//!
//! A budget-driven hierarchical fair-queueing engine for multiplexing
//! one backing device among many producers, with deterministic
//! bandwidth distribution and device-aware heuristics.
//!
//! # Architecture
//!
//! ```text
//! insert ─► Queue (sector store + FIFO + chooser)
//!               │ activation
//!               ▼
//!         Hierarchy (groups × {RT,BE,IDLE} service trees,
//!                    augmented RB-trees, virtual time)
//!               │ selection
//!               ▼
//!         Dispatch (budgets, quanta, idling, expiry)
//!               │ feedback
//!               ▼
//!         Adaptive loop (budget table, peak rate, NCQ, profiling)
//! ```
//!
//! # Modules
//!
//! - `scheduler`: device-wide state and the driver-facing surface
//! - `dispatch`: selection, service rounds, idling, expiry
//! - `hierarchy`: groups, activation walks, service charging
//! - `service_tree`: augmented red-black trees and the EEVDF query
//! - `queue`: per-producer request stores and the head-biased chooser
//! - `entity`: scheduling entities and fixed-point virtual time
//! - `feedback`: budget learning, peak-rate autotuning, NCQ detection
//! - `profile`: per-producer think-time and seek estimators
//! - `ioprio`: priority classes, weights, and boosting
//! - `config`: tunables and the attribute surface
//!
//! # Concurrency
//!
//! The core is a pure state machine: all methods take `&mut self`, and
//! the embedder serializes access (the device lock). Timers and
//! deferred kicks are surfaced as data, never owned threads.
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

mod arena;
pub mod config;
mod dispatch;
mod entity;
pub mod error;
mod feedback;
mod hierarchy;
pub mod ioprio;
mod profile;
mod queue;
mod request;
mod scheduler;
mod service_tree;

pub use config::SchedConfig;
pub use entity::RATE_SHIFT;
pub use error::{Error, Result};
pub use feedback::ExpireReason;
pub use hierarchy::GroupId;
pub use ioprio::{IoPrio, IoPrioClass};
pub use request::{Direction, RequestDesc, RequestId};
pub use scheduler::{DispatchedRequest, MayQueue, QueueStats, Scheduler, SchedulerStats};
