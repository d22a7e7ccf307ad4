//! turnkeeper-core: Core library for turnkeeper
//!
//! Fair, TTL-bounded turn scheduling for a single shared OCR pipeline per
//! tenant. Requesters get a short reservation to confirm they are ready, then
//! an exclusive session; everyone else waits in FIFO order.
//!
//! # Architecture
//!
//! ```text
//! caller → SchedulerRegistry → TenantScheduler ─▶ NotificationSink
//!                                   │  ▲       └─▶ BoardSink
//!                                   ▼  │
//!                                  Clock (timers)
//! ```
//!
//! # Modules
//!
//! - `scheduler`: Per-tenant slot state machine and FIFO queue
//! - `registry`: Tenant → scheduler lookup
//! - `clock`: Time source and timers (tokio-backed and manual)
//! - `model`: Identifiers, generations and slot records
//! - `notify`: Notification port and built-in sinks
//! - `board`: Slot snapshots and board sinks
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod board;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod notify;
pub mod registry;
pub mod scheduler;

pub use error::{Error, Result, SchedulerError};
pub use registry::SchedulerRegistry;
pub use scheduler::{
    AccessOutcome, CancelOutcome, CompleteOptions, RequesterStatus, SchedulerPorts,
    TenantScheduler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
