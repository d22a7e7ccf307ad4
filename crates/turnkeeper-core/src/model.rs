//! Identifiers and slot records shared by the scheduler, registry and ports.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque identifier of an independent capacity domain (a server or organisation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque identifier of whoever asks for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequesterId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequesterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Stamp identifying one specific occupancy of a tenant's slot.
///
/// Strictly increasing per tenant. Timer callbacks carry the generation they
/// were armed for and do nothing once the slot has moved on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A requester waiting in the FIFO queue.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub requester: RequesterId,
    pub job_label: String,
    /// Arrival order; strictly increasing along the queue.
    pub seq: u64,
    /// Only used for reporting wait time.
    pub enqueued_at: Instant,
}

/// Offered but unconfirmed claim on the slot.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub requester: RequesterId,
    pub job_label: String,
    pub granted_at: Instant,
    pub expires_at: Instant,
    pub generation: Generation,
}

/// Confirmed use of the slot.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub requester: RequesterId,
    pub job_label: String,
    pub started_at: Instant,
    pub expires_at: Instant,
    pub generation: Generation,
}

/// A tenant's single unit of capacity.
#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Idle,
    Reserved(Reservation),
    Active(ActiveSession),
}

impl Slot {
    /// Requester currently holding the slot, in either phase.
    #[must_use]
    pub fn holder(&self) -> Option<&RequesterId> {
        match self {
            Self::Idle => None,
            Self::Reserved(r) => Some(&r.requester),
            Self::Active(a) => Some(&a.requester),
        }
    }

    /// Generation of the current occupancy.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        match self {
            Self::Idle => None,
            Self::Reserved(r) => Some(r.generation),
            Self::Active(a) => Some(a.generation),
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}
