//! Notification port: telling requesters about grants and expiries.
//!
//! The scheduler hands every [`Notice`] to a [`NotificationSink`] after the
//! tenant lock is released. Delivery is fire-and-forget: a sink error is
//! logged and dropped, and the transition that produced the notice stands.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Generation, RequesterId, TenantId};

/// What happened to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Slot was free on request; confirm within the reservation TTL.
    ReservationGranted,
    /// Recipient reached the head of the queue; confirm within the reservation TTL.
    SessionGrantedAfterWait,
    /// Recipient did not confirm in time and lost the turn.
    ReservationExpired,
    /// Active session hit its TTL and was taken back.
    SessionReclaimed,
    /// Recipient moved up the queue. Only sent when queue-move notices are enabled.
    QueuePositionChanged,
}

impl NoticeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReservationGranted => "reservation_granted",
            Self::SessionGrantedAfterWait => "session_granted_after_wait",
            Self::ReservationExpired => "reservation_expired",
            Self::SessionReclaimed => "session_reclaimed",
            Self::QueuePositionChanged => "queue_position_changed",
        }
    }
}

/// Payload delivered to a requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub tenant: TenantId,
    pub requester: RequesterId,
    pub kind: NoticeKind,
    pub job_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    /// Confirmation window for grant notices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_within_ms: Option<u64>,
    /// New 1-based queue position for queue-move notices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Scheduler clock time of the transition, RFC 3339 on the wire.
    pub issued_at: DateTime<Utc>,
}

impl Notice {
    pub(crate) fn new(
        tenant: &TenantId,
        requester: &RequesterId,
        kind: NoticeKind,
        job_label: &str,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant: tenant.clone(),
            requester: requester.clone(),
            kind,
            job_label: job_label.to_string(),
            generation: None,
            confirm_within_ms: None,
            position: None,
            issued_at,
        }
    }

    #[must_use]
    pub(crate) fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    #[must_use]
    pub(crate) fn with_confirm_window_ms(mut self, ms: u64) -> Self {
        self.confirm_within_ms = Some(ms);
        self
    }

    #[must_use]
    pub(crate) fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Human-readable one-liner for chat transports.
    #[must_use]
    pub fn summary(&self) -> String {
        let secs = self.confirm_within_ms.map_or(0, |ms| ms.div_ceil(1000));
        match self.kind {
            NoticeKind::ReservationGranted => format!(
                "It's your turn for `{}`. Start within {secs}s or the slot passes on.",
                self.job_label
            ),
            NoticeKind::SessionGrantedAfterWait => format!(
                "You're up for `{}`. Start within {secs}s or the slot passes on.",
                self.job_label
            ),
            NoticeKind::ReservationExpired => format!(
                "Your turn for `{}` lapsed. Request again to rejoin the queue.",
                self.job_label
            ),
            NoticeKind::SessionReclaimed => format!(
                "Your session for `{}` ran out of time and was reclaimed.",
                self.job_label
            ),
            NoticeKind::QueuePositionChanged => format!(
                "You're now #{} in line for `{}`.",
                self.position.unwrap_or(0),
                self.job_label
            ),
        }
    }
}

/// Delivery failures reported by a sink.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("recipient {0} is unreachable")]
    Unreachable(RequesterId),

    #[error("notification channel closed")]
    ChannelClosed,

    #[error("notification backend error: {0}")]
    Backend(String),
}

/// Delivery backend for notices.
///
/// Implementations must not block; hand the notice off and return.
pub trait NotificationSink: Send + Sync {
    /// Sink identifier used in logs.
    fn name(&self) -> &'static str;

    /// Deliver a notice.
    fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Deliver a notice, logging and swallowing any failure.
pub(crate) fn deliver(sink: &dyn NotificationSink, notice: &Notice) {
    match sink.notify(notice) {
        Ok(()) => debug!(
            sink = sink.name(),
            tenant = %notice.tenant,
            requester = %notice.requester,
            kind = notice.kind.as_str(),
            "Notice delivered"
        ),
        Err(err) => warn!(
            sink = sink.name(),
            tenant = %notice.tenant,
            requester = %notice.requester,
            kind = notice.kind.as_str(),
            error = %err,
            "Notice delivery failed; transition stands"
        ),
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn name(&self) -> &'static str {
        "null"
    }

    fn notify(&self, _notice: &Notice) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Sink forwarding notices into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    /// Create a sink and the receiver a transport task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.tx
            .send(notice.clone())
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

/// In-memory sink that records notices; can be told some recipients are unreachable.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    delivered: Mutex<Vec<Notice>>,
    unreachable: Mutex<HashSet<RequesterId>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `requester` fail with [`NotifyError::Unreachable`].
    pub fn mark_unreachable(&self, requester: impl Into<RequesterId>) {
        self.unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(requester.into());
    }

    /// Everything delivered so far.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain delivered notices.
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.delivered.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Kinds delivered to one requester, in delivery order.
    #[must_use]
    pub fn kinds_for(&self, requester: &str) -> Vec<NoticeKind> {
        self.notices()
            .into_iter()
            .filter(|n| n.requester.as_str() == requester)
            .map(|n| n.kind)
            .collect()
    }
}

impl NotificationSink for MemoryNotifier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        if self
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&notice.requester)
        {
            return Err(NotifyError::Unreachable(notice.requester.clone()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
        Ok(())
    }
}
