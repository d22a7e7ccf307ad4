//! Board port: read-only views of a tenant's slot for presentation layers.
//!
//! The scheduler renders a [`SlotSnapshot`] after every transition. Renders
//! are dispatched outside the tenant lock, so two renders for the same tenant
//! can arrive out of order; `revision` is strictly increasing per tenant and
//! lets a board keep only the newest.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::{Generation, RequesterId, TenantId};

/// Which phase the slot is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Idle,
    Reserved,
    Active,
}

/// Current holder of the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderView {
    pub requester: RequesterId,
    pub job_label: String,
    pub generation: Generation,
    /// Time left before the TTL reclaims the slot.
    pub remaining_ms: u64,
}

/// One queued requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntryView {
    /// 1-based.
    pub position: usize,
    pub requester: RequesterId,
    pub job_label: String,
    pub waited_ms: u64,
}

/// Point-in-time view of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub tenant: TenantId,
    pub revision: u64,
    pub phase: SlotPhase,
    pub reservation: Option<HolderView>,
    pub active: Option<HolderView>,
    /// A finished session's settle delay is still running; nobody is granted until it ends.
    pub handoff_pending: bool,
    pub queue: Vec<QueueEntryView>,
}

impl SlotSnapshot {
    /// Holder in either phase.
    #[must_use]
    pub fn holder(&self) -> Option<&HolderView> {
        self.active.as_ref().or(self.reservation.as_ref())
    }

    /// Slot free with nobody waiting and no hand-off pending.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.phase == SlotPhase::Idle && self.queue.is_empty() && !self.handoff_pending
    }

    /// Plain-text board, one line per entry.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[{}] rev {}", self.tenant, self.revision);
        match (&self.active, &self.reservation) {
            (Some(a), _) => {
                let _ = writeln!(
                    out,
                    "  running: {} ({}) {}s left",
                    a.requester,
                    a.job_label,
                    a.remaining_ms / 1000
                );
            }
            (None, Some(r)) => {
                let _ = writeln!(
                    out,
                    "  reserved: {} ({}) {}s to start",
                    r.requester,
                    r.job_label,
                    r.remaining_ms / 1000
                );
            }
            (None, None) if self.handoff_pending => {
                let _ = writeln!(out, "  settling");
            }
            (None, None) => {
                let _ = writeln!(out, "  free");
            }
        }
        for entry in &self.queue {
            let _ = writeln!(
                out,
                "  {}. {} ({})",
                entry.position, entry.requester, entry.job_label
            );
        }
        out
    }
}

/// Presentation layer hook; purely observational.
pub trait BoardSink: Send + Sync {
    fn render(&self, snapshot: &SlotSnapshot);
}

/// Board that ignores renders.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBoard;

impl BoardSink for NullBoard {
    fn render(&self, _snapshot: &SlotSnapshot) {}
}

/// Board publishing the newest snapshot per tenant on a tokio watch channel.
#[derive(Debug)]
pub struct WatchBoard {
    tx: watch::Sender<BTreeMap<TenantId, SlotSnapshot>>,
}

impl Default for WatchBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchBoard {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { tx }
    }

    /// Subscribe to board updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<TenantId, SlotSnapshot>> {
        self.tx.subscribe()
    }

    /// Newest snapshot seen for a tenant.
    #[must_use]
    pub fn latest(&self, tenant: &TenantId) -> Option<SlotSnapshot> {
        self.tx.borrow().get(tenant).cloned()
    }
}

impl BoardSink for WatchBoard {
    fn render(&self, snapshot: &SlotSnapshot) {
        self.tx.send_if_modified(|boards| {
            let stale = boards
                .get(&snapshot.tenant)
                .is_some_and(|current| current.revision >= snapshot.revision);
            if stale {
                return false;
            }
            boards.insert(snapshot.tenant.clone(), snapshot.clone());
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(revision: u64) -> SlotSnapshot {
        SlotSnapshot {
            tenant: "guild".into(),
            revision,
            phase: SlotPhase::Reserved,
            reservation: Some(HolderView {
                requester: "alice".into(),
                job_label: "receipts".into(),
                generation: Generation::new(1),
                remaining_ms: 179_000,
            }),
            active: None,
            handoff_pending: false,
            queue: vec![QueueEntryView {
                position: 1,
                requester: "bob".into(),
                job_label: "menus".into(),
                waited_ms: 0,
            }],
        }
    }

    #[test]
    fn watch_board_keeps_newest_revision() {
        let board = WatchBoard::new();
        let tenant = TenantId::from("guild");
        board.render(&snapshot(2));
        board.render(&snapshot(1));
        assert_eq!(board.latest(&tenant).unwrap().revision, 2);
        board.render(&snapshot(3));
        assert_eq!(board.latest(&tenant).unwrap().revision, 3);
    }

    #[test]
    fn render_plain_lists_holder_and_queue() {
        let text = snapshot(1).render_plain();
        assert!(text.contains("reserved: alice (receipts) 179s to start"));
        assert!(text.contains("1. bob (menus)"));
    }

    #[test]
    fn holder_prefers_active() {
        let mut snap = snapshot(1);
        assert_eq!(snap.holder().unwrap().requester.as_str(), "alice");
        assert!(!snap.is_quiet());
        snap.reservation = None;
        snap.queue.clear();
        snap.phase = SlotPhase::Idle;
        assert!(snap.holder().is_none());
        assert!(snap.is_quiet());
    }
}
