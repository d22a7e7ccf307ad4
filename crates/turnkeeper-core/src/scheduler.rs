//! Per-tenant admission scheduler for the shared OCR pipeline.
//!
//! Each tenant owns one slot, one reservation window and one FIFO queue:
//!
//! ```text
//!            request_access            begin_session
//!   IDLE ─────────────────▶ RESERVED ───────────────▶ ACTIVE
//!    ▲                         │                         │
//!    │   reservation TTL /     │    complete / cancel /  │
//!    └──── cancel ─────────────┘◀──── active TTL ────────┘
//!          (then the queue head is granted the next reservation)
//! ```
//!
//! Every reservation, session and deferred hand-off gets a fresh
//! [`Generation`]. Timers capture the generation they were armed for and do
//! nothing if the slot has moved on, so a cancel racing with an expiry that is
//! already firing converges: whichever takes the lock first wins and the other
//! is a no-op.
//!
//! All state for a tenant sits behind one mutex. Notices and board renders
//! are collected while it is held and delivered after it is released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::board::{BoardSink, HolderView, NullBoard, QueueEntryView, SlotPhase, SlotSnapshot};
use crate::clock::{Clock, TimerHandle};
use crate::config::SchedulerSettings;
use crate::error::SchedulerError;
use crate::model::{
    ActiveSession, Generation, PendingRequest, RequesterId, Reservation, Slot, TenantId,
};
use crate::notify::{self, NotificationSink, Notice, NoticeKind, NullNotifier};

/// How many lapsed reservations a tenant remembers for `Expired` diagnostics.
const LAPSE_MEMORY: usize = 64;

// ── Public operation results ────────────────────────────────────────────────

/// Result of [`TenantScheduler::request_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccessOutcome {
    /// Caller holds the slot (reserved or active) under this generation.
    Granted { generation: Generation },
    /// Caller waits at this 1-based position.
    QueuedAt { position: usize },
}

/// Options for [`TenantScheduler::complete_session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompleteOptions {
    /// Hold the slot free for this long before granting the next requester.
    pub settle_delay: Duration,
}

impl CompleteOptions {
    #[must_use]
    pub fn settle(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Use the configured default settle delay.
    #[must_use]
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::settle(settings.settle_delay())
    }
}

/// What [`TenantScheduler::cancel_request`] withdrew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    LeftQueue,
    ReleasedReservation,
    EndedSession,
}

/// Where a requester stands with a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequesterStatus {
    Reserved { generation: Generation },
    Active { generation: Generation },
    Queued { position: usize },
    Absent,
}

// ── Collaborators ───────────────────────────────────────────────────────────

/// Clock and output ports a scheduler talks to.
#[derive(Clone)]
pub struct SchedulerPorts {
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn NotificationSink>,
    pub board: Arc<dyn BoardSink>,
}

impl SchedulerPorts {
    /// Ports with the given clock and no-op notifier and board.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            notifier: Arc::new(NullNotifier),
            board: Arc::new(NullBoard),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_board(mut self, board: Arc<dyn BoardSink>) -> Self {
        self.board = board;
        self
    }
}

impl fmt::Debug for SchedulerPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerPorts")
            .field("clock", &self.clock)
            .field("notifier", &self.notifier.name())
            .finish_non_exhaustive()
    }
}

// ── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reservation,
    Active,
    Handoff,
}

#[derive(Debug, Default)]
struct TenantState {
    slot: Slot,
    /// Expiry timer for the current reservation or session.
    slot_timer: Option<TimerHandle>,
    queue: VecDeque<PendingRequest>,
    /// Generation of the hand-off postponed by a settle delay. Nothing
    /// cancels that timer; it is only ever superseded by firing.
    handoff: Option<Generation>,
    /// Requesters whose reservation lapsed, oldest first.
    lapsed: VecDeque<(RequesterId, Generation)>,
    last_generation: u64,
    last_seq: u64,
    revision: u64,
}

impl TenantState {
    fn bump_generation(&mut self) -> Generation {
        self.last_generation += 1;
        Generation::new(self.last_generation)
    }

    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    fn position_of(&self, requester: &RequesterId) -> Option<usize> {
        self.queue
            .iter()
            .position(|p| &p.requester == requester)
            .map(|index| index + 1)
    }

    fn holds(&self, requester: &RequesterId) -> bool {
        self.slot.holder() == Some(requester)
    }

    fn cancel_slot_timer(&mut self) {
        if let Some(timer) = self.slot_timer.take() {
            timer.cancel();
        }
    }

    fn remember_lapse(&mut self, requester: RequesterId, generation: Generation) {
        self.forget_lapse(&requester);
        if self.lapsed.len() >= LAPSE_MEMORY {
            self.lapsed.pop_front();
        }
        self.lapsed.push_back((requester, generation));
    }

    fn forget_lapse(&mut self, requester: &RequesterId) {
        self.lapsed.retain(|(who, _)| who != requester);
    }

    fn lapsed_generation(&self, requester: &RequesterId) -> Option<Generation> {
        self.lapsed
            .iter()
            .rev()
            .find(|(who, _)| who == requester)
            .map(|(_, generation)| *generation)
    }

    fn status_of(&self, requester: &RequesterId) -> RequesterStatus {
        match &self.slot {
            Slot::Reserved(r) if &r.requester == requester => RequesterStatus::Reserved {
                generation: r.generation,
            },
            Slot::Active(a) if &a.requester == requester => RequesterStatus::Active {
                generation: a.generation,
            },
            _ => self
                .position_of(requester)
                .map_or(RequesterStatus::Absent, |position| {
                    RequesterStatus::Queued { position }
                }),
        }
    }

    fn snapshot(&self, tenant: &TenantId, now: Instant) -> SlotSnapshot {
        let remaining_ms = |expires_at: Instant| expires_at.saturating_duration_since(now).as_millis() as u64;

        let (phase, reservation, active) = match &self.slot {
            Slot::Idle => (SlotPhase::Idle, None, None),
            Slot::Reserved(r) => (
                SlotPhase::Reserved,
                Some(HolderView {
                    requester: r.requester.clone(),
                    job_label: r.job_label.clone(),
                    generation: r.generation,
                    remaining_ms: remaining_ms(r.expires_at),
                }),
                None,
            ),
            Slot::Active(a) => (
                SlotPhase::Active,
                None,
                Some(HolderView {
                    requester: a.requester.clone(),
                    job_label: a.job_label.clone(),
                    generation: a.generation,
                    remaining_ms: remaining_ms(a.expires_at),
                }),
            ),
        };

        SlotSnapshot {
            tenant: tenant.clone(),
            revision: self.revision,
            phase,
            reservation,
            active,
            handoff_pending: self.handoff.is_some(),
            queue: self
                .queue
                .iter()
                .enumerate()
                .map(|(index, p)| QueueEntryView {
                    position: index + 1,
                    requester: p.requester.clone(),
                    job_label: p.job_label.clone(),
                    waited_ms: now.saturating_duration_since(p.enqueued_at).as_millis() as u64,
                })
                .collect(),
        }
    }

    fn audit(&self) -> Result<(), String> {
        if let Some(holder) = self.slot.holder() {
            if self.queue.iter().any(|p| &p.requester == holder) {
                return Err(format!("holder {holder} is also queued"));
            }
            if self.slot_timer.is_none() {
                return Err(format!("{holder} holds the slot without an expiry timer"));
            }
            if self.handoff.is_some() {
                return Err("deferred hand-off pending while the slot is held".to_string());
            }
        } else if self.slot_timer.is_some() {
            return Err("idle slot still has an expiry timer".to_string());
        }

        if let Some(generation) = self.slot.generation() {
            if generation.get() != self.last_generation {
                return Err(format!(
                    "slot generation {generation} is not the latest (g{})",
                    self.last_generation
                ));
            }
        }

        let mut last_seq = 0;
        for (index, entry) in self.queue.iter().enumerate() {
            if entry.seq <= last_seq {
                return Err(format!("queue not in arrival order at position {}", index + 1));
            }
            last_seq = entry.seq;
            if self
                .queue
                .iter()
                .skip(index + 1)
                .any(|later| later.requester == entry.requester)
            {
                return Err(format!("{} queued twice", entry.requester));
            }
        }

        if self.slot.is_idle() && self.handoff.is_none() && !self.queue.is_empty() {
            return Err("slot idle while requesters are waiting".to_string());
        }

        Ok(())
    }
}

/// Port calls produced by one transition, delivered after unlocking.
#[derive(Default)]
struct Effects {
    notices: Vec<Notice>,
    snapshot: Option<SlotSnapshot>,
}

struct Shared {
    tenant: TenantId,
    settings: SchedulerSettings,
    ports: SchedulerPorts,
    state: Mutex<TenantState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TenantState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> Instant {
        self.ports.clock.now()
    }

    fn notice(&self, requester: &RequesterId, kind: NoticeKind, job_label: &str) -> Notice {
        Notice::new(
            &self.tenant,
            requester,
            kind,
            job_label,
            self.ports.clock.wall_now(),
        )
    }

    /// Run `op` under the tenant lock, then deliver what it produced.
    fn transact<R>(
        self: &Arc<Self>,
        op: impl FnOnce(&Arc<Self>, &mut TenantState, &mut Effects) -> R,
    ) -> R {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.lock();
            op(self, &mut state, &mut effects)
        };
        self.flush(effects);
        result
    }

    fn flush(&self, effects: Effects) {
        for notice in &effects.notices {
            notify::deliver(self.ports.notifier.as_ref(), notice);
        }
        if let Some(snapshot) = effects.snapshot {
            self.ports.board.render(&snapshot);
        }
    }

    fn publish(&self, state: &mut TenantState, effects: &mut Effects) {
        state.revision += 1;
        effects.snapshot = Some(state.snapshot(&self.tenant, self.now()));
    }

    fn arm(self: &Arc<Self>, delay: Duration, kind: TimerKind, generation: Generation) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.ports.clock.after(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let _span = crate::tenant_span!(
                        "slot_timer",
                        shared.tenant,
                        timer = ?kind,
                        generation = generation.get()
                    )
                    .entered();
                    shared.transact(|shared, state, effects| {
                        shared.on_timer(state, kind, generation, effects);
                    });
                }
            }),
        )
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    fn request_access(
        self: &Arc<Self>,
        state: &mut TenantState,
        requester: RequesterId,
        job_label: String,
        effects: &mut Effects,
    ) -> AccessOutcome {
        if state.holds(&requester) {
            if let Some(generation) = state.slot.generation() {
                debug!(
                    tenant = %self.tenant,
                    requester = %requester,
                    generation = generation.get(),
                    "Repeat request from current holder"
                );
                return AccessOutcome::Granted { generation };
            }
        }

        if let Some(position) = state.position_of(&requester) {
            debug!(
                tenant = %self.tenant,
                requester = %requester,
                position,
                "Repeat request from queued requester"
            );
            return AccessOutcome::QueuedAt { position };
        }

        state.forget_lapse(&requester);

        if state.slot.is_idle() && state.handoff.is_none() && state.queue.is_empty() {
            let generation = self.grant(
                state,
                requester,
                job_label,
                NoticeKind::ReservationGranted,
                effects,
            );
            return AccessOutcome::Granted { generation };
        }

        let seq = state.next_seq();
        state.queue.push_back(PendingRequest {
            requester: requester.clone(),
            job_label,
            seq,
            enqueued_at: self.now(),
        });
        let position = state.queue.len();
        info!(
            tenant = %self.tenant,
            requester = %requester,
            position,
            "Queued for the slot"
        );
        self.publish(state, effects);
        AccessOutcome::QueuedAt { position }
    }

    fn begin_session(
        self: &Arc<Self>,
        state: &mut TenantState,
        requester: &RequesterId,
        effects: &mut Effects,
    ) -> Result<Generation, SchedulerError> {
        let reservation = match std::mem::take(&mut state.slot) {
            Slot::Reserved(r) if &r.requester == requester => r,
            Slot::Active(a) if &a.requester == requester => {
                let generation = a.generation;
                state.slot = Slot::Active(a);
                debug!(
                    tenant = %self.tenant,
                    requester = %requester,
                    generation = generation.get(),
                    "Session already started"
                );
                return Ok(generation);
            }
            other => {
                state.slot = other;
                return Err(match state.lapsed_generation(requester) {
                    Some(generation) => SchedulerError::Expired { generation },
                    None => SchedulerError::NotReservationHolder,
                });
            }
        };

        let ttl = self.settings.active_ttl();
        let now = self.now();
        let expires_at = now + ttl;
        state.cancel_slot_timer();
        let generation = state.bump_generation();
        state.slot_timer = Some(self.arm(ttl, TimerKind::Active, generation));
        state.slot = Slot::Active(ActiveSession {
            requester: reservation.requester,
            job_label: reservation.job_label,
            started_at: now,
            expires_at,
            generation,
        });
        info!(
            tenant = %self.tenant,
            requester = %requester,
            generation = generation.get(),
            confirmed_after_ms = now.saturating_duration_since(reservation.granted_at).as_millis() as u64,
            ttl_secs = ttl.as_secs(),
            "Session started"
        );
        self.publish(state, effects);
        Ok(generation)
    }

    fn complete_session(
        self: &Arc<Self>,
        state: &mut TenantState,
        requester: &RequesterId,
        options: CompleteOptions,
        effects: &mut Effects,
    ) -> Result<(), SchedulerError> {
        let session = match std::mem::take(&mut state.slot) {
            Slot::Active(a) if &a.requester == requester => a,
            other => {
                state.slot = other;
                return Err(SchedulerError::NotActiveHolder);
            }
        };

        state.cancel_slot_timer();
        info!(
            tenant = %self.tenant,
            requester = %requester,
            generation = session.generation.get(),
            held_ms = self.now().saturating_duration_since(session.started_at).as_millis() as u64,
            settle_ms = options.settle_delay.as_millis() as u64,
            "Session completed"
        );
        self.release(state, options.settle_delay, effects);
        Ok(())
    }

    fn cancel_request(
        self: &Arc<Self>,
        state: &mut TenantState,
        requester: &RequesterId,
        effects: &mut Effects,
    ) -> Result<CancelOutcome, SchedulerError> {
        if let Some(index) = state.queue.iter().position(|p| &p.requester == requester) {
            state.queue.remove(index);
            info!(
                tenant = %self.tenant,
                requester = %requester,
                position = index + 1,
                "Left the queue"
            );
            self.announce_queue_moves(state, index, effects);
            self.publish(state, effects);
            return Ok(CancelOutcome::LeftQueue);
        }

        match std::mem::take(&mut state.slot) {
            Slot::Reserved(r) if &r.requester == requester => {
                state.cancel_slot_timer();
                info!(
                    tenant = %self.tenant,
                    requester = %requester,
                    generation = r.generation.get(),
                    "Reservation released"
                );
                self.hand_off(state, effects);
                Ok(CancelOutcome::ReleasedReservation)
            }
            Slot::Active(a) if &a.requester == requester => {
                state.cancel_slot_timer();
                info!(
                    tenant = %self.tenant,
                    requester = %requester,
                    generation = a.generation.get(),
                    "Session ended early"
                );
                self.release(state, Duration::ZERO, effects);
                Ok(CancelOutcome::EndedSession)
            }
            other => {
                state.slot = other;
                debug!(tenant = %self.tenant, requester = %requester, "Nothing to cancel");
                Err(SchedulerError::NotFound)
            }
        }
    }

    fn on_timer(
        self: &Arc<Self>,
        state: &mut TenantState,
        kind: TimerKind,
        generation: Generation,
        effects: &mut Effects,
    ) {
        match kind {
            TimerKind::Reservation => {
                let expired = match std::mem::take(&mut state.slot) {
                    Slot::Reserved(r) if r.generation == generation => r,
                    other => {
                        state.slot = other;
                        self.stale(kind, generation);
                        return;
                    }
                };
                state.slot_timer = None;
                state.remember_lapse(expired.requester.clone(), generation);
                info!(
                    tenant = %self.tenant,
                    requester = %expired.requester,
                    generation = generation.get(),
                    "Reservation expired before the session started"
                );
                effects.notices.push(
                    self.notice(
                        &expired.requester,
                        NoticeKind::ReservationExpired,
                        &expired.job_label,
                    )
                    .with_generation(generation),
                );
                self.hand_off(state, effects);
            }
            TimerKind::Active => {
                let reclaimed = match std::mem::take(&mut state.slot) {
                    Slot::Active(a) if a.generation == generation => a,
                    other => {
                        state.slot = other;
                        self.stale(kind, generation);
                        return;
                    }
                };
                state.slot_timer = None;
                info!(
                    tenant = %self.tenant,
                    requester = %reclaimed.requester,
                    generation = generation.get(),
                    "Session reclaimed at its time limit"
                );
                effects.notices.push(
                    self.notice(
                        &reclaimed.requester,
                        NoticeKind::SessionReclaimed,
                        &reclaimed.job_label,
                    )
                    .with_generation(generation),
                );
                self.hand_off(state, effects);
            }
            TimerKind::Handoff => {
                if state.handoff != Some(generation) {
                    self.stale(kind, generation);
                    return;
                }
                state.handoff = None;
                debug!(
                    tenant = %self.tenant,
                    generation = generation.get(),
                    "Settle delay elapsed"
                );
                self.hand_off(state, effects);
            }
        }
    }

    fn stale(&self, kind: TimerKind, generation: Generation) {
        debug!(
            tenant = %self.tenant,
            timer = ?kind,
            generation = generation.get(),
            "Ignoring stale timer"
        );
    }

    // ── Hand-off helpers ────────────────────────────────────────────────────

    /// Clear-slot follow-up: hand off now, or after `settle_delay`.
    fn release(self: &Arc<Self>, state: &mut TenantState, settle_delay: Duration, effects: &mut Effects) {
        if settle_delay.is_zero() {
            self.hand_off(state, effects);
            return;
        }

        let generation = state.bump_generation();
        // The handle is dropped without cancelling: the timer stays armed.
        let _ = self.arm(settle_delay, TimerKind::Handoff, generation);
        state.handoff = Some(generation);
        debug!(
            tenant = %self.tenant,
            generation = generation.get(),
            settle_ms = settle_delay.as_millis() as u64,
            waiting = state.queue.len(),
            "Hand-off deferred"
        );
        self.publish(state, effects);
    }

    /// Grant the next reservation to the queue head, or go idle.
    fn hand_off(self: &Arc<Self>, state: &mut TenantState, effects: &mut Effects) {
        debug_assert!(state.slot.is_idle());
        debug_assert!(state.handoff.is_none());

        let Some(next) = state.queue.pop_front() else {
            debug!(tenant = %self.tenant, "Slot idle");
            self.publish(state, effects);
            return;
        };

        debug!(
            tenant = %self.tenant,
            requester = %next.requester,
            waited_ms = self.now().saturating_duration_since(next.enqueued_at).as_millis() as u64,
            "Promoting queue head"
        );
        self.grant(
            state,
            next.requester,
            next.job_label,
            NoticeKind::SessionGrantedAfterWait,
            effects,
        );
        self.announce_queue_moves(state, 0, effects);
    }

    /// Put `requester` in the reservation phase and start its confirm window.
    fn grant(
        self: &Arc<Self>,
        state: &mut TenantState,
        requester: RequesterId,
        job_label: String,
        kind: NoticeKind,
        effects: &mut Effects,
    ) -> Generation {
        debug_assert!(state.slot.is_idle());

        let ttl = self.settings.reservation_ttl();
        let now = self.now();
        let expires_at = now + ttl;
        let generation = state.bump_generation();
        state.slot_timer = Some(self.arm(ttl, TimerKind::Reservation, generation));

        info!(
            tenant = %self.tenant,
            requester = %requester,
            generation = generation.get(),
            ttl_secs = ttl.as_secs(),
            "Reservation granted"
        );
        effects.notices.push(
            self.notice(&requester, kind, &job_label)
                .with_generation(generation)
                .with_confirm_window_ms(ttl.as_millis() as u64),
        );

        state.slot = Slot::Reserved(Reservation {
            requester,
            job_label,
            granted_at: now,
            expires_at,
            generation,
        });
        self.publish(state, effects);
        generation
    }

    /// Tell everyone from `from_index` on about their new position.
    fn announce_queue_moves(&self, state: &TenantState, from_index: usize, effects: &mut Effects) {
        if !self.settings.notify_queue_moves() {
            return;
        }
        for (index, entry) in state.queue.iter().enumerate().skip(from_index) {
            effects.notices.push(
                self.notice(
                    &entry.requester,
                    NoticeKind::QueuePositionChanged,
                    &entry.job_label,
                )
                .with_position(index + 1),
            );
        }
    }
}

// ── Public handle ───────────────────────────────────────────────────────────

/// Scheduler for one tenant's slot. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct TenantScheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for TenantScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantScheduler")
            .field("tenant", &self.shared.tenant)
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl TenantScheduler {
    #[must_use]
    pub fn new(
        tenant: impl Into<TenantId>,
        settings: SchedulerSettings,
        ports: SchedulerPorts,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tenant: tenant.into(),
                settings,
                ports,
                state: Mutex::new(TenantState::default()),
            }),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.shared.tenant
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    /// Ask for a turn.
    ///
    /// Free slot: the caller gets a reservation and must call
    /// [`begin_session`](Self::begin_session) within the reservation TTL.
    /// Busy slot: the caller joins the back of the queue. Asking again while
    /// holding or queued returns the current standing without changing it.
    pub fn request_access(
        &self,
        requester: impl Into<RequesterId>,
        job_label: impl Into<String>,
    ) -> AccessOutcome {
        let requester = requester.into();
        let job_label = job_label.into();
        let _span =
            crate::tenant_span!("request_access", self.shared.tenant, requester = %requester)
                .entered();
        self.shared.transact(|shared, state, effects| {
            shared.request_access(state, requester, job_label, effects)
        })
    }

    /// Confirm a reservation and start the session.
    pub fn begin_session(
        &self,
        requester: impl Into<RequesterId>,
    ) -> Result<Generation, SchedulerError> {
        let requester = requester.into();
        let _span =
            crate::tenant_span!("begin_session", self.shared.tenant, requester = %requester)
                .entered();
        self.shared.transact(|shared, state, effects| {
            shared.begin_session(state, &requester, effects)
        })
    }

    /// Finish the running session and pass the slot on.
    pub fn complete_session(
        &self,
        requester: impl Into<RequesterId>,
        options: CompleteOptions,
    ) -> Result<(), SchedulerError> {
        let requester = requester.into();
        let _span = crate::tenant_span!(
            "complete_session",
            self.shared.tenant,
            requester = %requester,
            settle_ms = options.settle_delay.as_millis() as u64
        )
        .entered();
        self.shared.transact(|shared, state, effects| {
            shared.complete_session(state, &requester, options, effects)
        })
    }

    /// Withdraw from the queue, give up a reservation, or end a session early.
    pub fn cancel_request(
        &self,
        requester: impl Into<RequesterId>,
    ) -> Result<CancelOutcome, SchedulerError> {
        let requester = requester.into();
        let _span =
            crate::tenant_span!("cancel_request", self.shared.tenant, requester = %requester)
                .entered();
        self.shared.transact(|shared, state, effects| {
            shared.cancel_request(state, &requester, effects)
        })
    }

    /// Current view of the slot and queue.
    #[must_use]
    pub fn snapshot(&self) -> SlotSnapshot {
        let now = self.shared.now();
        self.shared.lock().snapshot(&self.shared.tenant, now)
    }

    /// 1-based queue position, if queued.
    #[must_use]
    pub fn position_of(&self, requester: &RequesterId) -> Option<usize> {
        self.shared.lock().position_of(requester)
    }

    #[must_use]
    pub fn status_of(&self, requester: &RequesterId) -> RequesterStatus {
        self.shared.lock().status_of(requester)
    }

    /// Check the slot/queue invariants; returns the first violation found.
    pub fn audit_invariants(&self) -> Result<(), String> {
        self.shared.lock().audit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::MemoryNotifier;

    const RES_TTL: Duration = Duration::from_secs(180);
    const ACT_TTL: Duration = Duration::from_secs(900);

    fn scheduler() -> (TenantScheduler, ManualClock, Arc<MemoryNotifier>) {
        let clock = ManualClock::new();
        let notifier = Arc::new(MemoryNotifier::new());
        let ports = SchedulerPorts::new(Arc::new(clock.clone())).with_notifier(notifier.clone());
        let settings = SchedulerSettings::new(RES_TTL, ACT_TTL).unwrap();
        (TenantScheduler::new("guild", settings, ports), clock, notifier)
    }

    fn fire(sched: &TenantScheduler, kind: TimerKind, generation: Generation) {
        sched.shared.transact(|shared, state, effects| {
            shared.on_timer(state, kind, generation, effects);
        });
    }

    #[test]
    fn stale_reservation_timer_is_noop() {
        let (sched, _clock, notifier) = scheduler();
        let AccessOutcome::Granted { generation } = sched.request_access("alice", "scan") else {
            panic!("expected grant");
        };
        let active = sched.begin_session("alice").unwrap();
        assert!(active > generation);

        let before = sched.snapshot();
        fire(&sched, TimerKind::Reservation, generation);
        assert_eq!(sched.snapshot(), before);
        assert_eq!(
            notifier.kinds_for("alice"),
            vec![NoticeKind::ReservationGranted]
        );
    }

    #[test]
    fn stale_active_timer_after_completion_is_noop() {
        let (sched, _clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        let active = sched.begin_session("alice").unwrap();
        sched.complete_session("alice", CompleteOptions::default()).unwrap();

        sched.request_access("bob", "scan");
        fire(&sched, TimerKind::Active, active);

        assert!(matches!(
            sched.status_of(&"bob".into()),
            RequesterStatus::Reserved { .. }
        ));
        sched.audit_invariants().unwrap();
    }

    #[test]
    fn stale_handoff_timer_is_noop() {
        let (sched, _clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        sched.begin_session("alice").unwrap();
        sched
            .complete_session("alice", CompleteOptions::settle(Duration::from_secs(5)))
            .unwrap();
        sched.request_access("bob", "scan");
        assert!(sched.snapshot().handoff_pending);

        fire(&sched, TimerKind::Handoff, Generation::new(1));
        assert_eq!(sched.position_of(&"bob".into()), Some(1));
        sched.audit_invariants().unwrap();
    }

    #[test]
    fn settle_delay_arms_exactly_one_timer() {
        let (sched, clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        sched.begin_session("alice").unwrap();
        sched
            .complete_session("alice", CompleteOptions::settle(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(clock.pending_timers(), 1);
        let deferred = sched.shared.lock().handoff;
        assert_eq!(deferred, Some(Generation::new(3)));

        sched.request_access("bob", "scan");
        clock.advance(Duration::from_secs(5));
        assert!(sched.shared.lock().handoff.is_none());
        // only bob's reservation timer is left
        assert_eq!(clock.pending_timers(), 1);
        assert!(matches!(
            sched.status_of(&"bob".into()),
            RequesterStatus::Reserved { generation } if generation == Generation::new(4)
        ));
    }

    #[test]
    fn begin_is_idempotent_for_active_holder() {
        let (sched, _clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        let first = sched.begin_session("alice").unwrap();
        assert_eq!(sched.begin_session("alice").unwrap(), first);
    }

    #[test]
    fn lapse_memory_is_bounded_and_cleared_on_rerequest() {
        let mut state = TenantState::default();
        for i in 0..(LAPSE_MEMORY as u64 + 10) {
            state.remember_lapse(RequesterId::new(format!("r{i}")), Generation::new(i));
        }
        assert_eq!(state.lapsed.len(), LAPSE_MEMORY);
        assert!(state.lapsed_generation(&"r0".into()).is_none());
        let newest = RequesterId::new(format!("r{}", LAPSE_MEMORY as u64 + 9));
        assert!(state.lapsed_generation(&newest).is_some());
        state.forget_lapse(&newest);
        assert!(state.lapsed_generation(&newest).is_none());
    }

    #[test]
    fn rerequest_after_lapse_clears_expired_diagnostic() {
        let (sched, clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        clock.advance(RES_TTL);
        assert!(matches!(
            sched.begin_session("alice"),
            Err(SchedulerError::Expired { .. })
        ));

        sched.request_access("bob", "scan");
        sched.request_access("alice", "scan");
        assert_eq!(
            sched.begin_session("alice"),
            Err(SchedulerError::NotReservationHolder)
        );
    }

    #[test]
    fn audit_flags_holder_without_timer() {
        let (sched, _clock, _notifier) = scheduler();
        sched.request_access("alice", "scan");
        sched.shared.lock().slot_timer = None;
        assert!(sched.audit_invariants().unwrap_err().contains("without an expiry timer"));
    }
}
