//! Tenant → scheduler lookup.
//!
//! Tenants are fully independent; the registry only hands out the one
//! [`TenantScheduler`] per tenant, creating it on first use.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::board::{BoardSink, SlotSnapshot};
use crate::clock::Clock;
use crate::config::SchedulerSettings;
use crate::model::TenantId;
use crate::notify::NotificationSink;
use crate::scheduler::{SchedulerPorts, TenantScheduler};

/// Owns every tenant's scheduler. Cloning shares the same registry.
#[derive(Debug, Clone)]
pub struct SchedulerRegistry {
    settings: SchedulerSettings,
    ports: SchedulerPorts,
    tenants: Arc<RwLock<BTreeMap<TenantId, TenantScheduler>>>,
}

impl SchedulerRegistry {
    /// Registry with null notifier and board.
    #[must_use]
    pub fn new(settings: SchedulerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            ports: SchedulerPorts::new(clock),
            tenants: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Route notices for tenants created from now on.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.ports = self.ports.with_notifier(notifier);
        self
    }

    #[must_use]
    pub fn with_board(mut self, board: Arc<dyn BoardSink>) -> Self {
        self.ports = self.ports.with_board(board);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Get the tenant's scheduler, creating it if this is the first request.
    #[must_use]
    pub fn get_or_create(&self, tenant: impl Into<TenantId>) -> TenantScheduler {
        let tenant = tenant.into();

        if let Ok(read_guard) = self.tenants.read() {
            if let Some(existing) = read_guard.get(&tenant) {
                return existing.clone();
            }
        }

        let mut write_guard = match self.tenants.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        write_guard
            .entry(tenant.clone())
            .or_insert_with(|| {
                let _span = crate::tenant_span!("create_tenant", tenant).entered();
                debug!(
                    reservation_ttl_secs = self.settings.reservation_ttl().as_secs(),
                    active_ttl_secs = self.settings.active_ttl().as_secs(),
                    "Creating tenant scheduler"
                );
                TenantScheduler::new(tenant.clone(), self.settings.clone(), self.ports.clone())
            })
            .clone()
    }

    /// Scheduler for a tenant that has already been seen.
    #[must_use]
    pub fn get(&self, tenant: &TenantId) -> Option<TenantScheduler> {
        let read_guard = match self.tenants.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        read_guard.get(tenant).cloned()
    }

    /// Known tenants in sorted order.
    #[must_use]
    pub fn tenants(&self) -> Vec<TenantId> {
        let read_guard = match self.tenants.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        read_guard.keys().cloned().collect()
    }

    /// Snapshot every known tenant.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        let schedulers: Vec<TenantScheduler> = {
            let read_guard = match self.tenants.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            read_guard.values().cloned().collect()
        };
        schedulers.iter().map(TenantScheduler::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::AccessOutcome;

    fn registry() -> SchedulerRegistry {
        SchedulerRegistry::new(SchedulerSettings::default(), Arc::new(ManualClock::new()))
    }

    #[test]
    fn same_tenant_shares_one_scheduler() {
        let registry = registry();
        let first = registry.get_or_create("guild");
        assert!(matches!(
            first.request_access("alice", "scan"),
            AccessOutcome::Granted { .. }
        ));

        let again = registry.get_or_create("guild");
        assert_eq!(
            again.request_access("bob", "scan"),
            AccessOutcome::QueuedAt { position: 1 }
        );
    }

    #[test]
    fn tenants_are_independent() {
        let registry = registry();
        registry.get_or_create("a").request_access("alice", "scan");
        let outcome = registry.get_or_create("b").request_access("bob", "scan");
        assert!(matches!(outcome, AccessOutcome::Granted { .. }));
        assert_eq!(
            registry.tenants(),
            vec![TenantId::from("a"), TenantId::from("b")]
        );
    }

    #[test]
    fn get_does_not_create() {
        let registry = registry();
        assert!(registry.get(&"ghost".into()).is_none());
        assert!(registry.tenants().is_empty());
        let _ = registry.get_or_create("ghost");
        assert!(registry.get(&"ghost".into()).is_some());
    }

    #[test]
    fn snapshots_cover_every_tenant() {
        let registry = registry();
        registry.get_or_create("a").request_access("alice", "scan");
        let _ = registry.get_or_create("b");
        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].holder().is_some());
        assert!(snaps[1].is_quiet());
    }
}
