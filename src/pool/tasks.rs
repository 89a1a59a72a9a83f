//! Periodic pool drivers
//!
//! Three loops keep the pool converged: a liveness sweep over credentials
//! (bounded by the configured concurrency, since unbounded checks would
//! exhaust ephemeral ports and remote connection limits at the same time),
//! a 1 s maintenance pass over every port, and the marketplace ingest that
//! only fires when the live-credential pool has run dry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::orchestrator::Orchestrator;
use super::supplier::CredentialSupplier;
use crate::store::PortId;

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const SUPPLIER_INTERVAL: Duration = Duration::from_secs(60);

pub struct PoolDriver {
    orchestrator: Arc<Orchestrator>,
    supplier: Option<Arc<dyn CredentialSupplier>>,
    check_slots: Arc<Semaphore>,
    /// Ports with a maintenance pass already running, so a slow pass never
    /// doubles up on the same port.
    inflight: Arc<DashMap<PortId, ()>>,
}

impl PoolDriver {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        supplier: Option<Arc<dyn CredentialSupplier>>,
    ) -> Self {
        let slots = orchestrator.config().check_concurrency.max(1);
        Self {
            orchestrator,
            supplier,
            check_slots: Arc::new(Semaphore::new(slots)),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Drive the pool until the process exits.
    pub async fn run(&self) {
        info!("pool drivers started");
        tokio::join!(
            self.liveness_sweep(),
            self.port_maintenance(),
            self.supplier_ingest(),
        );
    }

    /// Check credentials whose last check is older than the configured
    /// interval, oldest first, at most `check_concurrency` in flight.
    async fn liveness_sweep(&self) {
        let batch = self.orchestrator.config().check_concurrency.max(1);
        loop {
            let cutoff = Utc::now() - self.orchestrator.config().check_interval();
            let due = self
                .orchestrator
                .store()
                .credentials_due_for_check(cutoff, batch);
            if due.is_empty() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }

            let mut checks = JoinSet::new();
            for cred in due {
                let Ok(permit) = self.check_slots.clone().acquire_owned().await else {
                    return;
                };
                let orchestrator = self.orchestrator.clone();
                checks.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = orchestrator.check_liveness(cred.id).await {
                        debug!("liveness check of credential {} failed: {}", cred.id, e);
                    }
                });
            }
            while checks.join_next().await.is_some() {}
        }
    }

    /// Run a maintenance pass over every port on a fixed cadence.
    async fn port_maintenance(&self) {
        loop {
            for port in self.orchestrator.store().ports() {
                match self.inflight.entry(port.id) {
                    dashmap::mapref::entry::Entry::Occupied(_) => continue,
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(());
                    }
                }
                let orchestrator = self.orchestrator.clone();
                let inflight = self.inflight.clone();
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.maintain_port(port.id).await {
                        warn!("maintenance of port {} failed: {}", port.port_number, e);
                    }
                    inflight.remove(&port.id);
                });
            }
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;
        }
    }

    /// Pull fresh credentials from the marketplace, but only while the
    /// supplier is enabled and no live credential is left to hand out.
    async fn supplier_ingest(&self) {
        let Some(supplier) = self.supplier.clone() else {
            return;
        };
        loop {
            let config = self.orchestrator.config();
            if config.supplier.enabled && self.orchestrator.store().live_credentials().is_empty() {
                match supplier.fetch_credentials(&config.supplier.country).await {
                    Ok(seeds) if !seeds.is_empty() => {
                        let created = self.orchestrator.ingest_seeds(seeds);
                        if !created.is_empty() {
                            info!("supplier delivered {} new credentials", created.len());
                        }
                    }
                    Ok(_) => debug!("supplier returned no credentials"),
                    Err(e) => debug!("supplier fetch failed: {}", e),
                }
            }
            tokio::time::sleep(SUPPLIER_INTERVAL).await;
        }
    }
}
