//! Pool orchestrator
//!
//! Policy layer between the entity store and the tunnel mechanism: decides
//! which credential may be connected to which port, rolls back partial
//! failures, replaces dead credentials, and rotates stale tunnels. No
//! single failed establishment is ever allowed to stop the pool.

use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::PoolError;
use crate::config::PoolConfig;
use crate::net::EgressProbe;
use crate::store::{
    Credential, CredentialId, CredentialSeed, EntityStore, Port, PortId, StoreError,
};
use crate::tunnel::{TunnelError, Tunneler};

pub struct Orchestrator {
    store: Arc<EntityStore>,
    tunnels: Arc<dyn Tunneler>,
    probe: Arc<dyn EgressProbe>,
    config: PoolConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<EntityStore>,
        tunnels: Arc<dyn Tunneler>,
        probe: Arc<dyn EgressProbe>,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            tunnels,
            probe,
            config,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pick a live credential for `port`, uniformly at random to spread
    /// load. With `unique_only`, credentials the port has already consumed
    /// are never offered again.
    pub fn select_credential(&self, port: &Port, unique_only: bool) -> Option<Credential> {
        let mut candidates = self.store.live_credentials();
        if unique_only {
            candidates.retain(|c| !port.used_credentials.contains(&c.id));
        }
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Bind `credential_id` to the port and bring the tunnel up. Any
    /// failure rolls the port back to the unassigned state: there is no
    /// partially-connected state to observe.
    pub async fn assign_and_connect(
        &self,
        port_id: PortId,
        credential_id: CredentialId,
    ) -> Result<(), PoolError> {
        let port = self
            .store
            .port(port_id)
            .ok_or(StoreError::PortNotFound(port_id))?;
        let cred = self
            .store
            .credential(credential_id)
            .ok_or(StoreError::CredentialNotFound(credential_id))?;

        self.store.assign_credential(port_id, credential_id)?;
        info!("port {} -> {} connecting", port.port_number, cred.host);

        let attempt = tokio::time::timeout(
            self.config.establish_deadline(),
            self.tunnels.establish(
                &cred.tunnel_spec(),
                Some(port.port_number),
                self.config.connect_retries,
            ),
        )
        .await;

        let failure: PoolError = match attempt {
            Ok(Ok(session)) => {
                self.store.update_port(port_id, |p| {
                    p.is_connected = true;
                    Ok(())
                })?;
                info!(
                    "port {} -> {} connected ({})",
                    port.port_number, cred.host, session.proxy_url
                );
                return Ok(());
            }
            Ok(Err(e)) => e.into(),
            Err(_) => PoolError::Deadline,
        };

        warn!(
            "port {} -> {} connection failed: {}",
            port.port_number, cred.host, failure
        );
        self.rollback_port(port_id, port.port_number).await?;
        Err(failure)
    }

    /// Undo a failed establishment: no stray session, no binding, and the
    /// failed credential does not count against the anti-reuse history.
    async fn rollback_port(&self, port_id: PortId, port_number: u16) -> Result<(), PoolError> {
        match self.tunnels.teardown(port_number).await {
            Ok(()) | Err(TunnelError::NoSession(_)) => {}
            Err(e) => warn!("cleanup teardown of port {} failed: {}", port_number, e),
        }
        self.store.update_port(port_id, |p| {
            p.clear_binding(true);
            Ok(())
        })?;
        Ok(())
    }

    /// Verify a credential end to end and record the result. Honors the
    /// auto-delete policy for credentials that fail.
    pub async fn check_liveness(&self, credential_id: CredentialId) -> Result<bool, PoolError> {
        let cred = self
            .store
            .credential(credential_id)
            .ok_or(StoreError::CredentialNotFound(credential_id))?;
        let spec = cred.tunnel_spec();

        let is_live =
            match tokio::time::timeout(self.config.check_timeout(), self.tunnels.verify(&spec))
                .await
            {
                Ok(live) => live,
                Err(_) => {
                    debug!("{} liveness check timed out", spec.endpoint());
                    false
                }
            };

        self.store.record_credential_check(credential_id, is_live)?;
        debug!(
            "{} checked: {}",
            spec.endpoint(),
            if is_live { "live" } else { "dead" }
        );

        if !is_live && self.config.auto_delete_dead {
            self.replace_if_dead(credential_id).await?;
        }
        Ok(is_live)
    }

    /// Delete a credential confirmed dead, unbinding any port that still
    /// holds it. A live credential is left alone. Replacement credentials
    /// are picked up by the next maintenance pass.
    pub async fn replace_if_dead(&self, credential_id: CredentialId) -> Result<bool, PoolError> {
        let Some(cred) = self.store.credential(credential_id) else {
            return Ok(false);
        };
        if cred.live() {
            return Ok(false);
        }

        for port in self.store.ports() {
            if port.credential == Some(credential_id) {
                info!(
                    "port {} unbinding dead credential {}@{}",
                    port.port_number, cred.username, cred.host
                );
                self.disconnect(port.id, false).await?;
            }
        }

        let deleted = self.store.delete_credential_if_dead(credential_id)?;
        if deleted {
            info!("deleted dead credential {}@{}", cred.username, cred.host);
        }
        Ok(deleted)
    }

    /// Whether the rotation driver should force a re-assignment of this
    /// port, regardless of health.
    pub fn needs_reset(&self, port: &Port) -> bool {
        port.needs_reset(self.config.rotation_interval(), Utc::now())
    }

    /// Tear the tunnel down and return the port to the unassigned state.
    /// With `clear_history` the anti-reuse history and check timestamp go
    /// too: a full reset. A missing session is a recoverable no-op.
    pub async fn disconnect(&self, port_id: PortId, clear_history: bool) -> Result<(), PoolError> {
        let port = self
            .store
            .port(port_id)
            .ok_or(StoreError::PortNotFound(port_id))?;

        match self.tunnels.teardown(port.port_number).await {
            Ok(()) | Err(TunnelError::NoSession(_)) => {}
            Err(e) => warn!("teardown of port {} failed: {}", port.port_number, e),
        }

        self.store.update_port(port_id, |p| {
            if clear_history {
                p.reset_status();
            } else {
                p.clear_binding(false);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Periodic health confirmation of a connected port, distinct from the
    /// verification done at establishment: observe the egress IP through
    /// the live proxy and set `is_working` from the outcome.
    pub async fn refresh_port(&self, port_id: PortId) -> Result<(), PoolError> {
        let Some(port) = self.store.port(port_id) else {
            return Ok(());
        };
        if !port.is_connected {
            return Ok(());
        }

        let local_url = format!("socks5://127.0.0.1:{}", port.port_number);
        let ip = self.probe.egress_ip(&local_url).await;
        self.store.update_port(port_id, |p| {
            p.public_ip = ip.clone();
            p.last_checked = Some(Utc::now());
            p.is_working = p.is_connected && ip.is_some();
            Ok(())
        })?;
        Ok(())
    }

    /// One maintenance pass over a port: confirm health, drop dead
    /// bindings, populate an empty slot, rotate when stale.
    pub async fn maintain_port(&self, port_id: PortId) -> Result<(), PoolError> {
        self.refresh_port(port_id).await?;

        let Some(port) = self.store.port(port_id) else {
            return Ok(());
        };

        // a connected port whose probe came back empty lost its proxy
        if self.config.auto_replace_dead
            && port.is_connected
            && port.last_checked.is_some()
            && port.public_ip.is_none()
        {
            warn!("port {} proxy died, unbinding", port.port_number);
            self.disconnect(port_id, false).await?;
        }

        let Some(port) = self.store.port(port_id) else {
            return Ok(());
        };
        if port.needs_credential() && port.auto_connect {
            match self.select_credential(&port, self.config.unique_per_port) {
                Some(cred) => {
                    if let Err(e) = self.assign_and_connect(port_id, cred.id).await {
                        debug!("port {} connection attempt failed: {}", port.port_number, e);
                    }
                }
                None => debug!("no usable credential for port {}", port.port_number),
            }
            return Ok(());
        }

        if self.config.auto_rotate {
            let Some(port) = self.store.port(port_id) else {
                return Ok(());
            };
            if self.needs_reset(&port) {
                info!("port {} rotating", port.port_number);
                self.disconnect(port_id, !self.config.unique_per_port).await?;
            }
        }
        Ok(())
    }

    /// Insert freshly ingested credentials, silently skipping tuples the
    /// store already holds. Returns the ids actually created.
    pub fn ingest_seeds(&self, seeds: Vec<CredentialSeed>) -> Vec<CredentialId> {
        let total = seeds.len();
        let created: Vec<CredentialId> = seeds
            .into_iter()
            .filter_map(|seed| match self.store.insert_credential(seed) {
                Ok(id) => Some(id),
                Err(StoreError::DuplicateCredential(_)) => None,
                Err(e) => {
                    debug!("credential insert failed: {}", e);
                    None
                }
            })
            .collect();
        info!("inserted {} of {} ingested credentials", created.len(), total);
        created
    }
}
