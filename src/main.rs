//! sshpool binary: load configuration, seed the pool, run the drivers.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sshpool::config::ConfigStorage;
use sshpool::net::{local_ipv4, HttpEgressProbe};
use sshpool::pool::{CredentialSupplier, Orchestrator, PoolDriver, SshStoreSupplier};
use sshpool::store::EntityStore;
use sshpool::tunnel::TunnelManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sshpool.json".into());
    let storage = ConfigStorage::new(&config_path);
    let config = storage.load().await?;
    // materialize defaults so a fresh install has a file to edit
    storage.save(&config).await?;

    let host_ip = local_ipv4();
    info!("proxy addresses will be rendered for {}", host_ip);

    let store = Arc::new(EntityStore::new(host_ip));
    for port in &config.ports {
        match store.insert_port(*port, true) {
            Ok(_) => info!("pool port {} registered", port),
            Err(e) => warn!("skipping configured port {}: {}", port, e),
        }
    }
    // nothing is connected yet; forget whatever a previous run believed
    store.reset_all_statuses();

    let probe = Arc::new(HttpEgressProbe::default());
    let tunnels = Arc::new(
        TunnelManager::new(probe.clone()).with_connect_timeout(config.connect_timeout()),
    );
    let supplier: Option<Arc<dyn CredentialSupplier>> = config
        .supplier
        .enabled
        .then(|| Arc::new(SshStoreSupplier::new(config.supplier.api_key.clone())) as _);

    let orchestrator = Arc::new(Orchestrator::new(store, tunnels, probe, config));
    PoolDriver::new(orchestrator, supplier).run().await;
    Ok(())
}
