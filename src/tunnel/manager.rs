//! Tunnel session manager
//!
//! Owns the registry of active SSH-backed SOCKS5 sessions, keyed by local
//! port. `establish` is the only way a session enters the registry and
//! `teardown` the only way one leaves it; both serialize registry mutation
//! behind a single lock while the handshake and verification work for
//! different ports proceeds concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::algs::legacy_preferred;
use super::error::TunnelError;
use super::socks::{spawn_socks_listener, ListenerHandle};
use crate::net::{self, EgressProbe};

/// Upper bound on the TCP connect + SSH handshake phase.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default transient-failure retry budget for [`Tunneler::establish`].
pub const DEFAULT_RETRIES: u32 = 3;

/// Login details for one tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub host: String,
    pub username: String,
    pub password: String,
    pub ssh_port: u16,
}

impl TunnelSpec {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.ssh_port)
    }
}

/// A registered, verified tunnel.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub local_port: u16,
    pub proxy_url: String,
}

/// Host keys are never verified and no known-hosts store is consulted:
/// pool endpoints are disposable egress hops, not trusted infrastructure.
#[derive(Debug, Clone)]
pub struct DisposableHostKeys;

impl client::Handler for DisposableHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct ActiveTunnel {
    proxy_url: String,
    endpoint: String,
    listener: ListenerHandle,
}

/// Mechanism-layer contract consumed by the pool orchestrator.
#[async_trait::async_trait]
pub trait Tunneler: Send + Sync {
    /// Connect, open the SOCKS5 forward, verify it end to end, register it.
    ///
    /// Transient transport failures are retried up to `retries` times
    /// (`retries + 1` attempts total); protocol, authentication, and
    /// verification failures surface immediately.
    async fn establish(
        &self,
        spec: &TunnelSpec,
        local_port: Option<u16>,
        retries: u32,
    ) -> Result<TunnelSession, TunnelError>;

    /// Establish and immediately tear down. Never errors.
    async fn verify(&self, spec: &TunnelSpec) -> bool;

    /// Remove the session on `local_port` and close its connection,
    /// releasing the port before returning.
    async fn teardown(&self, local_port: u16) -> Result<(), TunnelError>;

    /// Whether a session is currently registered on `local_port`.
    async fn is_active(&self, local_port: u16) -> bool;
}

pub struct TunnelManager {
    registry: Arc<RwLock<HashMap<u16, ActiveTunnel>>>,
    probe: Arc<dyn EgressProbe>,
    connect_timeout: Duration,
}

impl TunnelManager {
    pub fn new(probe: Arc<dyn EgressProbe>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            probe,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Ports with a registered session.
    pub async fn active_ports(&self) -> Vec<u16> {
        self.registry.read().await.keys().copied().collect()
    }

    /// Draw an OS-allocated port, re-drawing while it collides with a
    /// registered session.
    async fn allocate_port(&self) -> Result<u16, TunnelError> {
        loop {
            let port = net::free_port()
                .map_err(|e| TunnelError::Transport(format!("port allocation failed: {e}")))?;
            if !self.registry.read().await.contains_key(&port) {
                return Ok(port);
            }
        }
    }

    /// One full establishment attempt: handshake, auth, forward, verify.
    async fn try_establish(
        &self,
        spec: &TunnelSpec,
        port: u16,
    ) -> Result<TunnelSession, TunnelError> {
        let config = Arc::new(client::Config {
            preferred: legacy_preferred().clone(),
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                config,
                (spec.host.as_str(), spec.ssh_port),
                DisposableHostKeys,
            ),
        )
        .await
        .map_err(|_| TunnelError::Timeout(format!("connect to {} timed out", spec.endpoint())))?
        .map_err(TunnelError::from)?;

        let auth = handle
            .authenticate_password(&spec.username, &spec.password)
            .await
            .map_err(TunnelError::from)?;
        if !auth.success() {
            return Err(TunnelError::Auth(format!(
                "{} rejected password for {}",
                spec.endpoint(),
                spec.username
            )));
        }

        let (listener, bound) = spawn_socks_listener(handle, port).await?;
        debug!("{} forwarding on {}", spec.endpoint(), bound);

        // End-to-end check: the tunnel must actually proxy traffic before
        // anyone is allowed to see it.
        let proxy_url = format!("socks5://127.0.0.1:{port}");
        match self.probe.egress_ip(&proxy_url).await {
            Some(ip) => debug!("{} egress IP {}", spec.endpoint(), ip),
            None => {
                listener.stop().await;
                return Err(TunnelError::Verification("proxy unreachable".into()));
            }
        }

        let mut registry = self.registry.write().await;
        if let Some(stale) = registry.remove(&port) {
            // A stale entry here means a prior teardown never ran; close it
            // rather than ever holding two sessions for one port.
            warn!("replacing stale session on port {}", port);
            tokio::spawn(async move { stale.listener.stop().await });
        }
        registry.insert(
            port,
            ActiveTunnel {
                proxy_url: proxy_url.clone(),
                endpoint: spec.endpoint(),
                listener,
            },
        );

        Ok(TunnelSession {
            local_port: port,
            proxy_url,
        })
    }

    /// Insert a registry entry that is not backed by a live listener.
    #[cfg(test)]
    pub(crate) async fn register_stub(&self, port: u16) {
        self.registry.write().await.insert(
            port,
            ActiveTunnel {
                proxy_url: format!("socks5://127.0.0.1:{port}"),
                endpoint: "stub".into(),
                listener: ListenerHandle::stub(),
            },
        );
    }
}

/// Bounded retry loop: run `op` until it succeeds, fails fatally, or the
/// transient budget is spent, returning the last error. An explicit loop
/// keeps the attempt count observable and the stack flat.
pub(crate) async fn run_attempts<T, F, Fut>(retries: u32, mut op: F) -> Result<T, TunnelError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TunnelError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt <= retries => {
                debug!("attempt {}/{} failed, retrying: {}", attempt, retries + 1, e);
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait::async_trait]
impl Tunneler for TunnelManager {
    async fn establish(
        &self,
        spec: &TunnelSpec,
        local_port: Option<u16>,
        retries: u32,
    ) -> Result<TunnelSession, TunnelError> {
        let port = match local_port {
            Some(p) => p,
            None => self.allocate_port().await?,
        };

        // The port must be exclusively ours before the first attempt; a
        // missing session is the normal case.
        match self.teardown(port).await {
            Ok(()) => debug!("closed previous session on port {}", port),
            Err(TunnelError::NoSession(_)) => {}
            Err(e) => return Err(e),
        }

        let result = run_attempts(retries, |_| self.try_establish(spec, port)).await;
        match &result {
            Ok(session) => info!(
                "{} connected on port {} ({})",
                spec.endpoint(),
                port,
                session.proxy_url
            ),
            Err(e) => warn!("{} failed to connect on port {}: {}", spec.endpoint(), port, e),
        }
        result
    }

    async fn verify(&self, spec: &TunnelSpec) -> bool {
        match self.establish(spec, None, DEFAULT_RETRIES).await {
            Ok(session) => {
                let _ = self.teardown(session.local_port).await;
                true
            }
            Err(e) => {
                debug!("{} failed verification: {}", spec.endpoint(), e);
                false
            }
        }
    }

    async fn teardown(&self, local_port: u16) -> Result<(), TunnelError> {
        let entry = self.registry.write().await.remove(&local_port);
        match entry {
            Some(tunnel) => {
                info!(
                    "tearing down tunnel on port {} ({})",
                    local_port, tunnel.endpoint
                );
                tunnel.listener.stop().await;
                Ok(())
            }
            None => Err(TunnelError::NoSession(local_port)),
        }
    }

    async fn is_active(&self, local_port: u16) -> bool {
        self.registry.read().await.contains_key(&local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoProbe;

    #[async_trait::async_trait]
    impl EgressProbe for NoProbe {
        async fn egress_ip(&self, _proxy_url: &str) -> Option<String> {
            None
        }
    }

    fn manager() -> TunnelManager {
        TunnelManager::new(Arc::new(NoProbe))
    }

    #[tokio::test]
    async fn run_attempts_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = run_attempts(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TunnelError>(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_attempts_spends_full_transient_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_attempts(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TunnelError::Transport("connection refused".into())) }
        })
        .await;
        assert!(matches!(result, Err(TunnelError::Transport(_))));
        // retries = 3 means exactly 4 attempts
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_attempts_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_attempts(3, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TunnelError::Timeout("connect".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_attempts_never_retries_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_attempts(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TunnelError::Auth("rejected".into())) }
        })
        .await;
        assert!(matches!(result, Err(TunnelError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn establish_against_refused_endpoint_fails_transiently() {
        let manager = manager();
        // bind then drop to get a port with nothing listening
        let closed_port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let spec = TunnelSpec {
            host: "127.0.0.1".into(),
            username: "nobody".into(),
            password: "nothing".into(),
            ssh_port: closed_port,
        };

        let err = manager.establish(&spec, Some(40000), 1).await.unwrap_err();
        assert!(err.is_transient(), "refused connect must be retryable: {err}");
        assert!(!manager.is_active(40000).await);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let manager = manager();
        manager.register_stub(20000).await;
        assert!(manager.is_active(20000).await);

        manager.teardown(20000).await.unwrap();
        assert!(!manager.is_active(20000).await);

        match manager.teardown(20000).await {
            Err(TunnelError::NoSession(20000)) => {}
            other => panic!("expected NoSession, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_unknown_port_reports_no_session() {
        let manager = manager();
        assert!(matches!(
            manager.teardown(1081).await,
            Err(TunnelError::NoSession(1081))
        ));
    }

    #[tokio::test]
    async fn registry_holds_one_session_per_port() {
        let manager = manager();
        manager.register_stub(20000).await;
        manager.register_stub(20000).await;
        assert_eq!(manager.active_ports().await, vec![20000]);
        manager.teardown(20000).await.unwrap();
        assert!(manager.active_ports().await.is_empty());
    }
}
