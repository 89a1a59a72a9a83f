//! Credential and port entities
//!
//! A `Credential` is a password login for a remote SSH host; a `Port` is a
//! local SOCKS5 endpoint the pool keeps populated. The two sides reference
//! each other symmetrically only while a port is connected; afterwards the
//! binding survives as history on both, which is what prevents a port from
//! burning through the same credential twice.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tunnel::TunnelSpec;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Lowest local port the pool will bind. The upper bound is the full u16
/// range; see DESIGN.md for the historical 65353 clamp.
pub const MIN_FORWARD_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredentialId(pub u64);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Login identity as ingested from a list or the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialSeed {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// The identity tuple two credentials may never share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CredentialKey {
    host: String,
    ssh_port: u16,
    username: String,
    password: String,
}

impl CredentialKey {
    pub(crate) fn from_seed(seed: &CredentialSeed) -> Self {
        Self {
            host: seed.host.clone(),
            ssh_port: seed.ssh_port,
            username: seed.username.clone(),
            password: seed.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub host: String,
    pub username: String,
    pub password: String,
    pub ssh_port: u16,
    /// Tri-state liveness: `None` until the first check has run. Only a
    /// verification check may set this, never inference.
    pub is_live: Option<bool>,
    /// Port currently connected through this credential, if any.
    pub bound_port: Option<PortId>,
    /// Every port that ever consumed this credential.
    pub used_by: BTreeSet<PortId>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl Credential {
    pub(crate) fn new(id: CredentialId, seed: CredentialSeed, now: DateTime<Utc>) -> Self {
        Self {
            id,
            host: seed.host,
            username: seed.username,
            password: seed.password,
            ssh_port: seed.ssh_port,
            is_live: None,
            bound_port: None,
            used_by: BTreeSet::new(),
            last_checked: None,
            last_modified: now,
        }
    }

    pub(crate) fn key(&self) -> CredentialKey {
        CredentialKey {
            host: self.host.clone(),
            ssh_port: self.ssh_port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Connection parameters for the tunnel layer.
    pub fn tunnel_spec(&self) -> TunnelSpec {
        TunnelSpec {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ssh_port: self.ssh_port,
        }
    }

    pub fn live(&self) -> bool {
        self.is_live == Some(true)
    }

    pub fn record_check(&mut self, is_live: bool, now: DateTime<Utc>) {
        self.is_live = Some(is_live);
        self.last_checked = Some(now);
    }

    /// Forget the check timestamp only; liveness and history are kept.
    pub fn reset_status(&mut self) {
        self.last_checked = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub port_number: u16,
    /// Whether the pool should keep this port populated on its own.
    pub auto_connect: bool,
    pub credential: Option<CredentialId>,
    pub is_connected: bool,
    /// Confirmed actively proxying by a health check, as opposed to merely
    /// having a session established. Never true while disconnected.
    pub is_working: bool,
    /// Egress address last observed through the tunnel.
    pub public_ip: Option<String>,
    pub time_connected: Option<DateTime<Utc>>,
    /// Credentials this port has consumed; the anti-reuse history.
    pub used_credentials: BTreeSet<CredentialId>,
    /// Derived: `socks5://<host>:<port_number>`, recomputed on every commit.
    pub proxy_address: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl Port {
    pub(crate) fn new(id: PortId, port_number: u16, auto_connect: bool, now: DateTime<Utc>) -> Self {
        Self {
            id,
            port_number,
            auto_connect,
            credential: None,
            is_connected: false,
            is_working: false,
            public_ip: None,
            time_connected: None,
            used_credentials: BTreeSet::new(),
            proxy_address: String::new(),
            last_checked: None,
            last_modified: now,
        }
    }

    pub fn needs_credential(&self) -> bool {
        self.credential.is_none()
    }

    /// Take a credential. The connection is not up yet, and the previous
    /// check timestamp no longer means anything.
    pub fn assign(&mut self, credential: CredentialId) {
        self.credential = Some(credential);
        self.is_connected = false;
        self.last_checked = None;
    }

    /// Drop the current binding and all connection state. With
    /// `remove_from_used`, the credential is also erased from the
    /// anti-reuse history (a failed attempt should not consume it).
    pub fn clear_binding(&mut self, remove_from_used: bool) {
        if remove_from_used {
            if let Some(c) = self.credential {
                self.used_credentials.remove(&c);
            }
        }
        self.credential = None;
        self.is_connected = false;
        self.is_working = false;
        self.public_ip = None;
        self.time_connected = None;
    }

    /// Full return to the unassigned state: binding, flags, egress IP,
    /// anti-reuse history, and check timestamp all cleared.
    pub fn reset_status(&mut self) {
        self.clear_binding(false);
        self.used_credentials.clear();
        self.last_checked = None;
    }

    /// Whether the rotation driver should force a re-assignment.
    pub fn needs_reset(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        match self.time_connected {
            Some(t) if self.is_connected => now.signed_duration_since(t) > stale_after,
            _ => false,
        }
    }

    /// Before-commit hook: stamps `last_modified` and recomputes every
    /// derived field from current state. The entity is only ever persisted
    /// through this, so `proxy_address`, `time_connected`, the anti-reuse
    /// history, and the `is_working ⇒ is_connected` invariant cannot drift.
    pub(crate) fn finalize(&mut self, now: DateTime<Utc>, host_ip: Ipv4Addr) {
        self.last_modified = now;
        if self.is_connected {
            if self.time_connected.is_none() {
                self.time_connected = Some(now);
            }
            if let Some(c) = self.credential {
                self.used_credentials.insert(c);
            }
        } else {
            self.time_connected = None;
            self.is_working = false;
        }
        self.proxy_address = format!("socks5://{}:{}", host_ip, self.port_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(now: DateTime<Utc>) -> Port {
        Port::new(PortId(1), 20000, true, now)
    }

    #[test]
    fn finalize_recomputes_proxy_address() {
        let now = Utc::now();
        let mut p = port(now);
        p.finalize(now, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(p.proxy_address, "socks5://192.168.1.10:20000");
    }

    #[test]
    fn finalize_stamps_connection_time_once() {
        let now = Utc::now();
        let mut p = port(now);
        p.assign(CredentialId(9));
        p.is_connected = true;
        p.finalize(now, Ipv4Addr::LOCALHOST);
        let first = p.time_connected.unwrap();

        let later = now + Duration::seconds(30);
        p.finalize(later, Ipv4Addr::LOCALHOST);
        assert_eq!(p.time_connected.unwrap(), first);

        p.is_connected = false;
        p.finalize(later, Ipv4Addr::LOCALHOST);
        assert!(p.time_connected.is_none());
    }

    #[test]
    fn history_grows_only_while_connected() {
        let now = Utc::now();
        let mut p = port(now);
        p.assign(CredentialId(9));
        p.finalize(now, Ipv4Addr::LOCALHOST);
        assert!(p.used_credentials.is_empty());

        p.is_connected = true;
        p.finalize(now, Ipv4Addr::LOCALHOST);
        assert!(p.used_credentials.contains(&CredentialId(9)));
    }

    #[test]
    fn working_never_survives_disconnection() {
        let now = Utc::now();
        let mut p = port(now);
        p.assign(CredentialId(9));
        p.is_connected = true;
        p.is_working = true;
        p.finalize(now, Ipv4Addr::LOCALHOST);
        assert!(p.is_working);

        p.is_connected = false;
        p.finalize(now, Ipv4Addr::LOCALHOST);
        assert!(!p.is_working);
    }

    #[test]
    fn failed_attempt_can_be_erased_from_history() {
        let now = Utc::now();
        let mut p = port(now);
        p.assign(CredentialId(9));
        p.is_connected = true;
        p.finalize(now, Ipv4Addr::LOCALHOST);

        p.clear_binding(true);
        assert!(p.used_credentials.is_empty());
        assert!(p.needs_credential());
    }

    #[test]
    fn reset_clears_everything() {
        let now = Utc::now();
        let mut p = port(now);
        p.assign(CredentialId(9));
        p.is_connected = true;
        p.is_working = true;
        p.public_ip = Some("1.2.3.4".into());
        p.last_checked = Some(now);
        p.finalize(now, Ipv4Addr::LOCALHOST);

        p.reset_status();
        assert!(p.credential.is_none());
        assert!(!p.is_connected);
        assert!(!p.is_working);
        assert!(p.public_ip.is_none());
        assert!(p.time_connected.is_none());
        assert!(p.used_credentials.is_empty());
        assert!(p.last_checked.is_none());
    }

    #[test]
    fn staleness_requires_a_live_connection() {
        let now = Utc::now();
        let mut p = port(now);
        assert!(!p.needs_reset(Duration::seconds(60), now));

        p.is_connected = true;
        p.time_connected = Some(now - Duration::seconds(120));
        assert!(p.needs_reset(Duration::seconds(60), now));
        assert!(!p.needs_reset(Duration::seconds(300), now));

        p.is_connected = false;
        assert!(!p.needs_reset(Duration::seconds(60), now));
    }

    #[test]
    fn credential_check_recording() {
        let now = Utc::now();
        let mut c = Credential::new(
            CredentialId(1),
            CredentialSeed {
                host: "10.0.0.5".into(),
                username: "admin".into(),
                password: "admin".into(),
                ssh_port: 22,
            },
            now,
        );
        assert!(c.is_live.is_none());
        assert!(!c.live());

        c.record_check(true, now);
        assert!(c.live());
        assert_eq!(c.last_checked, Some(now));

        c.reset_status();
        assert!(c.last_checked.is_none());
        // liveness knowledge survives a status reset
        assert!(c.live());
    }
}
