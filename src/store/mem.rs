//! Canonical entity store with optimistic transactions
//!
//! Owns every `Credential` and `Port`. Mutations run as transactions: the
//! entity is snapshotted together with a version counter, the caller's
//! closure edits the copy, and the commit re-checks the version: when a
//! concurrent writer got there first the closure simply runs again on
//! fresh state. Write conflicts therefore never escape this module, and a
//! transaction that returns an error commits nothing.
//!
//! Commits are also where derived state is maintained: port entities pass
//! through their before-commit hook, and the credential side of a
//! connected binding (`bound_port`, usage history) is mirrored here so the
//! two entity families can never disagree about who is connected to whom.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::entity::{
    Credential, CredentialId, CredentialKey, CredentialSeed, Port, PortId, MIN_FORWARD_PORT,
};
use super::error::StoreError;

struct Versioned<T> {
    version: u64,
    value: T,
}

#[derive(Default)]
struct Inner {
    credentials: HashMap<CredentialId, Versioned<Credential>>,
    cred_index: HashMap<CredentialKey, CredentialId>,
    ports: HashMap<PortId, Versioned<Port>>,
    port_index: HashMap<u16, PortId>,
}

pub struct EntityStore {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    /// Address rendered into derived `proxy_address` values.
    host_ip: Ipv4Addr,
}

impl EntityStore {
    pub fn new(host_ip: Ipv4Addr) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            host_ip,
        }
    }

    fn take_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // === inserts ===

    /// Create a credential. The (host, ssh_port, username, password) tuple
    /// is unique: an identical login is the same entity.
    pub fn insert_credential(&self, seed: CredentialSeed) -> Result<CredentialId, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let key = CredentialKey::from_seed(&seed);
        if inner.cred_index.contains_key(&key) {
            return Err(StoreError::DuplicateCredential(format!(
                "{}@{}:{}",
                seed.username, seed.host, seed.ssh_port
            )));
        }
        let id = CredentialId(self.take_id());
        inner.cred_index.insert(key, id);
        inner.credentials.insert(
            id,
            Versioned {
                version: 0,
                value: Credential::new(id, seed, now),
            },
        );
        Ok(id)
    }

    pub fn insert_port(&self, port_number: u16, auto_connect: bool) -> Result<PortId, StoreError> {
        if port_number < MIN_FORWARD_PORT {
            return Err(StoreError::PortOutOfRange(port_number));
        }
        let now = Utc::now();
        let mut inner = self.inner.write();
        if inner.port_index.contains_key(&port_number) {
            return Err(StoreError::DuplicatePort(port_number));
        }
        let id = PortId(self.take_id());
        let mut port = Port::new(id, port_number, auto_connect, now);
        port.finalize(now, self.host_ip);
        inner.port_index.insert(port_number, id);
        inner.ports.insert(
            id,
            Versioned {
                version: 0,
                value: port,
            },
        );
        Ok(id)
    }

    // === reads (snapshots) ===

    pub fn credential(&self, id: CredentialId) -> Option<Credential> {
        self.inner.read().credentials.get(&id).map(|v| v.value.clone())
    }

    pub fn port(&self, id: PortId) -> Option<Port> {
        self.inner.read().ports.get(&id).map(|v| v.value.clone())
    }

    pub fn port_by_number(&self, port_number: u16) -> Option<Port> {
        let inner = self.inner.read();
        let id = inner.port_index.get(&port_number)?;
        inner.ports.get(id).map(|v| v.value.clone())
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.inner.read().credentials.values().map(|v| v.value.clone()).collect()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.inner.read().ports.values().map(|v| v.value.clone()).collect()
    }

    pub fn live_credentials(&self) -> Vec<Credential> {
        self.inner
            .read()
            .credentials
            .values()
            .filter(|v| v.value.live())
            .map(|v| v.value.clone())
            .collect()
    }

    /// Credentials due for a liveness check: never checked, or last checked
    /// before `cutoff`. Oldest first, capped at `limit`.
    pub fn credentials_due_for_check(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Credential> {
        let mut due: Vec<Credential> = self
            .inner
            .read()
            .credentials
            .values()
            .filter(|v| match v.value.last_checked {
                None => true,
                Some(t) => t < cutoff,
            })
            .map(|v| v.value.clone())
            .collect();
        due.sort_by_key(|c| (c.last_checked, c.id));
        due.truncate(limit);
        due
    }

    // === transactions ===

    /// Run a transaction against one credential. The closure may run more
    /// than once; returning an error aborts without committing.
    pub fn update_credential<T>(
        &self,
        id: CredentialId,
        mut apply: impl FnMut(&mut Credential) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        loop {
            let (version, mut draft) = {
                let inner = self.inner.read();
                let v = inner
                    .credentials
                    .get(&id)
                    .ok_or(StoreError::CredentialNotFound(id))?;
                (v.version, v.value.clone())
            };

            let out = apply(&mut draft)?;

            let now = Utc::now();
            let mut inner = self.inner.write();
            let Some(current) = inner.credentials.get_mut(&id) else {
                return Err(StoreError::CredentialNotFound(id));
            };
            if current.version != version {
                // a concurrent writer won; rerun on fresh state
                continue;
            }
            draft.last_modified = now;
            current.version += 1;
            current.value = draft;
            return Ok(out);
        }
    }

    /// Run a transaction against one port. On commit the port passes
    /// through its before-commit hook and the credential side of the
    /// binding is mirrored.
    pub fn update_port<T>(
        &self,
        id: PortId,
        mut apply: impl FnMut(&mut Port) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        loop {
            let (version, mut draft) = {
                let inner = self.inner.read();
                let v = inner.ports.get(&id).ok_or(StoreError::PortNotFound(id))?;
                (v.version, v.value.clone())
            };
            let previously_bound = draft.is_connected.then_some(draft.credential).flatten();

            let out = apply(&mut draft)?;

            let now = Utc::now();
            let mut inner = self.inner.write();
            let Some(current) = inner.ports.get_mut(&id) else {
                return Err(StoreError::PortNotFound(id));
            };
            if current.version != version {
                continue;
            }
            draft.finalize(now, self.host_ip);
            current.version += 1;
            current.value = draft.clone();
            Self::mirror_binding(&mut inner, &draft, previously_bound, now);
            return Ok(out);
        }
    }

    /// Keep `Credential::bound_port` and `used_by` consistent with the
    /// port's committed state: mirrored while connected, history-only after.
    fn mirror_binding(
        inner: &mut Inner,
        port: &Port,
        previously_bound: Option<CredentialId>,
        now: DateTime<Utc>,
    ) {
        let bound = port.is_connected.then_some(port.credential).flatten();

        if let Some(old) = previously_bound {
            if bound != Some(old) {
                if let Some(cred) = inner.credentials.get_mut(&old) {
                    if cred.value.bound_port == Some(port.id) {
                        cred.value.bound_port = None;
                        cred.value.last_modified = now;
                        cred.version += 1;
                    }
                }
            }
        }

        if let Some(new) = bound {
            if let Some(cred) = inner.credentials.get_mut(&new) {
                let v = &mut cred.value;
                if v.bound_port != Some(port.id) || !v.used_by.contains(&port.id) {
                    v.bound_port = Some(port.id);
                    v.used_by.insert(port.id);
                    v.last_modified = now;
                    cred.version += 1;
                }
            }
        }
    }

    /// Compare-and-set assignment: succeeds only while the port has no
    /// credential, so two concurrent schedulers can never both bind it.
    pub fn assign_credential(
        &self,
        port_id: PortId,
        credential_id: CredentialId,
    ) -> Result<(), StoreError> {
        if self.credential(credential_id).is_none() {
            return Err(StoreError::CredentialNotFound(credential_id));
        }
        self.update_port(port_id, |port| {
            if port.credential.is_some() {
                return Err(StoreError::AlreadyAssigned(port_id));
            }
            port.assign(credential_id);
            Ok(())
        })
    }

    /// Record a liveness check outcome.
    pub fn record_credential_check(
        &self,
        id: CredentialId,
        is_live: bool,
    ) -> Result<(), StoreError> {
        self.update_credential(id, |cred| {
            cred.record_check(is_live, Utc::now());
            Ok(())
        })
    }

    /// Delete a credential unless it is known live. Returns whether the
    /// delete happened. Ports pointing at it are unbound; history ids stay
    /// behind (ids are never reused).
    pub fn delete_credential_if_dead(&self, id: CredentialId) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(v) = inner.credentials.get(&id) else {
            return Err(StoreError::CredentialNotFound(id));
        };
        if v.value.live() {
            return Ok(false);
        }
        let key = v.value.key();
        inner.credentials.remove(&id);
        inner.cred_index.remove(&key);

        let host_ip = self.host_ip;
        for port in inner.ports.values_mut() {
            if port.value.credential == Some(id) {
                port.value.clear_binding(false);
                port.value.finalize(now, host_ip);
                port.version += 1;
            }
        }
        Ok(true)
    }

    /// Wipe transient status from a previous run: ports return to the
    /// unassigned state, credentials keep identity and liveness but lose
    /// their check timestamps and bindings.
    pub fn reset_all_statuses(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let host_ip = self.host_ip;
        for port in inner.ports.values_mut() {
            port.value.reset_status();
            port.value.finalize(now, host_ip);
            port.version += 1;
        }
        for cred in inner.credentials.values_mut() {
            cred.value.reset_status();
            cred.value.bound_port = None;
            cred.value.last_modified = now;
            cred.version += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntityStore {
        EntityStore::new(Ipv4Addr::new(192, 168, 1, 10))
    }

    fn seed(host: &str) -> CredentialSeed {
        CredentialSeed {
            host: host.into(),
            username: "admin".into(),
            password: "admin".into(),
            ssh_port: 22,
        }
    }

    #[test]
    fn credential_tuple_is_unique() {
        let store = store();
        store.insert_credential(seed("10.0.0.5")).unwrap();
        assert!(matches!(
            store.insert_credential(seed("10.0.0.5")),
            Err(StoreError::DuplicateCredential(_))
        ));

        // any change to the tuple is a distinct entity
        let mut other = seed("10.0.0.5");
        other.password = "hunter2".into();
        store.insert_credential(other).unwrap();
        let mut other_port = seed("10.0.0.5");
        other_port.ssh_port = 2222;
        store.insert_credential(other_port).unwrap();
        assert_eq!(store.credentials().len(), 3);
    }

    #[test]
    fn port_number_is_unique_and_ranged() {
        let store = store();
        store.insert_port(20000, true).unwrap();
        assert!(matches!(
            store.insert_port(20000, true),
            Err(StoreError::DuplicatePort(20000))
        ));
        assert!(matches!(
            store.insert_port(80, true),
            Err(StoreError::PortOutOfRange(80))
        ));
        store.insert_port(65535, true).unwrap();
    }

    #[test]
    fn inserted_port_has_derived_proxy_address() {
        let store = store();
        let id = store.insert_port(20000, true).unwrap();
        let port = store.port(id).unwrap();
        assert_eq!(port.proxy_address, "socks5://192.168.1.10:20000");
    }

    #[test]
    fn assignment_is_compare_and_set() {
        let store = store();
        let c1 = store.insert_credential(seed("10.0.0.5")).unwrap();
        let c2 = store.insert_credential(seed("10.0.0.6")).unwrap();
        let p = store.insert_port(20000, true).unwrap();

        store.assign_credential(p, c1).unwrap();
        assert!(matches!(
            store.assign_credential(p, c2),
            Err(StoreError::AlreadyAssigned(_))
        ));
        assert_eq!(store.port(p).unwrap().credential, Some(c1));
    }

    #[test]
    fn failed_transaction_commits_nothing() {
        let store = store();
        let p = store.insert_port(20000, true).unwrap();
        let before = store.port(p).unwrap();

        let result: Result<(), _> = store.update_port(p, |port| {
            port.public_ip = Some("6.6.6.6".into());
            Err(StoreError::PortOutOfRange(0))
        });
        assert!(result.is_err());
        assert_eq!(store.port(p).unwrap().public_ip, before.public_ip);
    }

    #[test]
    fn binding_is_mirrored_only_while_connected() {
        let store = store();
        let c = store.insert_credential(seed("10.0.0.5")).unwrap();
        let p = store.insert_port(20000, true).unwrap();

        store.assign_credential(p, c).unwrap();
        assert_eq!(store.credential(c).unwrap().bound_port, None);

        store
            .update_port(p, |port| {
                port.is_connected = true;
                Ok(())
            })
            .unwrap();
        let cred = store.credential(c).unwrap();
        assert_eq!(cred.bound_port, Some(p));
        assert!(cred.used_by.contains(&p));

        store
            .update_port(p, |port| {
                port.clear_binding(false);
                Ok(())
            })
            .unwrap();
        let cred = store.credential(c).unwrap();
        assert_eq!(cred.bound_port, None);
        // history survives disconnection on both sides
        assert!(cred.used_by.contains(&p));
        assert!(store.port(p).unwrap().used_credentials.contains(&c));
    }

    #[test]
    fn delete_if_dead_spares_live_credentials() {
        let store = store();
        let c = store.insert_credential(seed("10.0.0.5")).unwrap();

        store.record_credential_check(c, true).unwrap();
        assert!(!store.delete_credential_if_dead(c).unwrap());
        assert!(store.credential(c).is_some());

        store.record_credential_check(c, false).unwrap();
        assert!(store.delete_credential_if_dead(c).unwrap());
        assert!(store.credential(c).is_none());

        // the tuple is free again
        store.insert_credential(seed("10.0.0.5")).unwrap();
    }

    #[test]
    fn deleting_a_credential_unbinds_its_port() {
        let store = store();
        let c = store.insert_credential(seed("10.0.0.5")).unwrap();
        let p = store.insert_port(20000, true).unwrap();
        store.assign_credential(p, c).unwrap();
        store
            .update_port(p, |port| {
                port.is_connected = true;
                port.is_working = true;
                Ok(())
            })
            .unwrap();

        store.delete_credential_if_dead(c).unwrap();
        let port = store.port(p).unwrap();
        assert!(port.credential.is_none());
        assert!(!port.is_connected);
        assert!(!port.is_working);
    }

    #[test]
    fn due_credentials_are_oldest_first_and_capped() {
        let store = store();
        let a = store.insert_credential(seed("10.0.0.1")).unwrap();
        let b = store.insert_credential(seed("10.0.0.2")).unwrap();
        let c = store.insert_credential(seed("10.0.0.3")).unwrap();

        store.record_credential_check(b, true).unwrap();

        let due = store.credentials_due_for_check(Utc::now(), 10);
        // never-checked entries lead, in insertion order
        assert_eq!(due[0].id, a);
        assert_eq!(due[1].id, c);
        assert_eq!(due[2].id, b);
        assert_eq!(store.credentials_due_for_check(Utc::now(), 2).len(), 2);
    }

    #[test]
    fn reset_all_statuses_returns_ports_to_unassigned() {
        let store = store();
        let c = store.insert_credential(seed("10.0.0.5")).unwrap();
        let p = store.insert_port(20000, true).unwrap();
        store.record_credential_check(c, true).unwrap();
        store.assign_credential(p, c).unwrap();
        store
            .update_port(p, |port| {
                port.is_connected = true;
                Ok(())
            })
            .unwrap();

        store.reset_all_statuses();

        let port = store.port(p).unwrap();
        assert!(port.credential.is_none());
        assert!(!port.is_connected);
        assert!(port.used_credentials.is_empty());

        let cred = store.credential(c).unwrap();
        assert!(cred.last_checked.is_none());
        assert!(cred.bound_port.is_none());
        // liveness knowledge is kept across restarts
        assert!(cred.live());
    }
}
