//! Entity model: credentials, ports, and the transactional store that
//! owns them. The store is the source of truth for what policy believes
//! about the pool; live OS-level sessions belong to the tunnel registry.

mod entity;
mod error;
mod mem;

pub use entity::{
    Credential, CredentialId, CredentialSeed, Port, PortId, DEFAULT_SSH_PORT, MIN_FORWARD_PORT,
};
pub use error::StoreError;
pub use mem::EntityStore;
