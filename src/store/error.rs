//! Entity store error types

use thiserror::Error;

use super::entity::{CredentialId, PortId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("credential {0} already exists")]
    DuplicateCredential(String),

    #[error("port {0} already exists")]
    DuplicatePort(u16),

    #[error("port number {0} outside the forwardable range")]
    PortOutOfRange(u16),

    #[error("credential {0} not found")]
    CredentialNotFound(CredentialId),

    #[error("port {0} not found")]
    PortNotFound(PortId),

    #[error("port {0} already has a credential assigned")]
    AlreadyAssigned(PortId),
}
