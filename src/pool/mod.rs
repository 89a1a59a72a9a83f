//! Pool policy layer: credential selection, connection scheduling, dead
//! credential replacement, and rotation, driven by periodic tasks.

mod orchestrator;
mod supplier;
mod tasks;

use thiserror::Error;

pub use orchestrator::Orchestrator;
pub use supplier::{parse_credential_lines, CredentialSupplier, SshStoreSupplier, SupplierError};
pub use tasks::PoolDriver;

use crate::store::StoreError;
use crate::tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("establishment deadline exceeded")]
    Deadline,
}
