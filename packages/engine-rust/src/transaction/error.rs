//! Errors of resource hooks, the local resource manager and XA branches.

use uuid::Uuid;

use super::context::TransactionStatus;
use super::manager::ManagerState;
use super::xa::Xid;

// ---------------------------------------------------------------------------
// ResourceError
// ---------------------------------------------------------------------------

/// Failure reported by a resource hook.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The operation failed but the resource is consistent; the transaction
    /// can still be rolled back.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// The resource is in an unknown state. Poisons the manager.
    #[error("{0:#}")]
    System(anyhow::Error),
}

impl ResourceError {
    pub fn recoverable(cause: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(cause.into())
    }

    pub fn system(cause: impl Into<anyhow::Error>) -> Self {
        Self::System(cause.into())
    }
}

// ---------------------------------------------------------------------------
// ResourceManagerError
// ---------------------------------------------------------------------------

/// Error returned by [`ResourceManager`](super::ResourceManager) operations.
#[derive(Debug, thiserror::Error)]
pub enum ResourceManagerError {
    #[error("resource manager '{manager}' is dirty and must be recovered")]
    ManagerDirty { manager: String },
    #[error("resource manager '{manager}' is {state:?}, expected {expected}")]
    InvalidManagerState {
        manager: String,
        state: ManagerState,
        expected: &'static str,
    },
    #[error("transaction {id} cannot move from {from:?} to {to:?}")]
    InvalidTransactionState {
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("transaction {id} is not registered with resource manager '{manager}'")]
    UnknownTransaction { id: Uuid, manager: String },
    #[error("transaction {id} is marked rollback-only")]
    RollbackRequired { id: Uuid },
    #[error("resource failure: {0:#}")]
    Resource(anyhow::Error),
    #[error("unrecoverable resource failure: {0:#}")]
    System(anyhow::Error),
}

impl ResourceManagerError {
    /// Errors after which the manager is dirty.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::System(_) | Self::ManagerDirty { .. })
    }
}

impl From<ResourceError> for ResourceManagerError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Recoverable(cause) => Self::Resource(cause),
            ResourceError::System(cause) => Self::System(cause),
        }
    }
}

// ---------------------------------------------------------------------------
// XaError
// ---------------------------------------------------------------------------

/// Error returned by [`XaResourceManager`](super::XaResourceManager)
/// operations. Local manager failures pass through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum XaError {
    #[error("unknown transaction branch {0}")]
    UnknownXid(Xid),
    #[error("transaction branch {0} already exists")]
    DuplicateXid(Xid),
    #[error("protocol error on branch {xid}: {reason}")]
    Protocol { xid: Xid, reason: &'static str },
    #[error(transparent)]
    Manager(#[from] ResourceManagerError),
}
