//! Local two-phase-commit resource management and XA branches.

pub mod context;
pub mod error;
pub mod manager;
pub mod xa;

pub use context::{PrepareVote, TransactionContext, TransactionStatus};
pub use error::{ResourceError, ResourceManagerError, XaError};
pub use manager::{ManagerState, ResourceManager, ShutdownMode, TransactionalResource};
pub use xa::{EndFlag, StartFlag, XaResourceManager, Xid};
