//! XA-style branch management on top of [`ResourceManager`].
//!
//! A branch is identified by an [`Xid`] and is associated with one or more
//! threads of work between `start` and `end`. Only idle branches (no live
//! association, not suspended) can be prepared, committed, or rolled back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

use super::context::{PrepareVote, TransactionContext, TransactionStatus};
use super::error::XaError;
use super::manager::{ResourceManager, TransactionalResource};
use crate::config::TransactionConfig;

// ---------------------------------------------------------------------------
// Xid
// ---------------------------------------------------------------------------

/// Global transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex::encode(&self.global_id),
            hex::encode(&self.branch_qualifier)
        )
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// How [`XaResourceManager::start`] associates work with a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// Create a new branch.
    NoFlags,
    /// Associate with an existing branch.
    Join,
    /// Resume a suspended branch.
    Resume,
}

/// How [`XaResourceManager::end`] dissociates work from a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    /// The work failed; the branch becomes rollback-only.
    Fail,
    /// Detach without finishing; resume later with [`StartFlag::Resume`].
    Suspend,
}

/// A branch attached to the manager. `associations` counts threads of work
/// currently between `start` and `end`.
#[derive(Debug)]
struct Branch {
    tx: Arc<TransactionContext>,
    associations: usize,
}

// ---------------------------------------------------------------------------
// XaResourceManager
// ---------------------------------------------------------------------------

/// XA front end over a [`ResourceManager`]: maps [`Xid`]s to local
/// transactions and enforces the start/end/prepare/commit protocol per branch.
pub struct XaResourceManager<R> {
    manager: ResourceManager<R>,
    active: DashMap<Xid, Branch>,
    suspended: DashMap<Xid, Arc<TransactionContext>>,
    /// Zero means the manager's default.
    timeout_ms: AtomicU64,
}

impl<R: TransactionalResource> XaResourceManager<R> {
    pub fn new(name: impl Into<String>, resource: R, config: TransactionConfig) -> Self {
        Self {
            manager: ResourceManager::new(name, resource, config),
            active: DashMap::new(),
            suspended: DashMap::new(),
            timeout_ms: AtomicU64::new(0),
        }
    }

    /// The underlying manager; use it for lifecycle operations.
    #[must_use]
    pub fn manager(&self) -> &ResourceManager<R> {
        &self.manager
    }

    /// Timeout applied to branches started from now on. Zero restores the
    /// manager default.
    pub fn set_transaction_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms.store(millis, Ordering::Relaxed);
    }

    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => self.manager.default_timeout(),
            millis => Duration::from_millis(millis),
        }
    }

    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.active.len() + self.suspended.len()
    }

    #[must_use]
    pub fn is_suspended(&self, xid: &Xid) -> bool {
        self.suspended.contains_key(xid)
    }

    #[must_use]
    pub fn status(&self, xid: &Xid) -> Option<TransactionStatus> {
        if let Some(branch) = self.active.get(xid) {
            return Some(branch.tx.status());
        }
        self.suspended.get(xid).map(|tx| tx.status())
    }

    /// # Errors
    ///
    /// - `DuplicateXid` when creating a branch that exists.
    /// - `UnknownXid` when joining or resuming a branch that does not.
    /// - `Protocol` when joining a suspended branch or resuming one that is
    ///   not suspended.
    /// - `Manager` when the transaction cannot begin.
    pub fn start(&self, xid: &Xid, flag: StartFlag) -> Result<(), XaError> {
        match flag {
            StartFlag::NoFlags => {
                if self.active.contains_key(xid) || self.suspended.contains_key(xid) {
                    return Err(XaError::DuplicateXid(xid.clone()));
                }
                // The begin hook runs without any shard lock held so that it may
                // call back into this manager.
                let tx = Arc::new(TransactionContext::new(self.transaction_timeout()));
                self.manager.begin_transaction(&tx)?;
                match self.active.entry(xid.clone()) {
                    Entry::Occupied(_) => {
                        let _ = self.manager.rollback_transaction(&tx);
                        Err(XaError::DuplicateXid(xid.clone()))
                    }
                    Entry::Vacant(slot) => {
                        tracing::debug!(
                            manager = %self.manager.name(),
                            %xid,
                            tx = %tx.id(),
                            "branch started"
                        );
                        slot.insert(Branch { tx, associations: 1 });
                        Ok(())
                    }
                }
            }
            StartFlag::Join => {
                let mut branch = self.active_branch(xid)?;
                branch.associations += 1;
                Ok(())
            }
            StartFlag::Resume => {
                let Some((_, tx)) = self.suspended.remove(xid) else {
                    return Err(if self.active.contains_key(xid) {
                        protocol(xid, "branch is not suspended")
                    } else {
                        XaError::UnknownXid(xid.clone())
                    });
                };
                tracing::debug!(manager = %self.manager.name(), %xid, "branch resumed");
                self.active.insert(xid.clone(), Branch { tx, associations: 1 });
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// - `UnknownXid` for an unknown branch.
    /// - `Protocol` when the branch has no live association, or when
    ///   suspending a branch that other threads are still associated with.
    /// - `Manager` when a failed branch cannot be marked rollback-only.
    pub fn end(&self, xid: &Xid, flag: EndFlag) -> Result<(), XaError> {
        let tx = {
            let mut branch = self.active_branch(xid)?;
            if branch.associations == 0 {
                return Err(protocol(xid, "branch is not associated"));
            }
            if flag == EndFlag::Suspend && branch.associations > 1 {
                return Err(protocol(xid, "branch has other associations"));
            }
            branch.associations -= 1;
            Arc::clone(&branch.tx)
        };
        match flag {
            EndFlag::Success => {}
            EndFlag::Fail => self.manager.set_rollback_only(&tx)?,
            EndFlag::Suspend => {
                self.active.remove(xid);
                self.suspended.insert(xid.clone(), tx);
                tracing::debug!(manager = %self.manager.name(), %xid, "branch suspended");
            }
        }
        Ok(())
    }

    /// Prepares an idle branch. A read-only branch is committed and forgotten
    /// immediately.
    ///
    /// # Errors
    ///
    /// - `UnknownXid` / `Protocol` for unknown, busy, or suspended branches.
    /// - `Manager` when preparing fails. A recoverable failure has already
    ///   rolled the branch back.
    pub fn prepare(&self, xid: &Xid) -> Result<PrepareVote, XaError> {
        let tx = self.idle_branch(xid)?;
        match self.manager.prepare_transaction(&tx) {
            Ok(PrepareVote::ReadOnly) => {
                let outcome = self.manager.commit_transaction(&tx);
                self.release_if_settled(xid, &tx);
                outcome?;
                Ok(PrepareVote::ReadOnly)
            }
            Ok(vote) => Ok(vote),
            Err(err) => {
                self.release_if_settled(xid, &tx);
                Err(err.into())
            }
        }
    }

    /// Commits an idle branch. Two-phase commit requires a prepared branch;
    /// one-phase commit takes an unprepared one.
    ///
    /// A branch whose outcome is `Unknown` afterwards is kept until
    /// [`forget`](Self::forget).
    ///
    /// # Errors
    ///
    /// - `UnknownXid` / `Protocol` for unknown, busy, or wrongly-staged
    ///   branches.
    /// - `Manager` when committing fails.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> Result<TransactionStatus, XaError> {
        let tx = self.idle_branch(xid)?;
        match (one_phase, tx.status()) {
            (true, TransactionStatus::Active | TransactionStatus::MarkedRollback)
            | (false, TransactionStatus::Prepared) => {}
            (true, _) => return Err(protocol(xid, "one-phase commit of a prepared branch")),
            (false, _) => return Err(protocol(xid, "branch is not prepared")),
        }
        let result = self.manager.commit_transaction(&tx);
        self.release_if_settled(xid, &tx);
        Ok(result?)
    }

    /// Rolls back a branch, including a suspended one.
    ///
    /// # Errors
    ///
    /// - `UnknownXid` for an unknown branch.
    /// - `Protocol` while the branch still has a live association.
    /// - `Manager` when rolling back fails.
    pub fn rollback(&self, xid: &Xid) -> Result<TransactionStatus, XaError> {
        // A suspended branch becomes an idle active one so that an unknown
        // outcome stays visible to `forget`.
        if let Some((_, tx)) = self.suspended.remove(xid) {
            self.active.insert(xid.clone(), Branch { tx, associations: 0 });
        }
        let tx = self.idle_branch(xid)?;
        let result = self.manager.rollback_transaction(&tx);
        self.release_if_settled(xid, &tx);
        Ok(result?)
    }

    /// Discards a branch whose outcome is final or unknown.
    ///
    /// # Errors
    ///
    /// `UnknownXid`, or `Protocol` when the branch is still undecided.
    pub fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        let status = self
            .status(xid)
            .ok_or_else(|| XaError::UnknownXid(xid.clone()))?;
        if status != TransactionStatus::Unknown && !status.is_terminal() {
            return Err(protocol(xid, "branch outcome is not decided"));
        }
        self.active.remove(xid);
        tracing::debug!(manager = %self.manager.name(), %xid, ?status, "branch forgotten");
        Ok(())
    }

    /// Branches that are prepared and waiting for a commit decision.
    #[must_use]
    pub fn recover(&self) -> Vec<Xid> {
        self.active
            .iter()
            .filter(|entry| entry.value().tx.status() == TransactionStatus::Prepared)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn active_branch(&self, xid: &Xid) -> Result<RefMut<'_, Xid, Branch>, XaError> {
        self.active.get_mut(xid).ok_or_else(|| {
            if self.suspended.contains_key(xid) {
                protocol(xid, "branch is suspended")
            } else {
                XaError::UnknownXid(xid.clone())
            }
        })
    }

    fn idle_branch(&self, xid: &Xid) -> Result<Arc<TransactionContext>, XaError> {
        let branch = self.active_branch(xid)?;
        if branch.associations > 0 {
            return Err(protocol(xid, "branch is still associated"));
        }
        Ok(Arc::clone(&branch.tx))
    }

    /// Drops the branch once its transaction reached a final state. `Unknown`
    /// outcomes stay until forgotten.
    fn release_if_settled(&self, xid: &Xid, tx: &TransactionContext) {
        if tx.status().is_terminal() {
            self.active.remove(xid);
        }
    }
}

fn protocol(xid: &Xid, reason: &'static str) -> XaError {
    XaError::Protocol {
        xid: xid.clone(),
        reason,
    }
}

impl<R> fmt::Debug for XaResourceManager<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaResourceManager")
            .field("manager", &self.manager)
            .field("active", &self.active.len())
            .field("suspended", &self.suspended.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
