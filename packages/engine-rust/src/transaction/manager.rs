//! Two-phase-commit resource manager.
//!
//! Drives a [`TransactionalResource`] through begin, prepare, commit and
//! rollback, tracks in-flight transactions for graceful shutdown, and poisons
//! itself (state `Dirty`) when the resource reports an unrecoverable failure.
//! A dirty manager refuses all work until [`ResourceManager::recover`] runs.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use junction_core::panic_message;
use parking_lot::Mutex;
use uuid::Uuid;

use super::context::{PrepareVote, TransactionContext, TransactionStatus};
use super::error::{ResourceError, ResourceManagerError};
use crate::config::TransactionConfig;

// ---------------------------------------------------------------------------
// TransactionalResource
// ---------------------------------------------------------------------------

/// Hooks a transactional resource provides to its manager.
///
/// Hooks run on the caller's thread and may block. A hook that panics is
/// treated like one that returned [`ResourceError::System`].
pub trait TransactionalResource: Send + Sync + 'static {
    /// Brings the resource to a consistent state after a start or a failure.
    fn recover(&self) -> Result<(), ResourceError> {
        Ok(())
    }

    fn begin(&self, _tx: &TransactionContext) -> Result<(), ResourceError> {
        Ok(())
    }

    fn prepare(&self, _tx: &TransactionContext) -> Result<PrepareVote, ResourceError> {
        Ok(PrepareVote::Commit)
    }

    fn commit(&self, tx: &TransactionContext) -> Result<(), ResourceError>;

    fn rollback(&self, tx: &TransactionContext) -> Result<(), ResourceError>;
}

// ---------------------------------------------------------------------------
// ManagerState
// ---------------------------------------------------------------------------

/// Manager lifecycle.
///
/// `Stopped -> Starting -> Recovering -> Started -> Stopping -> Stopped`.
/// `Dirty` is entered on an unrecoverable resource failure and left only
/// through [`ResourceManager::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Recovering,
    Started,
    Stopping,
    Dirty,
}

/// How [`ResourceManager::stop`] treats in-flight transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Wait for in-flight transactions to finish.
    #[default]
    Normal,
    /// Roll back transactions that are not already committing, then wait for
    /// the rest.
    Rollback,
    /// Abandon in-flight transactions without waiting.
    Kill,
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

/// Coordinates local transactions against one resource `R`.
///
/// Transactions are created by [`ResourceManager::new_transaction`] and
/// finished by [`ResourceManager::commit_transaction`] or
/// [`ResourceManager::rollback_transaction`]. Only a `Started` manager accepts
/// new work.
pub struct ResourceManager<R> {
    name: String,
    resource: R,
    config: TransactionConfig,
    /// Read lock-free; written only while holding `in_flight`.
    state: ArcSwap<ManagerState>,
    in_flight: Mutex<HashMap<Uuid, Arc<TransactionContext>>>,
}

impl<R: TransactionalResource> ResourceManager<R> {
    pub fn new(name: impl Into<String>, resource: R, config: TransactionConfig) -> Self {
        Self {
            name: name.into(),
            resource,
            config,
            state: ArcSwap::from_pointee(ManagerState::Stopped),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn resource(&self) -> &R {
        &self.resource
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state() == ManagerState::Dirty
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    fn set_state(&self, next: ManagerState) {
        let previous = *self.state.swap(Arc::new(next));
        if previous != next {
            tracing::debug!(
                manager = %self.name,
                from = ?previous,
                to = ?next,
                "manager state changed"
            );
        }
    }

    fn ensure_state(
        &self,
        allowed: &[ManagerState],
        expected: &'static str,
    ) -> Result<(), ResourceManagerError> {
        let state = self.state();
        if state == ManagerState::Dirty {
            return Err(ResourceManagerError::ManagerDirty {
                manager: self.name.clone(),
            });
        }
        if !allowed.contains(&state) {
            return Err(ResourceManagerError::InvalidManagerState {
                manager: self.name.clone(),
                state,
                expected,
            });
        }
        Ok(())
    }

    fn ensure_registered(&self, tx: &TransactionContext) -> Result<(), ResourceManagerError> {
        if self.in_flight.lock().contains_key(&tx.id()) {
            Ok(())
        } else {
            Err(ResourceManagerError::UnknownTransaction {
                id: tx.id(),
                manager: self.name.clone(),
            })
        }
    }

    /// Calls a resource hook, turning a panic into a system error.
    fn invoke<T>(
        &self,
        hook: &'static str,
        f: impl FnOnce(&R) -> Result<T, ResourceError>,
    ) -> Result<T, ResourceError> {
        match catch_unwind(AssertUnwindSafe(|| f(&self.resource))) {
            Ok(result) => result,
            Err(payload) => Err(ResourceError::System(anyhow::anyhow!(
                "{hook} hook panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn mark_dirty(&self, operation: &'static str, cause: &anyhow::Error) {
        let _guard = self.in_flight.lock();
        self.set_state(ManagerState::Dirty);
        tracing::error!(
            manager = %self.name,
            operation,
            error = %format!("{cause:#}"),
            "unrecoverable resource failure, manager is dirty"
        );
    }

    /// Removes `tx` from the in-flight set and wakes anyone waiting on it.
    fn finish(&self, tx: &TransactionContext) {
        self.in_flight.lock().remove(&tx.id());
        tx.notify_finish();
    }

    /// Starts the manager and runs resource recovery.
    ///
    /// A failed recovery leaves the manager `Dirty` but is not an error of
    /// `start` itself.
    ///
    /// # Errors
    ///
    /// Fails when the manager is not `Stopped`.
    pub fn start(&self) -> Result<(), ResourceManagerError> {
        {
            let _guard = self.in_flight.lock();
            self.ensure_state(&[ManagerState::Stopped], "Stopped")?;
            self.set_state(ManagerState::Starting);
            self.set_state(ManagerState::Recovering);
        }
        tracing::info!(manager = %self.name, "starting resource manager");

        match self.invoke("recover", |r| r.recover()) {
            Ok(()) => {
                let _guard = self.in_flight.lock();
                self.set_state(ManagerState::Started);
                tracing::info!(manager = %self.name, "resource manager started");
            }
            Err(ResourceError::Recoverable(cause) | ResourceError::System(cause)) => {
                self.mark_dirty("recover", &cause);
            }
        }
        Ok(())
    }

    /// Creates and begins a transaction with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`begin_transaction`](Self::begin_transaction).
    pub fn new_transaction(&self) -> Result<Arc<TransactionContext>, ResourceManagerError> {
        self.new_transaction_with_timeout(self.config.default_timeout())
    }

    /// # Errors
    ///
    /// See [`begin_transaction`](Self::begin_transaction).
    pub fn new_transaction_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Arc<TransactionContext>, ResourceManagerError> {
        let tx = Arc::new(TransactionContext::new(timeout));
        self.begin_transaction(&tx)?;
        Ok(tx)
    }

    /// Begins `tx` and registers it as in flight.
    ///
    /// # Errors
    ///
    /// - `ManagerDirty` / `InvalidManagerState` unless the manager is `Started`.
    /// - `InvalidTransactionState` if `tx` was already begun.
    /// - `Resource` / `System` when the begin hook fails.
    pub fn begin_transaction(
        &self,
        tx: &Arc<TransactionContext>,
    ) -> Result<(), ResourceManagerError> {
        {
            let mut in_flight = self.in_flight.lock();
            self.ensure_state(&[ManagerState::Started], "Started")?;
            tx.transition(TransactionStatus::Active)?;
            in_flight.insert(tx.id(), Arc::clone(tx));
        }

        match self.invoke("begin", |r| r.begin(tx)) {
            Ok(()) => {
                tracing::debug!(manager = %self.name, tx = %tx.id(), "transaction begun");
                Ok(())
            }
            Err(err) => {
                // Nothing was started, so there is nothing to undo.
                let _ = tx.transition(TransactionStatus::RollingBack);
                let _ = tx.transition(TransactionStatus::RolledBack);
                self.finish(tx);
                if let ResourceError::System(cause) = &err {
                    self.mark_dirty("begin", cause);
                }
                Err(err.into())
            }
        }
    }

    /// Marks `tx` so that it can only be rolled back.
    ///
    /// # Errors
    ///
    /// Fails when the manager is dirty or `tx` is not active.
    pub fn set_rollback_only(&self, tx: &TransactionContext) -> Result<(), ResourceManagerError> {
        self.ensure_state(
            &[ManagerState::Started, ManagerState::Stopping],
            "Started or Stopping",
        )?;
        if tx.status() == TransactionStatus::MarkedRollback {
            return Ok(());
        }
        tx.transition(TransactionStatus::MarkedRollback)?;
        tracing::debug!(manager = %self.name, tx = %tx.id(), "transaction marked rollback-only");
        Ok(())
    }

    /// Fails fast for transactions that can only be rolled back. Expired
    /// transactions are marked rollback-only here.
    fn check_committable(&self, tx: &TransactionContext) -> Result<(), ResourceManagerError> {
        match tx.status() {
            TransactionStatus::MarkedRollback => {
                Err(ResourceManagerError::RollbackRequired { id: tx.id() })
            }
            TransactionStatus::Active if tx.is_expired() => {
                tracing::warn!(
                    manager = %self.name,
                    tx = %tx.id(),
                    timeout_ms = u64::try_from(tx.timeout().as_millis()).unwrap_or(u64::MAX),
                    "transaction expired, marking rollback-only"
                );
                tx.transition(TransactionStatus::MarkedRollback)?;
                Err(ResourceManagerError::RollbackRequired { id: tx.id() })
            }
            _ => Ok(()),
        }
    }

    /// Runs the prepare phase: `Active -> Preparing -> Prepared`.
    ///
    /// A recoverable prepare failure rolls the transaction back and returns
    /// the failure.
    ///
    /// # Errors
    ///
    /// - `RollbackRequired` for rollback-only or expired transactions.
    /// - `Resource` / `System` when the prepare hook fails.
    pub fn prepare_transaction(
        &self,
        tx: &TransactionContext,
    ) -> Result<PrepareVote, ResourceManagerError> {
        self.ensure_state(
            &[ManagerState::Started, ManagerState::Stopping],
            "Started or Stopping",
        )?;
        self.ensure_registered(tx)?;
        self.check_committable(tx)?;

        match self.prepare_phase(tx) {
            Ok(vote) => Ok(vote),
            Err(ResourceError::Recoverable(cause)) => {
                tracing::warn!(
                    manager = %self.name,
                    tx = %tx.id(),
                    error = %format!("{cause:#}"),
                    "prepare failed, rolling back"
                );
                let _ = self.rollback_phase(tx);
                self.finish(tx);
                Err(ResourceManagerError::Resource(cause))
            }
            Err(ResourceError::System(cause)) => {
                let _ = tx.transition(TransactionStatus::Unknown);
                self.finish(tx);
                self.mark_dirty("prepare", &cause);
                Err(ResourceManagerError::System(cause))
            }
        }
    }

    fn prepare_phase(&self, tx: &TransactionContext) -> Result<PrepareVote, ResourceError> {
        tx.transition(TransactionStatus::Preparing)
            .map_err(|e| ResourceError::Recoverable(e.into()))?;
        let vote = self.invoke("prepare", |r| r.prepare(tx))?;
        tx.record_vote(vote);
        tx.transition(TransactionStatus::Prepared)
            .map_err(|e| ResourceError::Recoverable(e.into()))?;
        tracing::debug!(manager = %self.name, tx = %tx.id(), ?vote, "transaction prepared");
        Ok(vote)
    }

    /// Commits `tx`, preparing it first when still active.
    ///
    /// Returns the final status: `Committed`, or `RolledBack` when a
    /// recoverable failure forced a rollback instead.
    ///
    /// # Errors
    ///
    /// - `RollbackRequired` for rollback-only or expired transactions; the
    ///   transaction stays in flight until rolled back.
    /// - `System` on an unrecoverable failure; the manager becomes dirty.
    /// - `Resource` when the fallback rollback also failed; the status is
    ///   then `Unknown`.
    pub fn commit_transaction(
        &self,
        tx: &TransactionContext,
    ) -> Result<TransactionStatus, ResourceManagerError> {
        self.ensure_state(
            &[ManagerState::Started, ManagerState::Stopping],
            "Started or Stopping",
        )?;
        self.ensure_registered(tx)?;
        self.check_committable(tx)?;

        let result = self.commit_phases(tx);
        if !matches!(result, Err(ResourceManagerError::InvalidTransactionState { .. })) {
            self.finish(tx);
        }
        match &result {
            Ok(status) => {
                tracing::debug!(
                    manager = %self.name,
                    tx = %tx.id(),
                    ?status,
                    "transaction finished"
                );
            }
            Err(err) => {
                tracing::warn!(manager = %self.name, tx = %tx.id(), error = %err, "commit failed");
            }
        }
        result
    }

    fn commit_phases(
        &self,
        tx: &TransactionContext,
    ) -> Result<TransactionStatus, ResourceManagerError> {
        let vote = match tx.status() {
            TransactionStatus::Active => self.prepare_phase(tx),
            TransactionStatus::Prepared => Ok(tx.vote().unwrap_or(PrepareVote::Commit)),
            from => {
                return Err(ResourceManagerError::InvalidTransactionState {
                    id: tx.id(),
                    from,
                    to: TransactionStatus::Committing,
                })
            }
        };

        let committed = vote.and_then(|vote| {
            tx.transition(TransactionStatus::Committing)
                .map_err(|e| ResourceError::Recoverable(e.into()))?;
            if vote == PrepareVote::Commit {
                self.invoke("commit", |r| r.commit(tx))?;
            }
            tx.transition(TransactionStatus::Committed)
                .map_err(|e| ResourceError::Recoverable(e.into()))?;
            Ok(TransactionStatus::Committed)
        });

        match committed {
            Ok(status) => Ok(status),
            Err(ResourceError::Recoverable(cause)) => {
                tracing::warn!(
                    manager = %self.name,
                    tx = %tx.id(),
                    error = %format!("{cause:#}"),
                    "commit failed, falling back to rollback"
                );
                self.rollback_phase(tx)
            }
            Err(ResourceError::System(cause)) => {
                let _ = tx.transition(TransactionStatus::Unknown);
                self.mark_dirty("commit", &cause);
                Err(ResourceManagerError::System(cause))
            }
        }
    }

    /// Rolls back `tx`.
    ///
    /// # Errors
    ///
    /// - `Resource` when the rollback hook fails recoverably; the status is
    ///   then `Unknown`.
    /// - `System` on an unrecoverable failure; the manager becomes dirty.
    pub fn rollback_transaction(
        &self,
        tx: &TransactionContext,
    ) -> Result<TransactionStatus, ResourceManagerError> {
        self.ensure_state(
            &[ManagerState::Started, ManagerState::Stopping],
            "Started or Stopping",
        )?;
        self.ensure_registered(tx)?;

        let result = self.rollback_phase(tx);
        self.finish(tx);
        result
    }

    fn rollback_phase(
        &self,
        tx: &TransactionContext,
    ) -> Result<TransactionStatus, ResourceManagerError> {
        tx.transition(TransactionStatus::RollingBack)?;
        match self.invoke("rollback", |r| r.rollback(tx)) {
            Ok(()) => {
                tx.transition(TransactionStatus::RolledBack)?;
                tracing::debug!(manager = %self.name, tx = %tx.id(), "transaction rolled back");
                Ok(TransactionStatus::RolledBack)
            }
            Err(ResourceError::Recoverable(cause)) => {
                let _ = tx.transition(TransactionStatus::Unknown);
                tracing::warn!(
                    manager = %self.name,
                    tx = %tx.id(),
                    error = %format!("{cause:#}"),
                    "rollback failed, outcome unknown"
                );
                Err(ResourceManagerError::Resource(cause))
            }
            Err(ResourceError::System(cause)) => {
                let _ = tx.transition(TransactionStatus::Unknown);
                self.mark_dirty("rollback", &cause);
                Err(ResourceManagerError::System(cause))
            }
        }
    }

    /// Stops the manager, waiting up to `timeout` for in-flight transactions.
    ///
    /// Returns `true` once every transaction has finished (state `Stopped`)
    /// and `false` when the timeout expired first (state stays `Stopping`) or
    /// the manager is dirty.
    pub fn stop(&self, mode: ShutdownMode, timeout: Duration) -> bool {
        // `None` when the timeout is too large to represent: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        {
            let _guard = self.in_flight.lock();
            match self.state() {
                ManagerState::Dirty => {
                    tracing::error!(manager = %self.name, "cannot stop a dirty resource manager");
                    return false;
                }
                ManagerState::Stopped => return true,
                ManagerState::Started | ManagerState::Stopping => {
                    self.set_state(ManagerState::Stopping);
                }
                state @ (ManagerState::Starting | ManagerState::Recovering) => {
                    tracing::warn!(
                        manager = %self.name,
                        ?state,
                        "cannot stop a resource manager that is still starting"
                    );
                    return false;
                }
            }
        }
        tracing::info!(
            manager = %self.name,
            ?mode,
            in_flight = self.in_flight_count(),
            "stopping resource manager"
        );

        let snapshot: Vec<Arc<TransactionContext>> =
            self.in_flight.lock().values().cloned().collect();

        match mode {
            ShutdownMode::Kill => {
                let abandoned = {
                    let mut in_flight = self.in_flight.lock();
                    let abandoned: Vec<_> = in_flight.drain().map(|(_, tx)| tx).collect();
                    self.set_state(ManagerState::Stopped);
                    abandoned
                };
                for tx in &abandoned {
                    let _ = tx.transition(TransactionStatus::Unknown);
                    tx.notify_finish();
                }
                if !abandoned.is_empty() {
                    tracing::warn!(
                        manager = %self.name,
                        abandoned = abandoned.len(),
                        "killed with transactions in flight"
                    );
                }
                return abandoned.is_empty();
            }
            ShutdownMode::Rollback => {
                for tx in &snapshot {
                    if matches!(
                        tx.status(),
                        TransactionStatus::Active
                            | TransactionStatus::MarkedRollback
                            | TransactionStatus::Prepared
                    ) {
                        if let Err(err) = self.rollback_transaction(tx) {
                            tracing::warn!(
                                manager = %self.name,
                                tx = %tx.id(),
                                error = %err,
                                "rollback during shutdown failed"
                            );
                        }
                    }
                }
            }
            ShutdownMode::Normal => {}
        }

        for tx in &snapshot {
            if !tx.wait_finished_by(deadline) {
                tracing::warn!(
                    manager = %self.name,
                    in_flight = self.in_flight_count(),
                    "timed out waiting for in-flight transactions"
                );
                return false;
            }
        }

        let in_flight = self.in_flight.lock();
        // A commit may have poisoned the manager while we waited.
        if !in_flight.is_empty() || self.state() != ManagerState::Stopping {
            return false;
        }
        self.set_state(ManagerState::Stopped);
        drop(in_flight);
        tracing::info!(manager = %self.name, "resource manager stopped");
        true
    }

    /// [`stop`](Self::stop) with the configured shutdown timeout.
    pub fn stop_default(&self, mode: ShutdownMode) -> bool {
        self.stop(mode, self.config.shutdown_timeout())
    }

    /// Clears the dirty state by re-running resource recovery.
    ///
    /// Transactions still in flight are abandoned: marked `Unknown` and
    /// released. Returns how many were abandoned.
    ///
    /// # Errors
    ///
    /// - `InvalidManagerState` when the manager is not dirty.
    /// - The recovery failure, in which case the manager stays dirty.
    pub fn recover(&self) -> Result<usize, ResourceManagerError> {
        {
            let _guard = self.in_flight.lock();
            let state = self.state();
            if state != ManagerState::Dirty {
                return Err(ResourceManagerError::InvalidManagerState {
                    manager: self.name.clone(),
                    state,
                    expected: "Dirty",
                });
            }
            self.set_state(ManagerState::Recovering);
        }
        tracing::info!(manager = %self.name, "recovering resource manager");

        if let Err(err) = self.invoke("recover", |r| r.recover()) {
            let (ResourceError::Recoverable(cause) | ResourceError::System(cause)) = err;
            self.mark_dirty("recover", &cause);
            return Err(ResourceManagerError::System(cause));
        }

        let abandoned: Vec<_> = {
            let mut in_flight = self.in_flight.lock();
            let abandoned = in_flight.drain().map(|(_, tx)| tx).collect();
            self.set_state(ManagerState::Started);
            abandoned
        };
        for tx in &abandoned {
            let _ = tx.transition(TransactionStatus::Unknown);
            tx.notify_finish();
        }
        tracing::info!(
            manager = %self.name,
            abandoned = abandoned.len(),
            "resource manager recovered"
        );
        Ok(abandoned.len())
    }
}

impl<R> std::fmt::Debug for ResourceManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("name", &self.name)
            .field("state", &**self.state.load())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Fail {
        Recoverable,
        System,
        Panic,
    }

    /// Records hook calls and fails or stalls on demand.
    #[derive(Default)]
    pub(crate) struct TestResource {
        pub calls: Mutex<Vec<&'static str>>,
        pub fail_recover: Mutex<Option<Fail>>,
        pub fail_commit: Mutex<Option<Fail>>,
        pub fail_rollback: Mutex<Option<Fail>>,
        pub read_only: Mutex<bool>,
        pub commit_delay: Mutex<Option<Duration>>,
        pub commit_entered: Mutex<Option<mpsc::Sender<()>>>,
        pub recover_entered: Mutex<Option<mpsc::Sender<()>>>,
        pub recover_release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    fn outcome(hook: &'static str, fail: Option<Fail>) -> Result<(), ResourceError> {
        match fail {
            None => Ok(()),
            Some(Fail::Recoverable) => {
                Err(ResourceError::recoverable(anyhow::anyhow!("{hook} refused")))
            }
            Some(Fail::System) => Err(ResourceError::system(anyhow::anyhow!("{hook} corrupted"))),
            Some(Fail::Panic) => panic!("{hook} exploded"),
        }
    }

    impl TransactionalResource for TestResource {
        fn recover(&self) -> Result<(), ResourceError> {
            self.calls.lock().push("recover");
            if let Some(entered) = self.recover_entered.lock().take() {
                let _ = entered.send(());
            }
            let release = self.recover_release.lock().take();
            if let Some(release) = release {
                let _ = release.recv();
            }
            outcome("recover", *self.fail_recover.lock())
        }

        fn begin(&self, _tx: &TransactionContext) -> Result<(), ResourceError> {
            self.calls.lock().push("begin");
            Ok(())
        }

        fn prepare(&self, _tx: &TransactionContext) -> Result<PrepareVote, ResourceError> {
            self.calls.lock().push("prepare");
            Ok(if *self.read_only.lock() {
                PrepareVote::ReadOnly
            } else {
                PrepareVote::Commit
            })
        }

        fn commit(&self, _tx: &TransactionContext) -> Result<(), ResourceError> {
            self.calls.lock().push("commit");
            if let Some(entered) = self.commit_entered.lock().take() {
                let _ = entered.send(());
            }
            let delay = *self.commit_delay.lock();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            outcome("commit", *self.fail_commit.lock())
        }

        fn rollback(&self, _tx: &TransactionContext) -> Result<(), ResourceError> {
            self.calls.lock().push("rollback");
            outcome("rollback", *self.fail_rollback.lock())
        }
    }

    pub(crate) fn started(resource: TestResource) -> Arc<ResourceManager<TestResource>> {
        let manager = Arc::new(ResourceManager::new(
            "test",
            resource,
            TransactionConfig::default(),
        ));
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        manager
    }

    #[test]
    fn begin_requires_started_manager() {
        let manager =
            ResourceManager::new("test", TestResource::default(), TransactionConfig::default());
        let err = manager.new_transaction().unwrap_err();
        assert!(matches!(
            err,
            ResourceManagerError::InvalidManagerState {
                state: ManagerState::Stopped,
                ..
            }
        ));
    }

    #[test]
    fn commit_runs_both_phases() {
        let manager = started(TestResource::default());
        let tx = manager.new_transaction().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Active);
        assert_eq!(manager.in_flight_count(), 1);

        let status = manager.commit_transaction(&tx).unwrap();

        assert_eq!(status, TransactionStatus::Committed);
        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert!(tx.is_finished());
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(
            *manager.resource().calls.lock(),
            vec!["recover", "begin", "prepare", "commit"]
        );
    }

    #[test]
    fn explicit_prepare_then_commit() {
        let manager = started(TestResource::default());
        let tx = manager.new_transaction().unwrap();
        assert_eq!(manager.prepare_transaction(&tx).unwrap(), PrepareVote::Commit);
        assert_eq!(tx.status(), TransactionStatus::Prepared);
        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::Committed
        );
        let calls = manager.resource().calls.lock().clone();
        assert_eq!(calls.iter().filter(|c| **c == "prepare").count(), 1);
    }

    #[test]
    fn read_only_vote_skips_commit_hook() {
        let resource = TestResource::default();
        *resource.read_only.lock() = true;
        let manager = started(resource);
        let tx = manager.new_transaction().unwrap();

        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::Committed
        );
        assert!(!manager.resource().calls.lock().contains(&"commit"));
    }

    #[test]
    fn marked_rollback_fails_fast_and_stays_in_flight() {
        let manager = started(TestResource::default());
        let tx = manager.new_transaction().unwrap();
        manager.set_rollback_only(&tx).unwrap();

        let err = manager.commit_transaction(&tx).unwrap_err();
        assert!(matches!(err, ResourceManagerError::RollbackRequired { .. }));
        assert_eq!(manager.in_flight_count(), 1);
        assert!(!tx.is_finished());

        assert_eq!(
            manager.rollback_transaction(&tx).unwrap(),
            TransactionStatus::RolledBack
        );
        assert_eq!(manager.in_flight_count(), 0);
        assert!(tx.is_finished());
    }

    #[test]
    fn expired_transaction_must_roll_back() {
        let manager = started(TestResource::default());
        let tx = manager
            .new_transaction_with_timeout(Duration::from_millis(5))
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let err = manager.commit_transaction(&tx).unwrap_err();
        assert!(matches!(err, ResourceManagerError::RollbackRequired { .. }));
        assert_eq!(tx.status(), TransactionStatus::MarkedRollback);
    }

    #[test]
    fn recoverable_commit_failure_rolls_back() {
        let resource = TestResource::default();
        *resource.fail_commit.lock() = Some(Fail::Recoverable);
        let manager = started(resource);
        let tx = manager.new_transaction().unwrap();

        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::RolledBack
        );
        assert_eq!(manager.state(), ManagerState::Started);
        assert!(manager.resource().calls.lock().contains(&"rollback"));
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[test]
    fn failed_fallback_rollback_leaves_unknown_status() {
        let resource = TestResource::default();
        *resource.fail_commit.lock() = Some(Fail::Recoverable);
        *resource.fail_rollback.lock() = Some(Fail::Recoverable);
        let manager = started(resource);
        let tx = manager.new_transaction().unwrap();

        let err = manager.commit_transaction(&tx).unwrap_err();
        assert!(matches!(err, ResourceManagerError::Resource(_)));
        assert_eq!(tx.status(), TransactionStatus::Unknown);
        assert_eq!(manager.state(), ManagerState::Started);
    }

    #[test]
    fn unrecoverable_commit_failure_makes_manager_dirty() {
        let resource = TestResource::default();
        *resource.fail_commit.lock() = Some(Fail::System);
        let manager = started(resource);
        let tx = manager.new_transaction().unwrap();

        let err = manager.commit_transaction(&tx).unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(manager.is_dirty());
        assert!(tx.is_finished());

        let err = manager.new_transaction().unwrap_err();
        assert!(matches!(err, ResourceManagerError::ManagerDirty { .. }));
    }

    #[test]
    fn panicking_commit_hook_makes_manager_dirty() {
        let resource = TestResource::default();
        *resource.fail_commit.lock() = Some(Fail::Panic);
        let manager = started(resource);
        let tx = manager.new_transaction().unwrap();

        let err = manager.commit_transaction(&tx).unwrap_err();
        let ResourceManagerError::System(cause) = &err else {
            panic!("expected a system error, got {err}");
        };
        assert!(cause.to_string().contains("commit hook panicked"));
        assert!(manager.is_dirty());
    }

    #[test]
    fn failed_recovery_on_start_leaves_manager_dirty() {
        let resource = TestResource::default();
        *resource.fail_recover.lock() = Some(Fail::Recoverable);
        let manager = ResourceManager::new("test", resource, TransactionConfig::default());

        manager.start().unwrap();
        assert!(manager.is_dirty());
        assert!(matches!(
            manager.new_transaction().unwrap_err(),
            ResourceManagerError::ManagerDirty { .. }
        ));
    }

    #[test]
    fn recover_clears_dirty_state_and_abandons_in_flight() {
        let resource = TestResource::default();
        *resource.fail_commit.lock() = Some(Fail::System);
        let manager = started(resource);
        let pending = manager.new_transaction().unwrap();
        let failing = manager.new_transaction().unwrap();
        let _ = manager.commit_transaction(&failing);
        assert!(manager.is_dirty());

        *manager.resource().fail_commit.lock() = None;
        assert_eq!(manager.recover().unwrap(), 1);
        assert_eq!(manager.state(), ManagerState::Started);
        assert_eq!(pending.status(), TransactionStatus::Unknown);
        assert!(pending.is_finished());

        let tx = manager.new_transaction().unwrap();
        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::Committed
        );
    }

    #[test]
    fn recover_requires_dirty_manager() {
        let manager = started(TestResource::default());
        assert!(matches!(
            manager.recover().unwrap_err(),
            ResourceManagerError::InvalidManagerState { .. }
        ));
    }

    /// Starts a commit on another thread and returns once the commit hook runs.
    fn commit_in_background(
        manager: &Arc<ResourceManager<TestResource>>,
        delay: Duration,
    ) -> thread::JoinHandle<Result<TransactionStatus, ResourceManagerError>> {
        let (entered_tx, entered_rx) = mpsc::channel();
        *manager.resource().commit_delay.lock() = Some(delay);
        *manager.resource().commit_entered.lock() = Some(entered_tx);
        let tx = manager.new_transaction().unwrap();
        let handle = {
            let manager = Arc::clone(manager);
            thread::spawn(move || manager.commit_transaction(&tx))
        };
        entered_rx.recv().unwrap();
        handle
    }

    #[test]
    fn stop_waits_for_commit_in_progress() {
        let manager = started(TestResource::default());
        let commit = commit_in_background(&manager, Duration::from_millis(200));

        let start = Instant::now();
        assert!(manager.stop(ShutdownMode::Normal, Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(commit.join().unwrap().unwrap(), TransactionStatus::Committed);
    }

    #[test]
    fn stop_times_out_while_commit_in_progress() {
        let manager = started(TestResource::default());
        let commit = commit_in_background(&manager, Duration::from_millis(400));

        let start = Instant::now();
        assert!(!manager.stop(ShutdownMode::Normal, Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_millis(350));
        assert_eq!(manager.state(), ManagerState::Stopping);

        assert!(commit.join().unwrap().is_ok());
        assert!(manager.stop(ShutdownMode::Normal, Duration::from_millis(50)));
    }

    #[test]
    fn stop_with_unbounded_timeout_waits_for_drain() {
        let manager = started(TestResource::default());
        let commit = commit_in_background(&manager, Duration::from_millis(50));

        assert!(manager.stop(ShutdownMode::Normal, Duration::MAX));
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(commit.join().unwrap().unwrap(), TransactionStatus::Committed);
    }

    #[test]
    fn stop_is_refused_while_recovering() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let resource = TestResource::default();
        *resource.recover_entered.lock() = Some(entered_tx);
        *resource.recover_release.lock() = Some(release_rx);
        let manager = Arc::new(ResourceManager::new(
            "test",
            resource,
            TransactionConfig::default(),
        ));

        let starter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.start())
        };
        entered_rx.recv().unwrap();
        assert_eq!(manager.state(), ManagerState::Recovering);

        assert!(!manager.stop(ShutdownMode::Normal, Duration::from_secs(1)));
        assert_eq!(manager.state(), ManagerState::Recovering);

        release_tx.send(()).unwrap();
        starter.join().unwrap().unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        assert!(manager.stop(ShutdownMode::Normal, Duration::from_secs(1)));
    }

    #[test]
    fn timeout_counts_from_begin() {
        let manager = started(TestResource::default());
        let tx = Arc::new(TransactionContext::new(Duration::from_millis(30)));
        thread::sleep(Duration::from_millis(50));

        manager.begin_transaction(&tx).unwrap();
        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::Committed
        );
    }

    #[test]
    fn stopping_manager_refuses_new_transactions() {
        let manager = started(TestResource::default());
        let tx = manager.new_transaction().unwrap();
        assert!(!manager.stop(ShutdownMode::Normal, Duration::from_millis(10)));

        assert!(matches!(
            manager.new_transaction().unwrap_err(),
            ResourceManagerError::InvalidManagerState {
                state: ManagerState::Stopping,
                ..
            }
        ));
        // In-flight work can still finish while stopping.
        assert_eq!(
            manager.commit_transaction(&tx).unwrap(),
            TransactionStatus::Committed
        );
    }

    #[test]
    fn rollback_mode_rolls_back_idle_transactions() {
        let manager = started(TestResource::default());
        let a = manager.new_transaction().unwrap();
        let b = manager.new_transaction().unwrap();

        assert!(manager.stop(ShutdownMode::Rollback, Duration::from_secs(1)));
        assert_eq!(a.status(), TransactionStatus::RolledBack);
        assert_eq!(b.status(), TransactionStatus::RolledBack);
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn kill_mode_abandons_transactions() {
        let manager = started(TestResource::default());
        let tx = manager.new_transaction().unwrap();

        assert!(!manager.stop(ShutdownMode::Kill, Duration::from_secs(1)));
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(tx.status(), TransactionStatus::Unknown);
        assert!(tx.is_finished());
    }

    #[test]
    fn dirty_manager_cannot_stop() {
        let resource = TestResource::default();
        *resource.fail_recover.lock() = Some(Fail::System);
        let manager = ResourceManager::new("test", resource, TransactionConfig::default());
        manager.start().unwrap();
        assert!(!manager.stop_default(ShutdownMode::Normal));
    }
}
