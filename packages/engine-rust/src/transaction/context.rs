//! Per-transaction state shared between a resource manager and its callers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use super::error::ResourceManagerError;

/// Lifecycle of a transaction.
///
/// `NoTransaction -> Active -> [MarkedRollback] -> Preparing -> Prepared ->
/// Committing -> Committed`, with `RollingBack -> RolledBack` reachable from
/// every unfinished state and `Unknown` left behind when the outcome could not
/// be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    NoTransaction,
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
}

impl TransactionStatus {
    /// Committed and rolled-back transactions never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransactionStatus::{
            Active, Committed, Committing, MarkedRollback, NoTransaction, Prepared, Preparing,
            RolledBack, RollingBack, Unknown,
        };
        match (self, next) {
            (NoTransaction, Active)
            | (Active, MarkedRollback | Preparing | RollingBack)
            | (MarkedRollback, RollingBack)
            | (Preparing, Prepared | RollingBack)
            | (Prepared, Committing | RollingBack)
            | (Committing, Committed | RollingBack)
            | (RollingBack, RolledBack) => true,
            (from, Unknown) => !from.is_terminal() && from != Unknown,
            _ => false,
        }
    }
}

/// Outcome of the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The resource is ready to commit.
    Commit,
    /// The resource made no changes; there is nothing to commit.
    ReadOnly,
}

#[derive(Debug)]
struct State {
    status: TransactionStatus,
    started_at: Instant,
    vote: Option<PrepareVote>,
    finished: bool,
}

/// A transaction tracked by a resource manager.
///
/// `finished` flips exactly once, via [`notify_finish`](Self::notify_finish),
/// and wakes every thread blocked in [`wait_finished`](Self::wait_finished).
#[derive(Debug)]
pub struct TransactionContext {
    id: Uuid,
    timeout: Duration,
    state: Mutex<State>,
    finished: Condvar,
}

impl TransactionContext {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            timeout,
            state: Mutex::new(State {
                status: TransactionStatus::NoTransaction,
                started_at: Instant::now(),
                vote: None,
                finished: false,
            }),
            finished: Condvar::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the transaction became `Active`, or when it was created if it
    /// has not begun yet.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.state.lock().started_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.started_at().elapsed() > self.timeout
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Vote recorded by the prepare phase, if it ran.
    #[must_use]
    pub fn vote(&self) -> Option<PrepareVote> {
        self.state.lock().vote
    }

    pub(crate) fn record_vote(&self, vote: PrepareVote) {
        self.state.lock().vote = Some(vote);
    }

    /// Moves to `next`, returning the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceManagerError::InvalidTransactionState`] when the
    /// transition is not allowed from the current status.
    pub fn transition(
        &self,
        next: TransactionStatus,
    ) -> Result<TransactionStatus, ResourceManagerError> {
        let mut state = self.state.lock();
        let from = state.status;
        if !from.can_transition_to(next) {
            return Err(ResourceManagerError::InvalidTransactionState {
                id: self.id,
                from,
                to: next,
            });
        }
        state.status = next;
        if next == TransactionStatus::Active {
            state.started_at = Instant::now();
        }
        Ok(from)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Marks the transaction finished and wakes all waiters. Returns `false`
    /// if it was already finished.
    pub fn notify_finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.finished = true;
        drop(state);
        self.finished.notify_all();
        true
    }

    /// Blocks until the transaction is finished or `deadline` passes.
    /// Returns whether it finished.
    pub fn wait_finished_until(&self, deadline: Instant) -> bool {
        self.wait_finished_by(Some(deadline))
    }

    /// Blocks for at most `timeout`. A timeout too large to express as an
    /// instant waits without a deadline.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.wait_finished_by(Instant::now().checked_add(timeout))
    }

    /// `None` waits until finished, however long that takes.
    pub(crate) fn wait_finished_by(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while !state.finished {
            match deadline {
                Some(deadline) => {
                    if self.finished.wait_until(&mut state, deadline).timed_out() {
                        return state.finished;
                    }
                }
                None => self.finished.wait(&mut state),
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use super::TransactionStatus::*;

    #[test]
    fn commit_path_is_valid() {
        let tx = TransactionContext::new(Duration::from_secs(1));
        for next in [Active, Preparing, Prepared, Committing, Committed] {
            tx.transition(next).unwrap();
        }
        assert_eq!(tx.status(), Committed);
        assert!(tx.transition(RollingBack).is_err());
    }

    #[test]
    fn marked_rollback_only_rolls_back() {
        assert!(MarkedRollback.can_transition_to(RollingBack));
        assert!(!MarkedRollback.can_transition_to(Preparing));
        assert!(!MarkedRollback.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Unknown));
        assert!(!Committed.can_transition_to(Unknown));
        assert!(!NoTransaction.can_transition_to(Committing));
    }

    #[test]
    fn invalid_transition_reports_both_states() {
        let tx = TransactionContext::new(Duration::from_secs(1));
        let err = tx.transition(Prepared).unwrap_err();
        assert!(matches!(
            err,
            ResourceManagerError::InvalidTransactionState {
                from: NoTransaction,
                to: Prepared,
                ..
            }
        ));
    }

    #[test]
    fn expiry_follows_timeout() {
        let tx = TransactionContext::new(Duration::from_millis(10));
        assert!(!tx.is_expired());
        thread::sleep(Duration::from_millis(20));
        assert!(tx.is_expired());
    }

    #[test]
    fn notify_finish_wakes_waiters_once() {
        let tx = Arc::new(TransactionContext::new(Duration::from_secs(1)));
        let waiter = {
            let tx = Arc::clone(&tx);
            thread::spawn(move || tx.wait_finished(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(tx.notify_finish());
        assert!(!tx.notify_finish());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn expiry_counts_from_activation() {
        let tx = TransactionContext::new(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        tx.transition(Active).unwrap();
        assert!(!tx.is_expired());
    }

    #[test]
    fn unbounded_wait_returns_once_finished() {
        let tx = Arc::new(TransactionContext::new(Duration::from_secs(1)));
        let finisher = {
            let tx = Arc::clone(&tx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tx.notify_finish();
            })
        };
        assert!(tx.wait_finished(Duration::MAX));
        finisher.join().unwrap();
    }

    #[test]
    fn wait_times_out_when_not_finished() {
        let tx = TransactionContext::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(!tx.wait_finished(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
