use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::BatchError;

/// Transaction-scoping collaborator wrapped around every chunk.
///
/// The engine acquires a scope per chunk and always releases it (commit or
/// rollback) before the next chunk begins or control returns to the flow.
/// Real resource managers (a database connection, a message session) plug in
/// behind this trait; the engine itself only drives the protocol.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<(), BatchError>;
    fn commit(&self) -> Result<(), BatchError>;
    fn rollback(&self) -> Result<(), BatchError>;
}

/// Transaction manager with no backing resource.
///
/// Enforces the scoping protocol (one open scope at a time, no commit or
/// rollback without a begin) and counts outcomes, which is all the default
/// in-memory setup needs.
#[derive(Default)]
pub struct ResourcelessTransactionManager {
    active: AtomicBool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<(), BatchError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(BatchError::Transaction(
                "a transaction scope is already open".to_string(),
            ));
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), BatchError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(BatchError::Transaction(
                "commit without an open transaction scope".to_string(),
            ));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), BatchError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(BatchError::Transaction(
                "rollback without an open transaction scope".to_string(),
            ));
        }
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
