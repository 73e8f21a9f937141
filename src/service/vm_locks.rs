//! Per-VM mutual exclusion tokens.
//!
//! Every lifecycle or snapshot operation, and every event the monitor
//! applies, holds the target VM's token for its whole duration. Tokens of
//! different VMs are independent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::operation::SubmitMode;
use crate::domain::VmId;
use crate::error::OrchestratorError;

/// Held exclusion token; released on drop.
#[derive(Debug)]
pub struct VmGuard {
    vm_id: VmId,
    _token: OwnedMutexGuard<()>,
}

impl VmGuard {
    /// VM this token guards.
    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }
}

/// Table of per-VM tokens.
#[derive(Debug)]
pub struct VmLocks {
    tokens: Mutex<HashMap<VmId, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl VmLocks {
    /// Creates a table where blocking callers give up after `wait_timeout`.
    #[must_use]
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    async fn token(&self, vm_id: &VmId) -> Arc<Mutex<()>> {
        let mut tokens = self.tokens.lock().await;
        Arc::clone(tokens.entry(vm_id.clone()).or_default())
    }

    /// Acquires the VM's token.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Conflict`] if the token is held and
    /// `mode` is [`SubmitMode::FailFast`], or if it stays held past the wait
    /// timeout in [`SubmitMode::Wait`].
    pub async fn acquire(&self, vm_id: &VmId, mode: SubmitMode) -> Result<VmGuard, OrchestratorError> {
        let token = self.token(vm_id).await;
        let conflict = || OrchestratorError::Conflict {
            vm_id: vm_id.clone(),
            last_known: None,
        };
        let guard = match mode {
            SubmitMode::FailFast => token.try_lock_owned().map_err(|_| conflict())?,
            SubmitMode::Wait => tokio::time::timeout(self.wait_timeout, token.lock_owned())
                .await
                .map_err(|_| conflict())?,
        };
        Ok(VmGuard {
            vm_id: vm_id.clone(),
            _token: guard,
        })
    }

    /// Acquires the VM's token, waiting as long as it takes.
    pub async fn acquire_blocking(&self, vm_id: &VmId) -> VmGuard {
        let token = self.token(vm_id).await;
        VmGuard {
            vm_id: vm_id.clone(),
            _token: token.lock_owned().await,
        }
    }

    /// Drops the token of a purged VM if nobody holds it.
    pub async fn forget(&self, vm_id: &VmId) {
        let mut tokens = self.tokens.lock().await;
        if tokens
            .get(vm_id)
            .is_some_and(|token| Arc::strong_count(token) == 1)
        {
            tokens.remove(vm_id);
        }
    }

    /// Returns the number of tracked tokens.
    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    /// Returns `true` if no tokens are tracked.
    pub async fn is_empty(&self) -> bool {
        self.tokens.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fail_fast_conflicts_while_held() {
        let locks = VmLocks::new(Duration::from_secs(1));
        let vm = VmId::from("vm-1");
        let held = locks.acquire(&vm, SubmitMode::FailFast).await;
        assert!(held.is_ok());
        let second = locks.acquire(&vm, SubmitMode::FailFast).await;
        assert!(matches!(second, Err(OrchestratorError::Conflict { .. })));
        drop(held);
        assert!(locks.acquire(&vm, SubmitMode::FailFast).await.is_ok());
    }

    #[tokio::test]
    async fn different_vms_do_not_contend() {
        let locks = VmLocks::new(Duration::from_secs(1));
        let a = locks.acquire(&VmId::from("vm-1"), SubmitMode::FailFast).await;
        let b = locks.acquire(&VmId::from("vm-2"), SubmitMode::FailFast).await;
        assert!(a.is_ok() && b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_give_up_after_timeout() {
        let locks = VmLocks::new(Duration::from_secs(5));
        let vm = VmId::from("vm-1");
        let _held = locks.acquire_blocking(&vm).await;
        let waited = locks.acquire(&vm, SubmitMode::Wait).await;
        assert!(matches!(waited, Err(OrchestratorError::Conflict { .. })));
    }

    #[tokio::test]
    async fn forget_keeps_held_tokens() {
        let locks = VmLocks::new(Duration::from_secs(1));
        let vm = VmId::from("vm-1");
        let held = locks.acquire_blocking(&vm).await;
        locks.forget(&vm).await;
        assert_eq!(locks.len().await, 1);
        drop(held);
        locks.forget(&vm).await;
        assert!(locks.is_empty().await);
    }
}
