//! Cancellation scope binding in-flight remote calls to a session's lifetime.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Fires the scope. Cheap to clone; any clone can cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new scope observing this handle.
    pub fn scope(&self) -> CancelScope {
        CancelScope {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelScope {
    rx: watch::Receiver<bool>,
}

impl CancelScope {
    /// A scope that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope has been cancelled. Pends forever if every
    /// handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless the scope fires first. `None` means cancelled.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut scope = self.clone();
        tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

/// Create a linked handle/scope pair.
pub fn cancel_scope() -> (CancelHandle, CancelScope) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelScope { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiting_scope() {
        let (handle, mut scope) = cancel_scope();
        let waiter = tokio::spawn(async move {
            scope.cancelled().await;
            true
        });
        handle.cancel();
        assert!(waiter.await.expect("join"));
        assert!(handle.is_cancelled());
        assert!(handle.scope().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_scope_does_not_fire() {
        let mut scope = CancelScope::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), scope.cancelled()).await;
        assert!(fired.is_err());
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn guard_drops_work_once_cancelled() {
        let (handle, scope) = cancel_scope();
        assert_eq!(scope.guard(async { 7 }).await, Some(7));

        handle.cancel();
        let stalled = scope.guard(std::future::pending::<()>());
        let finished = tokio::time::timeout(Duration::from_secs(5), stalled).await;
        assert_eq!(finished.expect("guard should return after cancel"), None);
    }
}
