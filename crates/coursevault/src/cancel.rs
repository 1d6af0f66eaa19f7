//! Cooperative cancellation for a run.
//!
//! The binary holds the [`CancelHandle`] and trips it on Ctrl-C; every page
//! load, fetch and render awaits through [`CancelToken::run`].

use std::future::Future;

use tokio::sync::watch;

/// Trips cancellation for every token cloned from the same pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for tokens made by `never()`.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    let tx = std::sync::Arc::new(tx);
    (
        CancelHandle { tx: tx.clone() },
        CancelToken {
            rx,
            _keepalive: Some(tx),
        },
    )
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An error means every sender is gone; nothing can cancel us any more.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Drive `fut` to completion unless cancellation arrives first.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_completes() {
        let token = CancelToken::never();
        assert_eq!(token.run(async { 7 }).await, Some(7));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_work() {
        let (handle, token) = cancel_pair();
        let worker = token.clone();
        let task = tokio::spawn(async move {
            worker
                .run(tokio::time::sleep(Duration::from_secs(30)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert_eq!(task.await.unwrap(), None);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        assert_eq!(token.run(async { 1 }).await, None);
    }
}
