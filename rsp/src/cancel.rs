//! Re-armable cancellation scope for blocking reads.
//!
//! A [`Canceller`] lives outside the task that owns the connection. It flips
//! a watch channel that every blocking read in the session races against,
//! waits a bounded time for the read to unwind, and then re-arms the scope
//! so the next read starts clean.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    /// `true` while a cancellation is in effect.
    tx: Arc<watch::Sender<bool>>,
}

impl Scope {
    /// Creates an armed (not cancelled) scope.
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation of the pending read, if any.
    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clears a previous cancellation.
    pub(crate) fn rearm(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once the scope is cancelled.
    pub(crate) fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let closed = rx.wait_for(|&cancelled| cancelled).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Handle for cancelling a pending reply wait from another task.
#[derive(Debug, Clone)]
pub struct Canceller {
    /// Scope shared with the session.
    scope: Scope,
    /// Upper bound on how long the pending read may take to unwind.
    grace: Duration,
}

impl Canceller {
    /// Creates a handle for `scope`.
    pub(crate) const fn new(scope: Scope, grace: Duration) -> Self {
        Self { scope, grace }
    }

    /// Cancels the read driven by `pending` and waits for it to unwind.
    ///
    /// Returns `Ok(None)` when the read was cancelled, which is the expected
    /// outcome. If `pending` had already completed its result is handed back
    /// as `Ok(Some(_))` and nothing else changes. Any other error from
    /// `pending` is returned as is. The scope is re-armed in every case, so
    /// the connection is immediately reusable.
    pub async fn cancel_read<F, T>(&self, pending: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        self.scope.cancel();
        let outcome = tokio::time::timeout(self.grace, pending).await;
        self.scope.rearm();

        match outcome {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(Error::Cancelled)) => {
                debug!("pending read cancelled");
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(grace = ?self.grace, "pending read did not unwind in time; dropped");
                Ok(None)
            }
        }
    }
}
