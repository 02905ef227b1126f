//! Two-phase operations with a compensating action.
//!
//! Phase 1 produces a [`Staged`] handle together with the action that undoes
//! it. Committing runs phase 2; if phase 2 fails the compensation runs before
//! the phase 2 error is returned. Compensation errors are logged, never
//! returned, so the root cause is what the caller sees.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::error::Result;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Result of phase 1, holding the action that undoes it.
pub struct Staged<T> {
    value: T,
    label: String,
    compensate: Compensation,
}

impl<T> Staged<T> {
    pub fn new<F, Fut>(value: T, label: impl Into<String>, compensate: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            value,
            label: label.into(),
            compensate: Box::new(move || compensate().boxed()),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Run phase 2. On failure, run the compensation and return the phase 2
    /// error.
    pub async fn commit<U>(self, phase2: impl Future<Output = Result<U>>) -> Result<(T, U)> {
        match phase2.await {
            Ok(out) => Ok((self.value, out)),
            Err(err) => {
                info!(action = %self.label, error = %err, "Second phase failed, compensating");
                if let Err(comp_err) = (self.compensate)().await {
                    warn!(
                        action = %self.label,
                        error = %comp_err,
                        "Compensating action failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Undo phase 1 without attempting phase 2.
    pub async fn abort(self) -> Result<()> {
        (self.compensate)().await
    }
}
