//! Reconciliation error types.

use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;
use crate::ledger::Kind;
use crate::validation::ValidationError;

/// Errors that can occur during a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Logical name has neither a ledger entry nor a cloud object.
    #[error("{kind} {name} not found")]
    NotFound { kind: Kind, name: String },

    /// Spec format, cross-reference or duplicate-name failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An upstream resource has not converged yet.
    #[error("{kind} {name} is not resolved yet")]
    DependencyUnresolved { kind: Kind, name: String },

    /// A same-named resource belongs to a different cluster.
    #[error("{kind} {name} is owned by {owner}, expected {expected}")]
    ConflictOwnership {
        kind: Kind,
        name: String,
        owner: String,
        expected: String,
    },

    /// Cloud API call failed.
    #[error("cannot {action} for {namespace}/{name}: {source}")]
    Provider {
        namespace: String,
        name: String,
        action: String,
        #[source]
        source: CloudError,
    },

    /// A bounded state-transition poll ran out of time.
    #[error("timeout after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    /// The caller's deadline for the whole pass expired.
    #[error("reconciliation pass exceeded its deadline of {}s", .0.as_secs())]
    DeadlineExceeded(Duration),
}

impl ReconcileError {
    /// Whether the host orchestrator should re-invoke the pass later.
    ///
    /// Validation failures and ownership conflicts need operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Validation(_) | ReconcileError::ConflictOwnership { .. }
        )
    }

    pub(crate) fn unresolved(kind: Kind, name: impl Into<String>) -> Self {
        ReconcileError::DependencyUnresolved {
            kind,
            name: name.into(),
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;
