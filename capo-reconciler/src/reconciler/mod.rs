//! Reconcilers for the different cloud resource kinds.
//!
//! Each reconciler compares the declared spec with what the ledger and the
//! cloud report, and takes the actions needed to converge. `reconcile` walks
//! the create path, `finalize` the delete path. Both are safe to re-enter
//! after a failure anywhere in the chain.

pub mod bastion;
pub mod internet_service;
pub mod keypair;
pub mod load_balancer;
pub mod nat_service;
pub mod net;
pub mod public_ip;
pub mod route_table;
pub mod security_group;
pub mod subnet;
pub mod vm;
pub mod volume;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cloud::{CloudError, CloudResult};
use crate::error::{ReconcileError, Result};
use crate::ledger::{Ledger, logical_name};
use crate::spec::{EffectiveClusterSpec, EffectiveMachineSpec};

/// Result of one create-path step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Everything this step owns exists and is recorded.
    Ready,
    /// Deliberately not attempted this pass; a later pass will.
    Skipped { reason: String },
    /// Progress was made but the object is not settled; revisit later.
    Requeue(Duration),
}

impl Outcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready)
    }

    /// Fold two step outcomes: anything short of `Ready` wins.
    pub fn and(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Ready, o) | (o, Outcome::Ready) => o,
            (Outcome::Requeue(a), Outcome::Requeue(b)) => Outcome::Requeue(a.min(b)),
            (Outcome::Requeue(d), _) | (_, Outcome::Requeue(d)) => Outcome::Requeue(d),
            (skipped, _) => skipped,
        }
    }
}

/// Result of one delete-path step, consumed by the host layer to decide
/// whether the deletion marker can be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    ConvergedAbsent,
    StillPresent { requeue_after: Duration },
}

impl DeleteOutcome {
    pub fn is_absent(&self) -> bool {
        matches!(self, DeleteOutcome::ConvergedAbsent)
    }

    pub fn and(self, other: DeleteOutcome) -> DeleteOutcome {
        match (self, other) {
            (DeleteOutcome::ConvergedAbsent, o) | (o, DeleteOutcome::ConvergedAbsent) => o,
            (
                DeleteOutcome::StillPresent { requeue_after: a },
                DeleteOutcome::StillPresent { requeue_after: b },
            ) => DeleteOutcome::StillPresent {
                requeue_after: a.min(b),
            },
        }
    }
}

/// The host object (cluster or machine) a pass runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Logical name of a resource owned by this object.
    pub fn logical_name(&self, name: &str) -> String {
        logical_name(name, &self.uid)
    }

    /// Wrap a cloud error with this object's namespace and name.
    pub fn wrap(&self, action: &str) -> impl FnOnce(CloudError) -> ReconcileError + use<> {
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        let action = action.to_string();
        move |source| ReconcileError::Provider {
            namespace,
            name,
            action,
            source,
        }
    }
}

/// Everything one cluster pass works on.
#[derive(Debug, Clone)]
pub struct ClusterScope {
    pub object: ObjectRef,
    pub spec: EffectiveClusterSpec,
    pub ledger: Ledger,
}

impl ClusterScope {
    pub fn new(object: ObjectRef, spec: EffectiveClusterSpec, ledger: Ledger) -> Self {
        Self {
            object,
            spec,
            ledger,
        }
    }
}

/// Everything one machine pass works on, plus a view of its cluster.
#[derive(Debug, Clone)]
pub struct MachineScope {
    pub object: ObjectRef,
    pub spec: EffectiveMachineSpec,
    pub ledger: Ledger,
    pub cluster: ClusterScope,
}

impl MachineScope {
    pub fn new(
        object: ObjectRef,
        spec: EffectiveMachineSpec,
        ledger: Ledger,
        cluster: ClusterScope,
    ) -> Self {
        Self {
            object,
            spec,
            ledger,
            cluster,
        }
    }
}

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The scope (cluster or machine) the reconciler works in.
    type Scope: Send;

    /// Converge the declared resources of this kind.
    async fn reconcile(&self, scope: &mut Self::Scope) -> Result<Outcome>;

    /// Remove the resources of this kind owned by the scope.
    async fn finalize(&self, scope: &mut Self::Scope) -> Result<DeleteOutcome>;
}

/// Treat an "already exists" rejection as success.
pub(crate) fn tolerate_exists<T>(result: CloudResult<T>) -> CloudResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(CloudError::AlreadyExists(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Treat a "not found" rejection of a delete or unlink as success.
pub(crate) fn tolerate_missing(result: CloudResult<()>) -> CloudResult<()> {
    match result {
        Err(CloudError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// `Ok(true)` once the object is gone, `Ok(false)` while something still
/// references it.
pub(crate) fn deleted(result: CloudResult<()>) -> CloudResult<bool> {
    match result {
        Ok(()) | Err(CloudError::NotFound(_)) => Ok(true),
        Err(CloudError::DependencyViolation(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_folding() {
        let requeue = Outcome::Requeue(Duration::from_secs(30));
        let skipped = Outcome::Skipped {
            reason: "nat".to_string(),
        };

        assert_eq!(Outcome::Ready.and(Outcome::Ready), Outcome::Ready);
        assert_eq!(Outcome::Ready.and(skipped.clone()), skipped);
        assert_eq!(skipped.clone().and(requeue.clone()), requeue);
        assert_eq!(
            requeue.and(Outcome::Requeue(Duration::from_secs(5))),
            Outcome::Requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_delete_outcome_folding() {
        let present = DeleteOutcome::StillPresent {
            requeue_after: Duration::from_secs(30),
        };
        assert!(DeleteOutcome::ConvergedAbsent
            .and(DeleteOutcome::ConvergedAbsent)
            .is_absent());
        assert_eq!(DeleteOutcome::ConvergedAbsent.and(present), present);
    }

    #[test]
    fn test_wrap_carries_object_context() {
        let object = ObjectRef::new("default", "test-cluster", "uid");
        let err = object.wrap("create net")(CloudError::Transport("boom".to_string()));
        assert_eq!(
            err.to_string(),
            "cannot create net for default/test-cluster: transport: boom"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_tolerate_helpers() {
        assert_eq!(
            tolerate_exists::<u8>(Err(CloudError::AlreadyExists("x".to_string()))),
            Ok(None)
        );
        assert_eq!(tolerate_exists(Ok(1)), Ok(Some(1)));
        assert!(tolerate_exists::<u8>(Err(CloudError::Transport("x".to_string()))).is_err());
        assert_eq!(tolerate_missing(Err(CloudError::NotFound("x".to_string()))), Ok(()));
    }
}
