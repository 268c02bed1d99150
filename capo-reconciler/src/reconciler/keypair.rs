//! Keypair reconciler.
//!
//! Keypairs are addressed by name and are usually shared by many machines,
//! so teardown only deletes them when the machine asks for it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{DeleteOutcome, MachineScope, Outcome, Reconciler, tolerate_exists, tolerate_missing};
use crate::cloud::CloudApi;
use crate::error::Result;
use crate::ledger::Kind;

pub struct KeyPairReconciler {
    cloud: Arc<dyn CloudApi>,
}

impl KeyPairReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl Reconciler for KeyPairReconciler {
    type Scope = MachineScope;

    async fn reconcile(&self, scope: &mut MachineScope) -> Result<Outcome> {
        let spec = &scope.spec.key_pair;
        let name = scope.object.logical_name(&spec.name);

        let existing = self
            .cloud
            .get_key_pair(&spec.name)
            .await
            .map_err(scope.object.wrap("get keypair"))?;
        if existing.is_some() {
            debug!(key_pair = %spec.name, "Keypair already exists");
        } else {
            info!(key_pair = %spec.name, "Creating keypair");
            let created = tolerate_exists(self.cloud.create_key_pair(&spec.name, &spec.public_key).await)
                .map_err(scope.object.wrap("create keypair"))?;
            if let Some(key) = created {
                info!(key_pair = %key.key_pair_name, fingerprint = %key.fingerprint, "Created keypair");
            }
        }
        scope
            .ledger
            .set_resource_id(Kind::KeyPair, &name, spec.name.clone());
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut MachineScope) -> Result<DeleteOutcome> {
        let spec = &scope.spec.key_pair;
        let name = scope.object.logical_name(&spec.name);

        if !spec.delete_keypair {
            debug!(key_pair = %spec.name, "Keeping shared keypair");
            scope.ledger.remove(Kind::KeyPair, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        }

        let existing = self
            .cloud
            .get_key_pair(&spec.name)
            .await
            .map_err(scope.object.wrap("get keypair"))?;
        if existing.is_none() {
            debug!(key_pair = %spec.name, "Keypair is already deleted");
        } else {
            info!(key_pair = %spec.name, "Deleting keypair");
            tolerate_missing(self.cloud.delete_key_pair(&spec.name).await)
                .map_err(scope.object.wrap("delete keypair"))?;
        }
        scope.ledger.remove(Kind::KeyPair, &name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;
    use crate::ledger::Ledger;
    use crate::reconciler::{ClusterScope, ObjectRef};
    use crate::spec::{ClusterSpec, KeyPairSpec, MachineSpec, resolve_cluster, resolve_machine};

    fn scope(delete_keypair: bool) -> MachineScope {
        let cluster = ClusterScope::new(
            ObjectRef::new("default", "test-cluster", "uid"),
            resolve_cluster(ClusterSpec::default()),
            Ledger::new(),
        );
        MachineScope::new(
            ObjectRef::new("default", "test-machine", "muid"),
            resolve_machine(MachineSpec {
                key_pair: KeyPairSpec {
                    name: "test-keypair".to_string(),
                    public_key: "ssh-ed25519 AAAA".to_string(),
                    delete_keypair,
                },
                ..Default::default()
            }),
            Ledger::new(),
            cluster,
        )
    }

    #[tokio::test]
    async fn test_existing_keypair_is_reused() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = KeyPairReconciler::new(cloud.clone());
        let mut first = scope(false);
        let mut second = scope(false);

        reconciler.reconcile(&mut first).await.unwrap();
        reconciler.reconcile(&mut second).await.unwrap();

        assert_eq!(cloud.calls("create_key_pair").await, 1);
        assert_eq!(
            second.ledger.resource_id(Kind::KeyPair, "test-keypair-muid"),
            Some("test-keypair")
        );
    }

    #[tokio::test]
    async fn test_shared_keypair_survives_teardown() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = KeyPairReconciler::new(cloud.clone());
        let mut scope = scope(false);
        reconciler.reconcile(&mut scope).await.unwrap();
        cloud.reset_calls().await;

        let outcome = reconciler.finalize(&mut scope).await.unwrap();

        assert!(outcome.is_absent());
        assert_eq!(cloud.calls_with_prefix("").await, 0);
        assert!(scope.ledger.is_empty());
        assert_eq!(cloud.object_count().await, 1);
    }

    #[tokio::test]
    async fn test_keypair_deleted_on_request() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = KeyPairReconciler::new(cloud.clone());
        let mut scope = scope(true);
        reconciler.reconcile(&mut scope).await.unwrap();

        let outcome = reconciler.finalize(&mut scope).await.unwrap();

        assert!(outcome.is_absent());
        assert_eq!(cloud.calls("delete_key_pair").await, 1);
        assert_eq!(cloud.object_count().await, 0);
    }
}
