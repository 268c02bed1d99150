//! Net reconciler - the root of the cluster network graph.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ClusterScope, DeleteOutcome, Outcome, Reconciler, deleted, tolerate_exists};
use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;

pub struct NetReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl NetReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for NetReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let spec = &scope.spec.network().net;
        let name = scope.object.logical_name(&spec.name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        if !spec.resource_id.is_empty() {
            scope.ledger.set_resource_id(Kind::Net, &name, &spec.resource_id);
        }

        if let Some((net_id, source)) = identity
            .lookup(&scope.object, Kind::Net, &name, &mut scope.ledger)
            .await?
        {
            let net = self
                .cloud
                .get_net(&net_id)
                .await
                .map_err(scope.object.wrap("get net"))?;
            if net.is_some() {
                debug!(net_id = %net_id, "Net already exists");
                return Ok(Outcome::Ready);
            }
            if !spec.resource_id.is_empty() {
                return Err(ReconcileError::NotFound {
                    kind: Kind::Net,
                    name,
                });
            }
            warn!(net_id = %net_id, source = ?source, "Recorded net is gone, recreating");
            scope.ledger.remove(Kind::Net, &name);
        }

        info!(name = %name, ip_range = %spec.ip_range, "Creating net");
        let created = tolerate_exists(self.cloud.create_net(spec, &name).await)
            .map_err(scope.object.wrap("create net"))?;
        match created {
            Some(net) => {
                info!(net_id = %net.net_id, "Created net");
                scope.ledger.set_resource_id(Kind::Net, &name, net.net_id);
            }
            None => {
                let recovered = identity
                    .recover_from_tag(&scope.object, Kind::Net, &name, &mut scope.ledger)
                    .await?;
                if recovered.is_none() {
                    info!(name = %name, "Net already exists but is not visible yet");
                    return Ok(Outcome::Requeue(self.config.requeue_after()));
                }
            }
        }
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let name = scope.object.logical_name(&scope.spec.network().net.name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let Some((net_id, _)) = identity
            .lookup(&scope.object, Kind::Net, &name, &mut scope.ledger)
            .await?
        else {
            debug!(name = %name, "Net is already deleted");
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let net = self
            .cloud
            .get_net(&net_id)
            .await
            .map_err(scope.object.wrap("get net"))?;
        if net.is_none() {
            debug!(net_id = %net_id, "Net is already deleted");
            scope.ledger.remove(Kind::Net, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        }

        info!(net_id = %net_id, "Deleting net");
        let gone = deleted(self.cloud.delete_net(&net_id).await)
            .map_err(scope.object.wrap("delete net"))?;
        if !gone {
            info!(net_id = %net_id, "Net is still in use");
            return Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            });
        }
        scope.ledger.remove(Kind::Net, &name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::NetService;
    use crate::cloud::memory::MemoryCloud;
    use crate::ledger::Ledger;
    use crate::reconciler::ObjectRef;
    use crate::spec::{ClusterSpec, NetSpec, NetworkSpec, resolve_cluster};

    fn scope(resource_id: &str) -> ClusterScope {
        let spec = resolve_cluster(ClusterSpec {
            network: NetworkSpec {
                net: NetSpec {
                    name: "test-net".to_string(),
                    ip_range: "10.0.0.0/16".to_string(),
                    resource_id: resource_id.to_string(),
                },
                ..Default::default()
            },
        });
        ClusterScope::new(
            ObjectRef::new("default", "test-cluster", "uid"),
            spec,
            Ledger::new(),
        )
    }

    #[tokio::test]
    async fn test_missing_imported_net_is_not_found() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = NetReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope("vpc-missing");

        let err = reconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { kind: Kind::Net, .. }));
        assert_eq!(cloud.calls("create_net").await, 0);
    }

    #[tokio::test]
    async fn test_drifted_net_is_recreated() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = NetReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope("");

        reconciler.reconcile(&mut scope).await.unwrap();
        let first = scope.ledger.require(Kind::Net, "test-net-uid").unwrap();
        cloud.forget(&first).await;

        reconciler.reconcile(&mut scope).await.unwrap();
        let second = scope.ledger.require(Kind::Net, "test-net-uid").unwrap();
        assert_ne!(first, second);
        assert_eq!(cloud.calls("create_net").await, 2);
    }

    #[tokio::test]
    async fn test_net_in_use_stays_present() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = NetReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope("");
        reconciler.reconcile(&mut scope).await.unwrap();
        let net_id = scope.ledger.require(Kind::Net, "test-net-uid").unwrap();
        cloud.create_route_table(&net_id, "rt").await.unwrap();

        let outcome = reconciler.finalize(&mut scope).await.unwrap();
        assert!(!outcome.is_absent());
        assert!(scope.ledger.contains(Kind::Net, "test-net-uid"));
    }
}
