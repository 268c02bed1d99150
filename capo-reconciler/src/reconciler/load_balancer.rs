//! Load balancer reconciler.
//!
//! Load balancers are addressed by their cloud name, which is shared across
//! clusters in one account. Ownership is decided by the `Name` tag, which
//! carries the logical name of the cluster that created it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ClusterScope, DeleteOutcome, ObjectRef, Outcome, Reconciler, tolerate_exists, tolerate_missing};
use crate::cloud::{CloudApi, LoadBalancer, NAME_TAG_KEY, RuleParams};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::{Kind, Ledger};
use crate::spec::{FLOW_OUTBOUND, LoadBalancerSpec};
use crate::wait::poll_until;

/// The rule every new security group starts with.
fn default_outbound_rule() -> RuleParams {
    RuleParams {
        flow: FLOW_OUTBOUND.to_string(),
        ip_protocol: "-1".to_string(),
        ip_range: "0.0.0.0/0".to_string(),
        member_security_group_id: String::new(),
        from_port_range: 0,
        to_port_range: 0,
    }
}

/// Fail unless `lb` was created for `logical_name`.
fn check_owner(lb: &LoadBalancer, logical_name: &str) -> Result<()> {
    let owner = lb.tags.get(NAME_TAG_KEY).map(String::as_str).unwrap_or_default();
    if owner == logical_name {
        return Ok(());
    }
    Err(ReconcileError::ConflictOwnership {
        kind: Kind::LoadBalancer,
        name: lb.load_balancer_name.clone(),
        owner: owner.to_string(),
        expected: logical_name.to_string(),
    })
}

/// `host:port` clients reach the control plane on.
pub fn endpoint(lb: &LoadBalancer, spec: &LoadBalancerSpec) -> String {
    format!("{}:{}", lb.dns_name, spec.listener.load_balancer_port)
}

pub struct LoadBalancerReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl LoadBalancerReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }

    /// Endpoint of the cluster load balancer, once it is ours and configured.
    pub async fn control_plane_endpoint(&self, scope: &ClusterScope) -> Result<Option<String>> {
        let spec = &scope.spec.network().load_balancer;
        let name = scope.object.logical_name(&spec.load_balancer_name);
        if !scope.ledger.contains(Kind::LoadBalancer, &name) {
            return Ok(None);
        }
        let lb = self
            .cloud
            .get_load_balancer(&spec.load_balancer_name)
            .await
            .map_err(scope.object.wrap("get load balancer"))?;
        Ok(lb.map(|lb| endpoint(&lb, spec)))
    }

    /// Health check and outbound rule cleanup, run once per load balancer.
    async fn configure(
        &self,
        object: &ObjectRef,
        ledger: &mut Ledger,
        spec: &LoadBalancerSpec,
        name: &str,
        security_group_id: &str,
    ) -> Result<()> {
        info!(load_balancer = %spec.load_balancer_name, "Configuring load balancer health check");
        self.cloud
            .configure_health_check(spec)
            .await
            .map_err(object.wrap(&format!("configure health check of load balancer {}", name)))?;

        debug!(security_group_id = %security_group_id, "Removing default outbound rule");
        tolerate_missing(
            self.cloud
                .delete_security_group_rule(security_group_id, &default_outbound_rule())
                .await,
        )
        .map_err(object.wrap("delete security group rule"))?;

        ledger.set_resource_id(Kind::LoadBalancer, name, spec.load_balancer_name.clone());
        Ok(())
    }
}

#[async_trait]
impl Reconciler for LoadBalancerReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let spec = &scope.spec.network().load_balancer;
        let name = scope.object.logical_name(&spec.load_balancer_name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let subnet_id = identity
            .dependency(
                &scope.object,
                Kind::Subnet,
                &scope.object.logical_name(&spec.subnet_name),
                &mut scope.ledger,
            )
            .await?;
        let security_group_id = identity
            .dependency(
                &scope.object,
                Kind::SecurityGroup,
                &scope.object.logical_name(&spec.security_group_name),
                &mut scope.ledger,
            )
            .await?;

        let existing = self
            .cloud
            .get_load_balancer(&spec.load_balancer_name)
            .await
            .map_err(scope.object.wrap("get load balancer"))?;

        match existing {
            Some(lb) => {
                check_owner(&lb, &name)?;
                if scope.ledger.contains(Kind::LoadBalancer, &name) {
                    debug!(load_balancer = %lb.load_balancer_name, "Load balancer already exists");
                    return Ok(Outcome::Ready);
                }
            }
            None => {
                scope.ledger.remove(Kind::LoadBalancer, &name);
                info!(
                    load_balancer = %spec.load_balancer_name,
                    subnet_id = %subnet_id,
                    security_group_id = %security_group_id,
                    "Creating load balancer"
                );
                let created = tolerate_exists(
                    self.cloud
                        .create_load_balancer(spec, &subnet_id, &security_group_id, &name)
                        .await,
                )
                .map_err(scope.object.wrap("create load balancer"))?;
                let Some(lb) = created else {
                    // Visible on the next pass.
                    return Ok(Outcome::Requeue(self.config.requeue_after()));
                };
                info!(load_balancer = %lb.load_balancer_name, dns_name = %lb.dns_name, "Created load balancer");
            }
        }

        self.configure(
            &scope.object,
            &mut scope.ledger,
            spec,
            &name,
            &security_group_id,
        )
        .await?;
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let spec = &scope.spec.network().load_balancer;
        let name = scope.object.logical_name(&spec.load_balancer_name);

        let lb = self
            .cloud
            .get_load_balancer(&spec.load_balancer_name)
            .await
            .map_err(scope.object.wrap("get load balancer"))?;
        let Some(lb) = lb else {
            debug!(load_balancer = %spec.load_balancer_name, "Load balancer is already deleted");
            scope.ledger.remove(Kind::LoadBalancer, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        };
        if check_owner(&lb, &name).is_err() {
            debug!(load_balancer = %lb.load_balancer_name, "Load balancer belongs to another cluster, skipping");
            scope.ledger.remove(Kind::LoadBalancer, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        }

        let cloud = self.cloud.as_ref();
        let object = &scope.object;
        let lb_name = spec.load_balancer_name.as_str();
        let action = &format!("check backend deregistration of load balancer {}", name);
        poll_until(
            &format!("backend deregistration of load balancer {}", name),
            self.config.lb_deregister_poll,
            move || async move {
                let lb = cloud
                    .get_load_balancer(lb_name)
                    .await
                    .map_err(object.wrap(action))?;
                Ok(match lb {
                    Some(lb) if !lb.backend_vm_ids.is_empty() => {
                        debug!(load_balancer = %lb_name, backends = lb.backend_vm_ids.len(), "Backends still registered");
                        None
                    }
                    _ => Some(()),
                })
            },
        )
        .await?;

        info!(load_balancer = %lb_name, "Deleting load balancer");
        tolerate_missing(self.cloud.delete_load_balancer(lb_name).await)
            .map_err(scope.object.wrap(&format!("delete load balancer {}", name)))?;
        scope.ledger.remove(Kind::LoadBalancer, &name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;
    use crate::cloud::{LoadBalancerService, SecurityService};
    use crate::reconciler::net::NetReconciler;
    use crate::reconciler::security_group::SecurityGroupReconciler;
    use crate::reconciler::subnet::SubnetReconciler;
    use crate::spec::{ClusterSpec, resolve_cluster};

    fn scope(uid: &str) -> ClusterScope {
        ClusterScope::new(
            ObjectRef::new("default", "test-cluster", uid),
            resolve_cluster(ClusterSpec::default()),
            Ledger::new(),
        )
    }

    async fn prerequisites(cloud: &Arc<MemoryCloud>, scope: &mut ClusterScope) {
        let config = ReconcilerConfig::fast();
        NetReconciler::new(cloud.clone(), config.clone())
            .reconcile(scope)
            .await
            .unwrap();
        SubnetReconciler::new(cloud.clone(), config.clone())
            .reconcile(scope)
            .await
            .unwrap();
        SecurityGroupReconciler::new(cloud.clone(), config)
            .reconcile(scope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_configured_once() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = LoadBalancerReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope("uid");
        prerequisites(&cloud, &mut scope).await;

        assert!(reconciler.reconcile(&mut scope).await.unwrap().is_ready());
        reconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(cloud.calls("create_load_balancer").await, 1);
        assert_eq!(cloud.calls("configure_health_check").await, 1);
        let lb = cloud.load_balancer("OscClusterApi-1").await.unwrap();
        assert!(lb.health_check_configured);

        let sg_id = scope
            .ledger
            .require(Kind::SecurityGroup, "cluster-api-securitygroup-lb-uid")
            .unwrap();
        let group = cloud.get_security_group(&sg_id).await.unwrap().unwrap();
        assert!(group.outbound_rules.is_empty());

        let endpoint = reconciler.control_plane_endpoint(&scope).await.unwrap();
        assert_eq!(
            endpoint.as_deref(),
            Some("oscclusterapi-1.lbu.memory.internal:6443")
        );
    }

    #[tokio::test]
    async fn test_foreign_load_balancer_is_a_conflict() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = LoadBalancerReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut ours = scope("uid");
        prerequisites(&cloud, &mut ours).await;
        reconciler.reconcile(&mut ours).await.unwrap();

        let mut theirs = scope("other");
        prerequisites(&cloud, &mut theirs).await;
        let err = reconciler.reconcile(&mut theirs).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictOwnership { .. }));
        assert!(!err.is_retryable());

        // Their teardown leaves our load balancer alone.
        let outcome = reconciler.finalize(&mut theirs).await.unwrap();
        assert!(outcome.is_absent());
        assert_eq!(cloud.calls("delete_load_balancer").await, 0);
        assert!(cloud.load_balancer("OscClusterApi-1").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_waits_for_backend_deregistration() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = LoadBalancerReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope("uid");
        prerequisites(&cloud, &mut scope).await;
        reconciler.reconcile(&mut scope).await.unwrap();
        cloud
            .link_load_balancer_backend_machines(&["i-stuck".to_string()], "OscClusterApi-1")
            .await
            .unwrap();

        let err = reconciler.finalize(&mut scope).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert!(err.to_string().contains("OscClusterApi-1-uid"));
        assert_eq!(cloud.calls("delete_load_balancer").await, 0);

        cloud
            .unlink_load_balancer_backend_machines(&["i-stuck".to_string()], "OscClusterApi-1")
            .await
            .unwrap();
        assert!(reconciler.finalize(&mut scope).await.unwrap().is_absent());
        assert_eq!(cloud.calls("delete_load_balancer").await, 1);
    }
}
