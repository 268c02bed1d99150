//! Cluster pass: converge or tear down the network topology of one cluster.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::reconciler::bastion::BastionReconciler;
use crate::reconciler::internet_service::InternetServiceReconciler;
use crate::reconciler::load_balancer::LoadBalancerReconciler;
use crate::reconciler::nat_service::NatServiceReconciler;
use crate::reconciler::net::NetReconciler;
use crate::reconciler::public_ip::PublicIpReconciler;
use crate::reconciler::route_table::RouteTableReconciler;
use crate::reconciler::security_group::SecurityGroupReconciler;
use crate::reconciler::subnet::SubnetReconciler;
use crate::reconciler::{ClusterScope, DeleteOutcome, Outcome, Reconciler};
use crate::validation::validate_cluster;

/// What a create pass surfaces to the host layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub outcome: Outcome,
    /// `host:port` of the load balancer, once it has converged.
    pub control_plane_endpoint: Option<String>,
}

/// Runs the per-kind reconcilers of a cluster in dependency order.
pub struct ClusterReconciler {
    config: ReconcilerConfig,
    net_reconciler: NetReconciler,
    subnet_reconciler: SubnetReconciler,
    internet_service_reconciler: InternetServiceReconciler,
    public_ip_reconciler: PublicIpReconciler,
    nat_service_reconciler: NatServiceReconciler,
    route_table_reconciler: RouteTableReconciler,
    security_group_reconciler: SecurityGroupReconciler,
    load_balancer_reconciler: LoadBalancerReconciler,
    bastion_reconciler: BastionReconciler,
}

impl ClusterReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self {
            net_reconciler: NetReconciler::new(cloud.clone(), config.clone()),
            subnet_reconciler: SubnetReconciler::new(cloud.clone(), config.clone()),
            internet_service_reconciler: InternetServiceReconciler::new(cloud.clone(), config.clone()),
            public_ip_reconciler: PublicIpReconciler::new(cloud.clone(), config.clone()),
            nat_service_reconciler: NatServiceReconciler::new(cloud.clone(), config.clone()),
            route_table_reconciler: RouteTableReconciler::new(cloud.clone(), config.clone()),
            security_group_reconciler: SecurityGroupReconciler::new(cloud.clone(), config.clone()),
            load_balancer_reconciler: LoadBalancerReconciler::new(cloud.clone(), config.clone()),
            bastion_reconciler: BastionReconciler::new(cloud, config.clone()),
            config,
        }
    }

    /// Run one create pass. The spec is validated before any cloud call.
    pub async fn reconcile(&self, scope: &mut ClusterScope) -> Result<ClusterReport> {
        validate_cluster(&scope.spec)?;

        info!(namespace = %scope.object.namespace, name = %scope.object.name, "Reconciling cluster");
        let deadline = self.config.pass_deadline();
        let report = tokio::time::timeout(deadline, self.create_pass(scope))
            .await
            .map_err(|_| ReconcileError::DeadlineExceeded(deadline))??;
        info!(
            namespace = %scope.object.namespace,
            name = %scope.object.name,
            outcome = ?report.outcome,
            "Cluster pass finished"
        );
        Ok(report)
    }

    /// Run one delete pass, in reverse dependency order.
    pub async fn delete(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        info!(namespace = %scope.object.namespace, name = %scope.object.name, "Deleting cluster");
        let deadline = self.config.pass_deadline();
        let outcome = tokio::time::timeout(deadline, self.delete_pass(scope))
            .await
            .map_err(|_| ReconcileError::DeadlineExceeded(deadline))??;
        if outcome.is_absent() {
            info!(namespace = %scope.object.namespace, name = %scope.object.name, "Cluster resources are gone");
        }
        Ok(outcome)
    }

    async fn create_pass(&self, scope: &mut ClusterScope) -> Result<ClusterReport> {
        let mut outcome = Outcome::Ready;
        outcome = outcome.and(self.net_reconciler.reconcile(scope).await?);
        outcome = outcome.and(self.subnet_reconciler.reconcile(scope).await?);
        outcome = outcome.and(self.internet_service_reconciler.reconcile(scope).await?);
        outcome = outcome.and(self.public_ip_reconciler.reconcile(scope).await?);
        outcome = outcome.and(self.security_group_reconciler.reconcile(scope).await?);

        // Tables routed through the nat service are skipped here and
        // completed once it exists.
        let early = self.route_table_reconciler.reconcile(scope).await?;
        if !early.is_ready() {
            info!(outcome = ?early, "Some route tables wait for the nat service");
        }
        outcome = outcome.and(self.nat_service_reconciler.reconcile(scope).await?);
        outcome = outcome.and(self.route_table_reconciler.reconcile(scope).await?);

        outcome = outcome.and(self.load_balancer_reconciler.reconcile(scope).await?);
        let control_plane_endpoint = self
            .load_balancer_reconciler
            .control_plane_endpoint(scope)
            .await?;
        outcome = outcome.and(self.bastion_reconciler.reconcile(scope).await?);

        Ok(ClusterReport {
            outcome,
            control_plane_endpoint,
        })
    }

    async fn delete_pass(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let steps: [(&str, &dyn Reconciler<Scope = ClusterScope>); 9] = [
            ("bastion", &self.bastion_reconciler),
            ("load balancer", &self.load_balancer_reconciler),
            ("security groups", &self.security_group_reconciler),
            ("route tables", &self.route_table_reconciler),
            ("nat service", &self.nat_service_reconciler),
            ("public ips", &self.public_ip_reconciler),
            ("internet service", &self.internet_service_reconciler),
            ("subnets", &self.subnet_reconciler),
            ("net", &self.net_reconciler),
        ];

        let mut outcome = DeleteOutcome::ConvergedAbsent;
        for (what, reconciler) in steps {
            let step = reconciler.finalize(scope).await?;
            if !step.is_absent() {
                warn!(step = what, "Still present, will retry");
            }
            outcome = outcome.and(step);
        }
        Ok(outcome)
    }
}
