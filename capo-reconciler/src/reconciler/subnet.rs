//! Subnet reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ClusterScope, DeleteOutcome, Outcome, Reconciler, deleted, tolerate_exists};
use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;

pub struct SubnetReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl SubnetReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for SubnetReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let network = scope.spec.network();
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let net_name = scope.object.logical_name(&network.net.name);
        let net_id = identity
            .dependency(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?;

        let members = self
            .cloud
            .get_subnet_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list subnets"))?;

        let mut outcome = Outcome::Ready;
        for spec in &network.subnets {
            let name = scope.object.logical_name(&spec.name);
            if !spec.resource_id.is_empty() {
                scope.ledger.set_resource_id(Kind::Subnet, &name, &spec.resource_id);
            }

            if let Some(subnet_id) = scope.ledger.resource_id(Kind::Subnet, &name) {
                if members.iter().any(|m| m == subnet_id) {
                    debug!(subnet_id = %subnet_id, "Subnet already exists");
                    continue;
                }
                if !spec.resource_id.is_empty() {
                    return Err(ReconcileError::NotFound {
                        kind: Kind::Subnet,
                        name,
                    });
                }
                scope.ledger.remove(Kind::Subnet, &name);
            }

            info!(name = %name, ip_range = %spec.ip_subnet_range, "Creating subnet");
            let created = tolerate_exists(self.cloud.create_subnet(spec, &net_id, &name).await)
                .map_err(scope.object.wrap("create subnet"))?;
            match created {
                Some(subnet) => {
                    info!(subnet_id = %subnet.subnet_id, "Created subnet");
                    scope.ledger.set_resource_id(Kind::Subnet, &name, subnet.subnet_id);
                }
                None => {
                    let recovered = identity
                        .recover_from_tag(&scope.object, Kind::Subnet, &name, &mut scope.ledger)
                        .await?;
                    if recovered.is_none() {
                        outcome = outcome.and(Outcome::Requeue(self.config.requeue_after()));
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let network = scope.spec.network();
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let net_name = scope.object.logical_name(&network.net.name);

        let names: Vec<String> = network
            .subnets
            .iter()
            .map(|s| scope.object.logical_name(&s.name))
            .collect();

        let Some((net_id, _)) = identity
            .lookup(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?
        else {
            debug!("Net is already deleted, no subnet expected");
            for name in &names {
                scope.ledger.remove(Kind::Subnet, name);
            }
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let members = self
            .cloud
            .get_subnet_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list subnets"))?;

        let mut outcome = DeleteOutcome::ConvergedAbsent;
        for name in &names {
            let Some(subnet_id) = scope.ledger.resource_id(Kind::Subnet, name).map(str::to_string)
            else {
                continue;
            };
            if !members.contains(&subnet_id) {
                debug!(subnet_id = %subnet_id, "Subnet is not part of the net, skipping");
                scope.ledger.remove(Kind::Subnet, name);
                continue;
            }

            info!(subnet_id = %subnet_id, "Deleting subnet");
            let gone = deleted(self.cloud.delete_subnet(&subnet_id).await)
                .map_err(scope.object.wrap("delete subnet"))?;
            if gone {
                scope.ledger.remove(Kind::Subnet, name);
            } else {
                info!(subnet_id = %subnet_id, "Subnet is still in use");
                outcome = outcome.and(DeleteOutcome::StillPresent {
                    requeue_after: self.config.requeue_after(),
                });
            }
        }
        Ok(outcome)
    }
}
