//! Nat service reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ClusterScope, DeleteOutcome, Outcome, Reconciler, deleted, tolerate_exists};
use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;

pub struct NatServiceReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl NatServiceReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for NatServiceReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let spec = &scope.spec.network().nat_service;
        let name = scope.object.logical_name(&spec.name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let subnet_id = identity
            .dependency(
                &scope.object,
                Kind::Subnet,
                &scope.object.logical_name(&spec.subnet_name),
                &mut scope.ledger,
            )
            .await?;
        let public_ip_id = identity
            .dependency(
                &scope.object,
                Kind::PublicIp,
                &scope.object.logical_name(&spec.public_ip_name),
                &mut scope.ledger,
            )
            .await?;

        if !spec.resource_id.is_empty() {
            scope
                .ledger
                .set_resource_id(Kind::NatService, &name, &spec.resource_id);
        }

        if let Some((nat_id, _)) = identity
            .lookup(&scope.object, Kind::NatService, &name, &mut scope.ledger)
            .await?
        {
            let nat = self
                .cloud
                .get_nat_service(&nat_id)
                .await
                .map_err(scope.object.wrap("get nat service"))?;
            if nat.is_some() {
                debug!(nat_service_id = %nat_id, "Nat service already exists");
                return Ok(Outcome::Ready);
            }
            if !spec.resource_id.is_empty() {
                return Err(ReconcileError::NotFound {
                    kind: Kind::NatService,
                    name,
                });
            }
            warn!(nat_service_id = %nat_id, "Recorded nat service is gone, recreating");
            scope.ledger.remove(Kind::NatService, &name);
        }

        info!(name = %name, subnet_id = %subnet_id, public_ip_id = %public_ip_id, "Creating nat service");
        let created = tolerate_exists(
            self.cloud
                .create_nat_service(&public_ip_id, &subnet_id, &name)
                .await,
        )
        .map_err(scope.object.wrap("create nat service"))?;
        match created {
            Some(nat) => {
                info!(nat_service_id = %nat.nat_service_id, "Created nat service");
                scope
                    .ledger
                    .set_resource_id(Kind::NatService, &name, nat.nat_service_id);
            }
            None => {
                let recovered = identity
                    .recover_from_tag(&scope.object, Kind::NatService, &name, &mut scope.ledger)
                    .await?;
                if recovered.is_none() {
                    return Ok(Outcome::Requeue(self.config.requeue_after()));
                }
            }
        }
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let network = scope.spec.network();
        let name = scope.object.logical_name(&network.nat_service.name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let Some((nat_id, _)) = identity
            .lookup(&scope.object, Kind::NatService, &name, &mut scope.ledger)
            .await?
        else {
            debug!(name = %name, "Nat service is already deleted");
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let nat = self
            .cloud
            .get_nat_service(&nat_id)
            .await
            .map_err(scope.object.wrap("get nat service"))?;
        let Some(nat) = nat else {
            debug!(nat_service_id = %nat_id, "Nat service is already deleted");
            scope.ledger.remove(Kind::NatService, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        // Only delete a nat service that sits in one of this net's subnets.
        let net_name = scope.object.logical_name(&network.net.name);
        let members = match identity
            .lookup(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?
        {
            Some((net_id, _)) => self
                .cloud
                .get_subnet_ids_from_net_ids(&net_id)
                .await
                .map_err(scope.object.wrap("list subnets"))?,
            None => Vec::new(),
        };
        if !members.contains(&nat.subnet_id) {
            debug!(nat_service_id = %nat_id, subnet_id = %nat.subnet_id, "Nat service is not part of the net, skipping");
            scope.ledger.remove(Kind::NatService, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        }

        info!(nat_service_id = %nat_id, "Deleting nat service");
        let gone = deleted(self.cloud.delete_nat_service(&nat_id).await)
            .map_err(scope.object.wrap("delete nat service"))?;
        if !gone {
            return Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            });
        }
        scope.ledger.remove(Kind::NatService, &name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}
