//! Internet service reconciler.
//!
//! The internet service is a standalone object linked to the net. The link
//! is recorded in the ledger entry as the net ID it was attached to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    ClusterScope, DeleteOutcome, Outcome, Reconciler, deleted, tolerate_exists, tolerate_missing,
};
use crate::cloud::{CloudApi, CloudError};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;

pub struct InternetServiceReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl InternetServiceReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for InternetServiceReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let network = scope.spec.network();
        let spec = &network.internet_service;
        let name = scope.object.logical_name(&spec.name);
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let net_name = scope.object.logical_name(&network.net.name);
        let net_id = identity
            .dependency(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?;

        if !spec.resource_id.is_empty() {
            scope
                .ledger
                .set_resource_id(Kind::InternetService, &name, &spec.resource_id);
        }

        let mut existing = None;
        if let Some(id) = scope.ledger.resource_id(Kind::InternetService, &name) {
            let id = id.to_string();
            existing = self
                .cloud
                .get_internet_service(&id)
                .await
                .map_err(scope.object.wrap("get internet service"))?;
            if existing.is_none() {
                if !spec.resource_id.is_empty() {
                    return Err(ReconcileError::NotFound {
                        kind: Kind::InternetService,
                        name,
                    });
                }
                warn!(internet_service_id = %id, "Recorded internet service is gone, recreating");
                scope.ledger.remove(Kind::InternetService, &name);
            }
        }

        let internet_service = match existing {
            Some(is) => is,
            None => {
                info!(name = %name, "Creating internet service");
                let created = tolerate_exists(self.cloud.create_internet_service(&name).await)
                    .map_err(scope.object.wrap("create internet service"))?;
                match created {
                    Some(is) => {
                        info!(internet_service_id = %is.internet_service_id, "Created internet service");
                        scope.ledger.set_resource_id(
                            Kind::InternetService,
                            &name,
                            is.internet_service_id.clone(),
                        );
                        is
                    }
                    None => {
                        let Some(id) = identity
                            .recover_from_tag(
                                &scope.object,
                                Kind::InternetService,
                                &name,
                                &mut scope.ledger,
                            )
                            .await?
                        else {
                            return Ok(Outcome::Requeue(self.config.requeue_after()));
                        };
                        match self
                            .cloud
                            .get_internet_service(&id)
                            .await
                            .map_err(scope.object.wrap("get internet service"))?
                        {
                            Some(is) => is,
                            None => return Ok(Outcome::Requeue(self.config.requeue_after())),
                        }
                    }
                }
            }
        };

        match internet_service.net_id.as_deref() {
            Some(linked) if linked == net_id => {
                debug!(internet_service_id = %internet_service.internet_service_id, "Internet service already linked");
            }
            Some(other) => {
                return Err(ReconcileError::ConflictOwnership {
                    kind: Kind::InternetService,
                    name,
                    owner: other.to_string(),
                    expected: net_id,
                });
            }
            None => {
                info!(
                    internet_service_id = %internet_service.internet_service_id,
                    net_id = %net_id,
                    "Linking internet service"
                );
                match self
                    .cloud
                    .link_internet_service(&internet_service.internet_service_id, &net_id)
                    .await
                {
                    Ok(()) | Err(CloudError::AlreadyExists(_)) => {}
                    Err(e) => return Err(scope.object.wrap("link internet service")(e)),
                }
            }
        }
        scope.ledger.clear_link_ids(Kind::InternetService, &name);
        scope.ledger.add_link_id(Kind::InternetService, &name, net_id);
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let network = scope.spec.network();
        let name = scope.object.logical_name(&network.internet_service.name);

        let Some(id) = scope
            .ledger
            .resource_id(Kind::InternetService, &name)
            .map(str::to_string)
        else {
            debug!(name = %name, "Internet service is already deleted");
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let internet_service = self
            .cloud
            .get_internet_service(&id)
            .await
            .map_err(scope.object.wrap("get internet service"))?;
        let Some(internet_service) = internet_service else {
            debug!(internet_service_id = %id, "Internet service is already deleted");
            scope.ledger.remove(Kind::InternetService, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let net_name = scope.object.logical_name(&network.net.name);
        let mut ours = scope.ledger.link_ids(Kind::InternetService, &name).to_vec();
        ours.extend(scope.ledger.resource_id(Kind::Net, &net_name).map(str::to_string));
        if let Some(linked) = internet_service.net_id.as_deref() {
            if !ours.iter().any(|n| n == linked) {
                debug!(internet_service_id = %id, net_id = %linked, "Internet service is linked elsewhere, skipping");
                scope.ledger.remove(Kind::InternetService, &name);
                return Ok(DeleteOutcome::ConvergedAbsent);
            }
            info!(internet_service_id = %id, net_id = %linked, "Unlinking internet service");
            tolerate_missing(self.cloud.unlink_internet_service(&id, linked).await)
                .map_err(scope.object.wrap("unlink internet service"))?;
            scope.ledger.clear_link_ids(Kind::InternetService, &name);
        }

        info!(internet_service_id = %id, "Deleting internet service");
        let gone = deleted(self.cloud.delete_internet_service(&id).await)
            .map_err(scope.object.wrap("delete internet service"))?;
        if !gone {
            return Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            });
        }
        scope.ledger.remove(Kind::InternetService, &name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}
