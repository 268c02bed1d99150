//! Public IP reconciler.
//!
//! Cluster-level public IPs feed the nat service; a machine may own one more
//! that the Vm reconciler links to its Vm. Both go through [`ensure`] and
//! [`release`]. Membership is checked with `validate_public_ip_ids`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ClusterScope, DeleteOutcome, ObjectRef, Outcome, Reconciler, deleted, tolerate_exists};
use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::{Kind, Ledger};

/// Make sure the public IP `name` exists and is recorded.
///
/// Returns `None` when the IP was reported as existing but cannot be found
/// yet.
pub(crate) async fn ensure(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    ledger: &mut Ledger,
    name: &str,
    resource_id: &str,
) -> Result<Option<String>> {
    if !resource_id.is_empty() {
        ledger.set_resource_id(Kind::PublicIp, name, resource_id);
    }

    if let Some(id) = ledger.resource_id(Kind::PublicIp, name).map(str::to_string) {
        let valid = cloud
            .validate_public_ip_ids(std::slice::from_ref(&id))
            .await
            .map_err(object.wrap("validate public ip"))?;
        if valid.contains(&id) {
            debug!(public_ip_id = %id, "Public ip already exists");
            return Ok(Some(id));
        }
        if !resource_id.is_empty() {
            return Err(ReconcileError::NotFound {
                kind: Kind::PublicIp,
                name: name.to_string(),
            });
        }
        ledger.remove(Kind::PublicIp, name);
    }

    info!(name = %name, "Creating public ip");
    let created = tolerate_exists(cloud.create_public_ip(name).await)
        .map_err(object.wrap("create public ip"))?;
    match created {
        Some(ip) => {
            info!(public_ip_id = %ip.public_ip_id, public_ip = %ip.public_ip, "Created public ip");
            ledger.set_resource_id(Kind::PublicIp, name, ip.public_ip_id.clone());
            Ok(Some(ip.public_ip_id))
        }
        None => {
            IdentityResolver::new(cloud)
                .recover_from_tag(object, Kind::PublicIp, name, ledger)
                .await
        }
    }
}

/// Delete the recorded public IPs among `names`. Returns whether all are gone.
pub(crate) async fn release(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    ledger: &mut Ledger,
    names: &[String],
) -> Result<bool> {
    let recorded: Vec<(String, String)> = names
        .iter()
        .filter_map(|n| {
            ledger
                .resource_id(Kind::PublicIp, n)
                .map(|id| (n.clone(), id.to_string()))
        })
        .collect();
    if recorded.is_empty() {
        return Ok(true);
    }

    let ids: Vec<String> = recorded.iter().map(|(_, id)| id.clone()).collect();
    let members = cloud
        .validate_public_ip_ids(&ids)
        .await
        .map_err(object.wrap("validate public ip"))?;

    let mut all_gone = true;
    for (name, id) in recorded {
        if !members.contains(&id) {
            debug!(public_ip_id = %id, "Public ip is already deleted");
            ledger.remove(Kind::PublicIp, &name);
            continue;
        }
        info!(public_ip_id = %id, "Deleting public ip");
        if deleted(cloud.delete_public_ip(&id).await).map_err(object.wrap("delete public ip"))? {
            ledger.remove(Kind::PublicIp, &name);
        } else {
            info!(public_ip_id = %id, "Public ip is still in use");
            all_gone = false;
        }
    }
    Ok(all_gone)
}

pub struct PublicIpReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl PublicIpReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for PublicIpReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let mut outcome = Outcome::Ready;
        for spec in &scope.spec.network().public_ips {
            let name = scope.object.logical_name(&spec.name);
            let id = ensure(
                self.cloud.as_ref(),
                &scope.object,
                &mut scope.ledger,
                &name,
                &spec.resource_id,
            )
            .await?;
            if id.is_none() {
                outcome = outcome.and(Outcome::Requeue(self.config.requeue_after()));
            }
        }
        Ok(outcome)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let names: Vec<String> = scope
            .spec
            .network()
            .public_ips
            .iter()
            .map(|p| scope.object.logical_name(&p.name))
            .collect();
        if release(self.cloud.as_ref(), &scope.object, &mut scope.ledger, &names).await? {
            Ok(DeleteOutcome::ConvergedAbsent)
        } else {
            Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            })
        }
    }
}
