//! Bastion reconciler.
//!
//! An optional jump Vm in a cluster subnet, reachable through its own public
//! IP. It is launched after the network topology exists and removed before
//! any of it is torn down.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::vm::{forget_image, launch, resolve_image, wait_running};
use super::{ClusterScope, DeleteOutcome, Outcome, Reconciler, deleted, public_ip, tolerate_exists, tolerate_missing};
use crate::cloud::{CloudApi, CreateVmRequest, NAME_TAG_KEY, VmState};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;

pub struct BastionReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl BastionReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }

    async fn build_request(&self, scope: &mut ClusterScope, tag_name: &str) -> Result<CreateVmRequest> {
        let bastion = scope.spec.network().bastion.clone();
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let subnet_id = identity
            .dependency(
                &scope.object,
                Kind::Subnet,
                &scope.object.logical_name(&bastion.subnet_name),
                &mut scope.ledger,
            )
            .await?;
        let mut security_group_ids = Vec::with_capacity(bastion.security_group_names.len());
        for sg in &bastion.security_group_names {
            security_group_ids.push(
                identity
                    .dependency(
                        &scope.object,
                        Kind::SecurityGroup,
                        &scope.object.logical_name(sg),
                        &mut scope.ledger,
                    )
                    .await?,
            );
        }
        let image_id = resolve_image(
            self.cloud.as_ref(),
            &scope.object,
            &mut scope.ledger,
            &bastion.image_id,
            &bastion.image_name,
            &bastion.image_account_id,
        )
        .await?;

        Ok(CreateVmRequest {
            tag_name: tag_name.to_string(),
            image_id,
            vm_type: bastion.vm_type,
            key_pair_name: bastion.key_pair_name,
            subnet_id,
            security_group_ids,
            private_ips: bastion.private_ips,
            subregion_name: bastion.subregion_name,
            root_disk_type: bastion.root_disk.root_disk_type,
            root_disk_size: bastion.root_disk.root_disk_size,
            root_disk_iops: bastion.root_disk.root_disk_iops,
        })
    }

    /// Returns `false` when the public IP is not visible yet.
    async fn link_public_ip(&self, scope: &mut ClusterScope, vm_id: &str) -> Result<bool> {
        let name = scope
            .object
            .logical_name(&scope.spec.network().bastion.public_ip_name);
        let Some(public_ip_id) = public_ip::ensure(
            self.cloud.as_ref(),
            &scope.object,
            &mut scope.ledger,
            &name,
            "",
        )
        .await?
        else {
            return Ok(false);
        };
        if !scope.ledger.link_ids(Kind::PublicIp, &name).is_empty() {
            return Ok(true);
        }

        info!(public_ip_id = %public_ip_id, vm_id = %vm_id, "Linking bastion public ip");
        let link_id = tolerate_exists(self.cloud.link_public_ip(&public_ip_id, vm_id).await)
            .map_err(scope.object.wrap("link bastion public ip"))?;
        match link_id {
            Some(link_id) => scope.ledger.add_link_id(Kind::PublicIp, &name, link_id),
            None => warn!(public_ip_id = %public_ip_id, "Bastion public ip is linked elsewhere"),
        }
        Ok(true)
    }
}

#[async_trait]
impl Reconciler for BastionReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let bastion = &scope.spec.network().bastion;
        if !bastion.enable {
            return Ok(Outcome::Ready);
        }
        let name = scope.object.logical_name(&bastion.name);
        let imported = !bastion.resource_id.is_empty();
        if imported {
            scope
                .ledger
                .set_resource_id(Kind::Vm, &name, bastion.resource_id.clone());
        }

        let mut current = None;
        if let Some(vm_id) = scope.ledger.resource_id(Kind::Vm, &name).map(str::to_string) {
            let vm = self
                .cloud
                .get_vm(&vm_id)
                .await
                .map_err(scope.object.wrap("get bastion vm"))?;
            match vm {
                Some(vm) if vm.state != VmState::Terminated => current = Some(vm),
                _ if imported => return Err(ReconcileError::NotFound { kind: Kind::Vm, name }),
                _ => {
                    warn!(vm_id = %vm_id, "Recorded bastion vm is gone, recreating");
                    scope.ledger.remove(Kind::Vm, &name);
                    let ip_name = scope
                        .object
                        .logical_name(&scope.spec.network().bastion.public_ip_name);
                    scope.ledger.clear_link_ids(Kind::PublicIp, &ip_name);
                }
            }
        }

        let vm = match current {
            Some(vm) if vm.state == VmState::Running => vm,
            Some(vm) => {
                info!(vm_id = %vm.vm_id, state = ?vm.state, "Bastion vm is not running yet");
                return Ok(Outcome::Requeue(self.config.requeue_after()));
            }
            None => {
                let request = self.build_request(scope, &name).await?;
                let Some(vm_id) =
                    launch(self.cloud.as_ref(), &scope.object, &mut scope.ledger, &name, &request)
                        .await?
                else {
                    return Ok(Outcome::Requeue(self.config.requeue_after()));
                };
                wait_running(
                    self.cloud.as_ref(),
                    self.config.vm_running_poll,
                    &scope.object,
                    &vm_id,
                )
                .await?
            }
        };

        if !self.link_public_ip(scope, &vm.vm_id).await? {
            return Ok(Outcome::Requeue(self.config.requeue_after()));
        }
        Ok(Outcome::Ready)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let bastion = scope.spec.network().bastion.clone();
        let name = scope.object.logical_name(&bastion.name);
        let ip_name = scope.object.logical_name(&bastion.public_ip_name);

        for link_id in scope.ledger.link_ids(Kind::PublicIp, &ip_name).to_vec() {
            info!(link_id = %link_id, "Unlinking bastion public ip");
            tolerate_missing(self.cloud.unlink_public_ip(&link_id).await)
                .map_err(scope.object.wrap("unlink bastion public ip"))?;
        }
        scope.ledger.clear_link_ids(Kind::PublicIp, &ip_name);

        if let Some(vm_id) = scope.ledger.resource_id(Kind::Vm, &name).map(str::to_string) {
            let vm = self
                .cloud
                .get_vm(&vm_id)
                .await
                .map_err(scope.object.wrap("get bastion vm"))?;
            match vm {
                Some(vm) if vm.state != VmState::Terminated && vm.tags.get(NAME_TAG_KEY) == Some(&name) => {
                    info!(vm_id = %vm_id, "Deleting bastion vm");
                    let gone = deleted(self.cloud.delete_vm(&vm_id).await)
                        .map_err(scope.object.wrap("delete bastion vm"))?;
                    if !gone {
                        return Ok(DeleteOutcome::StillPresent {
                            requeue_after: self.config.requeue_after(),
                        });
                    }
                }
                Some(vm) if vm.state != VmState::Terminated => {
                    debug!(vm_id = %vm_id, "Bastion vm is not ours, skipping");
                }
                _ => debug!(vm_id = %vm_id, "Bastion vm is already deleted"),
            }
            scope.ledger.remove(Kind::Vm, &name);
        }
        forget_image(&scope.object, &mut scope.ledger, &bastion.image_name);

        if public_ip::release(self.cloud.as_ref(), &scope.object, &mut scope.ledger, &[ip_name]).await? {
            Ok(DeleteOutcome::ConvergedAbsent)
        } else {
            Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;
    use crate::ledger::Ledger;
    use crate::reconciler::ObjectRef;
    use crate::spec::{ClusterSpec, resolve_cluster};

    fn scope(enable: bool) -> ClusterScope {
        let mut spec = ClusterSpec::default();
        spec.network.bastion.enable = enable;
        ClusterScope::new(
            ObjectRef::new("default", "test-cluster", "uid"),
            resolve_cluster(spec),
            Ledger::new(),
        )
    }

    #[tokio::test]
    async fn test_disabled_bastion_makes_no_calls() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = BastionReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(false);

        assert_eq!(reconciler.reconcile(&mut scope).await.unwrap(), Outcome::Ready);
        assert!(reconciler.finalize(&mut scope).await.unwrap().is_absent());
        assert_eq!(cloud.calls_with_prefix("").await, 0);
    }

    #[tokio::test]
    async fn test_missing_subnet_is_unresolved() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = BastionReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(true);

        let err = reconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::DependencyUnresolved { kind: Kind::Subnet, .. }
        ));
        assert_eq!(cloud.calls("create_vm").await, 0);
    }
}
