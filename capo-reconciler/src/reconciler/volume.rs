//! Volume reconciler.
//!
//! Volumes are created before the Vm and linked to it by the Vm reconciler
//! once it runs. The link is recorded as the Vm ID in the volume's ledger
//! entry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DeleteOutcome, MachineScope, ObjectRef, Outcome, Reconciler, deleted, tolerate_exists, tolerate_missing};
use crate::cloud::{CloudApi, VolumeState};
use crate::config::{PollSettings, ReconcilerConfig};
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::Kind;
use crate::wait::poll_until;

/// Wait until the volume reports `state`.
pub(crate) async fn wait_for_state(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    settings: PollSettings,
    volume_id: &str,
    state: VolumeState,
) -> Result<()> {
    let what = &format!("volume {} to become {:?}", volume_id, state);
    poll_until(what, settings, move || async move {
        let volume = cloud
            .get_volume(volume_id)
            .await
            .map_err(object.wrap("get volume"))?;
        match volume {
            Some(v) if v.state == state => Ok(Some(())),
            Some(_) => Ok(None),
            None => Err(ReconcileError::NotFound {
                kind: Kind::Volume,
                name: volume_id.to_string(),
            }),
        }
    })
    .await
}

/// Link a volume to a running Vm and wait until it is in use.
pub(crate) async fn link(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    settings: PollSettings,
    volume_id: &str,
    vm_id: &str,
    device_name: &str,
) -> Result<()> {
    let volume = cloud
        .get_volume(volume_id)
        .await
        .map_err(object.wrap("get volume"))?;
    if let Some(v) = &volume
        && v.state == VolumeState::InUse
        && v.vm_id.as_deref() == Some(vm_id)
    {
        debug!(volume_id = %volume_id, vm_id = %vm_id, "Volume already linked");
        return Ok(());
    }

    wait_for_state(cloud, object, settings, volume_id, VolumeState::Available).await?;
    info!(volume_id = %volume_id, vm_id = %vm_id, device_name = %device_name, "Linking volume");
    tolerate_exists(cloud.link_volume(volume_id, vm_id, device_name).await)
        .map_err(object.wrap("link volume"))?;
    wait_for_state(cloud, object, settings, volume_id, VolumeState::InUse).await
}

pub struct VolumeReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl VolumeReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }
}

#[async_trait]
impl Reconciler for VolumeReconciler {
    type Scope = MachineScope;

    async fn reconcile(&self, scope: &mut MachineScope) -> Result<Outcome> {
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let mut outcome = Outcome::Ready;

        for spec in &scope.spec.volumes {
            let name = scope.object.logical_name(&spec.name);
            if !spec.resource_id.is_empty() {
                scope
                    .ledger
                    .set_resource_id(Kind::Volume, &name, &spec.resource_id);
            }

            if let Some(id) = scope.ledger.resource_id(Kind::Volume, &name) {
                let id = id.to_string();
                let volume = self
                    .cloud
                    .get_volume(&id)
                    .await
                    .map_err(scope.object.wrap("get volume"))?;
                if volume.is_some() {
                    debug!(volume_id = %id, "Volume already exists");
                    continue;
                }
                if !spec.resource_id.is_empty() {
                    return Err(ReconcileError::NotFound {
                        kind: Kind::Volume,
                        name,
                    });
                }
                warn!(volume_id = %id, "Recorded volume is gone, recreating");
                scope.ledger.remove(Kind::Volume, &name);
            }

            info!(name = %name, size = spec.size, volume_type = %spec.volume_type, "Creating volume");
            let created = tolerate_exists(self.cloud.create_volume(spec, &name).await)
                .map_err(scope.object.wrap("create volume"))?;
            match created {
                Some(volume) => {
                    info!(volume_id = %volume.volume_id, "Created volume");
                    scope
                        .ledger
                        .set_resource_id(Kind::Volume, &name, volume.volume_id);
                }
                None => {
                    let recovered = identity
                        .recover_from_tag(&scope.object, Kind::Volume, &name, &mut scope.ledger)
                        .await?;
                    if recovered.is_none() {
                        outcome = outcome.and(Outcome::Requeue(self.config.requeue_after()));
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn finalize(&self, scope: &mut MachineScope) -> Result<DeleteOutcome> {
        let mut outcome = DeleteOutcome::ConvergedAbsent;

        for spec in &scope.spec.volumes {
            let name = scope.object.logical_name(&spec.name);
            let Some(id) = scope
                .ledger
                .resource_id(Kind::Volume, &name)
                .map(str::to_string)
            else {
                continue;
            };

            let volume = self
                .cloud
                .get_volume(&id)
                .await
                .map_err(scope.object.wrap("get volume"))?;
            let Some(volume) = volume else {
                debug!(volume_id = %id, "Volume is already deleted");
                scope.ledger.remove(Kind::Volume, &name);
                continue;
            };

            if volume.state == VolumeState::InUse {
                info!(volume_id = %id, vm_id = ?volume.vm_id, "Unlinking volume");
                tolerate_missing(self.cloud.unlink_volume(&id).await)
                    .map_err(scope.object.wrap("unlink volume"))?;
                wait_for_state(
                    self.cloud.as_ref(),
                    &scope.object,
                    self.config.volume_state_poll,
                    &id,
                    VolumeState::Available,
                )
                .await?;
            }
            scope.ledger.clear_link_ids(Kind::Volume, &name);

            info!(volume_id = %id, "Deleting volume");
            let gone = deleted(self.cloud.delete_volume(&id).await)
                .map_err(scope.object.wrap("delete volume"))?;
            if gone {
                scope.ledger.remove(Kind::Volume, &name);
            } else {
                outcome = outcome.and(DeleteOutcome::StillPresent {
                    requeue_after: self.config.requeue_after(),
                });
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;
    use crate::cloud::{CloudError, StorageService};
    use crate::ledger::Ledger;
    use crate::reconciler::ClusterScope;
    use crate::spec::{ClusterSpec, MachineSpec, VolumeSpec, resolve_cluster, resolve_machine};

    fn scope() -> MachineScope {
        let cluster = ClusterScope::new(
            ObjectRef::new("default", "test-cluster", "uid"),
            resolve_cluster(ClusterSpec::default()),
            Ledger::new(),
        );
        MachineScope::new(
            ObjectRef::new("default", "test-machine", "muid"),
            resolve_machine(MachineSpec {
                volumes: vec![VolumeSpec {
                    name: "test-volume".to_string(),
                    device_name: "/dev/xvdb".to_string(),
                    size: 10,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            Ledger::new(),
            cluster,
        )
    }

    #[tokio::test]
    async fn test_volume_created_once() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = VolumeReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope();

        assert_eq!(reconciler.reconcile(&mut scope).await.unwrap(), Outcome::Ready);
        assert_eq!(reconciler.reconcile(&mut scope).await.unwrap(), Outcome::Ready);

        assert_eq!(cloud.calls("create_volume").await, 1);
        assert!(scope.ledger.contains(Kind::Volume, "test-volume-muid"));
    }

    #[tokio::test]
    async fn test_recorded_volume_that_vanished_is_recreated() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = VolumeReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope();
        reconciler.reconcile(&mut scope).await.unwrap();
        let old = scope
            .ledger
            .resource_id(Kind::Volume, "test-volume-muid")
            .unwrap()
            .to_string();
        cloud.forget(&old).await;

        reconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(cloud.calls("create_volume").await, 2);
        assert_ne!(scope.ledger.resource_id(Kind::Volume, "test-volume-muid"), Some(old.as_str()));
    }

    #[tokio::test]
    async fn test_volume_in_use_is_still_present() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = VolumeReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope();
        reconciler.reconcile(&mut scope).await.unwrap();
        cloud
            .fail("delete_volume", CloudError::DependencyViolation("in use".to_string()))
            .await;

        let outcome = reconciler.finalize(&mut scope).await.unwrap();

        assert!(!outcome.is_absent());
        assert!(scope.ledger.contains(Kind::Volume, "test-volume-muid"));

        cloud.clear_failures().await;
        assert!(reconciler.finalize(&mut scope).await.unwrap().is_absent());
        assert_eq!(cloud.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_link_to_missing_vm_fails() {
        let cloud = Arc::new(MemoryCloud::new());
        let object = ObjectRef::new("default", "test-machine", "muid");
        let volume = cloud
            .create_volume(&VolumeSpec::default(), "test-volume-muid")
            .await
            .unwrap();

        // No Vm with that ID exists.
        let err = link(
            cloud.as_ref(),
            &object,
            ReconcilerConfig::fast().volume_state_poll,
            &volume.volume_id,
            "i-missing",
            "/dev/xvdb",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Provider { .. }));
        assert_eq!(cloud.calls("link_volume").await, 1);
    }
}
