//! Vm reconciler.
//!
//! Creates the Vm, waits for it to run, then attaches everything that needs
//! a running Vm: volumes, the machine public IP, the cluster load balancer and
//! the CCM tag. One-shot steps leave a marker in the Vm ledger entry's link
//! IDs so a later pass does not repeat them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::security_group::ensure_rule;
use super::{
    ClusterScope, DeleteOutcome, MachineScope, ObjectRef, Outcome, Reconciler, deleted,
    public_ip, tolerate_exists, tolerate_missing, volume,
};
use crate::cloud::{CloudApi, CreateVmRequest, NAME_TAG_KEY, RuleParams, Vm, VmState};
use crate::config::{PollSettings, ReconcilerConfig};
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::{Kind, Ledger};
use crate::spec::{FLOW_INBOUND, FLOW_OUTBOUND};
use crate::wait::poll_until;

/// Vm link marker: registered as a load balancer backend.
const LOAD_BALANCER_MARKER: &str = "loadBalancerBackend";
/// Vm link marker: CCM cluster tag written.
const CCM_TAG_MARKER: &str = "ccmTag";

const CCM_TAG_PREFIX: &str = "OscK8sClusterID/";
const CCM_TAG_VALUE: &str = "owned";

/// Provider ID the host orchestrator matches nodes with.
pub fn provider_id(vm: &Vm) -> String {
    format!("aws:///{}/{}", vm.subregion_name, vm.vm_id)
}

fn image_key(object: &ObjectRef, image_name: &str) -> String {
    object.logical_name(image_name)
}

/// Image to launch from: the declared ID, or the one found by name.
///
/// A name lookup is recorded so later launches reuse the same image.
pub(crate) async fn resolve_image(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    ledger: &mut Ledger,
    image_id: &str,
    image_name: &str,
    account_id: &str,
) -> Result<String> {
    if !image_id.is_empty() {
        return Ok(image_id.to_string());
    }
    let key = image_key(object, image_name);
    if let Some(id) = ledger.resource_id(Kind::Image, &key) {
        return Ok(id.to_string());
    }

    if account_id.is_empty() {
        warn!(image_name = %image_name, "Image account is not set, any account may own the image");
    }
    let image = cloud
        .get_image_by_name(image_name, account_id)
        .await
        .map_err(object.wrap("get image"))?
        .ok_or_else(|| ReconcileError::NotFound {
            kind: Kind::Image,
            name: image_name.to_string(),
        })?;
    info!(image_name = %image_name, image_id = %image.image_id, "Found image");
    ledger.set_resource_id(Kind::Image, &key, image.image_id.clone());
    Ok(image.image_id)
}

pub(crate) fn forget_image(object: &ObjectRef, ledger: &mut Ledger, image_name: &str) {
    if !image_name.is_empty() {
        ledger.remove(Kind::Image, &image_key(object, image_name));
    }
}

/// Create a Vm and record it under `name`.
///
/// Returns `None` when the cloud reports the Vm as existing but its tag is
/// not visible yet.
pub(crate) async fn launch(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    ledger: &mut Ledger,
    name: &str,
    request: &CreateVmRequest,
) -> Result<Option<String>> {
    info!(name = %name, vm_type = %request.vm_type, subnet_id = %request.subnet_id, "Creating vm");
    let created = tolerate_exists(cloud.create_vm(request).await).map_err(object.wrap("create vm"))?;
    match created {
        Some(vm) => {
            info!(vm_id = %vm.vm_id, "Created vm");
            ledger.set_resource_id(Kind::Vm, name, vm.vm_id.clone());
            Ok(Some(vm.vm_id))
        }
        None => {
            IdentityResolver::new(cloud)
                .recover_from_tag(object, Kind::Vm, name, ledger)
                .await
        }
    }
}

/// Poll until the Vm runs.
pub(crate) async fn wait_running(
    cloud: &dyn CloudApi,
    settings: PollSettings,
    object: &ObjectRef,
    vm_id: &str,
) -> Result<Vm> {
    poll_until(
        &format!("vm {} to be running", vm_id),
        settings,
        move || async move {
            let vm = cloud.get_vm(vm_id).await.map_err(object.wrap("get vm"))?;
            match vm {
                Some(vm) if vm.state == VmState::Running => Ok(Some(vm)),
                Some(vm) => {
                    debug!(vm_id = %vm_id, state = ?vm.state, "Vm is not running yet");
                    Ok(None)
                }
                None => Err(ReconcileError::NotFound {
                    kind: Kind::Vm,
                    name: vm_id.to_string(),
                }),
            }
        },
    )
    .await
}

/// Security group rules that let the load balancer reach the Vm.
///
/// Returns `(group the rule lives on, rule)` pairs.
fn paired_rules(lb_group_id: &str, vm_group_id: &str, port: i32) -> [(String, RuleParams); 2] {
    let rule = |flow: &str, member: &str| RuleParams {
        flow: flow.to_string(),
        ip_protocol: "tcp".to_string(),
        ip_range: String::new(),
        member_security_group_id: member.to_string(),
        from_port_range: port,
        to_port_range: port,
    };
    [
        (lb_group_id.to_string(), rule(FLOW_OUTBOUND, vm_group_id)),
        (vm_group_id.to_string(), rule(FLOW_INBOUND, lb_group_id)),
    ]
}

/// Group IDs of the load balancer and of the Vm's first security group.
fn pairing_groups(scope: &MachineScope) -> Option<(String, String)> {
    let cluster = &scope.cluster;
    let lb = &cluster.spec.network().load_balancer;
    let lb_group = cluster
        .ledger
        .resource_id(
            Kind::SecurityGroup,
            &cluster.object.logical_name(&lb.security_group_name),
        )?
        .to_string();
    let vm_group = scope
        .spec
        .vm
        .security_group_names
        .first()
        .and_then(|name| {
            cluster
                .ledger
                .resource_id(Kind::SecurityGroup, &cluster.object.logical_name(name))
        })?
        .to_string();
    Some((lb_group, vm_group))
}

pub struct VmReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl VmReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }

    /// The recorded Vm, once it runs.
    pub async fn describe(&self, scope: &MachineScope) -> Result<Option<Vm>> {
        let name = scope.object.logical_name(&scope.spec.vm.name);
        let Some(vm_id) = scope.ledger.resource_id(Kind::Vm, &name) else {
            return Ok(None);
        };
        let vm = self
            .cloud
            .get_vm(vm_id)
            .await
            .map_err(scope.object.wrap("get vm"))?;
        Ok(vm.filter(|vm| vm.state == VmState::Running))
    }

    async fn build_request(&self, scope: &mut MachineScope, tag_name: &str) -> Result<CreateVmRequest> {
        let vm = &scope.spec.vm;
        let cluster = &mut scope.cluster;
        let identity = IdentityResolver::new(self.cloud.as_ref());

        let subnet_id = identity
            .dependency(
                &cluster.object,
                Kind::Subnet,
                &cluster.object.logical_name(&vm.subnet_name),
                &mut cluster.ledger,
            )
            .await?;
        let mut security_group_ids = Vec::with_capacity(vm.security_group_names.len());
        for sg in &vm.security_group_names {
            security_group_ids.push(
                identity
                    .dependency(
                        &cluster.object,
                        Kind::SecurityGroup,
                        &cluster.object.logical_name(sg),
                        &mut cluster.ledger,
                    )
                    .await?,
            );
        }

        let image_id = resolve_image(
            self.cloud.as_ref(),
            &scope.object,
            &mut scope.ledger,
            &vm.image_id,
            &vm.image_name,
            &vm.image_account_id,
        )
        .await?;

        Ok(CreateVmRequest {
            tag_name: tag_name.to_string(),
            image_id,
            vm_type: vm.vm_type.clone(),
            key_pair_name: vm.key_pair_name.clone(),
            subnet_id,
            security_group_ids,
            private_ips: vm.private_ips.clone(),
            subregion_name: vm.subregion_name.clone(),
            root_disk_type: vm.root_disk.root_disk_type.clone(),
            root_disk_size: vm.root_disk.root_disk_size,
            root_disk_iops: vm.root_disk.root_disk_iops,
        })
    }

    async fn link_volumes(&self, scope: &mut MachineScope, vm_id: &str) -> Result<()> {
        for spec in &scope.spec.volumes {
            let name = scope.object.logical_name(&spec.name);
            let volume_id = scope.ledger.require(Kind::Volume, &name)?;
            if scope.ledger.link_ids(Kind::Volume, &name).iter().any(|l| l == vm_id) {
                continue;
            }
            volume::link(
                self.cloud.as_ref(),
                &scope.object,
                self.config.volume_state_poll,
                &volume_id,
                vm_id,
                &spec.device_name,
            )
            .await?;
            scope.ledger.add_link_id(Kind::Volume, &name, vm_id);
        }
        Ok(())
    }

    /// Returns `false` when the public IP is not visible yet.
    async fn link_public_ip(&self, scope: &mut MachineScope, vm_id: &str) -> Result<bool> {
        let name = scope.object.logical_name(&scope.spec.vm.public_ip_name);
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

        info!(public_ip_id = %public_ip_id, vm_id = %vm_id, "Linking public ip");
        let link_id = tolerate_exists(self.cloud.link_public_ip(&public_ip_id, vm_id).await)
            .map_err(scope.object.wrap("link public ip"))?;
        match link_id {
            Some(link_id) => scope.ledger.add_link_id(Kind::PublicIp, &name, link_id),
            None => warn!(public_ip_id = %public_ip_id, "Public ip is linked elsewhere"),
        }
        Ok(true)
    }

    async fn attach_load_balancer(&self, scope: &mut MachineScope, vm_id: &str, vm_name: &str) -> Result<()> {
        let cluster: &ClusterScope = &scope.cluster;
        let lb = &cluster.spec.network().load_balancer;
        let lb_logical = cluster.object.logical_name(&lb.load_balancer_name);
        cluster.ledger.require(Kind::LoadBalancer, &lb_logical)?;
        let (lb_group, vm_group) = pairing_groups(scope)
            .ok_or_else(|| ReconcileError::unresolved(Kind::SecurityGroup, lb.security_group_name.clone()))?;

        info!(load_balancer = %lb.load_balancer_name, vm_id = %vm_id, "Registering vm as load balancer backend");
        self.cloud
            .link_load_balancer_backend_machines(&[vm_id.to_string()], &lb.load_balancer_name)
            .await
            .map_err(scope.object.wrap(&format!("link vm to load balancer {}", lb_logical)))?;

        for (group_id, rule) in paired_rules(&lb_group, &vm_group, lb.listener.backend_port) {
            ensure_rule(self.cloud.as_ref(), &scope.object, &group_id, &rule).await?;
        }
        scope.ledger.add_link_id(Kind::Vm, vm_name, LOAD_BALANCER_MARKER);
        Ok(())
    }

    async fn detach_load_balancer(&self, scope: &MachineScope, vm_id: &str) -> Result<()> {
        let lb = &scope.cluster.spec.network().load_balancer;
        info!(load_balancer = %lb.load_balancer_name, vm_id = %vm_id, "Deregistering vm from load balancer");
        tolerate_missing(
            self.cloud
                .unlink_load_balancer_backend_machines(&[vm_id.to_string()], &lb.load_balancer_name)
                .await,
        )
        .map_err(scope.object.wrap("unlink vm from load balancer"))?;

        let Some((lb_group, vm_group)) = pairing_groups(scope) else {
            debug!("Security groups are already deleted, no paired rule expected");
            return Ok(());
        };
        for (group_id, rule) in paired_rules(&lb_group, &vm_group, lb.listener.backend_port) {
            tolerate_missing(self.cloud.delete_security_group_rule(&group_id, &rule).await)
                .map_err(scope.object.wrap("delete security group rule"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    type Scope = MachineScope;

    async fn reconcile(&self, scope: &mut MachineScope) -> Result<Outcome> {
        let spec = &scope.spec.vm;
        let name = scope.object.logical_name(&spec.name);

        if !spec.resource_id.is_empty() {
            scope.ledger.set_resource_id(Kind::Vm, &name, &spec.resource_id);
        }

        let mut current = None;
        if let Some(vm_id) = scope.ledger.resource_id(Kind::Vm, &name).map(str::to_string) {
            let vm = self
                .cloud
                .get_vm(&vm_id)
                .await
                .map_err(scope.object.wrap("get vm"))?;
            match vm {
                Some(vm) if vm.state != VmState::Terminated => current = Some(vm),
                _ if !spec.resource_id.is_empty() => {
                    return Err(ReconcileError::NotFound { kind: Kind::Vm, name });
                }
                _ => {
                    warn!(vm_id = %vm_id, "Recorded vm is gone, recreating");
                    scope.ledger.remove(Kind::Vm, &name);
                    for volume in &scope.spec.volumes {
                        scope
                            .ledger
                            .clear_link_ids(Kind::Volume, &scope.object.logical_name(&volume.name));
                    }
                }
            }
        }

        let vm = match current {
            Some(vm) if vm.state == VmState::Running => vm,
            Some(vm) => {
                info!(vm_id = %vm.vm_id, state = ?vm.state, "Vm is not running yet");
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
        let vm_id = vm.vm_id.clone();

        self.link_volumes(scope, &vm_id).await?;

        let mut outcome = Outcome::Ready;
        if scope.spec.vm.public_ip && !self.link_public_ip(scope, &vm_id).await? {
            outcome = outcome.and(Outcome::Requeue(self.config.requeue_after()));
        }

        let markers = scope.ledger.link_ids(Kind::Vm, &name).to_vec();
        if scope.spec.vm.load_balancer_attached && !markers.iter().any(|m| m == LOAD_BALANCER_MARKER) {
            self.attach_load_balancer(scope, &vm_id, &name).await?;
        }

        if !markers.iter().any(|m| m == CCM_TAG_MARKER) {
            let key = format!("{}{}", CCM_TAG_PREFIX, scope.cluster.object.name);
            info!(vm_id = %vm_id, key = %key, "Adding CCM tag");
            self.cloud
                .add_tag(&vm_id, &key, CCM_TAG_VALUE)
                .await
                .map_err(scope.object.wrap("add ccm tag"))?;
            scope.ledger.add_link_id(Kind::Vm, &name, CCM_TAG_MARKER);
        }

        Ok(outcome)
    }

    async fn finalize(&self, scope: &mut MachineScope) -> Result<DeleteOutcome> {
        let name = scope.object.logical_name(&scope.spec.vm.name);
        let Some(vm_id) = scope.ledger.resource_id(Kind::Vm, &name).map(str::to_string) else {
            debug!(name = %name, "Vm is already deleted");
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let vm = self
            .cloud
            .get_vm(&vm_id)
            .await
            .map_err(scope.object.wrap("get vm"))?;
        let vm = match vm {
            Some(vm) if vm.state != VmState::Terminated => vm,
            _ => {
                debug!(vm_id = %vm_id, "Vm is already deleted");
                scope.ledger.remove(Kind::Vm, &name);
                return Ok(DeleteOutcome::ConvergedAbsent);
            }
        };
        if vm.tags.get(NAME_TAG_KEY) != Some(&name) {
            debug!(vm_id = %vm_id, "Vm belongs to another machine, skipping");
            scope.ledger.remove(Kind::Vm, &name);
            return Ok(DeleteOutcome::ConvergedAbsent);
        }

        if scope
            .ledger
            .link_ids(Kind::Vm, &name)
            .iter()
            .any(|m| m == LOAD_BALANCER_MARKER)
        {
            self.detach_load_balancer(scope, &vm_id).await?;
        }

        if scope.spec.vm.public_ip {
            let ip_name = scope.object.logical_name(&scope.spec.vm.public_ip_name);
            for link_id in scope.ledger.link_ids(Kind::PublicIp, &ip_name).to_vec() {
                info!(vm_id = %vm_id, link_id = %link_id, "Unlinking public ip");
                tolerate_missing(self.cloud.unlink_public_ip(&link_id).await)
                    .map_err(scope.object.wrap("unlink public ip"))?;
            }
            scope.ledger.clear_link_ids(Kind::PublicIp, &ip_name);
        }

        for spec in &scope.spec.volumes {
            let volume_name = scope.object.logical_name(&spec.name);
            if !scope.ledger.link_ids(Kind::Volume, &volume_name).iter().any(|l| *l == vm_id) {
                continue;
            }
            if let Some(volume_id) = scope.ledger.resource_id(Kind::Volume, &volume_name) {
                info!(volume_id = %volume_id, vm_id = %vm_id, "Unlinking volume");
                tolerate_missing(self.cloud.unlink_volume(volume_id).await)
                    .map_err(scope.object.wrap("unlink volume"))?;
            }
            scope.ledger.clear_link_ids(Kind::Volume, &volume_name);
        }

        info!(vm_id = %vm_id, "Deleting vm");
        let gone = deleted(self.cloud.delete_vm(&vm_id).await).map_err(scope.object.wrap("delete vm"))?;
        if !gone {
            return Ok(DeleteOutcome::StillPresent {
                requeue_after: self.config.requeue_after(),
            });
        }
        scope.ledger.remove(Kind::Vm, &name);
        forget_image(&scope.object, &mut scope.ledger, &scope.spec.vm.image_name);
        Ok(DeleteOutcome::ConvergedAbsent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_provider_id() {
        let vm = Vm {
            vm_id: "i-00000001".to_string(),
            image_id: "ami-12345678".to_string(),
            state: VmState::Running,
            private_ip: "10.0.3.10".to_string(),
            private_dns_name: "ip-10-0-3-10.eu-west-2.compute.internal".to_string(),
            subregion_name: "eu-west-2a".to_string(),
            tags: BTreeMap::new(),
        };
        assert_eq!(provider_id(&vm), "aws:///eu-west-2a/i-00000001");
    }

    #[test]
    fn test_paired_rules_point_at_each_other() {
        let [(lb_side, outbound), (vm_side, inbound)] = paired_rules("sg-lb", "sg-vm", 6443);
        assert_eq!(lb_side, "sg-lb");
        assert_eq!(outbound.flow, FLOW_OUTBOUND);
        assert_eq!(outbound.member_security_group_id, "sg-vm");
        assert_eq!(vm_side, "sg-vm");
        assert_eq!(inbound.flow, FLOW_INBOUND);
        assert_eq!(inbound.member_security_group_id, "sg-lb");
        assert_eq!(inbound.from_port_range, 6443);
    }
}
