//! Machine pass integration tests against the in-memory cloud.

mod common;

use capo_reconciler::cloud::{
    ComputeService, SecurityService, StorageService, TagService, VmState, VolumeState,
};
use capo_reconciler::{
    ClusterScope, DeleteOutcome, Kind, MachineReconciler, Outcome, ReconcileError,
    ReconcilerConfig,
};

use common::{
    CLUSTER_NAME, TestEnv, control_plane_spec, default_cluster, machine_scope, worker_spec,
};

async fn converged_cluster(env: &TestEnv) -> ClusterScope {
    let mut cluster = default_cluster();
    let report = env.clusters.reconcile(&mut cluster).await.unwrap();
    assert_eq!(report.outcome, Outcome::Ready);
    cluster
}

// =============================================================================
// Create path
// =============================================================================

#[tokio::test]
async fn test_worker_machine_converges() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut scope = machine_scope(worker_spec(), &cluster);

    let report = env.machines.reconcile(&mut scope).await.unwrap();

    assert_eq!(report.outcome, Outcome::Ready);
    let vm_id = scope
        .ledger
        .resource_id(Kind::Vm, "test-vm-muid")
        .unwrap()
        .to_string();
    assert_eq!(
        report.provider_id.as_deref(),
        Some(format!("aws:///eu-west-2a/{}", vm_id).as_str())
    );
    assert!(report.private_dns_name.unwrap().ends_with(".compute.internal"));

    let vm = env.cloud.get_vm(&vm_id).await.unwrap().unwrap();
    assert_eq!(vm.state, VmState::Running);

    let volume_id = scope
        .ledger
        .resource_id(Kind::Volume, "test-volume-muid")
        .unwrap();
    let volume = env.cloud.get_volume(volume_id).await.unwrap().unwrap();
    assert_eq!(volume.state, VolumeState::InUse);
    assert_eq!(volume.vm_id.as_deref(), Some(vm_id.as_str()));
    assert_eq!(volume.device_name.as_deref(), Some("/dev/xvdb"));

    let ccm = env
        .cloud
        .read_tag(&format!("OscK8sClusterID/{}", CLUSTER_NAME), "owned")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ccm.resource_id, vm_id);

    assert_eq!(env.cloud.calls("create_key_pair").await, 1);
    assert!(scope.ledger.contains(Kind::KeyPair, "test-keypair-muid"));
}

#[tokio::test]
async fn test_second_machine_pass_is_a_no_op() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut scope = machine_scope(control_plane_spec(), &cluster);
    env.machines.reconcile(&mut scope).await.unwrap();
    let ledger = scope.ledger.clone();
    env.cloud.reset_calls().await;

    let report = env.machines.reconcile(&mut scope).await.unwrap();

    assert_eq!(report.outcome, Outcome::Ready);
    assert!(report.provider_id.is_some());
    assert_eq!(scope.ledger, ledger);
    assert_eq!(env.cloud.calls_with_prefix("create_").await, 0);
    assert_eq!(env.cloud.calls_with_prefix("link_").await, 0);
    assert_eq!(env.cloud.calls("add_tag").await, 0);
}

#[tokio::test]
async fn test_control_plane_machine_joins_the_load_balancer() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut scope = machine_scope(control_plane_spec(), &cluster);

    env.machines.reconcile(&mut scope).await.unwrap();

    let vm_id = scope
        .ledger
        .resource_id(Kind::Vm, "test-vm-kcp-muid")
        .unwrap()
        .to_string();
    let lb = env.cloud.load_balancer("OscClusterApi-1").await.unwrap();
    assert_eq!(lb.backend_vm_ids, vec![vm_id.clone()]);

    let lb_group = cluster
        .ledger
        .resource_id(Kind::SecurityGroup, "cluster-api-securitygroup-lb-uid")
        .unwrap();
    let kcp_group = cluster
        .ledger
        .resource_id(Kind::SecurityGroup, "cluster-api-securitygroup-kcp-uid")
        .unwrap();
    let lb_sg = env.cloud.get_security_group(lb_group).await.unwrap().unwrap();
    assert!(lb_sg
        .outbound_rules
        .iter()
        .any(|r| r.member_security_group_id == kcp_group && r.from_port_range == 6443));
    let kcp_sg = env.cloud.get_security_group(kcp_group).await.unwrap().unwrap();
    assert!(kcp_sg
        .inbound_rules
        .iter()
        .any(|r| r.member_security_group_id == lb_group));

    // The machine public IP is linked and its link recorded.
    assert_eq!(
        scope
            .ledger
            .link_ids(Kind::PublicIp, "test-vm-kcp-publicip-muid")
            .len(),
        1
    );
}

#[tokio::test]
async fn test_machine_waits_for_its_cluster() {
    let env = TestEnv::new();
    let cluster = default_cluster();
    let mut scope = machine_scope(worker_spec(), &cluster);

    let err = env.machines.reconcile(&mut scope).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::DependencyUnresolved {
            kind: Kind::Subnet,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(env.cloud.calls("create_vm").await, 0);
}

#[tokio::test]
async fn test_invalid_image_is_rejected_before_any_call() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut spec = worker_spec();
    spec.vm.image_id = "ubuntu".to_string();
    let mut scope = machine_scope(spec, &cluster);
    env.cloud.reset_calls().await;

    let err = env.machines.reconcile(&mut scope).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    assert_eq!(env.cloud.calls_with_prefix("").await, 0);
}

#[tokio::test]
async fn test_terminated_vm_is_replaced() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut spec = worker_spec();
    spec.volumes.clear();
    let mut scope = machine_scope(spec, &cluster);
    env.machines.reconcile(&mut scope).await.unwrap();
    let old_vm = scope
        .ledger
        .resource_id(Kind::Vm, "test-vm-muid")
        .unwrap()
        .to_string();
    env.cloud.set_vm_state(&old_vm, VmState::Terminated).await;
    env.cloud.reset_calls().await;

    let report = env.machines.reconcile(&mut scope).await.unwrap();

    assert_eq!(report.outcome, Outcome::Ready);
    assert_eq!(env.cloud.calls("create_vm").await, 1);
    let new_vm = scope.ledger.resource_id(Kind::Vm, "test-vm-muid").unwrap();
    assert_ne!(new_vm, old_vm);
}

#[tokio::test]
async fn test_image_is_found_by_name() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let image_id = env.cloud.register_image("ubuntu-2204-kubernetes", "123456789012").await;
    let mut spec = worker_spec();
    spec.volumes.clear();
    spec.vm.image_id.clear();
    spec.vm.image_name = "ubuntu-2204-kubernetes".to_string();
    spec.vm.image_account_id = "123456789012".to_string();
    let mut scope = machine_scope(spec, &cluster);

    let report = env.machines.reconcile(&mut scope).await.unwrap();

    assert_eq!(report.outcome, Outcome::Ready);
    let vm_id = scope.ledger.resource_id(Kind::Vm, "test-vm-muid").unwrap();
    let vm = env.cloud.get_vm(vm_id).await.unwrap().unwrap();
    assert_eq!(vm.image_id, image_id);
    assert_eq!(
        scope.ledger.resource_id(Kind::Image, "ubuntu-2204-kubernetes-muid"),
        Some(image_id.as_str())
    );
    assert_eq!(env.cloud.calls("get_image_by_name").await, 1);

    // The recorded image is reused, and forgotten with the Vm.
    env.machines.reconcile(&mut scope).await.unwrap();
    assert_eq!(env.cloud.calls("get_image_by_name").await, 1);
    let outcome = env.machines.delete(&mut scope).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::ConvergedAbsent);
    assert!(scope.ledger.is_empty());
}

#[tokio::test]
async fn test_unknown_image_name_is_not_found() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    env.cloud.register_image("ubuntu-2204-kubernetes", "123456789012").await;
    let mut spec = worker_spec();
    spec.volumes.clear();
    spec.vm.image_id.clear();
    spec.vm.image_name = "ubuntu-2204-kubernetes".to_string();
    spec.vm.image_account_id = "999999999999".to_string();
    let mut scope = machine_scope(spec, &cluster);

    let err = env.machines.reconcile(&mut scope).await.unwrap_err();

    assert!(matches!(err, ReconcileError::NotFound { kind: Kind::Image, .. }));
    assert_eq!(env.cloud.calls("create_vm").await, 0);
    assert!(!scope.ledger.contains(Kind::Vm, "test-vm-muid"));
}

#[tokio::test]
async fn test_stopped_vm_reports_no_provider_id() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut spec = worker_spec();
    spec.volumes.clear();
    let mut scope = machine_scope(spec, &cluster);
    let report = env.machines.reconcile(&mut scope).await.unwrap();
    assert!(report.provider_id.is_some());
    let vm_id = scope
        .ledger
        .resource_id(Kind::Vm, "test-vm-muid")
        .unwrap()
        .to_string();
    env.cloud.set_vm_state(&vm_id, VmState::Stopped).await;

    let report = env.machines.reconcile(&mut scope).await.unwrap();

    assert!(matches!(report.outcome, Outcome::Requeue(_)));
    assert_eq!(report.provider_id, None);
    assert_eq!(report.private_dns_name, None);

    env.cloud.set_vm_state(&vm_id, VmState::Running).await;
    let report = env.machines.reconcile(&mut scope).await.unwrap();
    assert_eq!(report.outcome, Outcome::Ready);
    assert_eq!(
        report.provider_id.as_deref(),
        Some(format!("aws:///eu-west-2a/{}", vm_id).as_str())
    );
}

#[tokio::test]
async fn test_pass_deadline() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let config = ReconcilerConfig {
        pass_deadline_ms: 1,
        ..ReconcilerConfig::fast()
    };
    let machines = MachineReconciler::new(env.cloud.clone(), config);
    let mut spec = worker_spec();
    spec.volumes.clear();
    let mut scope = machine_scope(spec, &cluster);

    // The Vm boots through `Pending`, so the pass has to wait for it.
    let err = machines.reconcile(&mut scope).await.unwrap_err();

    assert!(matches!(err, ReconcileError::DeadlineExceeded(_)));
    assert!(err.is_retryable());
}

// =============================================================================
// Delete path
// =============================================================================

#[tokio::test]
async fn test_machine_teardown_releases_everything_it_used() {
    let env = TestEnv::new();
    let mut cluster = converged_cluster(&env).await;
    let mut scope = machine_scope(control_plane_spec(), &cluster);
    env.machines.reconcile(&mut scope).await.unwrap();
    let objects_before = env.cloud.object_count().await;

    let outcome = env.machines.delete(&mut scope).await.unwrap();

    assert_eq!(outcome, DeleteOutcome::ConvergedAbsent);
    assert!(scope.ledger.is_empty());
    let lb = env.cloud.load_balancer("OscClusterApi-1").await.unwrap();
    assert!(lb.backend_vm_ids.is_empty());
    let kcp_group = cluster
        .ledger
        .resource_id(Kind::SecurityGroup, "cluster-api-securitygroup-kcp-uid")
        .unwrap();
    let kcp_sg = env.cloud.get_security_group(kcp_group).await.unwrap().unwrap();
    assert!(kcp_sg
        .inbound_rules
        .iter()
        .all(|r| r.member_security_group_id.is_empty()));
    // Vm, volume and public IP are gone; the shared keypair stays.
    assert_eq!(env.cloud.object_count().await, objects_before - 3);

    let outcome = env.clusters.delete(&mut cluster).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::ConvergedAbsent);
    assert_eq!(env.cloud.object_count().await, 1);
}

#[tokio::test]
async fn test_keypair_is_deleted_on_request() {
    let env = TestEnv::new();
    let mut cluster = converged_cluster(&env).await;
    let mut spec = worker_spec();
    spec.key_pair.delete_keypair = true;
    let mut scope = machine_scope(spec, &cluster);
    env.machines.reconcile(&mut scope).await.unwrap();

    let outcome = env.machines.delete(&mut scope).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::ConvergedAbsent);
    assert_eq!(env.cloud.calls("delete_key_pair").await, 1);

    env.clusters.delete(&mut cluster).await.unwrap();
    assert_eq!(env.cloud.object_count().await, 0);
}

#[tokio::test]
async fn test_vm_of_another_machine_is_not_deleted() {
    let env = TestEnv::new();
    let cluster = converged_cluster(&env).await;
    let mut spec = worker_spec();
    spec.volumes.clear();
    let mut ours = machine_scope(spec.clone(), &cluster);
    env.machines.reconcile(&mut ours).await.unwrap();
    let vm_id = ours
        .ledger
        .resource_id(Kind::Vm, "test-vm-muid")
        .unwrap()
        .to_string();

    // A stale ledger of a different machine points at our Vm.
    let mut stale = machine_scope(spec, &cluster);
    stale.object.uid = "other".to_string();
    stale.ledger.set_resource_id(Kind::Vm, "test-vm-other", vm_id.clone());
    env.cloud.reset_calls().await;

    let outcome = env.machines.delete(&mut stale).await.unwrap();

    assert_eq!(outcome, DeleteOutcome::ConvergedAbsent);
    assert_eq!(env.cloud.calls("delete_vm").await, 0);
    let vm = env.cloud.get_vm(&vm_id).await.unwrap().unwrap();
    assert_ne!(vm.state, VmState::Terminated);
}
