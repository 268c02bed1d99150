//! The shipped demo documents stay valid and converge.

mod common;

use std::path::PathBuf;

use capo_reconciler::spec::{ClusterSpec, MachineSpec, resolve_cluster, resolve_machine};
use capo_reconciler::validation::{validate_cluster, validate_machine};
use capo_reconciler::{
    ClusterScope, DeleteOutcome, Ledger, MachineScope, ObjectRef, Outcome, ReconcilerConfig,
    load_document,
};

use common::TestEnv;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

#[test]
fn test_demo_documents_are_valid() {
    let cluster = resolve_cluster(load_document::<ClusterSpec>(&demo("cluster.yaml")).unwrap());
    let machine = resolve_machine(load_document::<MachineSpec>(&demo("machine.yaml")).unwrap());
    let config: ReconcilerConfig = load_document(&demo("config.yaml")).unwrap();

    validate_cluster(&cluster).unwrap();
    validate_machine(&machine, &cluster).unwrap();
    assert_eq!(config.requeue_after_ms, 1000);
    assert_eq!(cluster.network().load_balancer.listener.backend_port, 6443);
}

#[tokio::test]
async fn test_demo_topology_round_trip() {
    let env = TestEnv::new();
    let spec = resolve_cluster(load_document::<ClusterSpec>(&demo("cluster.yaml")).unwrap());
    let mut cluster = ClusterScope::new(ObjectRef::new("demo", "demo", "1234"), spec, Ledger::new());

    let report = env.clusters.reconcile(&mut cluster).await.unwrap();
    assert_eq!(report.outcome, Outcome::Ready);
    assert_eq!(
        report.control_plane_endpoint.as_deref(),
        Some("demo-k8s.lbu.memory.internal:6443")
    );

    let spec = resolve_machine(load_document::<MachineSpec>(&demo("machine.yaml")).unwrap());
    let mut machine = MachineScope::new(
        ObjectRef::new("demo", "demo-kcp", "5678"),
        spec,
        Ledger::new(),
        cluster.clone(),
    );
    let report = env.machines.reconcile(&mut machine).await.unwrap();
    assert_eq!(report.outcome, Outcome::Ready);

    machine.cluster = cluster.clone();
    assert_eq!(
        env.machines.delete(&mut machine).await.unwrap(),
        DeleteOutcome::ConvergedAbsent
    );
    assert_eq!(
        env.clusters.delete(&mut cluster).await.unwrap(),
        DeleteOutcome::ConvergedAbsent
    );
    // The keypair is shared and kept.
    assert_eq!(env.cloud.object_count().await, 1);
}
