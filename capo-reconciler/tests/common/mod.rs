//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use capo_reconciler::cloud::memory::MemoryCloud;
use capo_reconciler::spec::{
    ClusterSpec, EffectiveClusterSpec, EffectiveMachineSpec, KeyPairSpec, MachineSpec, VmSpec,
    VolumeSpec, resolve_cluster, resolve_machine,
};
use capo_reconciler::{
    ClusterReconciler, ClusterScope, Ledger, MachineReconciler, MachineScope, ObjectRef,
    ReconcilerConfig,
};

pub const CLUSTER_NAME: &str = "test-cluster";
pub const CLUSTER_UID: &str = "uid";
pub const MACHINE_UID: &str = "muid";

/// A memory cloud with a cluster and a machine reconciler wired to it.
pub struct TestEnv {
    pub cloud: Arc<MemoryCloud>,
    pub clusters: ClusterReconciler,
    pub machines: MachineReconciler,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ReconcilerConfig::fast())
    }

    pub fn with_config(config: ReconcilerConfig) -> Self {
        let cloud = Arc::new(MemoryCloud::new());
        Self {
            clusters: ClusterReconciler::new(cloud.clone(), config.clone()),
            machines: MachineReconciler::new(cloud.clone(), config),
            cloud,
        }
    }
}

pub fn cluster_spec(spec: ClusterSpec) -> EffectiveClusterSpec {
    resolve_cluster(spec)
}

/// Scope of a cluster with the default topology.
pub fn default_cluster() -> ClusterScope {
    cluster_scope(CLUSTER_UID, ClusterSpec::default())
}

pub fn cluster_scope(uid: &str, spec: ClusterSpec) -> ClusterScope {
    ClusterScope::new(
        ObjectRef::new("default", CLUSTER_NAME, uid),
        resolve_cluster(spec),
        Ledger::new(),
    )
}

/// A worker machine with one data volume.
pub fn worker_spec() -> MachineSpec {
    MachineSpec {
        vm: VmSpec {
            name: "test-vm".to_string(),
            image_id: "ami-12345678".to_string(),
            ..Default::default()
        },
        volumes: vec![VolumeSpec {
            name: "test-volume".to_string(),
            device_name: "/dev/xvdb".to_string(),
            size: 10,
            ..Default::default()
        }],
        key_pair: KeyPairSpec {
            name: "test-keypair".to_string(),
            ..Default::default()
        },
    }
}

/// A control plane machine: public IP and load balancer backend.
pub fn control_plane_spec() -> MachineSpec {
    let mut spec = worker_spec();
    spec.vm.name = "test-vm-kcp".to_string();
    spec.vm.subnet_name = "cluster-api-subnet-kcp".to_string();
    spec.vm.security_group_names = vec!["cluster-api-securitygroup-kcp".to_string()];
    spec.vm.public_ip = true;
    spec.vm.load_balancer_attached = true;
    spec
}

pub fn machine_spec(spec: MachineSpec) -> EffectiveMachineSpec {
    resolve_machine(spec)
}

pub fn machine_scope(spec: MachineSpec, cluster: &ClusterScope) -> MachineScope {
    MachineScope::new(
        ObjectRef::new("default", "test-machine", MACHINE_UID),
        resolve_machine(spec),
        Ledger::new(),
        cluster.clone(),
    )
}
