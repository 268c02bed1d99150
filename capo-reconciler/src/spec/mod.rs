//! Desired topology declared on cluster and machine objects.
//!
//! These types are the input boundary. Empty strings and zero numbers mean
//! "not set"; [`resolve_cluster`] and [`resolve_machine`] turn a raw spec into
//! a fully-populated immutable value before any reconciler sees it.

mod defaults;

use std::ops::Deref;

use serde::{Deserialize, Serialize};

pub use defaults::{resolve_cluster, resolve_machine};

// =============================================================================
// Cluster
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSpec {
    pub network: NetworkSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSpec {
    pub net: NetSpec,
    pub subnets: Vec<SubnetSpec>,
    pub internet_service: InternetServiceSpec,
    pub public_ips: Vec<PublicIpSpec>,
    pub nat_service: NatServiceSpec,
    pub route_tables: Vec<RouteTableSpec>,
    pub security_groups: Vec<SecurityGroupSpec>,
    pub load_balancer: LoadBalancerSpec,
    pub bastion: BastionSpec,
    /// Default subregion for subnets that do not name one.
    pub subregion_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetSpec {
    pub name: String,
    pub ip_range: String,
    /// Pre-existing cloud ID (import / resume path).
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubnetSpec {
    pub name: String,
    pub ip_subnet_range: String,
    pub subregion_name: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InternetServiceSpec {
    pub name: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublicIpSpec {
    pub name: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NatServiceSpec {
    pub name: String,
    pub public_ip_name: String,
    pub subnet_name: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteTableSpec {
    pub name: String,
    /// Names of the subnets this table is linked to.
    pub subnets: Vec<String>,
    pub routes: Vec<RouteSpec>,
    pub resource_id: String,
}

pub const TARGET_GATEWAY: &str = "gateway";
pub const TARGET_NAT: &str = "nat";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteSpec {
    pub name: String,
    /// `gateway` (internet service) or `nat` (nat service).
    pub target_type: String,
    pub target_name: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityGroupSpec {
    pub name: String,
    pub description: String,
    pub security_group_rules: Vec<SecurityGroupRuleSpec>,
    /// Remove cloud-side rules that are not declared.
    pub authoritative: bool,
    pub resource_id: String,
}

pub const FLOW_INBOUND: &str = "Inbound";
pub const FLOW_OUTBOUND: &str = "Outbound";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityGroupRuleSpec {
    pub name: String,
    /// `Inbound` or `Outbound`.
    pub flow: String,
    pub ip_protocol: String,
    pub ip_range: String,
    pub from_port_range: i32,
    pub to_port_range: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub load_balancer_name: String,
    pub load_balancer_type: String,
    pub subnet_name: String,
    pub security_group_name: String,
    pub listener: ListenerSpec,
    pub health_check: HealthCheckSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerSpec {
    pub backend_port: i32,
    pub backend_protocol: String,
    pub load_balancer_port: i32,
    pub load_balancer_protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub check_interval: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    pub timeout: i32,
    pub port: i32,
    pub protocol: String,
}

/// Jump host in a public subnet, owned by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BastionSpec {
    pub enable: bool,
    pub name: String,
    pub image_id: String,
    /// Looked up by name when `image_id` is empty.
    pub image_name: String,
    pub image_account_id: String,
    pub key_pair_name: String,
    pub vm_type: String,
    pub subregion_name: String,
    pub subnet_name: String,
    pub security_group_names: Vec<String>,
    pub private_ips: Vec<String>,
    pub root_disk: RootDiskSpec,
    pub public_ip_name: String,
    pub resource_id: String,
}

// =============================================================================
// Machine
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineSpec {
    pub vm: VmSpec,
    pub volumes: Vec<VolumeSpec>,
    pub key_pair: KeyPairSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    pub image_id: String,
    /// Looked up by name when `image_id` is empty.
    pub image_name: String,
    /// Owner of the named image. Any account matches when empty.
    pub image_account_id: String,
    pub key_pair_name: String,
    pub vm_type: String,
    pub subregion_name: String,
    pub subnet_name: String,
    pub security_group_names: Vec<String>,
    pub private_ips: Vec<String>,
    pub root_disk: RootDiskSpec,
    /// Allocate a public IP and link it to the Vm.
    pub public_ip: bool,
    pub public_ip_name: String,
    /// Register the Vm as a backend of the cluster load balancer.
    pub load_balancer_attached: bool,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RootDiskSpec {
    pub root_disk_iops: i32,
    pub root_disk_size: i32,
    pub root_disk_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub device_name: String,
    pub iops: i32,
    pub size: i32,
    pub volume_type: String,
    pub subregion_name: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyPairSpec {
    pub name: String,
    pub public_key: String,
    /// Delete the keypair on teardown. Off by default since keys are shared.
    pub delete_keypair: bool,
}

// =============================================================================
// Resolved specs
// =============================================================================

/// A cluster spec with every default applied. Only [`resolve_cluster`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveClusterSpec(ClusterSpec);

impl EffectiveClusterSpec {
    pub fn network(&self) -> &NetworkSpec {
        &self.0.network
    }

    pub fn subnet(&self, name: &str) -> Option<&SubnetSpec> {
        self.0.network.subnets.iter().find(|s| s.name == name)
    }

    pub fn security_group(&self, name: &str) -> Option<&SecurityGroupSpec> {
        self.0.network.security_groups.iter().find(|s| s.name == name)
    }
}

impl Deref for EffectiveClusterSpec {
    type Target = ClusterSpec;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A machine spec with every default applied. Only [`resolve_machine`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveMachineSpec(MachineSpec);

impl Deref for EffectiveMachineSpec {
    type Target = MachineSpec;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
