//! Cloud API client contract.
//!
//! The reconcilers only talk to the cloud through these traits:
//! - [`NetService`]: nets, subnets, internet services, nat services, route tables
//! - [`SecurityService`]: security groups and rules, public IPs, keypairs
//! - [`LoadBalancerService`]: load balancers and their backends
//! - [`ComputeService`]: virtual machines
//! - [`ImageService`]: machine images
//! - [`StorageService`]: volumes
//! - [`TagService`]: tag lookups used for identity recovery
//!
//! `get_*` calls return `Ok(None)` when the object does not exist; an error is
//! only returned for transport or validation failures.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::spec::{LoadBalancerSpec, NetSpec, SubnetSpec, VolumeSpec};

/// Key of the tag carrying a resource's logical name.
pub const NAME_TAG_KEY: &str = "Name";

/// Errors returned by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Create rejected because the object (or rule, or link) already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The object is still referenced by another one.
    #[error("dependency violation: {0}")]
    DependencyViolation(String),

    #[error("api error {code}: {message}")]
    Api { code: String, message: String },

    #[error("transport: {0}")]
    Transport(String),
}

// =============================================================================
// Cloud objects
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Net {
    pub net_id: String,
    pub ip_range: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub subnet_id: String,
    pub net_id: String,
    pub ip_range: String,
    pub subregion_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternetService {
    pub internet_service_id: String,
    /// Net the internet service is linked to, if any.
    pub net_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatService {
    pub nat_service_id: String,
    pub subnet_id: String,
    pub public_ip_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIp {
    pub public_ip_id: String,
    pub public_ip: String,
    pub link_public_ip_id: Option<String>,
    pub vm_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    pub route_table_id: String,
    pub net_id: String,
    pub routes: Vec<Route>,
    pub links: Vec<RouteTableLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination_ip_range: String,
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableLink {
    pub link_route_table_id: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub security_group_id: String,
    pub security_group_name: String,
    pub net_id: String,
    pub inbound_rules: Vec<SecurityGroupRule>,
    pub outbound_rules: Vec<SecurityGroupRule>,
}

/// One rule of a security group. Either `ip_range` or `member_security_group_id` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRule {
    pub ip_protocol: String,
    pub ip_range: String,
    pub member_security_group_id: String,
    pub from_port_range: i32,
    pub to_port_range: i32,
}

/// Parameters of a rule create/delete/lookup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleParams {
    pub flow: String,
    pub ip_protocol: String,
    pub ip_range: String,
    pub member_security_group_id: String,
    pub from_port_range: i32,
    pub to_port_range: i32,
}

impl RuleParams {
    pub fn matches(&self, rule: &SecurityGroupRule) -> bool {
        rule.ip_protocol == self.ip_protocol
            && rule.ip_range == self.ip_range
            && rule.member_security_group_id == self.member_security_group_id
            && rule.from_port_range == self.from_port_range
            && rule.to_port_range == self.to_port_range
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub load_balancer_name: String,
    pub dns_name: String,
    pub backend_vm_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub health_check_configured: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    pub vm_id: String,
    pub image_id: String,
    pub state: VmState,
    pub private_ip: String,
    pub private_dns_name: String,
    pub subregion_name: String,
    pub tags: BTreeMap<String, String>,
}

/// Everything needed to launch a Vm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub tag_name: String,
    pub image_id: String,
    pub vm_type: String,
    pub key_pair_name: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub private_ips: Vec<String>,
    pub subregion_name: String,
    pub root_disk_type: String,
    pub root_disk_size: i32,
    pub root_disk_iops: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub image_id: String,
    pub image_name: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub state: VolumeState,
    pub vm_id: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub key_pair_name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub resource_id: String,
    pub key: String,
    pub value: String,
}

// =============================================================================
// Service traits
// =============================================================================

pub type CloudResult<T> = std::result::Result<T, CloudError>;

#[async_trait]
pub trait NetService: Send + Sync {
    async fn create_net(&self, spec: &NetSpec, tag_name: &str) -> CloudResult<Net>;
    async fn get_net(&self, net_id: &str) -> CloudResult<Option<Net>>;
    async fn delete_net(&self, net_id: &str) -> CloudResult<()>;

    async fn create_subnet(
        &self,
        spec: &SubnetSpec,
        net_id: &str,
        tag_name: &str,
    ) -> CloudResult<Subnet>;
    async fn get_subnet_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>>;
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    async fn create_internet_service(&self, tag_name: &str) -> CloudResult<InternetService>;
    async fn get_internet_service(
        &self,
        internet_service_id: &str,
    ) -> CloudResult<Option<InternetService>>;
    async fn link_internet_service(&self, internet_service_id: &str, net_id: &str)
    -> CloudResult<()>;
    async fn unlink_internet_service(
        &self,
        internet_service_id: &str,
        net_id: &str,
    ) -> CloudResult<()>;
    async fn delete_internet_service(&self, internet_service_id: &str) -> CloudResult<()>;

    async fn create_nat_service(
        &self,
        public_ip_id: &str,
        subnet_id: &str,
        tag_name: &str,
    ) -> CloudResult<NatService>;
    async fn get_nat_service(&self, nat_service_id: &str) -> CloudResult<Option<NatService>>;
    async fn delete_nat_service(&self, nat_service_id: &str) -> CloudResult<()>;

    async fn create_route_table(&self, net_id: &str, tag_name: &str) -> CloudResult<RouteTable>;
    async fn get_route_table(&self, route_table_id: &str) -> CloudResult<Option<RouteTable>>;
    async fn get_route_table_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>>;
    /// Link a route table to a subnet, returning the link ID.
    async fn link_route_table(&self, route_table_id: &str, subnet_id: &str)
    -> CloudResult<String>;
    async fn unlink_route_table(&self, link_route_table_id: &str) -> CloudResult<()>;
    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()>;

    async fn create_route(
        &self,
        destination_ip_range: &str,
        route_table_id: &str,
        target_id: &str,
        target_type: &str,
    ) -> CloudResult<RouteTable>;
    async fn delete_route(&self, destination_ip_range: &str, route_table_id: &str)
    -> CloudResult<()>;
}

#[async_trait]
pub trait SecurityService: Send + Sync {
    async fn create_security_group(
        &self,
        net_id: &str,
        tag_name: &str,
        description: &str,
    ) -> CloudResult<SecurityGroup>;
    async fn get_security_group(
        &self,
        security_group_id: &str,
    ) -> CloudResult<Option<SecurityGroup>>;
    async fn get_security_group_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>>;
    async fn delete_security_group(&self, security_group_id: &str) -> CloudResult<()>;

    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<SecurityGroup>;
    /// The security group, if it carries a rule matching `rule`.
    async fn get_security_group_from_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<Option<SecurityGroup>>;
    async fn delete_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<()>;

    async fn create_public_ip(&self, tag_name: &str) -> CloudResult<PublicIp>;
    async fn get_public_ip(&self, public_ip_id: &str) -> CloudResult<Option<PublicIp>>;
    /// The subset of `public_ip_ids` that still exist.
    async fn validate_public_ip_ids(&self, public_ip_ids: &[String]) -> CloudResult<Vec<String>>;
    /// Link a public IP to a Vm, returning the link ID.
    async fn link_public_ip(&self, public_ip_id: &str, vm_id: &str) -> CloudResult<String>;
    async fn unlink_public_ip(&self, link_public_ip_id: &str) -> CloudResult<()>;
    async fn delete_public_ip(&self, public_ip_id: &str) -> CloudResult<()>;

    async fn create_key_pair(&self, name: &str, public_key: &str) -> CloudResult<KeyPair>;
    async fn get_key_pair(&self, name: &str) -> CloudResult<Option<KeyPair>>;
    async fn delete_key_pair(&self, name: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        subnet_id: &str,
        security_group_id: &str,
        tag_name: &str,
    ) -> CloudResult<LoadBalancer>;
    async fn get_load_balancer(&self, name: &str) -> CloudResult<Option<LoadBalancer>>;
    async fn configure_health_check(&self, spec: &LoadBalancerSpec) -> CloudResult<LoadBalancer>;
    async fn link_load_balancer_backend_machines(
        &self,
        vm_ids: &[String],
        name: &str,
    ) -> CloudResult<()>;
    async fn unlink_load_balancer_backend_machines(
        &self,
        vm_ids: &[String],
        name: &str,
    ) -> CloudResult<()>;
    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn create_vm(&self, request: &CreateVmRequest) -> CloudResult<Vm>;
    async fn get_vm(&self, vm_id: &str) -> CloudResult<Option<Vm>>;
    async fn delete_vm(&self, vm_id: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait ImageService: Send + Sync {
    /// First image called `name`, restricted to `account_id` unless it is empty.
    async fn get_image_by_name(&self, name: &str, account_id: &str) -> CloudResult<Option<Image>>;
}

#[async_trait]
pub trait StorageService: Send + Sync {
    async fn create_volume(&self, spec: &VolumeSpec, tag_name: &str) -> CloudResult<Volume>;
    async fn get_volume(&self, volume_id: &str) -> CloudResult<Option<Volume>>;
    async fn link_volume(&self, volume_id: &str, vm_id: &str, device_name: &str)
    -> CloudResult<()>;
    async fn unlink_volume(&self, volume_id: &str) -> CloudResult<()>;
    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait TagService: Send + Sync {
    /// Find the resource carrying tag `key=value`.
    async fn read_tag(&self, key: &str, value: &str) -> CloudResult<Option<Tag>>;
    async fn add_tag(&self, resource_id: &str, key: &str, value: &str) -> CloudResult<()>;
}

/// The full cloud API surface used by the reconcilers.
pub trait CloudApi:
    NetService
    + SecurityService
    + LoadBalancerService
    + ComputeService
    + ImageService
    + StorageService
    + TagService
{
}

impl<T> CloudApi for T where
    T: NetService
        + SecurityService
        + LoadBalancerService
        + ComputeService
        + ImageService
        + StorageService
        + TagService
{
}
