//! In-memory cloud used by the `simulate` command and the test suite.
//!
//! Behaves like an eventually consistent provider in the ways the reconcilers
//! care about: Vms boot through `Pending`, volumes through `Creating`, deletes
//! of referenced objects fail with a dependency violation, duplicate rules and
//! routes are rejected as already existing. Every call is counted and any
//! operation can be made to fail.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use super::*;
use crate::spec::{LoadBalancerSpec, NetSpec, SubnetSpec, VolumeSpec};

#[derive(Debug, Clone)]
struct StoredSecurityGroup {
    group: SecurityGroup,
}

#[derive(Default)]
struct State {
    next_id: u64,
    calls: BTreeMap<&'static str, usize>,
    failures: BTreeMap<&'static str, CloudError>,
    nets: BTreeMap<String, Net>,
    subnets: BTreeMap<String, Subnet>,
    internet_services: BTreeMap<String, InternetService>,
    nat_services: BTreeMap<String, NatService>,
    public_ips: BTreeMap<String, PublicIp>,
    route_tables: BTreeMap<String, RouteTable>,
    security_groups: BTreeMap<String, StoredSecurityGroup>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    vms: BTreeMap<String, Vm>,
    volumes: BTreeMap<String, Volume>,
    key_pairs: BTreeMap<String, KeyPair>,
    images: BTreeMap<String, Image>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
}

impl State {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    fn tag_name(&mut self, resource_id: &str, name: &str) {
        self.tags
            .entry(resource_id.to_string())
            .or_default()
            .insert(NAME_TAG_KEY.to_string(), name.to_string());
    }
}

/// A provider that keeps every object in memory.
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<State>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `op` was called.
    pub async fn calls(&self, op: &str) -> usize {
        self.state.lock().await.calls.get(op).copied().unwrap_or(0)
    }

    /// Total number of calls whose name starts with `prefix` (e.g. `"create_"`).
    pub async fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(op, _)| op.starts_with(prefix))
            .map(|(_, n)| n)
            .sum()
    }

    pub async fn reset_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Make every subsequent call of `op` fail with `error`.
    pub async fn fail(&self, op: &'static str, error: CloudError) {
        self.state.lock().await.failures.insert(op, error);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Force the state of a Vm, e.g. to simulate external drift.
    pub async fn set_vm_state(&self, vm_id: &str, state: VmState) {
        if let Some(vm) = self.state.lock().await.vms.get_mut(vm_id) {
            vm.state = state;
        }
    }

    /// Remove an object behind the reconciler's back.
    pub async fn forget(&self, resource_id: &str) {
        let mut s = self.state.lock().await;
        s.nets.remove(resource_id);
        s.subnets.remove(resource_id);
        s.internet_services.remove(resource_id);
        s.nat_services.remove(resource_id);
        s.public_ips.remove(resource_id);
        s.route_tables.remove(resource_id);
        s.security_groups.remove(resource_id);
        s.load_balancers.remove(resource_id);
        s.vms.remove(resource_id);
        s.volumes.remove(resource_id);
        s.tags.remove(resource_id);
    }

    /// Number of live objects (terminated Vms excluded).
    pub async fn object_count(&self) -> usize {
        let s = self.state.lock().await;
        s.nets.len()
            + s.subnets.len()
            + s.internet_services.len()
            + s.nat_services.len()
            + s.public_ips.len()
            + s.route_tables.len()
            + s.security_groups.len()
            + s.load_balancers.len()
            + s.vms.values().filter(|v| v.state != VmState::Terminated).count()
            + s.volumes.len()
            + s.key_pairs.len()
    }

    /// Publish an image, bypassing call accounting. Returns its ID.
    pub async fn register_image(&self, name: &str, account_id: &str) -> String {
        let mut s = self.state.lock().await;
        s.next_id += 1;
        let image_id = format!("ami-{:08x}", s.next_id);
        s.images.insert(
            image_id.clone(),
            Image {
                image_id: image_id.clone(),
                image_name: name.to_string(),
                account_id: account_id.to_string(),
            },
        );
        image_id
    }

    pub async fn load_balancer(&self, name: &str) -> Option<LoadBalancer> {
        self.state.lock().await.load_balancers.get(name).cloned()
    }

    /// Attach a tag, bypassing call accounting.
    pub async fn set_tag(&self, resource_id: &str, key: &str, value: &str) {
        let mut s = self.state.lock().await;
        if let Some(lb) = s.load_balancers.get_mut(resource_id) {
            lb.tags.insert(key.to_string(), value.to_string());
        }
        s.tags
            .entry(resource_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    async fn begin(&self, op: &'static str) -> CloudResult<MutexGuard<'_, State>> {
        let mut s = self.state.lock().await;
        *s.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = s.failures.get(op) {
            return Err(err.clone());
        }
        Ok(s)
    }
}

fn not_found(what: &str, id: &str) -> CloudError {
    CloudError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl NetService for MemoryCloud {
    async fn create_net(&self, spec: &NetSpec, tag_name: &str) -> CloudResult<Net> {
        let mut s = self.begin("create_net").await?;
        let net = Net {
            net_id: s.new_id("vpc"),
            ip_range: spec.ip_range.clone(),
        };
        s.tag_name(&net.net_id, tag_name);
        s.nets.insert(net.net_id.clone(), net.clone());
        Ok(net)
    }

    async fn get_net(&self, net_id: &str) -> CloudResult<Option<Net>> {
        let s = self.begin("get_net").await?;
        Ok(s.nets.get(net_id).cloned())
    }

    async fn delete_net(&self, net_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_net").await?;
        let in_use = s.subnets.values().any(|x| x.net_id == net_id)
            || s.route_tables.values().any(|x| x.net_id == net_id)
            || s.security_groups.values().any(|x| x.group.net_id == net_id)
            || s
                .internet_services
                .values()
                .any(|x| x.net_id.as_deref() == Some(net_id));
        if in_use {
            return Err(CloudError::DependencyViolation(format!("net {} is in use", net_id)));
        }
        s.nets.remove(net_id).ok_or_else(|| not_found("net", net_id))?;
        s.tags.remove(net_id);
        Ok(())
    }

    async fn create_subnet(
        &self,
        spec: &SubnetSpec,
        net_id: &str,
        tag_name: &str,
    ) -> CloudResult<Subnet> {
        let mut s = self.begin("create_subnet").await?;
        if !s.nets.contains_key(net_id) {
            return Err(not_found("net", net_id));
        }
        if s
            .subnets
            .values()
            .any(|x| x.net_id == net_id && x.ip_range == spec.ip_subnet_range)
        {
            return Err(CloudError::AlreadyExists(format!(
                "subnet {} in {}",
                spec.ip_subnet_range, net_id
            )));
        }
        let subnet = Subnet {
            subnet_id: s.new_id("subnet"),
            net_id: net_id.to_string(),
            ip_range: spec.ip_subnet_range.clone(),
            subregion_name: spec.subregion_name.clone(),
        };
        s.tag_name(&subnet.subnet_id, tag_name);
        s.subnets.insert(subnet.subnet_id.clone(), subnet.clone());
        Ok(subnet)
    }

    async fn get_subnet_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>> {
        let s = self.begin("get_subnet_ids_from_net_ids").await?;
        Ok(s.subnets
            .values()
            .filter(|x| x.net_id == net_id)
            .map(|x| x.subnet_id.clone())
            .collect())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_subnet").await?;
        let in_use = s.nat_services.values().any(|x| x.subnet_id == subnet_id)
            || s
                .route_tables
                .values()
                .any(|x| x.links.iter().any(|l| l.subnet_id == subnet_id));
        if in_use {
            return Err(CloudError::DependencyViolation(format!(
                "subnet {} is in use",
                subnet_id
            )));
        }
        s.subnets
            .remove(subnet_id)
            .ok_or_else(|| not_found("subnet", subnet_id))?;
        s.tags.remove(subnet_id);
        Ok(())
    }

    async fn create_internet_service(&self, tag_name: &str) -> CloudResult<InternetService> {
        let mut s = self.begin("create_internet_service").await?;
        let is = InternetService {
            internet_service_id: s.new_id("igw"),
            net_id: None,
        };
        s.tag_name(&is.internet_service_id, tag_name);
        s.internet_services
            .insert(is.internet_service_id.clone(), is.clone());
        Ok(is)
    }

    async fn get_internet_service(
        &self,
        internet_service_id: &str,
    ) -> CloudResult<Option<InternetService>> {
        let s = self.begin("get_internet_service").await?;
        Ok(s.internet_services.get(internet_service_id).cloned())
    }

    async fn link_internet_service(
        &self,
        internet_service_id: &str,
        net_id: &str,
    ) -> CloudResult<()> {
        let mut s = self.begin("link_internet_service").await?;
        let is = s
            .internet_services
            .get_mut(internet_service_id)
            .ok_or_else(|| not_found("internet service", internet_service_id))?;
        match &is.net_id {
            Some(linked) if linked == net_id => Err(CloudError::AlreadyExists(format!(
                "internet service {} already linked to {}",
                internet_service_id, net_id
            ))),
            Some(linked) => Err(CloudError::Api {
                code: "Resource.AlreadyLinked".to_string(),
                message: format!("linked to {}", linked),
            }),
            None => {
                is.net_id = Some(net_id.to_string());
                Ok(())
            }
        }
    }

    async fn unlink_internet_service(
        &self,
        internet_service_id: &str,
        net_id: &str,
    ) -> CloudResult<()> {
        let mut s = self.begin("unlink_internet_service").await?;
        let is = s
            .internet_services
            .get_mut(internet_service_id)
            .ok_or_else(|| not_found("internet service", internet_service_id))?;
        if is.net_id.as_deref() != Some(net_id) {
            return Err(not_found("internet service link", internet_service_id));
        }
        is.net_id = None;
        Ok(())
    }

    async fn delete_internet_service(&self, internet_service_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_internet_service").await?;
        let linked = s
            .internet_services
            .get(internet_service_id)
            .ok_or_else(|| not_found("internet service", internet_service_id))?
            .net_id
            .is_some();
        if linked {
            return Err(CloudError::DependencyViolation(format!(
                "internet service {} is linked",
                internet_service_id
            )));
        }
        s.internet_services.remove(internet_service_id);
        s.tags.remove(internet_service_id);
        Ok(())
    }

    async fn create_nat_service(
        &self,
        public_ip_id: &str,
        subnet_id: &str,
        tag_name: &str,
    ) -> CloudResult<NatService> {
        let mut s = self.begin("create_nat_service").await?;
        if !s.subnets.contains_key(subnet_id) {
            return Err(not_found("subnet", subnet_id));
        }
        if !s.public_ips.contains_key(public_ip_id) {
            return Err(not_found("public ip", public_ip_id));
        }
        let nat = NatService {
            nat_service_id: s.new_id("nat"),
            subnet_id: subnet_id.to_string(),
            public_ip_id: public_ip_id.to_string(),
        };
        s.tag_name(&nat.nat_service_id, tag_name);
        s.nat_services.insert(nat.nat_service_id.clone(), nat.clone());
        Ok(nat)
    }

    async fn get_nat_service(&self, nat_service_id: &str) -> CloudResult<Option<NatService>> {
        let s = self.begin("get_nat_service").await?;
        Ok(s.nat_services.get(nat_service_id).cloned())
    }

    async fn delete_nat_service(&self, nat_service_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_nat_service").await?;
        s.nat_services
            .remove(nat_service_id)
            .ok_or_else(|| not_found("nat service", nat_service_id))?;
        s.tags.remove(nat_service_id);
        Ok(())
    }

    async fn create_route_table(&self, net_id: &str, tag_name: &str) -> CloudResult<RouteTable> {
        let mut s = self.begin("create_route_table").await?;
        if !s.nets.contains_key(net_id) {
            return Err(not_found("net", net_id));
        }
        let rt = RouteTable {
            route_table_id: s.new_id("rtb"),
            net_id: net_id.to_string(),
            routes: Vec::new(),
            links: Vec::new(),
        };
        s.tag_name(&rt.route_table_id, tag_name);
        s.route_tables.insert(rt.route_table_id.clone(), rt.clone());
        Ok(rt)
    }

    async fn get_route_table(&self, route_table_id: &str) -> CloudResult<Option<RouteTable>> {
        let s = self.begin("get_route_table").await?;
        Ok(s.route_tables.get(route_table_id).cloned())
    }

    async fn get_route_table_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>> {
        let s = self.begin("get_route_table_ids_from_net_ids").await?;
        Ok(s.route_tables
            .values()
            .filter(|x| x.net_id == net_id)
            .map(|x| x.route_table_id.clone())
            .collect())
    }

    async fn link_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> CloudResult<String> {
        let mut s = self.begin("link_route_table").await?;
        if !s.subnets.contains_key(subnet_id) {
            return Err(not_found("subnet", subnet_id));
        }
        if s
            .route_tables
            .values()
            .any(|rt| rt.links.iter().any(|l| l.subnet_id == subnet_id))
        {
            return Err(CloudError::AlreadyExists(format!(
                "subnet {} already has a route table",
                subnet_id
            )));
        }
        let link_id = s.new_id("rtbassoc");
        let rt = s
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?;
        rt.links.push(RouteTableLink {
            link_route_table_id: link_id.clone(),
            subnet_id: subnet_id.to_string(),
        });
        Ok(link_id)
    }

    async fn unlink_route_table(&self, link_route_table_id: &str) -> CloudResult<()> {
        let mut s = self.begin("unlink_route_table").await?;
        for rt in s.route_tables.values_mut() {
            if let Some(pos) = rt
                .links
                .iter()
                .position(|l| l.link_route_table_id == link_route_table_id)
            {
                rt.links.remove(pos);
                return Ok(());
            }
        }
        Err(not_found("route table link", link_route_table_id))
    }

    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_route_table").await?;
        let linked = !s
            .route_tables
            .get(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?
            .links
            .is_empty();
        if linked {
            return Err(CloudError::DependencyViolation(format!(
                "route table {} has links",
                route_table_id
            )));
        }
        s.route_tables.remove(route_table_id);
        s.tags.remove(route_table_id);
        Ok(())
    }

    async fn create_route(
        &self,
        destination_ip_range: &str,
        route_table_id: &str,
        target_id: &str,
        _target_type: &str,
    ) -> CloudResult<RouteTable> {
        let mut s = self.begin("create_route").await?;
        let rt = s
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?;
        if rt
            .routes
            .iter()
            .any(|r| r.destination_ip_range == destination_ip_range)
        {
            return Err(CloudError::AlreadyExists(format!(
                "route {} in {}",
                destination_ip_range, route_table_id
            )));
        }
        rt.routes.push(Route {
            destination_ip_range: destination_ip_range.to_string(),
            target_id: target_id.to_string(),
        });
        Ok(rt.clone())
    }

    async fn delete_route(
        &self,
        destination_ip_range: &str,
        route_table_id: &str,
    ) -> CloudResult<()> {
        let mut s = self.begin("delete_route").await?;
        let rt = s
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?;
        let before = rt.routes.len();
        rt.routes
            .retain(|r| r.destination_ip_range != destination_ip_range);
        if rt.routes.len() == before {
            return Err(not_found("route", destination_ip_range));
        }
        Ok(())
    }
}

#[async_trait]
impl SecurityService for MemoryCloud {
    async fn create_security_group(
        &self,
        net_id: &str,
        tag_name: &str,
        _description: &str,
    ) -> CloudResult<SecurityGroup> {
        let mut s = self.begin("create_security_group").await?;
        if !s.nets.contains_key(net_id) {
            return Err(not_found("net", net_id));
        }
        if s
            .security_groups
            .values()
            .any(|x| x.group.net_id == net_id && x.group.security_group_name == tag_name)
        {
            return Err(CloudError::AlreadyExists(format!("security group {}", tag_name)));
        }
        let group = SecurityGroup {
            security_group_id: s.new_id("sg"),
            security_group_name: tag_name.to_string(),
            net_id: net_id.to_string(),
            inbound_rules: Vec::new(),
            outbound_rules: vec![SecurityGroupRule {
                ip_protocol: "-1".to_string(),
                ip_range: "0.0.0.0/0".to_string(),
                member_security_group_id: String::new(),
                from_port_range: 0,
                to_port_range: 0,
            }],
        };
        s.tag_name(&group.security_group_id, tag_name);
        s.security_groups.insert(
            group.security_group_id.clone(),
            StoredSecurityGroup {
                group: group.clone(),
            },
        );
        Ok(group)
    }

    async fn get_security_group(
        &self,
        security_group_id: &str,
    ) -> CloudResult<Option<SecurityGroup>> {
        let s = self.begin("get_security_group").await?;
        Ok(s.security_groups
            .get(security_group_id)
            .map(|x| x.group.clone()))
    }

    async fn get_security_group_ids_from_net_ids(&self, net_id: &str) -> CloudResult<Vec<String>> {
        let s = self.begin("get_security_group_ids_from_net_ids").await?;
        Ok(s.security_groups
            .values()
            .filter(|x| x.group.net_id == net_id)
            .map(|x| x.group.security_group_id.clone())
            .collect())
    }

    async fn delete_security_group(&self, security_group_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_security_group").await?;
        let referenced = s.security_groups.values().any(|x| {
            x.group
                .inbound_rules
                .iter()
                .chain(x.group.outbound_rules.iter())
                .any(|r| r.member_security_group_id == security_group_id)
        }) || s
            .load_balancers
            .values()
            .any(|lb| lb.security_group_ids.iter().any(|id| id == security_group_id));
        if referenced {
            return Err(CloudError::DependencyViolation(format!(
                "security group {} is referenced",
                security_group_id
            )));
        }
        s.security_groups
            .remove(security_group_id)
            .ok_or_else(|| not_found("security group", security_group_id))?;
        s.tags.remove(security_group_id);
        Ok(())
    }

    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<SecurityGroup> {
        let mut s = self.begin("create_security_group_rule").await?;
        let stored = s
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| not_found("security group", security_group_id))?;
        let rules = match rule.flow.as_str() {
            "Inbound" => &mut stored.group.inbound_rules,
            _ => &mut stored.group.outbound_rules,
        };
        if rules.iter().any(|r| rule.matches(r)) {
            return Err(CloudError::AlreadyExists(format!(
                "rule {:?} in {}",
                rule, security_group_id
            )));
        }
        rules.push(SecurityGroupRule {
            ip_protocol: rule.ip_protocol.clone(),
            ip_range: rule.ip_range.clone(),
            member_security_group_id: rule.member_security_group_id.clone(),
            from_port_range: rule.from_port_range,
            to_port_range: rule.to_port_range,
        });
        Ok(stored.group.clone())
    }

    async fn get_security_group_from_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<Option<SecurityGroup>> {
        let s = self
            .begin("get_security_group_from_security_group_rule")
            .await?;
        Ok(s.security_groups.get(security_group_id).and_then(|x| {
            let rules = match rule.flow.as_str() {
                "Inbound" => &x.group.inbound_rules,
                _ => &x.group.outbound_rules,
            };
            rules
                .iter()
                .any(|r| rule.matches(r))
                .then(|| x.group.clone())
        }))
    }

    async fn delete_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &RuleParams,
    ) -> CloudResult<()> {
        let mut s = self.begin("delete_security_group_rule").await?;
        let stored = s
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| not_found("security group", security_group_id))?;
        let rules = match rule.flow.as_str() {
            "Inbound" => &mut stored.group.inbound_rules,
            _ => &mut stored.group.outbound_rules,
        };
        let before = rules.len();
        rules.retain(|r| !rule.matches(r));
        if rules.len() == before {
            return Err(not_found("security group rule", security_group_id));
        }
        Ok(())
    }

    async fn create_public_ip(&self, tag_name: &str) -> CloudResult<PublicIp> {
        let mut s = self.begin("create_public_ip").await?;
        let n = s.next_id + 1;
        let ip = PublicIp {
            public_ip_id: s.new_id("eipalloc"),
            public_ip: format!("198.51.{}.{}", (n / 250) % 250, n % 250 + 1),
            link_public_ip_id: None,
            vm_id: None,
        };
        s.tag_name(&ip.public_ip_id, tag_name);
        s.public_ips.insert(ip.public_ip_id.clone(), ip.clone());
        Ok(ip)
    }

    async fn get_public_ip(&self, public_ip_id: &str) -> CloudResult<Option<PublicIp>> {
        let s = self.begin("get_public_ip").await?;
        Ok(s.public_ips.get(public_ip_id).cloned())
    }

    async fn validate_public_ip_ids(&self, public_ip_ids: &[String]) -> CloudResult<Vec<String>> {
        let s = self.begin("validate_public_ip_ids").await?;
        Ok(public_ip_ids
            .iter()
            .filter(|id| s.public_ips.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn link_public_ip(&self, public_ip_id: &str, vm_id: &str) -> CloudResult<String> {
        let mut s = self.begin("link_public_ip").await?;
        if !s.vms.contains_key(vm_id) {
            return Err(not_found("vm", vm_id));
        }
        let link_id = s.new_id("eipassoc");
        let ip = s
            .public_ips
            .get_mut(public_ip_id)
            .ok_or_else(|| not_found("public ip", public_ip_id))?;
        if ip.vm_id.as_deref() == Some(vm_id)
            && let Some(existing) = &ip.link_public_ip_id
        {
            return Ok(existing.clone());
        }
        ip.link_public_ip_id = Some(link_id.clone());
        ip.vm_id = Some(vm_id.to_string());
        Ok(link_id)
    }

    async fn unlink_public_ip(&self, link_public_ip_id: &str) -> CloudResult<()> {
        let mut s = self.begin("unlink_public_ip").await?;
        let ip = s
            .public_ips
            .values_mut()
            .find(|ip| ip.link_public_ip_id.as_deref() == Some(link_public_ip_id))
            .ok_or_else(|| not_found("public ip link", link_public_ip_id))?;
        ip.link_public_ip_id = None;
        ip.vm_id = None;
        Ok(())
    }

    async fn delete_public_ip(&self, public_ip_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_public_ip").await?;
        let in_use = s
            .nat_services
            .values()
            .any(|n| n.public_ip_id == public_ip_id)
            || s
                .public_ips
                .get(public_ip_id)
                .is_some_and(|ip| ip.link_public_ip_id.is_some());
        if in_use {
            return Err(CloudError::DependencyViolation(format!(
                "public ip {} is in use",
                public_ip_id
            )));
        }
        s.public_ips
            .remove(public_ip_id)
            .ok_or_else(|| not_found("public ip", public_ip_id))?;
        s.tags.remove(public_ip_id);
        Ok(())
    }

    async fn create_key_pair(&self, name: &str, public_key: &str) -> CloudResult<KeyPair> {
        let mut s = self.begin("create_key_pair").await?;
        if s.key_pairs.contains_key(name) {
            return Err(CloudError::AlreadyExists(format!("keypair {}", name)));
        }
        let kp = KeyPair {
            key_pair_name: name.to_string(),
            fingerprint: format!("{:x}", public_key.len() * 31 + name.len()),
        };
        s.key_pairs.insert(name.to_string(), kp.clone());
        Ok(kp)
    }

    async fn get_key_pair(&self, name: &str) -> CloudResult<Option<KeyPair>> {
        let s = self.begin("get_key_pair").await?;
        Ok(s.key_pairs.get(name).cloned())
    }

    async fn delete_key_pair(&self, name: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_key_pair").await?;
        s.key_pairs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("keypair", name))
    }
}

#[async_trait]
impl LoadBalancerService for MemoryCloud {
    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        subnet_id: &str,
        security_group_id: &str,
        tag_name: &str,
    ) -> CloudResult<LoadBalancer> {
        let mut s = self.begin("create_load_balancer").await?;
        let name = &spec.load_balancer_name;
        if s.load_balancers.contains_key(name) {
            return Err(CloudError::AlreadyExists(format!("load balancer {}", name)));
        }
        if !s.subnets.contains_key(subnet_id) {
            return Err(not_found("subnet", subnet_id));
        }
        let lb = LoadBalancer {
            load_balancer_name: name.clone(),
            dns_name: format!("{}.lbu.memory.internal", name.to_lowercase()),
            backend_vm_ids: Vec::new(),
            security_group_ids: vec![security_group_id.to_string()],
            health_check_configured: false,
            tags: BTreeMap::from([(NAME_TAG_KEY.to_string(), tag_name.to_string())]),
        };
        s.tag_name(name, tag_name);
        s.load_balancers.insert(name.clone(), lb.clone());
        Ok(lb)
    }

    async fn get_load_balancer(&self, name: &str) -> CloudResult<Option<LoadBalancer>> {
        let s = self.begin("get_load_balancer").await?;
        Ok(s.load_balancers.get(name).cloned())
    }

    async fn configure_health_check(&self, spec: &LoadBalancerSpec) -> CloudResult<LoadBalancer> {
        let mut s = self.begin("configure_health_check").await?;
        let lb = s
            .load_balancers
            .get_mut(&spec.load_balancer_name)
            .ok_or_else(|| not_found("load balancer", &spec.load_balancer_name))?;
        lb.health_check_configured = true;
        Ok(lb.clone())
    }

    async fn link_load_balancer_backend_machines(
        &self,
        vm_ids: &[String],
        name: &str,
    ) -> CloudResult<()> {
        let mut s = self.begin("link_load_balancer_backend_machines").await?;
        let lb = s
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found("load balancer", name))?;
        for vm_id in vm_ids {
            if !lb.backend_vm_ids.contains(vm_id) {
                lb.backend_vm_ids.push(vm_id.clone());
            }
        }
        Ok(())
    }

    async fn unlink_load_balancer_backend_machines(
        &self,
        vm_ids: &[String],
        name: &str,
    ) -> CloudResult<()> {
        let mut s = self.begin("unlink_load_balancer_backend_machines").await?;
        let lb = s
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found("load balancer", name))?;
        lb.backend_vm_ids.retain(|id| !vm_ids.contains(id));
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_load_balancer").await?;
        s.load_balancers
            .remove(name)
            .ok_or_else(|| not_found("load balancer", name))?;
        s.tags.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ComputeService for MemoryCloud {
    async fn create_vm(&self, request: &CreateVmRequest) -> CloudResult<Vm> {
        let mut s = self.begin("create_vm").await?;
        if !s.subnets.contains_key(&request.subnet_id) {
            return Err(not_found("subnet", &request.subnet_id));
        }
        let vm_id = s.new_id("i");
        let private_ip = request
            .private_ips
            .first()
            .cloned()
            .unwrap_or_else(|| format!("10.0.{}.{}", s.next_id / 250, s.next_id % 250 + 10));
        let vm = Vm {
            image_id: request.image_id.clone(),
            private_dns_name: format!("ip-{}.{}.compute.internal", private_ip.replace('.', "-"), request.subregion_name),
            vm_id: vm_id.clone(),
            state: VmState::Pending,
            private_ip,
            subregion_name: request.subregion_name.clone(),
            tags: BTreeMap::from([(NAME_TAG_KEY.to_string(), request.tag_name.clone())]),
        };
        s.tag_name(&vm_id, &request.tag_name);
        s.vms.insert(vm_id, vm.clone());
        Ok(vm)
    }

    async fn get_vm(&self, vm_id: &str) -> CloudResult<Option<Vm>> {
        let mut s = self.begin("get_vm").await?;
        let tags = s.tags.get(vm_id).cloned().unwrap_or_default();
        Ok(s.vms.get_mut(vm_id).map(|vm| {
            let current = vm.clone();
            if vm.state == VmState::Pending {
                vm.state = VmState::Running;
            }
            Vm { tags, ..current }
        }))
    }

    async fn delete_vm(&self, vm_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_vm").await?;
        let vm = s.vms.get_mut(vm_id).ok_or_else(|| not_found("vm", vm_id))?;
        vm.state = VmState::Terminated;
        for lb in s.load_balancers.values_mut() {
            lb.backend_vm_ids.retain(|id| id != vm_id);
        }
        for volume in s.volumes.values_mut() {
            if volume.vm_id.as_deref() == Some(vm_id) {
                volume.vm_id = None;
                volume.device_name = None;
                volume.state = VolumeState::Available;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageService for MemoryCloud {
    async fn get_image_by_name(&self, name: &str, account_id: &str) -> CloudResult<Option<Image>> {
        let s = self.begin("get_image_by_name").await?;
        Ok(s.images
            .values()
            .find(|i| i.image_name == name && (account_id.is_empty() || i.account_id == account_id))
            .cloned())
    }
}

#[async_trait]
impl StorageService for MemoryCloud {
    async fn create_volume(&self, _spec: &VolumeSpec, tag_name: &str) -> CloudResult<Volume> {
        let mut s = self.begin("create_volume").await?;
        let volume = Volume {
            volume_id: s.new_id("vol"),
            state: VolumeState::Creating,
            vm_id: None,
            device_name: None,
        };
        s.tag_name(&volume.volume_id, tag_name);
        s.volumes.insert(volume.volume_id.clone(), volume.clone());
        Ok(volume)
    }

    async fn get_volume(&self, volume_id: &str) -> CloudResult<Option<Volume>> {
        let mut s = self.begin("get_volume").await?;
        Ok(s.volumes.get_mut(volume_id).map(|v| {
            let current = v.clone();
            if v.state == VolumeState::Creating {
                v.state = VolumeState::Available;
            }
            current
        }))
    }

    async fn link_volume(&self, volume_id: &str, vm_id: &str, device_name: &str) -> CloudResult<()> {
        let mut s = self.begin("link_volume").await?;
        if !s.vms.contains_key(vm_id) {
            return Err(not_found("vm", vm_id));
        }
        let volume = s
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        match volume.state {
            VolumeState::Available => {
                volume.state = VolumeState::InUse;
                volume.vm_id = Some(vm_id.to_string());
                volume.device_name = Some(device_name.to_string());
                Ok(())
            }
            VolumeState::InUse if volume.vm_id.as_deref() == Some(vm_id) => Err(
                CloudError::AlreadyExists(format!("volume {} already linked", volume_id)),
            ),
            other => Err(CloudError::Api {
                code: "InvalidState".to_string(),
                message: format!("volume {} is {:?}", volume_id, other),
            }),
        }
    }

    async fn unlink_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut s = self.begin("unlink_volume").await?;
        let volume = s
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        if volume.vm_id.is_none() {
            return Err(not_found("volume link", volume_id));
        }
        volume.vm_id = None;
        volume.device_name = None;
        volume.state = VolumeState::Available;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut s = self.begin("delete_volume").await?;
        let in_use = s
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?
            .state
            == VolumeState::InUse;
        if in_use {
            return Err(CloudError::DependencyViolation(format!(
                "volume {} is in use",
                volume_id
            )));
        }
        s.volumes.remove(volume_id);
        s.tags.remove(volume_id);
        Ok(())
    }
}

#[async_trait]
impl TagService for MemoryCloud {
    async fn read_tag(&self, key: &str, value: &str) -> CloudResult<Option<Tag>> {
        let s = self.begin("read_tag").await?;
        let terminated: BTreeSet<&String> = s
            .vms
            .iter()
            .filter(|(_, vm)| vm.state == VmState::Terminated)
            .map(|(id, _)| id)
            .collect();
        Ok(s.tags
            .iter()
            .filter(|(id, _)| !terminated.contains(id))
            .find(|(_, tags)| tags.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| Tag {
                resource_id: id.clone(),
                key: key.to_string(),
                value: value.to_string(),
            }))
    }

    async fn add_tag(&self, resource_id: &str, key: &str, value: &str) -> CloudResult<()> {
        let mut s = self.begin("add_tag").await?;
        s.tags
            .entry(resource_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
