//! Default values and spec resolution.

use super::*;

pub const DEFAULT_SUBREGION_NAME: &str = "eu-west-2a";
pub const DEFAULT_NET_NAME: &str = "cluster-api-net";
pub const DEFAULT_IP_RANGE: &str = "10.0.0.0/16";

pub const DEFAULT_SUBNET_KCP_NAME: &str = "cluster-api-subnet-kcp";
pub const DEFAULT_SUBNET_KW_NAME: &str = "cluster-api-subnet-kw";
pub const DEFAULT_SUBNET_PUBLIC_NAME: &str = "cluster-api-subnet-public";
pub const DEFAULT_IP_SUBNET_KCP_RANGE: &str = "10.0.4.0/24";
pub const DEFAULT_IP_SUBNET_KW_RANGE: &str = "10.0.3.0/24";
pub const DEFAULT_IP_SUBNET_PUBLIC_RANGE: &str = "10.0.2.0/24";

pub const DEFAULT_INTERNET_SERVICE_NAME: &str = "cluster-api-internetservice";
pub const DEFAULT_PUBLIC_IP_NAT_NAME: &str = "cluster-api-publicip-nat";
pub const DEFAULT_NAT_SERVICE_NAME: &str = "cluster-api-natservice";

pub const DEFAULT_SECURITY_GROUP_KW_NAME: &str = "cluster-api-securitygroup-kw";
pub const DEFAULT_SECURITY_GROUP_KCP_NAME: &str = "cluster-api-securitygroup-kcp";
pub const DEFAULT_SECURITY_GROUP_LB_NAME: &str = "cluster-api-securitygroup-lb";

pub const DEFAULT_LOAD_BALANCER_NAME: &str = "OscClusterApi-1";
pub const DEFAULT_LOAD_BALANCER_TYPE: &str = "internet-facing";
pub const DEFAULT_PROTOCOL: &str = "TCP";
pub const DEFAULT_API_PORT: i32 = 6443;
pub const DEFAULT_CHECK_INTERVAL: i32 = 5;
pub const DEFAULT_HEALTHY_THRESHOLD: i32 = 5;
pub const DEFAULT_UNHEALTHY_THRESHOLD: i32 = 2;
pub const DEFAULT_TIMEOUT: i32 = 5;

pub const DEFAULT_VM_NAME: &str = "cluster-api-vm";
pub const DEFAULT_VM_TYPE: &str = "tinav3.c4r8p1";
pub const DEFAULT_KEYPAIR_NAME: &str = "cluster-api";
pub const DEFAULT_ROOT_DISK_TYPE: &str = "io1";
pub const DEFAULT_ROOT_DISK_SIZE: i32 = 60;
pub const DEFAULT_ROOT_DISK_IOPS: i32 = 1500;
pub const DEFAULT_VOLUME_TYPE: &str = "standard";

pub const DEFAULT_BASTION_NAME: &str = "cluster-api-vm-bastion";
pub const DEFAULT_BASTION_VM_TYPE: &str = "tinav3.c2r2p1";
pub const DEFAULT_BASTION_IMAGE_ID: &str = "ami-bb490c7e";
pub const DEFAULT_BASTION_ROOT_DISK_SIZE: i32 = 15;
pub const DEFAULT_BASTION_ROOT_DISK_IOPS: i32 = 1000;
pub const DEFAULT_SECURITY_GROUP_BASTION_NAME: &str = "cluster-api-securitygroup-bastion";

const ANYWHERE: &str = "0.0.0.0/0";

/// Apply every cluster default once and freeze the result.
pub fn resolve_cluster(spec: ClusterSpec) -> EffectiveClusterSpec {
    let mut network = spec.network;

    if network.subregion_name.is_empty() {
        network.subregion_name = DEFAULT_SUBREGION_NAME.to_string();
    }

    set_default(&mut network.net.name, DEFAULT_NET_NAME);
    set_default(&mut network.net.ip_range, DEFAULT_IP_RANGE);

    if network.subnets.is_empty() {
        network.subnets = default_subnets();
    }
    for subnet in &mut network.subnets {
        set_default(&mut subnet.subregion_name, &network.subregion_name);
    }

    set_default(&mut network.internet_service.name, DEFAULT_INTERNET_SERVICE_NAME);

    if network.public_ips.is_empty() {
        network.public_ips = vec![PublicIpSpec {
            name: DEFAULT_PUBLIC_IP_NAT_NAME.to_string(),
            ..Default::default()
        }];
    }

    let nat = &mut network.nat_service;
    set_default(&mut nat.name, DEFAULT_NAT_SERVICE_NAME);
    set_default(&mut nat.subnet_name, DEFAULT_SUBNET_PUBLIC_NAME);
    if nat.public_ip_name.is_empty()
        && let Some(first) = network.public_ips.first()
    {
        nat.public_ip_name = first.name.clone();
    }

    if network.route_tables.is_empty() {
        network.route_tables = default_route_tables();
    }
    for route in network.route_tables.iter_mut().flat_map(|rt| rt.routes.iter_mut()) {
        set_default(&mut route.target_type, TARGET_GATEWAY);
        set_default(&mut route.destination, ANYWHERE);
    }

    if network.security_groups.is_empty() {
        network.security_groups = default_security_groups();
        if network.bastion.enable {
            network.security_groups.push(bastion_security_group());
        }
    }
    for sg in &mut network.security_groups {
        if sg.description.is_empty() {
            sg.description = format!("Security Group {} with cluster-api", sg.name);
        }
        for rule in &mut sg.security_group_rules {
            if rule.to_port_range == 0 {
                rule.to_port_range = rule.from_port_range;
            }
        }
    }

    let lb = &mut network.load_balancer;
    set_default(&mut lb.load_balancer_name, DEFAULT_LOAD_BALANCER_NAME);
    set_default(&mut lb.load_balancer_type, DEFAULT_LOAD_BALANCER_TYPE);
    set_default(&mut lb.subnet_name, DEFAULT_SUBNET_PUBLIC_NAME);
    set_default(&mut lb.security_group_name, DEFAULT_SECURITY_GROUP_LB_NAME);
    set_default_num(&mut lb.listener.backend_port, DEFAULT_API_PORT);
    set_default(&mut lb.listener.backend_protocol, DEFAULT_PROTOCOL);
    set_default_num(&mut lb.listener.load_balancer_port, DEFAULT_API_PORT);
    set_default(&mut lb.listener.load_balancer_protocol, DEFAULT_PROTOCOL);
    set_default_num(&mut lb.health_check.check_interval, DEFAULT_CHECK_INTERVAL);
    set_default_num(&mut lb.health_check.healthy_threshold, DEFAULT_HEALTHY_THRESHOLD);
    set_default_num(&mut lb.health_check.unhealthy_threshold, DEFAULT_UNHEALTHY_THRESHOLD);
    set_default_num(&mut lb.health_check.timeout, DEFAULT_TIMEOUT);
    set_default_num(&mut lb.health_check.port, DEFAULT_API_PORT);
    set_default(&mut lb.health_check.protocol, DEFAULT_PROTOCOL);

    let bastion = &mut network.bastion;
    if bastion.enable {
        set_default(&mut bastion.name, DEFAULT_BASTION_NAME);
        set_default(&mut bastion.vm_type, DEFAULT_BASTION_VM_TYPE);
        if bastion.image_name.is_empty() {
            set_default(&mut bastion.image_id, DEFAULT_BASTION_IMAGE_ID);
        }
        set_default(&mut bastion.key_pair_name, DEFAULT_KEYPAIR_NAME);
        set_default(&mut bastion.subregion_name, &network.subregion_name);
        set_default(&mut bastion.subnet_name, DEFAULT_SUBNET_PUBLIC_NAME);
        if bastion.security_group_names.is_empty() {
            bastion.security_group_names = vec![DEFAULT_SECURITY_GROUP_BASTION_NAME.to_string()];
        }
        let root = &mut bastion.root_disk;
        set_default(&mut root.root_disk_type, DEFAULT_ROOT_DISK_TYPE);
        set_default_num(&mut root.root_disk_size, DEFAULT_BASTION_ROOT_DISK_SIZE);
        if root.root_disk_type == "io1" {
            set_default_num(&mut root.root_disk_iops, DEFAULT_BASTION_ROOT_DISK_IOPS);
        }
        if bastion.public_ip_name.is_empty() {
            bastion.public_ip_name = format!("{}-publicip", bastion.name);
        }
    }

    EffectiveClusterSpec(ClusterSpec { network })
}

/// Apply every machine default once and freeze the result.
pub fn resolve_machine(spec: MachineSpec) -> EffectiveMachineSpec {
    let MachineSpec {
        mut vm,
        mut volumes,
        mut key_pair,
    } = spec;

    set_default(&mut vm.name, DEFAULT_VM_NAME);
    set_default(&mut vm.vm_type, DEFAULT_VM_TYPE);
    set_default(&mut vm.key_pair_name, DEFAULT_KEYPAIR_NAME);
    set_default(&mut vm.subregion_name, DEFAULT_SUBREGION_NAME);
    set_default(&mut vm.subnet_name, DEFAULT_SUBNET_KW_NAME);
    if vm.security_group_names.is_empty() {
        vm.security_group_names = vec![DEFAULT_SECURITY_GROUP_KW_NAME.to_string()];
    }
    set_default(&mut vm.root_disk.root_disk_type, DEFAULT_ROOT_DISK_TYPE);
    set_default_num(&mut vm.root_disk.root_disk_size, DEFAULT_ROOT_DISK_SIZE);
    if vm.root_disk.root_disk_type == "io1" {
        set_default_num(&mut vm.root_disk.root_disk_iops, DEFAULT_ROOT_DISK_IOPS);
    }
    if vm.public_ip && vm.public_ip_name.is_empty() {
        vm.public_ip_name = format!("{}-publicip", vm.name);
    }

    for volume in &mut volumes {
        set_default(&mut volume.volume_type, DEFAULT_VOLUME_TYPE);
        set_default(&mut volume.subregion_name, &vm.subregion_name);
    }

    set_default(&mut key_pair.name, &vm.key_pair_name);

    EffectiveMachineSpec(MachineSpec {
        vm,
        volumes,
        key_pair,
    })
}

fn set_default(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

fn set_default_num(field: &mut i32, value: i32) {
    if *field == 0 {
        *field = value;
    }
}

fn default_subnets() -> Vec<SubnetSpec> {
    [
        (DEFAULT_SUBNET_KCP_NAME, DEFAULT_IP_SUBNET_KCP_RANGE),
        (DEFAULT_SUBNET_KW_NAME, DEFAULT_IP_SUBNET_KW_RANGE),
        (DEFAULT_SUBNET_PUBLIC_NAME, DEFAULT_IP_SUBNET_PUBLIC_RANGE),
    ]
    .into_iter()
    .map(|(name, range)| SubnetSpec {
        name: name.to_string(),
        ip_subnet_range: range.to_string(),
        ..Default::default()
    })
    .collect()
}

fn route_table(name: &str, subnet: &str, route: &str, target_type: &str, target: &str) -> RouteTableSpec {
    RouteTableSpec {
        name: name.to_string(),
        subnets: vec![subnet.to_string()],
        routes: vec![RouteSpec {
            name: route.to_string(),
            target_type: target_type.to_string(),
            target_name: target.to_string(),
            destination: ANYWHERE.to_string(),
        }],
        resource_id: String::new(),
    }
}

fn default_route_tables() -> Vec<RouteTableSpec> {
    vec![
        route_table(
            "cluster-api-routetable-kw",
            DEFAULT_SUBNET_KW_NAME,
            "cluster-api-route-kw",
            TARGET_NAT,
            DEFAULT_NAT_SERVICE_NAME,
        ),
        route_table(
            "cluster-api-routetable-kcp",
            DEFAULT_SUBNET_KCP_NAME,
            "cluster-api-route-kcp",
            TARGET_NAT,
            DEFAULT_NAT_SERVICE_NAME,
        ),
        route_table(
            "cluster-api-routetable-public",
            DEFAULT_SUBNET_PUBLIC_NAME,
            "cluster-api-route-public",
            TARGET_GATEWAY,
            DEFAULT_INTERNET_SERVICE_NAME,
        ),
    ]
}

fn rule(name: &str, ip_range: &str, from: i32, to: i32) -> SecurityGroupRuleSpec {
    SecurityGroupRuleSpec {
        name: name.to_string(),
        flow: FLOW_INBOUND.to_string(),
        ip_protocol: "tcp".to_string(),
        ip_range: ip_range.to_string(),
        from_port_range: from,
        to_port_range: to,
    }
}

fn default_security_groups() -> Vec<SecurityGroupSpec> {
    let kw = SecurityGroupSpec {
        name: DEFAULT_SECURITY_GROUP_KW_NAME.to_string(),
        description: "Security Group Kw with cluster-api".to_string(),
        security_group_rules: vec![
            rule("cluster-api-securitygrouprule-api-kubelet-kw", DEFAULT_IP_SUBNET_KW_RANGE, 10250, 10250),
            rule("cluster-api-securitygrouprule-api-kubelet-kcp", DEFAULT_IP_SUBNET_KCP_RANGE, 10250, 10250),
            rule("cluster-api-securitygrouprule-kw-nodeip-kw", DEFAULT_IP_SUBNET_KW_RANGE, 30000, 32767),
            rule("cluster-api-securitygrouprule-kw-nodeip-kcp", DEFAULT_IP_SUBNET_KCP_RANGE, 30000, 32767),
            rule("cluster-api-securitygrouprule-kw-bgp", DEFAULT_IP_RANGE, 179, 179),
        ],
        ..Default::default()
    };
    let kcp = SecurityGroupSpec {
        name: DEFAULT_SECURITY_GROUP_KCP_NAME.to_string(),
        description: "Security Group Kcp with cluster-api".to_string(),
        security_group_rules: vec![
            rule("cluster-api-securitygrouprule-api-kw", DEFAULT_IP_SUBNET_KW_RANGE, 6443, 6443),
            rule("cluster-api-securitygrouprule-api-kcp", DEFAULT_IP_SUBNET_KCP_RANGE, 6443, 6443),
            rule("cluster-api-securitygrouprule-etcd", DEFAULT_IP_SUBNET_KCP_RANGE, 2378, 2380),
            rule("cluster-api-securitygrouprule-kubelet-kcp", DEFAULT_IP_SUBNET_KCP_RANGE, 10250, 10250),
            rule("cluster-api-securitygrouprule-kcp-nodeip-kw", DEFAULT_IP_SUBNET_KW_RANGE, 30000, 32767),
            rule("cluster-api-securitygrouprule-kcp-nodeip-kcp", DEFAULT_IP_SUBNET_KCP_RANGE, 30000, 32767),
            rule("cluster-api-securitygrouprule-kcp-bgp", DEFAULT_IP_RANGE, 179, 179),
        ],
        ..Default::default()
    };
    let lb = SecurityGroupSpec {
        name: DEFAULT_SECURITY_GROUP_LB_NAME.to_string(),
        description: "Security Group Lb with cluster-api".to_string(),
        security_group_rules: vec![rule("cluster-api-securitygrouprule-lb", ANYWHERE, 6443, 6443)],
        ..Default::default()
    };
    vec![kw, kcp, lb]
}

fn bastion_security_group() -> SecurityGroupSpec {
    SecurityGroupSpec {
        name: DEFAULT_SECURITY_GROUP_BASTION_NAME.to_string(),
        description: "Security Group Bastion with cluster-api".to_string(),
        security_group_rules: vec![rule("cluster-api-securitygrouprule-bastion-ssh", ANYWHERE, 22, 22)],
        ..Default::default()
    }
}
