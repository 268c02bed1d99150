//! Pure checks over a resolved spec, run before any mutating call.
//!
//! Format checks (CIDR, tag names, ports, enums) run per field; reference
//! checks make sure every name a resource points at is declared among its
//! siblings; duplicate checks enforce unique logical names per collection.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use ipnet::Ipv4Net;
use regex::Regex;
use thiserror::Error;

use crate::spec::{
    EffectiveClusterSpec, EffectiveMachineSpec, FLOW_INBOUND, FLOW_OUTBOUND, HealthCheckSpec,
    LoadBalancerSpec, RootDiskSpec, SecurityGroupRuleSpec, TARGET_GATEWAY, TARGET_NAT, VolumeSpec,
};

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("Invalid tag name: {0}")]
    InvalidTagName(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid port: {0}")]
    InvalidPort(i32),

    #[error("Invalid port range: {from}-{to}")]
    InvalidPortRange { from: i32, to: i32 },

    #[error("Invalid ip protocol: {0}")]
    InvalidProtocol(String),

    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    #[error("Invalid route target type: {0}")]
    InvalidTargetType(String),

    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    #[error("Subnet {subnet} is not within net {net}")]
    SubnetOutsideNet { subnet: String, net: String },

    #[error("Subnet {0} overlaps with subnet {1}")]
    SubnetOverlap(String, String),

    #[error("Subnet {subnet} is linked to both route tables {first} and {second}")]
    SubnetLinkedTwice {
        subnet: String,
        first: String,
        second: String,
    },

    #[error("{owner} references unknown {kind} {name}")]
    UnknownReference {
        owner: String,
        kind: &'static str,
        name: String,
    },

    #[error("{0} already exist")]
    Duplicate(String),

    #[error("Invalid load balancer name: {0}")]
    InvalidLoadBalancerName(String),

    #[error("Invalid load balancer type: {0}")]
    InvalidLoadBalancerType(String),

    #[error("Invalid protocol: {0}")]
    InvalidListenerProtocol(String),

    #[error("SSL certificate is required")]
    SslCertificateRequired,

    #[error("Invalid health check {field}: {value} is not within {min}-{max}")]
    InvalidHealthCheck {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("Invalid vm type: {0}")]
    InvalidVmType(String),

    #[error("Invalid image id: {0}")]
    InvalidImageId(String),

    #[error("Invalid image name: {0}")]
    InvalidImageName(String),

    #[error("Invalid private ip: {0}")]
    InvalidPrivateIp(String),

    #[error("Private ip {ip} is not within subnet {subnet}")]
    PrivateIpOutsideSubnet { ip: String, subnet: String },

    #[error("Invalid device name: {0}")]
    InvalidDeviceName(String),

    #[error("Invalid volume type: {0}")]
    InvalidVolumeType(String),

    #[error("Invalid iops: {0}")]
    InvalidIops(i32),

    #[error("Iops are only supported with io1, not {0}")]
    IopsNotSupported(String),

    #[error("Invalid volume size: {0}")]
    InvalidVolumeSize(i32),

    #[error("Invalid keypair name: {0}")]
    InvalidKeyPairName(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

static TAG_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z\-_\s.()/]{0,255}$").expect("valid regex")
});
static DESCRIPTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\x20-\x7E]{0,255}$").expect("valid regex")
});
static LOAD_BALANCER_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z\s\-]{0,32}$").expect("valid regex")
});
static VM_TYPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^tinav[1-5]\.c[0-9]+r[0-9]+p[1-3]$").expect("valid regex")
});
static IMAGE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ami-[a-f0-9]{8}$").expect("valid regex")
});
static IMAGE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z\-_\s.()\\]{0,255}$").expect("valid regex")
});
static DEVICE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/dev/sd[a-z]|/dev/xvd[a-z])$").expect("valid regex")
});

// =============================================================================
// Field validators
// =============================================================================

/// Check a resource name that ends up in a cloud `Name` tag.
pub fn validate_tag_name(name: &str) -> Result<()> {
    if TAG_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTagName(name.to_string()))
    }
}

/// Parse an IPv4 CIDR, rejecting bad octets and prefix lengths.
pub fn validate_cidr(cidr: &str) -> Result<Ipv4Net> {
    cidr.parse::<Ipv4Net>()
        .map_err(|_| ValidationError::InvalidCidr(cidr.to_string()))
}

pub fn validate_port(port: i32) -> Result<()> {
    if (0..=65535).contains(&port) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPort(port))
    }
}

pub fn validate_ip_protocol(protocol: &str) -> Result<()> {
    match protocol {
        "tcp" | "udp" | "icmp" | "-1" => Ok(()),
        _ => Err(ValidationError::InvalidProtocol(protocol.to_string())),
    }
}

pub fn validate_flow(flow: &str) -> Result<()> {
    match flow {
        FLOW_INBOUND | FLOW_OUTBOUND => Ok(()),
        _ => Err(ValidationError::InvalidFlow(flow.to_string())),
    }
}

pub fn validate_description(description: &str) -> Result<()> {
    if DESCRIPTION_REGEX.is_match(description) {
        Ok(())
    } else {
        Err(ValidationError::InvalidDescription(description.to_string()))
    }
}

/// A Vm needs either an image name to look up or a well-formed image id.
pub fn validate_image(image_id: &str, image_name: &str) -> Result<()> {
    if !image_name.is_empty() {
        return if IMAGE_NAME_REGEX.is_match(image_name) {
            Ok(())
        } else {
            Err(ValidationError::InvalidImageName(image_name.to_string()))
        };
    }
    if image_id.is_empty() {
        return Err(ValidationError::Required("image id"));
    }
    if !IMAGE_ID_REGEX.is_match(image_id) {
        return Err(ValidationError::InvalidImageId(image_id.to_string()));
    }
    Ok(())
}

fn validate_key_pair_name(name: &str) -> Result<()> {
    if name.is_empty() || !DESCRIPTION_REGEX.is_match(name) {
        return Err(ValidationError::InvalidKeyPairName(name.to_string()));
    }
    Ok(())
}

/// Return the first name that appears twice, as `"<name> already exist"`.
pub fn check_duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ValidationError::Duplicate(name.to_string()));
        }
    }
    Ok(())
}

fn check_reference<'a>(
    owner: &str,
    kind: &'static str,
    name: &str,
    mut declared: impl Iterator<Item = &'a str>,
) -> Result<()> {
    if declared.any(|d| d == name) {
        Ok(())
    } else {
        Err(ValidationError::UnknownReference {
            owner: owner.to_string(),
            kind,
            name: name.to_string(),
        })
    }
}

fn check_range(field: &'static str, value: i32, min: i32, max: i32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidHealthCheck {
            field,
            value,
            min,
            max,
        })
    }
}

pub fn validate_security_group_rule(rule: &SecurityGroupRuleSpec) -> Result<()> {
    validate_tag_name(&rule.name)?;
    validate_flow(&rule.flow)?;
    validate_ip_protocol(&rule.ip_protocol)?;
    validate_cidr(&rule.ip_range)?;
    // icmp and all-protocol rules may carry -1 ports
    if !matches!(rule.ip_protocol.as_str(), "tcp" | "udp") {
        for port in [rule.from_port_range, rule.to_port_range] {
            if port != -1 {
                validate_port(port)?;
            }
        }
        return Ok(());
    }
    validate_port(rule.from_port_range)?;
    validate_port(rule.to_port_range)?;
    if rule.to_port_range < rule.from_port_range {
        return Err(ValidationError::InvalidPortRange {
            from: rule.from_port_range,
            to: rule.to_port_range,
        });
    }
    Ok(())
}

fn validate_listener_protocol(protocol: &str) -> Result<()> {
    match protocol {
        "HTTP" | "TCP" => Ok(()),
        "SSL" | "HTTPS" => Err(ValidationError::SslCertificateRequired),
        _ => Err(ValidationError::InvalidListenerProtocol(protocol.to_string())),
    }
}

fn validate_health_check(hc: &HealthCheckSpec) -> Result<()> {
    check_range("interval", hc.check_interval, 5, 600)?;
    check_range("healthy threshold", hc.healthy_threshold, 1, 10)?;
    check_range("unhealthy threshold", hc.unhealthy_threshold, 1, 10)?;
    check_range("timeout", hc.timeout, 2, 60)?;
    validate_port(hc.port)?;
    validate_listener_protocol(&hc.protocol)
}

pub fn validate_load_balancer(lb: &LoadBalancerSpec) -> Result<()> {
    if !LOAD_BALANCER_NAME_REGEX.is_match(&lb.load_balancer_name) {
        return Err(ValidationError::InvalidLoadBalancerName(
            lb.load_balancer_name.clone(),
        ));
    }
    match lb.load_balancer_type.as_str() {
        "internet-facing" | "internal" => {}
        other => return Err(ValidationError::InvalidLoadBalancerType(other.to_string())),
    }
    validate_port(lb.listener.backend_port)?;
    validate_port(lb.listener.load_balancer_port)?;
    validate_listener_protocol(&lb.listener.backend_protocol)?;
    validate_listener_protocol(&lb.listener.load_balancer_protocol)?;
    validate_health_check(&lb.health_check)
}

pub fn validate_volume(volume: &VolumeSpec) -> Result<()> {
    validate_tag_name(&volume.name)?;
    if !DEVICE_NAME_REGEX.is_match(&volume.device_name) {
        return Err(ValidationError::InvalidDeviceName(volume.device_name.clone()));
    }
    match volume.volume_type.as_str() {
        "io1" => {
            if !(100..=13000).contains(&volume.iops) {
                return Err(ValidationError::InvalidIops(volume.iops));
            }
        }
        "standard" | "gp2" => {
            if volume.iops != 0 {
                return Err(ValidationError::IopsNotSupported(volume.volume_type.clone()));
            }
        }
        other => return Err(ValidationError::InvalidVolumeType(other.to_string())),
    }
    if !(1..=14901).contains(&volume.size) {
        return Err(ValidationError::InvalidVolumeSize(volume.size));
    }
    Ok(())
}

// =============================================================================
// Whole-object validation
// =============================================================================

/// Validate a cluster spec: formats, sibling references and duplicate names.
pub fn validate_cluster(spec: &EffectiveClusterSpec) -> Result<()> {
    let network = spec.network();

    validate_tag_name(&network.net.name)?;
    let net_range = validate_cidr(&network.net.ip_range)?;

    check_duplicates(network.subnets.iter().map(|s| s.name.as_str()))?;
    let mut subnet_ranges: Vec<(&str, Ipv4Net)> = Vec::with_capacity(network.subnets.len());
    for subnet in &network.subnets {
        validate_tag_name(&subnet.name)?;
        let range = validate_cidr(&subnet.ip_subnet_range)?;
        if !net_range.contains(&range) {
            return Err(ValidationError::SubnetOutsideNet {
                subnet: subnet.ip_subnet_range.clone(),
                net: network.net.ip_range.clone(),
            });
        }
        if let Some((other, _)) = subnet_ranges
            .iter()
            .find(|(_, r)| r.contains(&range) || range.contains(r))
        {
            return Err(ValidationError::SubnetOverlap(
                subnet.name.clone(),
                other.to_string(),
            ));
        }
        subnet_ranges.push((&subnet.name, range));
    }
    let subnet_names = || network.subnets.iter().map(|s| s.name.as_str());

    validate_tag_name(&network.internet_service.name)?;

    check_duplicates(network.public_ips.iter().map(|p| p.name.as_str()))?;
    for ip in &network.public_ips {
        validate_tag_name(&ip.name)?;
    }

    let nat = &network.nat_service;
    validate_tag_name(&nat.name)?;
    check_reference(&nat.name, "subnet", &nat.subnet_name, subnet_names())?;
    check_reference(
        &nat.name,
        "public ip",
        &nat.public_ip_name,
        network.public_ips.iter().map(|p| p.name.as_str()),
    )?;

    check_duplicates(network.route_tables.iter().map(|rt| rt.name.as_str()))?;
    // A subnet has at most one route table.
    let mut subnet_tables: HashMap<&str, &str> = HashMap::new();
    for rt in &network.route_tables {
        validate_tag_name(&rt.name)?;
        check_duplicates(rt.subnets.iter().map(String::as_str))?;
        for subnet in &rt.subnets {
            check_reference(&rt.name, "subnet", subnet, subnet_names())?;
            if let Some(first) = subnet_tables.insert(subnet, &rt.name) {
                return Err(ValidationError::SubnetLinkedTwice {
                    subnet: subnet.clone(),
                    first: first.to_string(),
                    second: rt.name.clone(),
                });
            }
        }
        check_duplicates(rt.routes.iter().map(|r| r.name.as_str()))?;
        for route in &rt.routes {
            validate_tag_name(&route.name)?;
            validate_cidr(&route.destination)?;
            match route.target_type.as_str() {
                TARGET_GATEWAY => check_reference(
                    &route.name,
                    "internet service",
                    &route.target_name,
                    std::iter::once(network.internet_service.name.as_str()),
                )?,
                TARGET_NAT => check_reference(
                    &route.name,
                    "nat service",
                    &route.target_name,
                    std::iter::once(nat.name.as_str()),
                )?,
                other => return Err(ValidationError::InvalidTargetType(other.to_string())),
            }
        }
    }

    check_duplicates(network.security_groups.iter().map(|sg| sg.name.as_str()))?;
    for sg in &network.security_groups {
        validate_tag_name(&sg.name)?;
        validate_description(&sg.description)?;
        check_duplicates(sg.security_group_rules.iter().map(|r| r.name.as_str()))?;
        for rule in &sg.security_group_rules {
            validate_security_group_rule(rule)?;
        }
    }

    let lb = &network.load_balancer;
    validate_load_balancer(lb)?;
    check_reference(
        &lb.load_balancer_name,
        "subnet",
        &lb.subnet_name,
        subnet_names(),
    )?;
    check_reference(
        &lb.load_balancer_name,
        "security group",
        &lb.security_group_name,
        network.security_groups.iter().map(|sg| sg.name.as_str()),
    )?;

    validate_bastion(spec)
}

/// Fields a machine Vm and the bastion have in common.
struct Instance<'a> {
    name: &'a str,
    image_id: &'a str,
    image_name: &'a str,
    vm_type: &'a str,
    subnet_name: &'a str,
    security_group_names: &'a [String],
    private_ips: &'a [String],
    root_disk: &'a RootDiskSpec,
}

fn validate_instance(vm: &Instance<'_>, cluster: &EffectiveClusterSpec) -> Result<()> {
    validate_tag_name(vm.name)?;
    validate_image(vm.image_id, vm.image_name)?;
    if !VM_TYPE_REGEX.is_match(vm.vm_type) {
        return Err(ValidationError::InvalidVmType(vm.vm_type.to_string()));
    }

    let subnet = cluster
        .subnet(vm.subnet_name)
        .ok_or_else(|| ValidationError::UnknownReference {
            owner: vm.name.to_string(),
            kind: "subnet",
            name: vm.subnet_name.to_string(),
        })?;
    let subnet_range = validate_cidr(&subnet.ip_subnet_range)?;
    for ip in vm.private_ips {
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| ValidationError::InvalidPrivateIp(ip.clone()))?;
        if !subnet_range.contains(&addr) {
            return Err(ValidationError::PrivateIpOutsideSubnet {
                ip: ip.clone(),
                subnet: subnet.ip_subnet_range.clone(),
            });
        }
    }

    check_duplicates(vm.security_group_names.iter().map(String::as_str))?;
    for sg in vm.security_group_names {
        check_reference(
            vm.name,
            "security group",
            sg,
            cluster
                .network()
                .security_groups
                .iter()
                .map(|s| s.name.as_str()),
        )?;
    }

    validate_volume(&VolumeSpec {
        name: vm.name.to_string(),
        device_name: "/dev/sda".to_string(),
        iops: vm.root_disk.root_disk_iops,
        size: vm.root_disk.root_disk_size,
        volume_type: vm.root_disk.root_disk_type.clone(),
        ..Default::default()
    })
}

fn validate_bastion(cluster: &EffectiveClusterSpec) -> Result<()> {
    let bastion = &cluster.network().bastion;
    if !bastion.enable {
        return Ok(());
    }
    validate_instance(
        &Instance {
            name: &bastion.name,
            image_id: &bastion.image_id,
            image_name: &bastion.image_name,
            vm_type: &bastion.vm_type,
            subnet_name: &bastion.subnet_name,
            security_group_names: &bastion.security_group_names,
            private_ips: &bastion.private_ips,
            root_disk: &bastion.root_disk,
        },
        cluster,
    )?;
    validate_tag_name(&bastion.public_ip_name)?;
    validate_key_pair_name(&bastion.key_pair_name)
}

/// Validate a machine spec against the cluster it joins.
pub fn validate_machine(spec: &EffectiveMachineSpec, cluster: &EffectiveClusterSpec) -> Result<()> {
    let vm = &spec.vm;
    validate_instance(
        &Instance {
            name: &vm.name,
            image_id: &vm.image_id,
            image_name: &vm.image_name,
            vm_type: &vm.vm_type,
            subnet_name: &vm.subnet_name,
            security_group_names: &vm.security_group_names,
            private_ips: &vm.private_ips,
            root_disk: &vm.root_disk,
        },
        cluster,
    )?;

    if vm.public_ip {
        validate_tag_name(&vm.public_ip_name)?;
    }

    check_duplicates(spec.volumes.iter().map(|v| v.name.as_str()))?;
    check_duplicates(spec.volumes.iter().map(|v| v.device_name.as_str()))?;
    for volume in &spec.volumes {
        validate_volume(volume)?;
    }

    validate_key_pair_name(&spec.key_pair.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{
        ClusterSpec, MachineSpec, NetworkSpec, RouteSpec, RouteTableSpec, SubnetSpec, VmSpec,
        resolve_cluster, resolve_machine,
    };

    fn subnet(name: &str, range: &str) -> SubnetSpec {
        SubnetSpec {
            name: name.to_string(),
            ip_subnet_range: range.to_string(),
            ..Default::default()
        }
    }

    fn machine(vm: VmSpec) -> EffectiveMachineSpec {
        resolve_machine(MachineSpec {
            vm,
            ..Default::default()
        })
    }

    #[test]
    fn test_regexes_compile() {
        LazyLock::force(&TAG_NAME_REGEX);
        LazyLock::force(&DESCRIPTION_REGEX);
        LazyLock::force(&LOAD_BALANCER_NAME_REGEX);
        LazyLock::force(&VM_TYPE_REGEX);
        LazyLock::force(&IMAGE_ID_REGEX);
        LazyLock::force(&IMAGE_NAME_REGEX);
        LazyLock::force(&DEVICE_NAME_REGEX);
    }

    #[test]
    fn test_cidr() {
        assert!(validate_cidr("10.0.0.0/16").is_ok());
        assert_eq!(
            validate_cidr("10.0.0.0/36"),
            Err(ValidationError::InvalidCidr("10.0.0.0/36".to_string()))
        );
        assert_eq!(
            validate_cidr("10.0.0.256/16"),
            Err(ValidationError::InvalidCidr("10.0.0.256/16".to_string()))
        );
        assert!(validate_cidr("").is_err());
    }

    #[test]
    fn test_tag_name() {
        assert!(validate_tag_name("test-net_1 (a).b/c").is_ok());
        assert!(validate_tag_name("test@net").is_err());
        assert!(validate_tag_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_port_protocol_flow() {
        assert!(validate_port(0).is_ok());
        assert!(validate_port(65535).is_ok());
        assert_eq!(validate_port(65536), Err(ValidationError::InvalidPort(65536)));
        assert!(validate_port(-1).is_err());

        assert!(validate_ip_protocol("-1").is_ok());
        assert!(validate_ip_protocol("sctp").is_err());
        assert!(validate_flow("Inbound").is_ok());
        assert!(validate_flow("inbound").is_err());
    }

    #[test]
    fn test_duplicates_report_first_repeat() {
        let err = check_duplicates(["test-subnet", "other", "test-subnet"]).unwrap_err();
        assert_eq!(err.to_string(), "test-subnet already exist");
        assert!(check_duplicates(["a", "b"]).is_ok());
    }

    #[test]
    fn test_default_cluster_is_valid() {
        let spec = resolve_cluster(ClusterSpec::default());
        validate_cluster(&spec).unwrap();
    }

    #[test]
    fn test_duplicate_subnets_rejected() {
        let spec = resolve_cluster(ClusterSpec {
            network: NetworkSpec {
                subnets: vec![
                    subnet("test-subnet", "10.0.1.0/24"),
                    subnet("test-subnet", "10.0.2.0/24"),
                ],
                ..Default::default()
            },
        });
        let err = validate_cluster(&spec).unwrap_err();
        assert_eq!(err, ValidationError::Duplicate("test-subnet".to_string()));
        assert_eq!(err.to_string(), "test-subnet already exist");
    }

    #[test]
    fn test_subnet_must_fit_net_and_not_overlap() {
        let outside = resolve_cluster(ClusterSpec {
            network: NetworkSpec {
                subnets: vec![subnet("a", "192.168.0.0/24")],
                ..Default::default()
            },
        });
        assert!(matches!(
            validate_cluster(&outside),
            Err(ValidationError::SubnetOutsideNet { .. })
        ));

        let overlap = resolve_cluster(ClusterSpec {
            network: NetworkSpec {
                subnets: vec![subnet("a", "10.0.0.0/23"), subnet("b", "10.0.1.0/24")],
                ..Default::default()
            },
        });
        assert_eq!(
            validate_cluster(&overlap),
            Err(ValidationError::SubnetOverlap("b".to_string(), "a".to_string()))
        );
    }

    #[test]
    fn test_route_table_unknown_subnet() {
        let mut raw = ClusterSpec::default();
        raw.network.route_tables = vec![RouteTableSpec {
            name: "rt".to_string(),
            subnets: vec!["missing".to_string()],
            routes: vec![RouteSpec {
                name: "r".to_string(),
                target_name: "cluster-api-internetservice".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }];
        let err = validate_cluster(&resolve_cluster(raw)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownReference {
                owner: "rt".to_string(),
                kind: "subnet",
                name: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_load_balancer_checks() {
        let mut raw = ClusterSpec::default();
        raw.network.load_balancer.load_balancer_name = "bad_name".to_string();
        assert!(matches!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::InvalidLoadBalancerName(_))
        ));

        let mut raw = ClusterSpec::default();
        raw.network.load_balancer.listener.load_balancer_protocol = "HTTPS".to_string();
        let err = validate_cluster(&resolve_cluster(raw)).unwrap_err();
        assert_eq!(err.to_string(), "SSL certificate is required");

        let mut raw = ClusterSpec::default();
        raw.network.load_balancer.health_check.check_interval = 601;
        assert!(matches!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::InvalidHealthCheck { field: "interval", .. })
        ));

        let mut raw = ClusterSpec::default();
        raw.network.load_balancer.security_group_name = "nope".to_string();
        assert!(matches!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::UnknownReference { kind: "security group", .. })
        ));
    }

    #[test]
    fn test_rule_port_order() {
        let mut raw = ClusterSpec::default();
        raw.network.security_groups = vec![crate::spec::SecurityGroupSpec {
            name: "sg".to_string(),
            security_group_rules: vec![SecurityGroupRuleSpec {
                name: "r".to_string(),
                flow: "Inbound".to_string(),
                ip_protocol: "tcp".to_string(),
                ip_range: "0.0.0.0/0".to_string(),
                from_port_range: 443,
                to_port_range: 80,
            }],
            ..Default::default()
        }];
        raw.network.load_balancer.security_group_name = "sg".to_string();
        assert_eq!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::InvalidPortRange { from: 443, to: 80 })
        );
    }

    #[test]
    fn test_machine_checks() {
        let cluster = resolve_cluster(ClusterSpec::default());

        let ok = machine(VmSpec {
            image_id: "ami-0123abcd".to_string(),
            private_ips: vec!["10.0.3.10".to_string()],
            ..Default::default()
        });
        validate_machine(&ok, &cluster).unwrap();

        let no_image = machine(VmSpec::default());
        assert_eq!(
            validate_machine(&no_image, &cluster),
            Err(ValidationError::Required("image id"))
        );

        let bad_type = machine(VmSpec {
            image_id: "ami-0123abcd".to_string(),
            vm_type: "m5.large".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            validate_machine(&bad_type, &cluster),
            Err(ValidationError::InvalidVmType(_))
        ));

        let outside = machine(VmSpec {
            image_id: "ami-0123abcd".to_string(),
            private_ips: vec!["10.0.4.10".to_string()],
            ..Default::default()
        });
        assert!(matches!(
            validate_machine(&outside, &cluster),
            Err(ValidationError::PrivateIpOutsideSubnet { .. })
        ));
    }

    #[test]
    fn test_volume_checks() {
        let mut volume = VolumeSpec {
            name: "data".to_string(),
            device_name: "/dev/xvdb".to_string(),
            size: 10,
            volume_type: "standard".to_string(),
            ..Default::default()
        };
        validate_volume(&volume).unwrap();

        volume.iops = 500;
        assert!(matches!(
            validate_volume(&volume),
            Err(ValidationError::IopsNotSupported(_))
        ));

        volume.volume_type = "io1".to_string();
        validate_volume(&volume).unwrap();

        volume.iops = 20000;
        assert_eq!(validate_volume(&volume), Err(ValidationError::InvalidIops(20000)));

        volume.iops = 500;
        volume.device_name = "/dev/vdb".to_string();
        assert!(matches!(
            validate_volume(&volume),
            Err(ValidationError::InvalidDeviceName(_))
        ));
    }

    #[test]
    fn test_subnet_links_one_route_table() {
        let mut raw = ClusterSpec::default();
        let mut routes = resolve_cluster(ClusterSpec::default()).network().route_tables.clone();
        let mut extra = routes[0].clone();
        extra.name = "test-routetable-extra".to_string();
        routes.push(extra);
        raw.network.route_tables = routes;

        assert_eq!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::SubnetLinkedTwice {
                subnet: "cluster-api-subnet-kw".to_string(),
                first: "cluster-api-routetable-kw".to_string(),
                second: "test-routetable-extra".to_string(),
            })
        );
    }

    #[test]
    fn test_image_name_or_id() {
        assert!(validate_image("", "ubuntu-22.04 (lts)").is_ok());
        // A name wins over a malformed id.
        assert!(validate_image("ubuntu", "ubuntu-22.04").is_ok());
        assert!(matches!(
            validate_image("", "ubuntu@22.04"),
            Err(ValidationError::InvalidImageName(_))
        ));
        assert_eq!(validate_image("", ""), Err(ValidationError::Required("image id")));
        assert!(matches!(
            validate_image("ubuntu", ""),
            Err(ValidationError::InvalidImageId(_))
        ));
    }

    #[test]
    fn test_bastion_checks() {
        let mut raw = ClusterSpec::default();
        raw.network.bastion.enable = true;
        validate_cluster(&resolve_cluster(raw.clone())).unwrap();

        raw.network.bastion.subnet_name = "missing".to_string();
        assert_eq!(
            validate_cluster(&resolve_cluster(raw.clone())),
            Err(ValidationError::UnknownReference {
                owner: "cluster-api-vm-bastion".to_string(),
                kind: "subnet",
                name: "missing".to_string(),
            })
        );

        raw.network.bastion.subnet_name = String::new();
        raw.network.bastion.private_ips = vec!["10.0.3.10".to_string()];
        assert!(matches!(
            validate_cluster(&resolve_cluster(raw)),
            Err(ValidationError::PrivateIpOutsideSubnet { .. })
        ));
    }
}
