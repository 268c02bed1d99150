//! Ledger: persisted map from logical resource names to cloud IDs.
//!
//! One ledger belongs to one cluster or machine object. The host orchestrator
//! stores it in the object's status so identity survives restarts. Entries are
//! keyed by `(Kind, logical name)` where the logical name is the spec name
//! suffixed with the owning object's UID.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Resource kinds tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Net,
    Subnet,
    InternetService,
    PublicIp,
    NatService,
    RouteTable,
    Route,
    SecurityGroup,
    SecurityGroupRule,
    LoadBalancer,
    KeyPair,
    Volume,
    Vm,
    Image,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Net => "net",
            Kind::Subnet => "subnet",
            Kind::InternetService => "internetService",
            Kind::PublicIp => "publicIp",
            Kind::NatService => "natService",
            Kind::RouteTable => "routeTable",
            Kind::Route => "route",
            Kind::SecurityGroup => "securityGroup",
            Kind::SecurityGroupRule => "securityGroupRule",
            Kind::LoadBalancer => "loadBalancer",
            Kind::KeyPair => "keypair",
            Kind::Volume => "volume",
            Kind::Vm => "vm",
            Kind::Image => "image",
        }
    }

    /// Kinds whose identity can be recovered from the cloud `Name` tag.
    pub fn supports_tag_lookup(&self) -> bool {
        matches!(
            self,
            Kind::Net | Kind::NatService | Kind::SecurityGroup | Kind::RouteTable
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the stable logical name of a resource: `<spec name>-<owner uid>`.
pub fn logical_name(name: &str, uid: &str) -> String {
    format!("{}-{}", name, uid)
}

/// What the ledger knows about one logical resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub resource_id: String,
    /// IDs of association objects (route table links, public IP links, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_ids: Vec<String>,
}

/// Per-object identity map. Doubles as the convergence record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    entries: BTreeMap<Kind, BTreeMap<String, LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: Kind, name: &str) -> Option<&LedgerEntry> {
        self.entries.get(&kind).and_then(|m| m.get(name))
    }

    pub fn resource_id(&self, kind: Kind, name: &str) -> Option<&str> {
        self.get(kind, name)
            .map(|e| e.resource_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Resolve a dependency that must already have converged.
    pub fn require(&self, kind: Kind, name: &str) -> Result<String> {
        self.resource_id(kind, name)
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::unresolved(kind, name))
    }

    pub fn contains(&self, kind: Kind, name: &str) -> bool {
        self.resource_id(kind, name).is_some()
    }

    /// Record (or overwrite) the cloud ID of a logical resource.
    ///
    /// Link IDs of an existing entry are kept.
    pub fn set_resource_id(&mut self, kind: Kind, name: &str, resource_id: impl Into<String>) {
        let entry = self
            .entries
            .entry(kind)
            .or_default()
            .entry(name.to_string())
            .or_default();
        entry.resource_id = resource_id.into();
    }

    pub fn link_ids(&self, kind: Kind, name: &str) -> &[String] {
        self.get(kind, name)
            .map(|e| e.link_ids.as_slice())
            .unwrap_or_default()
    }

    /// Append a link ID unless it is already recorded.
    pub fn add_link_id(&mut self, kind: Kind, name: &str, link_id: impl Into<String>) {
        let link_id = link_id.into();
        let entry = self
            .entries
            .entry(kind)
            .or_default()
            .entry(name.to_string())
            .or_default();
        if !entry.link_ids.contains(&link_id) {
            entry.link_ids.push(link_id);
        }
    }

    pub fn clear_link_ids(&mut self, kind: Kind, name: &str) {
        if let Some(entry) = self.entries.get_mut(&kind).and_then(|m| m.get_mut(name)) {
            entry.link_ids.clear();
        }
    }

    pub fn remove(&mut self, kind: Kind, name: &str) -> Option<LedgerEntry> {
        let kind_entries = self.entries.get_mut(&kind)?;
        let removed = kind_entries.remove(name);
        if kind_entries.is_empty() {
            self.entries.remove(&kind);
        }
        removed
    }

    /// Iterate over all entries in `(kind, name)` order.
    pub fn iter(&self) -> impl Iterator<Item = (Kind, &str, &LedgerEntry)> {
        self.entries.iter().flat_map(|(kind, names)| {
            names
                .iter()
                .map(move |(name, entry)| (*kind, name.as_str(), entry))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_name_appends_uid() {
        assert_eq!(logical_name("test-net", "abc"), "test-net-abc");
    }

    #[test]
    fn test_set_and_require() {
        let mut ledger = Ledger::new();
        assert!(matches!(
            ledger.require(Kind::Net, "test-net-uid"),
            Err(ReconcileError::DependencyUnresolved { kind: Kind::Net, .. })
        ));

        ledger.set_resource_id(Kind::Net, "test-net-uid", "vpc-1");
        assert_eq!(ledger.require(Kind::Net, "test-net-uid").unwrap(), "vpc-1");
        assert!(ledger.contains(Kind::Net, "test-net-uid"));
        assert!(!ledger.contains(Kind::Subnet, "test-net-uid"));
    }

    #[test]
    fn test_empty_resource_id_is_not_resolved() {
        let mut ledger = Ledger::new();
        ledger.add_link_id(Kind::RouteTable, "rt-uid", "rtbassoc-1");
        assert!(ledger.resource_id(Kind::RouteTable, "rt-uid").is_none());
        assert_eq!(ledger.link_ids(Kind::RouteTable, "rt-uid"), ["rtbassoc-1"]);
    }

    #[test]
    fn test_links_survive_id_update_and_deduplicate() {
        let mut ledger = Ledger::new();
        ledger.set_resource_id(Kind::RouteTable, "rt-uid", "rtb-1");
        ledger.add_link_id(Kind::RouteTable, "rt-uid", "rtbassoc-1");
        ledger.add_link_id(Kind::RouteTable, "rt-uid", "rtbassoc-1");
        ledger.set_resource_id(Kind::RouteTable, "rt-uid", "rtb-2");

        let entry = ledger.get(Kind::RouteTable, "rt-uid").unwrap();
        assert_eq!(entry.resource_id, "rtb-2");
        assert_eq!(entry.link_ids, vec!["rtbassoc-1".to_string()]);
    }

    #[test]
    fn test_remove_drops_empty_kind() {
        let mut ledger = Ledger::new();
        ledger.set_resource_id(Kind::Subnet, "a-uid", "subnet-1");
        assert_eq!(ledger.len(), 1);
        let removed = ledger.remove(Kind::Subnet, "a-uid").unwrap();
        assert_eq!(removed.resource_id, "subnet-1");
        assert!(ledger.is_empty());
        assert!(ledger.remove(Kind::Subnet, "a-uid").is_none());
    }

    #[test]
    fn test_ledger_serializes_for_status_persistence() {
        let mut ledger = Ledger::new();
        ledger.set_resource_id(Kind::Net, "test-net-uid", "vpc-1");
        ledger.set_resource_id(Kind::RouteTable, "rt-uid", "rtb-1");
        ledger.add_link_id(Kind::RouteTable, "rt-uid", "rtbassoc-1");

        let json = serde_json::to_string(&ledger).unwrap();
        let restored: Ledger = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ledger);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["entries"]["Net"]["test-net-uid"]["resource_id"], "vpc-1");
        assert!(value["entries"]["Net"]["test-net-uid"].get("link_ids").is_none());
    }
}
