//! Registry data model: targets, instances, and snapshots (spec §3).

use std::collections::HashMap;
use std::time::Duration;

/// Immutable descriptor for one discovered service, built once at client creation.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub service_name: String,
    pub registry_addr: String,
    pub group: String,
    pub namespace_id: String,
    pub clusters: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// A registry-reported endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub address: String,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub metadata: HashMap<String, String>,
}

impl Instance {
    /// Passes `healthy ∧ enabled ∧ weight ≥ 1.0` (spec §3, "Valid endpoint").
    pub fn is_valid(&self) -> bool {
        self.healthy && self.enabled && self.weight >= 1.0
    }

    /// The 4-tuple used for snapshot-diff equality (spec §3).
    fn diff_key(&self) -> (f64, bool, bool) {
        (self.weight, self.healthy, self.enabled)
    }
}

/// The last published instance list, kept only by the poller for change detection.
///
/// Includes unhealthy and disabled instances — the diff is across the full reported set,
/// not just the valid subset that gets published to the resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceSnapshot {
    by_address: HashMap<String, (f64, bool, bool)>,
}

impl InstanceSnapshot {
    pub fn from_instances(instances: &[Instance]) -> Self {
        let mut by_address = HashMap::with_capacity(instances.len());
        for inst in instances {
            by_address.insert(inst.address.clone(), inst.diff_key());
        }
        Self { by_address }
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// Addresses present in `self` but absent from `other`.
    pub fn added_since(&self, other: &Self) -> Vec<&str> {
        self.by_address
            .keys()
            .filter(|addr| !other.by_address.contains_key(addr.as_str()))
            .map(|s| s.as_str())
            .collect()
    }

    /// Addresses present in `other` but absent from `self`.
    pub fn removed_since<'a>(&self, other: &'a Self) -> Vec<&'a str> {
        other.added_since(self)
    }

    /// Addresses present in both but with a differing weight/healthy/enabled tuple.
    pub fn changed_since(&self, other: &Self) -> Vec<&str> {
        self.by_address
            .iter()
            .filter_map(|(addr, key)| match other.by_address.get(addr) {
                Some(prev) if prev != key => Some(addr.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(addr: &str, weight: f64, healthy: bool, enabled: bool) -> Instance {
        Instance { address: addr.into(), weight, healthy, enabled, metadata: HashMap::new() }
    }

    #[test]
    fn valid_requires_healthy_enabled_and_weight() {
        assert!(inst("a:1", 1.0, true, true).is_valid());
        assert!(!inst("a:1", 0.5, true, true).is_valid());
        assert!(!inst("a:1", 1.0, false, true).is_valid());
        assert!(!inst("a:1", 1.0, true, false).is_valid());
    }

    #[test]
    fn snapshot_equality_ignores_ordering() {
        let a = InstanceSnapshot::from_instances(&[
            inst("a:1", 1.0, true, true),
            inst("b:1", 1.0, true, true),
        ]);
        let b = InstanceSnapshot::from_instances(&[
            inst("b:1", 1.0, true, true),
            inst("a:1", 1.0, true, true),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn diff_detects_added_removed_and_changed() {
        let before = InstanceSnapshot::from_instances(&[
            inst("a:1", 1.0, true, true),
            inst("b:1", 1.0, true, true),
        ]);
        let after = InstanceSnapshot::from_instances(&[
            inst("a:1", 0.5, true, true), // changed weight
            inst("c:1", 1.0, true, true), // added
        ]);

        assert_eq!(after.added_since(&before), vec!["c:1"]);
        assert_eq!(after.removed_since(&before), vec!["b:1"]);
        assert_eq!(after.changed_since(&before), vec!["a:1"]);
    }
}
