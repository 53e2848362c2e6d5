//! In-process ACL provider.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use super::{AclError, AclProvider, AclRange, PortPair};

/// Which calls to fail, per port pair.
#[derive(Debug, Default)]
struct Faults {
    list: HashMap<PortPair, AclError>,
    add: HashMap<PortPair, AclError>,
    remove: HashMap<PortPair, AclError>,
}

/// [`AclProvider`] keeping rules in memory, with per-pair fault injection.
#[derive(Debug, Default)]
pub struct InMemoryAclProvider {
    rules: RwLock<BTreeMap<PortPair, BTreeSet<String>>>,
    faults: RwLock<Faults>,
    calls: RwLock<Vec<(&'static str, PortPair)>>,
}

impl InMemoryAclProvider {
    /// Create a provider with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rules for `ports` directly.
    pub fn insert(&self, ports: PortPair, ranges: impl IntoIterator<Item = String>) {
        self.rules.write().entry(ports).or_default().extend(ranges);
    }

    /// Current ranges on `ports`.
    #[must_use]
    pub fn ranges_for(&self, ports: PortPair) -> BTreeSet<String> {
        self.rules.read().get(&ports).cloned().unwrap_or_default()
    }

    /// Every rule as a flat, ordered list.
    #[must_use]
    pub fn ranges(&self) -> Vec<AclRange> {
        self.rules
            .read()
            .iter()
            .flat_map(|(ports, cidrs)| {
                cidrs.iter().map(|cidr| AclRange {
                    cidr: cidr.clone(),
                    ports: *ports,
                })
            })
            .collect()
    }

    /// Fail every `list` on `ports` with `error` until cleared.
    pub fn fail_list(&self, ports: PortPair, error: AclError) {
        self.faults.write().list.insert(ports, error);
    }

    /// Fail every `add` on `ports` with `error` until cleared.
    pub fn fail_add(&self, ports: PortPair, error: AclError) {
        self.faults.write().add.insert(ports, error);
    }

    /// Fail every `remove` on `ports` with `error` until cleared.
    pub fn fail_remove(&self, ports: PortPair, error: AclError) {
        self.faults.write().remove.insert(ports, error);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        *self.faults.write() = Faults::default();
    }

    /// Mutating calls received, as `("add" | "remove", ports)`.
    #[must_use]
    pub fn mutations(&self) -> Vec<(&'static str, PortPair)> {
        self.calls.read().clone()
    }
}

impl AclProvider for InMemoryAclProvider {
    async fn list(&self, ports: PortPair) -> Result<BTreeSet<String>, AclError> {
        if let Some(err) = self.faults.read().list.get(&ports) {
            return Err(err.clone());
        }
        Ok(self.ranges_for(ports))
    }

    async fn add(&self, ranges: &BTreeSet<String>, ports: PortPair) -> Result<(), AclError> {
        self.calls.write().push(("add", ports));
        if let Some(err) = self.faults.read().add.get(&ports) {
            return Err(err.clone());
        }
        self.rules
            .write()
            .entry(ports)
            .or_default()
            .extend(ranges.iter().cloned());
        Ok(())
    }

    async fn remove(&self, ranges: &BTreeSet<String>, ports: PortPair) -> Result<(), AclError> {
        self.calls.write().push(("remove", ports));
        if let Some(err) = self.faults.read().remove.get(&ports) {
            return Err(err.clone());
        }
        if let Some(existing) = self.rules.write().get_mut(&ports) {
            existing.retain(|r| !ranges.contains(r));
        }
        Ok(())
    }
}
