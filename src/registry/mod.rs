//! Node registry module
//!
//! This module owns the logical id to radio address mapping, per-node state,
//! and the inclusion and exclusion sets. Removal cascades into the delivery
//! queue so nothing addressed to a removed node is ever transmitted.

pub mod node;
pub mod persist;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Address, Error, LogicalId, Result, UNINCLUDED_ADDRESS};
use crate::delivery::DeliveryQueue;

pub use self::node::{Node, WakeupTable};
pub use self::persist::{load_state, save_state, PersistedState};

/// First address handed out by sequential allocation
pub const FIRST_ADDRESS: u32 = 1;

/// Persistable view of the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Logical id to address mapping
    pub addresses: BTreeMap<LogicalId, Address>,
    /// Next address the allocator hands out
    pub next_address: u32,
    /// Last alert state per address
    pub alert_states: BTreeMap<Address, u8>,
    /// Wakeup list position per address
    pub wakeup_cursors: BTreeMap<Address, u32>,
    /// Wakeup tables per address
    pub wakeup_tables: BTreeMap<Address, WakeupTable>,
    /// Nodes included and checking in
    pub active: BTreeSet<LogicalId>,
    /// Nodes already reported as missing
    pub excluded: BTreeSet<LogicalId>,
}

/// Identity and lifecycle bookkeeping for every known node
#[derive(Debug)]
pub struct NodeRegistry {
    addresses: HashMap<LogicalId, Address>,
    nodes: HashMap<Address, Node>,
    active: BTreeSet<LogicalId>,
    excluded: BTreeSet<LogicalId>,
    /// Kept as u32 so exhaustion of the u16 space is detectable
    next_address: u32,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        NodeRegistry {
            addresses: HashMap::new(),
            nodes: HashMap::new(),
            active: BTreeSet::new(),
            excluded: BTreeSet::new(),
            next_address: FIRST_ADDRESS,
        }
    }

    /// Grants an address to `logical_id` and activates the node.
    ///
    /// An already mapped id keeps its address unless `requested` names a
    /// different one. Unmapped ids get `requested` or the next sequential
    /// address. The node must make contact before `deadline`.
    pub fn grant_address(
        &mut self,
        logical_id: LogicalId,
        requested: Option<Address>,
        deadline: Instant,
    ) -> Result<Address> {
        let address = match (self.addresses.get(&logical_id).copied(), requested) {
            (Some(current), None) => current,
            (Some(current), Some(wanted)) if current == wanted => current,
            (_, Some(wanted)) => {
                self.bind(logical_id, wanted)?;
                wanted
            }
            (None, None) => {
                let allocated = self.allocate()?;
                self.bind(logical_id, allocated)?;
                allocated
            }
        };

        self.activate(logical_id, deadline)?;
        info!(logical_id, address, "Address granted");
        Ok(address)
    }

    /// Overwrites the address of `logical_id`, moving its state.
    ///
    /// Frames queued for the previous address, or for a node that held
    /// `address` before, are dropped. Returns the previous address, if any.
    pub fn update_address(
        &mut self,
        logical_id: LogicalId,
        address: Address,
        queue: &mut DeliveryQueue,
    ) -> Result<Option<Address>> {
        let previous = self.addresses.get(&logical_id).copied();
        if previous == Some(address) {
            return Ok(previous);
        }
        if self.bind(logical_id, address)?.is_some() {
            queue.purge(address);
        }
        if let Some(previous) = previous {
            queue.purge(previous);
        }
        info!(logical_id, address, ?previous, "Address updated");
        Ok(previous)
    }

    /// Marks a mapped node active with a fresh liveness deadline
    pub fn activate(&mut self, logical_id: LogicalId, deadline: Instant) -> Result<()> {
        let address = self
            .addresses
            .get(&logical_id)
            .copied()
            .ok_or(Error::UnknownNode(logical_id))?;
        if let Some(node) = self.nodes.get_mut(&address) {
            node.next_deadline = Some(deadline);
        }
        self.active.insert(logical_id);
        self.excluded.remove(&logical_id);
        Ok(())
    }

    /// Stops supervising a node without forgetting its address
    pub fn deactivate(&mut self, logical_id: LogicalId) {
        self.active.remove(&logical_id);
        self.excluded.remove(&logical_id);
    }

    /// Prepares a known node for a fresh inclusion handshake.
    ///
    /// Transient state and queued frames are dropped and the node is inactive
    /// until granted again. The address mapping survives.
    pub fn reset_for_inclusion(
        &mut self,
        logical_id: LogicalId,
        queue: &mut DeliveryQueue,
    ) -> Option<Address> {
        self.deactivate(logical_id);
        let address = self.addresses.get(&logical_id).copied()?;
        if let Some(node) = self.nodes.get_mut(&address) {
            node.reset();
        }
        let purged = queue.purge(address);
        debug!(logical_id, address, purged, "Node reset for inclusion");
        Some(address)
    }

    /// Forgets a node entirely. Removing an unknown node does nothing.
    pub fn remove(&mut self, logical_id: LogicalId, queue: &mut DeliveryQueue) -> Option<Address> {
        self.active.remove(&logical_id);
        self.excluded.remove(&logical_id);
        let address = self.addresses.remove(&logical_id)?;
        self.nodes.remove(&address);
        let purged = queue.purge(address);
        info!(logical_id, address, purged, "Node removed");
        Some(address)
    }

    /// Forgets whatever node holds `address`
    pub fn remove_address(
        &mut self,
        address: Address,
        queue: &mut DeliveryQueue,
    ) -> Option<LogicalId> {
        let logical_id = self.id_of(address)?;
        self.remove(logical_id, queue);
        Some(logical_id)
    }

    /// Records that `logical_id` has been reported missing.
    /// Returns false if it already was.
    pub fn mark_excluded(&mut self, logical_id: LogicalId) -> bool {
        self.excluded.insert(logical_id)
    }

    /// Active nodes whose deadline has passed and that are not yet excluded
    pub fn overdue(&self, now: Instant) -> Vec<(LogicalId, Address)> {
        self.active
            .iter()
            .filter(|id| !self.excluded.contains(id))
            .filter_map(|id| {
                let address = *self.addresses.get(id)?;
                let deadline = self.nodes.get(&address)?.next_deadline?;
                (deadline < now).then_some((*id, address))
            })
            .collect()
    }

    pub fn address_of(&self, logical_id: LogicalId) -> Option<Address> {
        self.addresses.get(&logical_id).copied()
    }

    pub fn id_of(&self, address: Address) -> Option<LogicalId> {
        self.nodes.get(&address).map(|node| node.logical_id)
    }

    pub fn node(&self, address: Address) -> Option<&Node> {
        self.nodes.get(&address)
    }

    pub fn node_mut(&mut self, address: Address) -> Option<&mut Node> {
        self.nodes.get_mut(&address)
    }

    pub fn is_active(&self, logical_id: LogicalId) -> bool {
        self.active.contains(&logical_id)
    }

    /// True if `address` belongs to an active node
    pub fn is_active_address(&self, address: Address) -> bool {
        self.id_of(address)
            .map_or(false, |logical_id| self.is_active(logical_id))
    }

    pub fn is_excluded(&self, logical_id: LogicalId) -> bool {
        self.excluded.contains(&logical_id)
    }

    /// Number of mapped nodes
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Captures identity maps, per-node state, and the lifecycle sets
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot {
            addresses: self.addresses.iter().map(|(id, addr)| (*id, *addr)).collect(),
            next_address: self.next_address,
            active: self.active.clone(),
            excluded: self.excluded.clone(),
            ..RegistrySnapshot::default()
        };
        for (address, node) in &self.nodes {
            if let Some(state) = node.alert_state {
                snapshot.alert_states.insert(*address, state);
            }
            if node.wakeup_cursor > 0 {
                snapshot
                    .wakeup_cursors
                    .insert(*address, u32::try_from(node.wakeup_cursor).unwrap_or(u32::MAX));
            }
            if !node.wakeup_table.is_empty() {
                snapshot
                    .wakeup_tables
                    .insert(*address, node.wakeup_table.clone());
            }
        }
        snapshot
    }

    /// Rebuilds a registry from a snapshot.
    ///
    /// Liveness deadlines are not persisted; restored nodes are supervised
    /// again from their next contact.
    pub fn restore(snapshot: RegistrySnapshot) -> Self {
        let mut registry = NodeRegistry::new();
        for (logical_id, address) in snapshot.addresses {
            if address == UNINCLUDED_ADDRESS || registry.nodes.contains_key(&address) {
                warn!(logical_id, address, "Skipping conflicting address in snapshot");
                continue;
            }
            let mut node = Node::new(logical_id, address);
            node.alert_state = snapshot.alert_states.get(&address).copied();
            node.wakeup_cursor = snapshot
                .wakeup_cursors
                .get(&address)
                .map_or(0, |cursor| *cursor as usize);
            if let Some(table) = snapshot.wakeup_tables.get(&address) {
                node.wakeup_table = table.clone();
            }
            registry.addresses.insert(logical_id, address);
            registry.nodes.insert(address, node);
            registry.next_address = registry.next_address.max(u32::from(address) + 1);
        }
        registry.next_address = registry.next_address.max(snapshot.next_address);
        registry.active = snapshot
            .active
            .into_iter()
            .filter(|id| registry.addresses.contains_key(id))
            .collect();
        registry.excluded = snapshot
            .excluded
            .into_iter()
            .filter(|id| registry.addresses.contains_key(id))
            .collect();
        registry
    }

    fn allocate(&mut self) -> Result<Address> {
        while self.next_address <= u32::from(Address::MAX) {
            let candidate = self.next_address as Address;
            self.next_address += 1;
            if !self.nodes.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::registry("address space exhausted"))
    }

    /// Maps `logical_id` to `address`, carrying over any existing node state
    /// Maps `logical_id` to `address`. Returns the node displaced from it.
    fn bind(&mut self, logical_id: LogicalId, address: Address) -> Result<Option<LogicalId>> {
        if address == UNINCLUDED_ADDRESS {
            return Err(Error::registry(format!(
                "address {} is reserved for uncommitted nodes",
                UNINCLUDED_ADDRESS
            )));
        }

        let displaced = self.id_of(address).filter(|holder| *holder != logical_id);
        if let Some(holder) = displaced {
            warn!(address, holder, logical_id, "Address taken over from another node");
            self.addresses.remove(&holder);
            self.active.remove(&holder);
            self.excluded.remove(&holder);
            self.nodes.remove(&address);
        }

        let mut node = self
            .addresses
            .get(&logical_id)
            .and_then(|previous| self.nodes.remove(previous))
            .unwrap_or_else(|| Node::new(logical_id, address));
        node.address = address;

        self.addresses.insert(logical_id, address);
        self.nodes.insert(address, node);
        self.next_address = self.next_address.max(u32::from(address) + 1);
        Ok(displaced)
    }
}
