//! Placement and admission.
//!
//! Chooses a node for each new instance:
//! 1. Feasibility: node is schedulable, not overcommitted, and has at
//!    least the requested number of allocatable devices
//! 2. Scoring: fewest allocated devices, then fewest instances
//! 3. Tie-break: node name ascending
//!
//! Each node's capacity is guarded by its own lock. A successful `place`
//! records the binding under that lock, so two concurrent placements can
//! never both claim the last device on a node. There is no cluster-wide
//! lock; the node map lock is only taken for membership changes.
//!
//! A node can end up holding more than its capacity when the device plugin
//! reports a shrink or a restart adopts existing instances. Such a node is
//! overcommitted: it takes no new instances until releases bring it back
//! within capacity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rekon_id::{InstanceId, NodeName, ResourceName};
use tracing::{debug, info, warn};

use crate::device::DevicePlugin;
use crate::error::{ControllerError, ControllerResult};

/// Request to place one instance.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub instance_id: InstanceId,
    pub spec_name: ResourceName,
    pub devices: u32,
}

#[derive(Debug, Default)]
struct NodeState {
    capacity: u32,
    schedulable: bool,

    /// Device grants of instances bound to this node.
    bound: BTreeMap<InstanceId, u32>,
}

impl NodeState {
    fn allocated(&self) -> u32 {
        self.bound.values().sum()
    }

    fn allocatable(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated())
    }

    fn overcommitted(&self) -> bool {
        self.allocated() > self.capacity
    }

    fn fits(&self, devices: u32) -> bool {
        self.schedulable && !self.overcommitted() && self.allocatable() >= devices
    }
}

#[derive(Debug)]
struct Node {
    name: NodeName,
    state: Mutex<NodeState>,
}

impl Node {
    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: NodeName,
    pub capacity: u32,
    pub allocated: u32,
    pub instances: usize,
    pub schedulable: bool,
    pub overcommitted: bool,
}

impl NodeStatus {
    pub fn allocatable(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated)
    }
}

/// Node inventory and capacity accounting.
#[derive(Debug, Default)]
pub struct Placement {
    nodes: RwLock<BTreeMap<NodeName, Arc<Node>>>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an inventory from `(name, device capacity)` pairs.
    pub fn with_nodes(nodes: impl IntoIterator<Item = (NodeName, u32)>) -> Self {
        let placement = Self::new();
        for (name, capacity) in nodes {
            placement.upsert_node(name, capacity);
        }
        placement
    }

    fn node_list(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn node(&self, name: &NodeName) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Add a node, or update the device capacity of a known one.
    pub fn upsert_node(&self, name: NodeName, capacity: u32) {
        if let Some(node) = self.node(&name) {
            let mut state = node.lock();
            if state.capacity != capacity {
                debug!(node_id = %name, old = state.capacity, new = capacity, "Node capacity changed");
            }
            let was_overcommitted = state.overcommitted();
            state.capacity = capacity;
            if state.overcommitted() && !was_overcommitted {
                warn!(
                    node_id = %name,
                    capacity,
                    allocated = state.allocated(),
                    "Node capacity dropped below current allocation, cordoned until drained"
                );
            }
            return;
        }

        info!(node_id = %name, capacity, "Registered node");
        let node = Arc::new(Node {
            name: name.clone(),
            state: Mutex::new(NodeState {
                capacity,
                schedulable: true,
                bound: BTreeMap::new(),
            }),
        });
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_insert(node);
    }

    /// Mark a node (un)schedulable. Bound instances stay where they are.
    pub fn set_schedulable(&self, name: &NodeName, schedulable: bool) -> bool {
        match self.node(name) {
            Some(node) => {
                node.lock().schedulable = schedulable;
                true
            }
            None => false,
        }
    }

    /// Refresh node capacities from the device plugin.
    pub async fn sync_capacity(&self, plugin: &dyn DevicePlugin) -> ControllerResult<()> {
        for (name, capacity) in plugin.allocatable().await? {
            self.upsert_node(name, capacity);
        }
        Ok(())
    }

    /// Select a node for the request and bind the instance to it.
    pub fn place(&self, request: &PlacementRequest) -> ControllerResult<NodeName> {
        let nodes = self.node_list();

        let mut candidates: Vec<_> = nodes
            .iter()
            .filter_map(|node| {
                let state = node.lock();
                state
                    .fits(request.devices)
                    .then(|| (state.allocated(), state.bound.len(), node))
            })
            .collect();

        candidates.sort_by(|a, b| (a.0, a.1, &a.2.name).cmp(&(b.0, b.1, &b.2.name)));

        for (_, _, node) in candidates {
            let mut state = node.lock();
            // Re-check: another placement may have taken the capacity since scoring.
            if !state.fits(request.devices) {
                continue;
            }
            state.bound.insert(request.instance_id, request.devices);

            debug!(
                instance_id = %request.instance_id,
                spec = %request.spec_name,
                node_id = %node.name,
                devices = request.devices,
                allocatable = state.allocatable(),
                "Placed instance"
            );
            return Ok(node.name.clone());
        }

        Err(ControllerError::Unschedulable(format!(
            "no schedulable node has {} free device(s) ({} node(s) known)",
            request.devices,
            nodes.len()
        )))
    }

    /// Release the capacity held by an instance. Idempotent.
    pub fn release(&self, node: &NodeName, instance_id: &InstanceId) -> bool {
        let Some(node) = self.node(node) else {
            return false;
        };
        let released = node.lock().bound.remove(instance_id).is_some();
        if released {
            debug!(instance_id = %instance_id, node_id = %node.name, "Released capacity");
        }
        released
    }

    /// Record a binding that already exists in the runtime.
    ///
    /// Used when the observed state shows an instance placement does not
    /// know about (e.g. after a controller restart). The instance is already
    /// running, so it is recorded even past capacity; the node is then
    /// overcommitted and takes nothing new until it drains.
    pub fn adopt(&self, node: &NodeName, instance_id: InstanceId, devices: u32) -> bool {
        let Some(node) = self.node(node) else {
            return false;
        };
        let mut state = node.lock();
        if state.bound.contains_key(&instance_id) {
            return false;
        }
        state.bound.insert(instance_id, devices);
        if state.overcommitted() {
            warn!(
                instance_id = %instance_id,
                node_id = %node.name,
                capacity = state.capacity,
                allocated = state.allocated(),
                "Adopted instance overcommits node, cordoned until drained"
            );
        }
        true
    }

    /// Returns true if the instance holds capacity on the node.
    pub fn is_bound(&self, node: &NodeName, instance_id: &InstanceId) -> bool {
        self.node(node)
            .is_some_and(|n| n.lock().bound.contains_key(instance_id))
    }

    /// Snapshot of all nodes, ordered by name.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.node_list()
            .iter()
            .map(|node| {
                let state = node.lock();
                NodeStatus {
                    name: node.name.clone(),
                    capacity: state.capacity,
                    allocated: state.allocated(),
                    instances: state.bound.len(),
                    schedulable: state.schedulable,
                    overcommitted: state.overcommitted(),
                }
            })
            .collect()
    }
}
