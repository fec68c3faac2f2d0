//! Device plugin interface.
//!
//! The device plugin reports how many devices (GPUs) each node exposes.
//! Placement consumes it read-only to size node capacity.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rekon_id::NodeName;

use crate::error::ControllerResult;

/// Per-node device inventory.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    /// Allocatable device count per node.
    async fn allocatable(&self) -> ControllerResult<BTreeMap<NodeName, u32>>;
}

/// Fixed inventory, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDevicePlugin {
    nodes: BTreeMap<NodeName, u32>,
}

impl StaticDevicePlugin {
    pub fn new(nodes: impl IntoIterator<Item = (NodeName, u32)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DevicePlugin for StaticDevicePlugin {
    async fn allocatable(&self) -> ControllerResult<BTreeMap<NodeName, u32>> {
        Ok(self.nodes.clone())
    }
}
