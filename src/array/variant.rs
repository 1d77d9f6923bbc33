//! Hardware Variants
//!
//! Arrays are attached either as fixed-block (open systems) or as
//! mainframe-style count-key-data devices. The variant is chosen once when
//! the endpoint is built and answers the few questions where the two differ.

use crate::domain::ports::{ContainerInfo, VolumeType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Connection Type
// =============================================================================

/// How the volume manager attaches to the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Fibre channel, fixed-block volumes
    FibreChannel,
    /// Fibre channel, mainframe (ECKD) volumes
    FibreChannelEckd,
}

impl Default for ConnectionType {
    fn default() -> Self {
        ConnectionType::FibreChannel
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::FibreChannel => write!(f, "fibre_channel"),
            ConnectionType::FibreChannelEckd => write!(f, "fibre_channel_eckd"),
        }
    }
}

impl ConnectionType {
    /// Build the capability object for this connection type
    pub fn variant(self, device_mapping: &BTreeMap<String, String>) -> Arc<dyn ArrayVariant> {
        match self {
            ConnectionType::FibreChannel => Arc::new(BlockVariant),
            ConnectionType::FibreChannelEckd => Arc::new(MainframeVariant {
                device_mapping: device_mapping.clone(),
            }),
        }
    }
}

// =============================================================================
// Capability Interface
// =============================================================================

/// Per-variant behavior needed by the replication logic
pub trait ArrayVariant: Send + Sync + std::fmt::Debug {
    fn connection_type(&self) -> ConnectionType;

    /// Volume format every container used by this variant must hold
    fn volume_type(&self) -> VolumeType;

    /// Containers that may host mirrored volumes for this variant
    fn eligible_containers(&self, containers: &[ContainerInfo]) -> BTreeSet<String>;

    /// Whether both arrays must agree on thin provisioning
    fn requires_matching_provisioning(&self) -> bool;
}

/// Fixed-block arrays: any `fb` container is usable
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockVariant;

impl ArrayVariant for BlockVariant {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::FibreChannel
    }

    fn volume_type(&self) -> VolumeType {
        VolumeType::Block
    }

    fn eligible_containers(&self, containers: &[ContainerInfo]) -> BTreeSet<String> {
        containers
            .iter()
            .filter(|c| c.volume_type == VolumeType::Block)
            .map(|c| c.id.clone())
            .collect()
    }

    fn requires_matching_provisioning(&self) -> bool {
        false
    }
}

/// Mainframe arrays: `ckd` containers, narrowed to the configured LCU
/// mapping when one is given
#[derive(Debug, Clone, Default)]
pub struct MainframeVariant {
    /// LCU id -> device address range
    pub device_mapping: BTreeMap<String, String>,
}

impl ArrayVariant for MainframeVariant {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::FibreChannelEckd
    }

    fn volume_type(&self) -> VolumeType {
        VolumeType::Mainframe
    }

    fn eligible_containers(&self, containers: &[ContainerInfo]) -> BTreeSet<String> {
        containers
            .iter()
            .filter(|c| c.volume_type == VolumeType::Mainframe)
            .filter(|c| self.device_mapping.is_empty() || self.device_mapping.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect()
    }

    // Pairs cannot copy between space-efficient and standard ECKD volumes
    fn requires_matching_provisioning(&self) -> bool {
        true
    }
}
