//! Domain Ports - Core trait definitions for the mirror coordinator
//!
//! These types and traits define the boundary between the replication logic
//! and the storage arrays. Array transports implement [`ArrayGateway`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of volumes a container (LSS) can hold
pub const CONTAINER_CAPACITY: u32 = 256;

// =============================================================================
// Array Identity
// =============================================================================

/// Identity of one storage array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayIdentity {
    /// Backend name used by the volume manager (e.g. `ds8k-site-b`)
    pub backend_id: String,
    /// World wide node name, used to address links and paths
    pub storage_wwnn: String,
    /// Storage unit id, used to address mirror pairs
    pub storage_unit: String,
}

impl ArrayIdentity {
    pub fn new(
        backend_id: impl Into<String>,
        storage_wwnn: impl Into<String>,
        storage_unit: impl Into<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            storage_wwnn: storage_wwnn.into(),
            storage_unit: storage_unit.into(),
        }
    }
}

impl std::fmt::Display for ArrayIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_unit)
    }
}

/// Array system description returned by the liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub name: String,
    pub state: String,
}

// =============================================================================
// Containers and Pools
// =============================================================================

/// Volume format a container holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// Fixed-block (open systems)
    #[serde(rename = "fb")]
    Block,
    /// Count-key-data (mainframe)
    #[serde(rename = "ckd")]
    Mainframe,
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeType::Block => write!(f, "fb"),
            VolumeType::Mainframe => write!(f, "ckd"),
        }
    }
}

/// A container (LSS) as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Two hex digit container id
    pub id: String,
    /// Address group (server affinity)
    pub group: u8,
    /// Volume format
    pub volume_type: VolumeType,
    /// Number of volumes currently in the container
    pub volume_count: u32,
    /// Owning pool, if the container is bound to one
    pub pool_id: Option<String>,
}

impl ContainerInfo {
    /// Whether the container can take another volume
    pub fn has_free_slot(&self) -> bool {
        self.volume_count < CONTAINER_CAPACITY
    }
}

/// A pool as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: String,
    pub array_id: String,
    pub volume_type: VolumeType,
    pub free_capacity_bytes: u64,
    pub total_capacity_bytes: u64,
}

/// One side of a placement decision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolContainer {
    pub pool_id: String,
    pub container_id: String,
}

impl PoolContainer {
    pub fn new(pool_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            container_id: container_id.into(),
        }
    }
}

/// Matching (pool, container) choice on both arrays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPair {
    pub source: PoolContainer,
    pub target: PoolContainer,
}

// =============================================================================
// Links and Paths
// =============================================================================

/// A (source port, target port) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortPair {
    pub source_port: String,
    pub target_port: String,
}

impl PortPair {
    pub fn new(source_port: impl Into<String>, target_port: impl Into<String>) -> Self {
        Self {
            source_port: source_port.into(),
            target_port: target_port.into(),
        }
    }

    /// The same link seen from the other array
    pub fn reversed(&self) -> Self {
        Self {
            source_port: self.target_port.clone(),
            target_port: self.source_port.clone(),
        }
    }

    /// Parse a `;`-separated list such as `I0001-I0101;I0002-I0102`
    pub fn parse_list(s: &str) -> Result<Vec<PortPair>> {
        s.split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Render a list in the same `;`-separated form
    pub fn join(pairs: &[PortPair]) -> String {
        pairs
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.source_port, self.target_port)
    }
}

impl std::str::FromStr for PortPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('-') {
            Some((src, tgt)) if !src.trim().is_empty() && !tgt.trim().is_empty() => {
                Ok(PortPair::new(src.trim(), tgt.trim()))
            }
            _ => Err(Error::PortPairParse(format!(
                "expected <source_port>-<target_port>, got '{}'",
                s
            ))),
        }
    }
}

/// A physical link between two arrays
pub type PhysicalLink = PortPair;

/// State of one port pair inside a replication path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Success,
    Failed,
}

/// A port pair as used by a replication path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPortPair {
    pub pair: PortPair,
    pub state: PortState,
}

/// Identifier of a replication path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId {
    pub source_wwnn: String,
    pub source_container: String,
    pub target_wwnn: String,
    pub target_container: String,
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}:{}_{}",
            self.source_wwnn, self.source_container, self.target_wwnn, self.target_container
        )
    }
}

/// A replication path between a container on each array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPath {
    pub id: PathId,
    pub port_pairs: Vec<PathPortPair>,
}

impl ReplicationPath {
    pub fn source_container(&self) -> &str {
        &self.id.source_container
    }

    pub fn target_container(&self) -> &str {
        &self.id.target_container
    }

    /// A path is healthy when at least one of its port pairs succeeded
    pub fn is_healthy(&self) -> bool {
        self.port_pairs.iter().any(|p| p.state == PortState::Success)
    }

    /// Whether the path uses any of the given port pairs
    pub fn uses_any(&self, pairs: &[PortPair]) -> bool {
        self.port_pairs.iter().any(|p| pairs.contains(&p.pair))
    }
}

/// Request to create a replication path on the source array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSpec {
    pub target_wwnn: String,
    pub source_container: String,
    pub target_container: String,
    pub port_pairs: Vec<PortPair>,
}

// =============================================================================
// Mirror Pairs
// =============================================================================

/// Lifecycle state of a mirror pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    /// Initial copy in progress
    CopyPending,
    /// Fully mirrored
    FullDuplex,
    /// Replication stopped, target writable
    Suspended,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairState::CopyPending => write!(f, "copy_pending"),
            PairState::FullDuplex => write!(f, "full_duplex"),
            PairState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Options accepted when creating a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOption {
    PermitSpaceEfficientTarget,
    InitialCopyFull,
    Failover,
}

/// Source and target of one mirror pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumePair {
    pub source_volume: String,
    pub source_system: String,
    pub target_volume: String,
    pub target_system: String,
}

impl VolumePair {
    pub fn id(&self) -> PairId {
        PairId {
            source_system: self.source_system.clone(),
            source_volume: self.source_volume.clone(),
            target_system: self.target_system.clone(),
            target_volume: self.target_volume.clone(),
        }
    }
}

/// Identifier of a mirror pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId {
    pub source_system: String,
    pub source_volume: String,
    pub target_system: String,
    pub target_volume: String,
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}:{}_{}",
            self.source_system, self.source_volume, self.target_system, self.target_volume
        )
    }
}

/// Batched request to create (or reverse) mirror pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    pub pairs: Vec<VolumePair>,
    pub options: Vec<PairOption>,
}

/// Batched request to resync suspended pairs back to full duplex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailbackRequest {
    pub pair_ids: Vec<PairId>,
}

// =============================================================================
// Volumes
// =============================================================================

/// Replication status as persisted by the volume manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationStatus {
    Disabled,
    Enabled,
    FailedOver,
    Error,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        ReplicationStatus::Disabled
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStatus::Disabled => write!(f, "disabled"),
            ReplicationStatus::Enabled => write!(f, "enabled"),
            ReplicationStatus::FailedOver => write!(f, "failed-over"),
            ReplicationStatus::Error => write!(f, "error"),
        }
    }
}

/// The copy of a volume on a secondary array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    #[serde(rename = "vol_hex_id")]
    pub device_id: String,
}

/// A volume as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume manager id
    pub id: String,
    /// Display name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    pub volume_type: VolumeType,
    /// Four hex digit device id on the current primary
    pub device_id: Option<String>,
    /// Volume manager status (available, in-use, error, ...)
    pub status: String,
    pub replication_status: ReplicationStatus,
    /// Secondary backend id -> that array's copy
    pub replicas: BTreeMap<String, ReplicaRecord>,
    /// Driver private metadata owned by the volume manager
    pub provider_location: BTreeMap<String, String>,
    /// Placement for the operation in flight, never persisted
    #[serde(skip)]
    pub placement: Option<PlacementPair>,
}

impl Volume {
    pub fn new(id: impl Into<String>, size_gb: u64, volume_type: VolumeType) -> Self {
        let id = id.into();
        Self {
            name: format!("volume-{}", id),
            id,
            size_gb,
            volume_type,
            device_id: None,
            status: "available".to_string(),
            replication_status: ReplicationStatus::Disabled,
            replicas: BTreeMap::new(),
            provider_location: BTreeMap::new(),
            placement: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Container id derived from the device id's leading two digits
    pub fn container_id(&self) -> Option<&str> {
        self.device_id.as_deref().and_then(|id| id.get(0..2))
    }

    /// Device id, or an error naming the volume
    pub fn require_device_id(&self) -> Result<&str> {
        self.device_id
            .as_deref()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "device".into(),
                name: self.id.clone(),
            })
    }

    /// Serialized replica map as persisted by the volume manager
    pub fn replication_driver_data(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.replicas)?)
    }

    /// Load the replica map from its persisted form
    pub fn load_replication_driver_data(&mut self, data: &str) -> Result<()> {
        self.replicas = if data.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(data)?
        };
        Ok(())
    }

    /// Clear every replication field
    pub fn clear_replication(&mut self) {
        self.replication_status = ReplicationStatus::Disabled;
        self.replicas.clear();
    }
}

/// Request to create a volume on an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub size_gb: u64,
    pub volume_type: VolumeType,
    pub placement: PoolContainer,
}

// =============================================================================
// Array Gateway Port
// =============================================================================

/// Port for per-array operations
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Identity of the array behind this gateway
    fn identity(&self) -> &ArrayIdentity;

    /// Liveness probe
    async fn get_systems(&self) -> Result<Vec<SystemInfo>>;

    /// Re-establish the management session
    async fn reconnect(&self) -> Result<()>;

    /// Physical links from this array to the remote array
    async fn get_physical_links(&self, remote_wwnn: &str) -> Result<Vec<PhysicalLink>>;

    /// Replication paths sourced on this array, optionally for one container
    async fn get_paths(&self, container: Option<&str>) -> Result<Vec<ReplicationPath>>;

    /// One path; `ResourceNotFound` if it does not exist
    async fn get_path(&self, id: &PathId) -> Result<ReplicationPath>;

    async fn create_path(&self, spec: &PathSpec) -> Result<()>;

    async fn delete_path(&self, id: &PathId) -> Result<()>;

    async fn volume_count_in_container(&self, container: &str) -> Result<u32>;

    /// Pool a container is bound to, `None` if the pool has gone
    async fn pool_for_container(&self, container: &str) -> Result<Option<String>>;

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Pick a (pool, container) for a new volume of the given type.
    ///
    /// Implementations must return a container with fewer than
    /// [`CONTAINER_CAPACITY`] volumes, of the requested type, not in `excluded`.
    async fn allocate_container(
        &self,
        volume_type: VolumeType,
        excluded: &[String],
    ) -> Result<PoolContainer>;

    /// Create a volume and return its device id
    async fn create_volume(&self, request: &VolumeRequest) -> Result<String>;

    async fn delete_volume(&self, device_id: &str) -> Result<()>;

    async fn extend_volume(&self, device_id: &str, new_size_gb: u64) -> Result<()>;

    async fn volume_exists(&self, device_id: &str) -> Result<bool>;

    async fn create_pair(&self, request: &PairRequest) -> Result<()>;

    /// Delete the pair whose source volume lives on this array
    async fn delete_pair(&self, source_volume: &str) -> Result<()>;

    /// Block until every listed volume's pair reports `state`
    async fn wait_for_pair_state(
        &self,
        volume_ids: &[String],
        state: PairState,
        fail_on_timeout: bool,
        timeout: Duration,
    ) -> Result<()>;

    async fn run_failback(&self, request: &FailbackRequest) -> Result<()>;

    async fn thin_provisioning(&self) -> Result<bool>;

    async fn disable_thin_provisioning(&self) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ArrayGatewayRef = Arc<dyn ArrayGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_pair_parse_list() {
        let pairs = PortPair::parse_list("I0001-I0101; I0002-I0102").unwrap();
        assert_eq!(
            pairs,
            vec![PortPair::new("I0001", "I0101"), PortPair::new("I0002", "I0102")]
        );
        assert_eq!(PortPair::join(&pairs), "I0001-I0101;I0002-I0102");
        assert!(PortPair::parse_list("I0001").is_err());
        assert!(PortPair::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_path_health() {
        let id = PathId {
            source_wwnn: "5000000000FFC111".into(),
            source_container: "00".into(),
            target_wwnn: "5000000000FFD222".into(),
            target_container: "00".into(),
        };
        assert_eq!(id.to_string(), "5000000000FFC111_00:5000000000FFD222_00");

        let mut path = ReplicationPath {
            id,
            port_pairs: vec![
                PathPortPair {
                    pair: PortPair::new("I0001", "I0101"),
                    state: PortState::Failed,
                },
                PathPortPair {
                    pair: PortPair::new("I0002", "I0102"),
                    state: PortState::Success,
                },
            ],
        };
        assert!(path.is_healthy());
        path.port_pairs[1].state = PortState::Failed;
        assert!(!path.is_healthy());
    }

    #[test]
    fn test_replication_driver_data_format() {
        let mut volume = Volume::new("vol-1", 1, VolumeType::Block).with_device_id("1000");
        volume.replicas.insert(
            "ds8k-b".into(),
            ReplicaRecord {
                device_id: "2000".into(),
            },
        );
        let data = volume.replication_driver_data().unwrap();
        assert_eq!(data, r#"{"ds8k-b":{"vol_hex_id":"2000"}}"#);

        let mut restored = Volume::new("vol-1", 1, VolumeType::Block);
        restored.load_replication_driver_data(&data).unwrap();
        assert_eq!(restored.replicas, volume.replicas);
        assert_eq!(volume.container_id(), Some("10"));
    }

    #[test]
    fn test_display() {
        assert_eq!(VolumeType::Mainframe.to_string(), "ckd");
        assert_eq!(PairState::FullDuplex.to_string(), "full_duplex");
        assert_eq!(ReplicationStatus::FailedOver.to_string(), "failed-over");
    }
}
