//! In-Memory Array Gateway
//!
//! Simulates one storage array: pools, containers, volumes, physical links,
//! replication paths and mirror pairs are all tracked in memory. Supports
//! one-shot fault injection per operation, link and reachability flips, and
//! call counting so tests can assert on the remote traffic an operation caused.

use crate::domain::ports::{
    ArrayGateway, ArrayIdentity, ContainerInfo, FailbackRequest, PairOption, PairRequest,
    PairState, PathId, PathPortPair, PathSpec, PhysicalLink, PoolContainer, PoolInfo, PortPair,
    PortState, ReplicationPath, SystemInfo, VolumePair, VolumeRequest, VolumeType,
    CONTAINER_CAPACITY,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Operations
// =============================================================================

/// Gateway operations, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    GetSystems,
    Reconnect,
    GetPhysicalLinks,
    GetPaths,
    GetPath,
    CreatePath,
    DeletePath,
    VolumeCount,
    PoolForContainer,
    ListContainers,
    AllocateContainer,
    CreateVolume,
    DeleteVolume,
    ExtendVolume,
    VolumeExists,
    CreatePair,
    DeletePair,
    WaitForPairState,
    RunFailback,
    ThinProvisioning,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct VolumeRecord {
    name: String,
    size_gb: u64,
    pool_id: String,
    container_id: String,
}

#[derive(Debug, Clone)]
struct PairRecord {
    pair: VolumePair,
    state: PairState,
}

#[derive(Debug, Clone)]
struct Link {
    pair: PhysicalLink,
    up: bool,
}

#[derive(Debug)]
struct ArrayState {
    pools: BTreeMap<String, PoolInfo>,
    containers: BTreeMap<String, ContainerInfo>,
    volumes: BTreeMap<String, VolumeRecord>,
    links: BTreeMap<String, Vec<Link>>,
    paths: BTreeMap<PathId, ReplicationPath>,
    /// Keyed by source volume
    pairs: BTreeMap<String, PairRecord>,
    thin_provisioning: bool,
    online: bool,
    reconnectable: bool,
    /// New paths never report a successful port pair
    paths_never_heal: bool,
    /// Pairs settle in this state instead of the requested one
    stuck_pair_state: Option<PairState>,
    faults: BTreeSet<Operation>,
    calls: BTreeMap<Operation, u32>,
    pair_requests: Vec<PairRequest>,
    failback_requests: Vec<FailbackRequest>,
}

impl ArrayState {
    fn new() -> Self {
        Self {
            pools: BTreeMap::new(),
            containers: BTreeMap::new(),
            volumes: BTreeMap::new(),
            links: BTreeMap::new(),
            paths: BTreeMap::new(),
            pairs: BTreeMap::new(),
            thin_provisioning: false,
            online: true,
            reconnectable: true,
            paths_never_heal: false,
            stuck_pair_state: None,
            faults: BTreeSet::new(),
            calls: BTreeMap::new(),
            pair_requests: Vec::new(),
            failback_requests: Vec::new(),
        }
    }

    fn pool_of(&self, container: &str) -> Option<String> {
        self.containers
            .get(container)
            .and_then(|c| c.pool_id.clone())
            .filter(|pool| self.pools.contains_key(pool))
    }

    fn link_up(&self, pair: &PortPair) -> bool {
        self.links
            .values()
            .flatten()
            .any(|link| &link.pair == pair && link.up)
    }
}

// =============================================================================
// In-Memory Array
// =============================================================================

/// Simulated storage array implementing [`ArrayGateway`]
pub struct InMemoryArray {
    identity: ArrayIdentity,
    state: Mutex<ArrayState>,
}

impl InMemoryArray {
    /// Create an empty, reachable array
    pub fn new(identity: ArrayIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(ArrayState::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Topology setup
    // -------------------------------------------------------------------------

    pub fn add_pool(&self, id: &str, volume_type: VolumeType, capacity_gb: u64) {
        let pool = PoolInfo {
            id: id.to_string(),
            array_id: self.identity.storage_unit.clone(),
            volume_type,
            free_capacity_bytes: capacity_gb * GIB,
            total_capacity_bytes: capacity_gb * GIB,
        };
        self.state.lock().pools.insert(id.to_string(), pool);
    }

    /// Remove a pool; containers bound to it lose their pool
    pub fn remove_pool(&self, id: &str) {
        self.state.lock().pools.remove(id);
    }

    /// Add a container with `volume_count` placeholder volumes already in it
    pub fn add_container(&self, id: &str, pool_id: &str, volume_count: u32) {
        let mut state = self.state.lock();
        let volume_type = state
            .pools
            .get(pool_id)
            .map(|p| p.volume_type)
            .unwrap_or(VolumeType::Block);
        let group = u8::from_str_radix(id, 16).map(|n| n % 2).unwrap_or(0);
        state.containers.insert(
            id.to_string(),
            ContainerInfo {
                id: id.to_string(),
                group,
                volume_type,
                volume_count,
                pool_id: Some(pool_id.to_string()),
            },
        );
    }

    /// Set a container's occupancy directly
    pub fn set_volume_count(&self, container: &str, volume_count: u32) {
        if let Some(c) = self.state.lock().containers.get_mut(container) {
            c.volume_count = volume_count;
        }
    }

    /// Declare physical links towards a remote array
    pub fn add_links(&self, remote_wwnn: &str, pairs: &[PortPair]) {
        let mut state = self.state.lock();
        let links = state.links.entry(remote_wwnn.to_string()).or_default();
        links.extend(pairs.iter().cloned().map(|pair| Link { pair, up: true }));
    }

    /// Flip one physical link up or down; existing paths follow
    pub fn set_link_state(&self, pair: &PortPair, up: bool) {
        let mut state = self.state.lock();
        for link in state.links.values_mut().flatten() {
            if &link.pair == pair {
                link.up = up;
            }
        }
        let new_state = if up { PortState::Success } else { PortState::Failed };
        for path in state.paths.values_mut() {
            for port in path.port_pairs.iter_mut().filter(|p| &p.pair == pair) {
                port.state = new_state;
            }
        }
    }

    /// Insert an existing path as the array would report it
    pub fn add_path(&self, path: ReplicationPath) {
        self.state.lock().paths.insert(path.id.clone(), path);
    }

    pub fn set_thin_provisioning(&self, enabled: bool) {
        self.state.lock().thin_provisioning = enabled;
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Make the next call of `operation` fail
    pub fn inject_fault(&self, operation: Operation) {
        self.state.lock().faults.insert(operation);
    }

    /// Take the array offline (or bring it back)
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Whether `reconnect` brings an offline array back
    pub fn set_reconnectable(&self, reconnectable: bool) {
        self.state.lock().reconnectable = reconnectable;
    }

    pub fn set_paths_never_heal(&self, never_heal: bool) {
        self.state.lock().paths_never_heal = never_heal;
    }

    pub fn set_stuck_pair_state(&self, state: Option<PairState>) {
        self.state.lock().stuck_pair_state = state;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn call_count(&self, operation: Operation) -> u32 {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn pair_requests(&self) -> Vec<PairRequest> {
        self.state.lock().pair_requests.clone()
    }

    pub fn failback_requests(&self) -> Vec<FailbackRequest> {
        self.state.lock().failback_requests.clone()
    }

    pub fn pair_state(&self, source_volume: &str) -> Option<PairState> {
        self.state.lock().pairs.get(source_volume).map(|p| p.state)
    }

    /// Target volume of the pair sourced at `source_volume`
    pub fn pair_target(&self, source_volume: &str) -> Option<String> {
        self.state
            .lock()
            .pairs
            .get(source_volume)
            .map(|p| p.pair.target_volume.clone())
    }

    pub fn pair_count(&self) -> usize {
        self.state.lock().pairs.len()
    }

    pub fn has_volume(&self, device_id: &str) -> bool {
        self.state.lock().volumes.contains_key(device_id)
    }

    pub fn volume_size(&self, device_id: &str) -> Option<u64> {
        self.state.lock().volumes.get(device_id).map(|v| v.size_gb)
    }

    pub fn volume_total(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn path(&self, id: &PathId) -> Option<ReplicationPath> {
        self.state.lock().paths.get(id).cloned()
    }

    pub fn path_count(&self) -> usize {
        self.state.lock().paths.len()
    }

    pub fn volume_count(&self, container: &str) -> Option<u32> {
        self.state.lock().containers.get(container).map(|c| c.volume_count)
    }

    /// Create a volume outside of any replication flow
    pub fn provision(&self, name: &str, size_gb: u64, container: &str) -> Result<String> {
        let pool_id = self.state.lock().pool_of(container).ok_or_else(|| {
            Error::ResourceNotFound {
                kind: "pool".into(),
                name: container.into(),
            }
        })?;
        let volume_type = self
            .state
            .lock()
            .containers
            .get(container)
            .map(|c| c.volume_type)
            .unwrap_or(VolumeType::Block);
        self.insert_volume(&VolumeRequest {
            name: name.to_string(),
            size_gb,
            volume_type,
            placement: PoolContainer::new(pool_id, container),
        })
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn enter(&self, operation: Operation) -> Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_insert(0) += 1;

        if !state.online && operation != Operation::Reconnect {
            return Err(Error::ArrayUnreachable {
                array: self.identity.storage_unit.clone(),
            });
        }

        if state.faults.remove(&operation) {
            return Err(Error::BackendOperationFailed {
                array: self.identity.storage_unit.clone(),
                operation: operation.to_string(),
                reason: "injected fault".into(),
            });
        }

        Ok(())
    }

    fn not_found(kind: &str, name: impl Into<String>) -> Error {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    fn insert_volume(&self, request: &VolumeRequest) -> Result<String> {
        let mut state = self.state.lock();
        let container_id = &request.placement.container_id;

        let container = state
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Self::not_found("container", container_id.clone()))?;

        if container.volume_type != request.volume_type {
            return Err(Error::BackendOperationFailed {
                array: self.identity.storage_unit.clone(),
                operation: "create_volume".into(),
                reason: format!(
                    "container {} holds {} volumes, not {}",
                    container_id, container.volume_type, request.volume_type
                ),
            });
        }

        let bytes = request.size_gb * GIB;
        let pool = state
            .pools
            .get_mut(&request.placement.pool_id)
            .ok_or_else(|| Self::not_found("pool", request.placement.pool_id.clone()))?;
        if pool.free_capacity_bytes < bytes {
            return Err(Error::CapacityExhausted {
                array: self.identity.storage_unit.clone(),
                reason: format!("pool {} has not enough free capacity", pool.id),
            });
        }

        let full = || Error::CapacityExhausted {
            array: self.identity.storage_unit.clone(),
            reason: format!("container {} is full", container_id),
        };
        if !container.has_free_slot() {
            return Err(full());
        }
        let slot = (container.volume_count..CONTAINER_CAPACITY)
            .chain(0..container.volume_count)
            .map(|slot| format!("{}{:02X}", container_id, slot))
            .find(|id| !state.volumes.contains_key(id))
            .ok_or_else(full)?;

        if let Some(pool) = state.pools.get_mut(&request.placement.pool_id) {
            pool.free_capacity_bytes -= bytes;
        }
        if let Some(c) = state.containers.get_mut(container_id) {
            c.volume_count += 1;
        }
        state.volumes.insert(
            slot.clone(),
            VolumeRecord {
                name: request.name.clone(),
                size_gb: request.size_gb,
                pool_id: request.placement.pool_id.clone(),
                container_id: container_id.clone(),
            },
        );

        debug!(
            "{}: created volume {} ({}) in container {}",
            self.identity.storage_unit, slot, request.name, container_id
        );

        Ok(slot)
    }
}

#[async_trait]
impl ArrayGateway for InMemoryArray {
    fn identity(&self) -> &ArrayIdentity {
        &self.identity
    }

    async fn get_systems(&self) -> Result<Vec<SystemInfo>> {
        self.enter(Operation::GetSystems)?;
        Ok(vec![SystemInfo {
            id: self.identity.storage_unit.clone(),
            name: self.identity.backend_id.clone(),
            state: "online".into(),
        }])
    }

    async fn reconnect(&self) -> Result<()> {
        self.enter(Operation::Reconnect)?;
        let mut state = self.state.lock();
        if state.reconnectable {
            state.online = true;
            Ok(())
        } else {
            Err(Error::ArrayUnreachable {
                array: self.identity.storage_unit.clone(),
            })
        }
    }

    async fn get_physical_links(&self, remote_wwnn: &str) -> Result<Vec<PhysicalLink>> {
        self.enter(Operation::GetPhysicalLinks)?;
        Ok(self
            .state
            .lock()
            .links
            .get(remote_wwnn)
            .map(|links| links.iter().map(|l| l.pair.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_paths(&self, container: Option<&str>) -> Result<Vec<ReplicationPath>> {
        self.enter(Operation::GetPaths)?;
        Ok(self
            .state
            .lock()
            .paths
            .values()
            .filter(|p| container.map_or(true, |c| p.source_container() == c))
            .cloned()
            .collect())
    }

    async fn get_path(&self, id: &PathId) -> Result<ReplicationPath> {
        self.enter(Operation::GetPath)?;
        self.state
            .lock()
            .paths
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("path", id.to_string()))
    }

    async fn create_path(&self, spec: &PathSpec) -> Result<()> {
        self.enter(Operation::CreatePath)?;
        let mut state = self.state.lock();
        let port_pairs = spec
            .port_pairs
            .iter()
            .map(|pair| PathPortPair {
                pair: pair.clone(),
                state: if !state.paths_never_heal && state.link_up(pair) {
                    PortState::Success
                } else {
                    PortState::Failed
                },
            })
            .collect();
        let id = PathId {
            source_wwnn: self.identity.storage_wwnn.clone(),
            source_container: spec.source_container.clone(),
            target_wwnn: spec.target_wwnn.clone(),
            target_container: spec.target_container.clone(),
        };
        state.paths.insert(id.clone(), ReplicationPath { id, port_pairs });
        Ok(())
    }

    async fn delete_path(&self, id: &PathId) -> Result<()> {
        self.enter(Operation::DeletePath)?;
        self.state
            .lock()
            .paths
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("path", id.to_string()))
    }

    async fn volume_count_in_container(&self, container: &str) -> Result<u32> {
        self.enter(Operation::VolumeCount)?;
        self.state
            .lock()
            .containers
            .get(container)
            .map(|c| c.volume_count)
            .ok_or_else(|| Self::not_found("container", container))
    }

    async fn pool_for_container(&self, container: &str) -> Result<Option<String>> {
        self.enter(Operation::PoolForContainer)?;
        Ok(self.state.lock().pool_of(container))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.enter(Operation::ListContainers)?;
        Ok(self.state.lock().containers.values().cloned().collect())
    }

    async fn allocate_container(
        &self,
        volume_type: VolumeType,
        excluded: &[String],
    ) -> Result<PoolContainer> {
        self.enter(Operation::AllocateContainer)?;
        let state = self.state.lock();

        // Most free capacity first, then the emptiest container in that pool
        let mut pools: Vec<_> = state
            .pools
            .values()
            .filter(|p| p.volume_type == volume_type)
            .collect();
        pools.sort_by(|a, b| {
            b.free_capacity_bytes
                .cmp(&a.free_capacity_bytes)
                .then_with(|| a.id.cmp(&b.id))
        });

        for pool in pools {
            let best = state
                .containers
                .values()
                .filter(|c| c.pool_id.as_deref() == Some(pool.id.as_str()))
                .filter(|c| c.volume_type == volume_type && c.has_free_slot())
                .filter(|c| !excluded.contains(&c.id))
                .min_by(|a, b| a.volume_count.cmp(&b.volume_count).then_with(|| a.id.cmp(&b.id)));

            if let Some(container) = best {
                return Ok(PoolContainer::new(pool.id.clone(), container.id.clone()));
            }
        }

        Err(Error::CapacityExhausted {
            array: self.identity.storage_unit.clone(),
            reason: format!("no {} container with a free slot", volume_type),
        })
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<String> {
        self.enter(Operation::CreateVolume)?;
        self.insert_volume(request)
    }

    async fn delete_volume(&self, device_id: &str) -> Result<()> {
        self.enter(Operation::DeleteVolume)?;
        let mut state = self.state.lock();
        let record = state
            .volumes
            .remove(device_id)
            .ok_or_else(|| Self::not_found("volume", device_id))?;

        if let Some(c) = state.containers.get_mut(&record.container_id) {
            c.volume_count = c.volume_count.saturating_sub(1);
        }
        if let Some(pool) = state.pools.get_mut(&record.pool_id) {
            pool.free_capacity_bytes += record.size_gb * GIB;
        }
        debug!(
            "{}: deleted volume {} ({})",
            self.identity.storage_unit, device_id, record.name
        );
        Ok(())
    }

    async fn extend_volume(&self, device_id: &str, new_size_gb: u64) -> Result<()> {
        self.enter(Operation::ExtendVolume)?;
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get_mut(device_id)
            .ok_or_else(|| Self::not_found("volume", device_id))?;
        volume.size_gb = volume.size_gb.max(new_size_gb);
        Ok(())
    }

    async fn volume_exists(&self, device_id: &str) -> Result<bool> {
        self.enter(Operation::VolumeExists)?;
        Ok(self.state.lock().volumes.contains_key(device_id))
    }

    async fn create_pair(&self, request: &PairRequest) -> Result<()> {
        self.enter(Operation::CreatePair)?;
        let mut state = self.state.lock();
        state.pair_requests.push(request.clone());

        let settled = if request.options.contains(&PairOption::Failover) {
            PairState::Suspended
        } else {
            PairState::FullDuplex
        };
        let settled = state.stuck_pair_state.unwrap_or(settled);

        for pair in &request.pairs {
            if !state.volumes.contains_key(&pair.source_volume) {
                return Err(Self::not_found("volume", pair.source_volume.clone()));
            }
            state.pairs.insert(
                pair.source_volume.clone(),
                PairRecord {
                    pair: pair.clone(),
                    state: settled,
                },
            );
        }
        Ok(())
    }

    async fn delete_pair(&self, source_volume: &str) -> Result<()> {
        self.enter(Operation::DeletePair)?;
        self.state
            .lock()
            .pairs
            .remove(source_volume)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("pair", source_volume))
    }

    async fn wait_for_pair_state(
        &self,
        volume_ids: &[String],
        state: PairState,
        fail_on_timeout: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.enter(Operation::WaitForPairState)?;
        let lagging: Vec<String> = {
            let array = self.state.lock();
            volume_ids
                .iter()
                .filter(|id| array.pairs.get(*id).map(|p| p.state) != Some(state))
                .cloned()
                .collect()
        };

        if lagging.is_empty() {
            return Ok(());
        }

        if fail_on_timeout {
            return Err(Error::PairStateTimeout {
                volumes: lagging.join(","),
                state: state.to_string(),
                waited: timeout,
            });
        }

        warn!(
            "{}: pair(s) {} did not reach {} within {:?}",
            self.identity.storage_unit,
            lagging.join(","),
            state,
            timeout
        );
        Ok(())
    }

    async fn run_failback(&self, request: &FailbackRequest) -> Result<()> {
        self.enter(Operation::RunFailback)?;
        let mut state = self.state.lock();
        state.failback_requests.push(request.clone());
        let settled = state.stuck_pair_state.unwrap_or(PairState::FullDuplex);

        for id in &request.pair_ids {
            let record = state
                .pairs
                .get_mut(&id.source_volume)
                .ok_or_else(|| Self::not_found("pair", id.to_string()))?;
            record.pair.target_volume = id.target_volume.clone();
            record.pair.target_system = id.target_system.clone();
            record.state = settled;
        }
        Ok(())
    }

    async fn thin_provisioning(&self) -> Result<bool> {
        self.enter(Operation::ThinProvisioning)?;
        Ok(self.state.lock().thin_provisioning)
    }

    async fn disable_thin_provisioning(&self) -> Result<()> {
        self.enter(Operation::ThinProvisioning)?;
        self.state.lock().thin_provisioning = false;
        Ok(())
    }
}
