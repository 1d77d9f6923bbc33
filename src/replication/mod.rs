//! Replication - mirror pair orchestration between two arrays
//!
//! Provides:
//! - Path management: link discovery, path classification and creation
//! - Placement: container selection on both arrays
//! - Pair lifecycle: replica creation with rollback, teardown, resize
//! - Failover: pair reversal, failback choreography, role swaps
//! - Coordinator: the facade the volume manager calls

pub mod coordinator;
pub mod failover;
pub mod lifecycle;
pub mod lock;
pub mod paths;
pub mod placement;
pub mod retry;
pub mod session;
pub mod state;

pub use coordinator::ReplicationCoordinator;
pub use failover::{FailoverCoordinator, VolumeUpdate, OLD_STATUS_KEY};
pub use lifecycle::PairLifecycle;
pub use lock::{InMemoryLeaseManager, Lease, LeaseManager, LeaseManagerRef};
pub use paths::{PathClassification, PathHealth, PathManager, MAX_PORT_PAIRS};
pub use placement::{
    ContainerPlacement, Placement, PlacementAllocator, PlacementCandidate, PlacementEngine,
    PlacementOrigin,
};
pub use retry::RetryPolicy;
pub use session::{LinkSelection, ReplicationSession};
pub use state::{MirrorEvent, MirrorState};

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::array::{ArrayEndpoint, ConnectionType, InMemoryArray};
    use crate::config::{ArrayConfig, ReplicationConfig};
    use crate::domain::ports::{
        ArrayGateway, ArrayIdentity, PathId, PathPortPair, PortPair, PortState, ReplicationPath, Volume,
        VolumeType,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    /// The two physical links between the fixture arrays
    pub fn links() -> Vec<PortPair> {
        vec![PortPair::new("I0001", "I0101"), PortPair::new("I0002", "I0102")]
    }

    fn array_config(backend_id: &str, wwnn: &str, unit: &str, mainframe: bool) -> ArrayConfig {
        ArrayConfig {
            backend_id: backend_id.into(),
            storage_wwnn: wwnn.into(),
            storage_unit: unit.into(),
            connection_type: if mainframe {
                ConnectionType::FibreChannelEckd
            } else {
                ConnectionType::FibreChannel
            },
            device_mapping: BTreeMap::new(),
        }
    }

    /// Two linked in-memory arrays and the configuration that describes them
    pub struct Fixture {
        pub primary: Arc<InMemoryArray>,
        pub secondary: Arc<InMemoryArray>,
        config: ReplicationConfig,
    }

    impl Fixture {
        /// Block arrays: containers 00/01 on the primary, 10/11 on the secondary
        pub fn new() -> Self {
            let fixture = Self::bare();
            fixture.link();
            fixture
        }

        /// Block arrays without physical links
        pub fn bare() -> Self {
            let fixture = Self::build(false);
            fixture.primary.add_pool("P0", VolumeType::Block, 10_000);
            fixture.primary.add_container("00", "P0", 0);
            fixture.primary.add_container("01", "P0", 0);
            fixture.secondary.add_pool("P1", VolumeType::Block, 10_000);
            fixture.secondary.add_container("10", "P1", 0);
            fixture.secondary.add_container("11", "P1", 0);
            fixture
        }

        /// Mainframe arrays next to a block pool on each side
        pub fn mainframe() -> Self {
            let fixture = Self::build(true);
            fixture.primary.add_pool("P0", VolumeType::Block, 20_000);
            fixture.primary.add_container("00", "P0", 0);
            fixture.primary.add_pool("P2", VolumeType::Mainframe, 10_000);
            fixture.primary.add_container("80", "P2", 0);
            fixture.primary.add_container("81", "P2", 0);
            fixture.secondary.add_pool("P1", VolumeType::Block, 20_000);
            fixture.secondary.add_container("10", "P1", 0);
            fixture.secondary.add_pool("P3", VolumeType::Mainframe, 10_000);
            fixture.secondary.add_container("90", "P3", 0);
            fixture.link();
            fixture
        }

        fn build(mainframe: bool) -> Self {
            let primary = array_config("ds8k-a", "5000000000FFC111", "2107-1111111", mainframe);
            let secondary = array_config("ds8k-b", "5000000000FFD222", "2107-2222222", mainframe);
            Self {
                primary: Arc::new(InMemoryArray::new(primary.identity())),
                secondary: Arc::new(InMemoryArray::new(secondary.identity())),
                config: ReplicationConfig::new(primary, secondary),
            }
        }

        fn link(&self) {
            let forward = links();
            let reverse: Vec<PortPair> = forward.iter().map(PortPair::reversed).collect();
            self.primary
                .add_links(&self.secondary.identity().storage_wwnn, &forward);
            self.secondary
                .add_links(&self.primary.identity().storage_wwnn, &reverse);
        }

        pub fn config(&self) -> ReplicationConfig {
            self.config.clone()
        }

        /// Restrict the primary's mainframe containers to the given LCUs
        pub fn with_primary_device_mapping(mut self, containers: &[&str]) -> Self {
            for container in containers {
                self.config
                    .primary
                    .device_mapping
                    .insert(container.to_string(), format!("{}00-{}FF", container, container));
            }
            self
        }

        pub fn volume_type(&self) -> VolumeType {
            match self.config.primary.connection_type {
                ConnectionType::FibreChannel => VolumeType::Block,
                ConnectionType::FibreChannelEckd => VolumeType::Mainframe,
            }
        }

        /// Session with the fixture links already selected
        pub fn session(&self) -> ReplicationSession {
            self.session_with_links(links())
        }

        /// Session that has not selected any links yet
        pub fn discovering_session(&self) -> ReplicationSession {
            self.session_with_links(Vec::new())
        }

        pub fn session_with_links(&self, forward: Vec<PortPair>) -> ReplicationSession {
            ReplicationSession::new(
                ArrayEndpoint::from_config(self.primary.clone(), &self.config.primary),
                ArrayEndpoint::from_config(self.secondary.clone(), &self.config.secondary),
                LinkSelection::from_forward(forward),
            )
        }

        pub fn path_manager(&self) -> PathManager {
            PathManager::new(self.config.path_health.clone())
        }

        pub fn allocator(&self) -> PlacementAllocator {
            PlacementAllocator::new(Arc::new(self.path_manager()), Default::default())
        }

        pub fn lifecycle(&self) -> PairLifecycle {
            self.lifecycle_with_leases(Arc::new(InMemoryLeaseManager::new(Duration::from_secs(5))))
        }

        pub fn lifecycle_with_leases(&self, leases: Arc<InMemoryLeaseManager>) -> PairLifecycle {
            let paths = Arc::new(self.path_manager());
            PairLifecycle::new(
                paths.clone(),
                Arc::new(PlacementAllocator::new(paths, Default::default())),
                leases,
                self.config.leases.ttl(),
                self.config.pair_wait(),
                &self.config.primary.backend_id,
                &self.config.secondary.backend_id,
            )
        }

        pub fn failover(&self) -> FailoverCoordinator {
            FailoverCoordinator::new(Arc::new(self.path_manager()), self.config.pair_wait())
        }

        pub fn coordinator(&self) -> Arc<ReplicationCoordinator> {
            ReplicationCoordinator::new(
                self.config(),
                self.primary.clone(),
                self.secondary.clone(),
                Arc::new(InMemoryLeaseManager::new(Duration::from_secs(5))),
            )
            .unwrap()
        }

        /// Insert a path on the primary as if it had been created earlier
        pub fn add_path(&self, source: &str, target: &str, pairs: &[PortPair], healthy: bool) {
            let state = if healthy {
                PortState::Success
            } else {
                PortState::Failed
            };
            self.primary.add_path(ReplicationPath {
                id: PathId {
                    source_wwnn: self.primary.identity().storage_wwnn.clone(),
                    source_container: source.into(),
                    target_wwnn: self.secondary.identity().storage_wwnn.clone(),
                    target_container: target.into(),
                },
                port_pairs: pairs
                    .iter()
                    .map(|pair| PathPortPair {
                        pair: pair.clone(),
                        state,
                    })
                    .collect(),
            });
        }

        /// Unmirrored volume living on the primary
        pub fn volume(&self, id: &str, container: &str) -> Volume {
            Self::provisioned(&self.primary, self.volume_type(), id, container)
        }

        /// Unmirrored volume living on the secondary
        pub fn secondary_volume(&self, id: &str, container: &str) -> Volume {
            Self::provisioned(&self.secondary, self.volume_type(), id, container)
        }

        fn provisioned(array: &InMemoryArray, volume_type: VolumeType, id: &str, container: &str) -> Volume {
            let volume = Volume::new(id, 10, volume_type);
            let device_id = array.provision(&volume.name, volume.size_gb, container).unwrap();
            volume.with_device_id(device_id)
        }

        /// `count` volumes in container 00, each mirrored through `session`
        pub async fn mirrored_volumes(&self, session: &ReplicationSession, count: usize) -> Vec<Volume> {
            let lifecycle = self.lifecycle();
            let mut volumes = Vec::with_capacity(count);
            for i in 0..count {
                let mut volume = self.volume(&format!("v{}", i), "00");
                lifecycle.enable(session, &mut volume).await.unwrap();
                volumes.push(volume);
            }
            volumes
        }
    }

    #[test]
    fn test_fixture_identities_match_config() {
        let fixture = Fixture::new();
        let expected: ArrayIdentity = fixture.config().secondary.identity();
        assert_eq!(fixture.secondary.identity(), &expected);
    }
}
