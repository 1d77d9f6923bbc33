//! Replication Coordinator
//!
//! Facade over the path manager, placement allocator, pair lifecycle and
//! failover coordinator. Holds the current [`ReplicationSession`] and hands
//! each operation a snapshot of it.

use crate::array::ArrayEndpoint;
use crate::config::ReplicationConfig;
use crate::domain::ports::{ArrayGatewayRef, Volume};
use crate::error::{Error, Result};
use crate::replication::failover::{FailoverCoordinator, VolumeUpdate};
use crate::replication::lifecycle::PairLifecycle;
use crate::replication::lock::LeaseManagerRef;
use crate::replication::paths::PathManager;
use crate::replication::placement::{Placement, PlacementAllocator};
use crate::replication::session::{LinkSelection, ReplicationSession};
use crate::replication::state::MirrorState;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReplicationCoordinator {
    config: ReplicationConfig,
    session: RwLock<ReplicationSession>,
    paths: Arc<PathManager>,
    allocator: Arc<PlacementAllocator>,
    lifecycle: PairLifecycle,
    failover: FailoverCoordinator,
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.session.read();
        f.debug_struct("ReplicationCoordinator")
            .field("primary", &session.primary().name())
            .field("secondary", &session.secondary().name())
            .field("generation", &session.generation())
            .finish()
    }
}

impl ReplicationCoordinator {
    /// Build a coordinator for the configured arrays.
    ///
    /// The gateways must report the identities named in `config`.
    pub fn new(
        config: ReplicationConfig,
        primary: ArrayGatewayRef,
        secondary: ArrayGatewayRef,
        leases: LeaseManagerRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        for (gateway, expected) in [(&primary, &config.primary), (&secondary, &config.secondary)] {
            if gateway.identity().storage_wwnn != expected.storage_wwnn {
                return Err(Error::Configuration(format!(
                    "gateway for {} reports wwnn {}, expected {}",
                    expected.backend_id,
                    gateway.identity().storage_wwnn,
                    expected.storage_wwnn
                )));
            }
        }

        let primary = ArrayEndpoint::from_config(primary, &config.primary);
        let secondary = ArrayEndpoint::from_config(secondary, &config.secondary);
        let links = LinkSelection::from_forward(config.configured_port_pairs()?);
        let session = ReplicationSession::new(primary, secondary, links);

        let paths = Arc::new(PathManager::new(config.path_health.clone()));
        let allocator = Arc::new(PlacementAllocator::new(
            paths.clone(),
            config.reserved_containers()?,
        ));
        let lifecycle = PairLifecycle::new(
            paths.clone(),
            allocator.clone(),
            leases,
            config.leases.ttl(),
            config.pair_wait(),
            &config.primary.backend_id,
            &config.secondary.backend_id,
        );
        let failover = FailoverCoordinator::new(paths.clone(), config.pair_wait());

        Ok(Arc::new(Self {
            config,
            session: RwLock::new(session),
            paths,
            allocator,
            lifecycle,
            failover,
        }))
    }

    /// Check that the arrays can mirror each other and select the links.
    pub async fn initialize(&self) -> Result<()> {
        self.check_connection_type().await?;
        let links = self.check_links().await?;
        info!(
            "Replication from {} to {} initialized with {} port pair(s)",
            self.config.primary.backend_id,
            self.config.secondary.backend_id,
            links.forward.len()
        );
        Ok(())
    }

    /// Snapshot of the current session
    pub fn session(&self) -> ReplicationSession {
        self.session.read().clone()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    async fn check_connection_type(&self) -> Result<()> {
        let session = self.session();
        let primary = session.primary();
        let secondary = session.secondary();

        let (source, target) = (
            primary.variant.connection_type(),
            secondary.variant.connection_type(),
        );
        if source != target {
            return Err(Error::Configuration(format!(
                "the connection type of {} is {}, but of {} it is {}",
                primary.name(),
                source,
                secondary.name(),
                target
            )));
        }

        // Pairs cannot copy between thin and standard volumes of this variant
        if primary.variant.requires_matching_provisioning() {
            let (source_thin, target_thin) = futures::try_join!(
                primary.gateway.thin_provisioning(),
                secondary.gateway.thin_provisioning()
            )?;
            if source_thin != target_thin {
                warn!(
                    "Thin provisioning differs between {} and {}, disabling it on both",
                    primary.name(),
                    secondary.name()
                );
                primary.gateway.disable_thin_provisioning().await?;
                secondary.gateway.disable_thin_provisioning().await?;
            }
        }
        Ok(())
    }

    /// Validate or discover the port pairs and store them in the session.
    pub async fn check_links(&self) -> Result<LinkSelection> {
        let snapshot = self.session();
        let links = self.paths.check_links(&snapshot).await?;

        let mut current = self.session.write();
        if current.generation() == snapshot.generation() {
            *current = snapshot.with_links(links.clone());
        } else {
            warn!("Replication roles changed while checking links, keeping the newer session");
        }
        Ok(links)
    }

    pub async fn find_placement(&self, excluded: &[String]) -> Result<Placement> {
        self.allocator.find_placement(&self.session(), excluded).await
    }

    pub async fn enable(&self, volume: &mut Volume) -> Result<()> {
        self.lifecycle.enable(&self.session(), volume).await
    }

    pub async fn create_replica(
        &self,
        volume: &mut Volume,
        delete_source_on_failure: bool,
    ) -> Result<()> {
        self.lifecycle
            .create_replica(&self.session(), volume, delete_source_on_failure)
            .await
    }

    pub async fn create_replicated_volume(&self, volume: &mut Volume) -> Result<()> {
        self.lifecycle
            .create_replicated_volume(&self.session(), volume)
            .await
    }

    pub async fn delete_replica(&self, volume: &mut Volume) -> Result<()> {
        self.lifecycle.delete_replica(&self.session(), volume).await
    }

    pub async fn extend_replica(&self, volume: &Volume, new_size_gb: u64) -> Result<()> {
        self.lifecycle
            .extend_replica(&self.session(), volume, new_size_gb)
            .await
    }

    /// Reverse the pairs of `volumes` towards `target_id` without swapping
    /// roles. Returns the ids of the volumes that were moved.
    pub async fn failover(&self, volumes: &mut [Volume], target_id: &str) -> Result<Vec<String>> {
        self.check_target(target_id)?;
        self.failover
            .failover(&self.session(), volumes, target_id)
            .await
    }

    /// Fail over and make `target_id` the primary.
    ///
    /// Only the volumes that were actually moved have their ids rewritten.
    pub async fn failover_host(&self, volumes: &mut [Volume], target_id: &str) -> Result<()> {
        let moved = self.failover(volumes, target_id).await?;
        let mut current = self.session.write();
        let swapped = self
            .failover
            .role_swap_moved(&current, target_id, volumes, &moved);
        *current = swapped;
        Ok(())
    }

    /// Return service to the configured primary.
    ///
    /// Volumes that are still mirrored in the original direction (their
    /// copy was missing at failover) are left alone.
    pub async fn failback(&self, volumes: &mut [Volume], target_id: &str) -> Result<()> {
        self.check_target(target_id)?;
        let snapshot = self.session();

        let mut slots = Vec::new();
        let mut batch = Vec::new();
        for (slot, volume) in volumes.iter().enumerate() {
            if MirrorState::of(volume) == MirrorState::Mirrored {
                info!("Volume {} was not failed over, skipping it", volume.id);
                continue;
            }
            slots.push(slot);
            batch.push(volume.clone());
        }

        let result = self
            .failover
            .failback(&snapshot, &mut batch, target_id)
            .await;
        for (slot, volume) in slots.into_iter().zip(batch) {
            volumes[slot] = volume;
        }
        let restored = result?;

        let mut current = self.session.write();
        if current.generation() != snapshot.generation() {
            warn!("Replication roles changed during failback, replacing them anyway");
        }
        *current = restored;
        Ok(())
    }

    /// Swap roles and rewrite the volumes' ids to match.
    pub fn role_swap(&self, target_id: &str, volumes: &mut [Volume]) {
        let mut current = self.session.write();
        let swapped = self.failover.role_swap(&current, target_id, volumes);
        *current = swapped;
    }

    pub fn unreplicated_volume_failover(&self, volume: &mut Volume) -> Result<VolumeUpdate> {
        self.failover.unreplicated_volume_failover(volume)
    }

    fn check_target(&self, target_id: &str) -> Result<()> {
        if target_id != self.config.secondary.backend_id {
            return Err(Error::Configuration(format!(
                "unknown replication target {}, configured target is {}",
                target_id, self.config.secondary.backend_id
            )));
        }
        Ok(())
    }
}
