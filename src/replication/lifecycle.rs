//! Pair Lifecycle
//!
//! Creates and tears down the secondary copy of a volume together with the
//! mirror pair that keeps it in sync. Creation runs under the backend's
//! replication lease and is rolled back on any failure; teardown runs under
//! a per-volume lease.

use crate::domain::ports::{
    PairOption, PairRequest, PairState, ReplicaRecord, ReplicationStatus, Volume, VolumePair,
    VolumeRequest,
};
use crate::error::{Error, Result};
use crate::replication::lock::{
    replication_lease_name, volume_lease_name, Lease, LeaseManagerRef,
};
use crate::replication::paths::PathManager;
use crate::replication::placement::{ContainerPlacement, PlacementAllocator};
use crate::replication::session::ReplicationSession;
use crate::replication::state::{check_transition, MirrorEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct PairLifecycle {
    paths: Arc<PathManager>,
    allocator: Arc<PlacementAllocator>,
    leases: LeaseManagerRef,
    lease_ttl: Duration,
    pair_wait: Duration,
    /// Configured primary backend, names the leases
    backend_id: String,
    /// Configured secondary backend, keys the replica map
    replica_key: String,
}

impl PairLifecycle {
    pub fn new(
        paths: Arc<PathManager>,
        allocator: Arc<PlacementAllocator>,
        leases: LeaseManagerRef,
        lease_ttl: Duration,
        pair_wait: Duration,
        backend_id: impl Into<String>,
        replica_key: impl Into<String>,
    ) -> Self {
        Self {
            paths,
            allocator,
            leases,
            lease_ttl,
            pair_wait,
            backend_id: backend_id.into(),
            replica_key: replica_key.into(),
        }
    }

    /// Start mirroring a volume that already exists on the primary.
    ///
    /// The target container is chosen to match the volume's current
    /// container; unhealthy paths from that container are an error.
    pub async fn enable(&self, session: &ReplicationSession, volume: &mut Volume) -> Result<()> {
        check_transition(volume, MirrorEvent::Enable)?;
        let container = volume
            .container_id()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "device".into(),
                name: volume.id.clone(),
            })?
            .to_string();

        let lease = self.acquire_replication_lease().await?;
        let result = match self
            .allocator
            .find_placement_for_container(session, &container)
            .await
        {
            Ok(ContainerPlacement::Ready(placement)) => {
                volume.placement = Some(placement.pair);
                self.create_or_rollback(session, volume, false).await
            }
            Ok(ContainerPlacement::PathsUnhealthy) => Err(Error::PathUnhealthy {
                volume: volume.id.clone(),
                container,
            }),
            Err(e) => Err(e),
        };
        self.release(lease).await;

        result
    }

    /// Create the secondary copy of a volume whose placement is already set.
    ///
    /// On failure the secondary state is removed again and, when asked, the
    /// source volume too.
    pub async fn create_replica(
        &self,
        session: &ReplicationSession,
        volume: &mut Volume,
        delete_source_on_failure: bool,
    ) -> Result<()> {
        check_transition(volume, MirrorEvent::Enable)?;
        let lease = self.acquire_replication_lease().await?;
        let result = self
            .create_or_rollback(session, volume, delete_source_on_failure)
            .await;
        self.release(lease).await;
        result
    }

    /// Place, create and mirror a brand new volume in one critical section.
    pub async fn create_replicated_volume(
        &self,
        session: &ReplicationSession,
        volume: &mut Volume,
    ) -> Result<()> {
        check_transition(volume, MirrorEvent::Enable)?;
        let lease = self.acquire_replication_lease().await?;
        let result = self.place_and_create(session, volume).await;
        self.release(lease).await;
        result
    }

    async fn place_and_create(
        &self,
        session: &ReplicationSession,
        volume: &mut Volume,
    ) -> Result<()> {
        let placement = self.allocator.find_placement(session, &[]).await?;
        let primary = session.primary();
        let device_id = primary
            .gateway
            .create_volume(&VolumeRequest {
                name: volume.name.clone(),
                size_gb: volume.size_gb,
                volume_type: volume.volume_type,
                placement: placement.pair.source.clone(),
            })
            .await?;
        debug!("Created volume {} as {} on {}", volume.id, device_id, primary.name());

        volume.device_id = Some(device_id);
        volume.placement = Some(placement.pair);
        self.create_or_rollback(session, volume, true).await
    }

    async fn create_or_rollback(
        &self,
        session: &ReplicationSession,
        volume: &mut Volume,
        delete_source_on_failure: bool,
    ) -> Result<()> {
        match self.create_locked(session, volume).await {
            Ok(()) => {
                volume.replication_status = ReplicationStatus::Enabled;
                volume.placement = None;
                info!("Volume {} is mirrored to {}", volume.id, session.secondary().name());
                Ok(())
            }
            Err(e) => {
                error!("Failed to create replica for volume {}: {}", volume.id, e);
                self.rollback(session, volume, delete_source_on_failure).await;
                Err(e)
            }
        }
    }

    async fn create_locked(&self, session: &ReplicationSession, volume: &mut Volume) -> Result<()> {
        let placement = volume
            .placement
            .clone()
            .ok_or_else(|| Error::Internal(format!("volume {} has no placement", volume.id)))?;
        let source_device = volume.require_device_id()?.to_string();
        let primary = session.primary();
        let secondary = session.secondary();

        if !volume.replicas.is_empty() {
            info!("Removing leftover replica of volume {} first", volume.id);
            self.remove_replica(session, volume).await?;
        }

        let target_device = secondary
            .gateway
            .create_volume(&VolumeRequest {
                name: volume.name.clone(),
                size_gb: volume.size_gb,
                volume_type: volume.volume_type,
                placement: placement.target.clone(),
            })
            .await?;
        volume.replicas.insert(
            self.replica_key.clone(),
            ReplicaRecord {
                device_id: target_device.clone(),
            },
        );

        self.paths.ensure_path(session, &placement).await?;

        let pair = VolumePair {
            source_volume: source_device.clone(),
            source_system: primary.identity().storage_unit.clone(),
            target_volume: target_device,
            target_system: secondary.identity().storage_unit.clone(),
        };
        debug!("Creating mirror pair {}", pair.id());
        primary
            .gateway
            .create_pair(&PairRequest {
                pairs: vec![pair.clone()],
                options: vec![PairOption::PermitSpaceEfficientTarget, PairOption::InitialCopyFull],
            })
            .await?;
        primary
            .gateway
            .wait_for_pair_state(&[source_device], PairState::FullDuplex, true, self.pair_wait)
            .await?;
        info!("Mirror pair {} is {}", pair.id(), PairState::FullDuplex);

        Ok(())
    }

    async fn rollback(&self, session: &ReplicationSession, volume: &mut Volume, delete_source: bool) {
        if let Err(e) = self.remove_replica(session, volume).await {
            error!("Rollback of replica for volume {} failed: {}", volume.id, e);
        }

        if delete_source {
            if let Some(device_id) = volume.device_id.take() {
                if let Err(e) = session.primary().gateway.delete_volume(&device_id).await {
                    error!("Failed to delete source volume {}: {}", device_id, e);
                    volume.device_id = Some(device_id);
                }
            }
        }

        // Copies that could not be deleted stay recorded so a later
        // delete or enable can find them
        volume.replication_status = ReplicationStatus::Disabled;
        volume.placement = None;
        if !volume.replicas.is_empty() {
            warn!(
                "Volume {} keeps {} leftover replica record(s) after rollback",
                volume.id,
                volume.replicas.len()
            );
        }
    }

    /// Stop mirroring and delete the secondary copy.
    pub async fn delete_replica(&self, session: &ReplicationSession, volume: &mut Volume) -> Result<()> {
        check_transition(volume, MirrorEvent::Delete)?;
        let Some(device_id) = volume.device_id.clone() else {
            volume.clear_replication();
            return Ok(());
        };

        let name = volume_lease_name(&self.backend_id, &device_id);
        let lease = self.leases.acquire(&name, self.lease_ttl).await?;
        let result = self.remove_replica(session, volume).await;
        self.release(lease).await;

        result.map_err(|e| Error::ReplicaDeletionFailed {
            volume: device_id,
            reason: e.to_string(),
        })?;

        volume.clear_replication();
        info!("Replication of volume {} is removed", volume.id);
        Ok(())
    }

    /// Delete the pair and the secondary copies.
    ///
    /// Every step runs even when an earlier one failed; the first failure is
    /// returned. Copies that are gone are dropped from the replica map, the
    /// others stay. Missing pieces are fine; an unreachable secondary leaves
    /// its side behind.
    async fn remove_replica(&self, session: &ReplicationSession, volume: &mut Volume) -> Result<()> {
        let Some(device_id) = volume.device_id.clone() else {
            return Ok(());
        };
        let primary = session.primary();
        let secondary = session.secondary();
        let mut first_error = None;

        if let Err(e) = tolerate_missing(primary.gateway.delete_pair(&device_id).await) {
            error!("Failed to delete the mirror pair of {} on {}: {}", device_id, primary.name(), e);
            first_error.get_or_insert(e);
        }

        if !self.paths.is_secondary_alive(session).await {
            warn!(
                "{} is not reachable, leaving the replica of volume {} behind",
                secondary.name(),
                volume.id
            );
            return first_error.map_or(Ok(()), Err);
        }

        if volume.replicas.is_empty() {
            debug!("Volume {} has no replica recorded", volume.id);
        }

        let mut removed = Vec::new();
        for (key, replica) in volume.replicas.iter() {
            match self.remove_copy(session, &replica.device_id).await {
                Ok(()) => removed.push(key.clone()),
                Err(e) => {
                    error!(
                        "Failed to delete replica {} on {}: {}",
                        replica.device_id,
                        secondary.name(),
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        for key in removed {
            volume.replicas.remove(&key);
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Delete one copy on the secondary together with any reverse pair.
    ///
    /// The volume is deleted even when the pair could not be; the pair
    /// failure is still reported so the record is kept for a retry.
    async fn remove_copy(&self, session: &ReplicationSession, copy: &str) -> Result<()> {
        let secondary = session.secondary();

        // Reverse pair left behind by a failover
        let pair = tolerate_missing(secondary.gateway.delete_pair(copy).await);
        if let Err(e) = &pair {
            warn!("Failed to delete the reverse pair of {}: {}", copy, e);
        }

        if !secondary.gateway.volume_exists(copy).await? {
            debug!("Replica {} is already gone", copy);
            return pair;
        }
        tolerate_missing(secondary.gateway.delete_volume(copy).await)?;
        debug!("Deleted replica {} on {}", copy, secondary.name());
        pair
    }

    /// Grow every secondary copy to `new_size_gb`.
    pub async fn extend_replica(
        &self,
        session: &ReplicationSession,
        volume: &Volume,
        new_size_gb: u64,
    ) -> Result<()> {
        let secondary = session.secondary();
        for replica in volume.replicas.values() {
            secondary
                .gateway
                .extend_volume(&replica.device_id, new_size_gb)
                .await?;
            debug!(
                "Extended replica {} on {} to {}GiB",
                replica.device_id,
                secondary.name(),
                new_size_gb
            );
        }
        Ok(())
    }

    async fn acquire_replication_lease(&self) -> Result<Lease> {
        let name = replication_lease_name(&self.backend_id);
        self.leases.acquire(&name, self.lease_ttl).await
    }

    async fn release(&self, lease: Lease) {
        if let Err(e) = self.leases.release(&lease).await {
            warn!("Failed to release lease {}: {}", lease.name, e);
        }
    }
}

fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Operation;
    use crate::domain::ports::CONTAINER_CAPACITY;
    use crate::replication::fixtures::{links, Fixture};
    use crate::replication::lock::{InMemoryLeaseManager, LeaseManager};
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_enable_mirrors_existing_volume() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "01");

        lifecycle.enable(&session, &mut volume).await.unwrap();

        assert_eq!(volume.replication_status, ReplicationStatus::Enabled);
        let replica = volume.replicas.get("ds8k-b").unwrap();
        assert!(fixture.secondary.has_volume(&replica.device_id));
        let source = volume.device_id.as_deref().unwrap();
        assert_eq!(fixture.primary.pair_state(source), Some(PairState::FullDuplex));
        assert_eq!(fixture.primary.pair_target(source).as_deref(), Some(replica.device_id.as_str()));
        assert!(volume.placement.is_none());

        let request = &fixture.primary.pair_requests()[0];
        assert_eq!(
            request.options,
            vec![PairOption::PermitSpaceEfficientTarget, PairOption::InitialCopyFull]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_twice_is_rejected() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");

        lifecycle.enable(&session, &mut volume).await.unwrap();
        assert_matches!(
            lifecycle.enable(&session, &mut volume).await,
            Err(Error::InvalidTransition { .. })
        );
    }

    #[tokio::test]
    async fn test_enable_with_unhealthy_paths() {
        let fixture = Fixture::new();
        fixture.add_path("00", "10", &links(), false);
        let mut volume = fixture.volume("v1", "00");

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(result, Err(Error::PathUnhealthy { container, .. }) if container == "00");
        assert_eq!(fixture.secondary.call_count(Operation::CreateVolume), 0);
    }

    #[tokio::test]
    async fn test_enable_reuses_path_from_full_source_container() {
        let fixture = Fixture::new();
        fixture.add_path("00", "11", &links(), true);
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.set_volume_count("00", CONTAINER_CAPACITY);

        fixture.lifecycle().enable(&fixture.session(), &mut volume).await.unwrap();
        let replica = volume.replicas.get("ds8k-b").unwrap();
        assert!(replica.device_id.starts_with("11"));
        assert_eq!(fixture.primary.call_count(Operation::CreatePath), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_failure_rolls_back() {
        let fixture = Fixture::new();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.inject_fault(Operation::CreatePair);

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(result, Err(Error::BackendOperationFailed { .. }));

        assert_eq!(fixture.secondary.volume_total(), 0);
        assert_eq!(fixture.primary.pair_count(), 0);
        assert!(volume.replicas.is_empty());
        assert_eq!(volume.replication_status, ReplicationStatus::Disabled);
        // Source survives an enable rollback
        assert!(fixture.primary.has_volume(volume.device_id.as_deref().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_continues_after_pair_delete_failure() {
        let fixture = Fixture::new();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.inject_fault(Operation::CreatePair);
        fixture.primary.inject_fault(Operation::DeletePair);

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(
            result,
            Err(Error::BackendOperationFailed { operation, .. }) if operation == "CreatePair"
        );
        assert_eq!(fixture.primary.call_count(Operation::DeletePair), 1);
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert!(volume.replicas.is_empty());
        assert_eq!(volume.replication_status, ReplicationStatus::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_keeps_record_of_undeleted_copy() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.inject_fault(Operation::CreatePair);
        fixture.secondary.inject_fault(Operation::DeleteVolume);

        assert!(lifecycle.enable(&session, &mut volume).await.is_err());
        let leftover = volume.replicas["ds8k-b"].device_id.clone();
        assert!(fixture.secondary.has_volume(&leftover));
        assert_eq!(volume.replication_status, ReplicationStatus::Disabled);

        // Enabling again clears the leftover before creating a new copy
        lifecycle.enable(&session, &mut volume).await.unwrap();
        assert_eq!(fixture.secondary.volume_total(), 1);
        assert_eq!(volume.replication_status, ReplicationStatus::Enabled);
        let replica = &volume.replicas["ds8k-b"].device_id;
        assert!(fixture.secondary.has_volume(replica));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftover_copy_is_removed_by_delete() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.inject_fault(Operation::CreatePair);
        fixture.secondary.inject_fault(Operation::DeleteVolume);
        assert!(lifecycle.enable(&session, &mut volume).await.is_err());
        assert_eq!(fixture.secondary.volume_total(), 1);

        lifecycle.delete_replica(&session, &mut volume).await.unwrap();
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert!(volume.replicas.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_volume_failure_rolls_back() {
        let fixture = Fixture::new();
        let mut volume = fixture.volume("v1", "00");
        fixture.secondary.inject_fault(Operation::CreateVolume);

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(
            result,
            Err(Error::BackendOperationFailed { operation, .. }) if operation == "CreateVolume"
        );
        assert_eq!(fixture.primary.call_count(Operation::CreatePair), 0);
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert_eq!(fixture.primary.pair_count(), 0);
        assert!(volume.replicas.is_empty());
        assert_eq!(volume.replication_status, ReplicationStatus::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_wait_failure_rolls_back() {
        let fixture = Fixture::new();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.inject_fault(Operation::WaitForPairState);

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(
            result,
            Err(Error::BackendOperationFailed { operation, .. }) if operation == "WaitForPairState"
        );
        assert_eq!(fixture.primary.pair_count(), 0);
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert!(volume.replicas.is_empty());
        assert!(fixture.primary.has_volume(volume.device_id.as_deref().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_timeout_rolls_back() {
        let fixture = Fixture::new();
        let mut volume = fixture.volume("v1", "00");
        fixture.primary.set_stuck_pair_state(Some(PairState::CopyPending));

        let result = fixture.lifecycle().enable(&fixture.session(), &mut volume).await;
        assert_matches!(result, Err(Error::PairStateTimeout { .. }));
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert_eq!(fixture.primary.pair_count(), 0);
    }

    #[tokio::test]
    async fn test_create_replicated_volume() {
        let fixture = Fixture::new();
        fixture.add_path("00", "10", &links(), true);
        let mut volume = Volume::new("v1", 10, fixture.volume_type());

        fixture
            .lifecycle()
            .create_replicated_volume(&fixture.session(), &mut volume)
            .await
            .unwrap();
        assert_eq!(volume.container_id(), Some("00"));
        assert!(volume.replicas.get("ds8k-b").unwrap().device_id.starts_with("10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_replicated_volume_rollback_deletes_source() {
        let fixture = Fixture::new();
        fixture.primary.set_paths_never_heal(true);
        let mut volume = Volume::new("v1", 10, fixture.volume_type());

        let result = fixture
            .lifecycle()
            .create_replicated_volume(&fixture.session(), &mut volume)
            .await;
        assert_matches!(result, Err(Error::PathCreationFailed { .. }));
        assert_eq!(fixture.primary.volume_total(), 0);
        assert_eq!(fixture.secondary.volume_total(), 0);
        assert!(volume.device_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_round_trip_restores_arrays() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        let before = (fixture.primary.volume_total(), fixture.secondary.volume_total());

        lifecycle.enable(&session, &mut volume).await.unwrap();
        lifecycle.delete_replica(&session, &mut volume).await.unwrap();

        assert_eq!(
            (fixture.primary.volume_total(), fixture.secondary.volume_total()),
            before
        );
        assert_eq!(fixture.primary.pair_count(), 0);
        assert_eq!(volume.replication_status, ReplicationStatus::Disabled);
        assert!(volume.replicas.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_is_reported() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        lifecycle.enable(&session, &mut volume).await.unwrap();

        fixture.secondary.inject_fault(Operation::DeleteVolume);
        let result = lifecycle.delete_replica(&session, &mut volume).await;
        assert_matches!(result, Err(Error::ReplicaDeletionFailed { .. }));
        assert!(!volume.replicas.is_empty());

        // Retry finishes the job
        lifecycle.delete_replica(&session, &mut volume).await.unwrap();
        assert_eq!(fixture.secondary.volume_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_with_unreachable_secondary() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        lifecycle.enable(&session, &mut volume).await.unwrap();

        fixture.secondary.set_online(false);
        lifecycle.delete_replica(&session, &mut volume).await.unwrap();
        assert_eq!(fixture.primary.pair_count(), 0);
        assert_eq!(fixture.secondary.volume_total(), 1);
        assert!(volume.replicas.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_replica() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle();
        let session = fixture.session();
        let mut volume = fixture.volume("v1", "00");
        lifecycle.enable(&session, &mut volume).await.unwrap();

        lifecycle.extend_replica(&session, &volume, 20).await.unwrap();
        let replica = &volume.replicas["ds8k-b"].device_id;
        assert_eq!(fixture.secondary.volume_size(replica), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_replication_lease_times_out() {
        let fixture = Fixture::new();
        let leases = Arc::new(InMemoryLeaseManager::new(Duration::from_secs(5)));
        let lifecycle = fixture.lifecycle_with_leases(leases.clone());
        let _held = leases
            .acquire("ds8k-a-replication", Duration::from_secs(600))
            .await
            .unwrap();

        let mut volume = fixture.volume("v1", "00");
        let result = lifecycle.enable(&fixture.session(), &mut volume).await;
        assert_matches!(result, Err(Error::LeaseTimeout { .. }));
        assert_eq!(fixture.secondary.volume_total(), 0);
    }
}
