//! Failover Coordinator
//!
//! Moves service from the primary to the secondary and back. Failover
//! reverses every mirror pair in one batch and leaves the new pairs
//! suspended; failback resyncs, reverses again, swaps roles back and
//! resyncs once more so the original direction ends in full duplex.

use crate::array::ArrayEndpoint;
use crate::domain::ports::{
    FailbackRequest, PairId, PairOption, PairRequest, PairState, PlacementPair, PoolContainer,
    ReplicaRecord, ReplicationStatus, Volume, VolumePair,
};
use crate::error::{Error, Result};
use crate::replication::paths::PathManager;
use crate::replication::session::ReplicationSession;
use crate::replication::state::{check_transition, MirrorEvent, MirrorState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Provider-location key remembering a volume's status across failover
pub const OLD_STATUS_KEY: &str = "old_status";

/// Status update for a volume that has no replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub volume_id: String,
    pub status: String,
    pub provider_location: BTreeMap<String, String>,
}

pub struct FailoverCoordinator {
    paths: Arc<PathManager>,
    pair_wait: Duration,
}

impl FailoverCoordinator {
    pub fn new(paths: Arc<PathManager>, pair_wait: Duration) -> Self {
        Self { paths, pair_wait }
    }

    /// Exchange each volume's device id with its copy under `secondary_id`
    /// and return the session with roles swapped.
    pub fn role_swap(
        &self,
        session: &ReplicationSession,
        secondary_id: &str,
        volumes: &mut [Volume],
    ) -> ReplicationSession {
        for volume in volumes.iter_mut() {
            swap_ids(volume, secondary_id);
        }
        swap_session(session)
    }

    /// Like [`role_swap`](Self::role_swap), but only the volumes named in
    /// `moved` have their ids exchanged; the rest keep the old perspective.
    pub fn role_swap_moved(
        &self,
        session: &ReplicationSession,
        secondary_id: &str,
        volumes: &mut [Volume],
        moved: &[String],
    ) -> ReplicationSession {
        for volume in volumes.iter_mut() {
            if moved.contains(&volume.id) {
                swap_ids(volume, secondary_id);
            } else {
                debug!("Volume {} was not moved, ids kept", volume.id);
            }
        }
        swap_session(session)
    }

    /// Reverse every pair so the secondary serves the volumes.
    ///
    /// Volumes whose copy is missing on the secondary are skipped. Does not
    /// swap roles; the caller does that once this succeeds, for the returned
    /// volume ids only.
    pub async fn failover(
        &self,
        session: &ReplicationSession,
        volumes: &mut [Volume],
        secondary_id: &str,
    ) -> Result<Vec<String>> {
        for volume in volumes.iter() {
            check_transition(volume, MirrorEvent::Failover)?;
        }

        let all: Vec<&Volume> = volumes.iter().collect();
        let moved = self.reverse_pairs(session, &all, secondary_id).await?;
        for volume in volumes.iter_mut().filter(|v| moved.contains(&v.id)) {
            volume.replication_status = ReplicationStatus::FailedOver;
        }
        Ok(moved)
    }

    /// Return service to the original primary and return the restored session.
    ///
    /// `session` is the failed-over session, so its secondary is the array
    /// being failed back to. Fails before touching any pair when that array
    /// cannot be reached. Volumes whose copy has gone missing stay failed
    /// over with their ids untouched.
    pub async fn failback(
        &self,
        session: &ReplicationSession,
        volumes: &mut [Volume],
        secondary_id: &str,
    ) -> Result<ReplicationSession> {
        for volume in volumes.iter() {
            check_transition(volume, MirrorEvent::Failback)?;
        }

        let target = session.secondary();
        if !self.paths.is_secondary_alive(session).await {
            if let Err(e) = target.gateway.reconnect().await {
                error!("Cannot connect to {}: {}", target.name(), e);
                return Err(Error::FailbackUnavailable {
                    reason: format!("{} is not reachable, make sure it is back", target.name()),
                });
            }
        }

        debug!("Failback to {} starts", target.name());
        for volume in volumes.iter() {
            if let Some(placement) = self.current_placement(session, volume, secondary_id).await? {
                self.paths.ensure_path(session, &placement).await?;
            }
        }

        let all: Vec<&Volume> = volumes.iter().collect();
        self.resync(session, &all, secondary_id).await?;
        let moved = self.reverse_pairs(session, &all, secondary_id).await?;
        let restored = self.role_swap_moved(session, secondary_id, volumes, &moved);

        let returned: Vec<&Volume> = volumes.iter().filter(|v| moved.contains(&v.id)).collect();
        self.resync(&restored, &returned, secondary_id).await?;

        for volume in volumes.iter_mut() {
            if moved.contains(&volume.id) {
                volume.replication_status = ReplicationStatus::Enabled;
            } else {
                warn!("Volume {} could not be failed back, it stays failed over", volume.id);
            }
        }
        debug!("Failback to {} finished", restored.primary().name());
        Ok(restored)
    }

    /// Toggle the status of a volume that was never mirrored: park it in
    /// `error` on the first call and restore the saved status on the next.
    pub fn unreplicated_volume_failover(&self, volume: &mut Volume) -> Result<VolumeUpdate> {
        let state = MirrorState::of(volume);
        if state != MirrorState::Unprotected {
            return Err(Error::InvalidTransition {
                volume: volume.id.clone(),
                state: state.to_string(),
                operation: "unreplicated failover".into(),
            });
        }

        match volume.provider_location.remove(OLD_STATUS_KEY) {
            Some(old_status) => volume.status = old_status,
            None => {
                let current = std::mem::replace(&mut volume.status, "error".to_string());
                volume
                    .provider_location
                    .insert(OLD_STATUS_KEY.to_string(), current);
            }
        }

        Ok(VolumeUpdate {
            volume_id: volume.id.clone(),
            status: volume.status.clone(),
            provider_location: volume.provider_location.clone(),
        })
    }

    /// Create reversed pairs (secondary -> primary) in one batch.
    ///
    /// Returns the ids of the volumes that were included.
    async fn reverse_pairs(
        &self,
        session: &ReplicationSession,
        volumes: &[&Volume],
        secondary_id: &str,
    ) -> Result<Vec<String>> {
        let primary = session.primary();
        let secondary = session.secondary();

        let mut pairs = Vec::new();
        let mut copies = Vec::new();
        let mut included = Vec::new();
        for volume in volumes.iter().copied() {
            let Some(replica) = volume.replicas.get(secondary_id) else {
                info!("Volume {} has no copy on {}", volume.id, secondary_id);
                continue;
            };
            if !secondary.gateway.volume_exists(&replica.device_id).await? {
                info!(
                    "Copy {} of volume {} does not exist on {}",
                    replica.device_id,
                    volume.id,
                    secondary.name()
                );
                continue;
            }
            pairs.push(VolumePair {
                source_volume: replica.device_id.clone(),
                source_system: secondary.identity().storage_unit.clone(),
                target_volume: volume.require_device_id()?.to_string(),
                target_system: primary.identity().storage_unit.clone(),
            });
            copies.push(replica.device_id.clone());
            included.push(volume.id.clone());
        }

        if pairs.is_empty() {
            info!("No pairs to reverse towards {}", secondary.name());
            return Ok(included);
        }

        info!("Reversing {} pair(s) to {}", pairs.len(), secondary.name());
        secondary
            .gateway
            .create_pair(&PairRequest {
                pairs,
                options: vec![PairOption::Failover],
            })
            .await?;
        secondary
            .gateway
            .wait_for_pair_state(&copies, PairState::Suspended, false, self.pair_wait)
            .await?;
        info!("Pairs reversed to {}", secondary.name());

        Ok(included)
    }

    /// Resync suspended pairs sourced on the session's primary.
    async fn resync(
        &self,
        session: &ReplicationSession,
        volumes: &[&Volume],
        secondary_id: &str,
    ) -> Result<()> {
        let primary = session.primary();
        let secondary = session.secondary();

        let mut pair_ids = Vec::new();
        let mut sources = Vec::new();
        for volume in volumes.iter().copied() {
            let Some(replica) = volume.replicas.get(secondary_id) else {
                continue;
            };
            if !secondary.gateway.volume_exists(&replica.device_id).await? {
                continue;
            }
            let source = volume.require_device_id()?.to_string();
            pair_ids.push(PairId {
                source_system: primary.identity().storage_unit.clone(),
                source_volume: source.clone(),
                target_system: secondary.identity().storage_unit.clone(),
                target_volume: replica.device_id.clone(),
            });
            sources.push(source);
        }

        if pair_ids.is_empty() {
            return Ok(());
        }

        debug!("Resyncing {} pair(s) on {}", pair_ids.len(), primary.name());
        primary
            .gateway
            .run_failback(&FailbackRequest { pair_ids })
            .await?;
        primary
            .gateway
            .wait_for_pair_state(&sources, PairState::FullDuplex, false, self.pair_wait)
            .await
    }

    /// Containers currently holding a volume and its copy
    async fn current_placement(
        &self,
        session: &ReplicationSession,
        volume: &Volume,
        secondary_id: &str,
    ) -> Result<Option<PlacementPair>> {
        let (Some(source), Some(replica)) = (volume.container_id(), volume.replicas.get(secondary_id))
        else {
            return Ok(None);
        };
        let Some(target) = replica.device_id.get(0..2) else {
            return Ok(None);
        };

        let pool_of = |endpoint: &ArrayEndpoint, container: &str| {
            let gateway = endpoint.gateway.clone();
            let name = format!("{} container {}", endpoint.name(), container);
            let container = container.to_string();
            async move {
                gateway
                    .pool_for_container(&container)
                    .await?
                    .map(|pool| PoolContainer::new(pool, container))
                    .ok_or(Error::ResourceNotFound {
                        kind: "pool".into(),
                        name,
                    })
            }
        };

        Ok(Some(PlacementPair {
            source: pool_of(session.primary(), source).await?,
            target: pool_of(session.secondary(), target).await?,
        }))
    }
}

fn swap_ids(volume: &mut Volume, secondary_id: &str) {
    let (Some(current), Some(replica)) =
        (volume.device_id.clone(), volume.replicas.get(secondary_id).cloned())
    else {
        warn!("Volume {} has no copy on {}, not swapped", volume.id, secondary_id);
        return;
    };
    volume.device_id = Some(replica.device_id);
    volume
        .replicas
        .insert(secondary_id.to_string(), ReplicaRecord { device_id: current });
}

fn swap_session(session: &ReplicationSession) -> ReplicationSession {
    let swapped = session.swapped();
    info!(
        "Primary is now {}, secondary is {}",
        swapped.primary().name(),
        swapped.secondary().name()
    );
    swapped
}
