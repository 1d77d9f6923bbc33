//! Path Manager
//!
//! Discovers the physical links between the two arrays, classifies the
//! replication paths that already exist, and creates new paths on demand.

use crate::domain::ports::{PathId, PathSpec, PlacementPair, PortPair, ReplicationPath};
use crate::error::{Error, Result};
use crate::replication::retry::RetryPolicy;
use crate::replication::session::{LinkSelection, ReplicationSession};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Upper bound on port pairs used for one path
pub const MAX_PORT_PAIRS: usize = 8;

/// Aggregate health of the reusable paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathHealth {
    /// No path can be reused
    NotExist,
    /// Reusable paths exist but none has a working port pair
    Unhealthy,
    Healthy,
}

impl std::fmt::Display for PathHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathHealth::NotExist => write!(f, "not_exist"),
            PathHealth::Unhealthy => write!(f, "unhealthy"),
            PathHealth::Healthy => write!(f, "healthy"),
        }
    }
}

/// Result of classifying existing paths
#[derive(Debug, Clone)]
pub struct PathClassification {
    pub health: PathHealth,
    /// Reusable paths; only the healthy ones when `health` is `Healthy`
    pub paths: Vec<ReplicationPath>,
    /// Pools of the source containers behind `paths`
    pub source_pools: BTreeMap<String, String>,
    /// Pools of the target containers behind `paths`
    pub target_pools: BTreeMap<String, String>,
}

impl PathClassification {
    fn not_exist() -> Self {
        Self {
            health: PathHealth::NotExist,
            paths: Vec::new(),
            source_pools: BTreeMap::new(),
            target_pools: BTreeMap::new(),
        }
    }
}

pub struct PathManager {
    retry: RetryPolicy,
}

impl PathManager {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Resolve the port pairs to use from primary to secondary.
    ///
    /// Configured pairs (the session's current forward selection) must all
    /// be physically present; otherwise the first [`MAX_PORT_PAIRS`]
    /// discovered links are used.
    pub async fn check_links(&self, session: &ReplicationSession) -> Result<LinkSelection> {
        let primary = session.primary();
        let secondary = session.secondary();
        let remote_wwnn = &secondary.identity().storage_wwnn;

        let links = primary.gateway.get_physical_links(remote_wwnn).await?;
        if links.is_empty() {
            return Err(Error::NoPhysicalLinks {
                source_array: primary.identity().storage_wwnn.clone(),
                target: remote_wwnn.clone(),
            });
        }

        let forward: Vec<PortPair> = if session.links().is_empty() {
            links.iter().take(MAX_PORT_PAIRS).cloned().collect()
        } else {
            let configured = &session.links().forward;
            let invalid: Vec<PortPair> = configured
                .iter()
                .filter(|pair| !links.contains(pair))
                .cloned()
                .collect();
            if !invalid.is_empty() {
                return Err(Error::InvalidPortPair {
                    invalid: PortPair::join(&invalid),
                    valid: PortPair::join(&links),
                });
            }
            configured.iter().take(MAX_PORT_PAIRS).cloned().collect()
        };

        info!(
            "Using port pairs {} from {} to {}",
            PortPair::join(&forward),
            primary.name(),
            secondary.name()
        );
        Ok(LinkSelection::from_forward(forward))
    }

    /// Probe the secondary; any failure means it is not alive.
    pub async fn is_secondary_alive(&self, session: &ReplicationSession) -> bool {
        match session.secondary().gateway.get_systems().await {
            Ok(_) => true,
            Err(e) => {
                info!("{} is not reachable: {}", session.secondary().name(), e);
                false
            }
        }
    }

    /// Classify the paths that could carry a new pair.
    ///
    /// A path is reusable when it points at the secondary, uses at least one
    /// selected port pair, starts and ends in containers eligible for each
    /// array's variant, and both of its containers are still bound to a pool.
    pub async fn classify(
        &self,
        session: &ReplicationSession,
        container: Option<&str>,
    ) -> Result<PathClassification> {
        let primary = session.primary();
        let secondary = session.secondary();

        let mut paths = primary.gateway.get_paths(container).await?;
        if paths.is_empty() {
            info!("No replication paths found on {}", primary.name());
            return Ok(PathClassification::not_exist());
        }

        let remote_wwnn = &secondary.identity().storage_wwnn;
        paths.retain(|p| &p.id.target_wwnn == remote_wwnn);
        paths.retain(|p| p.uses_any(&session.links().forward));
        if paths.is_empty() {
            info!(
                "Existing replication paths do not use port pairs {}",
                PortPair::join(&session.links().forward)
            );
            return Ok(PathClassification::not_exist());
        }

        let containers = primary.gateway.list_containers().await?;
        let eligible = primary.variant.eligible_containers(&containers);
        paths.retain(|p| eligible.contains(p.source_container()));

        let containers = secondary.gateway.list_containers().await?;
        let eligible = secondary.variant.eligible_containers(&containers);
        paths.retain(|p| eligible.contains(p.target_container()));

        let mut source_pools = BTreeMap::new();
        let sources: BTreeSet<String> =
            paths.iter().map(|p| p.source_container().to_string()).collect();
        for container in sources {
            match primary.gateway.pool_for_container(&container).await? {
                Some(pool) => {
                    source_pools.insert(container, pool);
                }
                None => debug!("Container {} on {} has no pool", container, primary.name()),
            }
        }
        paths.retain(|p| source_pools.contains_key(p.source_container()));

        let mut target_pools = BTreeMap::new();
        let targets: BTreeSet<String> =
            paths.iter().map(|p| p.target_container().to_string()).collect();
        for container in targets {
            match secondary.gateway.pool_for_container(&container).await? {
                Some(pool) => {
                    target_pools.insert(container, pool);
                }
                None => debug!("Container {} on {} has no pool", container, secondary.name()),
            }
        }
        paths.retain(|p| target_pools.contains_key(p.target_container()));

        if paths.is_empty() {
            info!("No replication paths on {} can be reused", primary.name());
            return Ok(PathClassification::not_exist());
        }

        let healthy: Vec<ReplicationPath> =
            paths.iter().filter(|p| p.is_healthy()).cloned().collect();
        let (health, paths) = if healthy.is_empty() {
            warn!("Every reusable replication path on {} is unhealthy", primary.name());
            (PathHealth::Unhealthy, paths)
        } else {
            (PathHealth::Healthy, healthy)
        };

        Ok(PathClassification {
            health,
            paths,
            source_pools,
            target_pools,
        })
    }

    /// Make sure a healthy path connects the two containers of `placement`.
    ///
    /// Does nothing when the path is already healthy. A newly created path
    /// that never turns healthy is deleted again.
    pub async fn ensure_path(
        &self,
        session: &ReplicationSession,
        placement: &PlacementPair,
    ) -> Result<()> {
        let id = session.path_id(
            &placement.source.container_id,
            &placement.target.container_id,
        );

        let health = self.path_health(session, &id).await;
        info!("The state of replication path {} is {}", id, health);
        if health == PathHealth::Healthy {
            return Ok(());
        }

        let primary = session.primary();
        let spec = PathSpec {
            target_wwnn: session.secondary().identity().storage_wwnn.clone(),
            source_container: placement.source.container_id.clone(),
            target_container: placement.target.container_id.clone(),
            port_pairs: session.links().forward.clone(),
        };
        info!("Creating replication path {}", id);
        primary.gateway.create_path(&spec).await?;

        let id_ref = &id;
        let healthy = self
            .retry
            .poll_until(move || async move {
                Ok(self.path_health(session, id_ref).await == PathHealth::Healthy)
            })
            .await?;

        if !healthy {
            error!("Replication path {} did not become healthy, deleting it", id);
            if let Err(e) = primary.gateway.delete_path(&id).await {
                error!("Failed to delete replication path {}: {}", id, e);
            }
            return Err(Error::PathCreationFailed {
                source_container: placement.source.container_id.clone(),
                target_container: placement.target.container_id.clone(),
            });
        }

        info!("Replication path {} is healthy", id);
        Ok(())
    }

    async fn path_health(&self, session: &ReplicationSession, id: &PathId) -> PathHealth {
        match session.primary().gateway.get_path(id).await {
            Ok(path) if path.is_healthy() => PathHealth::Healthy,
            Ok(_) => PathHealth::Unhealthy,
            Err(e) => {
                debug!("Replication path {} is not available: {}", id, e);
                PathHealth::NotExist
            }
        }
    }
}
