//! Placement Allocator
//!
//! Chooses the (pool, container) pair on both arrays for a new mirrored
//! volume. Containers already joined by a healthy replication path are
//! preferred, least occupied first; otherwise each array allocates a new
//! container on its own.

use crate::array::ArrayEndpoint;
use crate::domain::ports::{PlacementPair, PoolContainer, ReplicationPath, CONTAINER_CAPACITY};
use crate::error::{Error, Result};
use crate::replication::paths::{PathClassification, PathHealth, PathManager};
use crate::replication::session::ReplicationSession;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Placement Candidate
// =============================================================================

/// A (source container, target container) pair joined by a healthy path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCandidate {
    pub source_pool: String,
    pub source_container: String,
    pub source_volumes: u32,
    pub target_pool: String,
    pub target_container: String,
    pub target_volumes: u32,
}

impl PlacementCandidate {
    /// Volumes in both containers together
    pub fn combined_occupancy(&self) -> u32 {
        self.source_volumes + self.target_volumes
    }

    pub fn placement(&self) -> PlacementPair {
        PlacementPair {
            source: PoolContainer::new(&self.source_pool, &self.source_container),
            target: PoolContainer::new(&self.target_pool, &self.target_container),
        }
    }
}

// =============================================================================
// Placement Result
// =============================================================================

/// Where a placement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOrigin {
    /// Containers behind an existing healthy path
    ExistingPath,
    /// Containers chosen independently on each array
    Allocated,
}

/// A placement decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub pair: PlacementPair,
    pub origin: PlacementOrigin,
}

/// Placement for a volume whose source container is already fixed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerPlacement {
    Ready(Placement),
    /// Paths from the container exist but none is healthy
    PathsUnhealthy,
}

#[derive(Debug, Clone)]
pub struct PlacementResult {
    pub selected: PlacementCandidate,
    pub reason: String,
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Pure selection over pre-filtered candidates
pub struct PlacementEngine;

impl PlacementEngine {
    /// Pick the candidate with the lowest combined occupancy.
    ///
    /// Ties go to the lowest source container, then the lowest target
    /// container, so the choice is stable across calls.
    pub fn select(candidates: &[PlacementCandidate]) -> Option<PlacementResult> {
        let selected = candidates.iter().min_by(|a, b| {
            a.combined_occupancy()
                .cmp(&b.combined_occupancy())
                .then_with(|| a.source_container.cmp(&b.source_container))
                .then_with(|| a.target_container.cmp(&b.target_container))
        })?;

        let reason = format!(
            "containers {}/{} hold {} volume(s), lowest of {} candidate(s)",
            selected.source_container,
            selected.target_container,
            selected.combined_occupancy(),
            candidates.len()
        );

        Some(PlacementResult {
            selected: selected.clone(),
            reason,
        })
    }
}

// =============================================================================
// Placement Allocator
// =============================================================================

pub struct PlacementAllocator {
    paths: Arc<PathManager>,
    /// Containers reserved for consistency groups
    reserved: BTreeSet<String>,
}

impl PlacementAllocator {
    pub fn new(paths: Arc<PathManager>, reserved: BTreeSet<String>) -> Self {
        Self { paths, reserved }
    }

    /// Find containers for a new mirrored volume.
    ///
    /// `excluded` source containers are never chosen, and neither are the
    /// reserved ones. Occupancy is read fresh on every call.
    pub async fn find_placement(
        &self,
        session: &ReplicationSession,
        excluded: &[String],
    ) -> Result<Placement> {
        let classification = self.paths.classify(session, None).await?;

        if classification.health == PathHealth::Healthy {
            if let Some(pair) = self
                .search_paths(session, &classification, None, excluded)
                .await?
            {
                return Ok(Placement {
                    pair,
                    origin: PlacementOrigin::ExistingPath,
                });
            }
            info!("Containers behind the healthy replication paths are full, allocating new ones");
        } else {
            // Links may have moved since the session was built
            self.paths.check_links(session).await?;
        }

        let mut excluded_sources: Vec<String> = excluded.to_vec();
        excluded_sources.extend(self.reserved.iter().cloned());
        let source = self.allocate(session.primary(), &excluded_sources).await?;

        let excluded_targets: Vec<String> = self.reserved.iter().cloned().collect();
        let target = self.allocate(session.secondary(), &excluded_targets).await?;

        info!(
            "Allocated containers {} on {} and {} on {}",
            source.container_id,
            session.primary().name(),
            target.container_id,
            session.secondary().name()
        );
        Ok(Placement {
            pair: PlacementPair { source, target },
            origin: PlacementOrigin::Allocated,
        })
    }

    /// Find the target side for a volume that already lives in `container`.
    pub async fn find_placement_for_container(
        &self,
        session: &ReplicationSession,
        container: &str,
    ) -> Result<ContainerPlacement> {
        let classification = self.paths.classify(session, Some(container)).await?;

        match classification.health {
            PathHealth::Unhealthy => return Ok(ContainerPlacement::PathsUnhealthy),
            PathHealth::Healthy => {
                if let Some(pair) = self
                    .search_paths(session, &classification, Some(container), &[])
                    .await?
                {
                    return Ok(ContainerPlacement::Ready(Placement {
                        pair,
                        origin: PlacementOrigin::ExistingPath,
                    }));
                }
                info!(
                    "Targets behind the healthy paths from container {} are full",
                    container
                );
            }
            PathHealth::NotExist => {}
        }

        let primary = session.primary();
        let pool = primary
            .gateway
            .pool_for_container(container)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "pool".into(),
                name: format!("{} container {}", primary.name(), container),
            })?;

        let excluded_targets: Vec<String> = self.reserved.iter().cloned().collect();
        let target = self.allocate(session.secondary(), &excluded_targets).await?;

        Ok(ContainerPlacement::Ready(Placement {
            pair: PlacementPair {
                source: PoolContainer::new(pool, container),
                target,
            },
            origin: PlacementOrigin::Allocated,
        }))
    }

    /// Pick the least occupied container pair behind the classified paths.
    ///
    /// With `specified` set the source container is the caller's choice and
    /// is neither excluded nor capacity-checked.
    async fn search_paths(
        &self,
        session: &ReplicationSession,
        classification: &PathClassification,
        specified: Option<&str>,
        excluded: &[String],
    ) -> Result<Option<PlacementPair>> {
        let primary = session.primary();
        let secondary = session.secondary();

        let usable: Vec<&ReplicationPath> = classification
            .paths
            .iter()
            .filter(|p| {
                specified.is_some()
                    || (!excluded.iter().any(|c| c == p.source_container())
                        && !self.reserved.contains(p.source_container()))
            })
            .collect();

        let reads = usable.iter().map(|path| async move {
            let source = if specified.is_some() {
                Ok(0)
            } else {
                primary
                    .gateway
                    .volume_count_in_container(path.source_container())
                    .await
            };
            let target = secondary
                .gateway
                .volume_count_in_container(path.target_container())
                .await;
            (*path, source, target)
        });
        let occupancy = futures::future::join_all(reads).await;

        let mut candidates = Vec::new();
        for (path, source, target) in occupancy {
            let source_volumes = source?;
            if source_volumes >= CONTAINER_CAPACITY {
                debug!("Container {} on {} is full", path.source_container(), primary.name());
                continue;
            }

            let target_volumes = match target {
                Ok(count) => count,
                Err(e) => {
                    error!(
                        "Failed to read occupancy of container {} on {}: {}",
                        path.target_container(),
                        secondary.name(),
                        e
                    );
                    0
                }
            };
            if target_volumes >= CONTAINER_CAPACITY {
                warn!(
                    "Container {} on {} is full, skipping path {}",
                    path.target_container(),
                    secondary.name(),
                    path.id
                );
                continue;
            }

            let (Some(source_pool), Some(target_pool)) = (
                classification.source_pools.get(path.source_container()),
                classification.target_pools.get(path.target_container()),
            ) else {
                continue;
            };

            candidates.push(PlacementCandidate {
                source_pool: source_pool.clone(),
                source_container: path.source_container().to_string(),
                source_volumes,
                target_pool: target_pool.clone(),
                target_container: path.target_container().to_string(),
                target_volumes,
            });
        }

        Ok(PlacementEngine::select(&candidates).map(|result| {
            info!("Reusing replication path: {}", result.reason);
            result.selected.placement()
        }))
    }

    /// Ask one array for a container and check it honours the allocation contract
    async fn allocate(&self, array: &ArrayEndpoint, excluded: &[String]) -> Result<PoolContainer> {
        let volume_type = array.variant.volume_type();
        let containers = array.gateway.list_containers().await?;
        let eligible = array.variant.eligible_containers(&containers);

        // Containers outside the variant's eligible set are never offered
        let ineligible: Vec<String> = containers
            .iter()
            .filter(|c| !eligible.contains(&c.id) && !excluded.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        let excluded = [excluded, ineligible.as_slice()].concat();
        let choice = array.gateway.allocate_container(volume_type, &excluded).await?;

        let violation = |reason: String| Error::BackendOperationFailed {
            array: array.name().to_string(),
            operation: "allocate_container".into(),
            reason,
        };

        if excluded.contains(&choice.container_id) {
            return Err(violation(format!(
                "container {} is excluded",
                choice.container_id
            )));
        }

        let info = containers
            .iter()
            .find(|c| c.id == choice.container_id)
            .ok_or_else(|| violation(format!("unknown container {}", choice.container_id)))?;
        if info.volume_type != volume_type {
            return Err(violation(format!(
                "container {} holds {} volumes, expected {}",
                info.id, info.volume_type, volume_type
            )));
        }
        if !eligible.contains(&info.id) {
            return Err(violation(format!("container {} is not eligible", info.id)));
        }
        if !info.has_free_slot() {
            return Err(Error::CapacityExhausted {
                array: array.name().to_string(),
                reason: format!("container {} is full", info.id),
            });
        }

        Ok(choice)
    }
}
