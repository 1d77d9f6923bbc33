//! Replication Session
//!
//! The (primary, secondary, links) triple every operation runs against.
//! Sessions are immutable; a role swap or a new link selection produces a
//! new session and the coordinator swaps it in as a whole.

use crate::array::ArrayEndpoint;
use crate::domain::ports::{PathId, PortPair};

/// Port pairs in use, in both directions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSelection {
    /// Primary -> secondary
    pub forward: Vec<PortPair>,
    /// Secondary -> primary, the reciprocal of `forward`
    pub reverse: Vec<PortPair>,
}

impl LinkSelection {
    pub fn from_forward(forward: Vec<PortPair>) -> Self {
        let reverse = forward.iter().map(PortPair::reversed).collect();
        Self { forward, reverse }
    }

    /// The same selection seen from the other array
    pub fn swapped(&self) -> Self {
        Self {
            forward: self.reverse.clone(),
            reverse: self.forward.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationSession {
    primary: ArrayEndpoint,
    secondary: ArrayEndpoint,
    links: LinkSelection,
    generation: u64,
    reversed: bool,
}

impl ReplicationSession {
    pub fn new(primary: ArrayEndpoint, secondary: ArrayEndpoint, links: LinkSelection) -> Self {
        Self {
            primary,
            secondary,
            links,
            generation: 0,
            reversed: false,
        }
    }

    pub fn primary(&self) -> &ArrayEndpoint {
        &self.primary
    }

    pub fn secondary(&self) -> &ArrayEndpoint {
        &self.secondary
    }

    pub fn links(&self) -> &LinkSelection {
        &self.links
    }

    /// Bumped on every replacement, used to detect stale snapshots
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the configured secondary is currently acting as primary
    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// Same arrays, new link selection
    pub fn with_links(&self, links: LinkSelection) -> Self {
        Self {
            links,
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    /// Roles exchanged, links reversed
    pub fn swapped(&self) -> Self {
        Self {
            primary: self.secondary.clone(),
            secondary: self.primary.clone(),
            links: self.links.swapped(),
            generation: self.generation + 1,
            reversed: !self.reversed,
        }
    }

    /// Path id for a (primary container, secondary container) pair
    pub fn path_id(&self, source_container: &str, target_container: &str) -> PathId {
        PathId {
            source_wwnn: self.primary.identity().storage_wwnn.clone(),
            source_container: source_container.to_string(),
            target_wwnn: self.secondary.identity().storage_wwnn.clone(),
            target_container: target_container.to_string(),
        }
    }
}
