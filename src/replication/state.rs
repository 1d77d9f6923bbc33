//! Per-volume mirror state machine.
//!
//! ```text
//! Unprotected --enable--> Mirrored --failover--> FailedOver
//!      ^                     ^                        |
//!      +------delete---------+--------failback--------+
//! ```

use crate::domain::ports::{ReplicationStatus, Volume};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// No replica
    Unprotected,
    /// Replica on the secondary, pair in full duplex
    Mirrored,
    /// Serving from the secondary
    FailedOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorEvent {
    Enable,
    Failover,
    Failback,
    Delete,
}

impl std::fmt::Display for MirrorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorState::Unprotected => write!(f, "unprotected"),
            MirrorState::Mirrored => write!(f, "mirrored"),
            MirrorState::FailedOver => write!(f, "failed-over"),
        }
    }
}

impl std::fmt::Display for MirrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorEvent::Enable => write!(f, "enable"),
            MirrorEvent::Failover => write!(f, "failover"),
            MirrorEvent::Failback => write!(f, "failback"),
            MirrorEvent::Delete => write!(f, "delete"),
        }
    }
}

impl MirrorState {
    /// State implied by a volume's persisted replication fields
    pub fn of(volume: &Volume) -> Self {
        match volume.replication_status {
            ReplicationStatus::FailedOver => MirrorState::FailedOver,
            ReplicationStatus::Enabled if !volume.replicas.is_empty() => MirrorState::Mirrored,
            // A volume left in error still owns its replica; only delete may touch it
            ReplicationStatus::Error if !volume.replicas.is_empty() => MirrorState::Mirrored,
            _ => MirrorState::Unprotected,
        }
    }

    pub fn next(self, event: MirrorEvent) -> Option<MirrorState> {
        match (self, event) {
            (MirrorState::Unprotected, MirrorEvent::Enable) => Some(MirrorState::Mirrored),
            (MirrorState::Mirrored, MirrorEvent::Failover) => Some(MirrorState::FailedOver),
            (MirrorState::FailedOver, MirrorEvent::Failback) => Some(MirrorState::Mirrored),
            (_, MirrorEvent::Delete) => Some(MirrorState::Unprotected),
            _ => None,
        }
    }
}

/// Reject `event` unless the volume's current state allows it
pub fn check_transition(volume: &Volume, event: MirrorEvent) -> Result<MirrorState> {
    let state = MirrorState::of(volume);
    state.next(event).ok_or_else(|| Error::InvalidTransition {
        volume: volume.id.clone(),
        state: state.to_string(),
        operation: event.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ReplicaRecord, VolumeType};
    use assert_matches::assert_matches;

    fn mirrored() -> Volume {
        let mut volume = Volume::new("v1", 1, VolumeType::Block).with_device_id("0000");
        volume.replication_status = ReplicationStatus::Enabled;
        volume.replicas.insert(
            "ds8k-b".into(),
            ReplicaRecord {
                device_id: "1000".into(),
            },
        );
        volume
    }

    #[test]
    fn test_state_of_volume() {
        let volume = Volume::new("v1", 1, VolumeType::Block);
        assert_eq!(MirrorState::of(&volume), MirrorState::Unprotected);

        let mut volume = mirrored();
        assert_eq!(MirrorState::of(&volume), MirrorState::Mirrored);

        volume.replication_status = ReplicationStatus::FailedOver;
        assert_eq!(MirrorState::of(&volume), MirrorState::FailedOver);
    }

    #[test]
    fn test_allowed_transitions() {
        use MirrorEvent::*;
        use MirrorState::*;

        assert_eq!(Unprotected.next(Enable), Some(Mirrored));
        assert_eq!(Mirrored.next(Failover), Some(FailedOver));
        assert_eq!(FailedOver.next(Failback), Some(Mirrored));
        assert_eq!(FailedOver.next(Delete), Some(Unprotected));

        assert_eq!(Mirrored.next(Enable), None);
        assert_eq!(Unprotected.next(Failover), None);
        assert_eq!(Mirrored.next(Failback), None);
    }

    #[test]
    fn test_check_transition_error() {
        let volume = mirrored();
        assert_matches!(
            check_transition(&volume, MirrorEvent::Failback),
            Err(Error::InvalidTransition { state, operation, .. })
                if state == "mirrored" && operation == "failback"
        );
        assert_eq!(
            check_transition(&volume, MirrorEvent::Failover).unwrap(),
            MirrorState::FailedOver
        );
    }
}
