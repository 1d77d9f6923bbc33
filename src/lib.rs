//! Mirror Coordinator - Synchronous Remote-Mirror Replication
//!
//! Keeps volumes on a primary storage array mirrored to a secondary array
//! and drives the failover/failback choreography between the two.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      ReplicationCoordinator                          │
//! │        (session snapshot, facade called by the volume manager)       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │ PairLifecycle │  │ FailoverCoord.   │  │  PlacementAllocator  │  │
//! │  │ create/delete │  │ reverse/resync   │  │  container selection │  │
//! │  └───────┬───────┘  └────────┬─────────┘  └──────────┬───────────┘  │
//! │          └───────────────────┼───────────────────────┘              │
//! │                      ┌───────┴───────┐                              │
//! │                      │  PathManager  │                              │
//! │                      │ links / paths │                              │
//! │                      └───────────────┘                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   ArrayGateway (primary)              ArrayGateway (secondary)       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`replication`]: Paths, placement, pair lifecycle, failover and the facade
//! - [`array`]: Array endpoints, hardware variants and the in-memory gateway
//! - [`config`]: YAML configuration
//! - [`domain`]: Core domain types and the gateway trait
//! - [`error`]: Error types and handling

pub mod array;
pub mod config;
pub mod domain;
pub mod error;
pub mod replication;

// Re-export commonly used types
pub use array::{ArrayEndpoint, ArrayVariant, ConnectionType, InMemoryArray};

pub use config::{ArrayConfig, LeaseConfig, ReplicationConfig};

pub use domain::ports::{
    ArrayGateway, ArrayGatewayRef, ArrayIdentity, PairState, PlacementPair, PortPair,
    ReplicationStatus, Volume, VolumeType,
};

pub use error::{Error, ErrorAction, Result};

pub use replication::{
    FailoverCoordinator, InMemoryLeaseManager, LeaseManager, LeaseManagerRef, LinkSelection,
    MirrorState, PairLifecycle, PathHealth, PathManager, Placement, PlacementAllocator,
    ReplicationCoordinator, ReplicationSession, RetryPolicy, VolumeUpdate,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
