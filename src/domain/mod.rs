//! Domain layer - Core types and port definitions
//!
//! This module defines the data model shared by every component and the
//! array gateway trait (port) that transports implement.

pub mod ports;

pub use ports::*;
