//! Array Endpoints
//!
//! Provides the pieces that describe one attached array:
//! - Endpoint: gateway plus hardware variant
//! - Variant: block vs. mainframe capabilities
//! - Memory: an in-memory gateway used by tests, benches and the demo

pub mod memory;
pub mod variant;

pub use memory::*;
pub use variant::*;

use crate::config::ArrayConfig;
use crate::domain::ports::{ArrayGatewayRef, ArrayIdentity};
use std::sync::Arc;

/// One array as used by the coordinator
#[derive(Clone)]
pub struct ArrayEndpoint {
    pub gateway: ArrayGatewayRef,
    pub variant: Arc<dyn ArrayVariant>,
}

impl ArrayEndpoint {
    /// Create an endpoint with an explicit variant
    pub fn new(gateway: ArrayGatewayRef, variant: Arc<dyn ArrayVariant>) -> Self {
        Self { gateway, variant }
    }

    /// Create an endpoint whose variant follows the array's configuration
    pub fn from_config(gateway: ArrayGatewayRef, config: &ArrayConfig) -> Self {
        let variant = config.connection_type.variant(&config.device_mapping);
        Self { gateway, variant }
    }

    pub fn identity(&self) -> &ArrayIdentity {
        self.gateway.identity()
    }

    /// Short name used in log lines and errors
    pub fn name(&self) -> &str {
        &self.identity().storage_unit
    }
}

impl std::fmt::Debug for ArrayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayEndpoint")
            .field("identity", self.identity())
            .field("variant", &self.variant)
            .finish()
    }
}
