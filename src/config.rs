//! Coordinator Configuration
//!
//! Replication settings for one primary/secondary array pair, loaded from
//! YAML. Every section has defaults so a minimal file only names the arrays.

use crate::array::ConnectionType;
use crate::domain::ports::{ArrayIdentity, PortPair};
use crate::error::{Error, Result};
use crate::replication::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Array Configuration
// =============================================================================

/// Configuration of one array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Backend name used by the volume manager
    pub backend_id: String,
    /// World wide node name
    pub storage_wwnn: String,
    /// Storage unit id (e.g. `2107-1111111`)
    pub storage_unit: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Mainframe LCU mapping, LCU id -> device address range
    #[serde(default)]
    pub device_mapping: BTreeMap<String, String>,
}

impl ArrayConfig {
    pub fn identity(&self) -> ArrayIdentity {
        ArrayIdentity::new(&self.backend_id, &self.storage_wwnn, &self.storage_unit)
    }
}

// =============================================================================
// Lease Configuration
// =============================================================================

/// Lease timing for the named critical sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a lease is held before it is considered abandoned
    pub ttl_secs: u64,
    /// How long to wait for a busy lease
    pub wait_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            wait_secs: 900,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

// =============================================================================
// Replication Configuration
// =============================================================================

/// Complete replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub primary: ArrayConfig,
    pub secondary: ArrayConfig,
    /// Port pairs to use, e.g. `I0001-I0101;I0002-I0102`; discovered when empty
    #[serde(default)]
    pub port_pairs: Option<String>,
    /// Containers reserved for consistency groups, e.g. `20-23;30`
    #[serde(default)]
    pub consistency_group_containers: Option<String>,
    /// Polling policy for new replication paths
    #[serde(default = "RetryPolicy::path_health")]
    pub path_health: RetryPolicy,
    /// Upper bound for a pair to reach full duplex
    #[serde(default = "default_pair_wait_secs")]
    pub pair_wait_secs: u64,
    #[serde(default)]
    pub leases: LeaseConfig,
}

fn default_pair_wait_secs() -> u64 {
    3600
}

impl ReplicationConfig {
    /// Minimal configuration for two arrays with every default applied
    pub fn new(primary: ArrayConfig, secondary: ArrayConfig) -> Self {
        Self {
            primary,
            secondary,
            port_pairs: None,
            consistency_group_containers: None,
            path_health: RetryPolicy::path_health(),
            pair_wait_secs: default_pair_wait_secs(),
            leases: LeaseConfig::default(),
        }
    }

    /// Parse a YAML document and validate it
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ReplicationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Check the settings that can be checked without talking to the arrays
    pub fn validate(&self) -> Result<()> {
        if self.primary.storage_wwnn == self.secondary.storage_wwnn {
            return Err(Error::Configuration(format!(
                "primary and secondary are the same array ({})",
                self.primary.storage_wwnn
            )));
        }
        if self.secondary.backend_id.trim().is_empty() {
            return Err(Error::Configuration(
                "secondary backend_id must not be empty".into(),
            ));
        }
        if self.path_health.max_attempts == 0 {
            return Err(Error::Configuration(
                "path_health.max_attempts must be at least 1".into(),
            ));
        }
        self.configured_port_pairs()?;
        self.reserved_containers()?;
        Ok(())
    }

    /// User-supplied port pairs, empty when discovery should pick them
    pub fn configured_port_pairs(&self) -> Result<Vec<PortPair>> {
        match &self.port_pairs {
            Some(raw) => PortPair::parse_list(raw),
            None => Ok(Vec::new()),
        }
    }

    /// Container ids reserved for consistency groups
    pub fn reserved_containers(&self) -> Result<BTreeSet<String>> {
        match &self.consistency_group_containers {
            Some(raw) => parse_container_ranges(raw),
            None => Ok(BTreeSet::new()),
        }
    }

    pub fn pair_wait(&self) -> Duration {
        Duration::from_secs(self.pair_wait_secs)
    }
}

/// Parse hex container ranges such as `20-23;30` into container ids
pub fn parse_container_ranges(raw: &str) -> Result<BTreeSet<String>> {
    let mut containers = BTreeSet::new();

    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_container(start)?, parse_container(end)?),
            None => {
                let single = parse_container(part)?;
                (single, single)
            }
        };
        if start > end {
            return Err(Error::ContainerRangeParse(format!(
                "range '{}' ends before it starts",
                part
            )));
        }
        containers.extend((start..=end).map(|id| format!("{:02X}", id)));
    }

    Ok(containers)
}

fn parse_container(raw: &str) -> Result<u8> {
    let raw = raw.trim();
    if raw.len() != 2 {
        return Err(Error::ContainerRangeParse(format!(
            "container id '{}' must be two hex digits",
            raw
        )));
    }
    u8::from_str_radix(raw, 16)
        .map_err(|e| Error::ContainerRangeParse(format!("container id '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    const YAML: &str = r#"
primary:
  backend_id: ds8k-a
  storage_wwnn: 5000000000FFC111
  storage_unit: 2107-1111111
secondary:
  backend_id: ds8k-b
  storage_wwnn: 5000000000FFD222
  storage_unit: 2107-2222222
  connection_type: fibre_channel
port_pairs: I0001-I0101;I0002-I0102
consistency_group_containers: 20-23
path_health:
  max_attempts: 6
  interval_ms: 500
"#;

    #[test]
    fn test_parse_yaml() {
        let config = ReplicationConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.secondary.backend_id, "ds8k-b");
        assert_eq!(config.configured_port_pairs().unwrap().len(), 2);
        assert_eq!(config.path_health.max_attempts, 6);
        assert_eq!(config.path_health.interval(), Duration::from_millis(500));
        assert_eq!(config.pair_wait(), Duration::from_secs(3600));
        assert_eq!(config.leases, LeaseConfig::default());
        let reserved: Vec<_> = config.reserved_containers().unwrap().into_iter().collect();
        assert_eq!(reserved, vec!["20", "21", "22", "23"]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let config = ReplicationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.primary.storage_unit, "2107-1111111");
        assert_eq!(config.primary.connection_type, ConnectionType::FibreChannel);
    }

    #[test]
    fn test_container_ranges() {
        let ids: Vec<_> = parse_container_ranges("0E-11; 30").unwrap().into_iter().collect();
        assert_eq!(ids, vec!["0E", "0F", "10", "11", "30"]);
        assert_matches!(parse_container_ranges("23-20"), Err(Error::ContainerRangeParse(_)));
        assert_matches!(parse_container_ranges("2G"), Err(Error::ContainerRangeParse(_)));
        assert_matches!(parse_container_ranges("200"), Err(Error::ContainerRangeParse(_)));
    }

    #[test]
    fn test_validate_rejects_same_array() {
        let yaml = YAML.replace("5000000000FFD222", "5000000000FFC111");
        assert_matches!(
            ReplicationConfig::from_yaml_str(&yaml),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_validate_rejects_bad_port_pairs() {
        let yaml = YAML.replace("I0001-I0101;I0002-I0102", "I0001");
        assert_matches!(
            ReplicationConfig::from_yaml_str(&yaml),
            Err(Error::PortPairParse(_))
        );
    }
}
