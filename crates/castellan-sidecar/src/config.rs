//! Configuration for a sidecar instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use castellan_core::claim::ClaimSchema;
use castellan_core::properties::{app_id_from_group_name, PropertySchema};
use castellan_core::PortPair;
use serde::{Deserialize, Serialize};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting is missing or out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Storage, management and monitoring ports, managed when `ports` is unset.
pub const DEFAULT_PORTS: [u16; 3] = [7000, 7199, 61620];

/// ACL reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Base interval between seed reconciliation runs, in milliseconds.
    /// Also bounds the per-run jitter.
    pub base_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 120_000,
        }
    }
}

impl ReconcileConfig {
    /// Base interval as a [`Duration`].
    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

/// Top-level sidecar configuration.
///
/// ```toml
/// app_id = "cass"
/// instance_id = "i-0abc"
/// region = "us-east-1"
/// is_seed = true
/// call_timeout_ms = 5000
/// ports = [7000, 7001, 7199]
///
/// [reconcile]
/// base_interval_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Application (cluster) identifier.
    pub app_id: String,
    /// Autoscaling group name; supplies the app id when `app_id` is empty.
    pub group_name: Option<String>,
    /// This node's instance id.
    pub instance_id: String,
    /// Region this node runs in.
    pub region: String,
    /// Seeds reconcile periodically, other nodes once.
    pub is_seed: bool,
    /// Ports whose ACL ranges are managed, in processing order.
    pub ports: Vec<u16>,
    /// Reconciliation schedule.
    pub reconcile: ReconcileConfig,
    /// Credential pool layout.
    pub claim: ClaimSchema,
    /// Property domain layout; property loading is skipped when unset.
    pub properties: Option<PropertySchema>,
    /// Per-call deadline for remote calls, in milliseconds.
    pub call_timeout_ms: Option<u64>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            group_name: None,
            instance_id: String::new(),
            region: "us-east-1".into(),
            is_seed: false,
            ports: DEFAULT_PORTS.to_vec(),
            reconcile: ReconcileConfig::default(),
            claim: ClaimSchema::default(),
            properties: None,
            call_timeout_ms: None,
        }
    }
}

impl SidecarConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The application id, derived from `group_name` when not set.
    #[must_use]
    pub fn effective_app_id(&self) -> &str {
        match (&self.group_name, self.app_id.is_empty()) {
            (Some(group), true) => app_id_from_group_name(group),
            _ => &self.app_id,
        }
    }

    /// Managed single-port pairs, duplicates removed, order preserved.
    #[must_use]
    pub fn port_pairs(&self) -> Vec<PortPair> {
        let mut pairs = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let pair = PortPair::single(port);
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        pairs
    }

    /// Per-call deadline, if configured.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.effective_app_id().trim().is_empty() {
            return Err(ConfigError::Invalid("app_id must not be empty".into()));
        }
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".into()));
        }
        if self.reconcile.base_interval_ms == 0 {
            return Err(ConfigError::Invalid("reconcile.base_interval_ms must be positive".into()));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("call_timeout_ms must be positive".into()));
        }
        let pairs = self.port_pairs();
        if pairs.is_empty() {
            return Err(ConfigError::Invalid("at least one managed port is required".into()));
        }
        if let Some(zero) = pairs.iter().find(|p| p.from == 0) {
            return Err(ConfigError::Invalid(format!("managed port {zero} is not a valid port")));
        }
        if self.claim.domain.is_empty() || self.claim.owner_field.is_empty() {
            return Err(ConfigError::Invalid("claim domain and owner field must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SidecarConfig {
        SidecarConfig {
            app_id: "cass".into(),
            instance_id: "i-1".into(),
            ..SidecarConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = SidecarConfig::default();
        assert_eq!(config.reconcile.base_interval(), Duration::from_secs(120));
        assert_eq!(
            config.port_pairs(),
            vec![PortPair::single(7000), PortPair::single(7199), PortPair::single(61620)]
        );
        assert_eq!(config.claim.domain, "InstanceSecurity");
        assert!(config.properties.is_none());
        assert!(config.call_timeout().is_none());
    }

    #[test]
    fn test_duplicate_ports_collapse() {
        let config = SidecarConfig {
            ports: vec![7000, 7000, 7199, 7000],
            ..valid()
        };
        assert_eq!(config.port_pairs(), vec![PortPair::single(7000), PortPair::single(7199)]);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = SidecarConfig::from_toml(
            r#"
            app_id = "cass"
            instance_id = "i-1"
            is_seed = true
            call_timeout_ms = 2500
            ports = [7000, 7299]

            [claim]
            domain = "InstanceSecurityV2"
            consistent_scan = false

            [properties]
            "#,
        )
        .unwrap();

        assert!(config.is_seed);
        assert_eq!(config.port_pairs(), vec![PortPair::single(7000), PortPair::single(7299)]);
        assert_eq!(config.claim.domain, "InstanceSecurityV2");
        assert_eq!(config.claim.owner_field, "instanceId");
        assert!(!config.claim.consistent_scan);
        assert_eq!(config.properties, Some(PropertySchema::default()));
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(2500)));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_error() {
        let err = SidecarConfig::from_toml("is_seed = \"maybe\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_app_id_from_group_name() {
        let config = SidecarConfig {
            app_id: String::new(),
            group_name: Some("cass-useast1a".into()),
            ..valid()
        };
        assert_eq!(config.effective_app_id(), "cass");
        config.validate().unwrap();

        let explicit = SidecarConfig {
            group_name: Some("other-useast1a".into()),
            ..valid()
        };
        assert_eq!(explicit.effective_app_id(), "cass");
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            SidecarConfig { app_id: String::new(), ..valid() },
            SidecarConfig { instance_id: " ".into(), ..valid() },
            SidecarConfig { reconcile: ReconcileConfig { base_interval_ms: 0 }, ..valid() },
            SidecarConfig { call_timeout_ms: Some(0), ..valid() },
            SidecarConfig { ports: vec![7000, 0], ..valid() },
            SidecarConfig { ports: Vec::new(), ..valid() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
        valid().validate().unwrap();
    }
}
