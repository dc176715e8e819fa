//! Fleet configuration.
//!
//! Loaded from an optional TOML file and then overlaid with environment
//! variables. Every section has defaults, so an empty file (or none at all)
//! is a valid configuration apart from the workload catalog.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatch::DispatchConfig;
use crate::error::FleetError;
use crate::executor::ExecutorConfig;
use crate::pool::PoolPolicy;
use crate::provision::ProvisionConfig;
use crate::sweeper::SweeperConfig;
use crate::workload::WorkloadCatalog;

/// Provider API credential.
pub const ENV_API_KEY: &str = "VAST_API_KEY";

/// Private key used for remote sessions (`<path>.pub` is attached to instances).
pub const ENV_SSH_KEY_PATH: &str = "FLEET_SSH_KEY_PATH";

/// Job store location.
pub const ENV_STORE_PATH: &str = "FLEET_STORE_PATH";

/// Prefix for provider-side instance labels.
pub const ENV_LABEL_PREFIX: &str = "FLEET_LABEL_PREFIX";

/// Default label prefix.
pub const DEFAULT_LABEL_PREFIX: &str = "fleet";

/// Default job store location.
pub const DEFAULT_STORE_PATH: &str = ".fleet/jobs.json";

/// Pool key used for workload types without their own policy.
pub const DEFAULT_POOL_KEY: &str = "default";

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Provider API key. Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Private key for SSH sessions.
    pub ssh_key_path: Option<PathBuf>,
    /// Job store file.
    pub store_path: PathBuf,
    /// Prefix for instance labels; also scopes what cleanup may touch.
    pub label_prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            ssh_key_path: None,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
        }
    }
}

/// Complete fleet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub connection: ConnectionConfig,
    pub provision: ProvisionConfig,
    /// Pool policies keyed by workload type; `default` applies to the rest.
    pub pools: HashMap<String, PoolPolicy>,
    pub dispatch: DispatchConfig,
    pub executor: ExecutorConfig,
    pub sweeper: SweeperConfig,
    pub workloads: WorkloadCatalog,
}

impl FleetConfig {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// workload catalog is inconsistent.
    pub fn load(path: Option<&Path>) -> Result<Self, FleetError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    FleetError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                let config: Self = toml::from_str(&content).map_err(|e| {
                    FleetError::Config(format!("failed to parse {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "Loaded fleet configuration");
                config
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    ///
    /// # Errors
    /// Returns [`FleetError::Config`] for the first inconsistency found.
    pub fn validate(&self) -> Result<(), FleetError> {
        self.workloads.validate()?;
        for (name, policy) in [
            ("provision.offer_retry", &self.provision.offer_retry),
            ("provision.status_poll", &self.provision.status_poll),
            ("provision.probe", &self.provision.probe),
            ("executor.poll", &self.executor.poll),
        ] {
            policy.validate(name)?;
        }

        // An idle pool member outliving either window would be terminated by
        // a `cleanup` run that cannot see the pool.
        let default_policy = self.pool_policy(DEFAULT_POOL_KEY);
        let policies = self
            .pools
            .iter()
            .map(|(key, policy)| (key.as_str(), policy))
            .chain(std::iter::once((DEFAULT_POOL_KEY, &default_policy)));
        let limit = self.sweeper.orphan_grace.min(self.sweeper.staleness_threshold);
        for (key, policy) in policies {
            if policy.idle_timeout >= limit {
                return Err(FleetError::Config(format!(
                    "pools.{key}.idle_timeout ({}s) must be shorter than sweeper.orphan_grace ({}s) \
                     and sweeper.staleness_threshold ({}s)",
                    policy.idle_timeout.as_secs(),
                    self.sweeper.orphan_grace.as_secs(),
                    self.sweeper.staleness_threshold.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Overlay environment variables.
    pub fn apply_env(&mut self) {
        if let Some(key) = non_empty_env(ENV_API_KEY) {
            self.connection.api_key = Some(key);
        }
        if let Some(path) = non_empty_env(ENV_SSH_KEY_PATH) {
            self.connection.ssh_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env(ENV_STORE_PATH) {
            self.connection.store_path = PathBuf::from(path);
        }
        if let Some(prefix) = non_empty_env(ENV_LABEL_PREFIX) {
            self.connection.label_prefix = prefix;
        }
        debug!(
            has_api_key = self.connection.api_key.is_some(),
            store = %self.connection.store_path.display(),
            "Applied environment overrides"
        );
    }

    /// Provider API key.
    ///
    /// # Errors
    /// Returns an error if `VAST_API_KEY` was not provided.
    pub fn api_key(&self) -> Result<&str, FleetError> {
        self.connection
            .api_key
            .as_deref()
            .ok_or_else(|| FleetError::Config(format!("{ENV_API_KEY} environment variable not set")))
    }

    /// Public half of the SSH key, read from `<ssh_key_path>.pub`.
    ///
    /// # Errors
    /// Returns an error if a key path is configured but the public key
    /// cannot be read.
    pub fn public_key(&self) -> Result<Option<String>, FleetError> {
        let Some(private) = &self.connection.ssh_key_path else {
            return Ok(None);
        };
        let mut public = private.clone().into_os_string();
        public.push(".pub");
        let public = PathBuf::from(public);
        let key = std::fs::read_to_string(&public).map_err(|e| {
            FleetError::Config(format!("failed to read public key {}: {e}", public.display()))
        })?;
        Ok(Some(key.trim().to_string()))
    }

    /// Policy for a workload type's pool.
    #[must_use]
    pub fn pool_policy(&self, workload_type: &str) -> PoolPolicy {
        self.pools
            .get(workload_type)
            .or_else(|| self.pools.get(DEFAULT_POOL_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Serde adapter for `Duration` as (fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` as (fractional) seconds.
pub mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            )),
            Some(s) => Duration::try_from_secs_f64(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
