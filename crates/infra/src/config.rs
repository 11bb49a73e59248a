//! Process configuration: `STOCKGUARD_*` environment variables and the policy file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use stockguard_inventory::{PolicyError, PolicyRegistry};

use crate::audit::{OperationSigner, SignerError};
use crate::lock::coordinator::DEFAULT_LEASE_TTL;
use crate::monitor::MonitorConfig;

const DEV_SIGNING_KEY: &str = "stockguard-dev-signing-key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Coordinator and monitor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// HMAC key for operation signatures (`STOCKGUARD_SIGNING_KEY`).
    pub signing_key: Vec<u8>,
    /// Distributed lock lease (`STOCKGUARD_LOCK_TTL_MS`).
    pub lease_ttl: Duration,
    /// `STOCKGUARD_APPROVAL_TIMEOUT_MS`
    pub approval_timeout: Duration,
    /// `STOCKGUARD_APPROVAL_POLL_MS`
    pub approval_poll_interval: Duration,
    /// `STOCKGUARD_CONFLICT_CHECK_INTERVAL_MS`
    pub conflict_check_interval: Duration,
    /// `STOCKGUARD_CLEANUP_INTERVAL_MS`
    pub cleanup_interval: Duration,
    /// How long finished operations are kept (`STOCKGUARD_RETENTION_SECS`).
    pub retention: Duration,
    /// Age after which a non-terminal operation is reported (`STOCKGUARD_STALE_AFTER_SECS`).
    pub stale_after: Duration,
    /// Policy document to load (`STOCKGUARD_POLICY_PATH`).
    pub policy_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            signing_key: DEV_SIGNING_KEY.as_bytes().to_vec(),
            lease_ttl: DEFAULT_LEASE_TTL,
            approval_timeout: Duration::from_secs(30),
            approval_poll_interval: Duration::from_millis(50),
            conflict_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            stale_after: Duration::from_secs(600),
            policy_path: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match lookup("STOCKGUARD_SIGNING_KEY") {
            Some(key) if !key.is_empty() => config.signing_key = key.into_bytes(),
            _ => warn!("STOCKGUARD_SIGNING_KEY not set; using insecure dev default"),
        }

        let millis = |var: &'static str, slot: &mut Duration| -> Result<(), ConfigError> {
            if let Some(value) = lookup(var) {
                *slot = Duration::from_millis(parse_positive(var, &value)?);
            }
            Ok(())
        };
        millis("STOCKGUARD_LOCK_TTL_MS", &mut config.lease_ttl)?;
        millis("STOCKGUARD_APPROVAL_TIMEOUT_MS", &mut config.approval_timeout)?;
        millis("STOCKGUARD_APPROVAL_POLL_MS", &mut config.approval_poll_interval)?;
        millis("STOCKGUARD_CONFLICT_CHECK_INTERVAL_MS", &mut config.conflict_check_interval)?;
        millis("STOCKGUARD_CLEANUP_INTERVAL_MS", &mut config.cleanup_interval)?;

        if let Some(value) = lookup("STOCKGUARD_RETENTION_SECS") {
            config.retention = Duration::from_secs(parse_positive("STOCKGUARD_RETENTION_SECS", &value)?);
        }
        if let Some(value) = lookup("STOCKGUARD_STALE_AFTER_SECS") {
            config.stale_after = Duration::from_secs(parse_positive("STOCKGUARD_STALE_AFTER_SECS", &value)?);
        }
        config.policy_path = lookup("STOCKGUARD_POLICY_PATH").map(PathBuf::from);

        Ok(config)
    }

    pub fn signer(&self) -> Result<OperationSigner, ConfigError> {
        Ok(OperationSigner::new(&self.signing_key)?)
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            conflict_check_interval: self.conflict_check_interval,
            cleanup_interval: self.cleanup_interval,
            retention: self.retention,
            stale_after: self.stale_after,
        }
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be greater than zero".to_string())),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Read and validate a JSON policy document.
pub fn load_policies(path: impl AsRef<Path>) -> Result<PolicyRegistry, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(PolicyRegistry::from_json_str(&json)?)
}
