//! Per-resource-class coordination policy.
//!
//! Policies are loaded once (typically from a JSON document) and are read-only
//! afterwards. Operation code only ever sees `Arc<Policy>` handed out by the
//! [`PolicyRegistry`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How contention on a resource key is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Surface the conflict to the caller immediately.
    Fail,
    /// Back off linearly, re-read and try again.
    Retry,
    /// Re-read and fold the latest stored quantity into the write.
    Merge,
    /// Proceed without waiting for the current holder. Emergency use only.
    Override,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Fail => "fail",
            ConflictResolution::Retry => "retry",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Override => "override",
        }
    }
}

impl core::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a merge combines the latest stored quantity with the operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Sum,
    Max,
    Min,
    LastWriterWins,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Sum => "sum",
            MergeStrategy::Max => "max",
            MergeStrategy::Min => "min",
            MergeStrategy::LastWriterWins => "last_writer_wins",
        }
    }
}

impl core::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordination policy for one resource class.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub lock_timeout: Duration,
    pub conflict_resolution: ConflictResolution,
    pub merge_strategy: Option<MergeStrategy>,
    pub require_approval: bool,
    pub approver_roles: BTreeSet<String>,
    pub allow_negative_stock: bool,
    pub enforce_reservation_limit: bool,
    /// Conflict rate (conflicts / operations) above which operators are alerted.
    pub conflict_threshold: f64,
    /// Whether operators may request an emergency override for this class.
    pub allow_emergency_override: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(5),
            conflict_resolution: ConflictResolution::Retry,
            merge_strategy: None,
            require_approval: false,
            approver_roles: BTreeSet::new(),
            allow_negative_stock: false,
            enforce_reservation_limit: true,
            conflict_threshold: 0.1,
            allow_emergency_override: false,
        }
    }
}

impl Policy {
    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.conflict_resolution = ConflictResolution::Merge;
        self.merge_strategy = Some(strategy);
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_retry_attempts = max_attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_approval(mut self, approver_roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.require_approval = true;
        self.approver_roles = approver_roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn allowing_negative_stock(mut self) -> Self {
        self.allow_negative_stock = true;
        self
    }

    pub fn allowing_emergency_override(mut self) -> Self {
        self.allow_emergency_override = true;
        self
    }

    /// Linear backoff: `retry_delay × attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }

    fn validate(&self, class: &str) -> Result<(), PolicyError> {
        match (self.conflict_resolution, self.merge_strategy) {
            (ConflictResolution::Merge, None) => {
                return Err(PolicyError::invalid(class, "merge resolution requires a merge_strategy"));
            }
            (ConflictResolution::Override, _) => {
                return Err(PolicyError::invalid(
                    class,
                    "override cannot be a class default; use allow_emergency_override",
                ));
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&self.conflict_threshold) {
            return Err(PolicyError::invalid(class, "conflict_threshold must be within [0, 1]"));
        }
        if self.require_approval && self.approver_roles.is_empty() {
            return Err(PolicyError::invalid(class, "require_approval needs at least one approver role"));
        }
        Ok(())
    }
}

/// Serialized form of a [`Policy`] (durations in milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "defaults::lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    pub conflict_resolution: ConflictResolution,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub approver_roles: Vec<String>,
    #[serde(default)]
    pub allow_negative_stock: bool,
    #[serde(default = "defaults::enforce_reservation_limit")]
    pub enforce_reservation_limit: bool,
    #[serde(default = "defaults::conflict_threshold")]
    pub conflict_threshold: f64,
    #[serde(default)]
    pub allow_emergency_override: bool,
}

mod defaults {
    pub fn max_retry_attempts() -> u32 {
        3
    }
    pub fn retry_delay_ms() -> u64 {
        100
    }
    pub fn lock_timeout_ms() -> u64 {
        5_000
    }
    pub fn enforce_reservation_limit() -> bool {
        true
    }
    pub fn conflict_threshold() -> f64 {
        0.1
    }
}

impl From<PolicyDocument> for Policy {
    fn from(doc: PolicyDocument) -> Self {
        Self {
            max_retry_attempts: doc.max_retry_attempts,
            retry_delay: Duration::from_millis(doc.retry_delay_ms),
            lock_timeout: Duration::from_millis(doc.lock_timeout_ms),
            conflict_resolution: doc.conflict_resolution,
            merge_strategy: doc.merge_strategy,
            require_approval: doc.require_approval,
            approver_roles: doc.approver_roles.into_iter().collect(),
            allow_negative_stock: doc.allow_negative_stock,
            enforce_reservation_limit: doc.enforce_reservation_limit,
            conflict_threshold: doc.conflict_threshold,
            allow_emergency_override: doc.allow_emergency_override,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("no policy configured for resource class '{0}'")]
    NotFound(String),

    #[error("invalid policy for '{class}': {reason}")]
    Invalid { class: String, reason: String },

    #[error("policy document could not be parsed: {0}")]
    Parse(String),
}

impl PolicyError {
    fn invalid(class: &str, reason: &str) -> Self {
        Self::Invalid {
            class: class.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Immutable map of resource class → policy.
///
/// There is deliberately no mutation API once built.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// Build a registry, validating every policy.
    pub fn from_policies<I, S>(policies: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = (S, Policy)>,
        S: Into<String>,
    {
        let mut map = HashMap::new();
        for (class, policy) in policies {
            let class = class.into();
            if class.trim().is_empty() {
                return Err(PolicyError::invalid(&class, "resource class cannot be empty"));
            }
            policy.validate(&class)?;
            map.insert(class, Arc::new(policy));
        }
        Ok(Self { policies: map })
    }

    /// Parse a `{ "<class>": { ...policy... } }` JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, PolicyError> {
        let docs: HashMap<String, PolicyDocument> =
            serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Self::from_policies(docs.into_iter().map(|(class, doc)| (class, Policy::from(doc))))
    }

    pub fn resolve(&self, resource_class: &str) -> Result<Arc<Policy>, PolicyError> {
        self.policies
            .get(resource_class)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(resource_class.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
