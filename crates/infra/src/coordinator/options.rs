use std::collections::BTreeSet;

use stockguard_core::ActorId;

use crate::context::OperationContext;

/// Per-request inputs to [`super::OperationCoordinator::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub actor: ActorId,
    /// Roles that may satisfy a policy's `approver_roles` inline.
    pub actor_roles: BTreeSet<String>,
    /// Version the caller read. A stale pin is resolved like any other conflict.
    pub expected_version: Option<u64>,
    pub context: OperationContext,
    /// Reason for bypassing mutual exclusion. Only honoured when the class
    /// policy allows emergency overrides.
    pub emergency_override: Option<String>,
}

impl ExecuteOptions {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            ..Self::default()
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.actor_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_emergency_override(mut self, reason: impl Into<String>) -> Self {
        self.emergency_override = Some(reason.into());
        self
    }
}
