//! Runtime coordination of concurrent inventory mutations.
//!
//! Collaborator contracts (record store, distributed lock, approval workflow,
//! audit and alert sinks) with in-memory implementations, the per-key lock
//! coordinator, the audit ledger and the [`OperationCoordinator`] service that
//! ties them together.

pub mod alert;
pub mod approval;
pub mod audit;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod record_store;


pub use alert::{Alert, AlertSink, InMemoryAlertSink, TracingAlertSink};
pub use approval::{ApprovalDecision, ApprovalError, ApprovalWorkflow, AutoApprove, InMemoryApprovalWorkflow};
pub use audit::{AuditEvent, AuditEventKind, AuditSink, InMemoryAuditSink, OperationSigner, Severity};
pub use config::{ConfigError, CoordinatorConfig, load_policies};
pub use context::{Interrupted, OperationContext};
pub use coordinator::{
    CleanupReport, ErrorClass, ExecuteError, ExecuteOptions, OperationCoordinator, OperationCoordinatorBuilder,
    OperationError,
};
pub use lock::{DistributedLock, InMemoryDistributedLock};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use monitor::{ConflictRateMonitor, MonitorConfig, MonitorHandle, Monitors};
pub use record_store::{InMemoryRecordStore, RecordStore, RecordStoreError};
