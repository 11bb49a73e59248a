//! Tamper-evident audit of operation state transitions.
//!
//! Every operation has its own hash-chained trail in the [`AuditLedger`]; each
//! event is also forwarded to a durable [`AuditSink`]. Completed operations are
//! signed by the [`OperationSigner`].

pub mod ledger;
pub mod signer;
pub mod sink;

pub use ledger::{AuditEvent, AuditEventKind, AuditLedger, LedgerError, Severity};
pub use signer::{OperationSigner, SignerError};
pub use sink::{AuditSink, AuditSinkError, InMemoryAuditSink, TracingAuditSink};
