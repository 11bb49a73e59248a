//! Versioned record storage boundary.
//!
//! Storage engines are external collaborators; this module owns the
//! compare-and-swap contract every engine must honour.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryRecordStore;
pub use r#trait::{RecordStore, RecordStoreError};
