//! Process-wide tracing setup.

/// Initialize process-wide observability (JSON tracing to stdout).
///
/// The workspace ships libraries only: the embedding binary calls this once
/// at startup, before building an `OperationCoordinator`. Tests use
/// [`tracing::init_for_tests`] instead. Safe to call multiple times;
/// subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, formatters).
pub mod tracing;

#[cfg(test)]
mod tests {
    #[test]
    fn init_can_be_called_repeatedly() {
        super::init();
        super::init();
        ::tracing::info!("observability initialized");
    }
}
