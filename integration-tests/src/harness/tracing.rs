use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Installs a plain-text subscriber for test runs. Filtering follows
/// `RUST_LOG`; defaults to warnings only so passing runs stay quiet.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
