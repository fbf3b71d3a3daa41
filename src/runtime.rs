// runtime.rs
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// One multithread Tokio runtime shared by every blocking entry point in the
/// process, wrapped in Arc so callers can clone cheaply.
static RUNTIME: Lazy<Arc<Runtime>> = Lazy::new(|| {
    Arc::new(
        Builder::new_multi_thread()
            .thread_name("relay-tunnel-rt")
            .enable_all()
            .build()
            .expect("failed to build global Tokio runtime"),
    )
});

/// Borrow (clone) the global runtime handle.
pub fn get_runtime() -> Arc<Runtime> {
    Arc::clone(&RUNTIME)
}
