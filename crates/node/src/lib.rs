//! Node assembly for glint: configuration loading, the in-process replica
//! and anti-entropy wiring, and cluster bootstrap. The `glintd` binary
//! (`src/bin/glintd.rs`) is a thin CLI shell around what's exported here.

pub mod cluster;
pub mod config;
pub mod replica;

pub use cluster::{Cluster, Node, now_millis};
pub use config::GlintConfig;
pub use replica::StoreReplicaClient;

/// Initialize `tracing` with an `RUST_LOG`-driven filter, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
