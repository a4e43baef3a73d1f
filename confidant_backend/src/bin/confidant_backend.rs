use anyhow::{Context, Result};
use confidant_backend::config::BackendConfig;
use confidant_backend::runtime::BackendRuntime;
use confidant_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,confidant_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting backend service (set CONFIDANT_BACKEND_TOKEN + optional CONFIDANT_BACKEND_BIND; auth mode via CONFIDANT_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
