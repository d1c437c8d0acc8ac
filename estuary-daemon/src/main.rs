//! estuary-daemon: boots the transfer engine and runs the main loop.
//!
//! No protocol modules are wired in here; this binary owns the service
//! lifecycle (construction in dependency order, the cooperative tick
//! loop, orderly teardown) that modules attach to.

mod app;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use app::App;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("estuary-data"));

    let mut app = App::bootstrap(&data_dir)?;
    app.run().await;
    app.shutdown();
    Ok(())
}
