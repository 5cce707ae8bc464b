//! Front-end server that also launches the backend as a child process.
//!
//! The child gets `PORT` pinned to `backend.port` (8001 by default) and is
//! killed when this process receives SIGINT or SIGTERM.

use frontgate::config::Config;
use frontgate::launcher::{self, Mode};
use std::path::PathBuf;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launcher::init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::resolve(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    launcher::run(config, Mode::Supervise).await
}
