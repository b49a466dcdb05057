//! Main entry point for the galena-miner daemon.

use galena_miner::{daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let daemon = Daemon::from_env()?;
    daemon.run().await
}
