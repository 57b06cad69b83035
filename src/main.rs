use anyhow::Result;
use sketch_runner::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!(
        "Starting sketch runner (data dir {}, port {})",
        config.data_dir.display(),
        config.port
    );

    sketch_runner::server::run_server(config).await?;

    Ok(())
}
