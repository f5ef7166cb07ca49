use std::path::PathBuf;

use clap::Parser;
use eth_signer_proxy::config::load_config;
use eth_signer_proxy::service::Service;
use eth_signer_proxy::shutdown::spawn_await_shutdown_task;
use eth_signer_proxy::telemetry::{init_metrics, init_tracing};

#[derive(Parser)]
#[command(author, version, about)]
#[clap(rename_all = "kebab-case")]
struct Args {
    #[clap(short, long)]
    #[cfg_attr(
        feature = "default-config",
        clap(default_value = "config.toml")
    )]
    config: Vec<PathBuf>,

    #[clap(short, long)]
    env_file: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    dotenv::dotenv().ok();

    for path in &args.env_file {
        dotenv::from_path(path)?;
    }

    let config = load_config(args.config.iter().map(PathBuf::as_ref))?;

    init_tracing(&config.service)?;
    init_metrics(&config.service).await?;

    spawn_await_shutdown_task();

    tracing::info!(?config, "Starting service");
    let service = Service::new(config).await?;
    service.spawn_reload_task()?;
    service.wait().await?;

    Ok(())
}
