use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
struct Args {
    #[clap(short, long, default_value = "8546")]
    port: u16,

    #[clap(long, default_value = "1337")]
    chain_id: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().compact())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let (_node, server) =
        fake_rpc::serve_with_chain_id(args.port, args.chain_id).await;

    tracing::info!("Serving fake RPC at {}", server.local_addr());

    server.await?;

    Ok(())
}
