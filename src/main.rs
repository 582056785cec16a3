use clap::Parser;
use docbus::{config::Config, server};

#[derive(Parser, Debug)]
#[command(name = "docbus", version, about = "Document persistence over a message bus")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "DOCBUS_CONFIG", default_value = "config.toml")]
    config: String,

    /// Override the listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Override the bus address the persistor answers on
    #[arg(long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize logging with env filter, e.g.: RUST_LOG=info,docbus=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = Config::load_from(&args.config)?;
    if let Some(addr) = args.listen_addr {
        cfg.listen_addr = addr;
    }
    if let Some(address) = args.address {
        cfg.address = address;
    }
    tracing::info!(listen_addr = %cfg.listen_addr, backend = ?cfg.backend.kind, "starting docbus");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
    }

    Ok(())
}
