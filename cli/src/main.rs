mod background;
mod cli;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG manda; si no está, info para todos los crates propios
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("miga=info,daemon=info,lair=info,common=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cli::run().await
}
