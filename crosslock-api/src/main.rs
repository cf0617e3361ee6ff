use anyhow::Result;
use crosslock_api::{init_observability, ApiServer};
use crosslock_core::RelayerConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_observability()?;

    let config = match RelayerConfig::from_file("config.json") {
        Ok(config) => config,
        Err(_) => {
            info!("config.json not found; using environment configuration");
            RelayerConfig::from_env()?
        }
    };

    // Misconfiguration is fatal: exit non-zero before touching any chain.
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    info!("starting crosslock relayer");
    let server = ApiServer::new(config).await?;
    server.run().await?;

    Ok(())
}
