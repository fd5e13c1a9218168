//! Vehicle-position feed collector.
//!
//! Exits with status 0 after a shutdown signal and non-zero when the
//! configuration is invalid.

use collector::CollectorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();

    let config = CollectorConfig::load()?;
    collector::logging::init(&config.log)?;
    collector::run(config).await?;

    Ok(())
}
