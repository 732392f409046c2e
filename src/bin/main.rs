use color_eyre::Result;
use tex2html_backend::{Orchestrator, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    color_eyre::install()?;

    let settings = Settings::load()?;
    let orchestrator = Orchestrator::new(settings)?;
    orchestrator.verify_tools().await?;
    info!("conversion engine running, waiting for submissions");

    tokio::signal::ctrl_c().await?;
    info!("termination signal received");
    orchestrator.shutdown().await;
    Ok(())
}
