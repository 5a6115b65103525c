use anyhow::Context;
use clap::Parser;
use detection_client::{config, ClientPortal};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "detection_client",
    about = "Send an image to the detection server and save the annotated result"
)]
struct Cli {
    /// Image to annotate.
    input: PathBuf,

    /// Where the annotated image is written.
    output: PathBuf,

    /// Server address as host:port, defaults to the configured server.
    #[arg(long, env = "DC_SERVER_ADDRESS")]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::get_configuration().context("failed to load configuration")?;
    let log_level = config.log_level.as_str();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let server_address = cli
        .server
        .unwrap_or_else(|| config.server.get_address());
    let portal = ClientPortal::new(&config.portal);

    tracing::info!("Sending {:?} to {}", cli.input, server_address);
    let annotated = portal
        .send_image(&server_address, &cli.input)
        .await
        .with_context(|| format!("detection request to {} failed", server_address))?;

    tokio::fs::write(&cli.output, &annotated)
        .await
        .with_context(|| format!("failed to write {:?}", cli.output))?;
    tracing::info!("Saved {} byte annotated image to {:?}", annotated.len(), cli.output);

    Ok(())
}
