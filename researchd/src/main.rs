use clap::Parser;
use researchd::{
    Application, Config, RunMode,
    config::{Args, Command},
    links, telemetry,
};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();

    // Needs no configuration, so it works before a secret exists
    if args.command == Some(Command::GenerateSecret) {
        println!("{}", links::generate_secret());
        return Ok(());
    }

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    let mode = match &args.command {
        Some(Command::IssueLink { requester, query }) => {
            let codec = researchd::link_codec(&config)?;
            println!("{}", codec.link(&config.links.base_url, requester, query)?);
            return Ok(());
        }
        Some(Command::Serve) => RunMode::Serve,
        Some(Command::Worker) => RunMode::Worker,
        Some(Command::All) | Some(Command::GenerateSecret) | None => RunMode::All,
    };

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let shutdown = shutdown_signal();
    Application::new(config, mode).await?.serve(shutdown).await
}
