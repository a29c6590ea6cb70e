use clap::Parser;
use ledgerctl::{Application, Config, config::Args, telemetry};
use tokio::signal;

/// Resolves on SIGTERM or Ctrl+C, whichever arrives first
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        "Ctrl+C"
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&str>();

    let received = tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    };
    tracing::info!(signal = received, "Shutting down gracefully");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export, config.log_format)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config_file = %args.config,
        "Starting ledgerctl"
    );

    Application::new(config).await?.serve(shutdown_signal()).await
}
