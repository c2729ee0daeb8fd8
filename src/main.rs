//! Entrypoint: loads configuration, initializes tracing, parses the CLI, and
//! dispatches to the requested command.

use clap::Parser;
use gridbot_backend::app;
use gridbot_backend::cli::Cli;
use gridbot_backend::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gridbot_backend=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let cli = Cli::parse();
    let code = app::dispatch(cli, config).await;
    std::process::exit(code);
}
