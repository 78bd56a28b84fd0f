use std::process::ExitCode;

use bspserver::{Server, ServerConfig, Transport, load_config};

/// Env var naming the JSON config file when no path is given on the command line.
const CONFIG_ENV: &str = "BSP_SERVER_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = match std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok()) {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    let mut server = match Server::builder().config(config).build() {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to build server");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(pid = std::process::id(), "starting BSP server on stdio");

    let mut transport = Transport::stdio();
    match server.serve(&mut transport).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, state = %server.state(), "server terminated");
            ExitCode::FAILURE
        }
    }
}
