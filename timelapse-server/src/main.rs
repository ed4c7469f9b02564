use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timelapse_server::{
    infra::{
        config::{Config, ConfigLoader},
        startup::{bind_listener, bootstrap, shutdown_signal},
    },
    routes::create_router,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "timelapse-server")]
#[command(
    about = "Web control panel for a timelapse capture script with live logs and status"
)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to a TOML configuration file
    #[arg(long, env = "TIMELAPSE_CONFIG")]
    config: Option<PathBuf>,

    /// Dotenv file to read instead of searching for `.env`
    #[arg(long, env = "TIMELAPSE_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Capture script, invoked as `<script> <interval> <frames>`
    #[arg(long, env = "TIMELAPSE_SCRIPT")]
    script: Option<PathBuf>,

    /// Status file shared with other tools
    #[arg(long, env = "TIMELAPSE_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// Directory holding the script's `timelapse_*` run folders
    #[arg(long, env = "TIMELAPSE_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_server(cli.serve).await
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }
    if let Some(script) = args.script.clone() {
        config.capture.script_path = script;
    }
    if let Some(status_file) = args.status_file.clone() {
        config.capture.status_file = status_file;
    }
    if let Some(output_root) = args.output_root.clone() {
        config.capture.output_root = output_root;
    }

    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(&args)?;
    init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    info!(
        script = %config.capture.script_path.display(),
        status_file = %config.capture.status_file.display(),
        output_root = %config.capture.output_root.display(),
        "capture settings"
    );

    let listener = bind_listener(&config.server).await?;
    let addr = listener.local_addr().context("listener has no address")?;

    let state = bootstrap(config);
    let supervisor = state.supervisor.clone();
    let app = create_router(state);
    info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}
