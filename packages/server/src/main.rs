#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::path::PathBuf;

use clap::Parser;
use switchboard_server::{
    App, AppError,
    config::{Config, ConfigError},
    demo,
};
use thiserror::Error;

#[derive(Parser)]
#[command(author, version, about = "Real-time websocket messaging server")]
struct Args {
    /// Config file (`.json5` or `.json`). Defaults to `switchboard.json5` in
    /// the working directory when present.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Also writes logs to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Logging(#[from] switchboard_logging::InitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    App(#[from] AppError),
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let path = args
        .config
        .clone()
        .or_else(|| std::env::current_dir().ok().and_then(|x| Config::find_in(&x)));

    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => {
            log::debug!("No config file, using defaults");
            Config::default()
        }
    };

    config.apply_env()?;

    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate()?;

    Ok(config)
}

#[actix_web::main]
async fn main() -> Result<(), StartupError> {
    let args = Args::parse();

    let _layer = switchboard_logging::init(Some("switchboard_server.log"), args.log_dir.as_deref())?;

    let config = load_config(&args)?;
    log::debug!("Starting with {config:?}");

    let mut app = App::new(config).await?;
    demo::install(&mut app)?;

    app.listen_and_serve().await?;

    log::info!("Server stopped");

    Ok(())
}
