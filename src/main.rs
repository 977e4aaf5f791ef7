use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use etcetera::BaseStrategy;
use tokio::sync::{Mutex, mpsc};
use tokio::task;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::player::Control;
use crate::server::Server;
use crate::system::System;

mod auth;
mod chooser;
mod cli;
mod command;
mod config;
mod events;
mod player;
mod playlist;
mod protocol;
mod queue;
mod rights;
mod schedule;
mod server;
mod store;
mod system;
mod trackname;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().unwrap();
    setup_tracing();

    let options = Cli::parse();
    let config = Arc::new(load_config(options.config)?);

    match options.command {
        Commands::Serve => {
            let system = Arc::new(Mutex::new(System::new(Arc::clone(&config))?));
            let (player_tx, player_rx) = mpsc::channel(16);
            let server = Server {
                system: Arc::clone(&system),
                player: player_tx.clone(),
            };

            server::serve(server.clone()).await?;
            let player_task = task::spawn(player::run(Arc::clone(&system), player_rx));
            task::spawn(server::schedule_runner(server.clone()));
            // pick up whatever appeared in the collections since last run
            task::spawn(server::run_rescan(Arc::clone(&system)));

            tokio::signal::ctrl_c()
                .await
                .wrap_err("could not wait for ctrl-c")?;
            info!("shutting down");
            player_tx.send(Control::Shutdown).await.ok();
            match tokio::time::timeout(Duration::from_secs(5), player_task).await {
                Ok(joined) => joined.wrap_err("player task panicked")??,
                Err(_) => warn!("player task did not stop in time"),
            }
        }
        Commands::Rescan => {
            let system = Arc::new(Mutex::new(System::new(config)?));
            server::run_rescan(system).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<camino::Utf8PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None => {
            let dirs = etcetera::choose_base_strategy()?;
            let default = dirs.config_dir().join("jukeboxd").join("config.toml");
            match camino::Utf8PathBuf::from_path_buf(default) {
                Ok(path) if path.exists() => path,
                _ => {
                    warn!("no configuration file, using defaults");
                    return Ok(Config::default());
                }
            }
        }
    };
    Config::load(&path)
}

pub fn setup_tracing() {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt = fmt::layer().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init();
}
