use std::{env, path::PathBuf, sync::Arc};

use colored::Colorize;
use log::{error, info};
use thiserror::Error;
use tokio::runtime::{self, Runtime};

mod bsl;
mod config;
mod events;
mod logging;
mod playback;
mod playlist;
mod probe;
mod rate_limit;
mod rooms;
mod server;
mod store;
mod validate;

use crate::{
    config::Config,
    rate_limit::WsRateLimiter,
    rooms::{router::SyncContext, RoomManager},
    server::ws::Gateway,
    store::{Store, StoreError},
};

pub struct SyncPlayer {
    context: SyncContext,
    runtime: Runtime,
}

#[derive(Debug, Error)]
enum FatalError {
    #[error("Could not initialize the persistent store: {0}")]
    Store(#[from] StoreError),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl SyncPlayer {
    fn new() -> Result<Self, FatalError> {
        info!("Building async runtime...");
        let main_runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sync-async")
            .build()
            .map_err(|e| FatalError::Fatal(e.to_string()))?;

        let config_path = env::var("SYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sync-player.conf"));

        let config = Arc::new(Config::load(&config_path));

        info!(
            "Running in {} mode on port {}",
            if config.server_mode {
                "multi-room"
            } else {
                "single-room"
            },
            config.port
        );

        let store = Arc::new(Store::load(&config.data_dir)?);
        let gateway = Gateway::new();

        // Rooms spawn their clock tickers, so the manager is built inside
        // the runtime
        let rooms = {
            let _guard = main_runtime.enter();
            RoomManager::new(config.clone(), store.clone(), gateway.clone())
        };

        Ok(Self {
            context: SyncContext {
                config,
                store,
                rooms,
                gateway,
                limiter: Arc::new(WsRateLimiter::default()),
            },
            runtime: main_runtime,
        })
    }

    fn run(&self) {
        self.runtime
            .block_on(server::run_server(self.context.clone()))
    }
}

impl FatalError {
    fn hint(&self) -> String {
        match self {
            FatalError::Store(_) => {
                "Check that the data directory is writable, and that SYNC_STORE_KEY, if set, is 64 hex characters.".to_string()
            }
            FatalError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

fn main() {
    logging::init_logger();

    match SyncPlayer::new() {
        Ok(player) => {
            info!("Initialized successfully.");
            player.run();
        }
        Err(error) => {
            error!(
                "{} Read the error below to troubleshoot the issue.",
                "sync-player failed to start!".bold().color("red")
            );
            error!("{}", error);
            error!(
                "{}",
                format!("Hint: {}", error.hint()).bright_black().italic()
            );
        }
    }
}
