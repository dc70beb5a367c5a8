//! nsmutex - inspect and hold secured-namespace mutexes
//!
//! Handy for checking which object name a pool maps to, and for holding a
//! pool or installation mutex from a shell while exercising another
//! process against it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nsmutex_core::blocking::{take_installation_mutex_cancellable, take_pool_mutex_cancellable};
use nsmutex_core::naming::{HashProvider, MutexNamer};
use nsmutex_core::{init_tracing, NamespaceConfig, SystemRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Named mutexes in a secured namespace
#[derive(Parser, Debug)]
#[command(name = "nsmutex")]
#[command(version)]
#[command(about = "Derive, acquire and hold secured-namespace mutexes")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file (default: $NSMUTEX_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the mutex name a pool maps to
    Derive {
        /// Pool identifier
        pool: String,
    },

    /// Acquire a pool mutex and hold it
    Hold {
        /// Pool identifier
        pool: String,

        /// Seconds to hold before releasing (default: until Ctrl-C)
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Acquire the installation mutex and hold it
    InstallLock {
        /// Seconds to hold before releasing (default: until Ctrl-C)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<NamespaceConfig> {
    let config = match path {
        Some(path) => NamespaceConfig::from_file(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => NamespaceConfig::from_env().context("Failed to load configuration")?,
    };
    Ok(config)
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn hold_until(seconds: Option<u64>, cancel: &CancellationToken) {
    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = cancel.cancelled() => {}
            }
        }
        None => cancel.cancelled().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    let config = load_config(args.config)?;

    match args.command {
        Command::Derive { pool } => {
            // Derivation needs no namespace
            let namer = MutexNamer::new(HashProvider::open(), &config.namespace, &config.pool_mutex_prefix);
            println!("{}", namer.derive(&pool));
        }
        Command::Hold { pool, seconds } => {
            let runtime = Arc::new(SystemRuntime::system(config));
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            info!(pool = %pool, "Waiting for pool mutex");
            let guard = take_pool_mutex_cancellable(Arc::clone(&runtime), pool, cancel.clone()).await?;
            info!(mutex = %guard.name(), abandoned = guard.was_abandoned(), "Holding pool mutex");
            hold_until(seconds, &cancel).await;
            guard.release();
            runtime.shutdown();
        }
        Command::InstallLock { seconds } => {
            let runtime = Arc::new(SystemRuntime::system(config));
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            info!("Waiting for installation mutex");
            let guard = take_installation_mutex_cancellable(Arc::clone(&runtime), cancel.clone()).await?;
            info!(mutex = %guard.name(), abandoned = guard.was_abandoned(), "Holding installation mutex");
            hold_until(seconds, &cancel).await;
            guard.release();
            runtime.shutdown();
        }
    }

    Ok(())
}
