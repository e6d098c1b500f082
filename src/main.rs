use clap::Parser;
use sayerd::config_store::{ConfigStore, DEFAULT_WATCH_INTERVAL};
use sayerd::supervisor::Supervisor;
use std::error::Error;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Speech synthesis gateway
#[derive(Parser)]
#[command(name = "sayerd")]
#[command(version)]
#[command(about = "Serves Say requests over TCP using Azure TTS or a local say command", long_about = None)]
struct Cli {
    /// Config file (default: config.yaml in ., /etc/sayerd or the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the (redacted) config and exit
    #[arg(long)]
    dryrun: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store = match ConfigStore::open(cli.config.as_deref()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "loading config failed");
            return Err(e.into());
        }
    };

    if cli.dryrun {
        store.current().redacted().write_yaml(std::io::stdout().lock())?;
        return Ok(());
    }

    let _watcher = store.spawn_watcher(DEFAULT_WATCH_INTERVAL);
    Supervisor::new(store).run(shutdown_signal()).await?;

    info!("sayerd stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down gracefully"),
                    _ = term.recv() => info!("received SIGTERM, shutting down gracefully"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM, only SIGINT will stop sayerd"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
    info!("received SIGINT, shutting down gracefully");
}
