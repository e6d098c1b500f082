//! Generation loop: build a backend from the live config, serve it, and on
//! every config change tear the generation down and start the next one.

use crate::backends;
use crate::config_store::ConfigStore;
use crate::error::{Result, SayerError};
use crate::server;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No generation started yet.
    Starting,
    /// A backend is built and the server is accepting requests.
    Serving { generation: u64 },
    /// The previous generation was told to stop and is draining.
    Restarting { generation: u64 },
    /// Terminated; no further generation will start.
    Stopped,
}

/// Why a serving generation ended.
enum Exit {
    Reload,
    Terminate,
    Crashed(std::result::Result<Result<()>, JoinError>),
}

pub struct Supervisor {
    store: ConfigStore,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(store: ConfigStore) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self { store, state }
    }

    /// Follow state transitions, mostly for tests and status reporting.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Runs generations until `terminate` resolves. Returns early with an error
    /// if a backend cannot be built or a server stops on its own.
    pub async fn run<F>(self, terminate: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(terminate);
        let mut changes = self.store.subscribe();
        let mut generation = 0u64;

        loop {
            generation += 1;
            let settings = changes.borrow_and_update().clone();

            let backend = match backends::from_settings(&settings) {
                Ok(backend) => backend,
                Err(e) => {
                    error!(generation, error = %e, "could not build backend");
                    self.state.send_replace(SupervisorState::Stopped);
                    return Err(e);
                }
            };

            let addr = settings.bind_addr();
            let (stop, stop_rx) = watch::channel(false);
            let mut serving = tokio::spawn({
                let backend = backend.clone();
                let addr = addr.clone();
                async move { server::serve(stop_rx, backend, &addr).await }
            });

            info!(generation, backend = backend.id(), %addr, "serving");
            self.state.send_replace(SupervisorState::Serving { generation });

            let exit = tokio::select! {
                changed = changes.changed() => match changed {
                    Ok(()) => Exit::Reload,
                    Err(_) => Exit::Terminate,
                },
                _ = &mut terminate => Exit::Terminate,
                finished = &mut serving => Exit::Crashed(finished),
            };

            let terminating = matches!(exit, Exit::Terminate);
            match exit {
                Exit::Crashed(finished) => {
                    backend.close().await;
                    self.state.send_replace(SupervisorState::Stopped);
                    return Err(match finished {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => SayerError::Protocol("server stopped unexpectedly".to_string()),
                        Err(e) => SayerError::Protocol(format!("server task failed: {}", e)),
                    });
                }
                Exit::Reload => {
                    warn!(generation, "config changed, restarting");
                    self.state
                        .send_replace(SupervisorState::Restarting { generation });
                }
                Exit::Terminate => info!(generation, "terminating, waiting for in-flight requests"),
            }

            let _ = stop.send(true);
            match serving.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(generation, error = %e, "server ended with error"),
                Err(e) => error!(generation, error = %e, "server task failed"),
            }
            backend.close().await;
            info!(generation, "generation shut down");

            if terminating {
                self.state.send_replace(SupervisorState::Stopped);
                return Ok(());
            }
        }
    }
}
