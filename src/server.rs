use crate::backends::SpeechBackend;
use crate::error::{Result, SayerError};
use crate::protocol::{self, Event};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serves `backend` on `addr` until `shutdown` turns true (or its sender is dropped).
///
/// After the signal no new connection is accepted; requests already being
/// processed run to completion and get their reply before this returns.
pub async fn serve(
    shutdown: watch::Receiver<bool>,
    backend: Arc<dyn SpeechBackend>,
    addr: &str,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(shutdown, backend, listener).await
}

/// Like [`serve`], on a listener that is already bound.
pub async fn serve_listener(
    mut shutdown: watch::Receiver<bool>,
    backend: Arc<dyn SpeechBackend>,
    listener: TcpListener,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, backend = backend.id(), "sayer server listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "connection accepted");
                    let backend = backend.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, backend, shutdown).await {
                            warn!(%peer, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task panicked");
                }
            }
        }
    }

    drop(listener);
    info!(in_flight = connections.len(), "stopped accepting, draining connections");
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "connection task panicked");
        }
    }
    info!("sayer server stopped");
    Ok(())
}

/// Resolves once shutdown was requested or nobody can request it any more.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn handle_connection(
    socket: TcpStream,
    backend: Arc<dyn SpeechBackend>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let peer: Option<SocketAddr> = socket.peer_addr().ok();
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        // only waiting for the next request is interruptible, a request being served is not
        let frame = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            frame = protocol::read_frame(&mut reader) => frame,
        };
        let line = frame.and_then(|frame| frame.map(protocol::decode_line).transpose());
        let (reply, payload) = match line {
            Ok(None) => break, // EOF
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => dispatch(backend.as_ref(), &line).await,
            Err(e @ SayerError::Protocol(_)) => {
                warn!(peer = ?peer, error = %e, "unreadable request");
                (Event::failure(&e), Vec::new())
            }
            Err(e) => return Err(e),
        };
        protocol::write_event(&mut writer, &reply, &payload).await?;
    }

    debug!(peer = ?peer, "connection closed");
    Ok(())
}

async fn dispatch(backend: &dyn SpeechBackend, line: &str) -> (Event, Vec<u8>) {
    let request = match Event::parse(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed request");
            return (Event::failure(&e), Vec::new());
        }
    };

    match request {
        Event::Speak { role, text } => {
            debug!(%role, chars = text.chars().count(), "speak request");
            match backend.speak(&role, &text).await {
                Ok(speech) => (
                    Event::Audio {
                        format: speech.format,
                        payload_length: speech.audio.len(),
                    },
                    speech.audio,
                ),
                Err(e) => {
                    warn!(%role, error = %e, "speak failed");
                    (Event::failure(&e), Vec::new())
                }
            }
        }
        Event::Describe => (
            Event::Info {
                backend: backend.id().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            Vec::new(),
        ),
        Event::Ping => (Event::Pong, Vec::new()),
        other => (
            Event::Error {
                kind: "protocol_error".to_string(),
                message: format!("{} is not a request", other.name()),
            },
            Vec::new(),
        ),
    }
}
