//! RTMP ingest listener
//!
//! Accepts publisher TCP connections, runs the RTMP handshake, then hands
//! the socket to a per-connection [`session::PublisherSession`]. Protocol
//! errors are fatal to their connection, never to the server; teardown
//! (stop segmenter, stop stream) runs exactly once per connection on every
//! exit path.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Result, ServerError};
use crate::state::AppState;

use session::PublisherSession;

/// Run the ingest listener until `shutdown` flips
pub async fn run(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, app = %state.config.rtmp_app, "RTMP ingest listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                info!(%peer_addr, "publisher connected");
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match handle_connection(stream, peer_addr, state, shutdown).await {
                        Ok(()) => {}
                        Err(ServerError::Auth(e)) => warn!(%peer_addr, error = %e, "publisher rejected"),
                        Err(ServerError::Registry(e)) => warn!(%peer_addr, error = %e, "publisher rejected"),
                        Err(e) => error!(%peer_addr, error = %e, "connection error"),
                    }
                    info!(%peer_addr, "connection closed");
                });
            }
            _ = shutdown.changed() => {
                info!("RTMP ingest shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = vec![0u8; 4096];

    // phase 1: handshake
    let mut handshake = Handshake::new(PeerType::Server);
    let remaining = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ServerError::Protocol(
                "connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                    stream.flush().await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                    stream.flush().await?;
                }
                break remaining_bytes;
            }
            Err(e) => {
                return Err(ServerError::Protocol(format!("handshake failed: {e:?}")));
            }
        }
    };

    // phase 2: chunked session
    let mut session = PublisherSession::new(state, peer_addr)?;
    session.send_initial(&mut stream).await?;

    let result = drive_session(&mut session, &mut stream, &mut buf, remaining, &mut shutdown).await;

    // exactly-once teardown on every exit path: client close, protocol
    // error, or server shutdown
    session.teardown().await;
    result
}

async fn drive_session(
    session: &mut PublisherSession,
    stream: &mut TcpStream,
    buf: &mut [u8],
    remaining: Vec<u8>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    if !remaining.is_empty() {
        session.handle_input(&remaining, stream).await?;
    }

    loop {
        tokio::select! {
            read = stream.read(buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                session.handle_input(&buf[..n], stream).await?;
            }
            _ = shutdown.changed() => {
                return Ok(());
            }
        }
    }
}
