//! TCP transport
//!
//! Accepts connections on a tokio listener and spawns one task per
//! connection. Each request line is handled on the blocking pool, since
//! session operations decode files and open devices synchronously.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::control::dispatcher::Dispatcher;
use crate::control::protocol::Response;
use crate::error::{EngineError, Result};

/// Serve requests on `listen` until the process exits
pub async fn serve_tcp(dispatcher: Arc<Dispatcher>, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    let local = listener.local_addr()?;
    info!(address = %local, "control plane listening");

    accept_loop(listener, dispatcher).await
}

/// Accept connections on an already bound listener
pub async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(peer = %peer, "client connected");

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            match handle_connection(socket, dispatcher).await {
                Ok(()) => debug!(peer = %peer, "client disconnected"),
                Err(e) => warn!(peer = %peer, error = %e, "connection closed with error"),
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let d = Arc::clone(&dispatcher);
        let mut response = match tokio::task::spawn_blocking(move || d.handle_line(&line)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "request handler panicked");
                let fault = EngineError::internal("request handler panicked");
                serde_json::to_string(&Response::error(&fault))?
            }
        };
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LoopbackBackend;
    use crate::config::{EngineConfig, PathsConfig};
    use crate::session::SessionController;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.paths = PathsConfig::rooted_at(dir.path());
        let session = SessionController::new(config, Arc::new(LoopbackBackend::new())).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(session)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(accept_loop(listener, dispatcher));

        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"garbage\n{\"op\":\"health\"}\n").await.unwrap();

        let first: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["kind"], "InvalidInput");

        let second: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["status"], "ok");
        assert_eq!(second["health"]["backend"], "loopback");
    }
}
