use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};

use crate::logging;
use crate::protocol::{encode_line, MapEvent, Request, Response};

use super::{Grid, GridConfig, ShutdownSignal};

pub(crate) async fn run_socket_server(
    config: Arc<GridConfig>,
    grid: Arc<Grid>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let socket_path = config.socket_path.clone();
    cleanup_socket_path(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind unix socket at {:?}", socket_path))?;
    logging::info(
        "socket.bind",
        "Listening for cache clients",
        json!({ "path": socket_path.display().to_string() }),
    );

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _) = accept_result?;
                let grid = Arc::clone(&grid);
                tokio::spawn(async move {
                    if let Err(err) = serve_client(stream, grid).await {
                        logging::warn(
                            "socket.client_error",
                            "Cache client task ended with error",
                            json!({ "error": format!("{err:?}") })
                        );
                    }
                });
            }
            _ = shutdown.changed() => {
                match *shutdown.borrow() {
                    ShutdownSignal::None => continue,
                    ShutdownSignal::Graceful => {
                        logging::info_simple("socket.shutdown", "Socket server shutting down gracefully");
                        break;
                    }
                    ShutdownSignal::Immediate => {
                        logging::warn_simple("socket.shutdown", "Socket server stopping immediately");
                        break;
                    }
                }
            }
        }
    }

    cleanup_socket_path(&socket_path)?;
    logging::info(
        "socket.cleanup",
        "Socket removed after shutdown",
        json!({ "path": socket_path.display().to_string() }),
    );
    Ok(())
}

async fn serve_client(stream: UnixStream, grid: Arc<Grid>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = Response::Error {
                    message: format!("malformed request: {err}"),
                };
                if !write_frame(&mut writer, &response).await? {
                    break;
                }
                continue;
            }
        };

        if let Request::Listen { cache } = request {
            let receiver = grid.cache(&cache).await.subscribe();
            if !write_frame(&mut writer, &Response::Listening).await? {
                break;
            }
            return forward_events_to_client(writer, receiver).await;
        }

        let response = grid
            .handle(request)
            .await
            .unwrap_or_else(|err| Response::Error {
                message: format!("{err:#}"),
            });
        if !write_frame(&mut writer, &response).await? {
            break;
        }
    }

    Ok(())
}

async fn forward_events_to_client(
    mut writer: OwnedWriteHalf,
    mut receiver: broadcast::Receiver<MapEvent>,
) -> Result<()> {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if !write_frame(&mut writer, &Response::Event { event }).await? {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                logging::warn(
                    "socket.lagged",
                    "Listener lagged cache events",
                    json!({ "skipped": skipped }),
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

/// Returns `false` once the client has gone away.
async fn write_frame(writer: &mut OwnedWriteHalf, response: &Response) -> Result<bool> {
    let payload = encode_line(response)?;
    if let Err(err) = writer.write_all(&payload).await {
        if is_disconnect(&err) {
            logging::info(
                "socket.client_disconnect",
                "Cache client disconnected during write",
                json!({ "reason": err.kind().to_string() }),
            );
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(true)
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

fn cleanup_socket_path(socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove old socket at {:?}", socket_path))?;
    }
    Ok(())
}
