use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::constants::{REQUEST_TIMEOUT_SECS, SOCKET_PATH};
use crate::logging;
use crate::protocol::{encode_line, Request, Response};
use crate::session::{EventStream, Session, Transport};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(config: &ClientConfig) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to socket {:?}; run `trade-demo serve` first",
                    config.socket_path
                )
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let payload = encode_line(request)?;
        self.writer
            .write_all(&payload)
            .await
            .context("failed to send request to cache host")
    }

    async fn receive(&mut self) -> Result<Response> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("cache host closed the connection"))?;
        serde_json::from_str(&line).with_context(|| format!("malformed response: {line}"))
    }
}

/// Talks to a `trade-demo serve` process over its unix socket. Requests are
/// serialised over one connection; each listener gets a connection of its own.
///
/// The request connection is taken out of its slot for the duration of an
/// exchange and only put back once a reply was read. A timed out or dropped
/// exchange therefore discards the connection, and the next request opens a
/// fresh one instead of reading a stale reply.
pub struct SocketTransport {
    config: ClientConfig,
    connection: Mutex<Option<Connection>>,
}

impl SocketTransport {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connection = Connection::open(&config).await?;
        Ok(Self {
            config,
            connection: Mutex::new(Some(connection)),
        })
    }
}

pub async fn connect(config: ClientConfig) -> Result<Session<SocketTransport>> {
    Ok(Session::new(SocketTransport::connect(config).await?))
}

impl Transport for SocketTransport {
    async fn request(&self, request: Request) -> Result<Response> {
        let exchange = async {
            let mut slot = self.connection.lock().await;
            let mut connection = match slot.take() {
                Some(connection) => connection,
                None => Connection::open(&self.config).await?,
            };
            connection.send(&request).await?;
            let response = connection.receive().await?;
            *slot = Some(connection);
            Ok::<_, anyhow::Error>(response)
        };

        let response = time::timeout(self.config.request_timeout, exchange)
            .await
            .map_err(|_| {
                anyhow!(
                    "request to cache {} timed out after {:?}",
                    request.cache(),
                    self.config.request_timeout
                )
            })??;

        match response {
            Response::Error { message } => {
                bail!("cache host rejected request on {}: {message}", request.cache())
            }
            other => Ok(other),
        }
    }

    async fn subscribe(&self, cache: &str) -> Result<EventStream> {
        let mut connection = Connection::open(&self.config).await?;
        connection
            .send(&Request::Listen {
                cache: cache.to_string(),
            })
            .await?;
        match time::timeout(self.config.request_timeout, connection.receive())
            .await
            .context("timed out waiting for listener registration")??
        {
            Response::Listening => {}
            Response::Error { message } => bail!("cache host refused listener: {message}"),
            other => bail!("unexpected listener acknowledgement: {other:?}"),
        }

        let (sender, events) = mpsc::unbounded_channel();
        let cache = cache.to_string();
        tokio::spawn(async move {
            loop {
                match connection.receive().await {
                    Ok(Response::Event { event }) => {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        logging::warn(
                            "client.unexpected_frame",
                            "Ignoring non-event frame on listener connection",
                            json!({ "cache": cache, "frame": format!("{other:?}") }),
                        );
                    }
                    Err(err) => {
                        logging::warn(
                            "client.listener_closed",
                            "Listener connection ended",
                            json!({ "cache": cache, "reason": format!("{err:#}") }),
                        );
                        break;
                    }
                }
            }
        });
        Ok(events)
    }
}
