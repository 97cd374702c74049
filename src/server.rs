//! TCP front end: reads one HTTP/1.1 request per connection, runs it through
//! the dispatcher and writes the terminal response.
//!
//! Dispatch is synchronous and may block on the worker pool, so it runs on
//! tokio's blocking threads. An exchange that ends `Open` has nobody left to
//! answer it; the connection is held for `request_timeout` and then closed
//! without a response.

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Exchange};
use crate::error::{ServerError, ServerResult};
use crate::http::{HttpParser, Response, Status};
use crate::metrics::MetricsCollector;
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinSet};
use tokio::time;

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_request_size: usize,
    request_timeout: Duration,
}

/// The HTTP server wrapping a frozen [`Dispatcher`]
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Server {
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            metrics: None,
        }
    }

    /// Count connection-level failures (bad requests, timeouts) into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address. Must be called inside a tokio runtime.
    pub fn bind(&self) -> ServerResult<TcpListener> {
        let addr = self
            .config
            .socket_address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ServerError::Config(format!(
                    "No socket address for {}",
                    self.config.socket_address()
                ))
            })?;

        let socket = Self::create_socket(&addr, self.config.backlog_size)?;
        let listener = TcpListener::from_std(socket.into())?;
        log::info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    fn create_socket(addr: &SocketAddr, backlog: u32) -> ServerResult<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&(*addr).into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

        Ok(socket)
    }

    /// Accept connections until `shutdown` resolves, then give in-flight
    /// exchanges up to `request_timeout` to finish
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let limits = Limits {
            max_request_size: self.config.max_request_size,
            request_timeout: self.config.request_timeout,
        };
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::error!("Failed to accept connection: {}", err);
                            continue;
                        }
                    };
                    let dispatcher = self.dispatcher.clone();
                    let metrics = self.metrics.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, dispatcher, limits, metrics.as_deref()).await {
                            log::debug!("Connection {} ended with error: {}", peer, err);
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    log::info!("Shutting down; {} connection(s) in flight", connections.len());
                    break;
                }
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if time::timeout(limits.request_timeout, drain).await.is_err() {
            log::warn!("Aborting {} connection(s) still open", connections.len());
            connections.abort_all();
        }
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    limits: Limits,
    metrics: Option<&MetricsCollector>,
) -> ServerResult<()> {
    stream.set_nodelay(true)?;

    let mut parser = HttpParser::with_limit(limits.max_request_size);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let read = match time::timeout(limits.request_timeout, stream.read_buf(&mut buffer)).await {
            Ok(read) => read?,
            Err(_) => {
                record_error(metrics, "request_timeout");
                return write_status(&mut stream, Status::RequestTimeout, "Request Timeout").await;
            }
        };
        if read == 0 {
            // Peer went away before sending a full request
            return Ok(());
        }

        let chunk = buffer.split();
        match parser.parse(&chunk) {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => {
                record_error(metrics, error_kind(&err));
                log::warn!("Rejecting request: {}", err);
                return write_status(&mut stream, err.status(), &err.to_string()).await;
            }
        }
    }

    let request = parser.get_request()?;
    let exchange = task::spawn_blocking(move || dispatcher.dispatch(request))
        .await
        .map_err(|err| ServerError::Handler(format!("dispatch task failed: {}", err)))?;

    if exchange.is_open() {
        return hold_open(stream, &exchange, limits.request_timeout, metrics).await;
    }

    write_response(&mut stream, &exchange.response).await
}

/// Nobody will answer an open exchange; keep the socket until the timeout
async fn hold_open(
    mut stream: TcpStream,
    exchange: &Exchange,
    timeout: Duration,
    metrics: Option<&MetricsCollector>,
) -> ServerResult<()> {
    log::warn!(
        "{} {}: no response; closing the connection in {:?}",
        exchange.request.method,
        exchange.request.path,
        timeout
    );
    time::sleep(timeout).await;
    record_error(metrics, "open_exchange_closed");
    stream.shutdown().await?;
    Ok(())
}

async fn write_response(stream: &mut TcpStream, response: &Response) -> ServerResult<()> {
    let mut out = Vec::with_capacity(256 + response.body.len());
    response.serialize(&mut out)?;
    stream.write_all(&out).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn write_status(stream: &mut TcpStream, status: Status, body: &str) -> ServerResult<()> {
    let mut response = Response::new();
    response.send_text(status, body)?;
    write_response(stream, &response).await
}

fn error_kind(err: &ServerError) -> &'static str {
    match err {
        ServerError::RequestTooLarge(_) => "request_too_large",
        ServerError::HttpParse(_) => "http_parse",
        _ => "connection",
    }
}

fn record_error(metrics: Option<&MetricsCollector>, kind: &str) {
    if let Some(metrics) = metrics {
        metrics.record_error(kind);
    }
}
