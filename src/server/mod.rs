//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, frames HTTP/1.1 requests, and hands each one to
//! the active [`Router`]. Connections are persistent (keep-alive) unless the
//! client or an oversized request says otherwise.
//!
//! The active router sits behind an [`ArcSwap`]. Each request loads it once,
//! when dispatch starts, so swapping in the maintenance router through a
//! [`ServerHandle`] never disturbs requests already in flight.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::lifecycle;
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Largest request head (request line + headers) buffered before answering 431.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Unread input discarded after a refused request, before the socket drops.
const DRAIN_LIMIT: usize = 256 * 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The trellis HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use trellis::{Config, Router, Server};
/// use trellis::http::StatusCode;
/// use trellis::middleware::handler;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::with_config(Config::load("trellis.toml")?);
///     router.root().get("/", handler(|res, _req| {
///         Box::pin(async move { res.string(StatusCode::Ok, "Hello!") })
///     }))?;
///
///     Server::bind(router).await?.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: ServerHandle,
}

/// Switches a running server in and out of maintenance mode.
///
/// Cheap to clone; every clone controls the same server.
#[derive(Clone)]
pub struct ServerHandle {
    active: Arc<ArcSwap<Router>>,
    app: Arc<Router>,
    maintenance: Arc<Router>,
}

impl ServerHandle {
    fn new(app: Router) -> Self {
        let maintenance = Arc::new(Router::maintenance(Arc::clone(app.config())));
        let start_in_maintenance = app.config().server.maintenance;
        let app = Arc::new(app);
        let initial = if start_in_maintenance {
            Arc::clone(&maintenance)
        } else {
            Arc::clone(&app)
        };
        Self {
            active: Arc::new(ArcSwap::new(initial)),
            app,
            maintenance,
        }
    }

    /// Answers every new request with 503 until [`exit_maintenance`](Self::exit_maintenance).
    pub fn enter_maintenance(&self) {
        self.active.store(Arc::clone(&self.maintenance));
        info!("maintenance mode on");
    }

    pub fn exit_maintenance(&self) {
        self.active.store(Arc::clone(&self.app));
        info!("maintenance mode off");
    }

    pub fn is_maintenance(&self) -> bool {
        Arc::ptr_eq(&self.active.load(), &self.maintenance)
    }

    /// The router new requests are dispatched to.
    pub fn active(&self) -> Arc<Router> {
        self.active.load_full()
    }
}

impl Server {
    /// Binds to the address in the router's configuration.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] if the configuration does not validate.
    /// - [`ServerError::Bind`] if the address cannot be bound
    ///   (e.g. port already in use, insufficient permissions).
    pub async fn bind(router: Router) -> Result<Self, ServerError> {
        router.config().validate()?;
        let addr = router.config().server.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            handle: ServerHandle::new(router),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serves until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves. Connections already accepted keep
    /// running to completion on their own tasks.
    pub async fn run_until<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let name = self.handle.app.config().app.name.clone();
        info!(address = %self.local_addr, %name, "listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let active = Arc::clone(&self.handle.active);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, active).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

// Writes a response the router never saw (framing errors) and closes.
async fn reject(stream: &mut TcpStream, status: StatusCode, message: &str) -> std::io::Result<()> {
    let mut response = Response::new();
    response.string(status, message);
    stream.write_all(&response.into_bytes(false, true)).await?;
    stream.flush().await?;
    close_gracefully(stream).await;
    Ok(())
}

// Half-closes the write side, then discards a bounded amount of input the
// peer already sent. Dropping a socket with unread data makes the kernel
// send a reset, which can destroy the response before the peer reads it.
async fn close_gracefully(stream: &mut TcpStream) {
    if stream.shutdown().await.is_err() {
        return;
    }
    let drain = async {
        let mut scratch = [0u8; 4096];
        let mut drained = 0;
        while drained < DRAIN_LIMIT {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or sends a body we refuse to read.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    active: Arc<ArcSwap<Router>>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (mut request, body_offset) = loop {
            match Request::parse(&buf) {
                Ok(pair) => break pair,
                Err(RequestError::Incomplete) => {
                    if buf.len() > MAX_HEAD_SIZE {
                        warn!(peer = %peer_addr, "request head too large, sending 431");
                        return reject(
                            &mut stream,
                            StatusCode::RequestHeaderFieldsTooLarge,
                            "Request Header Fields Too Large",
                        )
                        .await;
                    }
                    if stream.read_buf(&mut buf).await? == 0 {
                        debug!(peer = %peer_addr, "connection closed by peer");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    return reject(&mut stream, StatusCode::BadRequest, &format!("Bad Request: {e}"))
                        .await;
                }
            }
        };
        let _ = buf.split_to(body_offset);

        // Only Content-Length framing is understood. Guessing at any other
        // framing would let the body be read as the next request.
        if request.headers().get("transfer-encoding").is_some() {
            warn!(peer = %peer_addr, "transfer-encoding not supported, sending 501");
            return reject(
                &mut stream,
                StatusCode::NotImplemented,
                "Transfer-Encoding is not supported",
            )
            .await;
        }

        // Captured once; a maintenance swap only affects later requests.
        let router = active.load_full();
        let max_bytes = router.config().server.max_payload_size;
        let declared = request.content_length().unwrap_or(0);
        let mut keep_alive = request.is_keep_alive();
        let body_unread = declared > max_bytes;

        if body_unread {
            // The lifecycle answers 413 from the declared length.
            keep_alive = false;
        } else {
            while buf.len() < declared {
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed mid-body");
                    return Ok(());
                }
            }
            request.set_body(buf.split_to(declared).freeze());
        }

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let include_body = request.method() != &Method::Head;
        let cancellation = request.cancellation().clone();
        let mut response = Response::new();
        {
            let dispatch = lifecycle::run(&router, &mut request, &mut response);
            tokio::pin!(dispatch);
            let mut probe = [0u8; 1];
            tokio::select! {
                () = &mut dispatch => {}
                peeked = stream.peek(&mut probe) => {
                    // Pipelined data is left for the next iteration. EOF only
                    // means the peer stopped writing; it may still read.
                    match peeked {
                        Ok(0) => {
                            debug!(peer = %peer_addr, "peer half-closed during dispatch");
                            keep_alive = false;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "peer went away during dispatch");
                            cancellation.cancel();
                        }
                    }
                    dispatch.await;
                }
            }
        }

        if response.is_hijacked() {
            if let Some(upgrade) = response.take_upgrade() {
                debug!(peer = %peer_addr, "connection hijacked");
                let rest = buf.split().freeze();
                upgrade(stream, rest).await;
            }
            return Ok(());
        }
        if cancellation.is_canceled() {
            return Ok(());
        }

        stream
            .write_all(&response.into_bytes(keep_alive, include_body))
            .await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "closing connection");
            if body_unread {
                close_gracefully(&mut stream).await;
            }
            break;
        }
    }

    Ok(())
}
