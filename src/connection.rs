//! Boundary of the HTTP connection layer.
//!
//! The handshake orchestrator never touches sockets itself. It asks an
//! [`HttpConnectionService`] for a connection, sends the upgrade request over the resulting
//! [`HttpConnection`] and, once upgraded, hands the connection's [`Channel`] to a framing
//! handler. [`crate::native`] provides the tokio implementation of all of these.
//!
//! # Callback contract
//! Implementations must deliver every listener callback from the connection's processing
//! context, one at a time, and must never call back synchronously from inside
//! [`HttpConnectionService::connect`], [`HttpConnection::make_request`],
//! [`HttpConnection::close`] or [`Channel::install_handler`].

use std::{
    io,
    pin::{pin, Pin},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;

use crate::{request::HttpRequestOptions, stream::StreamHandle, Result, WebSocketError};

/// Options for the underlying TCP socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Give up on the TCP connect after this long. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Sets `TCP_NODELAY` on the socket.
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            no_delay: true,
        }
    }
}

impl SocketOptions {
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }
}

/// Everything an [`HttpConnectionService`] needs to open one client connection.
pub struct HttpClientConnectionOptions {
    pub host_name: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    /// Wrap the transport in TLS when present.
    pub tls: Option<TlsConnector>,
    /// Initial HTTP flow-control window.
    pub initial_window_size: usize,
    pub listener: Box<dyn ConnectionListener>,
}

/// Receives the lifecycle of one client connection.
pub trait ConnectionListener: Send {
    /// The connection was established, or could not be. Called exactly once.
    ///
    /// On `Err` no connection exists and [`on_shutdown`](Self::on_shutdown) is never called.
    fn on_setup(&mut self, result: Result<Arc<dyn HttpConnection>>);

    /// The connection has fully shut down. Called exactly once, and only after a successful
    /// setup. `error` is `None` for a graceful close.
    fn on_shutdown(
        self: Box<Self>,
        connection: Arc<dyn HttpConnection>,
        error: Option<WebSocketError>,
    );
}

/// Creates client connections.
pub trait HttpConnectionService: Send + Sync {
    /// Starts connecting asynchronously. The outcome is reported to `options.listener`.
    ///
    /// # Errors
    /// An error here means the attempt never started, and the listener is dropped without
    /// being called.
    fn connect(&self, options: HttpClientConnectionOptions) -> Result<()>;
}

/// An established client connection.
pub trait HttpConnection: Send + Sync {
    fn id(&self) -> u64;

    /// Queues a request on the connection.
    ///
    /// # Errors
    /// [`WebSocketError::NotConnected`] if the connection is closing or closed, or
    /// [`WebSocketError::InvalidArgument`] if the request cannot be expressed.
    fn make_request(&self, options: HttpRequestOptions<'_>) -> Result<StreamHandle>;

    /// Starts closing the connection. Idempotent; the listener's `on_shutdown` follows.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// The processing pipeline of the connection, available once it has been upgraded.
    fn channel(&self) -> Option<Arc<dyn Channel>>;
}

/// The processing pipeline of an upgraded connection.
pub trait Channel: Send + Sync {
    fn id(&self) -> u64;

    /// Installs `handler` as the sole consumer of the connection's IO.
    ///
    /// # Errors
    /// Fails if a handler is already installed or the channel is shutting down.
    fn install_handler(&self, handler: Box<dyn ChannelHandler>) -> Result<()>;

    /// Shuts the channel down, which also shuts down its connection.
    fn shutdown(&self, error: Option<WebSocketError>);
}

/// Owns the IO of an upgraded connection once installed into a [`Channel`].
pub trait ChannelHandler: Send {
    /// Runs the handler to completion. The returned error, if any, is the connection's
    /// shutdown reason.
    fn run(self: Box<Self>, io: HttpStream) -> BoxFuture<'static, Option<WebSocketError>>;
}

/// Any byte stream a handler can be run on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// The IO of an upgraded connection.
pub enum HttpStream {
    /// The hyper-based upgraded stream
    Hyper(TokioIo<Upgraded>),
    /// Any other transport, mainly in-memory pipes
    Io(Box<dyn Io>),
}

impl From<TokioIo<Upgraded>> for HttpStream {
    fn from(value: TokioIo<Upgraded>) -> Self {
        Self::Hyper(value)
    }
}

impl From<Box<dyn Io>> for HttpStream {
    fn from(value: Box<dyn Io>) -> Self {
        Self::Io(value)
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Hyper(stream) => pin!(stream).poll_read(cx, buf),
            Self::Io(stream) => pin!(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, io::Error>> {
        match self.get_mut() {
            Self::Hyper(stream) => pin!(stream).poll_write(cx, buf),
            Self::Io(stream) => pin!(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), io::Error>> {
        match self.get_mut() {
            Self::Hyper(stream) => pin!(stream).poll_flush(cx),
            Self::Io(stream) => pin!(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), io::Error>> {
        match self.get_mut() {
            Self::Hyper(stream) => pin!(stream).poll_shutdown(cx),
            Self::Io(stream) => pin!(stream).poll_shutdown(cx),
        }
    }
}
