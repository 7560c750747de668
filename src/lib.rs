//! # wsboot
//! Client-side WebSocket opening handshake (RFC 6455).
//!
//! The crate drives an HTTP connection through the Upgrade exchange and, once the server answers
//! with `101 Switching Protocols`, installs a WebSocket framing handler into the connection's
//! processing pipeline and hands the resulting [`WebSocket`] to the caller.
//!
//! Every protocol outcome is reported through callbacks:
//!
//! - the **setup** callback fires exactly once, either with a [`WebSocket`] or with the error that
//!   ended the attempt, together with whatever response status and headers were received;
//! - the **shutdown** callback fires at most once, and only after a successful setup, when the
//!   connection is gone;
//! - the optional **frame** callbacks (begin, payload, complete) receive incoming frames after a
//!   successful setup.
//!
//! A failed attempt is only reported after the underlying HTTP connection has fully shut down, so
//! the caller never hears about a failure while the connection is still live.
//!
//! # Collaborators
//! The orchestrator talks to the outside world through two seams:
//!
//! - [`connection::HttpConnectionService`]: creates HTTP connections and reports their
//!   setup/shutdown. [`native::TokioConnectionService`] is the tokio + hyper implementation.
//! - [`websocket::WebSocketHandlerFactory`]: installs a framing handler on an upgraded
//!   connection. [`native::FramingHandlerFactory`] is the default.
//!
//! # Features
//! - `logging` (default): emits connection negotiation and teardown logs through the `log` crate.
//!
//! # Example
//! ```no_run
//! use wsboot::{ClientConnectionOptions, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, rx) = tokio::sync::oneshot::channel();
//!
//!     let options = ClientConnectionOptions::new("ws://localhost:9001/chat".parse()?)
//!         .on_setup(move |result, response| {
//!             println!("status={:?} headers={}", response.status(), response.headers().len());
//!             let _ = tx.send(result.is_ok());
//!         });
//!
//!     WebSocket::connect(options)?;
//!     println!("connected: {}", rx.await?);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod arena;
mod bootstrap;
pub mod codec;
pub mod connection;
pub mod frame;
pub mod native;
mod options;
pub mod request;
pub mod stream;
mod sync;
pub mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};

use hyper::StatusCode;
use thiserror::Error;

pub use bootstrap::default_port;
pub use options::{ClientConnectionOptions, HandshakeResponse, SetupCallback, ShutdownCallback};
pub use request::{Header, HttpHeader};
pub use websocket::WebSocket;

/// A result type for handshake operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while establishing or running a WebSocket connection.
///
/// The variants fall into a few broad groups:
///
/// - Configuration errors, returned synchronously by [`WebSocket::connect`]
/// - Resource errors (arena exhaustion, allocation failure)
/// - Transport errors surfaced by the HTTP connection
/// - Protocol errors, such as a refused upgrade or a malformed incoming frame
/// - Handshake infrastructure errors, such as a failed handler installation
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A required connection option is missing, or the options contradict each other.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A write did not fit in a fixed-size arena. The caller computed the capacity up front,
    /// so this indicates a sizing bug rather than a runtime condition.
    #[error("Arena out of space: requested {requested} bytes, {remaining} remaining")]
    OutOfSpace { requested: usize, remaining: usize },

    /// Growing a buffer failed.
    #[error("Out of memory")]
    OutOfMemory(#[from] std::collections::TryReserveError),

    /// The HTTP connection is not open, or was never established.
    #[error("Connection is not open")]
    NotConnected,

    /// The connection went away without a close handshake.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The server answered the upgrade request with something other than `101 Switching Protocols`.
    #[error("Server refused websocket upgrade, status code {}", status_text(.0))]
    UpgradeFailure(Option<StatusCode>),

    /// The WebSocket handler could not be installed on the upgraded connection.
    #[error("Failed to install websocket handler: {0}")]
    HandlerInstall(&'static str),

    /// A frame callback asked for the connection to be closed.
    #[error("Frame callback aborted the connection")]
    FrameCallbackAborted,

    /// The host name is not a valid TLS server name.
    #[error("Invalid DNS name")]
    InvalidDnsName,

    /// Reserved bits are set in an incoming frame header. No extension that would define
    /// them is ever negotiated by this client.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The server sent a masked frame. RFC 6455 forbids masking server-to-client frames.
    #[error("Server frames must not be masked")]
    MaskedFrame,

    /// A control frame (ping, pong, or close) arrived without the FIN bit.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A frame carried an opcode that RFC 6455 does not define.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A new data frame started while a fragmented message was still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// The connection shut down before setup completed, without reporting a cause.
    #[error("Unknown error")]
    Unknown,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors, such as refused connections or resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// The upgrade request could not be built from the stored path and headers.
    #[error(transparent)]
    InvalidRequest(#[from] hyper::http::Error),

    /// Wraps TLS configuration errors.
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// No tokio runtime was available to run the connection.
    #[error(transparent)]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

fn status_text(status: &Option<StatusCode>) -> String {
    match status {
        Some(status) => status.as_u16().to_string(),
        None => "unknown".to_owned(),
    }
}

/// Hands out process-wide unique ids for log correlation.
pub(crate) fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
