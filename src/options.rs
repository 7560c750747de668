//! Client connection configuration.

use std::{fmt, sync::Arc};

use hyper::StatusCode;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::{
    connection::{HttpConnectionService, SocketOptions},
    frame::IncomingFrame,
    native,
    request::{self, Header, HttpHeader},
    websocket::{FrameBeginFn, FrameCompleteFn, FramePayloadFn, WebSocketHandlerFactory},
    Result, WebSocket, WebSocketError,
};

/// Reports the outcome of the handshake. Called exactly once.
pub type SetupCallback = Box<dyn FnOnce(Result<WebSocket>, &HandshakeResponse<'_>) + Send>;

/// Reports that an established WebSocket has shut down. `None` means a graceful close.
pub type ShutdownCallback = Box<dyn FnOnce(&WebSocket, Option<WebSocketError>) + Send>;

/// What the server answered to the upgrade request, as far as it got.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeResponse<'a> {
    status: Option<StatusCode>,
    headers: &'a [Header<'a>],
}

impl<'a> HandshakeResponse<'a> {
    pub fn new(status: Option<StatusCode>, headers: &'a [Header<'a>]) -> Self {
        Self { status, headers }
    }

    /// `None` if no response was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Response headers, in the order the connection delivered them.
    ///
    /// The orchestrator keeps that order byte for byte. [`native::TokioConnectionService`]
    /// delivers them from hyper's header map, so names are lowercased and repeated names are
    /// grouped at the position of their first occurrence.
    pub fn headers(&self) -> &'a [Header<'a>] {
        self.headers
    }

    /// Value of the first header named `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers.iter().find(|h| h.is(name)).map(|h| h.value)
    }
}

/// Configuration of one WebSocket connection attempt.
///
/// [`ClientConnectionOptions::new`] fills in the tokio backend, TLS for secure schemes and the
/// standard handshake headers. [`Default`] leaves everything unset, for callers that bring their
/// own collaborators.
///
/// # Example
/// ```no_run
/// use wsboot::{ClientConnectionOptions, WebSocket};
///
/// # fn run() -> wsboot::Result<()> {
/// let options = ClientConnectionOptions::new("wss://example.com/chat".parse()?)
///     .with_header("Sec-WebSocket-Protocol", "chat")
///     .on_setup(|result, _response| {
///         if let Ok(ws) = result {
///             println!("connected: {ws:?}");
///         }
///     })
///     .on_shutdown(|ws, error| println!("{ws:?} closed: {error:?}"));
///
/// WebSocket::connect(options)?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ClientConnectionOptions {
    /// Creates the HTTP connection. Required.
    pub service: Option<Arc<dyn HttpConnectionService>>,
    /// Installs the framing handler after the upgrade. Defaults to
    /// [`native::FramingHandlerFactory`].
    pub handler_factory: Option<Arc<dyn WebSocketHandlerFactory>>,
    /// Required.
    pub socket_options: Option<SocketOptions>,
    /// Target of the handshake. Required, and must have a host.
    pub uri: Option<Url>,
    /// Connect over TLS when set.
    pub tls: Option<TlsConnector>,
    /// Sent verbatim with the upgrade request. At least one is required.
    pub headers: Vec<HttpHeader>,
    /// Initial read window of the WebSocket, in bytes of data-frame payload.
    pub initial_window_size: usize,
    /// Stop delivering payload when the read window is spent.
    pub manual_window_management: bool,
    /// Required.
    pub on_connection_setup: Option<SetupCallback>,
    pub on_connection_shutdown: Option<ShutdownCallback>,
    pub on_incoming_frame_begin: Option<FrameBeginFn>,
    pub on_incoming_frame_payload: Option<FramePayloadFn>,
    pub on_incoming_frame_complete: Option<FrameCompleteFn>,
    /// Why the default TLS connector could not be built. Reported by [`WebSocket::connect`].
    pub(crate) tls_error: Option<WebSocketError>,
}

impl ClientConnectionOptions {
    /// Options for connecting to `uri` with the tokio backend.
    ///
    /// Secure schemes (`wss`, `https`) get the default TLS connector. If it cannot be built,
    /// [`WebSocket::connect`] fails with that error unless a connector is supplied through
    /// [`with_tls`](Self::with_tls). The headers are the ones produced by
    /// [`request::handshake_headers`], or none if `uri` has no host, in which case
    /// [`WebSocket::connect`] rejects the options.
    pub fn new(uri: Url) -> Self {
        let (tls, tls_error) = match uri.scheme() {
            "wss" | "https" => match native::tls_connector() {
                Ok(tls) => (Some(tls), None),
                Err(err) => (None, Some(err)),
            },
            _ => (None, None),
        };
        let headers = request::handshake_headers(&uri).unwrap_or_default();

        Self {
            service: Some(Arc::new(native::TokioConnectionService::new())),
            socket_options: Some(SocketOptions::default()),
            uri: Some(uri),
            tls,
            tls_error,
            headers,
            ..Default::default()
        }
    }

    pub fn with_service(self, service: Arc<dyn HttpConnectionService>) -> Self {
        Self {
            service: Some(service),
            ..self
        }
    }

    pub fn with_handler_factory(self, factory: Arc<dyn WebSocketHandlerFactory>) -> Self {
        Self {
            handler_factory: Some(factory),
            ..self
        }
    }

    pub fn with_socket_options(self, socket_options: SocketOptions) -> Self {
        Self {
            socket_options: Some(socket_options),
            ..self
        }
    }

    pub fn with_uri(self, uri: Url) -> Self {
        Self {
            uri: Some(uri),
            ..self
        }
    }

    pub fn with_tls(self, tls: TlsConnector) -> Self {
        Self {
            tls: Some(tls),
            tls_error: None,
            ..self
        }
    }

    /// Connects in plaintext. Secure schemes are still rejected by [`WebSocket::connect`].
    pub fn without_tls(self) -> Self {
        Self {
            tls: None,
            tls_error: None,
            ..self
        }
    }

    /// Appends one header to the upgrade request.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(HttpHeader::new(
            name.as_bytes().to_vec(),
            value.as_bytes().to_vec(),
        ));
        self
    }

    /// Replaces the upgrade request headers.
    pub fn with_headers(self, headers: Vec<HttpHeader>) -> Self {
        Self { headers, ..self }
    }

    pub fn with_initial_window_size(self, size: usize) -> Self {
        Self {
            initial_window_size: size,
            ..self
        }
    }

    pub fn with_manual_window_management(self) -> Self {
        Self {
            manual_window_management: true,
            ..self
        }
    }

    pub fn on_setup<F>(self, f: F) -> Self
    where
        F: FnOnce(Result<WebSocket>, &HandshakeResponse<'_>) + Send + 'static,
    {
        Self {
            on_connection_setup: Some(Box::new(f)),
            ..self
        }
    }

    pub fn on_shutdown<F>(self, f: F) -> Self
    where
        F: FnOnce(&WebSocket, Option<WebSocketError>) + Send + 'static,
    {
        Self {
            on_connection_shutdown: Some(Box::new(f)),
            ..self
        }
    }

    pub fn on_frame_begin<F>(self, f: F) -> Self
    where
        F: FnMut(&WebSocket, &IncomingFrame) -> bool + Send + 'static,
    {
        Self {
            on_incoming_frame_begin: Some(Box::new(f)),
            ..self
        }
    }

    pub fn on_frame_payload<F>(self, f: F) -> Self
    where
        F: FnMut(&WebSocket, &IncomingFrame, &[u8]) -> bool + Send + 'static,
    {
        Self {
            on_incoming_frame_payload: Some(Box::new(f)),
            ..self
        }
    }

    pub fn on_frame_complete<F>(self, f: F) -> Self
    where
        F: FnMut(&WebSocket, &IncomingFrame, Option<&WebSocketError>) -> bool + Send + 'static,
    {
        Self {
            on_incoming_frame_complete: Some(Box::new(f)),
            ..self
        }
    }
}

impl fmt::Debug for ClientConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnectionOptions")
            .field("uri", &self.uri.as_ref().map(Url::as_str))
            .field("socket_options", &self.socket_options)
            .field("tls", &self.tls.is_some())
            .field("headers", &self.headers.len())
            .field("initial_window_size", &self.initial_window_size)
            .field("manual_window_management", &self.manual_window_management)
            .field("tls_error", &self.tls_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fills_defaults() {
        let options = ClientConnectionOptions::new("ws://example.com/chat".parse().unwrap());
        assert!(options.service.is_some());
        assert!(options.socket_options.is_some());
        assert!(options.tls.is_none());
        assert_eq!(options.headers.len(), 5);
        assert!(options.on_connection_setup.is_none());
    }

    #[test]
    fn test_new_secure_scheme_gets_tls() {
        let options = ClientConnectionOptions::new("wss://example.com/chat".parse().unwrap());
        assert!(options.tls.is_some());
        assert!(options.without_tls().tls.is_none());
    }

    #[test]
    fn test_builder() {
        let options = ClientConnectionOptions::default()
            .with_header("Upgrade", "websocket")
            .with_initial_window_size(16)
            .with_manual_window_management()
            .on_setup(|_, _| {})
            .on_frame_begin(|_, _| true);

        assert_eq!(options.headers[0].as_header(), Header::new(b"Upgrade", b"websocket"));
        assert_eq!(options.initial_window_size, 16);
        assert!(options.manual_window_management);
        assert!(options.on_connection_setup.is_some());
        assert!(options.on_incoming_frame_begin.is_some());
        assert!(options.on_incoming_frame_payload.is_none());
    }

    #[test]
    fn test_handshake_response_header_lookup() {
        let headers = [
            Header::new(b"Upgrade", b"websocket"),
            Header::new(b"Sec-WebSocket-Accept", b"abc"),
        ];
        let response = HandshakeResponse::new(Some(StatusCode::SWITCHING_PROTOCOLS), &headers);
        assert_eq!(response.header("sec-websocket-accept"), Some(&b"abc"[..]));
        assert_eq!(response.header("missing"), None);
    }
}
