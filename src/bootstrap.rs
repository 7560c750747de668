//! The handshake orchestrator.
//!
//! A [`Bootstrap`] brings one WebSocket connection into the world and sees it out again. It asks
//! the connection service for an HTTP connection, sends the upgrade request, validates the
//! response, installs the framing handler and reports the outcome through the setup callback.
//! Once set up, it stays attached to the connection so it can fire the shutdown callback.
//!
//! Every failure after the HTTP connection exists goes through [`Bootstrap::cancel`]: the first
//! error is recorded and the connection is closed, and the setup callback only fires from the
//! connection's shutdown notification. The caller therefore never hears about a failed attempt
//! while its connection is still live.

use std::{mem, sync::Arc};

use hyper::{Method, StatusCode};
use url::Url;

use crate::{
    arena::{ArenaRef, ByteArena, HeaderStore},
    connection::{ConnectionListener, HttpClientConnectionOptions, HttpConnection},
    native::FramingHandlerFactory,
    options::{ClientConnectionOptions, HandshakeResponse, SetupCallback, ShutdownCallback},
    request::{self, Header, HttpRequestOptions},
    stream::{StreamHandle, StreamListener},
    sync::Mutex,
    websocket::{FrameCallbacks, WebSocketHandlerFactory, WebSocketHandlerOptions},
    Result, WebSocket, WebSocketError,
};

/// HTTP window while the handshake response trickles in.
const HTTP_INITIAL_WINDOW_SIZE: usize = 1024;

/// Response header slots reserved on top of the request header count.
const ESTIMATED_EXTRA_RESPONSE_HEADERS: usize = 10;

/// Bytes reserved per response header.
const ESTIMATED_RESPONSE_HEADER_LENGTH: usize = 64;

const SCHEME_PORTS: [(&str, u16); 4] = [("http", 80), ("https", 443), ("ws", 80), ("wss", 443)];

/// Port to connect to for `uri`.
///
/// An explicit port always wins. Otherwise `http`/`ws` map to 80 and `https`/`wss` to 443, and
/// any other scheme gets 443 if `tls` is set, else 80.
pub fn default_port(uri: &Url, tls: bool) -> u16 {
    if let Some(port) = uri.port() {
        return port;
    }

    SCHEME_PORTS
        .iter()
        .find(|(scheme, _)| scheme.eq_ignore_ascii_case(uri.scheme()))
        .map(|(_, port)| *port)
        .unwrap_or(if tls { 443 } else { 80 })
}

fn is_secure_scheme(uri: &Url) -> bool {
    ["wss", "https"]
        .iter()
        .any(|scheme| scheme.eq_ignore_ascii_case(uri.scheme()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingConnection,
    AwaitingResponse,
    Validating,
    Established,
    Cancelling,
    Terminated,
}

struct Bootstrap {
    id: u64,
    state: State,

    initial_window_size: usize,
    manual_window_management: bool,
    /// Taken when invoked. While present, shutdown is reported as a setup failure.
    on_setup: Option<SetupCallback>,
    on_shutdown: Option<ShutdownCallback>,
    frame_callbacks: Option<FrameCallbacks>,
    handler_factory: Arc<dyn WebSocketHandlerFactory>,

    request: HeaderStore,
    request_path: ArenaRef,

    response: HeaderStore,
    response_status: Option<StatusCode>,

    setup_error: Option<WebSocketError>,
    websocket: Option<WebSocket>,
    connection: Option<Arc<dyn HttpConnection>>,
    handshake_stream: Option<StreamHandle>,
}

impl Bootstrap {
    /// Records `error` unless an earlier one is already recorded, then closes the connection.
    fn cancel(&mut self, error: WebSocketError) {
        if self.setup_error.is_some() {
            #[cfg(feature = "logging")]
            log::debug!(
                "id={}: ignoring error while canceling websocket setup: {}",
                self.id,
                error
            );
            return;
        }

        #[cfg(feature = "logging")]
        log::error!("id={}: canceling websocket setup due to error: {}", self.id, error);

        self.setup_error = Some(error);
        self.state = State::Cancelling;
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }

    fn send_upgrade_request(&mut self, listener: BootstrapHandle) -> Result<StreamHandle> {
        let connection = self.connection.clone().ok_or(WebSocketError::NotConnected)?;
        let headers = self.request.headers();

        connection.make_request(HttpRequestOptions {
            method: Method::GET,
            path: self.request.get(self.request_path),
            headers: &headers,
            listener: Box::new(listener),
        })
    }

    fn capture_headers(&mut self, headers: &[Header<'_>]) -> Result<()> {
        for header in headers {
            self.response.push(*header)?;
        }
        Ok(())
    }

    fn finish_handshake(
        &mut self,
        stream: &StreamHandle,
        error: Option<WebSocketError>,
    ) -> Result<WebSocket> {
        if let Some(error) = error {
            return Err(error);
        }

        self.state = State::Validating;
        self.response_status = stream.incoming_status();
        if self.response_status != Some(StatusCode::SWITCHING_PROTOCOLS) {
            #[cfg(feature = "logging")]
            log::error!(
                "id={}: server refused websocket upgrade, responded with status code {:?}",
                self.id,
                self.response_status
            );
            return Err(WebSocketError::UpgradeFailure(self.response_status));
        }

        let channel = self
            .connection
            .as_ref()
            .and_then(|connection| connection.channel())
            .ok_or(WebSocketError::NotConnected)?;

        let options = WebSocketHandlerOptions {
            channel,
            initial_window_size: self.initial_window_size,
            manual_window_management: self.manual_window_management,
            frame_callbacks: self.frame_callbacks.take(),
            is_server: false,
        };

        self.handler_factory
            .new_handler(options)
            .inspect_err(|_err| {
                #[cfg(feature = "logging")]
                log::error!("id={}: failed to create websocket handler: {}", self.id, _err);
            })
    }
}

/// Shared access to a [`Bootstrap`].
///
/// The same bootstrap listens to both the connection and the handshake stream. Callbacks are
/// serialized on the connection's processing context, and user callbacks are always invoked
/// after the lock has been released.
#[derive(Clone)]
pub(crate) struct BootstrapHandle(Arc<Mutex<Bootstrap>>);

/// Validates `options` and starts connecting.
pub(crate) fn initiate(options: ClientConnectionOptions) -> Result<()> {
    start(options).map(|_| ())
}

pub(crate) fn start(options: ClientConnectionOptions) -> Result<BootstrapHandle> {
    let ClientConnectionOptions {
        service,
        handler_factory,
        socket_options,
        uri,
        tls,
        headers,
        initial_window_size,
        manual_window_management,
        on_connection_setup,
        on_connection_shutdown,
        on_incoming_frame_begin,
        on_incoming_frame_payload,
        on_incoming_frame_complete,
        tls_error,
    } = options;

    let (Some(service), Some(socket_options), Some(uri), Some(on_setup)) =
        (service, socket_options, uri, on_connection_setup)
    else {
        #[cfg(feature = "logging")]
        log::error!("id=static: missing required websocket connection options");
        return Err(WebSocketError::InvalidArgument(
            "missing required websocket connection options",
        ));
    };

    if let Some(err) = tls_error {
        #[cfg(feature = "logging")]
        log::error!("id=static: failed to configure TLS for {}: {}", uri, err);
        return Err(err);
    }

    if tls.is_none() && is_secure_scheme(&uri) {
        #[cfg(feature = "logging")]
        log::error!("id=static: {} requires TLS but no TLS connector was configured", uri);
        return Err(WebSocketError::InvalidArgument(
            "secure scheme requires a TLS connector",
        ));
    }

    let frame_callbacks = match (
        on_incoming_frame_begin,
        on_incoming_frame_payload,
        on_incoming_frame_complete,
    ) {
        (Some(on_begin), Some(on_payload), Some(on_complete)) => Some(FrameCallbacks {
            on_begin,
            on_payload,
            on_complete,
        }),
        (None, None, None) => None,
        _ => {
            #[cfg(feature = "logging")]
            log::error!(
                "id=static: either all frame-handling callbacks must be set, or none must be set"
            );
            return Err(WebSocketError::InvalidArgument(
                "either all frame-handling callbacks must be set, or none must be set",
            ));
        }
    };

    if headers.is_empty() {
        #[cfg(feature = "logging")]
        log::error!("id=static: missing required headers for websocket client handshake");
        return Err(WebSocketError::InvalidArgument(
            "missing required headers for websocket client handshake",
        ));
    }

    let host_name = request::host_name(&uri)
        .ok_or(WebSocketError::InvalidArgument("uri has no host"))?;

    // request data is copied once into an arena of exactly the right size
    let path = request::path_and_query(&uri);
    let request_size = headers
        .iter()
        .fold(path.len(), |acc, h| acc + h.name.len() + h.value.len());
    let mut request = HeaderStore::with_capacity(ByteArena::fixed(request_size)?, headers.len())?;
    let request_path = request.write(path.as_bytes())?;
    for header in &headers {
        request.push(header.as_header())?;
    }

    let estimated_headers = headers.len() + ESTIMATED_EXTRA_RESPONSE_HEADERS;
    let response = HeaderStore::with_capacity(
        ByteArena::growable(estimated_headers * ESTIMATED_RESPONSE_HEADER_LENGTH)?,
        estimated_headers,
    )?;

    let port = default_port(&uri, tls.is_some());
    let id = crate::next_id();

    let handle = BootstrapHandle(Arc::new(Mutex::new(Bootstrap {
        id,
        state: State::AwaitingConnection,
        initial_window_size,
        manual_window_management,
        on_setup: Some(on_setup),
        on_shutdown: on_connection_shutdown,
        frame_callbacks,
        handler_factory: handler_factory.unwrap_or_else(|| Arc::new(FramingHandlerFactory)),
        request,
        request_path,
        response,
        response_status: None,
        setup_error: None,
        websocket: None,
        connection: None,
        handshake_stream: None,
    })));

    let http_options = HttpClientConnectionOptions {
        host_name,
        port,
        socket_options,
        tls,
        initial_window_size: HTTP_INITIAL_WINDOW_SIZE,
        listener: Box::new(handle.clone()),
    };

    if let Err(err) = service.connect(http_options) {
        #[cfg(feature = "logging")]
        log::error!("id=static: websocket failed to initiate HTTP connection: {}", err);
        return Err(err);
    }

    #[cfg(feature = "logging")]
    log::trace!("id={}: websocket setup begun, connecting to {}", id, uri);

    Ok(handle)
}

impl ConnectionListener for BootstrapHandle {
    fn on_setup(&mut self, result: Result<Arc<dyn HttpConnection>>) {
        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                // no connection to close, so report right away
                let (on_setup, _id) = {
                    let mut bootstrap = self.0.lock();
                    bootstrap.state = State::Terminated;
                    bootstrap.frame_callbacks = None;
                    (bootstrap.on_setup.take(), bootstrap.id)
                };

                #[cfg(feature = "logging")]
                log::error!(
                    "id={}: websocket setup failed to establish HTTP connection: {}",
                    _id,
                    err
                );

                if let Some(on_setup) = on_setup {
                    on_setup(Err(err), &HandshakeResponse::new(None, &[]));
                }
                return;
            }
        };

        let mut bootstrap = self.0.lock();
        bootstrap.connection = Some(connection);

        match bootstrap.send_upgrade_request(self.clone()) {
            Ok(stream) => {
                #[cfg(feature = "logging")]
                log::trace!(
                    "id={}: HTTP connection established, sending websocket upgrade request",
                    bootstrap.id
                );
                bootstrap.handshake_stream = Some(stream);
                bootstrap.state = State::AwaitingResponse;
            }
            Err(err) => {
                #[cfg(feature = "logging")]
                log::error!(
                    "id={}: failed to initiate websocket upgrade request: {}",
                    bootstrap.id,
                    err
                );
                bootstrap.cancel(err);
            }
        }
    }

    fn on_shutdown(
        self: Box<Self>,
        connection: Arc<dyn HttpConnection>,
        error: Option<WebSocketError>,
    ) {
        let mut bootstrap = self.0.lock();
        bootstrap.state = State::Terminated;
        bootstrap.connection = None;
        bootstrap.handshake_stream = None;
        bootstrap.frame_callbacks = None;

        if let Some(on_setup) = bootstrap.on_setup.take() {
            let error = error
                .or_else(|| bootstrap.setup_error.take())
                .unwrap_or(WebSocketError::Unknown);
            let status = bootstrap.response_status;
            let response = mem::take(&mut bootstrap.response);
            let _id = bootstrap.id;
            drop(bootstrap);

            #[cfg(feature = "logging")]
            log::error!("id={}: websocket setup failed: {}", _id, error);

            let headers = response.headers();
            on_setup(Err(error), &HandshakeResponse::new(status, &headers));
        } else {
            let on_shutdown = bootstrap.on_shutdown.take();
            let websocket = bootstrap.websocket.take();
            drop(bootstrap);

            if let (Some(on_shutdown), Some(websocket)) = (on_shutdown, websocket) {
                #[cfg(feature = "logging")]
                log::debug!(
                    "id={}: websocket client connection shut down: {:?}",
                    websocket.id(),
                    error
                );
                on_shutdown(&websocket, error);
            }
        }

        drop(connection);
    }
}

impl StreamListener for BootstrapHandle {
    fn on_incoming_headers(&mut self, stream: &StreamHandle, headers: &[Header<'_>]) {
        let mut bootstrap = self.0.lock();
        if bootstrap.state != State::AwaitingResponse {
            return;
        }

        bootstrap.response_status = stream.incoming_status();
        if let Err(err) = bootstrap.capture_headers(headers) {
            #[cfg(feature = "logging")]
            log::error!(
                "id={}: error while processing response headers: {}",
                bootstrap.id,
                err
            );
            bootstrap.cancel(err);
        }
    }

    fn on_complete(self: Box<Self>, stream: &StreamHandle, error: Option<WebSocketError>) {
        let mut bootstrap = self.0.lock();
        // the handshake stream is released on every path
        bootstrap.handshake_stream = None;

        if bootstrap.state != State::AwaitingResponse {
            return;
        }

        let websocket = match bootstrap.finish_handshake(stream, error) {
            Ok(websocket) => websocket,
            Err(err) => {
                bootstrap.cancel(err);
                return;
            }
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "id={}: setup success, created websocket id={}",
            bootstrap.id,
            websocket.id()
        );
        #[cfg(feature = "logging")]
        log::debug!("id={}: websocket client connection established", websocket.id());

        bootstrap.state = State::Established;
        bootstrap.websocket = Some(websocket.clone());
        let on_setup = bootstrap.on_setup.take();
        let status = bootstrap.response_status;
        let response = mem::take(&mut bootstrap.response);
        drop(bootstrap);

        if let Some(on_setup) = on_setup {
            let headers = response.headers();
            on_setup(Ok(websocket), &HandshakeResponse::new(status, &headers));
        }
    }
}
