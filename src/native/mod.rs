//! Tokio implementation of the connection layer.
//!
//! [`TokioConnectionService`] runs every connection on its own tokio task, which is the
//! connection's processing context: requests, listener callbacks and the installed framing
//! handler are all driven from it, one at a time. The HTTP/1.1 exchange itself is handled by
//! hyper's client connection with upgrades enabled.

mod handler;
mod transport;

use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::future::OptionFuture;
use http_body_util::{BodyExt, Empty};
use hyper::{
    body::Body, client::conn::http1::SendRequest, upgrade::Upgraded, Request, StatusCode, Version,
};
use hyper_util::rt::TokioIo;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_rustls::{
    rustls::{self, pki_types::TrustAnchor},
    TlsConnector,
};

use crate::{
    connection::{
        Channel, ChannelHandler, ConnectionListener, HttpClientConnectionOptions, HttpConnection,
        HttpConnectionService, HttpStream,
    },
    request::{Header, HttpRequestOptions},
    stream::{StreamHandle, StreamVariant},
    sync::Mutex,
    Result, WebSocketError,
};

pub use handler::FramingHandlerFactory;

/// Creates a TLS connector with the webpki root certificates.
///
/// Uses the process-wide default rustls crypto provider if one is installed, `ring` otherwise.
pub fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// HTTP/1.1 client connections on tokio.
///
/// Response headers are read back from hyper's `HeaderMap`: names arrive lowercased, and all
/// values of a repeated name are delivered together where that name first appeared.
#[derive(Debug, Default, Clone)]
pub struct TokioConnectionService {
    handle: Option<Handle>,
}

impl TokioConnectionService {
    /// Spawns connections on the runtime that is current when [`connect`] is called.
    ///
    /// [`connect`]: HttpConnectionService::connect
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns connections on `handle`.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl HttpConnectionService for TokioConnectionService {
    fn connect(&self, options: HttpClientConnectionOptions) -> Result<()> {
        if options.host_name.is_empty() {
            return Err(WebSocketError::InvalidArgument("empty host name"));
        }

        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::try_current()?,
        };
        handle.spawn(run_connection(options));

        Ok(())
    }
}

enum Command {
    Request(Request<Empty<Bytes>>, StreamHandle),
    Close(Option<WebSocketError>),
}

/// State shared by a connection and its channel.
struct Shared {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    open: AtomicBool,
    upgraded: AtomicBool,
    handler: Mutex<Option<Box<dyn ChannelHandler>>>,
}

impl Shared {
    fn close(&self, error: Option<WebSocketError>) {
        if self.open.swap(false, Ordering::AcqRel) {
            #[cfg(feature = "logging")]
            log::debug!("id={}: closing connection: {:?}", self.id, error);

            let _ = self.commands.send(Command::Close(error));
        }
    }
}

struct NativeConnection {
    shared: Arc<Shared>,
    channel: Arc<NativeChannel>,
}

impl HttpConnection for NativeConnection {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn make_request(&self, options: HttpRequestOptions<'_>) -> Result<StreamHandle> {
        if !self.is_open() {
            return Err(WebSocketError::NotConnected);
        }

        let request = build_request(&options)?;
        let stream = StreamHandle::new(Box::new(Http1Stream), options.listener);
        self.shared
            .commands
            .send(Command::Request(request, stream.clone()))
            .map_err(|_| WebSocketError::NotConnected)?;

        Ok(stream)
    }

    fn close(&self) {
        self.shared.close(None);
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        if self.shared.upgraded.load(Ordering::Acquire) {
            Some(self.channel.clone())
        } else {
            None
        }
    }
}

struct NativeChannel {
    shared: Arc<Shared>,
}

impl Channel for NativeChannel {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn install_handler(&self, handler: Box<dyn ChannelHandler>) -> Result<()> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(WebSocketError::HandlerInstall("channel is shutting down"));
        }

        let mut slot = self.shared.handler.lock();
        if slot.is_some() {
            return Err(WebSocketError::HandlerInstall("a handler is already installed"));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn shutdown(&self, error: Option<WebSocketError>) {
        self.shared.close(error);
    }
}

/// The only stream variant spoken by this connection.
struct Http1Stream;

impl StreamVariant for Http1Stream {
    fn version(&self) -> Version {
        Version::HTTP_11
    }
}

fn build_request(options: &HttpRequestOptions<'_>) -> Result<Request<Empty<Bytes>>> {
    let path = std::str::from_utf8(options.path)
        .map_err(|_| WebSocketError::InvalidArgument("request path is not valid UTF-8"))?;

    let mut builder = Request::builder().method(options.method.clone()).uri(path);
    for header in options.headers {
        builder = builder.header(header.name, header.value);
    }

    Ok(builder.body(Empty::new())?)
}

type Job = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

enum JobOutcome {
    /// A request/response exchange finished. Carries the upgraded IO on a `101`.
    Exchange {
        sender: SendRequest<Empty<Bytes>>,
        upgraded: Option<TokioIo<Upgraded>>,
    },
    /// The installed handler returned.
    Handler(Option<WebSocketError>),
}

async fn run_connection(options: HttpClientConnectionOptions) {
    let HttpClientConnectionOptions {
        host_name,
        port,
        socket_options,
        tls,
        initial_window_size: _,
        mut listener,
    } = options;

    let id = crate::next_id();

    let io = match transport::connect(&host_name, port, &socket_options, tls).await {
        Ok(io) => io,
        Err(err) => {
            #[cfg(feature = "logging")]
            log::error!("id={}: failed to connect to {}:{}: {}", id, host_name, port, err);
            listener.on_setup(Err(err));
            return;
        }
    };

    let (sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(io)).await {
        Ok(parts) => parts,
        Err(err) => {
            listener.on_setup(Err(err.into()));
            return;
        }
    };

    let mut driver = tokio::spawn(conn.with_upgrades());

    let (commands, receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        id,
        commands,
        open: AtomicBool::new(true),
        upgraded: AtomicBool::new(false),
        handler: Mutex::new(None),
    });
    let connection: Arc<dyn HttpConnection> = Arc::new(NativeConnection {
        shared: shared.clone(),
        channel: Arc::new(NativeChannel {
            shared: shared.clone(),
        }),
    });

    #[cfg(feature = "logging")]
    log::trace!("id={}: HTTP/1.1 connection established to {}:{}", id, host_name, port);

    listener.on_setup(Ok(connection.clone()));

    let error = ConnectionTask {
        shared: shared.clone(),
        receiver,
        queue: VecDeque::new(),
        in_flight: None,
    }
    .run(sender, &mut driver)
    .await;

    driver.abort();
    shared.open.store(false, Ordering::Release);
    // an installed handler holds the channel, which holds the handler
    shared.handler.lock().take();

    #[cfg(feature = "logging")]
    log::debug!("id={}: connection shut down: {:?}", id, error);

    listener.on_shutdown(connection, error);
}

struct ConnectionTask {
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<(Request<Empty<Bytes>>, StreamHandle)>,
    in_flight: Option<StreamHandle>,
}

impl ConnectionTask {
    /// Drives the connection until it closes and returns the shutdown error.
    async fn run(
        mut self,
        sender: SendRequest<Empty<Bytes>>,
        driver: &mut tokio::task::JoinHandle<std::result::Result<(), hyper::Error>>,
    ) -> Option<WebSocketError> {
        let mut sender = Some(sender);
        let mut job: Option<Job> = None;
        let mut driver_done = false;
        let mut driver_error = None;
        let mut upgraded = false;

        let error = loop {
            if job.is_none() && !upgraded {
                if driver_done {
                    break driver_error.take();
                }
                if !self.queue.is_empty() {
                    if let Some(sender) = sender.take() {
                        if let Some((request, stream)) = self.queue.pop_front() {
                            self.in_flight = Some(stream.clone());
                            job = Some(Box::pin(exchange(
                                self.shared.clone(),
                                sender,
                                request,
                                stream,
                            )));
                        }
                    }
                }
            }

            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(Command::Request(request, stream)) => self.queue.push_back((request, stream)),
                    Some(Command::Close(error)) => break error,
                    None => break None,
                },
                result = &mut *driver, if !driver_done => {
                    driver_done = true;
                    driver_error = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(WebSocketError::from(err)),
                        Err(err) => Some(WebSocketError::IoError(io::Error::other(err))),
                    };
                }
                Some(outcome) = OptionFuture::from(job.as_mut()), if job.is_some() => {
                    job = None;
                    self.in_flight = None;

                    match outcome {
                        JobOutcome::Exchange { sender: returned, upgraded: None } => {
                            sender = Some(returned);
                        }
                        JobOutcome::Exchange { upgraded: Some(io), .. } => {
                            upgraded = true;
                            let handler = self.shared.handler.lock().take();
                            if let Some(handler) = handler {
                                job = Some(Box::pin(async move {
                                    JobOutcome::Handler(handler.run(HttpStream::from(io)).await)
                                }));
                            }
                        }
                        JobOutcome::Handler(error) => break error,
                    }
                }
            }
        };

        // streams that never got an answer
        drop(job);
        if let Some(stream) = self.in_flight.take() {
            stream.complete(Some(WebSocketError::ConnectionClosed));
        }
        for (_, stream) in self.queue.drain(..) {
            stream.complete(Some(WebSocketError::ConnectionClosed));
        }

        error
    }
}

async fn exchange(
    shared: Arc<Shared>,
    mut sender: SendRequest<Empty<Bytes>>,
    request: Request<Empty<Bytes>>,
    stream: StreamHandle,
) -> JobOutcome {
    let upgraded = match perform(&mut sender, request, &stream).await {
        Ok(upgraded) => {
            if upgraded.is_some() {
                shared.upgraded.store(true, Ordering::Release);
            }
            stream.complete(None);
            upgraded
        }
        Err(err) => {
            #[cfg(feature = "logging")]
            log::debug!("id={}: request failed: {}", shared.id, err);
            stream.complete(Some(err));
            None
        }
    };

    JobOutcome::Exchange { sender, upgraded }
}

/// Sends `request` and feeds the response to `stream`, returning the upgraded IO on a `101`.
async fn perform(
    sender: &mut SendRequest<Empty<Bytes>>,
    request: Request<Empty<Bytes>>,
    stream: &StreamHandle,
) -> Result<Option<TokioIo<Upgraded>>> {
    sender.ready().await?;
    let mut response = sender.send_request(request).await?;
    stream.deliver_request_end();

    stream.set_incoming_status(response.status());
    {
        let headers: Vec<Header<'_>> = response
            .headers()
            .iter()
            .map(|(name, value)| Header::new(name.as_str().as_bytes(), value.as_bytes()))
            .collect();
        stream.deliver_incoming_headers(&headers);
    }
    stream.deliver_header_block_done(!response.body().is_end_stream());

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upgraded = hyper::upgrade::on(&mut response).await?;
        return Ok(Some(TokioIo::new(upgraded)));
    }

    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            stream.deliver_incoming_body(&data);
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    use super::*;
    use crate::{connection::SocketOptions, stream::StreamListener};

    struct Listener {
        setup: Option<oneshot::Sender<Result<Arc<dyn HttpConnection>>>>,
        shutdown: Option<oneshot::Sender<Option<WebSocketError>>>,
    }

    impl ConnectionListener for Listener {
        fn on_setup(&mut self, result: Result<Arc<dyn HttpConnection>>) {
            let _ = self.setup.take().unwrap().send(result);
        }

        fn on_shutdown(
            mut self: Box<Self>,
            _connection: Arc<dyn HttpConnection>,
            error: Option<WebSocketError>,
        ) {
            let _ = self.shutdown.take().unwrap().send(error);
        }
    }

    struct Response {
        done: Option<oneshot::Sender<(Option<StatusCode>, Vec<u8>, Option<WebSocketError>)>>,
        body: Vec<u8>,
    }

    impl StreamListener for Response {
        fn on_incoming_body(&mut self, _stream: &StreamHandle, data: &[u8]) {
            self.body.extend_from_slice(data);
        }

        fn on_complete(mut self: Box<Self>, stream: &StreamHandle, error: Option<WebSocketError>) {
            let body = std::mem::take(&mut self.body);
            let _ = self
                .done
                .take()
                .unwrap()
                .send((stream.incoming_status(), body, error));
        }
    }

    #[allow(clippy::type_complexity)]
    fn connect(
        port: u16,
    ) -> (
        oneshot::Receiver<Result<Arc<dyn HttpConnection>>>,
        oneshot::Receiver<Option<WebSocketError>>,
    ) {
        let (setup_tx, setup_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        TokioConnectionService::new()
            .connect(HttpClientConnectionOptions {
                host_name: "127.0.0.1".to_owned(),
                port,
                socket_options: SocketOptions::default(),
                tls: None,
                initial_window_size: 1024,
                listener: Box::new(Listener {
                    setup: Some(setup_tx),
                    shutdown: Some(shutdown_tx),
                }),
            })
            .unwrap();

        (setup_rx, shutdown_rx)
    }

    #[test]
    fn test_connect_without_runtime() {
        let (setup, _) = oneshot::channel();
        let (shutdown, _) = oneshot::channel();
        let result = TokioConnectionService::new().connect(HttpClientConnectionOptions {
            host_name: "127.0.0.1".to_owned(),
            port: 80,
            socket_options: SocketOptions::default(),
            tls: None,
            initial_window_size: 1024,
            listener: Box::new(Listener {
                setup: Some(setup),
                shutdown: Some(shutdown),
            }),
        });
        assert!(matches!(result, Err(WebSocketError::Runtime(_))));
    }

    #[test]
    fn test_tls_connector() {
        assert!(tls_connector().is_ok());
    }

    #[tokio::test]
    async fn test_request_and_close() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = server.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                read += socket.read(&mut buf[read..]).await.unwrap();
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
            // keep the socket open until the client closes it
            let _ = socket.read(&mut buf).await;
        });

        let (setup, shutdown) = connect(port);
        let connection = setup.await.unwrap().unwrap();
        assert!(connection.is_open());
        assert!(connection.channel().is_none());

        let (done_tx, done_rx) = oneshot::channel();
        let path = b"/".to_vec();
        let headers = [Header::new(b"host", b"127.0.0.1")];
        connection
            .make_request(HttpRequestOptions {
                method: hyper::Method::GET,
                path: &path,
                headers: &headers,
                listener: Box::new(Response {
                    done: Some(done_tx),
                    body: Vec::new(),
                }),
            })
            .unwrap();

        let (status, body, error) = done_rx.await.unwrap();
        assert_eq!(status, Some(StatusCode::OK));
        assert_eq!(body, b"hello");
        assert!(error.is_none());

        connection.close();
        assert!(!connection.is_open());
        let error = tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_request_after_close() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = server.accept().await.unwrap();
            let _ = socket.read(&mut [0u8; 16]).await;
        });

        let (setup, _shutdown) = connect(port);
        let connection = setup.await.unwrap().unwrap();
        connection.close();

        let (done_tx, _done_rx) = oneshot::channel();
        let result = connection.make_request(HttpRequestOptions {
            method: hyper::Method::GET,
            path: b"/",
            headers: &[],
            listener: Box::new(Response {
                done: Some(done_tx),
                body: Vec::new(),
            }),
        });
        assert!(matches!(result, Err(WebSocketError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        drop(server);

        let (setup, shutdown) = connect(port);
        assert!(setup.await.unwrap().is_err());
        // the listener was dropped without a shutdown notification
        assert!(shutdown.await.is_err());
    }
}
