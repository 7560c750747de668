//! Reference-counted HTTP request/response streams.
//!
//! A [`StreamHandle`] is shared between whoever issued the request and the connection that
//! drives it. Cloning bumps an atomic count; the protocol-specific [`StreamVariant`] is torn
//! down when the last handle is dropped, from whichever thread drops it.

use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc, OnceLock,
};

use hyper::{Method, StatusCode, Version};

use crate::{request::Header, sync::Mutex, WebSocketError};

/// Receives the lifecycle callbacks of one request.
///
/// Every method except [`on_complete`](Self::on_complete) has a no-op default. Headers may be
/// delivered in several batches before the header block is done; completion is delivered exactly
/// once, which is why it consumes the listener.
pub trait StreamListener: Send {
    /// A batch of response headers arrived.
    fn on_incoming_headers(&mut self, _stream: &StreamHandle, _headers: &[Header<'_>]) {}

    /// All headers have been delivered.
    fn on_incoming_header_block_done(&mut self, _stream: &StreamHandle, _has_body: bool) {}

    /// A chunk of the response body arrived.
    fn on_incoming_body(&mut self, _stream: &StreamHandle, _data: &[u8]) {}

    /// The request (headers and body) has been fully written.
    fn on_request_end(&mut self, _stream: &StreamHandle) {}

    /// The exchange finished, successfully if `error` is `None`.
    fn on_complete(self: Box<Self>, stream: &StreamHandle, error: Option<WebSocketError>);
}

/// Protocol-version specific behavior behind a [`StreamHandle`].
pub trait StreamVariant: Send + Sync {
    fn version(&self) -> Version;
}

struct StreamInner {
    id: u64,
    variant: Box<dyn StreamVariant>,
    listener: Mutex<Option<Box<dyn StreamListener>>>,
    // 0 while unknown
    status: AtomicU16,
    request_method: OnceLock<Method>,
    request_target: OnceLock<String>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        #[cfg(feature = "logging")]
        log::trace!(
            "id={}: {:?} stream destroyed",
            self.id,
            self.variant.version()
        );
    }
}

/// A shared handle to one HTTP request/response exchange.
#[derive(Clone)]
pub struct StreamHandle(Arc<StreamInner>);

impl StreamHandle {
    /// Creates a stream driven by `variant`, reporting to `listener`.
    pub fn new(variant: Box<dyn StreamVariant>, listener: Box<dyn StreamListener>) -> Self {
        Self(Arc::new(StreamInner {
            id: crate::next_id(),
            variant,
            listener: Mutex::new(Some(listener)),
            status: AtomicU16::new(0),
            request_method: OnceLock::new(),
            request_target: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn version(&self) -> Version {
        self.0.variant.version()
    }

    /// The response status, once the first header batch or the completion has been delivered.
    pub fn incoming_status(&self) -> Option<StatusCode> {
        match self.0.status.load(Ordering::Acquire) {
            0 => None,
            code => StatusCode::from_u16(code).ok(),
        }
    }

    pub fn set_incoming_status(&self, status: StatusCode) {
        self.0.status.store(status.as_u16(), Ordering::Release);
    }

    /// Records method and target of a server-received request. Only the first call has effect.
    pub fn set_incoming_request(&self, method: Method, target: impl Into<String>) {
        let _ = self.0.request_method.set(method);
        let _ = self.0.request_target.set(target.into());
    }

    pub fn incoming_request_method(&self) -> Option<&Method> {
        self.0.request_method.get()
    }

    pub fn incoming_request_target(&self) -> Option<&str> {
        self.0.request_target.get().map(String::as_str)
    }

    pub fn deliver_incoming_headers(&self, headers: &[Header<'_>]) {
        self.with_listener(|listener| listener.on_incoming_headers(self, headers));
    }

    pub fn deliver_header_block_done(&self, has_body: bool) {
        self.with_listener(|listener| listener.on_incoming_header_block_done(self, has_body));
    }

    pub fn deliver_incoming_body(&self, data: &[u8]) {
        self.with_listener(|listener| listener.on_incoming_body(self, data));
    }

    pub fn deliver_request_end(&self) {
        self.with_listener(|listener| listener.on_request_end(self));
    }

    /// Delivers the completion callback. Returns `false` if the stream had already completed.
    pub fn complete(&self, error: Option<WebSocketError>) -> bool {
        let listener = self.0.listener.lock().take();
        match listener {
            Some(listener) => {
                listener.on_complete(self, error);
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.0.listener.lock().is_none()
    }

    /// Number of live handles to this stream.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    // The listener is taken out for the duration of the call so it can reach back into the
    // stream without deadlocking.
    fn with_listener(&self, f: impl FnOnce(&mut Box<dyn StreamListener>)) {
        let Some(mut listener) = self.0.listener.lock().take() else {
            return;
        };
        f(&mut listener);

        let mut slot = self.0.listener.lock();
        if slot.is_none() {
            *slot = Some(listener);
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.0.id)
            .field("version", &self.version())
            .field("status", &self.incoming_status())
            .finish()
    }
}
