//! The WebSocket handle and the framing-handler seam.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::Notify;

use crate::{
    bootstrap, connection::Channel, frame::IncomingFrame, ClientConnectionOptions, Result,
    WebSocketError,
};

/// Called when a frame header has been received. Returning `false` closes the connection.
pub type FrameBeginFn = Box<dyn FnMut(&WebSocket, &IncomingFrame) -> bool + Send>;

/// Called for each chunk of a frame's payload. Returning `false` closes the connection.
pub type FramePayloadFn = Box<dyn FnMut(&WebSocket, &IncomingFrame, &[u8]) -> bool + Send>;

/// Called once a frame has been fully received, or with the error that interrupted it.
/// Returning `false` closes the connection.
pub type FrameCompleteFn =
    Box<dyn FnMut(&WebSocket, &IncomingFrame, Option<&WebSocketError>) -> bool + Send>;

/// The three frame callbacks. They are configured together or not at all.
pub struct FrameCallbacks {
    pub on_begin: FrameBeginFn,
    pub on_payload: FramePayloadFn,
    pub on_complete: FrameCompleteFn,
}

impl fmt::Debug for FrameCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCallbacks").finish_non_exhaustive()
    }
}

/// What a [`WebSocketHandlerFactory`] receives when asked to install a handler.
pub struct WebSocketHandlerOptions {
    /// Pipeline of the upgraded connection.
    pub channel: Arc<dyn Channel>,
    pub initial_window_size: usize,
    /// When set, data-frame payload delivery stops once the read window is spent, until
    /// [`WebSocket::increment_read_window`] is called.
    pub manual_window_management: bool,
    pub frame_callbacks: Option<FrameCallbacks>,
    pub is_server: bool,
}

/// Installs a WebSocket framing handler on an upgraded connection.
pub trait WebSocketHandlerFactory: Send + Sync {
    /// Installs the handler and returns the handle wired to it.
    ///
    /// Must not invoke any frame callback before returning.
    fn new_handler(&self, options: WebSocketHandlerOptions) -> Result<WebSocket>;
}

struct Inner {
    id: u64,
    channel: Arc<dyn Channel>,
    window: AtomicUsize,
    window_opened: Notify,
}

/// A client WebSocket connection.
///
/// Handles are cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl WebSocket {
    /// Starts connecting to `options.uri`.
    ///
    /// Returns once the attempt has been validated and started. The outcome arrives through
    /// the setup callback, exactly once.
    ///
    /// # Errors
    /// Fails with [`WebSocketError::InvalidArgument`] when a required option is missing, the
    /// frame callbacks are only partially set, no handshake header was supplied, or the uri has
    /// no host. Allocation failures and errors returned by the connection service are passed
    /// through. No callback fires when this returns an error.
    pub fn connect(options: ClientConnectionOptions) -> Result<()> {
        bootstrap::initiate(options)
    }

    /// Creates the handle for a handler installed on `channel`.
    pub fn new(channel: Arc<dyn Channel>, initial_window_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: crate::next_id(),
                channel,
                window: AtomicUsize::new(initial_window_size),
                window_opened: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    /// Closes the connection. The shutdown callback follows with no error.
    pub fn close(&self) {
        #[cfg(feature = "logging")]
        log::debug!("id={}: websocket close requested", self.inner.id);

        self.inner.channel.shutdown(None);
    }

    /// Allows `size` more bytes of data-frame payload to be delivered.
    pub fn increment_read_window(&self, size: usize) {
        let _ = self
            .inner
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(w.saturating_add(size))
            });
        self.inner.window_opened.notify_waiters();
    }

    /// Bytes of data-frame payload that may still be delivered.
    pub fn read_window(&self) -> usize {
        self.inner.window.load(Ordering::Acquire)
    }

    /// Returns `true` if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &WebSocket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn consume_read_window(&self, size: usize) {
        let _ = self
            .inner
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(w.saturating_sub(size))
            });
    }

    /// Resolves once the read window is non-zero.
    pub(crate) async fn read_window_opened(&self) {
        loop {
            let notified = self.inner.window_opened.notified();
            if self.read_window() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel.id())
            .field("read_window", &self.read_window())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{connection::ChannelHandler, sync::Mutex};

    #[derive(Default)]
    struct NullChannel {
        shutdowns: Mutex<Vec<Option<String>>>,
    }

    impl Channel for NullChannel {
        fn id(&self) -> u64 {
            7
        }

        fn install_handler(&self, _handler: Box<dyn ChannelHandler>) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self, error: Option<WebSocketError>) {
            self.shutdowns.lock().push(error.map(|e| e.to_string()));
        }
    }

    #[test]
    fn test_read_window() {
        let ws = WebSocket::new(Arc::new(NullChannel::default()), 10);
        ws.consume_read_window(4);
        assert_eq!(ws.read_window(), 6);
        ws.consume_read_window(100);
        assert_eq!(ws.read_window(), 0);
        ws.increment_read_window(usize::MAX);
        ws.increment_read_window(1);
        assert_eq!(ws.read_window(), usize::MAX);
    }

    #[test]
    fn test_close_shuts_down_channel() {
        let channel = Arc::new(NullChannel::default());
        let ws = WebSocket::new(channel.clone(), 0);
        let other = ws.clone();

        other.close();
        assert!(ws.ptr_eq(&other));
        assert_eq!(channel.shutdowns.lock().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_read_window_opened() {
        let ws = WebSocket::new(Arc::new(NullChannel::default()), 0);
        let waiter = ws.clone();
        let task = tokio::spawn(async move { waiter.read_window_opened().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        ws.increment_read_window(3);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
