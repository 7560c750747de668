//! The default framing handler.
//!
//! Reads server frames off the upgraded connection and feeds them to the frame callbacks. The
//! handler runs on the connection task, so frame callbacks never overlap with connection
//! callbacks and always come after the setup callback.

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio_util::codec::Decoder as _;

use crate::{
    codec::{Decoder, FrameEvent},
    connection::{ChannelHandler, HttpStream},
    frame::OpCode,
    websocket::{FrameCallbacks, WebSocketHandlerFactory, WebSocketHandlerOptions},
    Result, WebSocket, WebSocketError,
};

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Installs a client-side framing handler on an upgraded connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramingHandlerFactory;

impl WebSocketHandlerFactory for FramingHandlerFactory {
    fn new_handler(&self, options: WebSocketHandlerOptions) -> Result<WebSocket> {
        if options.is_server {
            return Err(WebSocketError::HandlerInstall(
                "server-side handlers are not supported",
            ));
        }

        let websocket = WebSocket::new(options.channel.clone(), options.initial_window_size);
        options.channel.install_handler(Box::new(FramingHandler {
            websocket: websocket.clone(),
            callbacks: options.frame_callbacks,
            manual_window_management: options.manual_window_management,
        }))?;

        #[cfg(feature = "logging")]
        log::debug!(
            "id={}: websocket handler installed on channel id={}",
            websocket.id(),
            options.channel.id()
        );

        Ok(websocket)
    }
}

struct FramingHandler {
    websocket: WebSocket,
    callbacks: Option<FrameCallbacks>,
    manual_window_management: bool,
}

impl ChannelHandler for FramingHandler {
    fn run(self: Box<Self>, io: HttpStream) -> BoxFuture<'static, Option<WebSocketError>> {
        Box::pin(async move {
            let _id = self.websocket.id();
            let result = self.read_frames(io).await;

            #[cfg(feature = "logging")]
            log::debug!("id={}: websocket handler stopped: {:?}", _id, result);

            result.err()
        })
    }
}

impl FramingHandler {
    /// Reads until the server's close frame has been received or an error occurs.
    async fn read_frames(mut self, mut io: HttpStream) -> Result<()> {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let limit = if self.manual_window_management {
                self.websocket.read_window()
            } else {
                usize::MAX
            };
            decoder.set_payload_limit(limit);

            let step = match decoder.decode(&mut buf) {
                Ok(Some(event)) => self.dispatch(&event).map(|_| event),
                Ok(None) if decoder.is_awaiting_payload() && limit == 0 => {
                    self.websocket.read_window_opened().await;
                    continue;
                }
                Ok(None) => {
                    match io.read_buf(&mut buf).await {
                        Ok(0) => Err(WebSocketError::ConnectionClosed),
                        Ok(_) => continue,
                        Err(err) => Err(err.into()),
                    }
                }
                Err(err) => Err(err),
            };

            match step {
                Ok(FrameEvent::Complete(frame)) if frame.opcode == OpCode::Close => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    if let (Some(frame), Some(callbacks)) =
                        (decoder.current_frame(), self.callbacks.as_mut())
                    {
                        let _ = (callbacks.on_complete)(&self.websocket, &frame, Some(&err));
                    }
                    return Err(err);
                }
            }
        }
    }

    fn dispatch(&mut self, event: &FrameEvent) -> Result<()> {
        if let FrameEvent::Payload(frame, data) = event {
            if self.manual_window_management && frame.opcode.is_data() {
                self.websocket.consume_read_window(data.len());
            }
        }

        let Some(callbacks) = self.callbacks.as_mut() else {
            return Ok(());
        };

        let websocket = &self.websocket;
        let keep_going = match event {
            FrameEvent::Begin(frame) => (callbacks.on_begin)(websocket, frame),
            FrameEvent::Payload(frame, data) => (callbacks.on_payload)(websocket, frame, data),
            FrameEvent::Complete(frame) => (callbacks.on_complete)(websocket, frame, None),
        };

        if keep_going {
            Ok(())
        } else {
            Err(WebSocketError::FrameCallbackAborted)
        }
    }
}
