//! Streaming decoder for server-to-client WebSocket frames.
//!
//! Unlike a message-oriented codec, the [`Decoder`] never buffers a whole payload. It reports a
//! frame as a sequence of [`FrameEvent`]s: one `Begin` once the header is complete, any number
//! of `Payload` chunks as bytes arrive, and one `Complete` when the declared length has been
//! consumed. A payload limit caps how much data-frame payload a single event may carry, which
//! is how the framing handler applies its read window.
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{IncomingFrame, OpCode},
    WebSocketError,
};

/// One step of an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Begin(IncomingFrame),
    Payload(IncomingFrame, Bytes),
    Complete(IncomingFrame),
}

/// Payload still owed by the frame being read.
struct PayloadState {
    frame: IncomingFrame,
    remaining: u64,
}

/// Incremental frame decoder.
pub struct Decoder {
    /// `None` while waiting for a frame header.
    state: Option<PayloadState>,
    /// A fragmented data message is in progress.
    fragmented: bool,
    /// Maximum data-frame payload per event.
    payload_limit: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            state: None,
            fragmented: false,
            payload_limit: usize::MAX,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the data-frame payload carried by the next `Payload` event. Control frame payloads
    /// are not limited.
    pub fn set_payload_limit(&mut self, limit: usize) {
        self.payload_limit = limit;
    }

    /// Returns `true` while the decoder is in the middle of a data frame's payload.
    pub fn is_awaiting_payload(&self) -> bool {
        matches!(&self.state, Some(s) if s.remaining > 0 && s.frame.opcode.is_data())
    }

    /// The frame currently being read, if any.
    pub fn current_frame(&self) -> Option<IncomingFrame> {
        self.state.as_ref().map(|s| s.frame)
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<IncomingFrame>, WebSocketError> {
        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        // no extension is ever negotiated, so all three must be clear
        if src[0] & 0b0111_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }
        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

        if src[1] & 0b1000_0000 != 0 {
            return Err(WebSocketError::MaskedFrame);
        }

        let length_code = src[1] & 0x7F;
        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if src.remaining() < 2 + extra {
            return Ok(None);
        }
        src.advance(2);

        let payload_length = match extra {
            0 => u64::from(length_code),
            2 => u64::from(src.get_u16()),
            _ => src.get_u64(),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_length > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        } else if opcode == OpCode::Continuation {
            if !self.fragmented {
                return Err(WebSocketError::InvalidContinuationFrame);
            }
            self.fragmented = !fin;
        } else {
            if self.fragmented {
                return Err(WebSocketError::InvalidFragment);
            }
            self.fragmented = !fin;
        }

        Ok(Some(IncomingFrame::new(opcode, fin, payload_length)))
    }
}

impl codec::Decoder for Decoder {
    type Item = FrameEvent;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut state) = self.state.take() else {
            return Ok(self.decode_header(src)?.map(|frame| {
                self.state = Some(PayloadState {
                    frame,
                    remaining: frame.payload_length,
                });
                FrameEvent::Begin(frame)
            }));
        };

        if state.remaining == 0 {
            return Ok(Some(FrameEvent::Complete(state.frame)));
        }

        let limit = if state.frame.opcode.is_data() {
            self.payload_limit
        } else {
            usize::MAX
        };
        let take = state.remaining.min(src.len() as u64).min(limit as u64) as usize;
        if take == 0 {
            self.state = Some(state);
            return Ok(None);
        }

        state.remaining -= take as u64;
        let frame = state.frame;
        self.state = Some(state);

        Ok(Some(FrameEvent::Payload(frame, src.split_to(take).freeze())))
    }
}
