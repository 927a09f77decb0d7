//! Reassembly of WebSocket messages from client frames.
//!
//! Control frames are surfaced as soon as they are decoded, even in the
//! middle of a fragmented message. Data frames are accumulated until the
//! frame carrying FIN, at which point the message is held until the owner
//! takes it.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::frame::{decode_next, Frame, FrameError, Opcode};

/// Close status for protocol violations.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close status for frames or messages over the configured limits.
pub const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerLimits {
    /// Largest accepted frame payload, `None` for unlimited.
    pub max_frame: Option<usize>,
    /// Largest accepted message, `None` for unlimited.
    pub max_message: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Accumulating,
    Ready,
    Failed,
}

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerEvent {
    /// A Close, Ping or Pong frame.
    Control(Frame),
    /// A message is ready; retrieve it with [`MessageAssembler::take_message`].
    MessageReady,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("fragmented {0:?} control frame")]
    FragmentedControl(Opcode),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("{0:?} frame started while a message was in progress")]
    InterleavedMessage(Opcode),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("assembler already failed")]
    Failed,
}

impl MessageError {
    /// WebSocket close status the session answers this error with.
    pub fn close_status(&self) -> u16 {
        match self {
            Self::Frame(FrameError::FrameTooLarge { .. })
            | Self::Frame(FrameError::PayloadTooLong(_))
            | Self::MessageTooLarge { .. } => CLOSE_TOO_BIG,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

pub struct MessageAssembler {
    buffer: BytesMut,
    partial: BytesMut,
    opcode: Option<Opcode>,
    ready: Option<Message>,
    state: AssemblerState,
    limits: AssemblerLimits,
    require_mask: bool,
}

impl MessageAssembler {
    /// `require_mask` rejects unmasked frames, as a server must for client
    /// traffic.
    pub fn new(limits: AssemblerLimits, require_mask: bool) -> Self {
        Self {
            buffer: BytesMut::new(),
            partial: BytesMut::new(),
            opcode: None,
            ready: None,
            state: AssemblerState::Idle,
            limits,
            require_mask,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Append raw bytes from the socket.
    pub fn push(&mut self, data: &[u8]) -> Result<(), MessageError> {
        if self.state == AssemblerState::Failed {
            return Err(MessageError::Failed);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Decode buffered frames until something is worth reporting.
    ///
    /// Returns `Ok(None)` when more bytes are needed, or while a ready message
    /// has not been taken yet.
    pub fn poll(&mut self) -> Result<Option<AssemblerEvent>, MessageError> {
        match self.state {
            AssemblerState::Failed => return Err(MessageError::Failed),
            AssemblerState::Ready => return Ok(None),
            _ => {}
        }

        loop {
            let frame = match decode_next(&mut self.buffer, self.limits.max_frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.fail(e.into())),
            };

            if self.require_mask && !frame.masked {
                return Err(self.fail(MessageError::Unmasked));
            }

            if frame.opcode.is_control() {
                if !frame.fin {
                    return Err(self.fail(MessageError::FragmentedControl(frame.opcode)));
                }
                return Ok(Some(AssemblerEvent::Control(frame)));
            }

            match frame.opcode {
                Opcode::Continuation => {
                    if self.state != AssemblerState::Accumulating {
                        return Err(self.fail(MessageError::UnexpectedContinuation));
                    }
                }
                opcode => {
                    if self.state == AssemblerState::Accumulating {
                        return Err(self.fail(MessageError::InterleavedMessage(opcode)));
                    }
                    self.opcode = Some(opcode);
                    self.state = AssemblerState::Accumulating;
                }
            }

            let len = self.partial.len() + frame.payload.len();
            if let Some(max) = self.limits.max_message {
                if len > max {
                    return Err(self.fail(MessageError::MessageTooLarge { len, max }));
                }
            }
            self.partial.extend_from_slice(&frame.payload);

            if frame.fin {
                let opcode = self.opcode.take().unwrap_or(Opcode::Text);
                self.ready = Some(Message {
                    opcode,
                    payload: self.partial.split().freeze(),
                });
                self.state = AssemblerState::Ready;
                return Ok(Some(AssemblerEvent::MessageReady));
            }
        }
    }

    /// Hand over the ready message and go back to `Idle`. Frames still in the
    /// buffer are decoded by the next [`poll`](Self::poll).
    pub fn take_message(&mut self) -> Option<Message> {
        if self.state != AssemblerState::Ready {
            return None;
        }
        self.state = AssemblerState::Idle;
        self.ready.take()
    }

    fn fail(&mut self, error: MessageError) -> MessageError {
        self.state = AssemblerState::Failed;
        self.buffer.clear();
        self.partial.clear();
        self.opcode = None;
        self.ready = None;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_proxy::frame::encode;

    const KEY: [u8; 4] = [1, 2, 3, 4];

    fn masked(opcode: Opcode, fin: bool, payload: &'static [u8]) -> Bytes {
        encode(&Frame::new(opcode, fin, payload).with_mask(KEY))
    }

    fn assembler() -> MessageAssembler {
        MessageAssembler::new(AssemblerLimits::default(), true)
    }

    #[test]
    fn test_fragmented_text_joins_payloads() {
        let mut asm = assembler();
        asm.push(&masked(Opcode::Text, false, b"<message>")).unwrap();
        assert_eq!(asm.poll(), Ok(None));
        assert_eq!(asm.state(), AssemblerState::Accumulating);

        asm.push(&masked(Opcode::Continuation, true, b"</message>")).unwrap();
        assert_eq!(asm.poll(), Ok(Some(AssemblerEvent::MessageReady)));

        let message = asm.take_message().unwrap();
        assert_eq!(message.opcode, Opcode::Text);
        assert_eq!(&message.payload[..], b"<message></message>");
        assert_eq!(asm.state(), AssemblerState::Idle);
        assert_eq!(asm.poll(), Ok(None));
    }

    #[test]
    fn test_continuation_without_start_fails() {
        let mut asm = assembler();
        asm.push(&masked(Opcode::Continuation, true, b"x")).unwrap();
        assert_eq!(asm.poll(), Err(MessageError::UnexpectedContinuation));
        assert_eq!(asm.state(), AssemblerState::Failed);
    }

    #[test]
    fn test_fragmented_control_frames_rejected() {
        for opcode in [Opcode::Close, Opcode::Ping, Opcode::Pong] {
            for payload in [&b""[..], &b"abc"[..]] {
                let mut asm = assembler();
                asm.push(&encode(&Frame::new(opcode, false, payload).with_mask(KEY)))
                    .unwrap();
                assert_eq!(asm.poll(), Err(MessageError::FragmentedControl(opcode)));
            }
        }
    }

    #[test]
    fn test_control_frame_inside_fragmented_message() {
        let mut asm = assembler();
        asm.push(&masked(Opcode::Text, false, b"<presence")).unwrap();
        asm.push(&masked(Opcode::Ping, true, b"hb")).unwrap();
        asm.push(&masked(Opcode::Continuation, true, b"/>")).unwrap();

        match asm.poll() {
            Ok(Some(AssemblerEvent::Control(frame))) => {
                assert_eq!(frame.opcode, Opcode::Ping);
                assert_eq!(&frame.payload[..], b"hb");
            }
            other => panic!("expected ping, got {other:?}"),
        }
        assert_eq!(asm.poll(), Ok(Some(AssemblerEvent::MessageReady)));
        assert_eq!(&asm.take_message().unwrap().payload[..], b"<presence/>");
    }

    #[test]
    fn test_messages_queue_from_one_push() {
        let mut asm = assembler();
        let mut bulk = Vec::new();
        bulk.extend_from_slice(&masked(Opcode::Text, true, b"<a/>"));
        bulk.extend_from_slice(&masked(Opcode::Text, true, b"<b/>"));
        asm.push(&bulk).unwrap();

        assert_eq!(asm.poll(), Ok(Some(AssemblerEvent::MessageReady)));
        // Ready message blocks progress until taken.
        assert_eq!(asm.poll(), Ok(None));
        assert_eq!(&asm.take_message().unwrap().payload[..], b"<a/>");

        assert_eq!(asm.poll(), Ok(Some(AssemblerEvent::MessageReady)));
        assert_eq!(&asm.take_message().unwrap().payload[..], b"<b/>");
        assert!(asm.take_message().is_none());
    }

    #[test]
    fn test_new_message_while_accumulating_fails() {
        let mut asm = assembler();
        asm.push(&masked(Opcode::Text, false, b"a")).unwrap();
        asm.push(&masked(Opcode::Binary, true, b"b")).unwrap();
        assert_eq!(
            asm.poll(),
            Err(MessageError::InterleavedMessage(Opcode::Binary))
        );
    }

    #[test]
    fn test_binary_opcode_is_kept() {
        let mut asm = assembler();
        asm.push(&masked(Opcode::Binary, true, b"\x00\x01")).unwrap();
        assert_eq!(asm.poll(), Ok(Some(AssemblerEvent::MessageReady)));
        assert_eq!(asm.take_message().unwrap().opcode, Opcode::Binary);
    }

    #[test]
    fn test_error_is_terminal() {
        let mut asm = assembler();
        asm.push(&[0xF1, 0x80]).unwrap();
        assert!(matches!(
            asm.poll(),
            Err(MessageError::Frame(FrameError::ReservedBits(_)))
        ));
        assert_eq!(asm.push(&masked(Opcode::Text, true, b"x")), Err(MessageError::Failed));
        assert_eq!(asm.poll(), Err(MessageError::Failed));
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let mut asm = assembler();
        asm.push(&encode(&Frame::text("plain"))).unwrap();
        assert_eq!(asm.poll(), Err(MessageError::Unmasked));

        let mut lenient = MessageAssembler::new(AssemblerLimits::default(), false);
        lenient.push(&encode(&Frame::text("plain"))).unwrap();
        assert_eq!(lenient.poll(), Ok(Some(AssemblerEvent::MessageReady)));
    }

    #[test]
    fn test_message_limit_counts_all_fragments() {
        let limits = AssemblerLimits {
            max_frame: Some(4),
            max_message: Some(6),
        };
        let mut asm = MessageAssembler::new(limits, true);
        asm.push(&masked(Opcode::Text, false, b"abcd")).unwrap();
        asm.push(&masked(Opcode::Continuation, true, b"efg")).unwrap();

        let err = asm.poll().unwrap_err();
        assert_eq!(err, MessageError::MessageTooLarge { len: 7, max: 6 });
        assert_eq!(err.close_status(), CLOSE_TOO_BIG);
    }

    #[test]
    fn test_frame_limit_maps_to_too_big() {
        let limits = AssemblerLimits {
            max_frame: Some(2),
            max_message: None,
        };
        let mut asm = MessageAssembler::new(limits, true);
        asm.push(&masked(Opcode::Text, true, b"abc")).unwrap();
        let err = asm.poll().unwrap_err();
        assert_eq!(err.close_status(), CLOSE_TOO_BIG);
        assert_eq!(
            MessageError::UnexpectedContinuation.close_status(),
            CLOSE_PROTOCOL_ERROR
        );
    }
}
