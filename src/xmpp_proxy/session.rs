//! Per-connection state machine coupling the browser's WebSocket with the
//! upstream XMPP TCP stream.
//!
//! The session performs no I/O. The connection task feeds it socket events
//! through the `on_*` methods and executes the [`Action`]s it queues, in
//! order. Both halves have their own lifecycle:
//!
//! ```text
//! WebSocket: Start -> Receiving -> Closing -> Closed
//! Bridge:    Start -> Created   -> Closing -> Closed
//! ```
//!
//! A side reaching `Closed` only asks the other side to close. The session is
//! finished once both sides are `Closed`.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::frame::{
    encode_server, is_sendable_close_status, CloseReason, Frame, Opcode, CLOSE_GOING_AWAY,
};
use super::framing::{starts_new_stream, FramerError, StanzaFramer};
use super::handshake::{evaluate, Rejection, RequestReader};
use super::message::{
    AssemblerEvent, AssemblerLimits, Message, MessageAssembler, CLOSE_PROTOCOL_ERROR,
    CLOSE_TOO_BIG,
};
use super::stream_open::StreamOpenDetector;
use crate::config::Config;

/// Close status for data the gateway does not accept (binary messages).
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// Close status when the upstream connection could not be used.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// HTTP upgrade in progress.
    Start,
    Receiving,
    /// Close sent or being sent; waiting for the output to drain.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Start,
    /// Bridge exists; the upstream socket may not be connected yet.
    Created,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub ws: WsState,
    pub bridge: BridgeState,
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        self.ws == WsState::Closed && self.bridge == BridgeState::Closed
    }
}

/// Notifications from the WebSocket half to the bridge half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The upgrade succeeded.
    Connected,
    /// A complete text message from the browser.
    Message(Bytes),
    /// The WebSocket started closing.
    Closed,
    /// The WebSocket is gone.
    Deleted,
}

/// Work for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write bytes to the browser socket.
    Browser(Bytes),
    /// Write bytes to the upstream socket.
    Upstream(Bytes),
    /// Resolve and connect to the upstream for this XMPP domain.
    Connect(String),
    /// Tear down the upstream socket (or the connect in flight), then report
    /// through [`Session::on_upstream_closed`].
    CloseUpstream,
    /// Close the browser socket.
    ShutdownBrowser,
}

pub struct Session {
    conn_id: u64,
    config: Arc<Config>,
    state: SessionState,
    request: RequestReader,
    assembler: MessageAssembler,
    detector: StreamOpenDetector,
    framer: StanzaFramer,
    /// Browser messages received before the upstream connected.
    pending: Vec<Bytes>,
    pending_bytes: usize,
    connect_requested: bool,
    upstream_connected: bool,
    close_status: Option<u16>,
    actions: VecDeque<Action>,
}

impl Session {
    pub fn new(config: Arc<Config>, conn_id: u64) -> Self {
        let limits = AssemblerLimits {
            max_frame: config.frame_limit(),
            max_message: config.message_limit(),
        };
        let framer = StanzaFramer::new(config.message_limit());
        Self {
            conn_id,
            config,
            state: SessionState {
                ws: WsState::Start,
                bridge: BridgeState::Start,
            },
            request: RequestReader::new(),
            assembler: MessageAssembler::new(limits, true),
            detector: StreamOpenDetector::new(),
            framer,
            pending: Vec::new(),
            pending_bytes: 0,
            connect_requested: false,
            upstream_connected: false,
            close_status: None,
            actions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Status of the Close frame sent to the browser, if any.
    pub fn close_status(&self) -> Option<u16> {
        self.close_status
    }

    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    // --- WebSocket side ---

    pub fn on_browser_data(&mut self, data: &[u8]) {
        match self.state.ws {
            WsState::Start => self.on_request_bytes(data),
            WsState::Receiving => self.on_frame_bytes(data),
            WsState::Closing | WsState::Closed => {}
        }
    }

    /// Every queued browser write has been flushed.
    pub fn on_browser_drained(&mut self) {
        if self.state.ws != WsState::Closing {
            return;
        }
        self.actions.push_back(Action::ShutdownBrowser);
        self.state.ws = WsState::Closed;
        self.dispatch(BridgeEvent::Deleted);
    }

    /// The browser closed its socket or a read failed.
    pub fn on_browser_eof(&mut self) {
        if self.state.ws == WsState::Closed {
            return;
        }
        debug!(conn_id = self.conn_id, "Browser socket closed");
        self.state.ws = WsState::Closed;
        self.dispatch(BridgeEvent::Deleted);
    }

    /// Close the WebSocket with `status`, e.g. on idle timeout or shutdown.
    pub fn request_close(&mut self, status: u16, reason: &str) {
        self.close_browser(status, reason);
    }

    fn on_request_bytes(&mut self, data: &[u8]) {
        let rest = match self.request.push(data) {
            Ok(Some(rest)) => rest,
            Ok(None) => return,
            Err(e) => return self.reject(Rejection::from(e)),
        };

        match evaluate(self.request.parser(), &self.config) {
            Ok(response) => {
                info!(
                    conn_id = self.conn_id,
                    resource = self.request.parser().resource(),
                    origin = self.request.parser().header("origin").unwrap_or_default(),
                    "WebSocket upgrade accepted"
                );
                self.actions.push_back(Action::Browser(Bytes::from(response)));
                self.state.ws = WsState::Receiving;
                self.dispatch(BridgeEvent::Connected);
                if !rest.is_empty() {
                    self.on_frame_bytes(&rest);
                }
            }
            Err(rejection) => self.reject(rejection),
        }
    }

    fn reject(&mut self, rejection: Rejection) {
        warn!(
            conn_id = self.conn_id,
            status = rejection.status(),
            reason = %rejection,
            "WebSocket upgrade rejected"
        );
        self.actions
            .push_back(Action::Browser(Bytes::from_static(rejection.response().as_bytes())));
        self.state.ws = WsState::Closing;
        self.dispatch(BridgeEvent::Closed);
    }

    fn on_frame_bytes(&mut self, data: &[u8]) {
        if let Err(e) = self.assembler.push(data) {
            return self.close_browser(e.close_status(), &e.to_string());
        }

        while self.state.ws == WsState::Receiving {
            match self.assembler.poll() {
                Ok(None) => break,
                Ok(Some(AssemblerEvent::Control(frame))) => self.on_control(frame),
                Ok(Some(AssemblerEvent::MessageReady)) => {
                    if let Some(message) = self.assembler.take_message() {
                        self.on_message(message);
                    }
                }
                Err(e) => {
                    warn!(conn_id = self.conn_id, error = %e, "Invalid WebSocket data");
                    self.close_browser(e.close_status(), &e.to_string());
                }
            }
        }
    }

    fn on_control(&mut self, frame: Frame) {
        match frame.opcode {
            Opcode::Close => {
                let CloseReason { status, reason } = CloseReason::parse(&frame.payload);
                info!(conn_id = self.conn_id, status, reason = %reason, "Browser sent Close");
                if is_sendable_close_status(status) {
                    self.close_browser(status, &reason);
                } else {
                    self.close_browser(CLOSE_PROTOCOL_ERROR, "invalid close status");
                }
            }
            Opcode::Ping => {
                let pong = Frame::pong(frame.payload);
                self.actions
                    .push_back(Action::Browser(encode_server(pong.opcode, &pong.payload)));
            }
            _ => {}
        }
    }

    fn on_message(&mut self, message: Message) {
        if message.opcode != Opcode::Text {
            return self.close_browser(CLOSE_UNSUPPORTED_DATA, "binary messages are not supported");
        }
        debug!(
            target: "jabsocket::stanza",
            conn_id = self.conn_id,
            data = %String::from_utf8_lossy(&message.payload),
            "WS->TCP"
        );
        self.dispatch(BridgeEvent::Message(message.payload));
    }

    /// Send a Close frame and start closing. Before the upgrade completes the
    /// socket is simply dropped.
    fn close_browser(&mut self, status: u16, reason: &str) {
        match self.state.ws {
            WsState::Receiving => {
                let close = Frame::close(status, reason);
                self.actions
                    .push_back(Action::Browser(encode_server(Opcode::Close, &close.payload)));
                self.close_status = Some(status);
            }
            WsState::Start => {}
            WsState::Closing | WsState::Closed => return,
        }
        debug!(conn_id = self.conn_id, status, reason, "Closing WebSocket");
        self.state.ws = WsState::Closing;
        self.dispatch(BridgeEvent::Closed);
    }

    // --- Bridge side ---

    fn dispatch(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected => {
                if self.state.bridge == BridgeState::Start {
                    self.state.bridge = BridgeState::Created;
                }
            }
            BridgeEvent::Message(payload) => self.on_browser_message(payload),
            BridgeEvent::Closed | BridgeEvent::Deleted => match self.state.bridge {
                BridgeState::Start => self.state.bridge = BridgeState::Closed,
                BridgeState::Created => {
                    self.state.bridge = BridgeState::Closing;
                    self.actions.push_back(Action::CloseUpstream);
                }
                BridgeState::Closing | BridgeState::Closed => {}
            },
        }
    }

    fn on_browser_message(&mut self, payload: Bytes) {
        if self.state.bridge != BridgeState::Created {
            return;
        }
        if self.upstream_connected {
            self.actions.push_back(Action::Upstream(payload));
            return;
        }

        self.pending_bytes += payload.len();
        if let Some(max) = self.config.message_limit() {
            if self.pending_bytes > max {
                return self.close_browser(CLOSE_TOO_BIG, "too much data before upstream connected");
            }
        }
        let feed = self.detector.feed(&payload);
        self.pending.push(payload);
        if self.connect_requested {
            return;
        }
        if let Err(e) = feed {
            warn!(conn_id = self.conn_id, error = %e, "Invalid stream header from browser");
            return self.close_browser(CLOSE_PROTOCOL_ERROR, &e.to_string());
        }
        if !self.detector.saw_stream() {
            return;
        }

        let target = self
            .detector
            .target()
            .map(str::to_string)
            .or_else(|| self.config.upstream_override().map(|(host, _)| host));
        match target {
            Some(target) => {
                info!(conn_id = self.conn_id, target = %target, "Stream header received");
                self.connect_requested = true;
                self.actions.push_back(Action::Connect(target));
            }
            None => {
                self.close_browser(CLOSE_PROTOCOL_ERROR, "stream header has no 'to' attribute");
            }
        }
    }

    pub fn on_upstream_connected(&mut self) {
        if self.state.bridge != BridgeState::Created {
            return;
        }
        self.upstream_connected = true;
        debug!(
            conn_id = self.conn_id,
            buffered = self.pending.len(),
            "Flushing buffered browser messages"
        );
        self.pending_bytes = 0;
        for payload in self.pending.drain(..) {
            self.actions.push_back(Action::Upstream(payload));
        }
    }

    pub fn on_upstream_data(&mut self, data: &[u8]) {
        if self.state.ws != WsState::Receiving || self.state.bridge != BridgeState::Created {
            return;
        }
        if starts_new_stream(data) {
            self.framer.reset();
        }
        if let Err(e) = self.framer.feed(data) {
            warn!(conn_id = self.conn_id, error = %e, "Invalid XML from upstream");
            let status = match e {
                FramerError::Overflow { .. } => CLOSE_TOO_BIG,
                _ => CLOSE_PROTOCOL_ERROR,
            };
            return self.close_browser(status, &e.to_string());
        }
        while let Some((kind, span)) = self.framer.next_span() {
            debug!(
                target: "jabsocket::stanza",
                conn_id = self.conn_id,
                kind = ?kind,
                data = %String::from_utf8_lossy(&span),
                "TCP->WS"
            );
            self.actions
                .push_back(Action::Browser(encode_server(Opcode::Text, &span)));
        }
    }

    /// The upstream socket is closed, whether the server hung up or the
    /// gateway asked for it.
    pub fn on_upstream_closed(&mut self) {
        if self.state.bridge == BridgeState::Closed {
            return;
        }
        info!(conn_id = self.conn_id, "Upstream closed");
        self.state.bridge = BridgeState::Closed;
        self.close_browser(CLOSE_GOING_AWAY, "upstream closed");
    }

    /// Resolving, connecting to, reading from or writing to the upstream
    /// failed.
    pub fn on_upstream_failed(&mut self, reason: &str) {
        if self.state.bridge == BridgeState::Closed {
            return;
        }
        warn!(conn_id = self.conn_id, reason, "Upstream failed");
        self.state.bridge = BridgeState::Closed;
        self.close_browser(CLOSE_INTERNAL_ERROR, "upstream failure");
    }
}
