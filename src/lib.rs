//! WebSocket to XMPP gateway.
//!
//! Browsers speak XMPP over WebSocket (one stanza per text message, `xmpp`
//! subprotocol); XMPP servers speak one long XML document over TCP. The
//! [`xmpp_proxy::XmppProxy`] listener upgrades browser connections, learns the
//! target domain from the stream header, and relays traffic both ways,
//! re-framing the server's byte stream at stanza boundaries.

pub mod config;
pub mod xmpp_proxy;
