//! XMPP XML framing: stanza boundary detection on the upstream TCP stream.
//!
//! The XMPP server sends one endless XML document: a `<stream:stream>` root
//! whose children are the stanzas. Browsers expect each stanza (and the
//! stream header and trailer) in its own WebSocket message, so the framer
//! tracks element depth across arbitrary TCP chunk boundaries and reports the
//! byte ranges of complete top-level elements.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// The `<stream:stream ...>` open tag.
    StreamOpen,
    /// A complete child element of the stream root.
    Stanza,
    /// The `</stream:stream>` close tag.
    StreamClose,
}

/// Byte range of a complete unit, in absolute offsets from the start of the
/// current stream (offsets restart at 0 after [`StanzaFramer::reset`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StanzaSpan {
    pub kind: SpanKind,
    pub start: u64,
    pub len: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("malformed XML at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
    #[error("{pending} bytes without a complete stanza exceed limit of {max}")]
    Overflow { pending: u64, max: usize },
    #[error("framer already failed")]
    Failed,
}

/// Returns true when an upstream chunk starts a brand-new XML stream, as
/// happens after STARTTLS or SASL success.
pub fn starts_new_stream(chunk: &[u8]) -> bool {
    let start = chunk
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(chunk.len());
    let chunk = &chunk[start..];
    chunk.starts_with(b"<?xml") || chunk.starts_with(b"<stream:stream")
}

/// Depth bookkeeping, kept apart from the byte buffer so the tokenizer can
/// borrow the bytes while events update the nesting state.
#[derive(Debug, Default)]
struct Nesting {
    depth: usize,
    pending_start: Option<u64>,
    spans: VecDeque<StanzaSpan>,
    emitted_end: u64,
}

impl Nesting {
    fn emit(&mut self, kind: SpanKind, start: u64, end: u64) {
        self.spans.push_back(StanzaSpan {
            kind,
            start,
            len: (end - start) as usize,
        });
        self.emitted_end = end;
    }

    fn on_start(&mut self, is_stream: bool, start: u64, end: u64) -> Result<(), String> {
        if is_stream {
            self.depth = 0;
            self.pending_start = None;
            self.emit(SpanKind::StreamOpen, start, end);
        } else if self.depth == 0 {
            return Err("element outside of a stream".to_string());
        } else if self.depth == 1 {
            self.pending_start = Some(start);
        }
        self.depth += 1;
        Ok(())
    }

    fn on_empty(&mut self, is_stream: bool, start: u64, end: u64) -> Result<(), String> {
        if is_stream {
            self.depth = 0;
            self.pending_start = None;
            self.emit(SpanKind::StreamOpen, start, end);
            return Ok(());
        }
        match self.depth {
            0 => Err("element outside of a stream".to_string()),
            1 => {
                self.emit(SpanKind::Stanza, start, end);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_end(&mut self, is_stream: bool, start: u64, end: u64) -> Result<(), String> {
        if self.depth == 0 {
            return Err("end tag without matching start tag".to_string());
        }
        self.depth -= 1;
        match self.depth {
            1 => match self.pending_start.take() {
                Some(stanza_start) => self.emit(SpanKind::Stanza, stanza_start, end),
                None => return Err("stanza end without a recorded start".to_string()),
            },
            0 if is_stream => self.emit(SpanKind::StreamClose, start, end),
            0 => return Err("stream root closed by a foreign end tag".to_string()),
            _ => {}
        }
        Ok(())
    }
}

fn is_incomplete(error: &XmlError, remaining: &[u8]) -> bool {
    match error {
        XmlError::Syntax(
            SyntaxError::UnclosedTag
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedDoctype
            | SyntaxError::UnclosedPIOrXmlDecl,
        ) => true,
        // `<!` followed by too few bytes to tell a comment from CDATA.
        XmlError::Syntax(SyntaxError::InvalidBangMarkup) => remaining.len() < b"<![CDATA[".len(),
        _ => false,
    }
}

/// Incremental stanza framer for one upstream connection.
///
/// Bytes are appended with [`feed`](Self::feed); complete units are taken in
/// arrival order with [`next_span`](Self::next_span). Memory is bounded by
/// the bytes that have not been handed out yet. Malformed XML is terminal:
/// no attempt is made to resynchronise on a later stanza boundary.
#[derive(Debug)]
pub struct StanzaFramer {
    buffer: BytesMut,
    /// Absolute offset of `buffer[0]`.
    base: u64,
    /// Absolute offset where tokenizing resumes (always an event boundary).
    scanned: u64,
    nesting: Nesting,
    max_pending: Option<usize>,
    failed: bool,
}

impl StanzaFramer {
    /// `max_pending` bounds the bytes that may sit in the buffer without
    /// forming a complete span.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            base: 0,
            scanned: 0,
            nesting: Nesting::default(),
            max_pending,
            failed: false,
        }
    }

    /// Current element depth; 1 means "inside the stream, between stanzas".
    pub fn depth(&self) -> usize {
        self.nesting.depth
    }

    pub fn has_span(&self) -> bool {
        !self.nesting.spans.is_empty()
    }

    pub fn peek_span(&self) -> Option<&StanzaSpan> {
        self.nesting.spans.front()
    }

    /// Append a chunk received from the server and tokenize as far as the
    /// buffered bytes allow.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), FramerError> {
        if self.failed {
            return Err(FramerError::Failed);
        }
        self.buffer.extend_from_slice(data);

        if let Err(e) = self.scan() {
            self.failed = true;
            self.buffer.clear();
            self.nesting.spans.clear();
            return Err(e);
        }

        if let Some(max) = self.max_pending {
            let end = self.base + self.buffer.len() as u64;
            let pending = end - self.nesting.emitted_end.max(self.base);
            if pending > max as u64 {
                self.failed = true;
                return Err(FramerError::Overflow { pending, max });
            }
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<(), FramerError> {
        let origin = self.scanned;
        let unscanned = &self.buffer[(origin - self.base) as usize..];

        let mut reader = Reader::from_reader(unscanned);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;
        // Tokenizing resumes mid-document, so ends of elements opened in an
        // earlier chunk are unknown to the reader. Depth is tracked here.
        reader.config_mut().allow_unmatched_ends = true;

        loop {
            let rel_start = reader.buffer_position() as usize;
            let event = reader.read_event();
            let start = origin + rel_start as u64;
            let end = origin + reader.buffer_position() as u64;

            let outcome = match event {
                Ok(Event::Start(e)) => {
                    self.nesting
                        .on_start(e.name().local_name().as_ref() == b"stream", start, end)
                }
                Ok(Event::Empty(e)) => {
                    self.nesting
                        .on_empty(e.name().local_name().as_ref() == b"stream", start, end)
                }
                Ok(Event::End(e)) => {
                    self.nesting
                        .on_end(e.name().local_name().as_ref() == b"stream", start, end)
                }
                Ok(Event::Eof) => return Ok(()),
                // Declarations, text, comments and whitespace keepalives
                // never change depth.
                Ok(_) => Ok(()),
                Err(e) if is_incomplete(&e, &unscanned[rel_start..]) => return Ok(()),
                Err(e) => Err(e.to_string()),
            };

            if let Err(reason) = outcome {
                return Err(FramerError::Malformed {
                    offset: start,
                    reason,
                });
            }
            self.scanned = end;
        }
    }

    /// Remove the oldest complete span and return its bytes. Bytes between
    /// spans (whitespace, XML declarations) are dropped with it.
    pub fn next_span(&mut self) -> Option<(SpanKind, Bytes)> {
        let span = self.nesting.spans.pop_front()?;
        let skip = (span.start - self.base) as usize;
        let _ = self.buffer.split_to(skip);
        let bytes = self.buffer.split_to(span.len).freeze();
        self.base = span.start + span.len as u64;
        Some((span.kind, bytes))
    }

    /// Forget all tokenizer and buffer state and wait for a new stream
    /// header. Partially received stanzas are discarded.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.base = 0;
        self.scanned = 0;
        self.nesting = Nesting::default();
        self.failed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM_OPEN: &str = "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" xmlns=\"jabber:client\">";

    fn collect(framer: &mut StanzaFramer) -> Vec<(SpanKind, String)> {
        let mut out = Vec::new();
        while let Some((kind, bytes)) = framer.next_span() {
            out.push((kind, String::from_utf8(bytes.to_vec()).unwrap()));
        }
        out
    }

    fn frame_all(input: &str) -> Vec<(SpanKind, String)> {
        let mut framer = StanzaFramer::new(None);
        framer.feed(input.as_bytes()).unwrap();
        collect(&mut framer)
    }

    #[test]
    fn test_stream_open_stanza_close_in_order() {
        let spans = frame_all(&format!("{STREAM_OPEN}<msg/></stream:stream>"));
        assert_eq!(
            spans,
            vec![
                (SpanKind::StreamOpen, STREAM_OPEN.to_string()),
                (SpanKind::Stanza, "<msg/>".to_string()),
                (SpanKind::StreamClose, "</stream:stream>".to_string()),
            ]
        );
    }

    #[test]
    fn test_extract_stream_opening_without_declaration() {
        let input = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' version='1.0'>";
        let spans = frame_all(input);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].0, SpanKind::StreamOpen);
        // The XML declaration is not part of the stream header span
        assert!(spans[0].1.starts_with("<stream:stream"));
        assert!(spans[0].1.ends_with("version='1.0'>"));
    }

    #[test]
    fn test_extract_stream_features() {
        let features = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let spans = frame_all(&format!("{STREAM_OPEN}{features}"));
        // Should extract the ENTIRE <stream:features> element
        assert_eq!(spans[1], (SpanKind::Stanza, features.to_string()));
    }

    #[test]
    fn test_extract_multiple_stanzas_and_keepalives() {
        let spans = frame_all(&format!(
            "{STREAM_OPEN}<presence from='user@example.com'/> \n<message to='other@example.com'><body>Hello</body></message>"
        ));
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].1, "<presence from='user@example.com'/>");
        assert_eq!(
            spans[2].1,
            "<message to='other@example.com'><body>Hello</body></message>"
        );
    }

    #[test]
    fn test_extract_sm_stanzas() {
        // XEP-0198 Stream Management <r/> and <a/> are self-closing top-level stanzas
        let spans = frame_all(&format!(
            "{STREAM_OPEN}<r xmlns='urn:xmpp:sm:3'/><a xmlns='urn:xmpp:sm:3' h='5'/>"
        ));
        assert_eq!(spans[1].1, "<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(spans[2].1, "<a xmlns='urn:xmpp:sm:3' h='5'/>");
    }

    #[test]
    fn test_incomplete_stanza_waits_for_more_data() {
        let mut framer = StanzaFramer::new(None);
        framer
            .feed(format!("{STREAM_OPEN}<iq type='get'><query xmlns='jabber:iq:roster'>").as_bytes())
            .unwrap();
        assert_eq!(framer.next_span().map(|s| s.0), Some(SpanKind::StreamOpen));
        assert!(!framer.has_span());
        assert_eq!(framer.depth(), 3);

        framer.feed(b"</query></iq>").unwrap();
        let (kind, bytes) = framer.next_span().unwrap();
        assert_eq!(kind, SpanKind::Stanza);
        assert_eq!(
            &bytes[..],
            b"<iq type='get'><query xmlns='jabber:iq:roster'></query></iq>"
        );
        assert_eq!(framer.depth(), 1);
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk_feed() {
        let input = format!(
            "<?xml version='1.0'?>{STREAM_OPEN}<message type='chat'><body>a &amp; b</body><!-- note --><![CDATA[<raw>]]></message><presence/></stream:stream>"
        );
        let bulk = frame_all(&input);

        let mut framer = StanzaFramer::new(None);
        for byte in input.as_bytes() {
            framer.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(collect(&mut framer), bulk);
        assert_eq!(bulk.len(), 4);
    }

    #[test]
    fn test_spans_report_absolute_offsets() {
        let mut framer = StanzaFramer::new(None);
        framer
            .feed(format!("{STREAM_OPEN}  <presence/>").as_bytes())
            .unwrap();
        framer.next_span();
        assert_eq!(
            framer.peek_span(),
            Some(&StanzaSpan {
                kind: SpanKind::Stanza,
                start: STREAM_OPEN.len() as u64 + 2,
                len: "<presence/>".len(),
            })
        );
    }

    #[test]
    fn test_reset_behaves_like_new_framer() {
        let restart = format!("<?xml version='1.0'?>{STREAM_OPEN}<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");

        let mut framer = StanzaFramer::new(None);
        framer
            .feed(format!("{STREAM_OPEN}<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/><iq type='set'>").as_bytes())
            .unwrap();
        collect(&mut framer);

        assert!(starts_new_stream(restart.as_bytes()));
        framer.reset();
        assert_eq!(framer.depth(), 0);
        framer.feed(restart.as_bytes()).unwrap();

        assert_eq!(collect(&mut framer), frame_all(&restart));
    }

    #[test]
    fn test_nested_stream_open_resets_depth() {
        let spans = frame_all(&format!("{STREAM_OPEN}<iq>{STREAM_OPEN}<presence/>"));
        assert_eq!(
            spans.iter().map(|s| s.0).collect::<Vec<_>>(),
            vec![SpanKind::StreamOpen, SpanKind::StreamOpen, SpanKind::Stanza]
        );
    }

    #[test]
    fn test_malformed_xml_is_terminal() {
        let mut framer = StanzaFramer::new(None);
        let err = framer
            .feed(format!("{STREAM_OPEN}<!invalid markup>").as_bytes())
            .unwrap_err();
        assert!(matches!(err, FramerError::Malformed { .. }), "{err:?}");
        assert_eq!(framer.feed(b"<presence/>"), Err(FramerError::Failed));
        assert!(!framer.has_span());
    }

    #[test]
    fn test_stream_closed_by_foreign_end_tag() {
        let mut framer = StanzaFramer::new(None);
        let err = framer
            .feed(format!("{STREAM_OPEN}</message>").as_bytes())
            .unwrap_err();
        assert!(matches!(err, FramerError::Malformed { .. }));
    }

    #[test]
    fn test_stanza_outside_stream_is_rejected() {
        let mut framer = StanzaFramer::new(None);
        assert!(matches!(
            framer.feed(b"<presence/>"),
            Err(FramerError::Malformed { offset: 0, .. })
        ));
    }

    #[test]
    fn test_unbalanced_end_tag_is_rejected() {
        let mut framer = StanzaFramer::new(None);
        assert!(framer.feed(b"</message>").is_err());
    }

    #[test]
    fn test_pending_bytes_are_bounded() {
        let mut framer = StanzaFramer::new(Some(64));
        framer.feed(STREAM_OPEN.as_bytes()).unwrap();
        framer.feed(b"<message><body>").unwrap();
        let err = framer.feed(&[b'x'; 64]).unwrap_err();
        assert!(matches!(err, FramerError::Overflow { max: 64, .. }));
    }

    #[test]
    fn test_starts_new_stream_detection() {
        assert!(starts_new_stream(b"<?xml version='1.0'?><stream:stream>"));
        assert!(starts_new_stream(b"\r\n<stream:stream xmlns='jabber:client'>"));
        assert!(!starts_new_stream(b"<message/>"));
        assert!(!starts_new_stream(b"</stream:stream>"));
        assert!(!starts_new_stream(b""));
    }
}
