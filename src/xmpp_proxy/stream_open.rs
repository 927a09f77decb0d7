//! Discovery of the target XMPP domain from the browser's stream header.
//!
//! Until the browser has opened its `<stream:stream>`, the gateway does not
//! know which server to connect to. The detector watches the first browser
//! messages for the stream root in the `http://etherx.jabber.org/streams`
//! namespace and captures its `to` attribute.

use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use thiserror::Error;

/// Namespace of the XMPP stream root element.
pub const STREAMS_NS: &[u8] = b"http://etherx.jabber.org/streams";

/// Bytes the detector accepts before giving up on seeing a stream header.
const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("malformed stream header: {0}")]
    Malformed(String),
    #[error("no stream header within the first {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Default)]
pub struct StreamOpenDetector {
    buffer: Vec<u8>,
    saw_stream: bool,
    target: Option<String>,
}

impl StreamOpenDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the stream root has been parsed, whether or not it named a
    /// target.
    pub fn saw_stream(&self) -> bool {
        self.saw_stream
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// The `to` domain of the stream header.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Feed one browser message. Input after the stream header is ignored.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), DetectorError> {
        if self.saw_stream {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_HEADER_BYTES {
            return Err(DetectorError::TooLarge(MAX_HEADER_BYTES));
        }

        let found = {
            let mut reader = NsReader::from_reader(self.buffer.as_slice());
            reader.config_mut().trim_text(true);
            reader.config_mut().allow_unmatched_ends = true;

            loop {
                let pos = reader.buffer_position() as usize;
                match reader.read_resolved_event() {
                    Ok((ResolveResult::Bound(Namespace(ns)), Event::Start(e) | Event::Empty(e)))
                        if ns == STREAMS_NS && e.local_name().as_ref() == b"stream" =>
                    {
                        let to = e
                            .try_get_attribute("to")
                            .map_err(|err| DetectorError::Malformed(err.to_string()))?;
                        let to = match to {
                            Some(attr) => attr
                                .unescape_value()
                                .map_err(|err| DetectorError::Malformed(err.to_string()))?
                                .trim()
                                .to_string(),
                            None => String::new(),
                        };
                        break Some(to);
                    }
                    Ok((_, Event::Eof)) => break None,
                    Ok(_) => {}
                    Err(XmlError::Syntax(
                        SyntaxError::UnclosedTag
                        | SyntaxError::UnclosedPIOrXmlDecl
                        | SyntaxError::UnclosedComment,
                    )) => break None,
                    Err(e) => {
                        return Err(DetectorError::Malformed(format!("{e} at offset {pos}")));
                    }
                }
            }
        };

        if let Some(to) = found {
            self.saw_stream = true;
            self.target = (!to.is_empty()).then_some(to);
            self.buffer = Vec::new();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_prefixed_stream_header() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<stream:stream to='example.com' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        assert!(detector.has_target());
        assert_eq!(detector.target(), Some("example.com"));
    }

    #[test]
    fn test_detects_default_namespace_stream_header() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<?xml version='1.0'?><stream xmlns=\"http://etherx.jabber.org/streams\" to=\"jabber.org\">")
            .unwrap();
        assert_eq!(detector.target(), Some("jabber.org"));
    }

    #[test]
    fn test_header_split_across_messages() {
        let mut detector = StreamOpenDetector::new();
        detector.feed(b"<?xml version='1.0'?>").unwrap();
        detector.feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/str").unwrap();
        assert!(!detector.saw_stream());
        detector.feed(b"eams' to='chat.example.org'>").unwrap();
        assert_eq!(detector.target(), Some("chat.example.org"));
    }

    #[test]
    fn test_wrong_namespace_is_ignored() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<stream:stream xmlns:stream='urn:example:not-xmpp' to='evil.example'>")
            .unwrap();
        assert!(!detector.saw_stream());
        assert!(!detector.has_target());
    }

    #[test]
    fn test_stream_without_to_attribute() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
            .unwrap();
        assert!(detector.saw_stream());
        assert!(!detector.has_target());
        assert_eq!(detector.target(), None);
    }

    #[test]
    fn test_escaped_target_is_unescaped() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' to=' a&amp;b.example '>")
            .unwrap();
        assert_eq!(detector.target(), Some("a&b.example"));
    }

    #[test]
    fn test_input_after_header_is_ignored() {
        let mut detector = StreamOpenDetector::new();
        detector
            .feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='one.example'>")
            .unwrap();
        detector
            .feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='two.example'>")
            .unwrap();
        assert_eq!(detector.target(), Some("one.example"));
    }

    #[test]
    fn test_malformed_header_is_an_error() {
        let mut detector = StreamOpenDetector::new();
        assert!(matches!(
            detector.feed(b"<!bogus declaration>"),
            Err(DetectorError::Malformed(_))
        ));
    }

    #[test]
    fn test_header_size_is_bounded() {
        let mut detector = StreamOpenDetector::new();
        let filler = vec![b' '; MAX_HEADER_BYTES + 1];
        assert_eq!(
            detector.feed(&filler),
            Err(DetectorError::TooLarge(MAX_HEADER_BYTES))
        );
    }
}
