//! Shared streaming XML support for the three RRDP document parsers.
//!
//! `rrdpit`'s own `xml` module (`XmlReader`/`XmlWriter`/`Attributes`) wasn't
//! available to copy from, so this is rebuilt directly against `xml-rs`
//! (`extern crate xml as xmlrs`, exactly as `rrdpit` declares it), but aimed
//! at the opposite direction: `rrdpit` only ever *writes* RRDP XML, this
//! engine only ever *reads* it.
//!
//! ## Incremental feed strategy
//!
//! None of the pull-style XML crates available here expose a true
//! suspend/resume push API equivalent to expat's `XML_Parse(buf, len,
//! isFinal)` without driving the parse from a blocking thread, which the
//! concurrency model forbids. Instead, [`Feed`] buffers each
//! document's bytes -- the same buffer the session would need anyway to
//! hold undigested tail bytes between `poll()` wakeups -- and re-walks the
//! buffered prefix with `xmlrs::EventReader` on every feed, remembering how
//! many SAX events have already been dispatched to the handler so a given
//! start/end/characters event is only ever acted on once. Reaching the end
//! of the currently available bytes while a tag is still open is not a
//! parse error; it means "come back after the next read". Any other
//! rejection is a real parse error and moves the session to `ERROR`
//! immediately, without waiting for transport EOF.

use xmlrs::attribute::OwnedAttribute;
use xmlrs::name::OwnedName;
use xmlrs::reader::{EventReader, XmlEvent};

//------------ ParseError -----------------------------------------------------

/// A fatal rejection of a document's XML: bad grammar, an unrecognized or
/// missing attribute, an invalid number, or unexpected nesting.
///
/// This is the Rust analogue of calling `XML_StopParser` from an expat
/// handler: once raised, the session moves straight to `ERROR`.
#[derive(Clone, Debug, Display)]
#[display("{}", message)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError { message: message.into() }
    }

    pub fn unexpected_element(name: &str) -> Self {
        ParseError::new(format!("unexpected element: {}", name))
    }

    pub fn incomplete() -> Self {
        ParseError::new("document ended before all required elements were seen")
    }
}

impl std::error::Error for ParseError {}

impl From<AttributesError> for ParseError {
    fn from(e: AttributesError) -> Self {
        ParseError::new(e.to_string())
    }
}

//------------ Attributes -----------------------------------------------------

/// A start-tag's attribute list, consumed by name.
///
/// Mirrors the `take_req`/`take_opt`/`exhausted` idiom `rrdpit::rrdp` drives
/// its own XML decoding with: each lookup removes the matching attribute, so
/// order in the document never matters, and a non-empty leftover after the
/// element's known attributes have all been taken means the document used
/// an attribute the grammar doesn't recognize.
pub struct Attributes {
    attrs: Vec<OwnedAttribute>,
}

impl Attributes {
    fn new(attrs: Vec<OwnedAttribute>) -> Self {
        Attributes { attrs }
    }

    /// Takes a required attribute by name, failing if it is absent.
    pub fn take_req(&mut self, name: &str) -> Result<String, AttributesError> {
        self.take_opt(name).ok_or_else(|| AttributesError::Missing(name.to_string()))
    }

    /// Takes an optional attribute by name.
    pub fn take_opt(&mut self, name: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|a| a.name.local_name == name)?;
        Some(self.attrs.remove(pos).value)
    }

    /// Fails if any attribute other than the ones already taken remains.
    pub fn exhausted(&self) -> Result<(), AttributesError> {
        match self.attrs.first() {
            Some(a) => Err(AttributesError::Unexpected(a.name.local_name.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Display)]
pub enum AttributesError {
    #[display("missing required attribute: {}", _0)]
    Missing(String),

    #[display("unrecognized attribute: {}", _0)]
    Unexpected(String),
}

impl std::error::Error for AttributesError {}

//------------ ElementHandler --------------------------------------------------

/// The callback interface a document's scope state machine implements.
///
/// This plays the role of expat's element-start/element-end/character-data
/// handlers; the scope tracking itself (the enumerated per-document state
/// the design notes call for, never inferred from a stack of names) lives
/// entirely inside each implementor.
pub trait ElementHandler {
    fn start(&mut self, name: &OwnedName, attrs: Attributes) -> Result<(), ParseError>;
    fn end(&mut self, name: &OwnedName) -> Result<(), ParseError>;
    fn chars(&mut self, text: &str) -> Result<(), ParseError>;

    /// Whether the document's scope has reached its terminal state (the
    /// closing tag of the root element has been seen). Checked at
    /// transport EOF: a document that stops short of this is truncated.
    fn finished(&self) -> bool;
}

//------------ Feed -------------------------------------------------------------

/// Drives an [`ElementHandler`] over a document whose bytes arrive in
/// arbitrarily-sized chunks across multiple `poll()` wakeups.
pub struct Feed<H: ElementHandler> {
    buf: Vec<u8>,
    dispatched: usize,
    handler: H,
}

impl<H: ElementHandler> Feed<H> {
    pub fn new(handler: H) -> Self {
        Feed { buf: Vec::new(), dispatched: 0, handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Appends `data` to the document buffer and dispatches any new,
    /// complete SAX events to the handler.
    ///
    /// Returns `Ok(())` both when events were dispatched successfully and
    /// when the buffered prefix simply doesn't yet contain a complete next
    /// event (the caller should come back after the next read). Returns
    /// `Err` only for a genuine grammar/attribute/nesting rejection.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.buf.extend_from_slice(data);
        let reader = EventReader::new(std::io::Cursor::new(&self.buf));
        let mut idx = 0usize;
        for event in reader {
            if idx < self.dispatched {
                idx += 1;
                continue;
            }
            match event {
                Ok(XmlEvent::StartElement { name, attributes, .. }) => {
                    self.handler.start(&name, Attributes::new(attributes))?;
                }
                Ok(XmlEvent::EndElement { name }) => {
                    self.handler.end(&name)?;
                }
                Ok(XmlEvent::Characters(text)) | Ok(XmlEvent::CData(text)) => {
                    self.handler.chars(&text)?;
                }
                Ok(XmlEvent::Whitespace(_))
                | Ok(XmlEvent::StartDocument { .. })
                | Ok(XmlEvent::EndDocument)
                | Ok(XmlEvent::ProcessingInstruction { .. })
                | Ok(XmlEvent::Comment(_)) => {}
                Err(e) => {
                    if is_incomplete(&e) {
                        return Ok(());
                    }
                    return Err(ParseError::new(e.to_string()));
                }
            }
            idx += 1;
            self.dispatched = idx;
        }
        Ok(())
    }
}

/// Tells apart "the document is truncated so far, come back later" from a
/// real syntax error. `xml-rs` doesn't expose a dedicated variant we can
/// match on across versions, so this matches the message it's known to
/// produce for a stream that ends mid-element.
fn is_incomplete(err: &xmlrs::reader::Error) -> bool {
    let msg = err.to_string();
    msg.contains("Unexpected end of stream") || msg.contains("UnexpectedEof")
        || msg.contains("unexpected eof")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        events: Vec<String>,
        finished: bool,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder { events: Vec::new(), finished: false }
        }
    }

    impl ElementHandler for Recorder {
        fn start(&mut self, name: &OwnedName, _attrs: Attributes) -> Result<(), ParseError> {
            self.events.push(format!("start:{}", name.local_name));
            Ok(())
        }

        fn end(&mut self, name: &OwnedName) -> Result<(), ParseError> {
            self.events.push(format!("end:{}", name.local_name));
            if name.local_name == "root" {
                self.finished = true;
            }
            Ok(())
        }

        fn chars(&mut self, text: &str) -> Result<(), ParseError> {
            if !text.trim().is_empty() {
                self.events.push(format!("chars:{}", text));
            }
            Ok(())
        }

        fn finished(&self) -> bool {
            self.finished
        }
    }

    #[test]
    fn feed_dispatches_each_event_exactly_once_across_chunks() {
        let mut feed = Feed::new(Recorder::new());
        let doc = b"<root><child>hello</child></root>";
        // Split well short of a complete next element each time, to
        // exercise the "come back after the next read" path.
        feed.feed(&doc[..10]).unwrap();
        feed.feed(&doc[10..20]).unwrap();
        feed.feed(&doc[20..]).unwrap();

        assert!(feed.handler().finished());
        assert_eq!(
            feed.handler().events,
            vec!["start:root", "start:child", "chars:hello", "end:child", "end:root"],
        );
    }

    #[test]
    fn malformed_xml_is_a_parse_error_not_silently_ignored() {
        let mut feed = Feed::new(Recorder::new());
        assert!(feed.feed(b"<root></mismatched>").is_err());
    }

    #[test]
    fn a_document_truncated_mid_element_is_not_yet_an_error() {
        let mut feed = Feed::new(Recorder::new());
        assert!(feed.feed(b"<root><child>hel").is_ok());
        assert!(!feed.handler().finished());
    }

    #[test]
    fn attributes_take_req_removes_so_order_does_not_matter() {
        let attrs = Attributes::new(vec![
            OwnedAttribute { name: OwnedName::local("b"), value: "2".into() },
            OwnedAttribute { name: OwnedName::local("a"), value: "1".into() },
        ]);
        let mut attrs = attrs;
        assert_eq!(attrs.take_req("a").unwrap(), "1");
        assert_eq!(attrs.take_req("b").unwrap(), "2");
        assert!(attrs.exhausted().is_ok());
    }

    #[test]
    fn attributes_exhausted_rejects_unrecognized_leftovers() {
        let mut attrs = Attributes::new(vec![OwnedAttribute { name: OwnedName::local("extra"), value: "x".into() }]);
        assert!(attrs.exhausted().is_err());
    }
}
