//! The snapshot document parser.

use xmlrs::name::OwnedName;

use crate::hash::Sha256Hash;
use crate::publish::{PublishRecord, PublishType};
use crate::xml::{Attributes, ElementHandler, ParseError};

use super::notification::MAX_VERSION;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Scope {
    Start,
    Snapshot,
    Publish,
    End,
}

/// One decoded `<publish>` ready to forward to the parent as a `FILE`
/// message, in document order.
pub struct Emitted {
    pub publish_type: PublishType,
    pub uri: String,
    pub expected_hash: Option<Sha256Hash>,
    pub body: bytes::Bytes,
}

/// Streaming parser for a snapshot document.
///
/// Constructed with the `session_id`/`serial` the notification advertised,
/// since a snapshot is only valid evidence for the exact version it claims
/// to be.
pub struct SnapshotHandler {
    scope: Scope,
    expected_session_id: String,
    expected_serial: i64,
    current: Option<PublishRecord>,
    pub emitted: Vec<Emitted>,
}

impl SnapshotHandler {
    pub fn new(expected_session_id: String, expected_serial: i64) -> Self {
        SnapshotHandler {
            scope: Scope::Start,
            expected_session_id,
            expected_serial,
            current: None,
            emitted: Vec::new(),
        }
    }

    pub fn take_emitted(&mut self) -> Vec<Emitted> {
        std::mem::take(&mut self.emitted)
    }
}

impl ElementHandler for SnapshotHandler {
    fn start(&mut self, name: &OwnedName, mut attrs: Attributes) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Start, "snapshot") => {
                attrs.take_req("xmlns")?;
                let version: u32 = attrs
                    .take_req("version")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid version"))?;
                if version == 0 || version > MAX_VERSION {
                    return Err(ParseError::new("unsupported snapshot version"));
                }
                let session_id = attrs.take_req("session_id")?;
                let serial: i64 = attrs
                    .take_req("serial")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid serial"))?;
                attrs.exhausted()?;
                if session_id != self.expected_session_id || serial != self.expected_serial {
                    return Err(ParseError::new("snapshot session_id/serial does not match notification"));
                }
                self.scope = Scope::Snapshot;
                Ok(())
            }
            (Scope::Snapshot, "publish") => {
                let uri = attrs.take_req("uri")?;
                if attrs.take_opt("hash").is_some() {
                    return Err(ParseError::new("snapshot <publish> must not carry a hash"));
                }
                attrs.exhausted()?;
                self.current = Some(PublishRecord::new(PublishType::Add, uri, None));
                self.scope = Scope::Publish;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn end(&mut self, name: &OwnedName) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Publish, "publish") => {
                let record = self.current.take().expect("scope guarantees a current record");
                let (publish_type, uri, expected_hash, body) = record
                    .finish()
                    .map_err(|e| ParseError::new(format!("base64 decode failed: {}", e)))?;
                self.emitted.push(Emitted { publish_type, uri, expected_hash, body });
                self.scope = Scope::Snapshot;
                Ok(())
            }
            (Scope::Snapshot, "snapshot") => {
                self.scope = Scope::End;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn chars(&mut self, text: &str) -> Result<(), ParseError> {
        if let Some(record) = self.current.as_mut() {
            record.push_chars(text);
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.scope == Scope::End
    }
}
