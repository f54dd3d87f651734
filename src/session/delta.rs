//! The delta document parser.

use xmlrs::name::OwnedName;

use crate::hash::{self, Sha256Hash};
use crate::publish::{PublishRecord, PublishType};
use crate::xml::{Attributes, ElementHandler, ParseError};

use super::notification::MAX_VERSION;
use super::snapshot::Emitted;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Scope {
    Start,
    Delta,
    Publish,
    Withdraw,
    End,
}

/// Streaming parser for a delta document.
///
/// Constructed with the `session_id` and the one `serial` this delta is
/// required to carry: a delta is only meaningful as the next increment
/// after the one the session driver is currently at.
pub struct DeltaHandler {
    scope: Scope,
    expected_session_id: String,
    expected_serial: i64,
    current: Option<PublishRecord>,
    pub emitted: Vec<Emitted>,
}

impl DeltaHandler {
    pub fn new(expected_session_id: String, expected_serial: i64) -> Self {
        DeltaHandler {
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

impl ElementHandler for DeltaHandler {
    fn start(&mut self, name: &OwnedName, mut attrs: Attributes) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Start, "delta") => {
                attrs.take_req("xmlns")?;
                let version: u32 = attrs
                    .take_req("version")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid version"))?;
                if version == 0 || version > MAX_VERSION {
                    return Err(ParseError::new("unsupported delta version"));
                }
                let session_id = attrs.take_req("session_id")?;
                let serial: i64 = attrs
                    .take_req("serial")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid serial"))?;
                attrs.exhausted()?;
                if session_id != self.expected_session_id || serial != self.expected_serial {
                    return Err(ParseError::new("delta session_id/serial does not match expectation"));
                }
                self.scope = Scope::Delta;
                Ok(())
            }
            (Scope::Delta, "publish") => {
                let uri = attrs.take_req("uri")?;
                let expected_hash: Option<Sha256Hash> = match attrs.take_opt("hash") {
                    Some(h) => Some(hash::hex_decode(&h).map_err(|e| ParseError::new(e.to_string()))?),
                    None => None,
                };
                attrs.exhausted()?;
                let kind = if expected_hash.is_some() { PublishType::Update } else { PublishType::Add };
                self.current = Some(PublishRecord::new(kind, uri, expected_hash));
                self.scope = Scope::Publish;
                Ok(())
            }
            (Scope::Delta, "withdraw") => {
                let uri = attrs.take_req("uri")?;
                let expected_hash = hash::hex_decode(&attrs.take_req("hash")?)
                    .map_err(|e| ParseError::new(e.to_string()))?;
                attrs.exhausted()?;
                self.current = Some(PublishRecord::new(PublishType::Withdraw, uri, Some(expected_hash)));
                self.scope = Scope::Withdraw;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn end(&mut self, name: &OwnedName) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Publish, "publish") | (Scope::Withdraw, "withdraw") => {
                let record = self.current.take().expect("scope guarantees a current record");
                let (publish_type, uri, expected_hash, body) = record
                    .finish()
                    .map_err(|e| ParseError::new(format!("base64 decode failed: {}", e)))?;
                self.emitted.push(Emitted { publish_type, uri, expected_hash, body });
                self.scope = Scope::Delta;
                Ok(())
            }
            (Scope::Delta, "delta") => {
                self.scope = Scope::End;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn chars(&mut self, text: &str) -> Result<(), ParseError> {
        if self.scope == Scope::Publish {
            if let Some(record) = self.current.as_mut() {
                record.push_chars(text);
            }
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.scope == Scope::End
    }
}
