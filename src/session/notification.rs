//! The notification document parser and the snapshot/delta decision.

use xmlrs::name::OwnedName;

use crate::hash::{self, Sha256Hash};
use crate::xml::{Attributes, ElementHandler, ParseError};

pub const MAX_VERSION: u32 = 1;
const MAX_SERIAL: i64 = i64::MAX;

/// One `<delta>` entry advertised by the notification, kept in a list
/// sorted by `serial` ascending.
#[derive(Clone, Debug)]
pub struct DeltaDescriptor {
    pub serial: i64,
    pub uri: String,
    pub hash: Sha256Hash,
}

/// The XML nesting scope, tracked explicitly rather than inferred from a
/// stack of element names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Scope {
    Start,
    Notification,
    Snapshot,
    PostSnapshot,
    Delta,
    End,
}

/// Streaming parser for a notification document.
///
/// Constructed with the repository's known-good `(session_id?, serial)` so
/// that stale deltas can be discarded as they arrive rather than held onto
/// for no reason, and so [`into_result`] can run the decision in §4.2
/// immediately once the document is finished.
pub struct NotificationHandler {
    scope: Scope,
    repo_session_id: Option<String>,
    repo_serial: i64,

    version: Option<u32>,
    session_id: Option<String>,
    serial: Option<i64>,
    snapshot_uri: Option<String>,
    snapshot_hash: Option<Sha256Hash>,
    deltas: Vec<DeltaDescriptor>,
}

impl NotificationHandler {
    pub fn new(repo_session_id: Option<String>, repo_serial: i64) -> Self {
        NotificationHandler {
            scope: Scope::Start,
            repo_session_id,
            repo_serial,
            version: None,
            session_id: None,
            serial: None,
            snapshot_uri: None,
            snapshot_hash: None,
            deltas: Vec::new(),
        }
    }

    /// Inserts a delta, keeping the list sorted by serial and rejecting
    /// serials at or below the repository's known serial (they can't
    /// contribute) and exact duplicates (logged and skipped, not a fatal
    /// parse error).
    fn insert_delta(&mut self, d: DeltaDescriptor) {
        if d.serial <= self.repo_serial {
            return;
        }
        match self.deltas.binary_search_by_key(&d.serial, |existing| existing.serial) {
            Ok(_) => {
                log::warn!("duplicate delta serial {} in notification, skipping", d.serial);
            }
            Err(pos) => self.deltas.insert(pos, d),
        }
    }

    pub fn deltas(&self) -> &[DeltaDescriptor] {
        &self.deltas
    }

    /// Runs the notification decision (§4.2) now that the document is
    /// fully parsed, consuming the handler.
    pub fn into_decision(self) -> Result<Decision, ParseError> {
        let session_id = self.session_id.ok_or_else(ParseError::incomplete)?;
        let serial = self.serial.ok_or_else(ParseError::incomplete)?;
        let snapshot_uri = self.snapshot_uri.ok_or_else(ParseError::incomplete)?;
        let snapshot_hash = self.snapshot_hash.ok_or_else(ParseError::incomplete)?;

        let decision = decide(
            self.repo_session_id.as_deref(),
            self.repo_serial,
            &session_id,
            serial,
            self.deltas.iter().map(|d| d.serial),
        );

        Ok(Decision {
            kind: decision,
            session_id,
            serial,
            snapshot_uri,
            snapshot_hash,
            deltas: self.deltas,
        })
    }
}

/// The outcome of parsing plus deciding: everything downstream needs to
/// act on the chosen path, regardless of which path was chosen.
pub struct Decision {
    pub kind: DecisionKind,
    pub session_id: String,
    pub serial: i64,
    pub snapshot_uri: String,
    pub snapshot_hash: Sha256Hash,
    pub deltas: Vec<DeltaDescriptor>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecisionKind {
    None,
    Snapshot,
    Deltas,
}

/// The pure decision function (§4.2, property 4): same inputs always
/// produce the same decision, independent of any session or I/O state.
pub fn decide(
    repo_session_id: Option<&str>,
    repo_serial: i64,
    notif_session_id: &str,
    notif_serial: i64,
    delta_serials: impl Iterator<Item = i64>,
) -> DecisionKind {
    let same_session = repo_session_id == Some(notif_session_id);

    if same_session && notif_serial == repo_serial {
        return DecisionKind::None;
    }
    if repo_session_id.is_none() || !same_session {
        return DecisionKind::Snapshot;
    }
    if notif_serial < repo_serial {
        return DecisionKind::Snapshot;
    }
    // same_session && notif_serial > repo_serial: contiguity check.
    let expected = (repo_serial + 1)..=notif_serial;
    if delta_serials.eq(expected) {
        DecisionKind::Deltas
    } else {
        DecisionKind::Snapshot
    }
}

impl ElementHandler for NotificationHandler {
    fn start(&mut self, name: &OwnedName, mut attrs: Attributes) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Start, "notification") => {
                attrs.take_req("xmlns")?;
                let version: u32 = attrs
                    .take_req("version")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid version"))?;
                if version == 0 || version > MAX_VERSION {
                    return Err(ParseError::new("unsupported notification version"));
                }
                let session_id = attrs.take_req("session_id")?;
                let serial: i64 = attrs
                    .take_req("serial")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid serial"))?;
                if serial < 1 || serial > MAX_SERIAL {
                    return Err(ParseError::new("serial out of range"));
                }
                attrs.exhausted()?;
                self.version = Some(version);
                self.session_id = Some(session_id);
                self.serial = Some(serial);
                self.scope = Scope::Notification;
                Ok(())
            }
            (Scope::Notification, "snapshot") => {
                let uri = attrs.take_req("uri")?;
                let hash = hash::hex_decode(&attrs.take_req("hash")?)
                    .map_err(|e| ParseError::new(e.to_string()))?;
                attrs.exhausted()?;
                self.snapshot_uri = Some(uri);
                self.snapshot_hash = Some(hash);
                self.scope = Scope::Snapshot;
                Ok(())
            }
            (Scope::PostSnapshot, "delta") => {
                let uri = attrs.take_req("uri")?;
                let hash = hash::hex_decode(&attrs.take_req("hash")?)
                    .map_err(|e| ParseError::new(e.to_string()))?;
                let serial: i64 = attrs
                    .take_req("serial")?
                    .parse()
                    .map_err(|_| ParseError::new("invalid delta serial"))?;
                if serial < 1 || serial > MAX_SERIAL {
                    return Err(ParseError::new("delta serial out of range"));
                }
                attrs.exhausted()?;
                self.insert_delta(DeltaDescriptor { serial, uri, hash });
                self.scope = Scope::Delta;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn end(&mut self, name: &OwnedName) -> Result<(), ParseError> {
        match (self.scope, name.local_name.as_str()) {
            (Scope::Snapshot, "snapshot") => {
                self.scope = Scope::PostSnapshot;
                Ok(())
            }
            (Scope::Delta, "delta") => {
                self.scope = Scope::PostSnapshot;
                Ok(())
            }
            (Scope::PostSnapshot, "notification") => {
                self.scope = Scope::End;
                Ok(())
            }
            _ => Err(ParseError::unexpected_element(&name.local_name)),
        }
    }

    fn chars(&mut self, _text: &str) -> Result<(), ParseError> {
        Ok(())
    }

    fn finished(&self) -> bool {
        self.scope == Scope::End
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> Sha256Hash {
        [b; 32]
    }

    #[test]
    fn decide_none_when_unchanged() {
        assert_eq!(decide(Some("A"), 5, "A", 5, std::iter::empty()), DecisionKind::None);
    }

    #[test]
    fn decide_snapshot_on_first_sync() {
        assert_eq!(decide(None, 0, "A", 5, std::iter::empty()), DecisionKind::Snapshot);
    }

    #[test]
    fn decide_snapshot_on_session_change() {
        assert_eq!(decide(Some("A"), 5, "B", 1, std::iter::empty()), DecisionKind::Snapshot);
    }

    #[test]
    fn decide_snapshot_on_stale_serial() {
        assert_eq!(decide(Some("A"), 5, "A", 3, std::iter::empty()), DecisionKind::Snapshot);
    }

    #[test]
    fn decide_deltas_on_contiguous_range() {
        assert_eq!(decide(Some("A"), 5, "A", 7, [6, 7].into_iter()), DecisionKind::Deltas);
    }

    #[test]
    fn decide_snapshot_on_delta_gap() {
        assert_eq!(decide(Some("A"), 5, "A", 7, [7].into_iter()), DecisionKind::Snapshot);
    }

    #[test]
    fn delta_insertion_rejects_duplicates_and_stale() {
        let mut n = NotificationHandler::new(Some("A".to_string()), 5);
        n.insert_delta(DeltaDescriptor { serial: 6, uri: "u6".into(), hash: h(1) });
        n.insert_delta(DeltaDescriptor { serial: 6, uri: "dup".into(), hash: h(2) });
        n.insert_delta(DeltaDescriptor { serial: 5, uri: "stale".into(), hash: h(3) });
        n.insert_delta(DeltaDescriptor { serial: 7, uri: "u7".into(), hash: h(4) });
        let serials: Vec<i64> = n.deltas().iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec![6, 7]);
    }
}
