//! The per-session state machine (the session driver).

pub mod delta;
pub mod notification;
pub mod snapshot;

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;

use crate::error::Failed;
use crate::hash::{Sha256Ctx, Sha256Hash};
use crate::xml::Feed;

use delta::DeltaHandler;
use notification::{DecisionKind, NotificationHandler};
use snapshot::{Emitted, SnapshotHandler};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Req,
    Waiting,
    Parsing,
    Parsed,
    Error,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Task {
    Notification,
    Snapshot,
    Delta,
}

/// The known-good or in-progress `(session_id?, serial, last_mod?)` triple.
#[derive(Clone, Debug, Default)]
pub struct RepoState {
    pub session_id: Option<String>,
    pub serial: i64,
    pub last_mod: Option<String>,
}

/// What to do once every pending `FILE` ack for the session's last
/// document has drained, decided at `HTTP_FIN` time but carried out later
/// when `file_pending` reaches zero.
struct PendingFinish {
    ok: bool,
    emit_session: bool,
}

enum ActiveParser {
    Notification(Feed<NotificationHandler>),
    Snapshot(Feed<SnapshotHandler>),
    Delta(Feed<DeltaHandler>),
}

/// One RRDP synchronization session, from `START` to retirement.
pub struct Session {
    pub id: u64,
    pub notify_uri: String,
    pub local_label: String,
    pub repository: RepoState,
    pub current: RepoState,

    pub state: SessionState,
    pub task: Task,
    pub in_fd: Option<OwnedFd>,

    pub file_pending: u32,
    pub file_failed: u32,

    hash: Sha256Hash,
    hash_ctx: Sha256Ctx,
    parser: Option<ActiveParser>,

    snapshot_uri: String,
    snapshot_hash: Sha256Hash,
    deltas: Vec<notification::DeltaDescriptor>,
    delta_idx: usize,

    pending_finish: Option<PendingFinish>,
    fetched_uri: String,
}

/// What the caller should do right after a state transition.
pub enum FinOutcome {
    /// The session moved back to `REQ`; the multiplexer will issue its
    /// next `HTTP_REQ` on the following loop iteration.
    GoReq,
    /// The session's terminal outcome is known but held back until
    /// `file_pending` drains to zero.
    Deferred,
    /// The session is ready to retire right now: emit `SESSION` (if
    /// `emit_session`) then `END ok=<ok>` and drop it from the table.
    Retire { ok: bool, emit_session: bool },
}

impl Session {
    pub fn new(id: u64, local_label: String, notify_uri: String, repository: RepoState) -> Self {
        Session {
            id,
            notify_uri,
            local_label,
            current: repository.clone(),
            repository,
            state: SessionState::Req,
            task: Task::Notification,
            in_fd: None,
            file_pending: 0,
            file_failed: 0,
            hash: [0u8; 32],
            hash_ctx: Sha256Ctx::new(),
            parser: None,
            snapshot_uri: String::new(),
            snapshot_hash: [0u8; 32],
            deltas: Vec::new(),
            delta_idx: 0,
            pending_finish: None,
            fetched_uri: String::new(),
        }
    }

    /// The `(uri, last_mod)` pair to send in this session's next
    /// `HTTP_REQ`, and marks the transition REQ → WAITING.
    pub fn next_http_req(&mut self) -> (String, String) {
        debug_assert_eq!(self.state, SessionState::Req);
        let (uri, last_mod) = match self.task {
            Task::Notification => (self.notify_uri.clone(), self.repository.last_mod.clone().unwrap_or_default()),
            Task::Snapshot => (self.snapshot_uri.clone(), String::new()),
            Task::Delta => (self.deltas[self.delta_idx].uri.clone(), String::new()),
        };
        self.fetched_uri = uri.clone();
        self.state = SessionState::Waiting;
        (uri, last_mod)
    }

    /// `HTTP_INI`: the parent handed over a readable transport descriptor.
    /// WAITING → PARSING.
    pub fn on_http_ini(&mut self, fd: OwnedFd) -> Result<(), Failed> {
        if self.state != SessionState::Waiting {
            log::error!("session {}: HTTP_INI received in state {:?}", self.id, self.state);
            return Err(Failed);
        }
        self.in_fd = Some(fd);
        self.hash_ctx = Sha256Ctx::new();
        self.hash = match self.task {
            Task::Notification => [0u8; 32],
            Task::Snapshot => self.snapshot_hash,
            Task::Delta => self.deltas[self.delta_idx].hash,
        };
        self.parser = Some(match self.task {
            Task::Notification => ActiveParser::Notification(Feed::new(NotificationHandler::new(
                self.repository.session_id.clone(),
                self.repository.serial,
            ))),
            Task::Snapshot => ActiveParser::Snapshot(Feed::new(SnapshotHandler::new(
                self.current.session_id.clone().unwrap_or_default(),
                self.current.serial,
            ))),
            Task::Delta => ActiveParser::Delta(Feed::new(DeltaHandler::new(
                self.current.session_id.clone().unwrap_or_default(),
                self.deltas[self.delta_idx].serial,
            ))),
        });
        self.state = SessionState::Parsing;
        Ok(())
    }

    /// A chunk of document bytes arrived on `in_fd`. Updates the running
    /// digest for non-notification tasks and feeds the XML parser.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state != SessionState::Parsing {
            return;
        }
        if self.task != Task::Notification {
            self.hash_ctx.update(data);
        }
        let result = match self.parser.as_mut() {
            Some(ActiveParser::Notification(f)) => f.feed(data),
            Some(ActiveParser::Snapshot(f)) => f.feed(data),
            Some(ActiveParser::Delta(f)) => f.feed(data),
            None => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("session {}: XML parse error: {}", self.id, e);
            self.state = SessionState::Error;
        }
    }

    /// Transport EOF: closes `in_fd` and, for PARSING sessions, decides
    /// PARSED vs ERROR based on whether the document's grammar reached its
    /// terminal scope and, for non-notification tasks, whether the digest
    /// matches the expected hash.
    pub fn on_eof(&mut self) {
        self.in_fd = None;
        if self.state != SessionState::Parsing {
            return;
        }
        let finished = match self.parser.as_ref() {
            Some(ActiveParser::Notification(f)) => f.handler().finished(),
            Some(ActiveParser::Snapshot(f)) => f.handler().finished(),
            Some(ActiveParser::Delta(f)) => f.handler().finished(),
            None => false,
        };
        if !finished {
            log::warn!("session {}: document truncated", self.id);
            self.state = SessionState::Error;
            return;
        }
        if self.task != Task::Notification {
            let digest = std::mem::replace(&mut self.hash_ctx, Sha256Ctx::new()).finish();
            if !crate::hash::hash_eq(&digest, &self.hash) {
                log::warn!("session {}: digest mismatch on {}", self.id, self.fetched_uri);
                self.state = SessionState::Error;
                return;
            }
        }
        self.state = SessionState::Parsed;
    }

    /// A `read()` on `in_fd` returned an error (negative errno in the
    /// C source this was distilled from). The fd is already beyond
    /// saving; close it and mark the session errored so the eventual
    /// `HTTP_FIN` the parent still owes this request applies the usual
    /// failure/snapshot-fallback policy -- this keeps the at-most-one-
    /// outstanding-request invariant intact instead of issuing a new
    /// `HTTP_REQ` before that `HTTP_FIN` arrives.
    pub fn fail_transport(&mut self) {
        self.in_fd = None;
        self.state = SessionState::Error;
    }

    /// Returns the publish records emitted by the document that just
    /// finished parsing, in document order, each tagged with this
    /// session's id so the caller can build `FILE` messages.
    fn drain_emitted(&mut self) -> Vec<Emitted> {
        match self.parser.as_mut() {
            Some(ActiveParser::Snapshot(f)) => f.handler_mut().take_emitted(),
            Some(ActiveParser::Delta(f)) => f.handler_mut().take_emitted(),
            _ => Vec::new(),
        }
    }

    /// `HTTP_FIN`: dispatches by task and current state, per the state
    /// table. `emitted` receives any `FILE`-worthy publish records the
    /// caller must forward to the parent before acting on the returned
    /// [`FinOutcome`].
    pub fn dispatch_http_fin(
        &mut self,
        http_status: i32,
        last_mod: String,
        emitted: &mut Vec<Emitted>,
    ) -> Result<FinOutcome, Failed> {
        if self.state == SessionState::Parsing {
            log::warn!("session {}: HTTP_FIN arrived while still parsing", self.id);
            self.on_eof();
        }

        if self.task == Task::Notification && http_status == 304 {
            return Ok(self.finish(true, false));
        }

        if self.state == SessionState::Error {
            return Ok(self.fail_or_fallback_to_snapshot());
        }

        if http_status != 200 {
            log::warn!("session {}: HTTP status {}", self.id, http_status);
            self.state = SessionState::Error;
            return Ok(self.fail_or_fallback_to_snapshot());
        }

        if self.state != SessionState::Parsed {
            log::error!("session {}: HTTP_FIN in unexpected state {:?}", self.id, self.state);
            return Err(Failed);
        }

        match self.task {
            Task::Notification => self.dispatch_notification_fin(last_mod),
            Task::Snapshot => {
                emitted.extend(self.drain_emitted());
                self.file_pending += emitted.len() as u32;
                Ok(self.finish(true, true))
            }
            Task::Delta => {
                emitted.extend(self.drain_emitted());
                self.file_pending += emitted.len() as u32;
                self.delta_idx += 1;
                if self.delta_idx < self.deltas.len() {
                    self.hash = self.deltas[self.delta_idx].hash;
                    self.state = SessionState::Req;
                    Ok(FinOutcome::GoReq)
                } else {
                    Ok(self.finish(true, true))
                }
            }
        }
    }

    fn dispatch_notification_fin(&mut self, last_mod: String) -> Result<FinOutcome, Failed> {
        let parser = match self.parser.take() {
            Some(ActiveParser::Notification(f)) => f,
            _ => {
                log::error!("session {}: notification FIN without a notification parser", self.id);
                return Err(Failed);
            }
        };
        let decision = parser
            .into_handler()
            .into_decision()
            .map_err(|e| {
                log::warn!("session {}: {}", self.id, e);
            })
            .unwrap_or(notification::Decision {
                kind: DecisionKind::Snapshot,
                session_id: String::new(),
                serial: 0,
                snapshot_uri: String::new(),
                snapshot_hash: [0u8; 32],
                deltas: Vec::new(),
            });

        self.current.last_mod = Some(last_mod);

        match decision.kind {
            DecisionKind::None => {
                self.current.session_id = Some(decision.session_id);
                self.current.serial = decision.serial;
                Ok(self.finish(true, true))
            }
            DecisionKind::Snapshot => {
                self.current.session_id = Some(decision.session_id);
                self.current.serial = decision.serial;
                self.snapshot_uri = decision.snapshot_uri;
                self.snapshot_hash = decision.snapshot_hash;
                self.task = Task::Snapshot;
                self.state = SessionState::Req;
                Ok(FinOutcome::GoReq)
            }
            DecisionKind::Deltas => {
                self.current.session_id = Some(decision.session_id);
                self.current.serial = decision.serial;
                self.snapshot_uri = decision.snapshot_uri;
                self.snapshot_hash = decision.snapshot_hash;
                self.deltas = decision.deltas;
                self.delta_idx = 0;
                self.hash = self.deltas[0].hash;
                self.task = Task::Delta;
                self.state = SessionState::Req;
                Ok(FinOutcome::GoReq)
            }
        }
    }

    /// Failure policy: a DELTA failure falls back to snapshot per RFC
    /// 8182; any other task retires the session with `ok=0`.
    fn fail_or_fallback_to_snapshot(&mut self) -> FinOutcome {
        if self.task == Task::Delta {
            log::info!("session {}: delta fetch failed, falling back to snapshot", self.id);
            self.parser = None;
            self.task = Task::Snapshot;
            self.state = SessionState::Req;
            FinOutcome::GoReq
        } else {
            self.finish(false, false)
        }
    }

    fn finish(&mut self, ok: bool, emit_session: bool) -> FinOutcome {
        self.state = SessionState::Done;
        if self.file_pending == 0 {
            let ok = ok && self.file_failed == 0;
            FinOutcome::Retire { ok, emit_session }
        } else {
            self.pending_finish = Some(PendingFinish { ok, emit_session });
            FinOutcome::Deferred
        }
    }

    /// A `FILE` ack arrived from the parent. Returns the retirement
    /// outcome if this was the last pending ack and a terminal decision
    /// was already made.
    pub fn on_file_ack(&mut self, ok: bool) -> Option<FinOutcome> {
        if self.file_pending > 0 {
            self.file_pending -= 1;
        }
        if !ok {
            self.file_failed += 1;
        }
        if self.file_pending == 0 {
            if let Some(pending) = self.pending_finish.take() {
                let ok = pending.ok && self.file_failed == 0;
                return Some(FinOutcome::Retire { ok, emit_session: pending.emit_session });
            }
        }
        None
    }

    pub fn wants_poll(&self) -> bool {
        matches!(self.state, SessionState::Parsing | SessionState::Error) && self.in_fd.is_some()
    }
}

/// The ordered table of live sessions, keyed by the parent-assigned id.
#[derive(Default)]
pub struct SessionTable {
    sessions: BTreeMap<u64, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable { sessions: BTreeMap::new() }
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_starts_in_req_state() {
        let s = Session::new(1, "test".into(), "https://example/notification.xml".into(), RepoState::default());
        assert_eq!(s.state, SessionState::Req);
        assert_eq!(s.task, Task::Notification);
    }

    #[test]
    fn next_http_req_moves_to_waiting() {
        let mut s = Session::new(1, "test".into(), "https://example/notification.xml".into(), RepoState::default());
        let (uri, last_mod) = s.next_http_req();
        assert_eq!(uri, "https://example/notification.xml");
        assert_eq!(last_mod, "");
        assert_eq!(s.state, SessionState::Waiting);
    }

    #[test]
    fn finish_defers_while_files_pending() {
        let mut s = Session::new(1, "test".into(), "https://example/notification.xml".into(), RepoState::default());
        s.file_pending = 2;
        match s.finish(true, true) {
            FinOutcome::Deferred => {}
            _ => panic!("expected deferred outcome"),
        }
        assert!(s.on_file_ack(true).is_none());
        match s.on_file_ack(true) {
            Some(FinOutcome::Retire { ok, emit_session }) => {
                assert!(ok);
                assert!(emit_session);
            }
            _ => panic!("expected retire outcome on last ack"),
        }
    }

    #[test]
    fn failed_file_forces_retire_failure() {
        let mut s = Session::new(1, "test".into(), "https://example/notification.xml".into(), RepoState::default());
        s.file_pending = 1;
        assert!(matches!(s.finish(true, true), FinOutcome::Deferred));
        match s.on_file_ack(false) {
            Some(FinOutcome::Retire { ok, .. }) => assert!(!ok),
            _ => panic!("expected retire outcome"),
        }
    }

    /// Property 7: a delta that fails (parse error or bad HTTP status)
    /// falls back to fetching the snapshot rather than retiring the
    /// session, and issues no further `HTTP_REQ` for the failed delta.
    #[test]
    fn delta_failure_falls_back_to_snapshot_task() {
        let repo = RepoState { session_id: Some("A".to_string()), serial: 5, last_mod: None };
        let mut s = Session::new(1, "test".into(), "https://example/notification.xml".into(), repo);
        s.task = Task::Delta;
        s.state = SessionState::Error;
        s.snapshot_uri = "https://example/snapshot.xml".to_string();
        s.snapshot_hash = [7u8; 32];
        s.deltas = vec![notification::DeltaDescriptor {
            serial: 6,
            uri: "https://example/delta6.xml".to_string(),
            hash: [1u8; 32],
        }];
        s.delta_idx = 0;

        let mut emitted = Vec::new();
        match s.dispatch_http_fin(200, String::new(), &mut emitted).unwrap() {
            FinOutcome::GoReq => {}
            _ => panic!("a failed delta must fall back to a snapshot fetch, not retire"),
        }
        assert_eq!(s.task, Task::Snapshot);
        assert_eq!(s.state, SessionState::Req);
        assert!(emitted.is_empty(), "a failed delta emits no FILE records");

        let (uri, _) = s.next_http_req();
        assert_eq!(uri, "https://example/snapshot.xml", "fallback must request the snapshot, not the failed delta");
    }

    /// A non-delta task (snapshot or notification) that errors out has no
    /// fallback: it retires with `ok=0` and never emits `SESSION`.
    #[test]
    fn snapshot_failure_retires_without_fallback() {
        let mut s = Session::new(2, "test".into(), "https://example/notification.xml".into(), RepoState::default());
        s.task = Task::Snapshot;
        s.state = SessionState::Error;

        let mut emitted = Vec::new();
        match s.dispatch_http_fin(200, String::new(), &mut emitted).unwrap() {
            FinOutcome::Retire { ok, emit_session } => {
                assert!(!ok);
                assert!(!emit_session);
            }
            _ => panic!("a failed snapshot must retire immediately, not defer or fall back"),
        }
    }

    /// A bad HTTP status on a delta fetch is treated the same as a parse
    /// error: fall back to snapshot rather than retiring outright.
    #[test]
    fn non_200_status_on_delta_also_falls_back_to_snapshot() {
        let repo = RepoState { session_id: Some("A".to_string()), serial: 5, last_mod: None };
        let mut s = Session::new(1, "test".into(), "https://example/notification.xml".into(), repo);
        s.task = Task::Delta;
        s.state = SessionState::Parsed;
        s.snapshot_uri = "https://example/snapshot.xml".to_string();
        s.deltas = vec![notification::DeltaDescriptor {
            serial: 6,
            uri: "https://example/delta6.xml".to_string(),
            hash: [1u8; 32],
        }];

        let mut emitted = Vec::new();
        match s.dispatch_http_fin(503, String::new(), &mut emitted).unwrap() {
            FinOutcome::GoReq => {}
            _ => panic!("a 503 on a delta fetch must fall back to snapshot"),
        }
        assert_eq!(s.task, Task::Snapshot);
    }
}
