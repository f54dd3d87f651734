//! The I/O multiplexer: a single readiness loop over the parent control
//! channel and every active session's transport descriptor.
//!
//! Grounded directly on `proc_rrdp()`/`rrdp_input_handler()` in the
//! source this core was distilled from (`rrdp.c`): build a `pollfd`
//! array fresh each iteration (control channel first, then one slot per
//! session up to the concurrency cap), block in `poll()`, then service
//! whichever descriptors came back ready. The Rust translation swaps
//! the raw `struct pollfd` array for `nix::sys::poll::PollFd`, and the
//! blocking `io_str_read`/`io_simple_read` helpers for a small inbound
//! byte accumulator plus `proto::decode_parent_message`, since a single
//! `recvmsg` here isn't guaranteed to deliver exactly one framed
//! message the way the original's `imsg` layer does.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::Config;
use crate::error::FatalError;
use crate::proto::{self, fd as proto_fd, ParentMessage};
use crate::session::{RepoState, Session, SessionState, SessionTable};

/// Drives the engine's main loop to completion (clean `POLLHUP` exit) or
/// a fatal protocol/resource error.
pub struct Multiplexer {
    control_fd: RawFd,
    max_sessions: usize,
    read_buf_size: usize,

    /// Framed bytes queued for the parent, flushed whenever the control
    /// fd is writable. The only process-wide mutable state; only this
    /// loop ever writes to it.
    outbound: Vec<u8>,

    /// Bytes received from the control fd not yet assembled into a
    /// complete frame.
    inbound: Vec<u8>,

    /// A descriptor handed over via `SCM_RIGHTS` ahead of the framed
    /// `HTTP_INI` message it belongs to.
    pending_fd: Option<OwnedFd>,

    sessions: SessionTable,
}

impl Multiplexer {
    pub fn new(config: &Config) -> Self {
        Multiplexer {
            control_fd: config.control_fd,
            max_sessions: config.max_sessions,
            read_buf_size: config.read_buf_size,
            outbound: Vec::new(),
            inbound: Vec::new(),
            pending_fd: None,
            sessions: SessionTable::new(),
        }
    }

    /// Runs until the parent closes the control channel (clean exit) or
    /// a protocol invariant is violated (fatal exit).
    pub fn run(mut self) -> Result<(), FatalError> {
        let mut read_buf = vec![0u8; self.read_buf_size];

        loop {
            // 1. Sessions in REQ within the concurrency cap issue their
            // next HTTP_REQ and move to WAITING.
            let mut slot_ids = Vec::with_capacity(self.max_sessions);
            let ids: Vec<u64> = self.sessions.iter().map(|s| s.id).collect();
            for id in ids {
                if slot_ids.len() >= self.max_sessions {
                    break;
                }
                slot_ids.push(id);
                let session = self.sessions.get_mut(id).expect("id just read from table");
                if session.state == SessionState::Req {
                    let (uri, last_mod) = session.next_http_req();
                    self.outbound.extend(proto::encode_http_req(id, &uri, &last_mod));
                }
            }

            // 2. Build the poll set: control fd always first, then one
            // slot per session that currently has a readable transport
            // fd open (PARSING/ERROR).
            let mut poll_session_ids = Vec::with_capacity(slot_ids.len());
            let mut poll_raw_fds = Vec::with_capacity(slot_ids.len());
            for id in &slot_ids {
                let session = self.sessions.get_mut(*id).expect("slot id in table");
                if session.wants_poll() {
                    let raw = session.in_fd.as_ref().expect("wants_poll implies in_fd").as_raw_fd();
                    poll_session_ids.push(*id);
                    poll_raw_fds.push(raw);
                }
            }

            let mut control_events = PollFlags::POLLIN;
            if !self.outbound.is_empty() {
                control_events |= PollFlags::POLLOUT;
            }
            let mut fds: Vec<PollFd> = Vec::with_capacity(1 + poll_raw_fds.len());
            // Safety: `self.control_fd` stays open for the engine's
            // whole lifetime, and every session fd in `poll_raw_fds` is
            // owned by a `Session` still alive in `self.sessions` for
            // the duration of this `poll()` call -- the table isn't
            // mutated again until after `fds` is dropped below.
            fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(self.control_fd) }, control_events));
            for raw in &poll_raw_fds {
                fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(*raw) }, PollFlags::POLLIN));
            }

            // 3. Block until something is ready.
            poll(&mut fds, PollTimeout::NONE).map_err(|errno| {
                log::error!("poll failed: {}", errno);
                FatalError::ChannelFailed
            })?;

            let control_revents = fds[0].revents().unwrap_or_else(PollFlags::empty);

            // Control-fd POLLHUP terminates the process cleanly.
            if control_revents.contains(PollFlags::POLLHUP) {
                return Ok(());
            }

            // 4. Flush queued outbound bytes if the channel is writable.
            if control_revents.contains(PollFlags::POLLOUT) {
                self.flush_outbound()?;
            }

            // 5. Read and dispatch framed messages from the parent.
            if control_revents.contains(PollFlags::POLLIN) {
                self.read_control()?;
            }

            // 6. Service each ready session descriptor.
            for (slot, id) in poll_session_ids.iter().enumerate() {
                let revents = fds[slot + 1].revents().unwrap_or_else(PollFlags::empty);
                if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    continue;
                }
                self.service_session(*id, &mut read_buf);
            }
        }
    }

    /// Writes as much of `outbound` as the kernel will currently accept.
    fn flush_outbound(&mut self) -> Result<(), FatalError> {
        match proto_fd::send(self.control_fd, &self.outbound) {
            Ok(0) if !self.outbound.is_empty() => {
                log::error!("write: connection closed");
                Err(FatalError::ChannelFailed)
            }
            Ok(n) => {
                self.outbound.drain(..n);
                Ok(())
            }
            Err(Errno::EAGAIN) => Ok(()),
            Err(errno) => {
                log::error!("write failed: {}", errno);
                Err(FatalError::ChannelFailed)
            }
        }
    }

    /// Reads one chunk off the control fd, appends it to the inbound
    /// accumulator (capturing any `SCM_RIGHTS` fd it carried), then
    /// decodes and dispatches every complete frame now available.
    fn read_control(&mut self) -> Result<(), FatalError> {
        let mut chunk = vec![0u8; 64 * 1024];
        let (n, fd) = proto_fd::recv_with_fd(self.control_fd, &mut chunk).map_err(|errno| {
            log::error!("read failed: {}", errno);
            FatalError::ChannelFailed
        })?;
        if n == 0 {
            log::error!("control channel closed unexpectedly");
            return Err(FatalError::ChannelFailed);
        }
        self.inbound.extend_from_slice(&chunk[..n]);
        if let Some(fd) = fd {
            if self.pending_fd.is_some() {
                log::error!("received a second fd before the first was claimed");
                return Err(FatalError::ProtocolViolation);
            }
            self.pending_fd = Some(fd);
        }

        loop {
            if self.inbound.len() < 4 {
                break;
            }
            let len = u32::from_le_bytes(self.inbound[..4].try_into().unwrap()) as usize;
            if self.inbound.len() < 4 + len {
                break;
            }
            let body: Vec<u8> = self.inbound[4..4 + len].to_vec();
            self.inbound.drain(..4 + len);

            let message = proto::decode_parent_message(&body).map_err(|e| {
                log::error!("malformed message from parent: {}", e);
                FatalError::ProtocolViolation
            })?;
            self.dispatch_parent_message(message)?;
        }
        Ok(())
    }

    fn dispatch_parent_message(&mut self, message: ParentMessage) -> Result<(), FatalError> {
        match message {
            ParentMessage::Start { session_id, local_label, notify_uri, repo_session_id, repo_serial, repo_last_mod } => {
                let repository = RepoState {
                    session_id: repo_session_id,
                    serial: repo_serial,
                    last_mod: if repo_last_mod.is_empty() { None } else { Some(repo_last_mod) },
                };
                self.sessions.insert(Session::new(session_id, local_label, notify_uri, repository));
                Ok(())
            }
            ParentMessage::HttpIni { session_id } => {
                let fd = self.pending_fd.take().ok_or_else(|| {
                    log::error!("HTTP_INI for session {} arrived without a fd", session_id);
                    FatalError::ProtocolViolation
                })?;
                let session = self.sessions.get_mut(session_id).ok_or_else(|| {
                    log::error!("HTTP_INI for unknown session {}", session_id);
                    FatalError::ProtocolViolation
                })?;
                session.on_http_ini(fd).map_err(FatalError::from)
            }
            ParentMessage::HttpFin { session_id, http_status, last_mod } => {
                let session = self.sessions.get_mut(session_id).ok_or_else(|| {
                    log::error!("HTTP_FIN for unknown session {}", session_id);
                    FatalError::ProtocolViolation
                })?;
                let mut emitted = Vec::new();
                let outcome = session.dispatch_http_fin(http_status, last_mod, &mut emitted)?;
                self.queue_emitted(session_id, emitted);
                self.act_on_outcome(session_id, outcome);
                Ok(())
            }
            ParentMessage::File { session_id, status } => {
                let session = self.sessions.get_mut(session_id).ok_or_else(|| {
                    log::error!("FILE ack for unknown session {}", session_id);
                    FatalError::ProtocolViolation
                })?;
                if let Some(outcome) = session.on_file_ack(status != 0) {
                    self.act_on_outcome(session_id, outcome);
                }
                Ok(())
            }
        }
    }

    /// Queues one `FILE` message per record emitted by a document that
    /// just finished parsing, in document order, and bumps the
    /// session's `file_pending` bookkeeping is already done by the
    /// session itself before `emitted` is handed back here.
    fn queue_emitted(&mut self, session_id: u64, emitted: Vec<crate::session::snapshot::Emitted>) {
        for e in emitted {
            self.outbound.extend(proto::encode_file(session_id, e.publish_type, e.expected_hash.as_ref(), &e.uri, &e.body));
        }
    }

    /// Acts on a [`crate::session::FinOutcome`]: `GoReq` needs nothing
    /// further (the next loop iteration issues the request), `Deferred`
    /// likewise (a later `FILE` ack will resolve it), and `Retire`
    /// emits `SESSION`/`END` and drops the session from the table.
    fn act_on_outcome(&mut self, session_id: u64, outcome: crate::session::FinOutcome) {
        use crate::session::FinOutcome;
        match outcome {
            FinOutcome::GoReq | FinOutcome::Deferred => {}
            FinOutcome::Retire { ok, emit_session } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    if emit_session && ok {
                        let current_session_id = session.current.session_id.clone().unwrap_or_default();
                        let current_serial = session.current.serial;
                        let current_last_mod = session.current.last_mod.clone().unwrap_or_default();
                        self.outbound.extend(proto::encode_session(
                            session_id,
                            &current_session_id,
                            current_serial,
                            &current_last_mod,
                        ));
                    }
                }
                self.outbound.extend(proto::encode_end(session_id, ok));
                self.sessions.remove(session_id);
            }
        }
    }

    /// Reads up to `read_buf.len()` bytes from `id`'s transport
    /// descriptor and feeds them through the session's state machine,
    /// per step 6 of the multiplexer loop.
    fn service_session(&mut self, id: u64, read_buf: &mut [u8]) {
        let raw_fd = {
            let session = match self.sessions.get_mut(id) {
                Some(s) => s,
                None => return,
            };
            match session.in_fd.as_ref() {
                Some(fd) => fd.as_raw_fd(),
                None => return,
            }
        };

        match nix::unistd::read(raw_fd, read_buf) {
            Ok(0) => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.on_eof();
                }
            }
            Ok(n) => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.feed(&read_buf[..n]);
                }
            }
            Err(errno) => {
                log::warn!("session {}: read failure: {}", id, errno);
                if let Some(session) = self.sessions.get_mut(id) {
                    session.fail_transport();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::{read, write};

    fn control_pair() -> (OwnedFd, OwnedFd) {
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
            .expect("socketpair for test control channel")
    }

    fn encode_start(id: u64, uri: &str) -> Vec<u8> {
        let mut body = Vec::new();
        proto::framing::write_u32(&mut body, proto::Tag::Start as u32);
        proto::framing::write_u64(&mut body, id);
        proto::framing::write_str(&mut body, "test");
        proto::framing::write_str(&mut body, uri);
        proto::framing::write_str(&mut body, "");
        proto::framing::write_i64(&mut body, 0);
        proto::framing::write_str(&mut body, "");
        proto::framing::frame(body)
    }

    fn send_all(fd: RawFd, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = write(fd, bytes).expect("write to test socket");
            bytes = &bytes[n..];
        }
    }

    fn recv_exact(fd: RawFd, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut chunk = [0u8; 4096];
        while out.len() < n {
            let got = read(fd, &mut chunk).expect("read from test socket");
            assert_ne!(got, 0, "engine closed the control channel early");
            out.extend_from_slice(&chunk[..got]);
        }
        out
    }

    /// Property: with `max_sessions` sessions already in flight, a burst
    /// of additional `START` requests is accepted into the table but
    /// parked -- only the first `max_sessions` sessions (in id order)
    /// ever receive an `HTTP_REQ`.
    #[test]
    fn concurrency_cap_limits_outstanding_http_req() {
        let (engine_end, test_end) = control_pair();
        let config = Config {
            control_fd: engine_end.as_raw_fd(),
            max_sessions: 2,
            read_buf_size: crate::config::DEFAULT_READ_BUF_SIZE,
            log_level: log::LevelFilter::Off,
            log_target: crate::config::LogTarget::Stderr,
        };

        let handle = std::thread::spawn(move || {
            let _keep_alive = engine_end;
            Multiplexer::new(&config).run()
        });

        let mut start_bytes = Vec::new();
        let uris: Vec<String> = (1..=5u64).map(|id| format!("https://rpki.example/{id}/notification.xml")).collect();
        for (id, uri) in (1..=5u64).zip(&uris) {
            start_bytes.extend(encode_start(id, uri));
        }
        send_all(test_end.as_raw_fd(), &start_bytes);

        let mut expected = Vec::new();
        expected.extend(proto::encode_http_req(1, &uris[0], ""));
        expected.extend(proto::encode_http_req(2, &uris[1], ""));
        let got = recv_exact(test_end.as_raw_fd(), expected.len());
        assert_eq!(got, expected, "only the first max_sessions REQ-state sessions should be issued an HTTP_REQ");

        drop(test_end);
        let result = handle.join().expect("engine thread panicked");
        assert!(result.is_ok(), "POLLHUP on the control channel should end the loop cleanly");
    }
}
