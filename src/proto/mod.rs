//! The parent/engine wire protocol.
//!
//! A bidirectional byte stream carrying length-delimited messages, each
//! beginning with a `u32` type tag; `HTTP_INI` additionally passes a file
//! descriptor out of band via [`fd`]. Every numeric wire field uses the
//! fixed-width type the design calls for rather than a platform-dependent
//! `usize`/`isize` -- `session_id` as `u64`, `serial` as `i64`, HTTP status
//! and ok-flags as `i32`, the publish type tag as `u32`, hashes as
//! `[u8; 32]` -- mirroring the explicit `SHA256_DIGEST_LENGTH`-sized arrays
//! and `long long serial` of the C source this core was distilled from.

pub mod framing;

#[cfg(unix)]
pub mod fd;

use crate::hash::Sha256Hash;
use crate::publish::PublishType;
use framing::{FrameReader, FramingError};

/// Message type tags, shared by both directions of the protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Tag {
    Start = 1,
    HttpReq = 2,
    HttpIni = 3,
    HttpFin = 4,
    Session = 5,
    File = 6,
    End = 7,
}

//------------ engine -> parent ------------------------------------------------

/// `HTTP_REQ`: ask the parent to fetch `uri`, conditional on `last_mod` if
/// non-empty.
pub fn encode_http_req(session_id: u64, uri: &str, last_mod: &str) -> Vec<u8> {
    let mut body = Vec::new();
    framing::write_u32(&mut body, Tag::HttpReq as u32);
    framing::write_u64(&mut body, session_id);
    framing::write_str(&mut body, uri);
    framing::write_str(&mut body, last_mod);
    framing::frame(body)
}

/// `SESSION`: the new `(session_id, serial, last_mod)` triple the parent
/// should persist for this repository.
pub fn encode_session(session_id: u64, current_session_id: &str, current_serial: i64, current_last_mod: &str) -> Vec<u8> {
    let mut body = Vec::new();
    framing::write_u32(&mut body, Tag::Session as u32);
    framing::write_u64(&mut body, session_id);
    framing::write_str(&mut body, current_session_id);
    framing::write_i64(&mut body, current_serial);
    framing::write_str(&mut body, current_last_mod);
    framing::frame(body)
}

/// `FILE`: one publish/withdraw operation to replay into the cache.
///
/// `expected_hash` is omitted on the wire when `publish_type` is `Add`
/// (there is nothing to verify the old content against).
pub fn encode_file(
    session_id: u64,
    publish_type: PublishType,
    expected_hash: Option<&Sha256Hash>,
    uri: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    framing::write_u32(&mut out, Tag::File as u32);
    framing::write_u64(&mut out, session_id);
    framing::write_u32(&mut out, publish_type as u32);
    match expected_hash {
        Some(hash) if publish_type != PublishType::Add => {
            framing::write_u32(&mut out, 1);
            framing::write_hash(&mut out, hash);
        }
        _ => framing::write_u32(&mut out, 0),
    }
    framing::write_str(&mut out, uri);
    framing::write_bytes(&mut out, body);
    framing::frame(out)
}

/// `END`: the session is retired, successfully (`ok = true`) or not.
pub fn encode_end(session_id: u64, ok: bool) -> Vec<u8> {
    let mut body = Vec::new();
    framing::write_u32(&mut body, Tag::End as u32);
    framing::write_u64(&mut body, session_id);
    framing::write_i32(&mut body, if ok { 1 } else { 0 });
    framing::frame(body)
}

//------------ parent -> engine ------------------------------------------------

/// A decoded message from the parent, with the `HTTP_INI` fd (if any)
/// already spliced in by the caller (it travels out of band from the
/// framed bytes, see [`fd`]).
#[derive(Debug)]
pub enum ParentMessage {
    Start {
        session_id: u64,
        local_label: String,
        notify_uri: String,
        repo_session_id: Option<String>,
        repo_serial: i64,
        repo_last_mod: String,
    },
    HttpIni {
        session_id: u64,
    },
    HttpFin {
        session_id: u64,
        http_status: i32,
        last_mod: String,
    },
    File {
        session_id: u64,
        status: i32,
    },
}

/// Decodes one already length-delimited message body (tag + payload, with
/// the outer `u32` length already stripped off by the caller).
pub fn decode_parent_message(body: &[u8]) -> Result<ParentMessage, FramingError> {
    let mut r = FrameReader::new(body);
    let tag = r.read_u32()?;
    if tag == Tag::Start as u32 {
        let session_id = r.read_u64()?;
        let local_label = r.read_str()?;
        let notify_uri = r.read_str()?;
        let repo_session_id = r.read_str()?;
        let repo_serial = r.read_i64()?;
        let repo_last_mod = r.read_str()?;
        Ok(ParentMessage::Start {
            session_id,
            local_label,
            notify_uri,
            repo_session_id: if repo_session_id.is_empty() { None } else { Some(repo_session_id) },
            repo_serial,
            repo_last_mod,
        })
    } else if tag == Tag::HttpIni as u32 {
        let session_id = r.read_u64()?;
        Ok(ParentMessage::HttpIni { session_id })
    } else if tag == Tag::HttpFin as u32 {
        let session_id = r.read_u64()?;
        let http_status = r.read_i32()?;
        let last_mod = r.read_str()?;
        Ok(ParentMessage::HttpFin { session_id, http_status, last_mod })
    } else if tag == Tag::File as u32 {
        let session_id = r.read_u64()?;
        let status = r.read_i32()?;
        Ok(ParentMessage::File { session_id, status })
    } else {
        Err(FramingError::UnknownTag(tag))
    }
}

//------------ engine -> parent, decoded -----------------------------------------

/// A decoded engine-to-parent message. The engine itself never needs this
/// (it only encodes, via the `encode_*` functions above); a test harness
/// or simulator standing in for the parent process decodes its own end of
/// the channel with it.
#[derive(Debug, Eq, PartialEq)]
pub enum EngineMessage {
    HttpReq { session_id: u64, uri: String, last_mod: String },
    Session { session_id: u64, current_session_id: String, current_serial: i64, current_last_mod: String },
    File { session_id: u64, publish_type: u32, expected_hash: Option<Sha256Hash>, uri: String, body: Vec<u8> },
    End { session_id: u64, ok: bool },
}

/// Decodes one already length-delimited message body (tag + payload, with
/// the outer `u32` length already stripped off by the caller) sent by the
/// engine.
pub fn decode_engine_message(body: &[u8]) -> Result<EngineMessage, FramingError> {
    let mut r = FrameReader::new(body);
    let tag = r.read_u32()?;
    if tag == Tag::HttpReq as u32 {
        let session_id = r.read_u64()?;
        let uri = r.read_str()?;
        let last_mod = r.read_str()?;
        Ok(EngineMessage::HttpReq { session_id, uri, last_mod })
    } else if tag == Tag::Session as u32 {
        let session_id = r.read_u64()?;
        let current_session_id = r.read_str()?;
        let current_serial = r.read_i64()?;
        let current_last_mod = r.read_str()?;
        Ok(EngineMessage::Session { session_id, current_session_id, current_serial, current_last_mod })
    } else if tag == Tag::File as u32 {
        let session_id = r.read_u64()?;
        let publish_type = r.read_u32()?;
        let expected_hash = match r.read_u32()? {
            0 => None,
            _ => Some(r.read_hash()?),
        };
        let uri = r.read_str()?;
        let body = r.read_bytes()?.to_vec();
        Ok(EngineMessage::File { session_id, publish_type, expected_hash, uri, body })
    } else if tag == Tag::End as u32 {
        let session_id = r.read_u64()?;
        let ok = r.read_i32()? != 0;
        Ok(EngineMessage::End { session_id, ok })
    } else {
        Err(FramingError::UnknownTag(tag))
    }
}
