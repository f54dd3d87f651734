//! File descriptor passing over the control channel.
//!
//! The only message that carries a descriptor is `HTTP_INI` (the readable
//! transport fd the parent fetched on the engine's behalf); everything
//! else is plain framed bytes. Fd passing is a capability of the control
//! channel itself, not of the message framing in `proto::framing`, so it
//! lives in its own small module built directly on `nix`'s `sendmsg`/
//! `recvmsg`, the way `routinator`'s unix-only dependency table already
//! expects `nix` to be used for this kind of thing.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Writes `bytes` to `sock`. The engine never hands a descriptor back to
/// the parent, so this never attaches ancillary data; kept symmetric with
/// [`recv_with_fd`] for clarity at call sites.
pub fn send(sock: RawFd, bytes: &[u8]) -> Result<usize, Errno> {
    let iov = [IoSlice::new(bytes)];
    sendmsg::<()>(sock, &iov, &[], MsgFlags::empty(), None)
}

/// Writes `bytes` to `sock` with `fd` attached as `SCM_RIGHTS` ancillary
/// data. The engine itself never calls this (see [`send`]); it exists so
/// a test harness standing in for the parent can hand over a transport
/// descriptor the same way the real parent does for `HTTP_INI`.
pub fn send_with_fd(sock: RawFd, bytes: &[u8], fd: RawFd) -> Result<usize, Errno> {
    let iov = [IoSlice::new(bytes)];
    let cmsg = [ControlMessage::ScmRights(std::slice::from_ref(&fd))];
    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None)
}

/// Reads up to `buf.len()` bytes from `sock`, returning the number of bytes
/// read and, if the parent attached one, the `SCM_RIGHTS` descriptor it
/// sent alongside them.
///
/// Assumes the parent writes the `HTTP_INI` message and its fd in a single
/// `sendmsg` call, so the fd always arrives attached to the `recvmsg` call
/// that also delivers (at least the start of) that message's bytes.
pub fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>), Errno> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    let mut fd = None;
    for cmsg in msg.cmsgs().map_err(|_| Errno::EINVAL)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                // Safety: the kernel just transferred ownership of this
                // descriptor to us via SCM_RIGHTS.
                fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok((msg.bytes, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::pipe;

    fn control_pair() -> (OwnedFd, OwnedFd) {
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
            .expect("socketpair for test control channel")
    }

    #[test]
    fn plain_bytes_round_trip_without_a_fd() {
        let (a, b) = control_pair();
        let n = send(a.as_raw_fd(), b"HTTP_INI body").unwrap();
        assert_eq!(n, b"HTTP_INI body".len());

        let mut buf = [0u8; 64];
        let (read, fd) = recv_with_fd(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..read], b"HTTP_INI body");
        assert!(fd.is_none());
    }

    #[test]
    fn a_passed_fd_is_received_alongside_its_bytes() {
        let (a, b) = control_pair();
        let (read_end, _write_end) = pipe().expect("pipe for test transport fd");

        send_with_fd(a.as_raw_fd(), b"HTTP_INI", read_end.as_raw_fd()).expect("sendmsg with SCM_RIGHTS");

        let mut buf = [0u8; 64];
        let (read, fd) = recv_with_fd(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..read], b"HTTP_INI");
        assert!(fd.is_some(), "expected the passed fd to come back with its message");
    }
}
