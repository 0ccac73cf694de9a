//! Wire helpers for a client connection.
//!
//! A connection carries two kinds of traffic on one Unix stream socket:
//!
//! ```text
//! ┌──────────────┬───────────────┐
//! │ len: u64 LE  │  JSON body    │   write_message / read_message
//! └──────────────┴───────────────┘
//! ┌───────┐ + SCM_RIGHTS(fd × n)
//! │ n: u8 │                          send_fds / recv_fds, n <= 16
//! └───────┘
//! ```
//!
//! A reply announces how many descriptors follow it, so the peer always
//! knows whether the next bytes are a frame or a descriptor batch.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Most descriptors carried by one batch.
pub const MAX_FDS_PER_MESSAGE: usize = 16;

/// Largest message body accepted by [`read_message`] (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Control buffer for one full batch, including alignment slack.
fn batch_control() -> Vec<MaybeUninit<u8>> {
    vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_MESSAGE))]
}

/// Send `fds` in batches of at most [`MAX_FDS_PER_MESSAGE`].
///
/// Each batch is one byte holding the batch size, with the descriptors
/// attached. Sending nothing is a no-op.
pub fn send_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd]) -> Result<()> {
    for batch in fds.chunks(MAX_FDS_PER_MESSAGE) {
        let borrowed: Vec<BorrowedFd<'_>> = batch.iter().map(AsFd::as_fd).collect();

        let mut control = batch_control();
        let mut ancillary = SendAncillaryBuffer::new(&mut control);
        if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
            return Err(Error::Invalid(format!(
                "{} descriptors do not fit one batch",
                batch.len()
            )));
        }

        // The batch size always fits: chunks are at most 16 long.
        let announced = [batch.len() as u8];
        let sent = sendmsg(
            socket,
            &[IoSlice::new(&announced)],
            &mut ancillary,
            SendFlags::empty(),
        )?;
        if sent != announced.len() {
            return Err(Error::Invalid("descriptor batch was not sent".into()));
        }
    }
    Ok(())
}

/// Receive exactly `count` descriptors sent by [`send_fds`].
///
/// # Errors
///
/// Returns [`Error::Invalid`] if the peer closes the socket early, or a
/// batch carries a different number of descriptors than it announces.
pub fn recv_fds(socket: &UnixStream, count: usize) -> Result<Vec<OwnedFd>> {
    let mut fds = Vec::with_capacity(count);
    while fds.len() < count {
        let mut control = batch_control();
        let mut ancillary = RecvAncillaryBuffer::new(&mut control);
        let mut announced = [0u8; 1];

        let received = recvmsg(
            socket,
            &mut [IoSliceMut::new(&mut announced)],
            &mut ancillary,
            RecvFlags::CMSG_CLOEXEC,
        )?;
        if received.bytes == 0 {
            return Err(Error::Invalid(format!(
                "connection closed after {} of {count} descriptors",
                fds.len()
            )));
        }

        let before = fds.len();
        for message in ancillary.drain() {
            if let RecvAncillaryMessage::ScmRights(rights) = message {
                fds.extend(rights);
            }
        }
        let batch = fds.len() - before;
        if batch == 0 || batch != usize::from(announced[0]) {
            return Err(Error::Invalid(format!(
                "descriptor batch announced {} but carried {batch}",
                announced[0]
            )));
        }
    }

    if fds.len() != count {
        return Err(Error::Invalid(format!(
            "expected {count} descriptors, received {}",
            fds.len()
        )));
    }
    Ok(fds)
}

/// Write one length-prefixed message.
pub fn write_message<W: Write>(mut writer: W, body: &[u8]) -> Result<()> {
    let len = u64::try_from(body.len())
        .map_err(|_| Error::Invalid(format!("message too large: {}", body.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before the
/// next message started.
pub fn read_message<R: Read>(mut reader: R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u64::from_le_bytes(len_buf);
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            Error::Invalid(format!(
                "message length {len} exceeds the limit of {MAX_MESSAGE_SIZE}"
            ))
        })?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySegment, SharedMemorySegment};

    fn segment_with(name: &str, marker: u8) -> SharedMemorySegment {
        let segment = SharedMemorySegment::new(name, 4096).unwrap();
        unsafe { *segment.as_mut_ptr() = marker };
        segment
    }

    #[test]
    fn test_send_recv_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let segment = segment_with("test-ipc", 42);
        unsafe { *segment.as_mut_ptr().add(1000) = 123 };

        send_fds(&sender, &[&segment]).unwrap();
        let fds = recv_fds(&receiver, 1).unwrap();
        assert_eq!(fds.len(), 1);

        let received = SharedMemorySegment::from_fd(fds.into_iter().next().unwrap()).unwrap();
        assert_eq!(received.len(), 4096);
        let data = unsafe { received.as_slice() };
        assert_eq!(data[0], 42);
        assert_eq!(data[1000], 123);
    }

    #[test]
    fn test_many_fds_span_batches() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let segments: Vec<_> = (0..MAX_FDS_PER_MESSAGE as u8 + 4)
            .map(|i| segment_with("test-ipc-batch", i))
            .collect();

        send_fds(&sender, &segments).unwrap();
        let fds = recv_fds(&receiver, segments.len()).unwrap();

        // Order is preserved across batches.
        for (i, fd) in fds.into_iter().enumerate() {
            let received = SharedMemorySegment::from_fd(fd).unwrap();
            assert_eq!(unsafe { *received.as_ptr() }, i as u8);
        }
    }

    #[test]
    fn test_send_nothing_is_noop() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        send_fds(&sender, empty).unwrap();
        assert!(recv_fds(&receiver, 0).unwrap().is_empty());
    }

    #[test]
    fn test_recv_fds_on_closed_socket() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);
        assert!(matches!(recv_fds(&receiver, 1), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_plain_frame_is_not_a_batch() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        write_message(&sender, b"x").unwrap();
        assert!(matches!(recv_fds(&receiver, 1), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_modifications_visible_across_mappings() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let segment = SharedMemorySegment::new("test-ipc-shared", 4096).unwrap();

        send_fds(&sender, &[&segment]).unwrap();
        let fds = recv_fds(&receiver, 1).unwrap();
        let received = SharedMemorySegment::from_fd(fds.into_iter().next().unwrap()).unwrap();

        unsafe {
            *segment.as_mut_ptr() = 111;
            assert_eq!(*received.as_ptr(), 111);
            *received.as_mut_ptr().add(100) = 222;
            assert_eq!(*segment.as_ptr().add(100), 222);
        }
    }

    #[test]
    fn test_message_framing() {
        let (mut writer, mut reader) = UnixStream::pair().unwrap();
        write_message(&mut writer, b"{\"type\":\"clear_request\"}").unwrap();
        write_message(&mut writer, b"").unwrap();
        drop(writer);

        let first = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(first, b"{\"type\":\"clear_request\"}");
        let second = read_message(&mut reader).unwrap().unwrap();
        assert!(second.is_empty());
        assert!(read_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = read_message(frame.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_truncated_body_is_io_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&10u64.to_le_bytes());
        frame.extend_from_slice(b"abc");
        let err = read_message(frame.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
