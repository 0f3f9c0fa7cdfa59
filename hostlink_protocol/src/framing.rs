// Length-delimited message framing over the relay stream.
//
// Wire format: a 4-byte big-endian length prefix followed by the payload
// (a JSON-serialized `Envelope` in practice). Everything here works on raw
// `&[u8]` / `Vec<u8>`; the caller handles JSON separately, keeping this module
// format-agnostic.
//
// Two styles of access:
// - `write_message` / `read_message` for blocking `Write` / `Read` streams
//   (the mock relay in the integration tests, one-shot tools).
// - `encode_frame` plus `FrameBuffer` for the host's non-blocking event loop,
//   which reads whatever bytes the socket has and needs to reassemble frames
//   that straddle reads.
//
// `MAX_MESSAGE_SIZE` (16 MB) guards against unbounded allocation from a
// malformed or malicious length prefix.

use std::io::{self, Read, Write};

/// Maximum allowed message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

fn too_large(kind: io::ErrorKind, len: usize) -> io::Error {
    io::Error::new(
        kind,
        format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
    )
}

/// Build one frame (length prefix + payload) in a fresh buffer.
pub fn encode_frame(msg: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| too_large(io::ErrorKind::InvalidInput, msg.len()))?;
    let mut frame = Vec::with_capacity(PREFIX_LEN + msg.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    Ok(frame)
}

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; PREFIX_LEN];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(too_large(io::ErrorKind::InvalidData, len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Incremental frame decoder for non-blocking sockets.
///
/// Feed it whatever a `read()` returned with `extend`, then drain complete
/// frames with `next_frame` until it yields `None`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// An oversized length prefix is `InvalidData`; the stream cannot be
    /// resynchronized after that, so the caller should drop the connection.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let mut len_buf = [0u8; PREFIX_LEN];
        len_buf.copy_from_slice(&self.buf[..PREFIX_LEN]);
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_SIZE {
            return Err(too_large(io::ErrorKind::InvalidData, len as usize));
        }
        let end = PREFIX_LEN + len as usize;
        if self.buf.len() < end {
            return Ok(None);
        }
        let frame = self.buf[PREFIX_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn blocking_roundtrip() {
        let original = b"hello, relay!";
        let mut buf = Vec::new();
        write_message(&mut buf, original).unwrap();

        let mut cursor = Cursor::new(&buf);
        let recovered = read_message(&mut cursor).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let err = encode_frame(&big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_oversized_read() {
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        // Only 2 bytes when 4 are needed for the length prefix.
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frame_buffer_reassembles_split_frames() {
        let mut wire = encode_frame(b"first").unwrap();
        wire.extend(encode_frame(b"second").unwrap());

        let mut frames = FrameBuffer::new();
        let mut out = Vec::new();
        // Feed one byte at a time; frames must only appear once complete.
        for byte in &wire {
            frames.extend(std::slice::from_ref(byte));
            while let Some(frame) = frames.next_frame().unwrap() {
                out.push(frame);
            }
        }
        assert_eq!(out, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(frames.buffered(), 0);
    }

    #[test]
    fn frame_buffer_keeps_partial_tail() {
        let wire = encode_frame(b"payload").unwrap();
        let mut frames = FrameBuffer::new();
        frames.extend(&wire[..6]);
        assert!(frames.next_frame().unwrap().is_none());
        assert_eq!(frames.buffered(), 6);
        frames.extend(&wire[6..]);
        assert_eq!(frames.next_frame().unwrap().unwrap(), b"payload");
    }

    #[test]
    fn frame_buffer_rejects_oversized_prefix() {
        let mut frames = FrameBuffer::new();
        frames.extend(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        let err = frames.next_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_message_is_a_valid_frame() {
        let mut frames = FrameBuffer::new();
        frames.extend(&encode_frame(b"").unwrap());
        assert_eq!(frames.next_frame().unwrap().unwrap(), Vec::<u8>::new());
    }
}
