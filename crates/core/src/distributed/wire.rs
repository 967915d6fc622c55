//! Framing for the TCP collective transport.
//!
//! A frame on the socket is a little-endian `u64` byte count followed by the
//! postcard encoding of a [`Frame`]. Tensor payloads always travel as `f32`;
//! half-precision tensors are widened on the way out and narrowed on the way
//! back, which is lossless.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use super::communicator::ReduceOp;

/// Largest encoded frame accepted from a rank that has joined.
pub(crate) const MAX_FRAME_LEN: u64 = 1 << 36;

/// Largest encoded frame accepted before a peer has identified itself.
pub(crate) const MAX_HANDSHAKE_LEN: u64 = 1 << 10;

/// Collective operation carried by a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveKind {
    AllReduce(ReduceOp),
    AllToAll,
    Barrier,
}

/// A single message exchanged between a rank and the rendezvous hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        rank: u32,
        world_size: u32,
    },
    Ready,
    Request {
        seq: u64,
        kind: CollectiveKind,
        group: Vec<u32>,
        payload: Vec<f32>,
    },
    Response {
        payload: Vec<f32>,
    },
    Error {
        message: String,
    },
    Goodbye,
}

impl Frame {
    /// Encode and write the frame, then flush.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let body = postcard::to_stdvec(self).map_err(invalid)?;
        w.write_all(&(body.len() as u64).to_le_bytes())?;
        w.write_all(&body)?;
        w.flush()
    }

    /// Read one frame of at most [`MAX_FRAME_LEN`] bytes.
    ///
    /// A clean EOF before the length prefix surfaces as `UnexpectedEof`.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Self::read_limited(r, MAX_FRAME_LEN)
    }

    /// Read one frame, rejecting any whose declared length exceeds `max_len`.
    ///
    /// The body buffer grows with the bytes actually received, so a bogus
    /// length prefix cannot force a large allocation.
    pub fn read_limited<R: Read>(r: &mut R, max_len: u64) -> io::Result<Self> {
        let mut prefix = [0u8; 8];
        r.read_exact(&mut prefix)?;
        let len = u64::from_le_bytes(prefix);
        if len > max_len {
            return Err(invalid(format!(
                "frame of {len} bytes exceeds the {max_len} byte limit"
            )));
        }

        let mut body = Vec::new();
        r.by_ref().take(len).read_to_end(&mut body)?;
        if (body.len() as u64) < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame truncated after {} of {len} bytes", body.len()),
            ));
        }
        postcard::from_bytes(&body).map_err(invalid)
    }
}

fn invalid(e: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(frame: &Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn request_frame_preserves_fields() {
        let frame = Frame::Request {
            seq: 42,
            kind: CollectiveKind::AllReduce(ReduceOp::Max),
            group: vec![0, 2, 4],
            payload: vec![1.5, -2.0, f32::MAX],
        };
        let decoded = Frame::read_from(&mut Cursor::new(encode(&frame))).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn consecutive_frames_on_one_stream() {
        let mut buf = encode(&Frame::Error {
            message: "rank 3 disconnected".to_string(),
        });
        buf.extend(encode(&Frame::Goodbye));
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            Frame::read_from(&mut cursor).unwrap(),
            Frame::Error { message } if message == "rank 3 disconnected"
        ));
        assert_eq!(Frame::read_from(&mut cursor).unwrap(), Frame::Goodbye);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buf = encode(&Frame::Response {
            payload: vec![1.0, 2.0],
        });
        buf.truncate(buf.len() - 3);
        let err = Frame::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_variant_rejected() {
        let mut buf = 1u64.to_le_bytes().to_vec();
        buf.push(99);
        let err = Frame::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let buf = u64::MAX.to_le_bytes().to_vec();
        let err = Frame::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn handshake_limit_rejects_large_frames() {
        let hello = encode(&Frame::Hello {
            rank: 1,
            world_size: 4,
        });
        assert!(Frame::read_limited(&mut Cursor::new(hello), MAX_HANDSHAKE_LEN).is_ok());

        let request = encode(&Frame::Response {
            payload: vec![0.0; 1024],
        });
        let err = Frame::read_limited(&mut Cursor::new(request), MAX_HANDSHAKE_LEN).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
