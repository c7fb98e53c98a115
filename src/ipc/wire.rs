//! Framed wire format for cross-process calls.
//!
//! Every message on a service socket is a frame: a 4-byte little-endian
//! length prefix followed by a postcard-encoded body. Requests carry a
//! [`CallFrame`]; the worker answers each with one [`Reply`]. Frames are
//! capped at [`MAX_FRAME_LEN`] bytes in both directions so a misbehaving
//! peer cannot make a worker allocate arbitrarily.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ Len (4, LE)  │ postcard body (Len bytes)    │
//! └──────────────┴──────────────────────────────┘
//! ```

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded body size accepted on either side of a connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Error reading or writing a frame.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer hung up cleanly between frames.
    #[error("peer disconnected")]
    Disconnected,
    /// The encoded body exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    Oversize { len: usize, max: usize },
    /// The body could not be encoded.
    #[error("failed to encode frame")]
    Encode(#[source] postcard::Error),
    /// The body bytes did not decode as the expected message.
    #[error("failed to decode frame")]
    Decode(#[source] postcard::Error),
    /// The underlying stream failed. End-of-stream partway through a
    /// frame lands here, not in [`WireError::Disconnected`].
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the error is a clean end-of-stream before a frame began,
    /// i.e. the peer hung up between calls. A stream that dies mid-frame
    /// is not a clean disconnect.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// One inbound method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Well-known name the caller resolved.
    pub service: String,
    /// Method selector, meaningful to the service.
    pub code: u32,
    /// Opaque argument bytes, meaningful to the service.
    pub payload: Vec<u8>,
}

/// The answer to a [`CallFrame`]: reply bytes, or a status the caller can
/// act on. Statuses are per-call failures; the connection stays usable.
pub type Reply = Result<Vec<u8>, CallStatus>;

/// Why a call produced no reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CallStatus {
    /// No object is registered under the requested name.
    #[error("no service under that name")]
    UnknownService,
    /// The service does not implement the requested code.
    #[error("unknown call code {0}")]
    UnknownCode(u32),
    /// The payload did not parse as the arguments the code expects.
    #[error("malformed call payload")]
    BadPayload,
    /// The service exists but cannot take the call right now.
    #[error("service cannot take the call")]
    Unavailable,
    /// The service failed internally while producing the reply.
    #[error("internal service error")]
    Internal,
}

/// Writes one length-prefixed frame.
///
/// # Errors
///
/// Fails if the body exceeds [`MAX_FRAME_LEN`], cannot be encoded, or the
/// stream write fails.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, msg: &T) -> Result<(), WireError> {
    let body = postcard::to_stdvec(msg).map_err(WireError::Encode)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversize {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(body.len()).expect("frame length fits in u32 below the cap");
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// # Errors
///
/// Fails if the stream ends or errors, the advertised length exceeds
/// [`MAX_FRAME_LEN`], or the body does not decode as `T`. A hangup before
/// the first prefix byte is [`WireError::Disconnected`]; end-of-stream
/// anywhere after that is an I/O error, since the peer died mid-frame.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, WireError> {
    let mut prefix = [0u8; 4];
    let first = loop {
        match reader.read(&mut prefix) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WireError::Io(e)),
        }
    };
    if first == 0 {
        return Err(WireError::Disconnected);
    }
    reader.read_exact(&mut prefix[first..])?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversize {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    postcard::from_bytes(&body).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_call() -> CallFrame {
        CallFrame {
            service: "stats".to_owned(),
            code: 7,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn call_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_call()).unwrap();

        let decoded: CallFrame = read_frame(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, sample_call());
    }

    #[test]
    fn reply_roundtrip_both_variants() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Reply::Ok(b"pong".to_vec())).unwrap();
        write_frame(&mut buf, &Reply::Err(CallStatus::UnknownCode(99))).unwrap();

        let mut cursor = Cursor::new(&buf);
        let ok: Reply = read_frame(&mut cursor).unwrap();
        let err: Reply = read_frame(&mut cursor).unwrap();
        assert_eq!(ok, Ok(b"pong".to_vec()));
        assert_eq!(err, Err(CallStatus::UnknownCode(99)));
    }

    #[test]
    fn oversized_body_is_refused_on_write() {
        let frame = CallFrame {
            service: "stats".to_owned(),
            code: 0,
            payload: vec![0u8; MAX_FRAME_LEN + 1],
        };
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &frame).unwrap_err();
        assert!(matches!(err, WireError::Oversize { .. }));
        assert!(buf.is_empty()); // nothing partial hit the stream
    }

    #[test]
    fn oversized_length_prefix_is_refused_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let err = read_frame::<CallFrame>(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, WireError::Oversize { .. }));
    }

    #[test]
    fn hangup_before_prefix_reads_as_disconnect() {
        let err = read_frame::<CallFrame>(&mut Cursor::new(&[])).unwrap_err();
        assert!(err.is_disconnect());
        assert!(matches!(err, WireError::Disconnected));
    }

    #[test]
    fn truncated_prefix_is_a_mid_frame_death_not_a_disconnect() {
        // One prefix byte arrived, then the stream died.
        let err = read_frame::<CallFrame>(&mut Cursor::new(&[0x04u8])).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn truncated_body_is_an_io_error_not_a_disconnect() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_call()).unwrap();
        buf.truncate(buf.len() - 1);

        let err = read_frame::<CallFrame>(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(!err.is_disconnect());
    }
}
