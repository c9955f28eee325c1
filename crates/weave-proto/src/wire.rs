// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Length-prefixed CBOR framing for [`crate::Frame`].

use std::io::Cursor;

use crate::Frame;

/// Frames above this size are rejected before any allocation for the body,
/// guarding against a malicious or corrupt length prefix.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Errors from encoding or decoding a framed [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer does not yet contain a complete length prefix.
    #[error("incomplete length prefix")]
    IncompleteLength,
    /// The length prefix names a frame larger than [`MAX_FRAME_LEN`].
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte maximum")]
    FrameTooLarge(u32),
    /// The buffer's length prefix names more bytes than are available.
    #[error("incomplete frame body")]
    IncompleteBody,
    /// CBOR encoding failed.
    #[error("cbor encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("cbor decode error: {0}")]
    Decode(String),
}

/// Encode `frame` as a length-prefixed CBOR packet: a big-endian `u32` byte
/// count followed by the canonical CBOR body.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(frame, &mut body).map_err(|e| WireError::Encode(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one frame from the front of `buf`, returning the frame and the
/// number of bytes it consumed. Returns `Err(IncompleteLength)` or
/// `Err(IncompleteBody)` when `buf` does not yet hold a whole frame —
/// callers should keep buffering and retry, not treat these as fatal.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), WireError> {
    if buf.len() < 4 {
        return Err(WireError::IncompleteLength);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let len = len as usize;
    if buf.len() < 4 + len {
        return Err(WireError::IncompleteBody);
    }
    let frame: Frame = ciborium::de::from_reader(Cursor::new(&buf[4..4 + len]))
        .map_err(|e| WireError::Decode(e.to_string()))?;
    Ok((frame, 4 + len))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Request, StatusUpdate};
    use weave_core::SiteInfo;

    fn sample_frame() -> Frame {
        Frame::Request {
            id: 7,
            request: Request::RequestSiteId {
                channel_id: "room-1".to_string(),
                proposed: SiteInfo { id: 3 },
            },
        }
    }

    // ── round trip ────────────────────────────────────────────────────────

    #[test]
    fn encode_decode_round_trip() {
        let frame = sample_frame();
        let bytes = encode(&frame).unwrap();
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, bytes.len());
    }

    // ── two frames back to back decode independently ────────────────────

    #[test]
    fn decode_consumes_only_one_frame() {
        let a = encode(&sample_frame()).unwrap();
        let b = encode(&Frame::Status {
            update: StatusUpdate::Connection { connected: true },
        })
        .unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);

        let (first, consumed) = decode(&buf).unwrap();
        assert_eq!(first, sample_frame());
        assert_eq!(consumed, a.len());

        let (second, consumed2) = decode(&buf[consumed..]).unwrap();
        assert_eq!(
            second,
            Frame::Status {
                update: StatusUpdate::Connection { connected: true }
            }
        );
        assert_eq!(consumed2, b.len());
    }

    // ── truncated input is reported as incomplete, not corrupt ──────────

    #[test]
    fn decode_reports_incomplete_length() {
        assert!(matches!(decode(&[1, 2]), Err(WireError::IncompleteLength)));
    }

    #[test]
    fn decode_reports_incomplete_body() {
        let bytes = encode(&sample_frame()).unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(decode(truncated), Err(WireError::IncompleteBody)));
    }

    // ── an oversized length prefix is rejected before any allocation ─────

    #[test]
    fn decode_rejects_oversized_length_prefix() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(decode(&buf), Err(WireError::FrameTooLarge(_))));
    }

    // ── decoding garbage bytes (valid length, invalid CBOR) errors cleanly ──

    #[test]
    fn decode_rejects_invalid_cbor_body() {
        let mut buf = 4u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(decode(&buf), Err(WireError::Decode(_))));
    }
}
