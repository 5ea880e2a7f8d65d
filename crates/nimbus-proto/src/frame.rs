//! Data-stream preamble and incremental message framing.
//!
//! Every data-stream message is preceded by a fixed 6-byte signature and a
//! 2-byte ASCII protocol version. Control-stream RPC messages carry no
//! preamble; both kinds share the segment-table-based size probe used for
//! incremental parsing of partially received buffers.

use crate::codec::WORD;
use thiserror::Error;

/// Signature preceding every data-stream message.
pub const DATA_STREAM_SIGNATURE: [u8; 6] = [0x0A, 0x36, 0xCD, 0x12, 0xA1, 0x3E];

/// Signature of the sibling RPC stream kind. Declared for completeness; the
/// control stream carries bare RPC messages and never uses it.
pub const RPC_STREAM_SIGNATURE: [u8; 6] = [0x52, 0xBB, 0x82, 0x5C, 0xDB, 0x65];

/// ASCII protocol version following the signature.
pub const PROTOCOL_VERSION: [u8; 2] = *b"01";

/// Total preamble length in bytes.
pub const PREAMBLE_LEN: usize = DATA_STREAM_SIGNATURE.len() + PROTOCOL_VERSION.len();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short for preamble: {0} bytes")]
    PreambleTooShort(usize),

    #[error("invalid data stream signature")]
    BadSignature,

    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion([u8; 2]),

    #[error("multi-segment messages not supported (got {0} segments)")]
    MultiSegment(u32),
}

/// Appends the signature + version preamble to `out`.
pub fn write_preamble(out: &mut Vec<u8>) {
    out.extend_from_slice(&DATA_STREAM_SIGNATURE);
    out.extend_from_slice(&PROTOCOL_VERSION);
}

/// Verifies the preamble and returns the bytes following it.
pub fn strip_preamble(data: &[u8]) -> Result<&[u8], FrameError> {
    if data.len() < PREAMBLE_LEN {
        return Err(FrameError::PreambleTooShort(data.len()));
    }
    if data[..6] != DATA_STREAM_SIGNATURE {
        return Err(FrameError::BadSignature);
    }
    if data[6..8] != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion([data[6], data[7]]));
    }
    Ok(&data[PREAMBLE_LEN..])
}

/// Probes the exact wire size of the next single-segment message in `data`
/// by parsing just the segment table.
///
/// Returns `Ok(None)` while more bytes are needed and `Ok(Some(size))` once
/// the table and body are fully present. A header announcing more than one
/// segment is a framing error.
pub fn probe_message_size(data: &[u8]) -> Result<Option<usize>, FrameError> {
    if data.len() < WORD {
        return Ok(None);
    }
    let num_segs_minus1 = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if num_segs_minus1 != 0 {
        return Err(FrameError::MultiSegment(num_segs_minus1 + 1));
    }
    let seg_words = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let total = WORD + seg_words * WORD;
    if total > data.len() {
        return Ok(None);
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Builder, ENCODE_SCRATCH};

    fn sample_message(text: &str) -> Vec<u8> {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        b.write_text(rp, text).unwrap();
        b.finalize()
    }

    #[test]
    fn test_preamble_roundtrip() {
        let body = sample_message("payload");
        let mut wire = Vec::new();
        write_preamble(&mut wire);
        wire.extend_from_slice(&body);

        let rest = strip_preamble(&wire).unwrap();
        assert_eq!(rest, &body[..]);
    }

    #[test]
    fn test_any_corrupted_preamble_byte_rejected() {
        let mut wire = Vec::new();
        write_preamble(&mut wire);
        wire.extend_from_slice(&sample_message("x"));

        for i in 0..PREAMBLE_LEN {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0xFF;
            assert!(
                strip_preamble(&corrupted).is_err(),
                "byte {i} corruption was accepted"
            );
        }
    }

    #[test]
    fn test_preamble_too_short() {
        assert_eq!(
            strip_preamble(&DATA_STREAM_SIGNATURE[..4]),
            Err(FrameError::PreambleTooShort(4))
        );
    }

    #[test]
    fn test_probe_concatenated_messages() {
        let m1 = sample_message("first message");
        let m2 = sample_message("second");
        let mut joined = m1.clone();
        joined.extend_from_slice(&m2);

        assert_eq!(probe_message_size(&joined), Ok(Some(m1.len())));
        assert_eq!(probe_message_size(&joined[m1.len()..]), Ok(Some(m2.len())));
    }

    #[test]
    fn test_probe_short_prefix_needs_more() {
        let m1 = sample_message("incremental");
        for cut in 0..m1.len() {
            assert_eq!(
                probe_message_size(&m1[..cut]),
                Ok(None),
                "prefix of {cut} bytes should be incomplete"
            );
        }
        assert_eq!(probe_message_size(&m1), Ok(Some(m1.len())));
    }

    #[test]
    fn test_probe_rejects_multi_segment() {
        let mut header = vec![0u8; 8];
        header[0] = 2;
        assert_eq!(probe_message_size(&header), Err(FrameError::MultiSegment(3)));
    }
}
