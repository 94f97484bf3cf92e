//! Wire framing: `kind:u8 | length:u16 LE | body`.

use crate::error::{NadeError, Result};

/// Frame header size on the wire.
pub const HEADER_LEN: usize = 3;
/// Largest accepted frame body; larger frames are dropped unparsed.
pub const MAX_FRAME_BODY: usize = 2048;
/// Fixed handshake body size (version/role/caps/reserved + keys + digest).
pub const HANDSHAKE_PAYLOAD_LEN: usize = 84;

/// Plaintext payload subtype: ADPCM audio.
pub const AUDIO_PAYLOAD_TYPE: u8 = 0xA1;
/// Control / plaintext subtype: keepalive.
pub const KEEPALIVE_TYPE: u8 = 0xCC;
/// Control / plaintext subtype: hangup request.
pub const HANGUP_TYPE: u8 = 0xDD;

/// Audio payload header that precedes the ADPCM bytes (after the subtype).
pub const AUDIO_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake = 0x01,
    Cipher = 0x02,
    Plaintext = 0x03,
    Control = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = NadeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::Handshake),
            0x02 => Ok(FrameKind::Cipher),
            0x03 => Ok(FrameKind::Plaintext),
            0x04 => Ok(FrameKind::Control),
            _ => Err(NadeError::FrameMalformed),
        }
    }
}

/// Build the 3-byte wire header for a frame body of `length` bytes.
pub fn encode_header(kind: FrameKind, length: u16) -> [u8; HEADER_LEN] {
    let len = length.to_le_bytes();
    [kind as u8, len[0], len[1]]
}

/// Parsed header of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub codec_version: u8,
    pub seq: u16,
    pub samples: u16,
    pub adpcm_len: u16,
}

/// A decoded plaintext body (the content of a Cipher frame after AEAD open,
/// a Plaintext frame, or a Control frame).
#[derive(Debug, PartialEq, Eq)]
pub enum PlainPayload<'a> {
    Audio { header: AudioHeader, adpcm: &'a [u8] },
    Keepalive,
    Hangup,
}

/// Parse a plaintext body by its leading subtype byte.
pub fn parse_plain(body: &[u8]) -> Result<PlainPayload<'_>> {
    match body.first() {
        Some(&AUDIO_PAYLOAD_TYPE) => {
            if body.len() < AUDIO_HEADER_LEN {
                return Err(NadeError::FrameMalformed);
            }
            let header = AudioHeader {
                codec_version: body[1],
                seq: u16::from_le_bytes([body[2], body[3]]),
                samples: u16::from_le_bytes([body[4], body[5]]),
                adpcm_len: u16::from_le_bytes([body[6], body[7]]),
            };
            let end = AUDIO_HEADER_LEN + header.adpcm_len as usize;
            if end > body.len() {
                return Err(NadeError::FrameMalformed);
            }
            Ok(PlainPayload::Audio { header, adpcm: &body[AUDIO_HEADER_LEN..end] })
        }
        Some(&KEEPALIVE_TYPE) => Ok(PlainPayload::Keepalive),
        Some(&HANGUP_TYPE) => Ok(PlainPayload::Hangup),
        _ => Err(NadeError::FrameMalformed),
    }
}

/// Build an audio plaintext body: subtype, header, ADPCM bytes.
pub fn encode_audio(seq: u16, samples: u16, adpcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + adpcm.len());
    out.push(AUDIO_PAYLOAD_TYPE);
    out.push(1); // codec version
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&samples.to_le_bytes());
    out.extend_from_slice(&(adpcm.len() as u16).to_le_bytes());
    out.extend_from_slice(adpcm);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [FrameKind::Handshake, FrameKind::Cipher, FrameKind::Plaintext, FrameKind::Control] {
            assert_eq!(FrameKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(FrameKind::try_from(0x05).is_err());
        assert!(FrameKind::try_from(0x00).is_err());
    }

    #[test]
    fn header_is_little_endian() {
        assert_eq!(encode_header(FrameKind::Cipher, 0x0102), [0x02, 0x02, 0x01]);
    }

    #[test]
    fn audio_body_roundtrip() {
        let adpcm = [0x11u8, 0x22, 0x33];
        let body = encode_audio(7, 320, &adpcm);
        match parse_plain(&body).unwrap() {
            PlainPayload::Audio { header, adpcm: parsed } => {
                assert_eq!(header.codec_version, 1);
                assert_eq!(header.seq, 7);
                assert_eq!(header.samples, 320);
                assert_eq!(header.adpcm_len, 3);
                assert_eq!(parsed, &adpcm);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn truncated_audio_is_rejected() {
        let body = encode_audio(1, 320, &[0u8; 10]);
        assert!(parse_plain(&body[..body.len() - 1]).is_err());
        assert!(parse_plain(&body[..5]).is_err());
    }

    #[test]
    fn control_subtypes() {
        assert_eq!(parse_plain(&[KEEPALIVE_TYPE]).unwrap(), PlainPayload::Keepalive);
        assert_eq!(parse_plain(&[HANGUP_TYPE]).unwrap(), PlainPayload::Hangup);
        assert!(parse_plain(&[]).is_err());
        assert!(parse_plain(&[0x42]).is_err());
    }
}
