//! Wire framing and the `CaptureRequest` byte codec.
//!
//! Frames wrap an arbitrary payload as `0x55 0xAA <escaped body> 0xAA 0x55`.
//! This is the interoperability contract with existing capture firmware and
//! must stay byte-identical.

const FRAME_START: [u8; 2] = [0x55, 0xAA];
const FRAME_END: [u8; 2] = [0xAA, 0x55];
const ESCAPE: u8 = 0xF0;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0xAA | 0x55 | 0xF0)
}

/// Escape and wrap `body` between the frame markers.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&FRAME_START);
    for &b in body {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&FRAME_END);
    out
}

/// Errors produced while decoding a framed byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is missing the leading 0x55 0xAA marker")]
    MissingStart,
    #[error("frame is missing the trailing 0xAA 0x55 marker")]
    MissingEnd,
    #[error("frame ends on a dangling escape byte")]
    DanglingEscape,
}

/// Strip frame markers and undo escaping, returning the original body.
pub fn decode_frame(framed: &[u8]) -> Result<Vec<u8>, FrameError> {
    if framed.len() < 4 || framed[0..2] != FRAME_START {
        return Err(FrameError::MissingStart);
    }
    if framed[framed.len() - 2..] != FRAME_END {
        return Err(FrameError::MissingEnd);
    }

    let body = &framed[2..framed.len() - 2];
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            let next = iter.next().ok_or(FrameError::DanglingEscape)?;
            out.push(next ^ ESCAPE);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Trigger hardware variant requested for a capture.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TriggerType {
    Edge = 0,
    Complex = 1,
    Fast = 2,
    Blast = 3,
}

impl TriggerType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Edge),
            1 => Some(Self::Complex),
            2 => Some(Self::Fast),
            3 => Some(Self::Blast),
            _ => None,
        }
    }
}

/// Exactly the 45-byte little-endian layout the capture firmware expects.
///
/// `channels` is a 24-element presence mask (one byte per channel, 0/1),
/// not a list of channel numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub trigger_type: u8,
    pub trigger: u8,
    pub inverted_or_count: u8,
    pub trigger_value: u16,
    pub channels: [u8; 24],
    pub channel_count: u8,
    pub frequency: u32,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub loop_count: u8,
    pub measure: u8,
    pub capture_mode: u8,
}

pub const CAPTURE_REQUEST_LEN: usize = 45;

impl CaptureRequest {
    /// Serialize to the fixed 45-byte little-endian layout.
    pub fn to_bytes(&self) -> [u8; CAPTURE_REQUEST_LEN] {
        let mut b = [0u8; CAPTURE_REQUEST_LEN];
        b[0] = self.trigger_type;
        b[1] = self.trigger;
        b[2] = self.inverted_or_count;
        b[3..5].copy_from_slice(&self.trigger_value.to_le_bytes());
        b[5..29].copy_from_slice(&self.channels);
        b[29] = self.channel_count;
        b[30..34].copy_from_slice(&self.frequency.to_le_bytes());
        b[34..38].copy_from_slice(&self.pre_samples.to_le_bytes());
        b[38..42].copy_from_slice(&self.post_samples.to_le_bytes());
        b[42] = self.loop_count;
        b[43] = self.measure;
        b[44] = self.capture_mode;
        b
    }

    /// Parse the fixed 45-byte little-endian layout.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CAPTURE_REQUEST_LEN {
            return None;
        }
        let mut channels = [0u8; 24];
        channels.copy_from_slice(&bytes[5..29]);
        Some(Self {
            trigger_type: bytes[0],
            trigger: bytes[1],
            inverted_or_count: bytes[2],
            trigger_value: u16::from_le_bytes([bytes[3], bytes[4]]),
            channels,
            channel_count: bytes[29],
            frequency: u32::from_le_bytes(bytes[30..34].try_into().unwrap()),
            pre_samples: u32::from_le_bytes(bytes[34..38].try_into().unwrap()),
            post_samples: u32::from_le_bytes(bytes[38..42].try_into().unwrap()),
            loop_count: bytes[42],
            measure: bytes[43],
            capture_mode: bytes[44],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_round_trip_scenario() {
        let body = [0xAA, 0x01, 0x55, 0xF0];
        let encoded = encode_frame(&body);
        assert_eq!(
            encoded,
            vec![0x55, 0xAA, 0xF0, 0x5A, 0x01, 0xF0, 0xA5, 0xF0, 0x00, 0xAA, 0x55]
        );
        assert_eq!(decode_frame(&encoded).unwrap(), body);
    }

    #[test]
    fn framer_missing_markers() {
        assert_eq!(decode_frame(&[0x00, 0x01]), Err(FrameError::MissingStart));
        assert_eq!(
            decode_frame(&[0x55, 0xAA, 0x01, 0x02]),
            Err(FrameError::MissingEnd)
        );
    }

    #[test]
    fn capture_request_layout_scenario() {
        let mut channels = [0u8; 24];
        for c in channels.iter_mut().take(8) {
            *c = 1;
        }
        let req = CaptureRequest {
            trigger_type: 1,
            trigger: 0,
            inverted_or_count: 0,
            trigger_value: 0x1234,
            channels,
            channel_count: 8,
            frequency: 100_000_000,
            pre_samples: 1000,
            post_samples: 9000,
            loop_count: 0,
            measure: 0,
            capture_mode: 0,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), CAPTURE_REQUEST_LEN);
        assert_eq!(&bytes[3..5], &[0x34, 0x12]);
        // frequency occupies bytes 30..34 per the declared field layout
        // (3 single-byte fields + u16 + channels[24] + channel_count = offset 30)
        assert_eq!(&bytes[30..34], &[0x00, 0xE1, 0xF5, 0x05]);
        assert_eq!(CaptureRequest::from_bytes(&bytes).unwrap(), req);
    }

    proptest::proptest! {
        #[test]
        fn framer_round_trip_any_bytes(body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let encoded = encode_frame(&body);
            proptest::prop_assert_eq!(decode_frame(&encoded).unwrap(), body);
        }
    }
}
