use thiserror::Error;

use crate::servo::protocol::stservo_def::*;

/// One protocol message. `code` is the instruction on requests and the servo
/// status byte on replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub code: u8,
    pub params: Vec<u8>,
}

impl Frame {
    pub fn new(id: u8, code: u8, params: Vec<u8>) -> Self {
        Self { id, code, params }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.id, self.code, &self.params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorKind {
    Framing,
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("no sync marker in {0} bytes")]
    NoSync(usize),
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid length field {0}")]
    BadLength(u8),
    #[error("checksum mismatch from id {id}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { id: u8, expected: u8, actual: u8 },
}

impl FrameError {
    pub fn kind(&self) -> FrameErrorKind {
        match self {
            FrameError::Checksum { .. } => FrameErrorKind::Checksum,
            _ => FrameErrorKind::Framing,
        }
    }
}

pub fn encode(id: u8, code: u8, params: &[u8]) -> Vec<u8> {
    debug_assert!(params.len() + PKT_MIN_LEN <= TXPACKET_MAX_LEN);

    let length = (params.len() + 2) as u8;
    let mut frame = Vec::with_capacity(PKT_MIN_LEN + params.len());
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(length);
    frame.push(code);
    frame.extend_from_slice(params);
    let sum = checksum(&frame[PKT_ID..]);
    frame.push(sum);
    frame
}

pub fn decode(buffer: &[u8]) -> Result<Frame, FrameError> {
    decode_prefix(buffer).map(|(frame, _)| frame)
}

/// Decodes the first frame in `buffer`, skipping anything before the sync
/// marker. Returns the frame and the number of bytes consumed through its
/// checksum byte.
pub fn decode_prefix(buffer: &[u8]) -> Result<(Frame, usize), FrameError> {
    match scan(buffer) {
        Scan::Empty => Err(FrameError::NoSync(buffer.len())),
        Scan::Partial { start, needed } => Err(FrameError::Truncated {
            needed,
            available: buffer.len() - start,
        }),
        Scan::Invalid { length, .. } => Err(FrameError::BadLength(length)),
        Scan::Complete { start, total } => {
            let raw = &buffer[start..start + total];
            let expected = checksum(&raw[PKT_ID..total - 1]);
            let actual = raw[total - 1];
            if expected != actual {
                return Err(FrameError::Checksum {
                    id: raw[PKT_ID],
                    expected,
                    actual,
                });
            }

            let frame = Frame {
                id: raw[PKT_ID],
                code: raw[PKT_INSTRUCTION],
                params: raw[PKT_PARAMETER0..total - 1].to_vec(),
            };
            Ok((frame, start + total))
        }
    }
}

/// Splits complete raw frames off the front of a receive stream. Garbage
/// before a sync marker is dropped; an incomplete trailing frame is kept.
pub fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    loop {
        match scan(buffer) {
            Scan::Complete { start, total } => {
                let frame: Vec<u8> = buffer.drain(0..start + total).skip(start).collect();
                frames.push(frame);
            }
            Scan::Partial { start, .. } => {
                buffer.drain(0..start);
                break;
            }
            Scan::Invalid { start, .. } => {
                buffer.drain(0..start + 1);
            }
            Scan::Empty => {
                let keep_tail = buffer.last() == Some(&HEADER[0]);
                let cut = if keep_tail { buffer.len() - 1 } else { buffer.len() };
                buffer.drain(0..cut);
                break;
            }
        }
    }

    frames
}

pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    !sum
}

enum Scan {
    Empty,
    Partial { start: usize, needed: usize },
    Invalid { start: usize, length: u8 },
    Complete { start: usize, total: usize },
}

fn find_sync(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&idx| {
        buffer[idx] == HEADER[0]
            && buffer[idx + 1] == HEADER[1]
            // 0xFF is never an id, so `FF FF FF` means the marker starts later
            && buffer.get(idx + PKT_ID).map_or(true, |id| *id <= BROADCAST_ID)
    })
}

fn scan(buffer: &[u8]) -> Scan {
    let Some(start) = find_sync(buffer) else {
        return Scan::Empty;
    };

    let available = buffer.len() - start;
    if available <= PKT_LENGTH {
        return Scan::Partial {
            start,
            needed: PKT_MIN_LEN,
        };
    }

    let length = buffer[start + PKT_LENGTH];
    if length < 2 || length as usize > RXPACKET_MAX_LEN {
        return Scan::Invalid { start, length };
    }

    let total = length as usize + PKT_LENGTH + 1;
    if available < total {
        return Scan::Partial {
            start,
            needed: total,
        };
    }

    Scan::Complete { start, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_known_ping_frame() {
        // FF FF 01 02 01 FB is the reference ping for id 1
        assert_eq!(encode(1, INST_PING, &[]), vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn decode_recovers_encoded_frame_for_every_id() {
        let payloads: [&[u8]; 4] = [
            &[],
            &[STS_TORQUE_ENABLE, 0],
            &[STS_GOAL_POSITION_L, 0x00, 0x08, 0x00, 0x00, 0xE8, 0x03],
            &[0xFF; 16],
        ];
        for id in 0..=BROADCAST_ID {
            for params in payloads {
                let bytes = encode(id, INST_WRITE, params);
                let frame = decode(&bytes).unwrap_or_else(|err| panic!("id {id} len {}: {err}", params.len()));
                assert_eq!(frame.id, id);
                assert_eq!(frame.code, INST_WRITE);
                assert_eq!(frame.params, params.to_vec());
            }
        }
    }

    #[test]
    fn broadcast_frame_after_stray_header_byte_is_found() {
        let mut stream = vec![0xFF];
        stream.extend(encode(BROADCAST_ID, INST_WRITE, &[STS_TORQUE_ENABLE, 1]));
        let frames = drain_frames(&mut stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).expect("decode").id, BROADCAST_ID);
        assert!(stream.is_empty());
    }

    #[test]
    fn any_single_bit_flip_in_payload_or_checksum_is_a_checksum_error() {
        let bytes = encode(3, INST_READ, &[STS_PRESENT_LOAD_L, 2]);
        for idx in PKT_PARAMETER0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[idx] ^= 1 << bit;
                let err = decode(&corrupted).expect_err("corruption must be detected");
                assert_eq!(err.kind(), FrameErrorKind::Checksum, "byte {idx} bit {bit}");
            }
        }
    }

    #[test]
    fn decode_skips_stray_bytes_before_sync() {
        let mut bytes = vec![0x13, 0xFF, 0x42];
        bytes.extend(encode(1, 0, &[0x00, 0x08]));
        let (frame, consumed) = decode_prefix(&bytes).expect("decode after garbage");
        assert_eq!(frame.params, vec![0x00, 0x08]);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn decode_skips_repeated_header_bytes() {
        let mut bytes = vec![0xFF];
        bytes.extend(encode(2, 0, &[]));
        let frame = decode(&bytes).expect("decode");
        assert_eq!(frame.id, 2);
    }

    #[test]
    fn declared_length_beyond_buffer_is_truncated() {
        let bytes = encode(1, 0, &[1, 2, 3, 4]);
        let err = decode(&bytes[..bytes.len() - 2]).expect_err("short buffer");
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: bytes.len(),
                available: bytes.len() - 2
            }
        );
        assert_eq!(err.kind(), FrameErrorKind::Framing);
    }

    #[test]
    fn missing_sync_and_bad_length_are_framing_errors() {
        assert_eq!(decode(&[0x01, 0x02, 0x03]), Err(FrameError::NoSync(3)));
        let err = decode(&[0xFF, 0xFF, 0x01, 0x01, 0x00, 0xFD]).expect_err("length 1");
        assert_eq!(err, FrameError::BadLength(1));
        assert_eq!(err.kind(), FrameErrorKind::Framing);
    }

    #[test]
    fn drain_frames_splits_stream_and_keeps_partial_tail() {
        let first = encode(1, INST_PING, &[]);
        let second = encode(2, INST_READ, &[STS_PRESENT_POSITION_L, 2]);
        let mut stream = vec![0x00, 0x11];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&second[..3]);

        let frames = drain_frames(&mut stream);
        assert_eq!(frames, vec![first, second.clone()]);
        assert_eq!(stream, second[..3].to_vec());
    }
}
