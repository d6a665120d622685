//! Anchor wire protocol: fixed 33-byte frames
//!
//! ```text
//! offset  size  field
//!   0      1    header (0x55)
//!   1      1    function code
//!   2      2    declared data length (u16 LE)
//!   4      1    anchor role
//!   5      1    anchor id
//!   6      4    local time (u32 LE)
//!  10      4    system time (u32 LE)
//!  14      4    reserved
//!  18      2    voltage mV (u16 LE)
//!  20      1    node count
//!  21      1    tag role
//!  22      1    tag id
//!  23      3    distance mm (i24 LE)
//!  26      2    angle, degrees x 100 (i16 LE)
//!  28      1    first-path signal (i8)
//!  29      1    rx signal (i8)
//!  30      2    reserved
//!  32      1    checksum: sum of bytes 0..32 mod 256
//! ```

use aoatrack::PolarMeasurement;
use serde::{Deserialize, Serialize};

pub const FRAME_HEADER: u8 = 0x55;
pub const FRAME_LEN: usize = 33;
const CHECKSUM_OFFSET: usize = FRAME_LEN - 1;

/// Data length announced by the anchor firmware
pub const DEFAULT_DATA_LENGTH: u16 = 20;

const I24_MIN: i32 = -(1 << 23);
const I24_MAX: i32 = (1 << 23) - 1;

/// One decoded measurement frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub function_code: u8,
    pub data_length: u16,
    pub anchor_role: u8,
    pub anchor_id: u8,
    pub local_time: u32,
    pub system_time: u32,
    pub voltage_mv: u16,
    pub node_count: u8,
    pub tag_role: u8,
    pub tag_id: u8,
    /// Signed 24-bit on the wire
    pub distance_mm: i32,
    pub angle_centidegrees: i16,
    pub first_path_signal: i8,
    pub rx_signal: i8,
    pub checksum_valid: bool,
}

impl Frame {
    /// Measurement frame with the anchor's usual header fields
    pub fn measurement(anchor_id: u8, tag_id: u8, distance_mm: i32, angle_centidegrees: i16) -> Self {
        Self {
            function_code: 0,
            data_length: DEFAULT_DATA_LENGTH,
            anchor_role: 1,
            anchor_id,
            local_time: 0,
            system_time: 0,
            voltage_mv: 0,
            node_count: 1,
            tag_role: 2,
            tag_id,
            distance_mm,
            angle_centidegrees,
            first_path_signal: 0,
            rx_signal: 0,
            checksum_valid: true,
        }
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_mm as f64 / 1000.0
    }

    pub fn angle_deg(&self) -> f64 {
        self.angle_centidegrees as f64 / 100.0
    }

    pub fn polar(&self) -> PolarMeasurement {
        PolarMeasurement::new(self.distance_mm, self.angle_centidegrees)
    }

    /// Decode one frame; `checksum_valid` reports whether byte 32 matched
    pub fn decode(bytes: &[u8; FRAME_LEN]) -> Self {
        let raw_distance = u32::from_le_bytes([bytes[23], bytes[24], bytes[25], 0]);
        // Sign-extend from 24 bits
        let distance_mm = ((raw_distance << 8) as i32) >> 8;

        Self {
            function_code: bytes[1],
            data_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            anchor_role: bytes[4],
            anchor_id: bytes[5],
            local_time: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            system_time: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
            voltage_mv: u16::from_le_bytes([bytes[18], bytes[19]]),
            node_count: bytes[20],
            tag_role: bytes[21],
            tag_id: bytes[22],
            distance_mm,
            angle_centidegrees: i16::from_le_bytes([bytes[26], bytes[27]]),
            first_path_signal: bytes[28] as i8,
            rx_signal: bytes[29] as i8,
            checksum_valid: checksum(&bytes[..CHECKSUM_OFFSET]) == bytes[CHECKSUM_OFFSET],
        }
    }

    /// Encode with a correct checksum. Reserved bytes are zero and
    /// `distance_mm` is saturated to the 24-bit range.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = FRAME_HEADER;
        out[1] = self.function_code;
        out[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        out[4] = self.anchor_role;
        out[5] = self.anchor_id;
        out[6..10].copy_from_slice(&self.local_time.to_le_bytes());
        out[10..14].copy_from_slice(&self.system_time.to_le_bytes());
        out[18..20].copy_from_slice(&self.voltage_mv.to_le_bytes());
        out[20] = self.node_count;
        out[21] = self.tag_role;
        out[22] = self.tag_id;
        let distance = self.distance_mm.clamp(I24_MIN, I24_MAX).to_le_bytes();
        out[23..26].copy_from_slice(&distance[..3]);
        out[26..28].copy_from_slice(&self.angle_centidegrees.to_le_bytes());
        out[28] = self.first_path_signal as u8;
        out[29] = self.rx_signal as u8;
        out[CHECKSUM_OFFSET] = checksum(&out[..CHECKSUM_OFFSET]);
        out
    }
}

/// Sum of `bytes` mod 256
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Cumulative extractor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractorCounters {
    pub frames_ok: u64,
    pub frames_error: u64,
    /// Bytes removed from the buffer: decoded frames plus discarded noise
    pub bytes_consumed: u64,
}

/// Streaming frame decoder with resynchronization
///
/// Bytes may arrive in arbitrary chunks. A candidate that fails its checksum
/// costs one error and a single byte of progress, so a stray header inside
/// noise never swallows the real frame that follows it.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
    counters: ExtractorCounters,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 4),
            counters: ExtractorCounters::default(),
        }
    }

    /// Append `bytes` and return every complete valid frame plus the number
    /// of checksum failures seen during this call
    pub fn feed(&mut self, bytes: &[u8]) -> (Vec<Frame>, u64) {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut errors = 0u64;
        let mut pos = 0;

        while let Some(offset) = self.buffer[pos..].iter().position(|&b| b == FRAME_HEADER) {
            pos += offset;
            if self.buffer.len() - pos < FRAME_LEN {
                break;
            }

            let mut candidate = [0u8; FRAME_LEN];
            candidate.copy_from_slice(&self.buffer[pos..pos + FRAME_LEN]);

            if checksum(&candidate[..CHECKSUM_OFFSET]) == candidate[CHECKSUM_OFFSET] {
                frames.push(Frame::decode(&candidate));
                pos += FRAME_LEN;
            } else {
                errors += 1;
                pos += 1;
            }
        }

        // No header left: nothing past `pos` can start a frame
        if pos < self.buffer.len() && !self.buffer[pos..].contains(&FRAME_HEADER) {
            pos = self.buffer.len();
        }

        self.buffer.drain(..pos);
        self.counters.frames_ok += frames.len() as u64;
        self.counters.frames_error += errors;
        self.counters.bytes_consumed += pos as u64;

        if errors > 0 {
            log::debug!(
                "Frame extractor: {} checksum failures, {} frames, {} bytes retained",
                errors,
                frames.len(),
                self.buffer.len()
            );
        }

        (frames, errors)
    }

    pub fn counters(&self) -> ExtractorCounters {
        self.counters
    }

    /// Bytes retained for the next `feed`
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop retained bytes; counters are kept
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
