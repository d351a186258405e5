//! Frame codec for the waveform and event wire formats
//!
//! # Data format
//!
//! All multi-byte integers are little-endian, structures are packed with
//! no padding, and frames are self-delimiting through their header fields.
//!
//! Waveform frame:
//!
//! | offset | field          | type      |
//! |--------|----------------|-----------|
//! | 0      | timestamp      | u64       |
//! | 8      | channel        | u8        |
//! | 9      | samples_number | u32 (N)   |
//! | 13     | gates_number   | u8 (G)    |
//! | 14     | samples        | u16 × N   |
//! | 14+2N  | gates          | u8 × G·N  |
//!
//! Event frame (16 bytes): timestamp u64, qshort u16, qlong u16,
//! baseline u16, channel u8, flags u8. The baseline slot doubles as the
//! extra-gate feature when an extra gate is configured.
//!
//! A data message is one or more concatenated frames; the topic carries
//! the exact payload size so consumers can preallocate.

use thiserror::Error;

/// Waveform frame header size in bytes
pub const WAVEFORM_HEADER_SIZE: usize = 14;

/// Event record size in bytes
pub const EVENT_SIZE: usize = 16;

/// Topic prefix for binary waveform messages
pub const WAVEFORMS_TOPIC_PREFIX: &str = "data_abcd_waveforms_v0";

/// Topic prefix for binary event messages
pub const EVENTS_TOPIC_PREFIX: &str = "data_abcd_events_v0";

/// Topic for a waveform payload of exactly `payload_size` bytes
pub fn waveforms_data_topic(payload_size: usize) -> String {
    format!("{}_s{}", WAVEFORMS_TOPIC_PREFIX, payload_size)
}

/// Topic for an event payload of exactly `payload_size` bytes
pub fn events_data_topic(payload_size: usize) -> String {
    format!("{}_s{}", EVENTS_TOPIC_PREFIX, payload_size)
}

/// Topic for a worker's JSON status heartbeat
pub fn status_topic(module: &str) -> String {
    format!("status_{}", module)
}

/// Topic for a worker's JSON events (errors and notices)
pub fn events_topic(module: &str) -> String {
    format!("events_{}", module)
}

/// Frame decoding errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A field would read past the end of the buffer
    #[error("truncated frame: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

// ---------------------------------------------------------------------------
// Waveform frames
// ---------------------------------------------------------------------------

/// Decoded waveform frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformHeader {
    /// Digitizer tick count at the trigger
    pub timestamp: u64,
    /// Digitizer input index
    pub channel: u8,
    /// Count of samples in the frame
    pub samples_number: u32,
    /// Count of per-sample annotation lanes
    pub gates_number: u8,
}

impl WaveformHeader {
    /// Total frame size in bytes, header included
    pub fn frame_size(&self) -> usize {
        let n = self.samples_number as usize;
        WAVEFORM_HEADER_SIZE + 2 * n + self.gates_number as usize * n
    }
}

/// A waveform frame borrowed from a message buffer
#[derive(Debug, Clone, Copy)]
pub struct WaveformFrame<'a> {
    pub header: WaveformHeader,
    /// Raw sample bytes (2 × N, unaligned little-endian u16)
    pub samples: &'a [u8],
    /// Gate lanes, G × N bytes, lane-major
    pub gates: &'a [u8],
}

impl<'a> WaveformFrame<'a> {
    /// Decode the frame starting at `offset`, returning it together with
    /// the offset of the next frame.
    pub fn decode(buffer: &'a [u8], offset: usize) -> Result<(Self, usize), FrameError> {
        let header_end = offset
            .checked_add(WAVEFORM_HEADER_SIZE)
            .ok_or(FrameError::Truncated {
                offset,
                needed: WAVEFORM_HEADER_SIZE,
                available: buffer.len().saturating_sub(offset),
            })?;
        if header_end > buffer.len() {
            return Err(FrameError::Truncated {
                offset,
                needed: WAVEFORM_HEADER_SIZE,
                available: buffer.len().saturating_sub(offset),
            });
        }

        let header = WaveformHeader {
            timestamp: read_u64(buffer, offset),
            channel: buffer[offset + 8],
            samples_number: read_u32(buffer, offset + 9),
            gates_number: buffer[offset + 13],
        };

        let n = header.samples_number as usize;
        let samples_end = header_end + 2 * n;
        let gates_end = samples_end + header.gates_number as usize * n;
        if gates_end > buffer.len() {
            return Err(FrameError::Truncated {
                offset,
                needed: header.frame_size(),
                available: buffer.len().saturating_sub(offset),
            });
        }

        Ok((
            Self {
                header,
                samples: &buffer[header_end..samples_end],
                gates: &buffer[samples_end..gates_end],
            },
            gates_end,
        ))
    }

    /// Sample at index `i`
    #[inline]
    pub fn sample(&self, i: usize) -> u16 {
        u16::from_le_bytes([self.samples[2 * i], self.samples[2 * i + 1]])
    }

    /// Decode all samples into a reusable buffer
    pub fn read_samples_into(&self, out: &mut Vec<u16>) {
        out.clear();
        out.reserve(self.header.samples_number as usize);
        for pair in self.samples.chunks_exact(2) {
            out.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
    }

    /// Gate lane `lane` (N bytes)
    pub fn gate_lane(&self, lane: usize) -> &'a [u8] {
        let n = self.header.samples_number as usize;
        &self.gates[lane * n..(lane + 1) * n]
    }
}

/// Append a waveform frame built from raw sample bytes and gate lanes.
pub fn encode_waveform_into(
    out: &mut Vec<u8>,
    header: &WaveformHeader,
    samples: &[u8],
    gates: &[u8],
) {
    debug_assert_eq!(samples.len(), 2 * header.samples_number as usize);
    debug_assert_eq!(
        gates.len(),
        header.gates_number as usize * header.samples_number as usize
    );

    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.push(header.channel);
    out.extend_from_slice(&header.samples_number.to_le_bytes());
    out.push(header.gates_number);
    out.extend_from_slice(samples);
    out.extend_from_slice(gates);
}

/// Append a waveform frame built from decoded samples and gate lanes.
pub fn encode_waveform_samples_into(
    out: &mut Vec<u8>,
    timestamp: u64,
    channel: u8,
    samples: &[u16],
    gate_lanes: &[&[u8]],
) {
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push(channel);
    out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    out.push(gate_lanes.len() as u8);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    for lane in gate_lanes {
        debug_assert_eq!(lane.len(), samples.len());
        out.extend_from_slice(lane);
    }
}

// ---------------------------------------------------------------------------
// Event frames
// ---------------------------------------------------------------------------

/// Pile-up bit in the event flags byte
pub const FLAG_PILEUP: u8 = 0x01;

/// Per-pulse feature record, 16 bytes on the wire.
///
/// The layout is fixed: selection plug-ins receive a pointer to this
/// record through the C ABI and may rewrite it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EventPsd {
    pub timestamp: u64,
    pub qshort: u16,
    pub qlong: u16,
    /// Integer baseline, or the extra-gate feature when one is configured
    pub baseline: u16,
    pub channel: u8,
    pub flags: u8,
}

const _: () = assert!(
    std::mem::size_of::<EventPsd>() == EVENT_SIZE,
    "EventPsd must match the 16-byte wire format"
);

impl EventPsd {
    /// Encode into the 16-byte wire representation
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes[0..8].copy_from_slice(&{ self.timestamp }.to_le_bytes());
        bytes[8..10].copy_from_slice(&{ self.qshort }.to_le_bytes());
        bytes[10..12].copy_from_slice(&{ self.qlong }.to_le_bytes());
        bytes[12..14].copy_from_slice(&{ self.baseline }.to_le_bytes());
        bytes[14] = self.channel;
        bytes[15] = self.flags;
        bytes
    }

    /// Decode from a 16-byte wire representation
    pub fn from_bytes(bytes: &[u8; EVENT_SIZE]) -> Self {
        Self {
            timestamp: read_u64(bytes, 0),
            qshort: read_u16(bytes, 8),
            qlong: read_u16(bytes, 10),
            baseline: read_u16(bytes, 12),
            channel: bytes[14],
            flags: bytes[15],
        }
    }

    pub fn has_pileup(&self) -> bool {
        self.flags & FLAG_PILEUP != 0
    }
}

/// Decode a concatenated event message; trailing partial records are dropped.
pub fn decode_events(buffer: &[u8]) -> Vec<EventPsd> {
    buffer
        .chunks_exact(EVENT_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; EVENT_SIZE];
            bytes.copy_from_slice(chunk);
            EventPsd::from_bytes(&bytes)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Little-endian helpers
// ---------------------------------------------------------------------------

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
