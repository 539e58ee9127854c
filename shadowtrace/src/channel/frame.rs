// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace frame wire format.
//!
//! Every event on the pipe is one fixed-size header followed by a
//! variable-length payload: the source path, a NUL, then the message text.
//! The kind selects the text encoding (narrow UTF-8 or wide UTF-16LE); the
//! path is always narrow. All header fields are little-endian.

use crate::shared::constants::ST_FRAME_HEADER_SIZE;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TraceEventKind {
    /// UTF-8 message text.
    Narrow = 1,
    /// UTF-16LE message text.
    Wide = 2,
}

impl TraceEventKind {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(TraceEventKind::Narrow),
            2 => Some(TraceEventKind::Wide),
            _ => None,
        }
    }
}

/// An event as handed to the channel by the instrumented application.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent<'a> {
    pub kind: TraceEventKind,
    pub source_path: &'a str,
    pub source_line: u32,
    pub message: &'a str,
}

/// Wall-clock timestamp as it travels on the wire: 16 bytes, seconds since
/// the Unix epoch plus subsecond nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireTimestamp {
    pub secs: i64,
    pub subsec_nanos: u32,
}

impl WireTimestamp {
    pub fn from_datetime(when: DateTime<Utc>) -> Self {
        Self {
            secs: when.timestamp(),
            subsec_nanos: when.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub kind: i32,
    pub thread_id: u32,
    pub remapped_id: u32,
    pub timestamp: WireTimestamp,
    pub payload_size: u32,
    pub text_offset: u32,
    pub source_line: u32,
    /// Seconds on the sender's high-resolution clock since connection
    /// establishment.
    pub counter: f64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; ST_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; ST_FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.thread_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.remapped_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.secs.to_le_bytes());
        buf[20..24].copy_from_slice(&self.timestamp.subsec_nanos.to_le_bytes());
        // buf[24..28] is timestamp padding, kept zero.
        buf[28..32].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.text_offset.to_le_bytes());
        buf[36..40].copy_from_slice(&self.source_line.to_le_bytes());
        buf[40..48].copy_from_slice(&self.counter.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ST_FRAME_HEADER_SIZE]) -> Self {
        let field = |range: std::ops::Range<usize>| -> [u8; 4] {
            let mut out = [0u8; 4];
            out.copy_from_slice(&buf[range]);
            out
        };
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&buf[12..20]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&buf[40..48]);
        Self {
            kind: i32::from_le_bytes(field(0..4)),
            thread_id: u32::from_le_bytes(field(4..8)),
            remapped_id: u32::from_le_bytes(field(8..12)),
            timestamp: WireTimestamp {
                secs: i64::from_le_bytes(secs),
                subsec_nanos: u32::from_le_bytes(field(20..24)),
            },
            payload_size: u32::from_le_bytes(field(28..32)),
            text_offset: u32::from_le_bytes(field(32..36)),
            source_line: u32::from_le_bytes(field(36..40)),
            counter: f64::from_le_bytes(counter),
        }
    }
}

/// Encodes the payload segment and returns (payload, text_offset).
pub fn encode_payload(event: &TraceEvent<'_>) -> (Vec<u8>, u32) {
    let path = event.source_path.as_bytes();
    let mut payload = Vec::with_capacity(path.len() + 1 + event.message.len() * 2);
    payload.extend_from_slice(path);
    payload.push(0);
    let text_offset = payload.len() as u32;
    match event.kind {
        TraceEventKind::Narrow => payload.extend_from_slice(event.message.as_bytes()),
        TraceEventKind::Wide => {
            for unit in event.message.encode_utf16() {
                payload.extend_from_slice(&unit.to_le_bytes());
            }
        }
    }
    (payload, text_offset)
}

/// A frame as reassembled by the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub source_path: String,
    pub message: String,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("Unknown trace event kind: {0}")]
    UnknownKind(i32),
    #[error("Payload shorter than its text offset")]
    TruncatedPayload,
    #[error("Wide payload length is not a whole number of UTF-16 units")]
    RaggedWidePayload,
}

pub fn decode_payload(
    header: &FrameHeader,
    payload: &[u8],
) -> Result<DecodedFrame, FrameDecodeError> {
    let kind =
        TraceEventKind::from_wire(header.kind).ok_or(FrameDecodeError::UnknownKind(header.kind))?;
    let text_offset = header.text_offset as usize;
    if payload.len() < text_offset || text_offset == 0 {
        return Err(FrameDecodeError::TruncatedPayload);
    }
    // The path segment ends with its NUL separator.
    let source_path = String::from_utf8_lossy(&payload[..text_offset - 1]).into_owned();
    let text = &payload[text_offset..];
    let message = match kind {
        TraceEventKind::Narrow => String::from_utf8_lossy(text).into_owned(),
        TraceEventKind::Wide => {
            if text.len() % 2 != 0 {
                return Err(FrameDecodeError::RaggedWidePayload);
            }
            let units: Vec<u16> = text
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    };
    Ok(DecodedFrame {
        header: *header,
        source_path,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(kind: TraceEventKind, payload_size: u32, text_offset: u32) -> FrameHeader {
        FrameHeader {
            kind: kind as i32,
            thread_id: 4242,
            remapped_id: 7,
            timestamp: WireTimestamp {
                secs: 1_741_000_000,
                subsec_nanos: 987_654_321,
            },
            payload_size,
            text_offset,
            source_line: 113,
            counter: 12.125,
        }
    }

    #[test]
    fn header_is_exactly_48_bytes_and_round_trips() {
        let header = sample_header(TraceEventKind::Narrow, 64, 10);
        let encoded = header.encode();
        assert_eq!(encoded.len(), ST_FRAME_HEADER_SIZE);
        assert_eq!(FrameHeader::decode(&encoded), header);
    }

    #[test]
    fn narrow_payload_round_trips() {
        let event = TraceEvent {
            kind: TraceEventKind::Narrow,
            source_path: "src/panel/files.rs",
            source_line: 88,
            message: "refresh started",
        };
        let (payload, text_offset) = encode_payload(&event);
        let header = sample_header(TraceEventKind::Narrow, payload.len() as u32, text_offset);
        let decoded = decode_payload(&header, &payload).expect("decode");
        assert_eq!(decoded.source_path, event.source_path);
        assert_eq!(decoded.message, event.message);
    }

    #[test]
    fn wide_payload_doubles_text_and_round_trips() {
        let event = TraceEvent {
            kind: TraceEventKind::Wide,
            source_path: "core/io.rs",
            source_line: 5,
            message: "überlänge-Prüfung",
        };
        let (payload, text_offset) = encode_payload(&event);
        let text_bytes = payload.len() - text_offset as usize;
        assert_eq!(text_bytes % 2, 0);
        let header = sample_header(TraceEventKind::Wide, payload.len() as u32, text_offset);
        let decoded = decode_payload(&header, &payload).expect("decode");
        assert_eq!(decoded.message, event.message);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut header = sample_header(TraceEventKind::Narrow, 4, 1);
        header.kind = 99;
        assert_eq!(
            decode_payload(&header, &[0, 1, 2, 3]).unwrap_err(),
            FrameDecodeError::UnknownKind(99)
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let header = sample_header(TraceEventKind::Narrow, 2, 10);
        assert_eq!(
            decode_payload(&header, &[0, 1]).unwrap_err(),
            FrameDecodeError::TruncatedPayload
        );
    }

    #[test]
    fn ragged_wide_payload_is_rejected() {
        let event = TraceEvent {
            kind: TraceEventKind::Wide,
            source_path: "a",
            source_line: 1,
            message: "bc",
        };
        let (mut payload, text_offset) = encode_payload(&event);
        payload.pop();
        let header = sample_header(TraceEventKind::Wide, payload.len() as u32, text_offset);
        assert_eq!(
            decode_payload(&header, &payload).unwrap_err(),
            FrameDecodeError::RaggedWidePayload
        );
    }
}
