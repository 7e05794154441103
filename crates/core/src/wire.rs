//! UDP datagram format shared by the producer relay and the viewer transport.
//!
//! Every datagram is at most [`MAX_DATAGRAM_SIZE`] bytes and starts with a
//! little-endian `u32` packet type:
//!
//! ```text
//!  0               4                8               12              16              20
//! +---------------+----------------+---------------+---------------+---------------+------------
//! | type (u32 LE) | frame number   | frame length  | chunk offset  | chunk length  | payload ...
//! +---------------+----------------+---------------+---------------+---------------+------------
//!                  \________________ ChunkHeader (type 0 and 2) ____________________/
//! ```
//!
//! | Type | Meaning |
//! |------|---------|
//! | 0 | frame data (server → viewer), chunked like type 2 |
//! | 1 | bitrate report (server → producer) |
//! | 2 | frame chunk (producer/viewer → server) |
//! | other | tick: the producer is ready for a bitrate report |
//!
//! Bitrate report body: `u64` viewer count, then per viewer a `u64` session id
//! and a `u32` target bitrate, all little-endian.

use crate::error::{Result, StreamError, ViolationKind};

/// Largest datagram exchanged on either UDP protocol.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Size of the leading packet type tag.
pub const TYPE_TAG_LEN: usize = 4;

/// Payload bytes that fit in one chunk datagram.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_DATAGRAM_SIZE - TYPE_TAG_LEN - ChunkHeader::LEN;

/// Greeting sent to the producer once enough viewers have joined.
pub const GREETING: &[u8] = b"Hello!";

const REPORT_ENTRY_LEN: usize = 12;

/// Number of viewers that fit in one bitrate report datagram.
pub const MAX_REPORT_ENTRIES: usize =
    (MAX_DATAGRAM_SIZE - TYPE_TAG_LEN - 8) / REPORT_ENTRY_LEN;

/// Datagram classification by the 4-byte type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    FrameData,
    BitrateReport,
    FrameChunk,
    Tick(u32),
}

impl PacketType {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::FrameData,
            1 => Self::BitrateReport,
            2 => Self::FrameChunk,
            other => Self::Tick(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::FrameData => 0,
            Self::BitrateReport => 1,
            Self::FrameChunk => 2,
            Self::Tick(other) => other,
        }
    }
}

/// Read the packet type tag of a datagram.
pub fn packet_type(datagram: &[u8]) -> Result<PacketType> {
    let tag = read_u32(datagram, 0)?;
    Ok(PacketType::from_tag(tag))
}

/// Fixed header preceding every chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Frame this chunk belongs to.
    pub frame_number: u32,
    /// Declared total length of the frame.
    pub frame_length: u32,
    /// Byte offset of this chunk within the frame.
    pub offset: u32,
    /// Number of payload bytes following the header.
    pub length: u32,
}

impl ChunkHeader {
    pub const LEN: usize = 16;

    /// Decode a header from the start of `buf` (the bytes after the type tag).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(StreamError::violation(ViolationKind::Truncated {
                needed: Self::LEN,
                got: buf.len(),
            }));
        }
        Ok(Self {
            frame_number: read_u32(buf, 0)?,
            frame_length: read_u32(buf, 4)?,
            offset: read_u32(buf, 8)?,
            length: read_u32(buf, 12)?,
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.frame_number.to_le_bytes());
        out[4..8].copy_from_slice(&self.frame_length.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Split a chunk datagram body (after the type tag) into header and payload.
///
/// The payload is cut to the declared length; a body shorter than declared
/// is rejected. Trailing padding is tolerated since producers send
/// fixed-size datagrams.
pub fn decode_chunk(body: &[u8]) -> Result<(ChunkHeader, &[u8])> {
    let header = ChunkHeader::decode(body)?;
    let rest = &body[ChunkHeader::LEN..];
    let declared = header.length as usize;
    if rest.len() < declared {
        return Err(StreamError::violation(ViolationKind::LengthMismatch {
            declared: header.length,
            actual: rest.len(),
        }));
    }
    Ok((header, &rest[..declared]))
}

/// Build one chunk datagram: type tag, header, payload.
pub fn encode_chunk(packet_type: PacketType, header: &ChunkHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TYPE_TAG_LEN + ChunkHeader::LEN + payload.len());
    out.extend_from_slice(&packet_type.tag().to_le_bytes());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// Fragment a whole frame into chunk datagrams of at most [`MAX_DATAGRAM_SIZE`].
///
/// An empty frame still yields one datagram so the receiver can complete it.
pub fn fragment_frame(packet_type: PacketType, frame_number: u32, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let frame_length = u32::try_from(data.len())
        .map_err(|_| StreamError::ResourceExhaustion(format!("frame of {} bytes", data.len())))?;

    if data.is_empty() {
        let header = ChunkHeader {
            frame_number,
            frame_length: 0,
            offset: 0,
            length: 0,
        };
        return Ok(vec![encode_chunk(packet_type, &header, &[])]);
    }

    let datagrams = data
        .chunks(MAX_CHUNK_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| {
            let header = ChunkHeader {
                frame_number,
                frame_length,
                offset: (i * MAX_CHUNK_PAYLOAD) as u32,
                length: chunk.len() as u32,
            };
            encode_chunk(packet_type, &header, chunk)
        })
        .collect();
    Ok(datagrams)
}

/// One viewer line in a bitrate report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateEntry {
    pub session_id: u64,
    pub bitrate_bps: u32,
}

/// Encode a bitrate report datagram, zero-padded to [`MAX_DATAGRAM_SIZE`].
///
/// Entries beyond [`MAX_REPORT_ENTRIES`] do not fit and are left out; the
/// count field always matches the entries actually written.
pub fn encode_bitrate_report(entries: &[BitrateEntry]) -> Vec<u8> {
    let written = &entries[..entries.len().min(MAX_REPORT_ENTRIES)];
    if written.len() < entries.len() {
        tracing::warn!(
            viewers = entries.len(),
            reported = written.len(),
            "bitrate report truncated to one datagram"
        );
    }

    let mut out = Vec::with_capacity(MAX_DATAGRAM_SIZE);
    out.extend_from_slice(&PacketType::BitrateReport.tag().to_le_bytes());
    out.extend_from_slice(&(written.len() as u64).to_le_bytes());
    for entry in written {
        out.extend_from_slice(&entry.session_id.to_le_bytes());
        out.extend_from_slice(&entry.bitrate_bps.to_le_bytes());
    }
    out.resize(MAX_DATAGRAM_SIZE, 0);
    out
}

/// Decode a bitrate report datagram (including its type tag).
pub fn decode_bitrate_report(datagram: &[u8]) -> Result<Vec<BitrateEntry>> {
    let count = read_u64(datagram, TYPE_TAG_LEN)? as usize;
    if count > MAX_REPORT_ENTRIES {
        return Err(StreamError::ResourceExhaustion(format!(
            "bitrate report claims {count} viewers"
        )));
    }
    let mut entries = Vec::with_capacity(count);
    let mut pos = TYPE_TAG_LEN + 8;
    for _ in 0..count {
        entries.push(BitrateEntry {
            session_id: read_u64(datagram, pos)?,
            bitrate_bps: read_u32(datagram, pos + 8)?,
        });
        pos += REPORT_ENTRY_LEN;
    }
    Ok(entries)
}

/// The greeting datagram: [`GREETING`] zero-padded to a full datagram.
pub fn greeting_datagram() -> Vec<u8> {
    let mut out = GREETING.to_vec();
    out.resize(MAX_DATAGRAM_SIZE, 0);
    out
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or(StreamError::violation(ViolationKind::Truncated {
            needed: pos + 4,
            got: buf.len(),
        }))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(buf: &[u8], pos: usize) -> Result<u64> {
    let bytes = buf
        .get(pos..pos + 8)
        .ok_or(StreamError::violation(ViolationKind::Truncated {
            needed: pos + 8,
            got: buf.len(),
        }))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_classification() {
        assert_eq!(PacketType::from_tag(0), PacketType::FrameData);
        assert_eq!(PacketType::from_tag(1), PacketType::BitrateReport);
        assert_eq!(PacketType::from_tag(2), PacketType::FrameChunk);
        assert_eq!(PacketType::from_tag(7), PacketType::Tick(7));
    }

    #[test]
    fn type_tag_is_little_endian() {
        let datagram = [2u8, 0, 0, 0, 0xFF];
        assert_eq!(packet_type(&datagram).unwrap(), PacketType::FrameChunk);

        let big_endian_two = [0u8, 0, 0, 2];
        assert_eq!(
            packet_type(&big_endian_two).unwrap(),
            PacketType::Tick(0x0200_0000)
        );
    }

    #[test]
    fn chunk_header_layout() {
        let header = ChunkHeader {
            frame_number: 7,
            frame_length: 0x0102_0304,
            offset: 16,
            length: 3,
        };
        let datagram = encode_chunk(PacketType::FrameChunk, &header, b"abc");
        assert_eq!(&datagram[0..4], &[2, 0, 0, 0]);
        assert_eq!(&datagram[4..8], &[7, 0, 0, 0]);
        assert_eq!(&datagram[8..12], &[4, 3, 2, 1]);
        assert_eq!(&datagram[20..], b"abc");

        let (decoded, payload) = decode_chunk(&datagram[TYPE_TAG_LEN..]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn decode_chunk_ignores_padding() {
        let header = ChunkHeader {
            frame_number: 1,
            frame_length: 2,
            offset: 0,
            length: 2,
        };
        let mut datagram = encode_chunk(PacketType::FrameChunk, &header, b"xy");
        datagram.resize(MAX_DATAGRAM_SIZE, 0);
        let (_, payload) = decode_chunk(&datagram[TYPE_TAG_LEN..]).unwrap();
        assert_eq!(payload, b"xy");
    }

    #[test]
    fn decode_chunk_rejects_short_payload() {
        let header = ChunkHeader {
            frame_number: 1,
            frame_length: 100,
            offset: 0,
            length: 50,
        };
        let datagram = encode_chunk(PacketType::FrameChunk, &header, &[0u8; 10]);
        let err = decode_chunk(&datagram[TYPE_TAG_LEN..]).unwrap_err();
        assert!(matches!(
            err,
            StreamError::ProtocolViolation(ViolationKind::LengthMismatch { declared: 50, actual: 10 })
        ));
    }

    #[test]
    fn decode_chunk_rejects_truncated_header() {
        assert!(matches!(
            decode_chunk(&[0u8; 9]),
            Err(StreamError::ProtocolViolation(ViolationKind::Truncated { .. }))
        ));
    }

    #[test]
    fn fragment_respects_datagram_size() {
        let data: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
        let datagrams = fragment_frame(PacketType::FrameData, 9, &data).unwrap();
        assert_eq!(datagrams.len(), 3);
        assert!(datagrams.iter().all(|d| d.len() <= MAX_DATAGRAM_SIZE));

        let mut rebuilt = vec![0u8; data.len()];
        for d in &datagrams {
            let (h, p) = decode_chunk(&d[TYPE_TAG_LEN..]).unwrap();
            assert_eq!(h.frame_number, 9);
            assert_eq!(h.frame_length, 4000);
            rebuilt[h.offset as usize..h.offset as usize + p.len()].copy_from_slice(p);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn fragment_empty_frame_yields_one_datagram() {
        let datagrams = fragment_frame(PacketType::FrameData, 3, &[]).unwrap();
        assert_eq!(datagrams.len(), 1);
        let (h, p) = decode_chunk(&datagrams[0][TYPE_TAG_LEN..]).unwrap();
        assert_eq!(h.frame_length, 0);
        assert!(p.is_empty());
    }

    #[test]
    fn bitrate_report_layout() {
        let entries = [
            BitrateEntry {
                session_id: 1,
                bitrate_bps: 240_000,
            },
            BitrateEntry {
                session_id: 2,
                bitrate_bps: 600_000,
            },
        ];
        let datagram = encode_bitrate_report(&entries);
        assert_eq!(datagram.len(), MAX_DATAGRAM_SIZE);
        assert_eq!(&datagram[0..4], &[1, 0, 0, 0]);
        assert_eq!(&datagram[4..12], &2u64.to_le_bytes());
        assert_eq!(&datagram[12..20], &1u64.to_le_bytes());
        assert_eq!(&datagram[20..24], &240_000u32.to_le_bytes());
        assert_eq!(decode_bitrate_report(&datagram).unwrap(), entries);
    }

    #[test]
    fn bitrate_report_truncates_to_one_datagram() {
        let entries: Vec<BitrateEntry> = (0..200)
            .map(|i| BitrateEntry {
                session_id: i,
                bitrate_bps: 1,
            })
            .collect();
        let datagram = encode_bitrate_report(&entries);
        assert_eq!(datagram.len(), MAX_DATAGRAM_SIZE);
        let decoded = decode_bitrate_report(&datagram).unwrap();
        assert_eq!(decoded.len(), MAX_REPORT_ENTRIES);
        assert_eq!(decoded[0].session_id, 0);
    }

    #[test]
    fn greeting_is_padded() {
        let g = greeting_datagram();
        assert_eq!(g.len(), MAX_DATAGRAM_SIZE);
        assert!(g.starts_with(b"Hello!"));
    }
}
