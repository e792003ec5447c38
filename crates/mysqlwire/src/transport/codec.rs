//! Packet framing without I/O.
//!
//! # Packet Format
//!
//! ```text
//! [payload length: 3 bytes LE][sequence id: 1 byte][payload]
//! ```
//!
//! Payloads of 0xFFFFFF bytes or more are split into max-size packets followed
//! by a shorter, possibly empty, packet.
//!
//! # Compressed Format
//!
//! ```text
//! [compressed length: 3 bytes LE][compressed sequence: 1 byte][uncompressed length: 3 bytes LE][data]
//! ```
//!
//! The data holds framed packets, zlib-compressed unless the uncompressed
//! length field is 0.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::trace;

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use mysqlwire_core::{Error, Result};

/// Frames below this size are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

const COMPRESSED_HEADER_SIZE: usize = 7;

/// Sequence-tracking encoder/decoder for one connection.
#[derive(Debug, Default)]
pub struct PacketCodec {
    sequence: u8,
    compressed_sequence: u8,
    compression: bool,
    /// Bytes received from the socket and not yet decoded
    inbound: Vec<u8>,
    /// Decompressed bytes not yet split into packets
    plain: Vec<u8>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new exchange: both counters return to 0.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        self.compressed_sequence = 0;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn enable_compression(&mut self) {
        self.compression = true;
    }

    pub fn is_compressed(&self) -> bool {
        self.compression
    }

    /// Whether received bytes are waiting to be decoded.
    pub fn has_buffered(&self) -> bool {
        !self.inbound.is_empty() || !self.plain.is_empty()
    }

    /// Frame `payload` into wire bytes, advancing the sequence counters.
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        let mut offset = 0;
        loop {
            let chunk = (payload.len() - offset).min(MAX_PACKET_SIZE);
            let header = PacketHeader {
                payload_length: chunk as u32,
                sequence_id: self.sequence,
            };
            trace!(length = chunk, sequence = self.sequence, "Sending packet");
            framed.extend_from_slice(&header.to_bytes());
            framed.extend_from_slice(&payload[offset..offset + chunk]);
            self.sequence = self.sequence.wrapping_add(1);
            offset += chunk;
            if chunk < MAX_PACKET_SIZE {
                break;
            }
        }

        if self.compression {
            self.compress(&framed)
        } else {
            Ok(framed)
        }
    }

    fn compress(&mut self, framed: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(framed.len() + COMPRESSED_HEADER_SIZE);
        for chunk in framed.chunks(MAX_PACKET_SIZE) {
            let compressed = if chunk.len() < MIN_COMPRESS_LENGTH {
                None
            } else {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(chunk)?;
                Some(encoder.finish()?).filter(|c| c.len() < chunk.len())
            };

            let (data, uncompressed_len) = match &compressed {
                Some(c) => (c.as_slice(), chunk.len()),
                None => (chunk, 0),
            };
            out.extend_from_slice(&u24(data.len()));
            out.push(self.compressed_sequence);
            out.extend_from_slice(&u24(uncompressed_len));
            out.extend_from_slice(data);
            self.compressed_sequence = self.compressed_sequence.wrapping_add(1);
        }
        Ok(out)
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Decode the next complete payload, or `None` when more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        if self.compression {
            self.inflate_frames()?;
            let mut source = std::mem::take(&mut self.plain);
            let packet = self.take_packet(&mut source, false);
            self.plain = source;
            packet
        } else {
            let mut source = std::mem::take(&mut self.inbound);
            let packet = self.take_packet(&mut source, true);
            self.inbound = source;
            packet
        }
    }

    /// Move every complete compressed frame from `inbound` into `plain`.
    fn inflate_frames(&mut self) -> Result<()> {
        while self.inbound.len() >= COMPRESSED_HEADER_SIZE {
            let compressed_len = read_u24(&self.inbound[0..3]);
            let sequence = self.inbound[3];
            let uncompressed_len = read_u24(&self.inbound[4..7]);
            let end = COMPRESSED_HEADER_SIZE + compressed_len;
            if self.inbound.len() < end {
                break;
            }

            let data = &self.inbound[COMPRESSED_HEADER_SIZE..end];
            if uncompressed_len == 0 {
                self.plain.extend_from_slice(data);
            } else {
                let mut inflated = Vec::with_capacity(uncompressed_len);
                ZlibDecoder::new(data)
                    .take(uncompressed_len as u64 + 1)
                    .read_to_end(&mut inflated)
                    .map_err(|e| Error::protocol(format!("invalid compressed packet: {e}")))?;
                if inflated.len() != uncompressed_len {
                    return Err(Error::protocol(format!(
                        "compressed packet inflated to {} bytes, expected {}",
                        inflated.len(),
                        uncompressed_len
                    )));
                }
                self.plain.extend_from_slice(&inflated);
            }
            self.compressed_sequence = sequence.wrapping_add(1);
            self.inbound.drain(..end);
        }
        Ok(())
    }

    /// Take one logical payload (joined across max-size packets) from the
    /// front of `source`. Nothing is consumed unless the payload is complete.
    fn take_packet(&mut self, source: &mut Vec<u8>, check_sequence: bool) -> Result<Option<Vec<u8>>> {
        let mut offset = 0;
        let mut sequence = self.sequence;
        let mut chunks = Vec::new();
        loop {
            if source.len() < offset + PacketHeader::SIZE {
                return Ok(None);
            }
            let header = PacketHeader::from_bytes(&[
                source[offset],
                source[offset + 1],
                source[offset + 2],
                source[offset + 3],
            ]);
            let len = header.payload_length as usize;
            let start = offset + PacketHeader::SIZE;
            if source.len() < start + len {
                return Ok(None);
            }
            if check_sequence && header.sequence_id != sequence {
                return Err(Error::protocol(format!(
                    "Got packets out of order (expected sequence {}, got {})",
                    sequence, header.sequence_id
                )));
            }
            trace!(length = len, sequence = header.sequence_id, "Received packet");
            sequence = header.sequence_id.wrapping_add(1);
            chunks.push(start..start + len);
            offset = start + len;
            if len < MAX_PACKET_SIZE {
                break;
            }
        }

        let mut payload = Vec::with_capacity(chunks.iter().map(|r| r.len()).sum());
        for range in chunks {
            payload.extend_from_slice(&source[range]);
        }
        source.drain(..offset);
        self.sequence = sequence;
        Ok(Some(payload))
    }
}

fn u24(value: usize) -> [u8; 3] {
    let bytes = (value as u32).to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

fn read_u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | usize::from(bytes[1]) << 8 | usize::from(bytes[2]) << 16
}
