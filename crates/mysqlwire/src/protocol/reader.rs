//! Cursor over a packet payload.
//!
//! All reads are bounds-checked and return `None` once the payload is
//! exhausted; callers map that to a protocol error naming the field.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A length-encoded integer, which may also be the NULL marker in rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEnc {
    Value(u64),
    Null,
}

/// A reader for MySQL protocol data.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array::<2>().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_array::<3>()
            .map(|b| u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }

    /// Read `N` bytes into a fixed array.
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    /// Read a length-encoded integer, distinguishing the 0xFB NULL marker.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB: NULL
    /// - 0xFF: invalid (ERR header), reported as `None`
    pub fn read_lenenc(&mut self) -> Option<LenEnc> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(LenEnc::Value(u64::from(first))),
            0xFB => Some(LenEnc::Null),
            0xFC => self.read_u16_le().map(|v| LenEnc::Value(u64::from(v))),
            0xFD => self.read_u24_le().map(|v| LenEnc::Value(u64::from(v))),
            0xFE => self.read_u64_le().map(LenEnc::Value),
            0xFF => None,
        }
    }

    /// Read a length-encoded integer where NULL is not allowed.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_lenenc()? {
            LenEnc::Value(v) => Some(v),
            LenEnc::Null => None,
        }
    }

    /// Read a length-encoded byte string.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded byte string that may be NULL (text rows).
    pub fn read_lenenc_bytes_or_null(&mut self) -> Option<Option<&'a [u8]>> {
        match self.read_lenenc()? {
            LenEnc::Null => Some(None),
            LenEnc::Value(len) => {
                let len = usize::try_from(len).ok()?;
                self.read_bytes(len).map(Some)
            }
        }
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read bytes up to a NUL terminator, consuming the terminator.
    ///
    /// Returns `None` when no terminator is present.
    pub fn read_null_terminated(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|b| *b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Read a NUL-terminated string; a missing terminator reads to the end.
    pub fn read_null_string(&mut self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let bytes = match self.read_null_terminated() {
            Some(b) => b,
            None => self.read_rest(),
        };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet.
    ///
    /// - header 0x00 (or 0xFE when terminating rows under deprecated EOF)
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - info: rest of packet (optional)
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet.
    ///
    /// - header 0xFF
    /// - error_code: 2 bytes
    /// - optional '#' marker followed by a 5-byte SQL state
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet: header 0xFE, warnings (2), status flags (2).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_integers() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u8(), None);

        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(reader.read_u64_le(), Some(0x0807_0605_0403_0201));
    }

    #[test]
    fn test_short_reads_do_not_advance() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_u24_le(), Some(0x0003_0201));
    }

    #[test]
    fn test_read_lenenc() {
        let cases: &[(&[u8], LenEnc)] = &[
            (&[0xFA], LenEnc::Value(250)),
            (&[0xFB], LenEnc::Null),
            (&[0xFC, 0x34, 0x12], LenEnc::Value(0x1234)),
            (&[0xFD, 0x56, 0x34, 0x12], LenEnc::Value(0x0012_3456)),
            (
                &[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
                LenEnc::Value(0x0807_0605_0403_0201),
            ),
        ];
        for (bytes, expected) in cases {
            assert_eq!(PacketReader::new(bytes).read_lenenc(), Some(*expected));
        }
        assert_eq!(PacketReader::new(&[0xFF]).read_lenenc(), None);
        assert_eq!(PacketReader::new(&[0xFB]).read_lenenc_int(), None);
        assert_eq!(PacketReader::new(&[0xFC, 0x01]).read_lenenc(), None);
    }

    #[test]
    fn test_lenenc_bytes_or_null() {
        let mut reader = PacketReader::new(&[0x03, b'H', b'a', b'm', 0xFB, 0x00]);
        assert_eq!(reader.read_lenenc_bytes_or_null(), Some(Some(&b"Ham"[..])));
        assert_eq!(reader.read_lenenc_bytes_or_null(), Some(None));
        assert_eq!(reader.read_lenenc_bytes_or_null(), Some(Some(&b""[..])));
        assert_eq!(reader.read_lenenc_bytes_or_null(), None);

        // length prefix claims more than is present
        let mut reader = PacketReader::new(&[0x05, b'a']);
        assert_eq!(reader.read_lenenc_bytes_or_null(), None);
    }

    #[test]
    fn test_null_terminated() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_terminated(), Some(&b"hello"[..]));
        assert_eq!(reader.read_null_terminated(), None);
        assert_eq!(reader.read_null_string(), Some("world".to_string()));
        assert_eq!(reader.read_null_string(), None);
    }

    #[test]
    fn test_parse_ok_with_fe_header() {
        let mut reader = PacketReader::new(&[0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        let ok = reader.parse_ok_packet().unwrap();
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.affected_rows, 0);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }
}
