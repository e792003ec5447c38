//! Result set decoding.
//!
//! A result set is a column count, that many column definitions, an EOF
//! (unless CLIENT_DEPRECATE_EOF is negotiated), the rows, and a terminating
//! EOF or OK whose status flags say whether another result follows.
//!
//! Text rows are a sequence of length-encoded strings where `0xFB` is NULL.
//! Binary rows (prepared statements) start with `0x00`, then a NULL bitmap of
//! `(n + 7 + 2) / 8` bytes whose first two bits are unused, then the values of
//! the non-NULL columns.

use std::sync::Arc;

use crate::protocol::capabilities::CLIENT_DEPRECATE_EOF;
use crate::protocol::{MAX_PACKET_SIZE, OkPacket, PacketReader, PacketType, parse_eof, parse_err, parse_ok, unexpected};
use crate::types::{ColumnDef, decode_binary_value, decode_text_value};
use mysqlwire_core::{ColumnInfo, Error, Result, Row, Value};

/// Offset of the first column in a binary row NULL bitmap.
const BINARY_NULL_BITMAP_OFFSET: usize = 2;

/// Wire encoding of the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY results
    Text,
    /// COM_STMT_EXECUTE results
    Binary,
}

/// Collects the column definitions of a result set.
#[derive(Debug)]
pub struct ColumnReader {
    expected: usize,
    columns: Vec<ColumnDef>,
    expect_eof: bool,
}

impl ColumnReader {
    pub fn new(expected: usize, capabilities: u32) -> Self {
        Self {
            expected,
            columns: Vec::with_capacity(expected.min(4096)),
            // an empty definition list is not followed by an EOF
            expect_eof: expected > 0 && capabilities & CLIENT_DEPRECATE_EOF == 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.columns.len() == self.expected && !self.expect_eof
    }

    /// Consume one packet. Returns true once every definition (and the EOF
    /// that closes them) has been read.
    pub fn push(&mut self, payload: &[u8]) -> Result<bool> {
        if self.columns.len() < self.expected {
            if PacketType::of(payload) == PacketType::Error {
                return Err(parse_err(payload)?.into_error());
            }
            self.columns.push(ColumnDef::parse(payload)?);
        } else if self.expect_eof {
            if PacketType::of(payload) != PacketType::Eof {
                return Err(unexpected("expecting EOF after column definitions", payload));
            }
            self.expect_eof = false;
        } else {
            return Err(unexpected("column definitions already complete", payload));
        }
        Ok(self.is_complete())
    }

    pub fn into_columns(self) -> Vec<ColumnDef> {
        self.columns
    }
}

/// What one row-phase packet turned out to be.
#[derive(Debug)]
pub enum RowEvent {
    Row(Row),
    /// The result ended; the status flags tell whether another follows
    End(OkPacket),
}

/// Decodes the row packets of one result set.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    columns: Arc<[ColumnDef]>,
    info: Arc<ColumnInfo>,
    format: RowFormat,
    deprecate_eof: bool,
}

impl RowDecoder {
    pub fn new(columns: Vec<ColumnDef>, format: RowFormat, capabilities: u32) -> Self {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        Self {
            columns: columns.into(),
            info: Arc::new(ColumnInfo::new(names)),
            format,
            deprecate_eof: capabilities & CLIENT_DEPRECATE_EOF != 0,
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.info)
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }

    fn is_terminator(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&0xFE)
            && (payload.len() < 9 || (self.deprecate_eof && payload.len() < MAX_PACKET_SIZE))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<RowEvent> {
        if payload.first() == Some(&0xFF) {
            return Err(parse_err(payload)?.into_error());
        }
        if self.is_terminator(payload) {
            let end = if self.deprecate_eof {
                parse_ok(payload)?
            } else {
                let eof = parse_eof(payload)?;
                OkPacket {
                    status_flags: eof.status_flags,
                    warnings: eof.warnings,
                    ..OkPacket::default()
                }
            };
            return Ok(RowEvent::End(end));
        }

        let values = match self.format {
            RowFormat::Text => self.decode_text(payload)?,
            RowFormat::Binary => self.decode_binary(payload)?,
        };
        Ok(RowEvent::Row(Row::with_columns(self.column_info(), values)))
    }

    fn decode_text(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        let mut values = Vec::with_capacity(self.columns.len());
        for column in self.columns.iter() {
            let cell = reader.read_lenenc_bytes_or_null().ok_or_else(|| {
                Error::protocol(format!("text row truncated at column '{}'", column.name))
            })?;
            values.push(match cell {
                None => Value::Null,
                Some(data) => decode_text_value(column, data)?,
            });
        }
        if !reader.is_empty() {
            return Err(Error::protocol(format!(
                "text row has {} trailing bytes",
                reader.remaining()
            )));
        }
        Ok(values)
    }

    fn decode_binary(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0x00) {
            return Err(unexpected("reading a binary row", payload));
        }
        let bitmap_len = (self.columns.len() + 7 + BINARY_NULL_BITMAP_OFFSET) / 8;
        let bitmap = reader
            .read_bytes(bitmap_len)
            .ok_or_else(|| Error::protocol("binary row truncated in NULL bitmap"))?;

        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let bit = i + BINARY_NULL_BITMAP_OFFSET;
            if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                values.push(Value::Null);
            } else {
                values.push(decode_binary_value(column, &mut reader).map_err(|e| match e {
                    Error::Data(d) if d.message.starts_with("truncated") => {
                        Error::protocol(format!("binary row truncated: {d}"))
                    }
                    other => other,
                })?);
            }
        }
        if !reader.is_empty() {
            return Err(Error::protocol(format!(
                "binary row has {} trailing bytes",
                reader.remaining()
            )));
        }
        Ok(values)
    }
}

/// A fully read result: the rows plus the counters of its final packet.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
    pub status_flags: u16,
}

impl StatementResult {
    /// A result without rows, from an OK packet.
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info,
            status_flags: ok.status_flags,
            ..Self::default()
        }
    }

    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;
    use crate::transport::mock::{column_payload, err_payload};
    use crate::types::{FieldType, column_flags};

    fn text_row(cells: &[Option<&str>]) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        for cell in cells {
            match cell {
                Some(v) => writer.write_lenenc_string(v),
                None => writer.write_u8(0xFB),
            }
        }
        writer.into_bytes()
    }

    fn row(event: RowEvent) -> Row {
        match event {
            RowEvent::Row(row) => row,
            RowEvent::End(_) => panic!("expected a row"),
        }
    }

    #[test]
    fn test_column_reader_with_eof() {
        let mut reader = ColumnReader::new(1, DEFAULT_CLIENT_FLAGS);
        assert!(!reader.is_complete());
        let def = ColumnDef::new("a", FieldType::Long);
        assert!(!reader.push(&column_payload(&def)).unwrap());
        assert!(reader.push(&[0xFE, 0, 0, 2, 0]).unwrap());
        assert_eq!(reader.into_columns(), vec![def]);
    }

    #[test]
    fn test_column_reader_deprecate_eof() {
        let mut reader = ColumnReader::new(1, DEFAULT_CLIENT_FLAGS | CLIENT_DEPRECATE_EOF);
        assert!(reader.push(&column_payload(&ColumnDef::new("a", FieldType::Long))).unwrap());
        assert!(ColumnReader::new(0, DEFAULT_CLIENT_FLAGS).is_complete());
    }

    #[test]
    fn test_column_reader_rejects_missing_eof() {
        let mut reader = ColumnReader::new(1, DEFAULT_CLIENT_FLAGS);
        reader.push(&column_payload(&ColumnDef::new("a", FieldType::Long))).unwrap();
        assert!(matches!(reader.push(&[0x01]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_text_rows() {
        let decoder = RowDecoder::new(
            vec![
                ColumnDef::new("id", FieldType::Long),
                ColumnDef::new("name", FieldType::VarString),
                ColumnDef::new("born", FieldType::Date),
            ],
            RowFormat::Text,
            DEFAULT_CLIENT_FLAGS,
        );
        let r = row(decoder.decode(&text_row(&[Some("7"), None, Some("0000-00-00")])).unwrap());
        assert_eq!(r.get(0), Some(&Value::Int(7)));
        assert_eq!(r.get(1), Some(&Value::Null));
        // zero dates decode to NULL
        assert_eq!(r.get(2), Some(&Value::Null));
        assert_eq!(r.get_by_name("id"), Some(&Value::Int(7)));

        match decoder.decode(&[0xFE, 1, 0, 0x0A, 0]).unwrap() {
            RowEvent::End(end) => {
                assert_eq!(end.warnings, 1);
                assert!(end.more_results_exists());
            }
            RowEvent::Row(_) => panic!("expected the end of the result"),
        }
    }

    #[test]
    fn test_malformed_text_row() {
        let decoder = RowDecoder::new(
            vec![ColumnDef::new("a", FieldType::VarString)],
            RowFormat::Text,
            DEFAULT_CLIENT_FLAGS,
        );
        // length prefix says 5 bytes, only 2 present
        assert!(matches!(decoder.decode(&[0x05, b'a', b'b']), Err(Error::Protocol(_))));
        assert!(matches!(
            decoder.decode(&text_row(&[Some("x"), Some("y")])),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_error_packet_in_rows() {
        let decoder = RowDecoder::new(
            vec![ColumnDef::new("a", FieldType::VarString)],
            RowFormat::Text,
            DEFAULT_CLIENT_FLAGS,
        );
        let err = decoder
            .decode(&err_payload(1317, "70100", "Query execution was interrupted"))
            .unwrap_err();
        assert_eq!(err.server_code(), Some(1317));
    }

    #[test]
    fn test_binary_row_null_bitmap_offset() {
        let decoder = RowDecoder::new(
            vec![
                ColumnDef::new("a", FieldType::Long),
                ColumnDef::new("b", FieldType::VarString),
                ColumnDef::new("c", FieldType::LongLong).with_flags(column_flags::UNSIGNED),
            ],
            RowFormat::Binary,
            DEFAULT_CLIENT_FLAGS,
        );
        // column b is NULL: bit 1 + 2 = 3
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&(-5i32).to_le_bytes());
        payload.extend_from_slice(&u64::MAX.to_le_bytes());
        let r = row(decoder.decode(&payload).unwrap());
        assert_eq!(r.get(0), Some(&Value::Int(-5)));
        assert_eq!(r.get(1), Some(&Value::Null));
        assert_eq!(r.get(2), Some(&Value::UnsignedBigInt(u64::MAX)));
    }

    #[test]
    fn test_binary_bitmap_spans_bytes() {
        let columns: Vec<ColumnDef> = (0..7)
            .map(|i| ColumnDef::new(format!("c{i}"), FieldType::Tiny))
            .collect();
        let decoder = RowDecoder::new(columns, RowFormat::Binary, DEFAULT_CLIENT_FLAGS);
        // 7 columns need (7 + 9) / 8 = 2 bitmap bytes; last column (bit 8) is NULL
        let payload = vec![0x00, 0x00, 0x01, 1, 2, 3, 4, 5, 6];
        let r = row(decoder.decode(&payload).unwrap());
        assert_eq!(r.get(5), Some(&Value::TinyInt(6)));
        assert_eq!(r.get(6), Some(&Value::Null));
    }

    #[test]
    fn test_binary_row_malformed() {
        let decoder = RowDecoder::new(
            vec![ColumnDef::new("a", FieldType::Long)],
            RowFormat::Binary,
            DEFAULT_CLIENT_FLAGS,
        );
        assert!(matches!(decoder.decode(&[0x01, 0x00]), Err(Error::Protocol(_))));
        assert!(matches!(decoder.decode(&[0x00, 0x00, 1, 2]), Err(Error::Protocol(_))));
        assert!(matches!(
            decoder.decode(&[0x00, 0x00, 1, 0, 0, 0, 9]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_deprecate_eof_terminator() {
        let decoder = RowDecoder::new(
            vec![ColumnDef::new("a", FieldType::VarString)],
            RowFormat::Text,
            DEFAULT_CLIENT_FLAGS | CLIENT_DEPRECATE_EOF,
        );
        let mut ok = vec![0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        ok.extend_from_slice(b"Rows matched: 1");
        assert!(matches!(decoder.decode(&ok).unwrap(), RowEvent::End(ref e) if e.info.starts_with("Rows")));
    }
}
