//! Prepared statements (binary protocol) and the command payloads that carry
//! typed parameters.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text
//!    - Server returns statement ID, param count, column count
//!    - Server sends param column definitions (if any)
//!    - Server sends result column definitions (if any)
//!
//! 2. **Execute**: COM_STMT_EXECUTE with statement ID + binary params
//!    - Server returns a binary result set or an OK packet
//!
//! 3. **Close**: COM_STMT_CLOSE with statement ID
//!    - No server response
//!
//! COM_QUERY shares the parameter block layout when query attributes are
//! negotiated.

#![allow(clippy::cast_possible_truncation)]

use super::{Command, PacketReader, PacketWriter, truncated, unexpected};
use crate::types::{ColumnDef, binary_param_type, write_binary_param};
use mysqlwire_core::{Error, Result, UsageErrorKind, Value};

/// Cursor type flag for COM_STMT_EXECUTE (no server-side cursor).
pub const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;

/// Unsigned bit in the parameter type flags byte.
const PARAM_UNSIGNED: u8 = 0x80;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Unique statement identifier (used in execute/close)
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// Parse a COM_STMT_PREPARE_OK response.
    ///
    /// Layout: status 0x00, statement id (4), columns (2), params (2),
    /// reserved (1), warnings (2, optional).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0x00) {
            return Err(unexpected("reading prepare response", payload));
        }
        let statement_id = reader
            .read_u32_le()
            .ok_or_else(|| truncated("statement id"))?;
        let num_columns = reader
            .read_u16_le()
            .ok_or_else(|| truncated("column count"))?;
        let num_params = reader
            .read_u16_le()
            .ok_or_else(|| truncated("parameter count"))?;
        reader.skip(1);
        let warnings = reader.read_u16_le().unwrap_or(0);

        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// A prepared statement with its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned statement ID
    pub statement_id: u32,
    /// SQL text, kept for error reports and logging
    pub sql: String,
    /// Parameter column definitions
    pub params: Vec<ColumnDef>,
    /// Result column definitions (empty when the statement has no result set)
    pub columns: Vec<ColumnDef>,
    /// Warnings reported by the prepare
    pub warnings: u16,
}

impl PreparedStatement {
    pub fn new(
        statement_id: u32,
        sql: String,
        params: Vec<ColumnDef>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            statement_id,
            sql,
            params,
            columns,
            warnings: 0,
        }
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Reject a parameter list whose length does not match the placeholders.
    pub fn check_params(&self, params: &[Value]) -> Result<()> {
        if params.len() == self.params.len() {
            Ok(())
        } else {
            Err(Error::usage(
                UsageErrorKind::ParameterCount,
                format!(
                    "statement expects {} parameters, got {}",
                    self.params.len(),
                    params.len()
                ),
            ))
        }
    }
}

/// NULL bitmap, bound flag and type list shared by execute and query
/// attributes. `names` is only written for query attributes.
fn write_param_block(writer: &mut PacketWriter, params: &[Value], names: Option<&[&str]>) {
    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);

    // new-params-bound flag: types follow
    writer.write_u8(1);

    for (i, param) in params.iter().enumerate() {
        let (field_type, unsigned) = binary_param_type(param);
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { PARAM_UNSIGNED } else { 0 });
        if let Some(names) = names {
            writer.write_lenenc_string(names.get(i).copied().unwrap_or(""));
        }
    }

    for param in params.iter().filter(|p| !p.is_null()) {
        write_binary_param(writer, param);
    }
}

/// COM_STMT_PREPARE payload.
pub fn build_stmt_prepare(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare, sql.len());
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// COM_STMT_EXECUTE payload.
///
/// - statement id (4), flags (1), iteration count (4, always 1)
/// - when there are parameters: NULL bitmap of `(n + 7) / 8` bytes, the
///   new-params-bound flag, `(type, flags)` pairs, then the non-NULL values
pub fn build_stmt_execute(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtExecute, 16 + params.len() * 16);
    writer.write_u32_le(statement_id);
    writer.write_u8(CURSOR_TYPE_NO_CURSOR);
    writer.write_u32_le(1);
    if !params.is_empty() {
        write_param_block(&mut writer, params, None);
    }
    writer.into_bytes()
}

/// COM_STMT_CLOSE payload. The server does not answer.
pub fn build_stmt_close(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// COM_STMT_RESET payload: discards data sent with COM_STMT_SEND_LONG_DATA.
pub fn build_stmt_reset(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// COM_STMT_SEND_LONG_DATA payload. The server does not answer.
pub fn build_stmt_send_long_data(statement_id: u32, param_index: u16, data: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtSendLongData, 6 + data.len());
    writer.write_u32_le(statement_id);
    writer.write_u16_le(param_index);
    writer.write_bytes(data);
    writer.into_bytes()
}

/// COM_QUERY payload.
///
/// With CLIENT_QUERY_ATTRIBUTES negotiated the SQL is preceded by the
/// attribute count, the parameter set count (always 1) and, when there are
/// attributes, a named parameter block.
pub fn build_query(sql: &str, attributes: &[(String, Value)], query_attributes: bool) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::Query, sql.len() + 2);
    if query_attributes {
        writer.write_lenenc_int(attributes.len() as u64);
        writer.write_lenenc_int(1);
        if !attributes.is_empty() {
            let names: Vec<&str> = attributes.iter().map(|(n, _)| n.as_str()).collect();
            let values: Vec<Value> = attributes.iter().map(|(_, v)| v.clone()).collect();
            write_param_block(&mut writer, &values, Some(&names));
        }
    }
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn test_parse_prepare_ok() {
        let ok = StmtPrepareOk::parse(b"\x00\x01\x00\x00\x00\x01\x00\x02\x00\x00\x00\x00").unwrap();
        assert_eq!(
            ok,
            StmtPrepareOk {
                statement_id: 1,
                num_columns: 1,
                num_params: 2,
                warnings: 0,
            }
        );
        assert!(StmtPrepareOk::parse(b"\x00\x01\x00").is_err());
        assert!(StmtPrepareOk::parse(b"\x05\x01\x00\x00\x00\x01\x00\x02\x00\x00").is_err());
    }

    #[test]
    fn test_execute_strings() {
        let payload = build_stmt_execute(1, &[Value::from("ham"), Value::from("spam")]);
        assert_eq!(
            payload,
            b"\x17\x01\x00\x00\x00\x00\x01\x00\x00\x00\x00\x01\x0f\x00\x0f\x00\x03ham\x04spam"
        );
    }

    #[test]
    fn test_execute_null_bitmap() {
        let payload = build_stmt_execute(1, &[Value::Null, Value::Null]);
        assert_eq!(
            payload,
            b"\x17\x01\x00\x00\x00\x00\x01\x00\x00\x00\x03\x01\x06\x00\x06\x00"
        );

        let payload = build_stmt_execute(1, &[Value::Null, Value::from("Ham")]);
        assert_eq!(
            payload,
            b"\x17\x01\x00\x00\x00\x00\x01\x00\x00\x00\x01\x01\x06\x00\x0f\x00\x03Ham"
        );

        // nine parameters need a second bitmap byte
        let mut params = vec![Value::Int(1); 8];
        params.push(Value::Null);
        let payload = build_stmt_execute(7, &params);
        assert_eq!(&payload[10..12], &[0x00, 0x01]);
    }

    #[test]
    fn test_execute_unsigned_flag() {
        let payload = build_stmt_execute(1, &[Value::UnsignedBigInt(u64::MAX)]);
        assert_eq!(&payload[10..14], &[0x00, 0x01, FieldType::LongLong as u8, 0x80]);
        assert_eq!(&payload[14..], &[0xff; 8]);
    }

    #[test]
    fn test_execute_without_params() {
        assert_eq!(build_stmt_execute(9, &[]), b"\x17\x09\x00\x00\x00\x00\x01\x00\x00\x00");
    }

    #[test]
    fn test_close_reset_long_data() {
        assert_eq!(build_stmt_close(5), b"\x19\x05\x00\x00\x00");
        assert_eq!(build_stmt_reset(5), b"\x1a\x05\x00\x00\x00");
        assert_eq!(
            build_stmt_send_long_data(5, 1, b"blob"),
            b"\x18\x05\x00\x00\x00\x01\x00blob"
        );
        assert_eq!(build_stmt_prepare("SELECT ?"), b"\x16SELECT ?");
    }

    #[test]
    fn test_query_payloads() {
        assert_eq!(build_query("SELECT 1", &[], false), b"\x03SELECT 1");
        assert_eq!(build_query("SELECT 1", &[], true), b"\x03\x00\x01SELECT 1");

        let attrs = vec![("trace".to_string(), Value::from("abc"))];
        assert_eq!(
            build_query("SELECT 1", &attrs, true),
            b"\x03\x01\x01\x00\x01\x0f\x00\x05trace\x03abcSELECT 1"
        );
    }

    #[test]
    fn test_check_params() {
        let stmt = PreparedStatement::new(
            1,
            "SELECT ?".to_string(),
            vec![ColumnDef::new("?", FieldType::VarString)],
            vec![],
        );
        assert!(stmt.check_params(&[Value::Int(1)]).is_ok());
        let err = stmt.check_params(&[]).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::ParameterCount));
    }
}
