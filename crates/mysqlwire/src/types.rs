//! MySQL type system and value codec.
//!
//! This module provides:
//! - MySQL field type constants and column metadata
//! - Decoding of text-protocol and binary-protocol column values
//! - Binary encoding of prepared-statement parameters
//! - SQL literal escaping for the text protocol
//!
//! # Value mapping
//!
//! Unsigned integer columns widen to the next signed variant so that every
//! value fits (`TINYINT UNSIGNED` becomes [`Value::SmallInt`]); `BIGINT
//! UNSIGNED` becomes [`Value::UnsignedBigInt`]. String and blob columns decode
//! to bytes when their collation is `binary` (63), to text otherwise.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::protocol::{PacketReader, PacketWriter, charset, truncated};
use crate::temporal;
use mysqlwire_core::error::DataError;
use mysqlwire_core::{Error, Result, UsageErrorKind, Value};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    /// Internal to the server, never seen in result sets
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    /// MySQL 8.0.23+ contains a typed array inside JSON
    TypedArray = 0x14,
    Vector = 0xF2,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. `None` for codes the protocol does not define.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0x14 => FieldType::TypedArray,
            0xF2 => FieldType::Vector,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
                | FieldType::Vector
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::TypedArray => "TYPED_ARRAY",
            FieldType::Vector => "VECTOR",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set or a prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    /// Maximum display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// A synthetic column, used for parameter metadata and in tests.
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        let name = name.into();
        Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset: charset::DEFAULT_COLLATION,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }

    /// Parse a Protocol::ColumnDefinition41 packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let mut text = |field: &str| {
            reader
                .read_lenenc_string()
                .ok_or_else(|| truncated(&format!("column {field}")))
        };
        let catalog = text("catalog")?;
        let schema = text("schema")?;
        let table = text("table")?;
        let org_table = text("org_table")?;
        let name = text("name")?;
        let org_name = text("org_name")?;

        // length of the fixed-size fields, always 0x0c
        reader
            .read_lenenc_int()
            .ok_or_else(|| truncated("column fixed length"))?;
        let charset = reader
            .read_u16_le()
            .ok_or_else(|| truncated("column charset"))?;
        let column_length = reader
            .read_u32_le()
            .ok_or_else(|| truncated("column length"))?;
        let type_code = reader
            .read_u8()
            .ok_or_else(|| truncated("column type"))?;
        let column_type = FieldType::from_u8(type_code).ok_or_else(|| {
            Error::protocol(format!("unknown column type 0x{type_code:02x} for column '{name}'"))
        })?;
        let flags = reader
            .read_u16_le()
            .ok_or_else(|| truncated("column flags"))?;
        let decimals = reader
            .read_u8()
            .ok_or_else(|| truncated("column decimals"))?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }

    #[must_use]
    pub const fn is_blob(&self) -> bool {
        self.flags & column_flags::BLOB != 0
    }

    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.flags & column_flags::SET != 0 || matches!(self.column_type, FieldType::Set)
    }

    /// Whether string data in this column is raw bytes rather than text.
    #[must_use]
    pub const fn has_binary_charset(&self) -> bool {
        charset::is_binary(self.charset)
    }
}

fn column_error(col: &ColumnDef, message: String) -> Error {
    Error::Data(DataError {
        message,
        column: Some(col.name.clone()),
    })
}

fn name_column(err: Error, col: &ColumnDef) -> Error {
    match err {
        Error::Data(mut de) if de.column.is_none() => {
            de.column = Some(col.name.clone());
            Error::Data(de)
        }
        e => e,
    }
}

fn parse_number<T: std::str::FromStr>(col: &ColumnDef, text: &str) -> Result<T> {
    text.trim().parse::<T>().map_err(|_| {
        column_error(
            col,
            format!("invalid {} value '{}'", col.column_type.name(), text),
        )
    })
}

fn bits_to_u64(col: &ColumnDef, data: &[u8]) -> Result<u64> {
    if data.len() > 8 {
        return Err(column_error(
            col,
            format!("BIT value of {} bytes does not fit in 64 bits", data.len()),
        ));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_set(data: &[u8]) -> Value {
    let text = String::from_utf8_lossy(data);
    if text.is_empty() {
        Value::Set(Vec::new())
    } else {
        Value::Set(text.split(',').map(str::to_string).collect())
    }
}

fn decode_json(data: &[u8]) -> Value {
    serde_json::from_slice(data).map_or_else(
        |_| Value::Text(String::from_utf8_lossy(data).into_owned()),
        Value::Json,
    )
}

/// Strings, blobs, ENUM, SET, JSON and BIT share a layout in both protocols.
fn decode_bytes_like(col: &ColumnDef, data: &[u8]) -> Result<Value> {
    Ok(match col.column_type {
        FieldType::Bit => Value::Bit(bits_to_u64(col, data)?),
        FieldType::Json => decode_json(data),
        _ if col.is_set() => decode_set(data),
        FieldType::Enum => Value::Text(String::from_utf8_lossy(data).into_owned()),
        FieldType::Geometry | FieldType::Vector => Value::Bytes(data.to_vec()),
        _ if col.has_binary_charset() => Value::Bytes(data.to_vec()),
        _ => Value::Text(String::from_utf8_lossy(data).into_owned()),
    })
}

/// Decode a text-protocol column value (the bytes of one non-NULL cell).
pub fn decode_text_value(col: &ColumnDef, data: &[u8]) -> Result<Value> {
    if matches!(col.column_type, FieldType::Null) {
        return Ok(Value::Null);
    }
    if !(col.column_type.is_integer()
        || col.column_type.is_float()
        || col.column_type.is_decimal()
        || col.column_type.is_temporal())
    {
        return decode_bytes_like(col, data);
    }

    let text = std::str::from_utf8(data)
        .map_err(|_| column_error(col, "non-ASCII bytes in a numeric or temporal value".into()))?;
    let unsigned = col.is_unsigned();
    let value = match col.column_type {
        FieldType::Tiny if unsigned => Value::SmallInt(i16::from(parse_number::<u8>(col, text)?)),
        FieldType::Tiny => Value::TinyInt(parse_number(col, text)?),
        FieldType::Short if unsigned => Value::Int(i32::from(parse_number::<u16>(col, text)?)),
        FieldType::Short | FieldType::Year => Value::SmallInt(parse_number(col, text)?),
        FieldType::Long | FieldType::Int24 if unsigned => {
            Value::BigInt(i64::from(parse_number::<u32>(col, text)?))
        }
        FieldType::Long | FieldType::Int24 => Value::Int(parse_number(col, text)?),
        FieldType::LongLong if unsigned => Value::UnsignedBigInt(parse_number(col, text)?),
        FieldType::LongLong => Value::BigInt(parse_number(col, text)?),
        FieldType::Float => Value::Float(parse_number(col, text)?),
        FieldType::Double => Value::Double(parse_number(col, text)?),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.to_string()),
        FieldType::Date | FieldType::NewDate => {
            temporal::parse_date(text).map_err(|e| name_column(e, col))?
        }
        FieldType::Time | FieldType::Time2 => {
            temporal::parse_time(text).map_err(|e| name_column(e, col))?
        }
        _ => temporal::parse_datetime(text).map_err(|e| name_column(e, col))?,
    };
    Ok(value)
}

/// Decode one non-NULL binary-protocol value, advancing the reader past it.
pub fn decode_binary_value(col: &ColumnDef, reader: &mut PacketReader<'_>) -> Result<Value> {
    let short = || column_error(col, format!("truncated {} value", col.column_type.name()));
    let unsigned = col.is_unsigned();
    let value = match col.column_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let b = reader.read_u8().ok_or_else(short)?;
            if unsigned {
                Value::SmallInt(i16::from(b))
            } else {
                Value::TinyInt(b as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le().ok_or_else(short)?;
            if unsigned && col.column_type == FieldType::Short {
                Value::Int(i32::from(v))
            } else {
                Value::SmallInt(v as i16)
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let v = reader.read_u32_le().ok_or_else(short)?;
            if unsigned {
                Value::BigInt(i64::from(v))
            } else {
                Value::Int(v as i32)
            }
        }
        FieldType::LongLong => {
            let v = reader.read_u64_le().ok_or_else(short)?;
            if unsigned {
                Value::UnsignedBigInt(v)
            } else {
                Value::BigInt(v as i64)
            }
        }
        FieldType::Float => {
            Value::Float(f32::from_le_bytes(reader.read_array::<4>().ok_or_else(short)?))
        }
        FieldType::Double => {
            Value::Double(f64::from_le_bytes(reader.read_array::<8>().ok_or_else(short)?))
        }
        FieldType::Date | FieldType::NewDate => {
            let parts = temporal::read_binary_datetime(reader).map_err(|e| name_column(e, col))?;
            temporal::date_value(&parts).map_err(|e| name_column(e, col))?
        }
        FieldType::DateTime
        | FieldType::Timestamp
        | FieldType::DateTime2
        | FieldType::Timestamp2 => {
            let parts = temporal::read_binary_datetime(reader).map_err(|e| name_column(e, col))?;
            temporal::datetime_value(&parts).map_err(|e| name_column(e, col))?
        }
        FieldType::Time | FieldType::Time2 => {
            let parts = temporal::read_binary_time(reader).map_err(|e| name_column(e, col))?;
            temporal::time_value(&parts).map_err(|e| name_column(e, col))?
        }
        FieldType::Decimal | FieldType::NewDecimal => {
            let data = reader.read_lenenc_bytes().ok_or_else(short)?;
            Value::Decimal(String::from_utf8_lossy(data).into_owned())
        }
        _ => {
            let data = reader.read_lenenc_bytes().ok_or_else(short)?;
            decode_bytes_like(col, data)?
        }
    };
    Ok(value)
}

/// Parameter type code and unsigned flag for a prepared-statement parameter.
///
/// Strings travel as VARCHAR and decimals as DECIMAL so that the server
/// converts them to the column type.
pub fn binary_param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) | Value::Bit(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::Decimal, false),
        Value::Text(_) | Value::Json(_) | Value::Set(_) => (FieldType::VarChar, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::Timestamp(_) => (FieldType::DateTime, false),
    }
}

/// Append the binary encoding of a non-NULL parameter value.
pub fn write_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(v) => writer.write_u8(*v as u8),
        Value::SmallInt(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Int(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::BigInt(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::UnsignedBigInt(v) | Value::Bit(v) => writer.write_u64_le(*v),
        Value::Float(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Double(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Set(members) => writer.write_lenenc_string(&members.join(",")),
        Value::Date(days) => temporal::write_binary_datetime(writer, &temporal::date_parts(*days)),
        Value::Timestamp(micros) => {
            temporal::write_binary_datetime(writer, &temporal::timestamp_parts(*micros));
        }
        Value::Time(micros) => temporal::write_binary_time(writer, *micros),
    }
}

/// Escape a string for inclusion between quotes in a text-protocol query.
///
/// Handles NUL, backslash, both quote characters, newline, carriage return
/// and Ctrl-Z.
pub fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        match ch {
            '\0' => result.push_str("\\0"),
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result
}

fn quote_string(s: &str) -> String {
    format!("'{}'", escape_string(s))
}

fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

/// Format a value as an escaped SQL literal.
pub fn format_value_for_sql(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(i) | Value::Bit(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Double(f) if f.is_finite() => f.to_string(),
        Value::Float(_) | Value::Double(_) => {
            return Err(Error::data("non-finite floats have no SQL literal"));
        }
        Value::Decimal(s) => {
            if !s.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E')) {
                return Err(Error::data(format!("invalid decimal literal '{s}'")));
            }
            s.clone()
        }
        Value::Text(s) => quote_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => quote_string(&j.to_string()),
        Value::Set(members) => quote_string(&members.join(",")),
        Value::Date(d) => format!("'{}'", temporal::format_date(*d)),
        Value::Time(t) => format!("'{}'", temporal::format_time(*t)),
        Value::Timestamp(t) => format!("'{}'", temporal::format_datetime(*t)),
    })
}

/// Replace `?` placeholders with escaped literals, in order.
///
/// Placeholders inside quoted strings, double-quoted strings and backtick
/// identifiers are left alone. The number of placeholders must match the
/// number of parameters.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String> {
    let mut result = String::with_capacity(sql.len() + params.len() * 20);
    let mut chars = sql.chars().peekable();
    let mut param_index = 0;

    while let Some(ch) = chars.next() {
        match ch {
            '?' => {
                let value = params.get(param_index).ok_or_else(|| {
                    Error::usage(
                        UsageErrorKind::ParameterCount,
                        format!("not enough parameters for the SQL statement (got {})", params.len()),
                    )
                })?;
                result.push_str(&format_value_for_sql(value)?);
                param_index += 1;
            }
            '\'' | '"' | '`' => {
                let quote = ch;
                result.push(ch);
                while let Some(next_ch) = chars.next() {
                    result.push(next_ch);
                    if next_ch == '\\' && quote != '`' {
                        if let Some(escaped) = chars.next() {
                            result.push(escaped);
                        }
                    } else if next_ch == quote {
                        if chars.peek() == Some(&quote) {
                            result.push(quote);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            _ => result.push(ch),
        }
    }

    if param_index != params.len() {
        return Err(Error::usage(
            UsageErrorKind::ParameterCount,
            format!(
                "not all parameters were used in the SQL statement ({} of {})",
                param_index,
                params.len()
            ),
        ));
    }
    Ok(result)
}
