//! MySQL wire protocol primitives.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets; a payload whose length is an exact
//! multiple of the maximum ends with an empty packet.

pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use handshake::{AuthSwitchRequest, Handshake, HandshakeResponse, ServerVersion};
pub use prepared::{PreparedStatement, StmtPrepareOk};
pub use reader::PacketReader;
pub use writer::PacketWriter;

use mysqlwire_core::error::{ProtocolError, ServerError};
use mysqlwire_core::{Error, Result};

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;
    pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 1 << 26;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;
    pub const CLIENT_MULTI_FACTOR_AUTHENTICATION: u32 = 1 << 28;

    /// Capabilities requested on every connection.
    ///
    /// Optional features (database on connect, local infile, TLS, compression,
    /// expired passwords, query attributes, deprecated EOF) are added by the
    /// configuration and then masked by what the server offers.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS;
}

/// MySQL command codes (COM_xxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
}

impl Command {
    /// Whether the server sends no reply to this command.
    pub const fn expects_no_response(self) -> bool {
        matches!(
            self,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData
        )
    }
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// COM_REFRESH option bits.
#[allow(dead_code)]
pub mod refresh {
    pub const GRANT: u8 = 1 << 0;
    pub const LOG: u8 = 1 << 1;
    pub const TABLES: u8 = 1 << 2;
    pub const HOSTS: u8 = 1 << 3;
    pub const STATUS: u8 = 1 << 4;
    pub const THREADS: u8 = 1 << 5;
    pub const SLAVE: u8 = 1 << 6;
    pub const MASTER: u8 = 1 << 7;
}

/// MySQL character sets and collations.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u16 = 8;
    pub const UTF8_GENERAL_CI: u16 = 33;
    pub const UTF8MB4_GENERAL_CI: u16 = 45;
    pub const BINARY: u16 = 63;
    pub const UTF8MB4_UNICODE_CI: u16 = 224;
    pub const UTF8MB4_0900_AI_CI: u16 = 255;

    /// Collation sent in the handshake response when none is configured.
    pub const DEFAULT_COLLATION: u16 = UTF8MB4_GENERAL_CI;

    // (id, charset, collation)
    const COLLATIONS: &[(u16, &str, &str)] = &[
        (1, "big5", "big5_chinese_ci"),
        (8, "latin1", "latin1_swedish_ci"),
        (5, "latin1", "latin1_german1_ci"),
        (11, "ascii", "ascii_general_ci"),
        (28, "gbk", "gbk_chinese_ci"),
        (33, "utf8mb3", "utf8mb3_general_ci"),
        (45, "utf8mb4", "utf8mb4_general_ci"),
        (46, "utf8mb4", "utf8mb4_bin"),
        (47, "latin1", "latin1_bin"),
        (48, "latin1", "latin1_general_ci"),
        (63, "binary", "binary"),
        (65, "ascii", "ascii_bin"),
        (83, "utf8mb3", "utf8mb3_bin"),
        (192, "utf8mb3", "utf8mb3_unicode_ci"),
        (224, "utf8mb4", "utf8mb4_unicode_ci"),
        (255, "utf8mb4", "utf8mb4_0900_ai_ci"),
        (309, "utf8mb4", "utf8mb4_0900_bin"),
    ];

    /// Look up the charset and collation names for a collation id.
    pub fn collation_info(id: u16) -> Option<(&'static str, &'static str)> {
        COLLATIONS
            .iter()
            .find(|(cid, _, _)| *cid == id)
            .map(|(_, charset, collation)| (*charset, *collation))
    }

    /// Find a collation id by collation name, or the default collation of a
    /// charset when given a charset name.
    pub fn collation_id(name: &str) -> Option<u16> {
        let name = name.to_ascii_lowercase();
        let name = match name.as_str() {
            "utf8" => "utf8mb3",
            "utf8_general_ci" => "utf8mb3_general_ci",
            "utf8_bin" => "utf8mb3_bin",
            "utf8_unicode_ci" => "utf8mb3_unicode_ci",
            other => other,
        };
        COLLATIONS
            .iter()
            .find(|(_, _, collation)| *collation == name)
            .or_else(|| COLLATIONS.iter().find(|(_, charset, _)| *charset == name))
            .map(|(id, _, _)| *id)
    }

    /// Whether column data in this collation is raw bytes.
    pub const fn is_binary(id: u16) -> bool {
        id == BINARY
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (column count, column definition, row)
    Data,
}

impl PacketType {
    /// Classify a response by its first byte and payload length.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            // A row can start with 0xFE only as an 8-byte length prefix,
            // which makes it at least 9 bytes long.
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a whole payload; an empty payload is treated as data.
    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |b| Self::from_first_byte(*b, payload.len()))
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub const fn more_results_exists(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters, empty when the server omitted it)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Check if this is a unique constraint violation.
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }

    /// Check if this is a foreign key constraint violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.error_code == 1451 || self.error_code == 1452
    }

    /// Convert into a classified server error.
    pub fn into_server_error(self, sql: Option<&str>) -> ServerError {
        let mut err = ServerError::new(
            self.error_code,
            Some(self.sql_state),
            self.error_message,
        );
        err.sql = sql.map(str::to_string);
        err
    }

    pub fn into_error(self) -> Error {
        Error::Server(self.into_server_error(None))
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub const fn more_results_exists(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Error for a packet that ended before `field` could be read.
pub(crate) fn truncated(field: &str) -> Error {
    Error::protocol(format!("truncated packet: missing {field}"))
}

/// Error for a packet whose content does not fit the current exchange.
pub(crate) fn unexpected(context: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!(
            "unexpected packet while {} (first byte 0x{:02X})",
            context,
            payload.first().copied().unwrap_or(0)
        ),
        raw_data: Some(payload.iter().take(64).copied().collect()),
        source: None,
    })
}

/// Parse an OK packet (header byte 0x00, or 0xFE when it terminates a
/// result set under CLIENT_DEPRECATE_EOF).
pub fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut reader = PacketReader::new(payload);
    reader.parse_ok_packet().ok_or_else(|| truncated("OK fields"))
}

/// Parse an ERR packet.
pub fn parse_err(payload: &[u8]) -> Result<ErrPacket> {
    let mut reader = PacketReader::new(payload);
    reader.parse_err_packet().ok_or_else(|| truncated("error code"))
}

/// Parse an EOF packet.
pub fn parse_eof(payload: &[u8]) -> Result<EofPacket> {
    let mut reader = PacketReader::new(payload);
    reader.parse_eof_packet().ok_or_else(|| truncated("EOF status"))
}

/// Parse a packet that must be OK; ERR becomes a server error.
pub fn expect_ok(payload: &[u8]) -> Result<OkPacket> {
    match PacketType::of(payload) {
        PacketType::Ok => parse_ok(payload),
        PacketType::Error => Err(parse_err(payload)?.into_error()),
        _ => Err(unexpected("expecting OK", payload)),
    }
}
