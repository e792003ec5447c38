//! Connection-phase packets: the initial handshake, the client's response,
//! the SSL request, auth switches and COM_CHANGE_USER.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use super::{Command, PacketReader, PacketWriter, truncated};
use mysqlwire_core::error::AuthErrorKind;
use mysqlwire_core::{Error, Result};

/// Plugin assumed when the server does not name one.
pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

/// The only handshake protocol version this client speaks.
pub const PROTOCOL_VERSION: u8 = 10;

fn version_regex() -> Result<&'static Regex> {
    static VERSION_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    VERSION_RE
        .get_or_init(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{1,3})(.*)"))
        .as_ref()
        .map_err(|e| Error::protocol(format!("invalid version pattern: {e}")))
}

/// Server version announced in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    /// Everything after the numeric triple (`-log`, `-MariaDB`, ...)
    pub suffix: String,
    /// The version string exactly as sent
    pub original: String,
}

impl ServerVersion {
    /// Parse a version string by its leading `major.minor.patch` groups.
    ///
    /// Servers older than 4.1 do not speak the protocol this client
    /// implements and are rejected.
    pub fn parse(original: &str) -> Result<Self> {
        let caps = version_regex()?
            .captures(original)
            .ok_or_else(|| Error::protocol(format!("Failed parsing MySQL version '{original}'")))?;
        let group = |i: usize| -> Result<u16> {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(|| Error::protocol(format!("Failed parsing MySQL version '{original}'")))
        };
        let version = Self {
            major: group(1)?,
            minor: group(2)?,
            patch: group(3)?,
            suffix: caps.get(4).map_or("", |m| m.as_str()).to_string(),
            original: original.to_string(),
        };
        if version.triple() < (4, 1, 0) {
            return Err(Error::protocol(format!(
                "MySQL Version '{original}' is not supported"
            )));
        }
        Ok(version)
    }

    pub const fn triple(&self) -> (u16, u16, u16) {
        (self.major, self.minor, self.patch)
    }

    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.triple().cmp(&(major, minor, patch)) != Ordering::Less
    }

    pub fn is_mariadb(&self) -> bool {
        self.suffix.to_ascii_lowercase().contains("mariadb")
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Initial handshake packet (protocol version 10).
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: ServerVersion,
    pub connection_id: u32,
    /// Both scramble chunks, concatenated, trailing NUL removed
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl Handshake {
    /// Parse the server greeting.
    ///
    /// Layout: protocol byte, NUL-terminated version, thread id (4),
    /// auth data part 1 (8), filler (1), capability low (2), charset (1),
    /// status (2), capability high (2), auth data length (1), reserved (10),
    /// auth data part 2, plugin name. Old servers may omit everything after
    /// the capability low half, and may omit the final NUL of the plugin name.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| truncated("protocol version"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let version_bytes = reader
            .read_null_terminated()
            .ok_or_else(|| truncated("server version"))?;
        let server_version = ServerVersion::parse(&String::from_utf8_lossy(version_bytes))?;

        let connection_id = reader.read_u32_le().ok_or_else(|| truncated("thread id"))?;
        let mut auth_data = reader
            .read_bytes(8)
            .ok_or_else(|| truncated("auth data part 1"))?
            .to_vec();
        if !reader.skip(1) {
            return Err(truncated("filler"));
        }
        let capability_low = reader
            .read_u16_le()
            .ok_or_else(|| truncated("capability flags"))?;

        let mut handshake = Self {
            protocol_version,
            server_version,
            connection_id,
            auth_data: Vec::new(),
            capabilities: u32::from(capability_low),
            charset: 0,
            status_flags: 0,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
        };

        if reader.is_empty() {
            handshake.auth_data = auth_data;
            return Ok(handshake);
        }

        handshake.charset = reader.read_u8().ok_or_else(|| truncated("charset"))?;
        handshake.status_flags = reader
            .read_u16_le()
            .ok_or_else(|| truncated("status flags"))?;
        let capability_high = reader
            .read_u16_le()
            .ok_or_else(|| truncated("capability flags (upper)"))?;
        handshake.capabilities |= u32::from(capability_high) << 16;
        let auth_data_len = reader
            .read_u8()
            .ok_or_else(|| truncated("auth data length"))?;
        if !reader.skip(10) {
            return Err(truncated("reserved bytes"));
        }

        if handshake.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = usize::from(auth_data_len).saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(part2_len.min(reader.remaining()))
                .unwrap_or_default();
            auth_data.extend_from_slice(part2);
        }
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
        handshake.auth_data = auth_data;

        if handshake.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            if let Some(name) = reader.read_null_string().filter(|n| !n.is_empty()) {
                handshake.auth_plugin = name;
            }
        }

        Ok(handshake)
    }

    pub const fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }
}

fn write_auth_response(writer: &mut PacketWriter, capabilities: u32, auth_response: &[u8]) {
    if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(auth_response);
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let len = auth_response.len().min(255);
        writer.write_u8(len as u8);
        writer.write_bytes(&auth_response[..len]);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }
}

fn write_connect_attrs(writer: &mut PacketWriter, attributes: &[(String, String)]) {
    let mut attrs = PacketWriter::with_capacity(128);
    for (key, value) in attributes {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(value);
    }
    writer.write_lenenc_bytes(attrs.as_bytes());
}

/// Build the 32-byte SSL request sent before the TLS handshake.
pub fn build_ssl_request(capabilities: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(capabilities);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Handshake response (HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: Option<&'a str>,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(128 + self.auth_response.len());
        writer.write_bytes(&build_ssl_request(
            self.capabilities,
            self.max_packet_size,
            self.charset,
        ));
        writer.write_null_string(self.user);
        write_auth_response(&mut writer, self.capabilities, self.auth_response);

        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = self.database {
                writer.write_null_string(db);
            }
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin.unwrap_or(DEFAULT_AUTH_PLUGIN));
        }
        if self.capabilities & CLIENT_CONNECT_ATTRS != 0 {
            write_connect_attrs(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

/// COM_CHANGE_USER payload.
#[derive(Debug, Clone)]
pub struct ChangeUser<'a> {
    pub capabilities: u32,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub charset: u16,
    pub auth_plugin: Option<&'a str>,
    pub attributes: &'a [(String, String)],
}

impl ChangeUser<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::command(Command::ChangeUser, 64 + self.auth_response.len());
        writer.write_null_string(self.user);
        if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = self.auth_response.len().min(255);
            writer.write_u8(len as u8);
            writer.write_bytes(&self.auth_response[..len]);
        } else {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
        }
        writer.write_null_string(self.database.unwrap_or(""));
        if self.capabilities & CLIENT_PROTOCOL_41 != 0 {
            writer.write_u16_le(self.charset);
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin.unwrap_or(DEFAULT_AUTH_PLUGIN));
        }
        if self.capabilities & CLIENT_CONNECT_ATTRS != 0 {
            write_connect_attrs(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

/// AuthSwitchRequest: 0xFE, plugin name NUL, plugin data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() == 1 {
            return Err(Error::authentication(
                AuthErrorKind::UnsupportedPlugin,
                "Authentication with old (insecure) passwords is not supported",
            ));
        }
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0xFE) {
            return Err(Error::protocol("auth switch request must start with 0xFE"));
        }
        let plugin = reader
            .read_null_string()
            .ok_or_else(|| truncated("auth plugin name"))?;
        let mut data = reader.read_rest().to_vec();
        if data.last() == Some(&0) {
            data.pop();
        }
        Ok(Self { plugin, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scramble_native_password;

    const SEED: [u8; 20] = [
        0x3b, 0x55, 0x78, 0x7d, 0x2c, 0x5f, 0x7c, 0x72, 0x49, 0x52, 0x3f, 0x28, 0x47, 0x6f, 0x77,
        0x28, 0x5f, 0x28, 0x46, 0x69,
    ];

    const LEGACY_DEFAULT_FLAGS: u32 = 0x0003_a28d;

    fn greeting() -> Vec<u8> {
        let mut data = vec![0x0a];
        data.extend_from_slice(b"5.0.30-enterprise-gpl-log\0");
        data.extend_from_slice(&[0x09, 0x01, 0x00, 0x00]);
        data.extend_from_slice(b"h4i6oP!O\0");
        data.extend_from_slice(&[0x2c, 0xa2, 0x08, 0x02, 0x00]);
        data.extend_from_slice(&[0u8; 13]);
        data.extend_from_slice(b"Lng9&PD@WrYH\0");
        data
    }

    #[test]
    fn test_parse_handshake_fixture() {
        let hs = Handshake::parse(&greeting()).unwrap();
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.server_version.original, "5.0.30-enterprise-gpl-log");
        assert_eq!(hs.server_version.triple(), (5, 0, 30));
        assert_eq!(hs.server_version.suffix, "-enterprise-gpl-log");
        assert_eq!(hs.charset, 8);
        assert_eq!(hs.connection_id, 265);
        assert_eq!(hs.capabilities, 41516);
        assert_eq!(hs.status_flags, 2);
        assert_eq!(hs.auth_data, b"h4i6oP!OLng9&PD@WrYH");
        assert_eq!(hs.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_parse_handshake_without_final_nul() {
        let mut data = greeting();
        data.pop();
        let hs = Handshake::parse(&data).unwrap();
        assert_eq!(hs.auth_data, b"h4i6oP!OLng9&PD@WrYH");
    }

    #[test]
    fn test_parse_handshake_with_plugin() {
        let mut data = vec![0x0a];
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&SEED[..8]);
        data.push(0);
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        data.extend_from_slice(&(caps as u16).to_le_bytes());
        data.push(255);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&SEED[8..]);
        data.push(0);
        data.extend_from_slice(b"caching_sha2_password\0");

        let hs = Handshake::parse(&data).unwrap();
        assert_eq!(hs.auth_data, SEED);
        assert_eq!(hs.auth_plugin, "caching_sha2_password");
        assert!(hs.server_version.at_least(8, 0, 0));
        assert!(!hs.server_version.at_least(8, 1, 0));
        assert!(hs.has_capability(CLIENT_PLUGIN_AUTH));
    }

    #[test]
    fn test_truncated_handshake_names_field() {
        let data = greeting();
        for (cut, field) in [
            (0, "protocol version"),
            (5, "server version"),
            (28, "thread id"),
            (34, "auth data part 1"),
            (41, "capability flags"),
            (46, "capability flags (upper)"),
            (50, "reserved bytes"),
        ] {
            let err = Handshake::parse(&data[..cut]).unwrap_err();
            assert!(
                err.to_string().contains(field),
                "cut at {cut}: {err} should mention {field}"
            );
        }
    }

    #[test]
    fn test_rejects_other_protocols_and_old_servers() {
        assert!(Handshake::parse(&[0x09, b'4', 0]).is_err());
        assert!(ServerVersion::parse("4.0.99").is_err());
        assert!(ServerVersion::parse("not-a-version").is_err());
        assert!(ServerVersion::parse("4.1.0").is_ok());
        assert!(ServerVersion::parse("5.5.5-10.11.6-MariaDB").unwrap().is_mariadb());
    }

    #[test]
    fn test_handshake_response_fixture() {
        let scramble = scramble_native_password(b"spam", &SEED);
        let response = HandshakeResponse {
            capabilities: LEGACY_DEFAULT_FLAGS,
            max_packet_size: 1 << 30,
            charset: 33,
            user: "ham",
            auth_response: &scramble,
            database: Some("test"),
            auth_plugin: None,
            attributes: &[],
        };
        let mut expected = vec![0x8d, 0xa2, 0x03, 0x00, 0x00, 0x00, 0x00, 0x40, 0x21];
        expected.extend_from_slice(&[0u8; 23]);
        expected.extend_from_slice(b"ham\0\x14");
        expected.extend_from_slice(&[
            0x3a, 0x07, 0x66, 0xba, 0xba, 0x01, 0xce, 0xbe, 0x55, 0xe6, 0x29, 0x88, 0xaa, 0xae,
            0xdb, 0x00, 0xb3, 0x4d, 0x91, 0x5b,
        ]);
        expected.extend_from_slice(b"test\0");
        assert_eq!(response.encode(), expected);

        let no_password = HandshakeResponse {
            auth_response: &[],
            database: Some("test"),
            ..response.clone()
        };
        let encoded = no_password.encode();
        assert_eq!(&encoded[32..], b"ham\0\x00test\0");

        let no_user = HandshakeResponse {
            user: "",
            ..response.clone()
        };
        assert_eq!(no_user.encode()[32], 0x00);
        assert_eq!(no_user.encode()[33], 0x14);
    }

    #[test]
    fn test_handshake_response_modern_fields() {
        let attrs = vec![("_client_name".to_string(), "mysqlwire".to_string())];
        let caps = LEGACY_DEFAULT_FLAGS
            | CLIENT_PLUGIN_AUTH
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_ATTRS;
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 1 << 24,
            charset: 45,
            user: "u",
            auth_response: &[1, 2, 3],
            database: None,
            auth_plugin: Some("caching_sha2_password"),
            attributes: &attrs,
        };
        let encoded = response.encode();
        let mut tail = b"u\0\x03\x01\x02\x03caching_sha2_password\0".to_vec();
        tail.push(23);
        tail.push(12);
        tail.extend_from_slice(b"_client_name");
        tail.push(9);
        tail.extend_from_slice(b"mysqlwire");
        assert_eq!(&encoded[32..], tail.as_slice());
    }

    #[test]
    fn test_ssl_request_fixture() {
        let mut expected = vec![0x0d, 0xaa, 0x03, 0x00, 0x00, 0x00, 0x00, 0x80, 0x08];
        expected.extend_from_slice(&[0u8; 23]);
        assert_eq!(build_ssl_request(240_141, 0x8000_0000, 8), expected);
    }

    #[test]
    fn test_change_user_fixture() {
        let scramble = scramble_native_password(b"spam", &SEED);
        let change = ChangeUser {
            capabilities: LEGACY_DEFAULT_FLAGS,
            user: "ham",
            auth_response: &scramble,
            database: Some("test"),
            charset: 8,
            auth_plugin: None,
            attributes: &[],
        };
        let mut expected = b"\x11ham\0\x14".to_vec();
        expected.extend_from_slice(&scramble);
        expected.extend_from_slice(b"test\0\x08\x00");
        assert_eq!(change.encode(), expected);

        let no_password = ChangeUser {
            auth_response: &[],
            ..change
        };
        assert_eq!(no_password.encode(), b"\x11ham\0\x00test\0\x08\x00");
    }

    #[test]
    fn test_auth_switch_request() {
        let req = AuthSwitchRequest::parse(b"\xfemysql_native_password\0abcdefghij0123456789\0")
            .unwrap();
        assert_eq!(req.plugin, "mysql_native_password");
        assert_eq!(req.data, b"abcdefghij0123456789");

        let err = AuthSwitchRequest::parse(&[0xFE]).unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(ref e) if e.kind == AuthErrorKind::UnsupportedPlugin
        ));
    }
}
