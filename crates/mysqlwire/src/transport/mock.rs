//! Scripted in-memory transports.
//!
//! A [`MockStream`] replays bytes a server would send and records what the
//! client writes, so sessions can be exercised without a server. [`Script`]
//! frames server packets with the right sequence numbers and has builders for
//! the common server payloads.

#![allow(clippy::cast_possible_truncation)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{AsyncIo, BlockingIo};
use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketHeader, PacketWriter, capabilities};
use crate::types::{ColumnDef, FieldType};
use mysqlwire_core::Result;

#[derive(Debug, Default)]
struct Shared {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    tls_upgrades: usize,
    shutdown: bool,
}

/// Inspect a mock stream after it has been moved into a session.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    fn with<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        let mut guard = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Every byte the client wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.with(|s| s.written.clone())
    }

    /// The client bytes split into `(sequence, payload)` packets.
    /// Only meaningful while compression is off.
    pub fn written_packets(&self) -> Vec<(u8, Vec<u8>)> {
        split_packets(&self.written())
    }

    pub fn clear_written(&self) {
        self.with(|s| s.written.clear());
    }

    /// Queue more server bytes.
    pub fn push(&self, bytes: Vec<u8>) {
        self.with(|s| s.reads.push_back(bytes));
    }

    pub fn tls_upgrades(&self) -> usize {
        self.with(|s| s.tls_upgrades)
    }

    pub fn is_shutdown(&self) -> bool {
        self.with(|s| s.shutdown)
    }

    /// Server bytes not yet read by the client.
    pub fn unread(&self) -> usize {
        self.with(|s| s.reads.iter().map(Vec::len).sum())
    }

    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.with(|s| {
            if s.shutdown {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "mock stream shut down",
                ));
            }
            let Some(front) = s.reads.front_mut() else {
                return Ok(0);
            };
            let n = front.len().min(buf.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            if front.is_empty() {
                s.reads.pop_front();
            }
            Ok(n)
        })
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<()> {
        self.with(|s| {
            if s.shutdown {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock stream shut down",
                ));
            }
            s.written.extend_from_slice(buf);
            Ok(())
        })
    }
}

/// Split raw client bytes into `(sequence, payload)` packets.
pub fn split_packets(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut packets = Vec::new();
    while bytes.len() >= PacketHeader::SIZE {
        let header = PacketHeader::from_bytes(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        let end = (PacketHeader::SIZE + header.payload_length as usize).min(bytes.len());
        packets.push((header.sequence_id, bytes[PacketHeader::SIZE..end].to_vec()));
        bytes = &bytes[end..];
    }
    packets
}

/// Blocking scripted stream.
#[derive(Debug, Default)]
pub struct MockStream {
    handle: MockHandle,
    local: bool,
}

impl MockStream {
    pub fn new(server_bytes: Vec<u8>) -> Self {
        let stream = Self::default();
        stream.handle.push(server_bytes);
        stream
    }

    /// Pretend to be a unix socket.
    #[must_use]
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl BlockingIo for MockStream {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.handle.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.handle.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn is_local(&self) -> bool {
        self.local
    }

    /// Records the upgrade; the bytes stay in the clear.
    fn upgrade_tls(&mut self, _tls: &TlsConfig, _mode: SslMode, _host: &str) -> Result<()> {
        self.handle.with(|s| s.tls_upgrades += 1);
        Ok(())
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.handle.with(|s| s.shutdown = true);
    }
}

/// Async scripted stream; every call completes immediately.
#[derive(Debug, Default)]
pub struct MockAsyncStream {
    handle: MockHandle,
}

impl MockAsyncStream {
    pub fn new(server_bytes: Vec<u8>) -> Self {
        let stream = Self::default();
        stream.handle.push(server_bytes);
        stream
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl AsyncIo for MockAsyncStream {
    fn read_some(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = std::io::Result<usize>> + Send {
        std::future::ready(self.handle.read(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send {
        std::future::ready(self.handle.write(buf))
    }

    fn flush(&mut self) -> impl Future<Output = std::io::Result<()>> + Send {
        std::future::ready(Ok(()))
    }

    fn upgrade_tls(
        &mut self,
        _tls: &TlsConfig,
        _mode: SslMode,
        _host: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        self.handle.with(|s| s.tls_upgrades += 1);
        std::future::ready(Ok(()))
    }

    fn shutdown(&mut self) {
        self.handle.with(|s| s.shutdown = true);
    }
}

/// Server capabilities offered by [`Script::greeting`]. TLS is left out so
/// the default `Preferred` mode stays in the clear.
pub const SERVER_CAPABILITIES: u32 = capabilities::CLIENT_LONG_PASSWORD
    | capabilities::CLIENT_FOUND_ROWS
    | capabilities::CLIENT_LONG_FLAG
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_COMPRESS
    | capabilities::CLIENT_LOCAL_FILES
    | capabilities::CLIENT_PROTOCOL_41
    | capabilities::CLIENT_TRANSACTIONS
    | capabilities::CLIENT_SECURE_CONNECTION
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_MULTI_RESULTS
    | capabilities::CLIENT_PS_MULTI_RESULTS
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_CONNECT_ATTRS
    | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | capabilities::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
    | capabilities::CLIENT_MULTI_FACTOR_AUTHENTICATION;

/// The 20-byte scramble sent by [`Script::greeting`].
pub const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";

/// Builder for the byte stream a server would send.
#[derive(Debug, Default)]
pub struct Script {
    bytes: Vec<u8>,
    sequence: u8,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sequence id of the next packet.
    #[must_use]
    pub fn at(mut self, sequence: u8) -> Self {
        self.sequence = sequence;
        self
    }

    /// Frame one raw payload.
    #[must_use]
    pub fn packet(mut self, payload: &[u8]) -> Self {
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            sequence_id: self.sequence,
        };
        self.bytes.extend_from_slice(&header.to_bytes());
        self.bytes.extend_from_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);
        self
    }

    /// Initial handshake at sequence 0 advertising `capabilities`.
    #[must_use]
    pub fn greeting_with(self, capabilities: u32, plugin: &str) -> Self {
        self.at(0).packet(&handshake_payload(capabilities, plugin))
    }

    /// Initial handshake with [`SERVER_CAPABILITIES`] and native password.
    #[must_use]
    pub fn greeting(self) -> Self {
        self.greeting_with(SERVER_CAPABILITIES, "mysql_native_password")
    }

    /// Greeting plus the OK that ends a plain native-password login.
    #[must_use]
    pub fn login(self) -> Self {
        self.greeting().at(2).ok()
    }

    #[must_use]
    pub fn ok(self) -> Self {
        self.ok_with(0, 0, 0x0002)
    }

    #[must_use]
    pub fn ok_with(self, affected_rows: u64, last_insert_id: u64, status: u16) -> Self {
        self.packet(&ok_payload(affected_rows, last_insert_id, status, 0))
    }

    #[must_use]
    pub fn err(self, code: u16, sqlstate: &str, message: &str) -> Self {
        self.packet(&err_payload(code, sqlstate, message))
    }

    #[must_use]
    pub fn eof(self) -> Self {
        self.eof_with(0x0002)
    }

    #[must_use]
    pub fn eof_with(self, status: u16) -> Self {
        let mut payload = vec![0xFE, 0, 0];
        payload.extend_from_slice(&status.to_le_bytes());
        self.packet(&payload)
    }

    /// Column count, definitions and the EOF that closes them.
    #[must_use]
    pub fn columns(self, columns: &[ColumnDef]) -> Self {
        let mut writer = PacketWriter::new();
        writer.write_lenenc_int(columns.len() as u64);
        let mut script = self.packet(writer.as_bytes());
        for column in columns {
            script = script.packet(&column_payload(column));
        }
        script.eof()
    }

    /// Text row; `None` is NULL.
    #[must_use]
    pub fn row(self, values: &[Option<&str>]) -> Self {
        let mut writer = PacketWriter::new();
        for value in values {
            match value {
                Some(v) => writer.write_lenenc_string(v),
                None => writer.write_u8(0xFB),
            }
        }
        self.packet(writer.as_bytes())
    }

    /// A complete text result set of string cells.
    #[must_use]
    pub fn result_set(self, names: &[&str], rows: &[&[Option<&str>]], status: u16) -> Self {
        let columns: Vec<ColumnDef> = names
            .iter()
            .map(|n| ColumnDef::new(*n, FieldType::VarString))
            .collect();
        let mut script = self.columns(&columns);
        for row in rows {
            script = script.row(row);
        }
        script.eof_with(status)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn stream(self) -> MockStream {
        MockStream::new(self.bytes)
    }

    pub fn async_stream(self) -> MockAsyncStream {
        MockAsyncStream::new(self.bytes)
    }
}

/// Protocol::HandshakeV10 payload.
pub fn handshake_payload(capabilities: u32, plugin: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(10);
    writer.write_null_string("8.0.36");
    writer.write_u32_le(42);
    writer.write_bytes(&SCRAMBLE[..8]);
    writer.write_u8(0);
    writer.write_u16_le((capabilities & 0xFFFF) as u16);
    writer.write_u8(45);
    writer.write_u16_le(0x0002);
    writer.write_u16_le((capabilities >> 16) as u16);
    writer.write_u8(21);
    writer.write_zeros(10);
    writer.write_bytes(&SCRAMBLE[8..]);
    writer.write_u8(0);
    writer.write_null_string(plugin);
    writer.into_bytes()
}

pub fn ok_payload(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(0x00);
    writer.write_lenenc_int(affected_rows);
    writer.write_lenenc_int(last_insert_id);
    writer.write_u16_le(status);
    writer.write_u16_le(warnings);
    writer.into_bytes()
}

pub fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(0xFF);
    writer.write_u16_le(code);
    writer.write_u8(b'#');
    writer.write_bytes(sqlstate.as_bytes());
    writer.write_bytes(message.as_bytes());
    writer.into_bytes()
}

/// Protocol::ColumnDefinition41 payload.
pub fn column_payload(column: &ColumnDef) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_lenenc_string(&column.catalog);
    writer.write_lenenc_string(&column.schema);
    writer.write_lenenc_string(&column.table);
    writer.write_lenenc_string(&column.org_table);
    writer.write_lenenc_string(&column.name);
    writer.write_lenenc_string(&column.org_name);
    writer.write_lenenc_int(0x0c);
    writer.write_u16_le(column.charset);
    writer.write_u32_le(column.column_length);
    writer.write_u8(column.column_type as u8);
    writer.write_u16_le(column.flags);
    writer.write_u8(column.decimals);
    writer.write_zeros(2);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Handshake;
    use crate::transport::PacketStream;

    #[test]
    fn test_script_frames_sequences() {
        let bytes = Script::new().at(1).ok().eof().into_bytes();
        let packets = split_packets(&bytes);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, 1);
        assert_eq!(packets[1].0, 2);
    }

    #[test]
    fn test_greeting_parses() {
        let payload = handshake_payload(SERVER_CAPABILITIES, "caching_sha2_password");
        let handshake = Handshake::parse(&payload).unwrap();
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.auth_data, SCRAMBLE.to_vec());
        assert_eq!(handshake.auth_plugin, "caching_sha2_password");
        assert_eq!(handshake.capabilities, SERVER_CAPABILITIES);
    }

    #[test]
    fn test_column_payload_parses() {
        let column = ColumnDef::new("id", FieldType::Long).with_flags(32);
        assert_eq!(ColumnDef::parse(&column_payload(&column)).unwrap(), column);
    }

    #[test]
    fn test_packet_stream_over_mock() {
        let stream = Script::new().at(1).ok().stream();
        let handle = stream.handle();
        let mut packets = PacketStream::new(stream);
        packets.send(b"\x0e").unwrap();
        assert_eq!(packets.receive().unwrap()[0], 0x00);
        assert_eq!(handle.written_packets(), vec![(0, vec![0x0e])]);

        // the script is exhausted: the server went away
        let err = packets.receive().unwrap_err();
        assert!(matches!(
            err,
            mysqlwire_core::Error::Transport(ref t)
                if t.kind == mysqlwire_core::TransportErrorKind::Disconnected
        ));
    }
}
