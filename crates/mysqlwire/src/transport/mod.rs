//! Packet transport: sockets, TLS and compression underneath the codec.
//!
//! [`PacketStream`] and [`AsyncPacketStream`] own a socket and a
//! [`PacketCodec`]. They only move payloads; everything protocol-level is
//! an [`Exchange`] that either stream can drive with `run`.

#![allow(clippy::manual_async_fn)]

pub mod codec;
pub mod mock;

use std::future::Future;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

pub use codec::PacketCodec;

use crate::config::{MySqlConfig, SslMode, TlsConfig};
use crate::exchange::{Exchange, Step};
use mysqlwire_core::{Error, Result, TransportError, TransportErrorKind};

#[cfg(feature = "tls")]
use crate::tls;

const READ_CHUNK: usize = 16 * 1024;

fn lost_connection() -> Error {
    Error::transport(
        TransportErrorKind::Disconnected,
        "Lost connection to MySQL server during query",
    )
}

fn tls_unavailable() -> Error {
    Error::transport(
        TransportErrorKind::Tls,
        "TLS requested but mysqlwire was built without feature 'tls'",
    )
}

/// A blocking byte stream the packet layer can run on.
pub trait BlockingIo: Send {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;

    /// Local sockets are treated as a secure channel.
    fn is_local(&self) -> bool {
        false
    }

    /// Wrap the stream in TLS after the SSL request has been sent.
    fn upgrade_tls(&mut self, _tls: &TlsConfig, _mode: SslMode, _host: &str) -> Result<()> {
        Err(tls_unavailable())
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self);
}

/// The async counterpart of [`BlockingIo`]; every call is a suspension point.
pub trait AsyncIo: Send {
    fn read_some(&mut self, buf: &mut [u8])
    -> impl Future<Output = std::io::Result<usize>> + Send;

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn is_local(&self) -> bool {
        false
    }

    fn upgrade_tls(
        &mut self,
        _tls: &TlsConfig,
        _mode: SslMode,
        _host: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Err(tls_unavailable()) }
    }

    fn shutdown(&mut self);
}

/// Payload-level view of a blocking socket.
#[derive(Debug)]
pub struct PacketStream<S> {
    io: S,
    codec: PacketCodec,
    buf: Vec<u8>,
}

impl<S: BlockingIo> PacketStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            codec: PacketCodec::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    pub fn is_compressed(&self) -> bool {
        self.codec.is_compressed()
    }

    pub fn enable_compression(&mut self) {
        debug!("Enabling protocol compression");
        self.codec.enable_compression();
    }

    /// Called before every command.
    pub fn reset_sequence(&mut self) {
        self.codec.reset_sequence();
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let bytes = self.codec.encode(payload)?;
        self.io.write_all(&bytes)?;
        self.io.flush()?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.codec.decode()? {
                return Ok(payload);
            }
            let n = self.io.read_some(&mut self.buf)?;
            if n == 0 {
                return Err(lost_connection());
            }
            self.codec.feed(&self.buf[..n]);
        }
    }

    pub fn upgrade_to_tls(&mut self, tls: &TlsConfig, mode: SslMode, host: &str) -> Result<()> {
        if self.codec.has_buffered() {
            return Err(Error::protocol("unexpected data before TLS upgrade"));
        }
        self.io.upgrade_tls(tls, mode, host)?;
        debug!(host = %host, "TLS established");
        Ok(())
    }

    /// Drive an exchange to completion.
    pub fn run<E: Exchange>(&mut self, mut exchange: E, config: &MySqlConfig) -> Result<E::Output> {
        let mut input = None;
        loop {
            match exchange.resume(input.take())? {
                Step::Send(payload) => self.send(&payload)?,
                Step::Receive => input = Some(self.receive()?),
                Step::StartTls => self.upgrade_to_tls(&config.tls, config.ssl_mode, &config.host)?,
                Step::Done(output) => return Ok(output),
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.io.shutdown();
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

/// Payload-level view of an async socket.
#[derive(Debug)]
pub struct AsyncPacketStream<S> {
    io: S,
    codec: PacketCodec,
    buf: Vec<u8>,
}

impl<S: AsyncIo> AsyncPacketStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            codec: PacketCodec::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn is_compressed(&self) -> bool {
        self.codec.is_compressed()
    }

    pub fn enable_compression(&mut self) {
        debug!("Enabling protocol compression");
        self.codec.enable_compression();
    }

    pub fn reset_sequence(&mut self) {
        self.codec.reset_sequence();
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let bytes = self.codec.encode(payload)?;
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.codec.decode()? {
                return Ok(payload);
            }
            let n = self.io.read_some(&mut self.buf).await?;
            if n == 0 {
                return Err(lost_connection());
            }
            self.codec.feed(&self.buf[..n]);
        }
    }

    pub async fn upgrade_to_tls(&mut self, tls: &TlsConfig, mode: SslMode, host: &str) -> Result<()> {
        if self.codec.has_buffered() {
            return Err(Error::protocol("unexpected data before TLS upgrade"));
        }
        self.io.upgrade_tls(tls, mode, host).await?;
        debug!(host = %host, "TLS established");
        Ok(())
    }

    /// Drive an exchange to completion.
    pub async fn run<E: Exchange + Send>(
        &mut self,
        mut exchange: E,
        config: &MySqlConfig,
    ) -> Result<E::Output> {
        let mut input = None;
        loop {
            match exchange.resume(input.take())? {
                Step::Send(payload) => self.send(&payload).await?,
                Step::Receive => input = Some(self.receive().await?),
                Step::StartTls => {
                    self.upgrade_to_tls(&config.tls, config.ssl_mode, &config.host)
                        .await?;
                }
                Step::Done(output) => return Ok(output),
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.io.shutdown();
    }
}

fn connect_error(addr: &str, err: std::io::Error) -> Error {
    let kind = match err.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportErrorKind::Timeout
        }
        _ => TransportErrorKind::Connect,
    };
    Error::Transport(TransportError {
        kind,
        message: format!("Can't connect to MySQL server on '{}': {}", addr, err),
        source: Some(Box::new(err)),
    })
}

fn resolve(config: &MySqlConfig) -> Result<Vec<std::net::SocketAddr>> {
    let addr = config.socket_addr();
    let addrs: Vec<_> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::Transport(TransportError {
                kind: TransportErrorKind::DnsResolution,
                message: format!("Unknown MySQL server host '{}': {}", config.host, e),
                source: Some(Box::new(e)),
            })
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::transport(
            TransportErrorKind::DnsResolution,
            format!("Unknown MySQL server host '{}'", addr),
        ));
    }
    Ok(addrs)
}

/// A blocking network socket.
#[derive(Debug)]
pub enum NetStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tls::TlsStream<TcpStream>>),
    Closed,
}

impl NetStream {
    /// Open the socket named by the config: the unix socket path when set,
    /// otherwise TCP to each resolved address in turn.
    pub fn connect(config: &MySqlConfig) -> Result<Self> {
        if let Some(path) = &config.socket {
            return Self::connect_socket(path, config);
        }

        let addr = config.socket_addr();
        let mut last_error = None;
        for socket_addr in resolve(config)? {
            match TcpStream::connect_timeout(&socket_addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(config.read_timeout)?;
                    stream.set_write_timeout(config.write_timeout)?;
                    return Ok(NetStream::Tcp(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => connect_error(&addr, e),
            None => Error::transport(TransportErrorKind::Connect, format!("no address for {addr}")),
        })
    }

    #[cfg(unix)]
    fn connect_socket(path: &std::path::Path, config: &MySqlConfig) -> Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path)
            .map_err(|e| connect_error(&path.display().to_string(), e))?;
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        Ok(NetStream::Unix(stream))
    }

    #[cfg(not(unix))]
    fn connect_socket(_path: &std::path::Path, _config: &MySqlConfig) -> Result<Self> {
        Err(Error::config("unix sockets are not supported on this platform"))
    }

    fn closed() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
    }
}

impl BlockingIo for NetStream {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            NetStream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.read(buf),
            NetStream::Closed => Err(Self::closed()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            NetStream::Tcp(s) => Write::write_all(s, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Write::write_all(s, buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => Write::write_all(s, buf),
            NetStream::Closed => Err(Self::closed()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            NetStream::Tcp(s) => Write::flush(s),
            #[cfg(unix)]
            NetStream::Unix(s) => Write::flush(s),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => Write::flush(s),
            NetStream::Closed => Err(Self::closed()),
        }
    }

    fn is_local(&self) -> bool {
        #[cfg(unix)]
        if matches!(self, NetStream::Unix(_)) {
            return true;
        }
        false
    }

    #[cfg(feature = "tls")]
    fn upgrade_tls(&mut self, tls_config: &TlsConfig, mode: SslMode, host: &str) -> Result<()> {
        match std::mem::replace(self, NetStream::Closed) {
            NetStream::Tcp(stream) => {
                let upgraded = tls::TlsStream::new(stream, tls_config, host, mode)?;
                *self = NetStream::Tls(Box::new(upgraded));
                Ok(())
            }
            other => {
                *self = other;
                Err(Error::transport(
                    TransportErrorKind::Tls,
                    "TLS is only available on TCP connections",
                ))
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self {
            NetStream::Tcp(s) => s.set_read_timeout(timeout)?,
            #[cfg(unix)]
            NetStream::Unix(s) => s.set_read_timeout(timeout)?,
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.get_ref().set_read_timeout(timeout)?,
            NetStream::Closed => {}
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        match std::mem::replace(self, NetStream::Closed) {
            NetStream::Tcp(s) => {
                s.shutdown(Shutdown::Both).ok();
            }
            #[cfg(unix)]
            NetStream::Unix(s) => {
                s.shutdown(Shutdown::Both).ok();
            }
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => {
                s.get_ref().shutdown(Shutdown::Both).ok();
            }
            NetStream::Closed => {}
        }
    }
}

/// An async TCP socket on asupersync.
pub enum AsyncNetStream {
    Plain(asupersync::net::TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<AsyncTlsStream>),
    Closed,
}

impl std::fmt::Debug for AsyncNetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            AsyncNetStream::Plain(_) => "Plain",
            #[cfg(feature = "tls")]
            AsyncNetStream::Tls(_) => "Tls",
            AsyncNetStream::Closed => "Closed",
        };
        f.debug_tuple("AsyncNetStream").field(&variant).finish()
    }
}

impl AsyncNetStream {
    /// Connect over TCP. Unix sockets are only offered by the blocking
    /// presentation.
    pub async fn connect(config: &MySqlConfig) -> Result<Self> {
        if config.socket.is_some() {
            return Err(Error::config(
                "unix socket connections are only supported by the blocking connection",
            ));
        }

        let addr = config.socket_addr();
        let mut last_error = None;
        for socket_addr in resolve(config)? {
            match asupersync::net::TcpStream::connect_timeout(socket_addr, config.connect_timeout)
                .await
            {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(AsyncNetStream::Plain(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => connect_error(&addr, e),
            None => Error::transport(TransportErrorKind::Connect, format!("no address for {addr}")),
        })
    }
}

impl AsyncIo for AsyncNetStream {
    fn read_some(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = std::io::Result<usize>> + Send {
        async move {
            match self {
                AsyncNetStream::Plain(s) => read_some_plain(s, buf).await,
                #[cfg(feature = "tls")]
                AsyncNetStream::Tls(s) => s.read_plain(buf).await,
                AsyncNetStream::Closed => Err(NetStream::closed()),
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send {
        async move {
            match self {
                AsyncNetStream::Plain(s) => write_all_plain(s, buf).await,
                #[cfg(feature = "tls")]
                AsyncNetStream::Tls(s) => s.write_all(buf).await,
                AsyncNetStream::Closed => Err(NetStream::closed()),
            }
        }
    }

    fn flush(&mut self) -> impl Future<Output = std::io::Result<()>> + Send {
        async move {
            match self {
                AsyncNetStream::Plain(s) => flush_plain(s).await,
                #[cfg(feature = "tls")]
                AsyncNetStream::Tls(s) => s.flush().await,
                AsyncNetStream::Closed => Err(NetStream::closed()),
            }
        }
    }

    #[cfg(feature = "tls")]
    fn upgrade_tls(
        &mut self,
        tls_config: &TlsConfig,
        mode: SslMode,
        host: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            match std::mem::replace(self, AsyncNetStream::Closed) {
                AsyncNetStream::Plain(tcp) => {
                    let upgraded = AsyncTlsStream::handshake(tcp, tls_config, mode, host).await?;
                    *self = AsyncNetStream::Tls(Box::new(upgraded));
                    Ok(())
                }
                other => {
                    *self = other;
                    Err(Error::transport(
                        TransportErrorKind::Tls,
                        "TLS is already active on this connection",
                    ))
                }
            }
        }
    }

    /// Dropping the stream closes the socket.
    fn shutdown(&mut self) {
        *self = AsyncNetStream::Closed;
    }
}

/// TLS over an asupersync TCP stream: a rustls client connection pumped with
/// async reads and writes.
#[cfg(feature = "tls")]
pub struct AsyncTlsStream {
    tcp: asupersync::net::TcpStream,
    tls: rustls::ClientConnection,
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for AsyncTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTlsStream")
            .field("protocol_version", &self.tls.protocol_version())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl AsyncTlsStream {
    async fn handshake(
        mut tcp: asupersync::net::TcpStream,
        tls_config: &TlsConfig,
        mode: SslMode,
        host: &str,
    ) -> Result<Self> {
        let config = tls::build_client_config(tls_config, mode)?;
        let server_name = tls::server_name(tls_config, host)?;
        let mut conn = rustls::ClientConnection::new(std::sync::Arc::new(config), server_name)
            .map_err(|e| tls::tls_error(format!("Failed to create TLS connection: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                let mut out = Vec::new();
                conn.write_tls(&mut out)
                    .map_err(|e| tls::tls_error(format!("TLS handshake write_tls error: {e}")))?;
                if !out.is_empty() {
                    write_all_plain(&mut tcp, &out).await?;
                }
            }

            if conn.wants_read() {
                let mut buf = [0u8; 8192];
                let n = read_some_plain(&mut tcp, &mut buf).await?;
                if n == 0 {
                    return Err(tls::tls_error("Connection closed during TLS handshake"));
                }
                let mut cursor = std::io::Cursor::new(&buf[..n]);
                conn.read_tls(&mut cursor)
                    .map_err(|e| tls::tls_error(format!("TLS handshake read_tls error: {e}")))?;
                conn.process_new_packets()
                    .map_err(|e| tls::tls_error(format!("TLS handshake error: {e}")))?;
            }
        }

        Ok(Self { tcp, tls: conn })
    }

    async fn read_plain(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.tls.reader().read(out) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.tls.wants_read() {
                return Ok(0);
            }

            let mut enc = [0u8; 8192];
            let n = read_some_plain(&mut self.tcp, &mut enc).await?;
            if n == 0 {
                return Ok(0);
            }

            let mut cursor = std::io::Cursor::new(&enc[..n]);
            self.tls.read_tls(&mut cursor)?;
            self.tls
                .process_new_packets()
                .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.tls.writer().write(&buf[written..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "TLS write zero",
                ));
            }
            written += n;
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            let mut out = Vec::new();
            self.tls.write_tls(&mut out)?;
            if !out.is_empty() {
                write_all_plain(&mut self.tcp, &out).await?;
            }
        }
        flush_plain(&mut self.tcp).await
    }
}

async fn read_some_plain(
    stream: &mut asupersync::net::TcpStream,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf))
        .await?;
    Ok(read_buf.filled().len())
}

async fn write_all_plain(
    stream: &mut asupersync::net::TcpStream,
    buf: &[u8],
) -> std::io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = std::future::poll_fn(|cx| {
            std::pin::Pin::new(&mut *stream).poll_write(cx, &buf[written..])
        })
        .await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "connection closed",
            ));
        }
        written += n;
    }
    Ok(())
}

async fn flush_plain(stream: &mut asupersync::net::TcpStream) -> std::io::Result<()> {
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_flush(cx)).await
}
