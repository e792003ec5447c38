//! The handshake and authentication state machine.
//!
//! ```text
//! AwaitHandshake -> [SslRequested -> TlsStarted] -> AwaitResult
//!     AwaitResult --0xFE--> AuthSwitch   --> AwaitResult
//!     AwaitResult --0x01--> AuthMoreData --> AwaitResult
//!     AwaitResult --0x02--> NextFactor   --> AwaitResult
//!     AwaitResult --0x00--> Done
//!     AwaitResult --0xFF--> Failed
//! ```
//!
//! COM_CHANGE_USER enters the machine directly at `AwaitResult` on an open
//! socket, reusing the scramble of the original greeting.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{AuthContext, AuthMethod, AuthPlugin, AuthReply, ExternalAuth, plugins, select_plugin};
use crate::config::{MySqlConfig, SslMode};
use crate::exchange::{Exchange, Step};
use crate::protocol::capabilities::{
    CLIENT_CONNECT_WITH_DB, CLIENT_MULTI_FACTOR_AUTHENTICATION, CLIENT_PLUGIN_AUTH,
    CLIENT_PROTOCOL_41, CLIENT_SSL,
};
use crate::protocol::handshake::{ChangeUser, build_ssl_request};
use crate::protocol::{
    AuthSwitchRequest, ErrPacket, Handshake, HandshakeResponse, OkPacket, PacketReader, charset,
    parse_err, parse_ok, truncated, unexpected,
};
use mysqlwire_core::{AuthErrorKind, AuthenticationError, Error, Result, TransportErrorKind};

/// Credentials and negotiation wishes, detached from the config so a
/// session can run `change_user` with different values.
#[derive(Clone)]
pub struct AuthSettings {
    pub user: String,
    /// One password per authentication factor (at least one, possibly empty)
    pub factors: Vec<String>,
    pub database: Option<String>,
    pub collation: u16,
    pub max_packet_size: u32,
    /// Capabilities the client would like, before masking with the server's
    pub capabilities: u32,
    pub ssl_mode: SslMode,
    pub auth_plugin: Option<String>,
    pub server_public_key: Option<Vec<u8>>,
    pub external_auth: Option<Arc<dyn ExternalAuth>>,
    pub attributes: Vec<(String, String)>,
}

impl AuthSettings {
    pub fn from_config(config: &MySqlConfig) -> Self {
        let mut factors = vec![config.password.clone().unwrap_or_default()];
        factors.extend(config.extra_factors.iter().cloned());
        Self {
            user: config.user.clone(),
            factors,
            database: config.database.clone(),
            collation: config.collation,
            max_packet_size: config.max_packet_size,
            capabilities: config.capability_flags(),
            ssl_mode: config.ssl_mode,
            auth_plugin: config.auth_plugin.clone(),
            server_public_key: config.server_public_key.clone(),
            external_auth: config.external_auth.clone(),
            attributes: config.connect_attributes(),
        }
    }

    /// Collation byte of the handshake response. Ids above 255 do not fit and
    /// are applied with `SET NAMES` once connected.
    pub fn handshake_charset(&self) -> u8 {
        u8::try_from(self.collation).unwrap_or(charset::DEFAULT_COLLATION as u8)
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("user", &self.user)
            .field("factors", &self.factors.len())
            .field("database", &self.database)
            .field("collation", &self.collation)
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// The server greeting (absent for change_user)
    pub handshake: Option<Handshake>,
    /// Negotiated capabilities
    pub capabilities: u32,
    /// Plugin that completed the exchange
    pub plugin: String,
    /// TLS was negotiated during this exchange
    pub tls: bool,
    /// The final OK packet
    pub ok: OkPacket,
    /// Database that still has to be selected with COM_INIT_DB because the
    /// server did not accept it in the handshake
    pub init_database: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitHandshake,
    SslRequested,
    TlsStarted,
    AwaitResult,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Connect,
    ChangeUser,
}

/// Runs one handshake (or change_user) to completion.
pub struct Authenticator {
    settings: AuthSettings,
    mode: Mode,
    state: State,
    handshake: Option<Handshake>,
    server_plugin: String,
    capabilities: u32,
    seed: Vec<u8>,
    secure: bool,
    tls: bool,
    plugin: Option<AuthMethod>,
    factor: usize,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("plugin", &self.plugin)
            .field("factor", &self.factor)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Authenticate a freshly opened socket. `socket_secure` is true for local
    /// sockets, which count as secure and skip TLS.
    pub fn connect(settings: AuthSettings, socket_secure: bool) -> Self {
        Self {
            settings,
            mode: Mode::Connect,
            state: State::Start,
            handshake: None,
            server_plugin: String::new(),
            capabilities: 0,
            seed: Vec::new(),
            secure: socket_secure,
            tls: false,
            plugin: None,
            factor: 0,
        }
    }

    /// Re-authenticate an open session as another user.
    pub fn change_user(
        settings: AuthSettings,
        capabilities: u32,
        seed: Vec<u8>,
        server_plugin: impl Into<String>,
        secure: bool,
    ) -> Self {
        Self {
            settings,
            mode: Mode::ChangeUser,
            state: State::Start,
            handshake: None,
            server_plugin: server_plugin.into(),
            capabilities,
            seed,
            secure,
            tls: false,
            plugin: None,
            factor: 0,
        }
    }

    fn context(&self) -> AuthContext<'_> {
        AuthContext {
            user: &self.settings.user,
            password: self
                .settings
                .factors
                .get(self.factor)
                .map_or(&[][..], |p| p.as_bytes()),
            seed: &self.seed,
            secure: self.secure,
            server_public_key: self.settings.server_public_key.as_deref(),
        }
    }

    /// Plugin for the first response. SASL needs the mechanism name from an
    /// auth switch, so the first response uses native password instead and
    /// lets the server switch.
    fn initial_plugin_name(&self) -> String {
        let name = match &self.settings.auth_plugin {
            Some(forced) => forced.as_str(),
            None if self.capabilities & CLIENT_PLUGIN_AUTH != 0 && !self.server_plugin.is_empty() => {
                self.server_plugin.as_str()
            }
            None => plugins::MYSQL_NATIVE_PASSWORD,
        };
        if name == plugins::LDAP_SASL_CLIENT {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            name.to_string()
        }
    }

    /// Select the plugin and compute its first response.
    fn start_plugin(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut method = select_plugin(name, self.settings.external_auth.as_ref())?;
        debug!(plugin = name, factor = self.factor + 1, "Using authentication plugin");
        let response = method.initial_response(&self.context())?;
        self.plugin = Some(method);
        Ok(response)
    }

    fn on_handshake(&mut self, payload: &[u8]) -> Result<Step<AuthOutcome>> {
        if payload.first() == Some(&0xFF) {
            return Err(auth_error(parse_err(payload)?));
        }
        let handshake = Handshake::parse(payload)?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin,
            "Received server handshake"
        );
        if !handshake.has_capability(CLIENT_PROTOCOL_41) {
            return Err(Error::protocol("server does not support protocol 4.1"));
        }

        let use_tls = if self.settings.ssl_mode.should_try_ssl() && !self.secure {
            if handshake.has_capability(CLIENT_SSL) {
                true
            } else if self.settings.ssl_mode.is_required() {
                return Err(Error::transport(
                    TransportErrorKind::Tls,
                    "SSL is required but the server does not support it",
                ));
            } else {
                false
            }
        } else {
            false
        };

        self.capabilities = self.settings.capabilities & handshake.capabilities;
        if !use_tls {
            self.capabilities &= !CLIENT_SSL;
        }
        self.seed.clone_from(&handshake.auth_data);
        self.server_plugin.clone_from(&handshake.auth_plugin);
        self.handshake = Some(handshake);

        if use_tls {
            self.state = State::SslRequested;
            Ok(Step::Send(build_ssl_request(
                self.capabilities,
                self.settings.max_packet_size,
                self.settings.handshake_charset(),
            )))
        } else {
            self.state = State::AwaitResult;
            self.handshake_response().map(Step::Send)
        }
    }

    fn handshake_response(&mut self) -> Result<Vec<u8>> {
        let plugin = self.initial_plugin_name();
        let auth_response = self.start_plugin(&plugin)?;
        let response = HandshakeResponse {
            capabilities: self.capabilities,
            max_packet_size: self.settings.max_packet_size,
            charset: self.settings.handshake_charset(),
            user: &self.settings.user,
            auth_response: &auth_response,
            database: self.settings.database.as_deref(),
            auth_plugin: Some(&plugin),
            attributes: &self.settings.attributes,
        };
        Ok(response.encode())
    }

    fn change_user_packet(&mut self) -> Result<Vec<u8>> {
        let plugin = self.initial_plugin_name();
        let auth_response = self.start_plugin(&plugin)?;
        let packet = ChangeUser {
            capabilities: self.capabilities,
            user: &self.settings.user,
            auth_response: &auth_response,
            database: self.settings.database.as_deref(),
            charset: self.settings.collation,
            auth_plugin: Some(&plugin),
            attributes: &self.settings.attributes,
        };
        Ok(packet.encode())
    }

    fn on_auth_packet(&mut self, payload: Vec<u8>) -> Result<Step<AuthOutcome>> {
        match payload.first().copied() {
            Some(0x00) => {
                let ok = parse_ok(&payload)?;
                self.state = State::Done;
                Ok(Step::Done(self.outcome(ok)))
            }
            Some(0xFF) => {
                self.state = State::Done;
                Err(auth_error(parse_err(&payload)?))
            }
            Some(0xFE) => {
                let switch = AuthSwitchRequest::parse(&payload)?;
                debug!(plugin = %switch.plugin, "Server requested authentication switch");
                self.seed = switch.data;
                let mut response = self.start_plugin(&switch.plugin)?;
                if response == [0] {
                    response.clear();
                }
                Ok(Step::Send(response))
            }
            Some(0x01) => {
                let Some(mut plugin) = self.plugin.take() else {
                    return Err(unexpected("authenticating", &payload));
                };
                let reply = plugin.continue_auth(&payload[1..], &self.context());
                self.plugin = Some(plugin);
                match reply? {
                    AuthReply::Send(bytes) => Ok(Step::Send(bytes)),
                    AuthReply::Wait => Ok(Step::Receive),
                }
            }
            Some(0x02) if self.capabilities & CLIENT_MULTI_FACTOR_AUTHENTICATION != 0 => {
                self.next_factor(&payload)
            }
            _ => Err(unexpected("authenticating", &payload)),
        }
    }

    /// AuthNextFactor: 0x02, plugin name NUL, plugin data.
    fn next_factor(&mut self, payload: &[u8]) -> Result<Step<AuthOutcome>> {
        let mut reader = PacketReader::new(payload);
        reader.skip(1);
        let plugin = reader
            .read_null_string()
            .ok_or_else(|| truncated("next factor plugin name"))?;
        let mut data = reader.read_rest().to_vec();
        if data.last() == Some(&0) {
            data.pop();
        }

        self.factor += 1;
        if self.factor >= self.settings.factors.len() {
            return Err(Error::authentication(
                AuthErrorKind::Rejected,
                format!(
                    "server requested authentication factor {} but only {} password(s) are configured",
                    self.factor + 1,
                    self.settings.factors.len()
                ),
            ));
        }
        debug!(factor = self.factor + 1, plugin = %plugin, "Server requested next authentication factor");
        self.seed = data;
        self.start_plugin(&plugin).map(Step::Send)
    }

    fn outcome(&mut self, ok: OkPacket) -> AuthOutcome {
        let init_database = match self.mode {
            Mode::Connect if self.capabilities & CLIENT_CONNECT_WITH_DB == 0 => {
                self.settings.database.clone()
            }
            _ => None,
        };
        AuthOutcome {
            handshake: self.handshake.take(),
            capabilities: self.capabilities,
            plugin: self
                .plugin
                .as_ref()
                .map_or_else(String::new, |p| p.name().to_string()),
            tls: self.tls,
            ok,
            init_database,
        }
    }
}

impl Exchange for Authenticator {
    type Output = AuthOutcome;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<AuthOutcome>> {
        match (self.state, packet) {
            (State::Start, None) => match self.mode {
                Mode::Connect => {
                    self.state = State::AwaitHandshake;
                    Ok(Step::Receive)
                }
                Mode::ChangeUser => {
                    self.state = State::AwaitResult;
                    self.change_user_packet().map(Step::Send)
                }
            },
            (State::AwaitHandshake, None) => Ok(Step::Receive),
            (State::AwaitHandshake, Some(payload)) => self.on_handshake(&payload),
            (State::SslRequested, None) => {
                self.state = State::TlsStarted;
                Ok(Step::StartTls)
            }
            (State::TlsStarted, None) => {
                debug!("TLS established, sending handshake response");
                self.tls = true;
                self.secure = true;
                self.state = State::AwaitResult;
                self.handshake_response().map(Step::Send)
            }
            (State::AwaitResult, None) => Ok(Step::Receive),
            (State::AwaitResult, Some(payload)) => self.on_auth_packet(payload),
            (_, Some(payload)) => Err(unexpected("authenticating", &payload)),
            (_, None) => Err(Error::protocol(
                "authentication exchange resumed in an invalid state",
            )),
        }
    }
}

/// Classify an ERR received during authentication.
pub(crate) fn auth_error(err: ErrPacket) -> Error {
    let kind = match err.error_code {
        1045 | 1698 => AuthErrorKind::AccessDenied,
        1049 => AuthErrorKind::UnknownDatabase,
        1820 | 1862 => AuthErrorKind::ExpiredPassword,
        _ => AuthErrorKind::Rejected,
    };
    Error::Authentication(AuthenticationError {
        kind,
        code: Some(err.error_code),
        sqlstate: (!err.sql_state.is_empty()).then_some(err.sql_state),
        message: err.error_message,
    })
}
