//! Error types for the protocol engine.
//!
//! Every failure is classified once, at the layer that detects it:
//!
//! - [`TransportError`]: the socket failed or timed out. Fatal to the socket.
//! - [`ProtocolError`]: the byte stream violated the wire format. Fatal.
//! - [`AuthenticationError`]: the server or the client refused the handshake.
//! - [`ServerError`]: the server answered a command with an ERR packet.
//! - [`UsageError`]: the caller misused the session. Nothing was sent.
//! - [`DataError`]: a value could not be decoded or converted.

use std::fmt;

/// The primary error type for all mysqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Socket-level failure (connect, read, write, TLS, timeout)
    Transport(TransportError),
    /// Malformed or unexpected packet
    Protocol(ProtocolError),
    /// Handshake or authentication failure
    Authentication(AuthenticationError),
    /// ERR packet returned by the server for a command
    Server(ServerError),
    /// Local misuse of the session API
    Usage(UsageError),
    /// Value decoding or conversion failure
    Data(DataError),
    /// Invalid configuration
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Failed to establish the connection
    Connect,
    /// Connection refused by the peer
    Refused,
    /// Host name could not be resolved
    DnsResolution,
    /// Connection lost or stream truncated
    Disconnected,
    /// Connect, read or write deadline elapsed
    Timeout,
    /// TLS negotiation or record-layer failure
    Tls,
    /// A previous exchange was abandoned mid-flight and the socket was dropped
    Aborted,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct AuthenticationError {
    pub kind: AuthErrorKind,
    pub code: Option<u16>,
    pub sqlstate: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Wrong user name or password (ER_ACCESS_DENIED_ERROR and friends)
    AccessDenied,
    /// Password expired and the client did not declare it can handle that
    ExpiredPassword,
    /// The database named at connect time does not exist
    UnknownDatabase,
    /// The chosen mechanism would expose the password on an insecure channel
    InsecureChannel,
    /// The server asked for a plugin this client does not implement
    UnsupportedPlugin,
    /// Any other refusal, including failed server verification
    Rejected,
}

#[derive(Debug)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table, column or database not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too long or out of range for a column
    DataTruncation,
    /// Deadlock detected, transaction rolled back
    Deadlock,
    /// Lock wait timeout exceeded
    LockTimeout,
    /// Other database error
    Database,
}

impl ServerErrorKind {
    /// Classify a server error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1064 | 1149 => ServerErrorKind::Syntax,
            1048 | 1062 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 | 3819 => {
                ServerErrorKind::Constraint
            }
            1049 | 1051 | 1054 | 1091 | 1146 => ServerErrorKind::NotFound,
            1044 | 1142 | 1143 | 1227 | 1370 => ServerErrorKind::Permission,
            1264 | 1365 | 1406 => ServerErrorKind::DataTruncation,
            1213 => ServerErrorKind::Deadlock,
            1205 => ServerErrorKind::LockTimeout,
            _ => ServerErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// A result set is still pending; drain it before the next command
    UnreadResult,
    /// Rows were requested but no result set is active
    NoActiveResult,
    /// The session is closed
    Closed,
    /// The prepared statement is unknown to this session
    UnknownStatement,
    /// Parameter count does not match the statement
    ParameterCount,
    /// An argument was rejected before anything was sent
    InvalidArgument,
}

#[derive(Debug)]
pub struct DataError {
    pub message: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport(TransportError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    pub fn authentication(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Error::Authentication(AuthenticationError {
            kind,
            code: None,
            sqlstate: None,
            message: message.into(),
        })
    }

    pub fn usage(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind,
            message: message.into(),
        })
    }

    pub fn data(message: impl Into<String>) -> Self {
        Error::Data(DataError {
            message: message.into(),
            column: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Can the operation succeed if retried on a fresh socket or transaction?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(t) => !matches!(t.kind, TransportErrorKind::Tls),
            Error::Server(s) => matches!(
                s.kind,
                ServerErrorKind::Deadlock | ServerErrorKind::LockTimeout
            ),
            _ => false,
        }
    }

    /// Does this error leave the socket unusable?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }

    /// Server error code, for ERR packets received during a command or auth.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(s) => Some(s.code),
            Error::Authentication(a) => a.code,
            _ => None,
        }
    }

    /// SQLSTATE if available (e.g., "23000" for an integrity violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(s) => s.sqlstate.as_deref(),
            Error::Authentication(a) => a.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// The usage kind, when this is a local misuse error.
    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(u) => Some(u.kind),
            _ => None,
        }
    }
}

impl ServerError {
    /// Build a classified server error from the fields of an ERR packet.
    pub fn new(code: u16, sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::from_code(code),
            code,
            sqlstate: sqlstate.filter(|s| !s.is_empty()),
            message: message.into(),
            sql: None,
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, 1216 | 1217 | 1451 | 1452)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Authentication(e) => write!(f, "Authentication error: {}", e),
            Error::Server(e) => write!(f, "Server error {}", e),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Data(e) => write!(f, "Data error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.sqlstate) {
            (Some(code), Some(state)) => write!(f, "{} ({}): {}", code, state, self.message),
            (Some(code), None) => write!(f, "{}: {}", code, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} ({}): {}", self.code, sqlstate, self.message)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(f, "column '{}': {}", col, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            _ => TransportErrorKind::Disconnected,
        };
        Error::Transport(TransportError {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AuthenticationError> for Error {
    fn from(err: AuthenticationError) -> Self {
        Error::Authentication(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<DataError> for Error {
    fn from(err: DataError) -> Self {
        Error::Data(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for mysqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_classification() {
        let dup = ServerError::new(1062, Some("23000".to_string()), "Duplicate entry");
        assert_eq!(dup.kind, ServerErrorKind::Constraint);
        assert!(dup.is_duplicate_key());
        assert!(!dup.is_foreign_key_violation());

        let err = Error::Server(dup);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.server_code(), Some(1062));

        assert_eq!(ServerErrorKind::from_code(1064), ServerErrorKind::Syntax);
        assert_eq!(ServerErrorKind::from_code(1146), ServerErrorKind::NotFound);
        assert_eq!(ServerErrorKind::from_code(1213), ServerErrorKind::Deadlock);
        assert_eq!(ServerErrorKind::from_code(9999), ServerErrorKind::Database);
    }

    #[test]
    fn empty_sqlstate_is_dropped() {
        let err = ServerError::new(1105, Some(String::new()), "unknown");
        assert!(err.sqlstate.is_none());
        assert_eq!(err.to_string(), "1105: unknown");
    }

    #[test]
    fn retryable_and_fatal_flags() {
        let lost = Error::transport(TransportErrorKind::Disconnected, "lost connection");
        assert!(lost.is_retryable());
        assert!(lost.is_fatal());

        let tls = Error::transport(TransportErrorKind::Tls, "bad certificate");
        assert!(!tls.is_retryable());
        assert!(tls.is_fatal());

        let deadlock = Error::Server(ServerError::new(1213, None, "Deadlock found"));
        assert!(deadlock.is_retryable());
        assert!(!deadlock.is_fatal());

        let denied = Error::authentication(AuthErrorKind::AccessDenied, "Access denied");
        assert!(!denied.is_retryable());
        assert!(!denied.is_fatal());

        let usage = Error::usage(UsageErrorKind::UnreadResult, "Unread result found");
        assert_eq!(usage.usage_kind(), Some(UsageErrorKind::UnreadResult));
        assert!(!usage.is_fatal());
    }

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let timeout: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(
            timeout,
            Error::Transport(TransportError {
                kind: TransportErrorKind::Timeout,
                ..
            })
        ));

        let refused: Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(
            refused,
            Error::Transport(TransportError {
                kind: TransportErrorKind::Refused,
                ..
            })
        ));

        let eof: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(
            eof,
            Error::Transport(TransportError {
                kind: TransportErrorKind::Disconnected,
                ..
            })
        ));
        assert!(std::error::Error::source(&eof).is_some());
    }

    #[test]
    fn display_formats() {
        let auth = Error::Authentication(AuthenticationError {
            kind: AuthErrorKind::AccessDenied,
            code: Some(1045),
            sqlstate: Some("28000".to_string()),
            message: "Access denied for user 'ham'@'localhost'".to_string(),
        });
        assert_eq!(
            auth.to_string(),
            "Authentication error: 1045 (28000): Access denied for user 'ham'@'localhost'"
        );
        assert_eq!(auth.server_code(), Some(1045));

        let data = Error::Data(DataError {
            message: "invalid date 2023-13-01".to_string(),
            column: Some("d".to_string()),
        });
        assert_eq!(data.to_string(), "Data error: column 'd': invalid date 2023-13-01");
    }
}
