//! Session state shared by the blocking and async connections.
//!
//! Neither presentation decides on its own whether a command may run. Both
//! consult this state before writing anything, so the rules about pending
//! results and broken sockets hold the same way on either side.

use std::collections::HashMap;

use crate::auth::AuthOutcome;
use crate::command::QueryResponse;
use crate::protocol::{OkPacket, PreparedStatement, ServerVersion, server_status};
use crate::resultset::{RowDecoder, RowEvent, RowFormat};
use crate::types::ColumnDef;
use mysqlwire_core::{Error, Result, Row, UsageErrorKind};

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, handshake not finished
    Connecting,
    /// Ready for commands
    Ready,
    /// Rows of a result set are still on the wire
    InResult,
    /// A transport or protocol failure left the socket unusable
    Broken,
    /// Closed by the client
    Closed,
}

/// Negotiated and tracked state of one session.
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    capabilities: u32,
    collation: u16,
    user: String,
    database: Option<String>,
    status_flags: u16,
    unread_result: bool,
    have_next_result: bool,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    info: String,
    /// Decoder of the result whose rows are on the wire
    result: Option<RowDecoder>,
    /// Row format of the command that produced the current results
    format: RowFormat,
    statements: HashMap<u32, PreparedStatement>,
    server_version: Option<ServerVersion>,
    connection_id: u32,
    seed: Vec<u8>,
    server_plugin: String,
    plugin: String,
    secure: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            capabilities: 0,
            collation: 0,
            user: String::new(),
            database: None,
            status_flags: 0,
            unread_result: false,
            have_next_result: false,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            info: String::new(),
            result: None,
            format: RowFormat::Text,
            statements: HashMap::new(),
            server_version: None,
            connection_id: 0,
            seed: Vec::new(),
            server_plugin: String::new(),
            plugin: String::new(),
            secure: false,
        }
    }

    /// Adopt the result of the initial handshake.
    pub fn establish(
        &mut self,
        outcome: &AuthOutcome,
        user: &str,
        database: Option<String>,
        collation: u16,
        local_socket: bool,
    ) {
        if let Some(handshake) = &outcome.handshake {
            self.server_version = Some(handshake.server_version.clone());
            self.connection_id = handshake.connection_id;
            self.seed.clone_from(&handshake.auth_data);
            self.server_plugin.clone_from(&handshake.auth_plugin);
        }
        self.capabilities = outcome.capabilities;
        self.plugin.clone_from(&outcome.plugin);
        self.secure = local_socket || outcome.tls;
        self.user = user.to_string();
        self.database = database;
        self.collation = collation;
        self.record_ok(&outcome.ok);
    }

    /// Fail unless a new command may be sent.
    ///
    /// Rows of the current result or a pending next result must be read (or
    /// drained) first. Nothing is written to the socket on failure.
    pub fn check_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => {
                return Err(Error::usage(UsageErrorKind::Closed, "connection is closed"));
            }
            ConnectionState::Broken => {
                return Err(Error::usage(
                    UsageErrorKind::Closed,
                    "connection was lost; reconnect before issuing commands",
                ));
            }
            ConnectionState::Connecting => {
                return Err(Error::usage(
                    UsageErrorKind::Closed,
                    "connection handshake has not completed",
                ));
            }
            ConnectionState::Ready | ConnectionState::InResult => {}
        }
        if self.unread_result || self.have_next_result {
            return Err(Error::usage(
                UsageErrorKind::UnreadResult,
                "Commands out of sync; you can't run this command now",
            ));
        }
        Ok(())
    }

    /// Record an OK (or the end of a result set) and whether more results follow.
    pub fn record_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.info.clone_from(&ok.info);
        self.status_flags = ok.status_flags;
        self.result = None;
        self.unread_result = false;
        self.have_next_result = ok.more_results_exists();
        self.state = ConnectionState::Ready;
    }

    /// Column definitions were read; rows are pending.
    pub fn start_rows(&mut self, decoder: RowDecoder) {
        self.result = Some(decoder);
        self.unread_result = true;
        self.have_next_result = false;
        self.state = ConnectionState::InResult;
    }

    /// The terminator of a result set arrived.
    pub fn finish_rows(&mut self, end: &OkPacket) {
        self.record_ok(end);
    }

    /// Set the row format for the results of the command about to run.
    pub fn begin_command(&mut self, format: RowFormat) {
        self.format = format;
    }

    /// Adopt the first packets of a result.
    pub fn apply_response(&mut self, response: QueryResponse) {
        match response {
            QueryResponse::Ok(ok) => self.record_ok(&ok),
            QueryResponse::Columns(columns) => {
                let decoder = RowDecoder::new(columns, self.format, self.capabilities);
                self.start_rows(decoder);
            }
        }
    }

    /// Decode one packet of the current result. `None` means the result
    /// ended with this packet, or that no rows were pending.
    pub fn decode_row(&mut self, payload: &[u8]) -> Result<Option<Row>> {
        let Some(decoder) = &self.result else {
            return Ok(None);
        };
        match decoder.decode(payload)? {
            RowEvent::Row(row) => Ok(Some(row)),
            RowEvent::End(end) => {
                self.finish_rows(&end);
                Ok(None)
            }
        }
    }

    /// Columns of the result being read, empty when none is.
    pub fn result_columns(&self) -> &[ColumnDef] {
        self.result.as_ref().map_or(&[], RowDecoder::columns)
    }

    /// Claim the pending next result before reading it.
    pub fn start_next_result(&mut self) -> Result<()> {
        if self.unread_result {
            return Err(Error::usage(
                UsageErrorKind::UnreadResult,
                "rows of the current result must be read first",
            ));
        }
        if !self.have_next_result {
            return Err(Error::usage(
                UsageErrorKind::NoActiveResult,
                "no further results are pending",
            ));
        }
        self.have_next_result = false;
        Ok(())
    }

    /// Account for an error raised by an exchange. Returns true when the
    /// socket must be dropped.
    ///
    /// A server ERR ends the command and any multi-result chain. Data errors
    /// are raised after a packet was fully consumed and leave the stream in
    /// step, so they change nothing.
    pub fn fail(&mut self, error: &Error) -> bool {
        if error.is_fatal() || matches!(error, Error::Cancelled) {
            self.mark_broken();
            return true;
        }
        if matches!(error, Error::Server(_) | Error::Authentication(_)) {
            self.result = None;
            self.unread_result = false;
            self.have_next_result = false;
            if self.state == ConnectionState::InResult {
                self.state = ConnectionState::Ready;
            }
        }
        false
    }

    /// The socket can no longer be trusted.
    pub fn mark_broken(&mut self) {
        self.discard();
        self.state = ConnectionState::Broken;
    }

    pub fn mark_closed(&mut self) {
        self.discard();
        self.state = ConnectionState::Closed;
    }

    fn discard(&mut self) {
        self.result = None;
        self.unread_result = false;
        self.have_next_result = false;
        self.statements.clear();
    }

    /// Whether the socket is still believed usable.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Ready | ConnectionState::InResult)
    }

    // Prepared statements

    pub fn register_statement(&mut self, statement: PreparedStatement) {
        self.statements.insert(statement.statement_id, statement);
    }

    pub fn statement(&self, id: u32) -> Result<&PreparedStatement> {
        self.statements.get(&id).ok_or_else(|| unknown_statement(id))
    }

    pub fn forget_statement(&mut self, id: u32) -> Result<PreparedStatement> {
        self.statements.remove(&id).ok_or_else(|| unknown_statement(id))
    }

    /// Ids of every open statement, in ascending order.
    pub fn statement_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.statements.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The server dropped all session state for COM_CHANGE_USER.
    pub fn after_change_user(
        &mut self,
        outcome: &AuthOutcome,
        user: &str,
        database: Option<String>,
        collation: u16,
    ) {
        self.statements.clear();
        self.plugin.clone_from(&outcome.plugin);
        self.user = user.to_string();
        self.database = database;
        self.collation = collation;
        self.record_ok(&outcome.ok);
    }

    /// The server dropped statements and transaction state for
    /// COM_RESET_CONNECTION.
    pub fn after_reset(&mut self, ok: &OkPacket) {
        self.statements.clear();
        self.record_ok(ok);
    }

    pub fn set_database(&mut self, database: Option<String>) {
        self.database = database;
    }

    pub fn set_collation(&mut self, collation: u16) {
        self.collation = collation;
    }

    // Accessors

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn collation(&self) -> u16 {
        self.collation
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn unread_result(&self) -> bool {
        self.unread_result
    }

    pub fn have_next_result(&self) -> bool {
        self.have_next_result
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.server_version.as_ref()
    }

    pub fn server_version_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.server_version
            .as_ref()
            .is_some_and(|v| v.at_least(major, minor, patch))
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Scramble from the greeting, reused by COM_CHANGE_USER.
    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    pub fn server_plugin(&self) -> &str {
        &self.server_plugin
    }

    /// Plugin that completed the last authentication.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// TLS or a local socket protects the channel.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }
}

fn unknown_statement(id: u32) -> Error {
    Error::usage(
        UsageErrorKind::UnknownStatement,
        format!("prepared statement {id} is not open on this connection"),
    )
}

/// Validate a savepoint name so it can be spliced into SQL.
///
/// A name must not be empty, must be at most 64 characters, must start with a
/// letter or underscore, and may contain only letters, digits, underscores or
/// dollar signs.
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    let invalid = |message: String| Error::usage(UsageErrorKind::InvalidArgument, message);
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("Savepoint name cannot be empty".into()));
    };
    if name.len() > 64 {
        return Err(invalid(
            "Savepoint name exceeds maximum length of 64 characters".into(),
        ));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(
            "Savepoint name must start with a letter or underscore".into(),
        ));
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$') {
        return Err(invalid(format!(
            "Savepoint name contains invalid character: '{c}'"
        )));
    }
    Ok(())
}
