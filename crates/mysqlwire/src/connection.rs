//! Blocking MySQL connection.
//!
//! [`MySqlConnection`] drives the protocol exchanges over any [`BlockingIo`]
//! socket. Rows are streamed: a [`ResultSet`] borrows the connection and
//! decodes one row packet per `next()`. Until the rows (and any further
//! results of a multi-statement query) are read, every other command fails
//! with a usage error before anything is written.
//!
//! # Example
//!
//! ```rust,ignore
//! use mysqlwire::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("test");
//! let mut conn = MySqlConnection::connect(config)?;
//! for row in conn.query("SELECT id, name FROM users")? {
//!     let row = row?;
//!     println!("{:?}", row.get(0));
//! }
//! conn.close()?;
//! ```

use std::time::Duration;

use tracing::{debug, warn};

use crate::auth::{AuthSettings, Authenticator};
use crate::command::{
    NoReplyCommand, PrepareCommand, QueryCommand, SimpleCommand, Statement, StatisticsCommand,
    command_packet,
};
use crate::config::MySqlConfig;
use crate::exchange::Exchange;
use crate::protocol::prepared::{build_stmt_close, build_stmt_reset, build_stmt_send_long_data};
use crate::protocol::{Command, PreparedStatement, ServerVersion, capabilities, charset};
use crate::resultset::StatementResult;
use crate::session::{ConnectionState, Session, validate_savepoint_name};
use crate::transport::{BlockingIo, NetStream, PacketStream};
use crate::types::ColumnDef;
use mysqlwire_core::{Error, Result, Row, UsageErrorKind, Value};

/// A blocking connection to a MySQL server.
pub struct MySqlConnection<S: BlockingIo = NetStream> {
    stream: PacketStream<S>,
    session: Session,
    config: MySqlConfig,
}

impl<S: BlockingIo> std::fmt::Debug for MySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.session.state())
            .field("connection_id", &self.session.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.session.database())
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<NetStream> {
    /// Open a TCP or Unix socket connection and authenticate.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        let io = NetStream::connect(&config)?;
        Self::connect_with(io, config)
    }

    /// Replace a lost socket with a fresh connection, retrying up to
    /// `attempts` times with `delay` between tries.
    #[allow(clippy::result_large_err)]
    pub fn reconnect(&mut self, attempts: u32, delay: Duration) -> Result<()> {
        self.reconnect_with(attempts, delay, NetStream::connect)
    }
}

impl<S: BlockingIo> MySqlConnection<S> {
    /// Authenticate over an already open socket.
    ///
    /// Performs the handshake (with a TLS upgrade when negotiated), enables
    /// compression when both sides agreed on it, selects the database when
    /// the server could not take it in the handshake, and issues `SET NAMES`
    /// for collations that do not fit the one-byte handshake field.
    #[allow(clippy::result_large_err)]
    pub fn connect_with(io: S, config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        let local = io.is_local();
        let mut stream = PacketStream::new(io);
        let settings = AuthSettings::from_config(&config);
        let outcome = match stream.run(Authenticator::connect(settings, local), &config) {
            Ok(outcome) => outcome,
            Err(e) => {
                stream.shutdown();
                return Err(e);
            }
        };

        if outcome.capabilities & capabilities::CLIENT_COMPRESS != 0 {
            stream.enable_compression();
        }

        let mut session = Session::new();
        let database = if outcome.init_database.is_some() {
            None
        } else {
            config.database.clone()
        };
        session.establish(&outcome, &config.user, database, config.collation, local);

        let mut conn = Self {
            stream,
            session,
            config,
        };
        if let Some(database) = &outcome.init_database {
            conn.select_database(database)?;
        }
        if conn.config.collation > 255 {
            conn.apply_collation(conn.config.collation)?;
        }

        debug!(
            host = %conn.config.host,
            port = conn.config.port,
            server_version = %conn.session.server_version().map(ToString::to_string).unwrap_or_default(),
            connection_id = conn.session.connection_id(),
            tls = outcome.tls,
            "Connected to MySQL server"
        );
        Ok(conn)
    }

    /// Reconnect using `open` to create each new socket.
    ///
    /// Only transport errors are retried. Authentication, server or
    /// configuration errors are returned at once since another attempt would
    /// fail the same way. State of the old session (prepared statements,
    /// transactions, pending results) is gone afterwards.
    #[allow(clippy::result_large_err)]
    pub fn reconnect_with<F>(&mut self, attempts: u32, delay: Duration, mut open: F) -> Result<()>
    where
        F: FnMut(&MySqlConfig) -> Result<S>,
    {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            debug!(attempt, attempts, host = %self.config.host, "Reconnecting to MySQL server");
            match open(&self.config).and_then(|io| Self::connect_with(io, self.config.clone())) {
                Ok(fresh) => {
                    let mut old = std::mem::replace(self, fresh);
                    old.stream.shutdown();
                    return Ok(());
                }
                Err(e @ Error::Transport(_)) => {
                    last_error = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::protocol("reconnect made no attempt")))
    }

    // === Command plumbing ===

    /// Run one command exchange from sequence 0.
    fn exchange<E: Exchange>(&mut self, exchange: E) -> Result<E::Output> {
        self.stream.reset_sequence();
        let result = self.stream.run(exchange, &self.config);
        result.map_err(|e| self.failed(e))
    }

    fn failed(&mut self, error: Error) -> Error {
        if self.session.fail(&error) {
            debug!(error = %error, "Dropping connection after fatal error");
            self.stream.shutdown();
        }
        error
    }

    /// Fail unless a command may be sent, draining first when configured to.
    fn ready(&mut self) -> Result<()> {
        if self.config.consume_results
            && self.session.is_open()
            && (self.session.unread_result() || self.session.have_next_result())
        {
            warn!("Discarding unread result before the next command");
            self.consume_results()?;
        }
        self.session.check_ready()
    }

    fn start(&mut self, statement: Statement<'_>, params: &[Value]) -> Result<()> {
        self.ready()?;
        if let Statement::Prepared(prepared) = statement {
            self.session.statement(prepared.statement_id)?;
        }
        let encoded = statement.encode(params, self.session.capabilities())?;
        self.session.begin_command(encoded.format);
        let command = QueryCommand::new(
            encoded.packet,
            Some(encoded.sql),
            self.session.capabilities(),
            self.config.local_infile.clone(),
        );
        let response = self.exchange(command)?;
        self.session.apply_response(response);
        Ok(())
    }

    /// Read the next row of the current result.
    fn read_row(&mut self) -> Result<Option<Row>> {
        if !self.session.unread_result() {
            return Ok(None);
        }
        let payload = match self.stream.receive() {
            Ok(payload) => payload,
            Err(e) => return Err(self.failed(e)),
        };
        let decoded = self.session.decode_row(&payload);
        decoded.map_err(|e| self.failed(e))
    }

    /// Read the rest of the current result into memory.
    fn buffer_result(&mut self) -> Result<StatementResult> {
        let columns = self.session.result_columns().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = self.read_row()? {
            rows.push(row);
        }
        Ok(StatementResult {
            columns,
            rows,
            affected_rows: self.session.affected_rows(),
            last_insert_id: self.session.last_insert_id(),
            warnings: self.session.warnings(),
            info: self.session.info().to_string(),
            status_flags: self.session.status_flags(),
        })
    }

    /// Start reading the pending next result of a multi-result response.
    fn advance_result(&mut self) -> Result<()> {
        self.session.start_next_result()?;
        let command =
            QueryCommand::next_result(self.session.capabilities(), self.config.local_infile.clone());
        let response = self.stream.run(command, &self.config);
        let response = response.map_err(|e| self.failed(e))?;
        self.session.apply_response(response);
        Ok(())
    }

    fn execute_sql(&mut self, sql: &str) -> Result<u64> {
        self.start(Statement::Text(sql), &[])?;
        while self.read_row()?.is_some() {}
        Ok(self.session.affected_rows())
    }

    fn apply_collation(&mut self, collation: u16) -> Result<()> {
        let (charset_name, collation_name) = charset::collation_info(collation)
            .ok_or_else(|| Error::config(format!("unknown collation id {collation}")))?;
        self.execute_sql(&format!("SET NAMES {charset_name} COLLATE {collation_name}"))?;
        self.session.set_collation(collation);
        Ok(())
    }

    // === Queries ===

    /// Run SQL text and stream its rows.
    #[allow(clippy::result_large_err)]
    pub fn query(&mut self, sql: &str) -> Result<ResultSet<'_, S>> {
        self.query_with(sql, &[])
    }

    /// Run SQL text with `?` placeholders filled in from `params`.
    #[allow(clippy::result_large_err)]
    pub fn query_with(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet<'_, S>> {
        self.start(Statement::Text(sql), params)?;
        Ok(ResultSet::new(self))
    }

    /// Run a query and collect all rows.
    #[allow(clippy::result_large_err)]
    pub fn query_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_with(sql, params)?.collect()
    }

    /// Run a query and return its first row. Remaining rows are read and
    /// discarded.
    #[allow(clippy::result_large_err)]
    pub fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let mut rows = self.query_with(sql, params)?;
        let first = rows.next().transpose()?;
        for row in rows {
            row?;
        }
        Ok(first)
    }

    /// Execute SQL text or a prepared statement and buffer its first result.
    ///
    /// Further results of a multi-statement query stay pending; read them
    /// with [`next_result`](Self::next_result) or drop them with
    /// [`consume_results`](Self::consume_results).
    #[allow(clippy::result_large_err)]
    pub fn execute<'a>(
        &mut self,
        statement: impl Into<Statement<'a>>,
        params: &[Value],
    ) -> Result<StatementResult> {
        self.start(statement.into(), params)?;
        self.buffer_result()
    }

    /// Run a multi-statement query and iterate over each of its results.
    #[allow(clippy::result_large_err)]
    pub fn query_multi(&mut self, sql: &str) -> Result<MultiResults<'_, S>> {
        self.start(Statement::Text(sql), &[])?;
        Ok(MultiResults {
            conn: self,
            started: false,
            done: false,
        })
    }

    /// Move to the next result of a multi-result response.
    ///
    /// Returns `None` when no further results exist. The rows of the current
    /// result must have been read first.
    #[allow(clippy::result_large_err)]
    pub fn next_result(&mut self) -> Result<Option<ResultSet<'_, S>>> {
        if !self.session.unread_result() && !self.session.have_next_result() {
            return Ok(None);
        }
        self.advance_result()?;
        Ok(Some(ResultSet::new(self)))
    }

    /// Read and discard the rest of the current result and every pending
    /// result after it.
    ///
    /// Row values that fail to decode are skipped; only errors that end the
    /// response stop the drain.
    #[allow(clippy::result_large_err)]
    pub fn consume_results(&mut self) -> Result<()> {
        loop {
            loop {
                match self.read_row() {
                    Ok(Some(_)) | Err(Error::Data(_)) => {}
                    Ok(None) => break,
                    Err(e) => return Err(e),
                }
            }
            if !self.session.have_next_result() {
                return Ok(());
            }
            self.advance_result()?;
        }
    }

    // === Prepared statements ===

    /// Prepare a statement on the server.
    #[allow(clippy::result_large_err)]
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.ready()?;
        let statement = self.exchange(PrepareCommand::new(sql, self.session.capabilities()))?;
        self.session.register_statement(statement.clone());
        Ok(statement)
    }

    /// Execute a prepared statement and stream its binary rows.
    #[allow(clippy::result_large_err)]
    pub fn execute_prepared(
        &mut self,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet<'_, S>> {
        self.start(Statement::Prepared(statement), params)?;
        Ok(ResultSet::new(self))
    }

    /// Deallocate a prepared statement. The server sends no reply.
    #[allow(clippy::result_large_err)]
    pub fn close_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        self.ready()?;
        self.session.forget_statement(statement.statement_id)?;
        self.exchange(NoReplyCommand::new(build_stmt_close(statement.statement_id)))?;
        debug!(statement_id = statement.statement_id, "Closed prepared statement");
        Ok(())
    }

    /// Reset a prepared statement, discarding long data sent for it.
    #[allow(clippy::result_large_err)]
    pub fn reset_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        self.ready()?;
        self.session.statement(statement.statement_id)?;
        self.exchange(SimpleCommand::new(build_stmt_reset(statement.statement_id)))?;
        Ok(())
    }

    /// Send parameter data in pieces before executing. Calls for the same
    /// parameter append to each other.
    #[allow(clippy::result_large_err)]
    pub fn send_long_data(
        &mut self,
        statement: &PreparedStatement,
        param_index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.ready()?;
        let registered = self.session.statement(statement.statement_id)?;
        if usize::from(param_index) >= registered.param_count() {
            return Err(Error::usage(
                UsageErrorKind::ParameterCount,
                format!(
                    "parameter {param_index} out of range for a statement with {} parameters",
                    registered.param_count()
                ),
            ));
        }
        let packet = build_stmt_send_long_data(statement.statement_id, param_index, data);
        self.exchange(NoReplyCommand::new(packet))
    }

    // === Server commands ===

    /// COM_PING.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.ready()?;
        self.exchange(SimpleCommand::new(command_packet(Command::Ping, &[])))?;
        Ok(())
    }

    /// Whether the connection answers a ping. Never raises.
    pub fn is_healthy(&mut self) -> bool {
        self.session.check_ready().is_ok() && self.ping().is_ok()
    }

    /// The server status line from COM_STATISTICS.
    #[allow(clippy::result_large_err)]
    pub fn statistics(&mut self) -> Result<String> {
        self.ready()?;
        self.exchange(StatisticsCommand::default())
    }

    /// COM_REFRESH with a combination of [`crate::protocol::refresh`] bits.
    #[allow(clippy::result_large_err)]
    pub fn refresh(&mut self, options: u8) -> Result<()> {
        self.ready()?;
        self.exchange(SimpleCommand::new(command_packet(Command::Refresh, &[options])))?;
        Ok(())
    }

    /// Kill the connection (thread) with the given id.
    #[allow(clippy::result_large_err)]
    pub fn kill(&mut self, connection_id: u32) -> Result<()> {
        self.execute_sql(&format!("KILL {connection_id}"))?;
        Ok(())
    }

    /// COM_RESET_CONNECTION: drops prepared statements, temporary tables,
    /// user variables and any open transaction without re-authenticating.
    #[allow(clippy::result_large_err)]
    pub fn reset(&mut self) -> Result<()> {
        self.ready()?;
        let ok = self.exchange(SimpleCommand::new(command_packet(
            Command::ResetConnection,
            &[],
        )))?;
        self.session.after_reset(&ok);
        if self.session.collation() > 255 {
            self.apply_collation(self.session.collation())?;
        }
        Ok(())
    }

    /// Re-authenticate as another user on the open socket.
    ///
    /// The server resets the session: prepared statements, the database and
    /// the character set. A failed change closes the connection.
    #[allow(clippy::result_large_err)]
    pub fn change_user(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        self.ready()?;
        let mut config = self.config.clone();
        config.user = user.to_string();
        config.password = password.map(str::to_string);
        config.extra_factors.clear();
        config.database = database.map(str::to_string);

        let authenticator = Authenticator::change_user(
            AuthSettings::from_config(&config),
            self.session.capabilities(),
            self.session.seed().to_vec(),
            self.session.server_plugin(),
            self.session.is_secure(),
        );
        self.stream.reset_sequence();
        let outcome = match self.stream.run(authenticator, &config) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.session.mark_broken();
                self.stream.shutdown();
                return Err(e);
            }
        };
        self.session
            .after_change_user(&outcome, user, config.database.clone(), config.collation);
        self.config = config;
        if self.config.collation > 255 {
            self.apply_collation(self.config.collation)?;
        }
        debug!(user, plugin = %outcome.plugin, "Changed user");
        Ok(())
    }

    /// COM_INIT_DB.
    #[allow(clippy::result_large_err)]
    pub fn select_database(&mut self, database: &str) -> Result<()> {
        self.ready()?;
        self.exchange(SimpleCommand::new(command_packet(
            Command::InitDb,
            database.as_bytes(),
        )))?;
        self.session.set_database(Some(database.to_string()));
        Ok(())
    }

    // === Transactions ===

    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self) -> Result<()> {
        self.execute_sql("BEGIN").map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self) -> Result<()> {
        self.execute_sql("COMMIT").map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self) -> Result<()> {
        self.execute_sql("ROLLBACK").map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.execute_sql(sql).map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute_sql(&format!("SAVEPOINT {name}")).map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute_sql(&format!("RELEASE SAVEPOINT {name}")).map(drop)
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute_sql(&format!("ROLLBACK TO SAVEPOINT {name}")).map(drop)
    }

    /// Whether the server reported an open transaction in the last status.
    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    // === Lifecycle ===

    /// Change the socket read timeout.
    #[allow(clippy::result_large_err)]
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.get_mut().set_read_timeout(timeout)?;
        self.config.read_timeout = timeout;
        Ok(())
    }

    /// Close prepared statements, send COM_QUIT and shut the socket down.
    ///
    /// The socket is shut down even when one of the goodbye commands fails.
    #[allow(clippy::result_large_err)]
    pub fn close(mut self) -> Result<()> {
        let result = if self.session.is_open() {
            self.say_goodbye()
        } else {
            Ok(())
        };
        self.session.mark_closed();
        self.stream.shutdown();
        result
    }

    fn say_goodbye(&mut self) -> Result<()> {
        self.consume_results()?;
        for id in self.session.statement_ids() {
            self.session.forget_statement(id)?;
            self.exchange(NoReplyCommand::new(build_stmt_close(id)))?;
            debug!(statement_id = id, "Closed prepared statement");
        }
        self.exchange(NoReplyCommand::new(command_packet(Command::Quit, &[])))
    }

    // === Accessors ===

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn connection_id(&self) -> u32 {
        self.session.connection_id()
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.session.server_version()
    }

    pub fn server_version_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.session.server_version_at_least(major, minor, patch)
    }

    pub fn affected_rows(&self) -> u64 {
        self.session.affected_rows()
    }

    pub fn last_insert_id(&self) -> u64 {
        self.session.last_insert_id()
    }

    pub fn warnings(&self) -> u16 {
        self.session.warnings()
    }

    pub fn info(&self) -> &str {
        self.session.info()
    }

    pub fn database(&self) -> Option<&str> {
        self.session.database()
    }

    pub fn is_compressed(&self) -> bool {
        self.stream.is_compressed()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }
}

/// Rows of one result, decoded as they are pulled.
///
/// Dropping a partly read result leaves the rest on the wire: the next
/// command fails until the rows are drained with
/// [`MySqlConnection::consume_results`] (or automatically, when the
/// configuration enables `consume_results`).
pub struct ResultSet<'a, S: BlockingIo> {
    conn: &'a mut MySqlConnection<S>,
    columns: Vec<ColumnDef>,
}

impl<S: BlockingIo> std::fmt::Debug for ResultSet<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.columns.len())
            .field("pending", &self.conn.session.unread_result())
            .finish()
    }
}

impl<'a, S: BlockingIo> ResultSet<'a, S> {
    fn new(conn: &'a mut MySqlConnection<S>) -> Self {
        let columns = conn.session.result_columns().to_vec();
        Self { conn, columns }
    }

    /// Column definitions; empty for statements without a result set.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Whether rows are still waiting to be read.
    pub fn is_pending(&self) -> bool {
        self.conn.session.unread_result()
    }

    /// Affected rows of the statement (meaningful once the rows are read).
    pub fn affected_rows(&self) -> u64 {
        self.conn.session.affected_rows()
    }

    pub fn last_insert_id(&self) -> u64 {
        self.conn.session.last_insert_id()
    }

    pub fn warnings(&self) -> u16 {
        self.conn.session.warnings()
    }

    /// Read the remaining rows into a [`StatementResult`].
    #[allow(clippy::result_large_err)]
    pub fn into_result(self) -> Result<StatementResult> {
        self.conn.buffer_result()
    }
}

impl<S: BlockingIo> Iterator for ResultSet<'_, S> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.conn.read_row().transpose()
    }
}

/// Iterator over every result of a multi-statement query, each buffered.
///
/// Results are read lazily and in order; the iterator ends after the last
/// result or after the first error.
pub struct MultiResults<'a, S: BlockingIo> {
    conn: &'a mut MySqlConnection<S>,
    started: bool,
    done: bool,
}

impl<S: BlockingIo> std::fmt::Debug for MultiResults<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResults")
            .field("started", &self.started)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<S: BlockingIo> Iterator for MultiResults<'_, S> {
    type Item = Result<StatementResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.started {
            if !self.conn.session.have_next_result() {
                self.done = true;
                return None;
            }
            if let Err(e) = self.conn.advance_result() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.started = true;
        let result = self.conn.buffer_result();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server_status::{SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT};
    use crate::transport::mock::{MockHandle, MockStream, Script, column_payload};
    use crate::types::{FieldType, column_flags};
    use mysqlwire_core::TransportErrorKind;

    const MORE: u16 = SERVER_MORE_RESULTS_EXISTS | SERVER_STATUS_AUTOCOMMIT;

    fn config() -> MySqlConfig {
        MySqlConfig::new().user("root")
    }

    /// Log in over a mock whose remaining packets are `after_login`, with the
    /// login traffic cleared from the capture.
    fn connect(after_login: Script) -> (MySqlConnection<MockStream>, MockHandle) {
        let mut bytes = Script::new().login().into_bytes();
        bytes.extend(after_login.into_bytes());
        let stream = MockStream::new(bytes);
        let handle = stream.handle();
        let conn = MySqlConnection::connect_with(stream, config()).unwrap();
        handle.clear_written();
        (conn, handle)
    }

    #[test]
    fn test_connect_over_mock() {
        let (conn, _) = connect(Script::new());
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.connection_id(), 42);
        assert!(conn.server_version_at_least(8, 0, 0));
        assert!(!conn.is_compressed());
        assert!(!conn.session().is_secure());
    }

    #[test]
    fn test_simple_query_rows() {
        let script = Script::new()
            .at(1)
            .result_set(&["id", "name"], &[&[Some("1"), Some("ann")], &[Some("2"), None]], 2);
        let (mut conn, handle) = connect(script);

        let mut rows = conn.query("SELECT id, name FROM users").unwrap();
        assert_eq!(rows.column_names(), vec!["id", "name"]);
        let first = rows.next().unwrap().unwrap();
        assert_eq!(first.get(1), Some(&Value::Text("ann".into())));
        let second = rows.next().unwrap().unwrap();
        assert_eq!(second.get(1), Some(&Value::Null));
        assert!(rows.next().is_none());
        assert!(!rows.is_pending());

        let packets = handle.written_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, 0);
        assert_eq!(packets[0].1[0], Command::Query as u8);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_unread_result_blocks_without_sending() {
        let script = Script::new()
            .at(1)
            .result_set(&["n"], &[&[Some("1")], &[Some("2")]], 2);
        let (mut conn, handle) = connect(script);

        {
            let mut rows = conn.query("SELECT n FROM t").unwrap();
            rows.next().unwrap().unwrap();
        }
        handle.clear_written();

        let err = conn.ping().unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::UnreadResult));
        assert!(conn.execute("SELECT 1", &[]).is_err());
        assert!(handle.written().is_empty());

        conn.consume_results().unwrap();
        handle.push(Script::new().at(1).ok().into_bytes());
        conn.ping().unwrap();
        assert_eq!(handle.written_packets(), vec![(0, vec![Command::Ping as u8])]);
    }

    #[test]
    fn test_consume_results_option_drains_automatically() {
        let script = Script::new()
            .at(1)
            .result_set(&["n"], &[&[Some("1")], &[Some("2")]], 2)
            .at(1)
            .ok();
        let mut bytes = Script::new().login().into_bytes();
        bytes.extend(script.into_bytes());
        let mut conn =
            MySqlConnection::connect_with(MockStream::new(bytes), config().consume_results(true))
                .unwrap();

        drop(conn.query("SELECT n FROM t").unwrap());
        conn.ping().unwrap();
    }

    #[test]
    fn test_multi_result_iteration() {
        let script = Script::new()
            .at(1)
            .result_set(&["a"], &[&[Some("1")]], MORE)
            .result_set(&["b"], &[&[Some("2")], &[Some("3")]], MORE)
            .ok_with(4, 0, 2);
        let (mut conn, _) = connect(script);

        let results: Vec<StatementResult> = conn
            .query_multi("SELECT 1; SELECT 2; UPDATE t SET x = 1")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].rows.len(), 1);
        assert_eq!(results[1].columns[0].name, "b");
        assert_eq!(results[1].rows.len(), 2);
        assert!(!results[2].has_rows());
        assert_eq!(results[2].affected_rows, 4);
        assert!(conn.session().check_ready().is_ok());
    }

    #[test]
    fn test_next_result_streaming() {
        let script = Script::new()
            .at(1)
            .result_set(&["a"], &[&[Some("1")]], MORE)
            .result_set(&["b"], &[&[Some("2")]], 2);
        let (mut conn, _) = connect(script);

        let first = conn.execute("SELECT 1; SELECT 2", &[]).unwrap();
        assert_eq!(first.rows.len(), 1);
        assert!(conn.session().have_next_result());
        assert!(conn.ping().is_err());

        let rows: Vec<Row> = conn
            .next_result()
            .unwrap()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::Text("2".into())));
        assert!(conn.next_result().unwrap().is_none());
    }

    #[test]
    fn test_server_error_carries_sql() {
        let script = Script::new()
            .at(1)
            .err(1146, "42S02", "Table 'test.nope' doesn't exist");
        let (mut conn, _) = connect(script);

        let err = conn.execute("SELECT * FROM nope", &[]).unwrap_err();
        match err {
            Error::Server(server) => {
                assert_eq!(server.code, 1146);
                assert_eq!(server.sql.as_deref(), Some("SELECT * FROM nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_local_infile_refused_by_default() {
        let mut request = vec![0xFB];
        request.extend_from_slice(b"/etc/passwd");
        let script = Script::new()
            .at(1)
            .packet(&request)
            .at(3)
            .err(1148, "42000", "The used command is not allowed with this MySQL version");
        let (mut conn, handle) = connect(script);

        let err = conn
            .execute("LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t", &[])
            .unwrap_err();
        assert_eq!(err.server_code(), Some(1148));

        let packets = handle.written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1], (2, Vec::new()));
        assert!(conn.session().is_open());
    }

    #[test]
    fn test_unknown_column_type_breaks_session() {
        let mut column = column_payload(&ColumnDef::new("weird", FieldType::VarString));
        let type_at = column.len() - 6;
        column[type_at] = 0x42;
        let script = Script::new().at(1).packet(&[0x01]).packet(&column).eof();
        let (mut conn, handle) = connect(script);

        let err = conn.query_all("SELECT weird FROM t", &[]).unwrap_err();
        assert!(matches!(&err, Error::Protocol(_)));
        assert!(err.to_string().contains("unknown column type 0x42"));
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_lost_connection_breaks_session() {
        let (mut conn, handle) = connect(Script::new());
        let err = conn.ping().unwrap_err();
        assert!(matches!(
            &err,
            Error::Transport(t) if t.kind == TransportErrorKind::Disconnected
        ));
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(handle.is_shutdown());
        assert_eq!(
            conn.ping().unwrap_err().usage_kind(),
            Some(UsageErrorKind::Closed)
        );
        assert!(!conn.is_healthy());
    }

    #[test]
    fn test_reconnect_with_fresh_socket() {
        let (mut conn, _) = connect(Script::new());
        assert!(conn.ping().is_err());

        let mut opened = 0;
        conn.reconnect_with(3, Duration::ZERO, |_| {
            opened += 1;
            if opened == 1 {
                Err(Error::transport(TransportErrorKind::Refused, "refused"))
            } else {
                Ok(Script::new().login().at(1).ok().stream())
            }
        })
        .unwrap();
        assert_eq!(opened, 2);
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn.ping().unwrap();
    }

    #[test]
    fn test_reconnect_stops_on_non_transport_error() {
        let (mut conn, _) = connect(Script::new());
        let mut opened = 0;
        let err = conn
            .reconnect_with(5, Duration::ZERO, |_| {
                opened += 1;
                Ok(Script::new()
                    .greeting()
                    .at(2)
                    .err(1045, "28000", "Access denied for user 'root'")
                    .stream())
            })
            .unwrap_err();
        assert_eq!(opened, 1);
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_prepared_statement_lifecycle() {
        let param = ColumnDef::new("?", FieldType::LongLong);
        let column = ColumnDef::new("id", FieldType::Long).with_flags(column_flags::UNSIGNED);
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&5u32.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);

        let mut binary_row = vec![0x00, 0x00];
        binary_row.extend_from_slice(&7u32.to_le_bytes());

        // a prepare response has no column-count packets, only definitions and EOFs
        let script = Script::new()
            .at(1)
            .packet(&prepare_ok)
            .packet(&column_payload(&param))
            .eof()
            .packet(&column_payload(&column))
            .eof()
            .at(1)
            .columns(&[column])
            .packet(&binary_row)
            .eof();
        let (mut conn, handle) = connect(script);

        let statement = conn.prepare("SELECT id FROM t WHERE id = ?").unwrap();
        assert_eq!(statement.statement_id, 5);
        assert_eq!(statement.param_count(), 1);

        assert!(conn.execute_prepared(&statement, &[]).is_err());
        let rows: Vec<Row> = conn
            .execute_prepared(&statement, &[Value::BigInt(7)])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(7)));

        assert!(conn.send_long_data(&statement, 3, b"x").is_err());
        handle.clear_written();
        conn.close_statement(&statement).unwrap();
        let packets = handle.written_packets();
        assert_eq!(packets[0].1[0], Command::StmtClose as u8);
        assert_eq!(
            conn.close_statement(&statement).unwrap_err().usage_kind(),
            Some(UsageErrorKind::UnknownStatement)
        );
    }

    #[test]
    fn test_transactions_and_savepoints() {
        let in_trans = crate::protocol::server_status::SERVER_STATUS_IN_TRANS | 2;
        let script = Script::new()
            .at(1)
            .ok_with(0, 0, in_trans)
            .at(1)
            .ok_with(0, 0, in_trans)
            .at(1)
            .ok();
        let (mut conn, handle) = connect(script);

        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.savepoint("sp_1").unwrap();
        assert!(conn.savepoint("1bad").is_err());
        assert_eq!(handle.written_packets().len(), 2);
        conn.commit().unwrap();
        assert!(!conn.in_transaction());

        let sent: Vec<String> = handle
            .written_packets()
            .into_iter()
            .map(|(_, p)| String::from_utf8_lossy(&p[1..]).into_owned())
            .collect();
        assert_eq!(sent, vec!["BEGIN", "SAVEPOINT sp_1", "COMMIT"]);
    }

    #[test]
    fn test_reset_drops_statements() {
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&1u32.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
        let script = Script::new().at(1).packet(&prepare_ok).at(1).ok();
        let (mut conn, handle) = connect(script);

        let statement = conn.prepare("DO 1").unwrap();
        conn.reset().unwrap();
        assert!(conn.session().statement_ids().is_empty());
        assert!(conn.execute_prepared(&statement, &[]).is_err());
        assert_eq!(
            handle.written_packets()[1],
            (0, vec![Command::ResetConnection as u8])
        );
    }

    #[test]
    fn test_server_commands() {
        let script = Script::new()
            .at(1)
            .packet(b"Uptime: 10  Threads: 1")
            .at(1)
            .ok()
            .at(1)
            .ok()
            .at(1)
            .ok();
        let (mut conn, handle) = connect(script);

        assert_eq!(conn.statistics().unwrap(), "Uptime: 10  Threads: 1");
        conn.select_database("shop").unwrap();
        assert_eq!(conn.database(), Some("shop"));
        conn.refresh(crate::protocol::refresh::TABLES).unwrap();
        conn.kill(17).unwrap();

        let packets = handle.written_packets();
        assert_eq!(packets[0].1, vec![Command::Statistics as u8]);
        assert_eq!(packets[1].1[0], Command::InitDb as u8);
        assert_eq!(packets[2].1, vec![Command::Refresh as u8, 4]);
        assert_eq!(&packets[3].1[1..], b"KILL 17");
    }

    #[test]
    fn test_change_user() {
        let (mut conn, handle) = connect(Script::new().at(1).ok());
        conn.change_user("app", Some("secret"), Some("shop")).unwrap();
        assert_eq!(conn.session().user(), "app");
        assert_eq!(conn.database(), Some("shop"));
        assert_eq!(handle.written_packets()[0].1[0], Command::ChangeUser as u8);
    }

    #[test]
    fn test_failed_change_user_closes() {
        let (mut conn, handle) = connect(Script::new().at(1).err(1045, "28000", "Access denied"));
        assert!(conn.change_user("app", None, None).is_err());
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_close_sends_quit() {
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&3u32.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
        let (mut conn, handle) = connect(Script::new().at(1).packet(&prepare_ok));

        conn.prepare("DO 1").unwrap();
        handle.clear_written();
        conn.close().unwrap();

        let packets = handle.written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].1, vec![Command::StmtClose as u8, 3, 0, 0, 0]);
        assert_eq!(packets[1].1, vec![Command::Quit as u8]);
        assert!(handle.is_shutdown());
    }
}
