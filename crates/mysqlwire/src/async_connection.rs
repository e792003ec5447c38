//! Async MySQL connection on asupersync.
//!
//! The protocol work is the same as in [`crate::connection`]: the
//! handshake, command and result exchanges from [`crate::auth`] and
//! [`crate::command`] are run by an [`AsyncPacketStream`], and the shared
//! [`Session`] decides what may be sent. Every operation takes a `&Cx` and
//! returns an [`Outcome`].
//!
//! # Cancellation
//!
//! The context is checked before I/O starts. An operation abandoned while
//! its exchange was on the wire leaves the connection marked in flight; the
//! next call notices, shuts the socket down and fails with an aborted
//! transport error. A cancellation seen while rows are still pending also
//! closes the socket, since the rest of the result can no longer be read.

use std::sync::Arc;

use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};
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
use crate::transport::{AsyncIo, AsyncNetStream, AsyncPacketStream};
use crate::types::ColumnDef;
use mysqlwire_core::{Error, Result, Row, TransportErrorKind, UsageErrorKind, Value};

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }
    };
}

fn lift<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

/// An async connection to a MySQL server.
pub struct MySqlAsyncConnection<S: AsyncIo = AsyncNetStream> {
    stream: AsyncPacketStream<S>,
    session: Session,
    config: MySqlConfig,
    /// Set while an exchange is on the wire; still set on the next call when
    /// the previous future was dropped half way
    in_flight: bool,
}

impl<S: AsyncIo> std::fmt::Debug for MySqlAsyncConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlAsyncConnection")
            .field("state", &self.session.state())
            .field("connection_id", &self.session.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl MySqlAsyncConnection<AsyncNetStream> {
    /// Open a TCP connection and authenticate.
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        try_outcome!(lift(config.validate()));
        let io = try_outcome!(lift(AsyncNetStream::connect(&config).await));
        Self::connect_with(cx, io, config).await
    }

    /// Replace the session with a fresh connection, retrying transport
    /// failures up to `attempts` times.
    pub async fn reconnect(&mut self, cx: &Cx, attempts: u32) -> Outcome<(), Error> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            debug!(attempt, attempts, host = %self.config.host, "Reconnecting to MySQL server");
            match Self::connect(cx, self.config.clone()).await {
                Outcome::Ok(fresh) => {
                    let mut old = std::mem::replace(self, fresh);
                    old.stream.shutdown();
                    return Outcome::Ok(());
                }
                Outcome::Err(e @ Error::Transport(_)) => last_error = Some(e),
                other => return other.map(|_| ()),
            }
        }
        Outcome::Err(last_error.unwrap_or_else(|| Error::protocol("reconnect made no attempt")))
    }
}

impl<S: AsyncIo> MySqlAsyncConnection<S> {
    /// Authenticate over an already open socket.
    pub async fn connect_with(cx: &Cx, io: S, config: MySqlConfig) -> Outcome<Self, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        try_outcome!(lift(config.validate()));
        let local = io.is_local();
        let mut stream = AsyncPacketStream::new(io);
        let settings = AuthSettings::from_config(&config);
        let outcome = match stream.run(Authenticator::connect(settings, local), &config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                stream.shutdown();
                return Outcome::Err(e);
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
            in_flight: false,
        };
        if let Some(database) = &outcome.init_database {
            try_outcome!(conn.select_database(cx, database).await);
        }
        if conn.config.collation > 255 {
            try_outcome!(conn.apply_collation(cx, conn.config.collation).await);
        }

        debug!(
            host = %conn.config.host,
            port = conn.config.port,
            server_version = %conn.session.server_version().map(ToString::to_string).unwrap_or_default(),
            connection_id = conn.session.connection_id(),
            tls = outcome.tls,
            "Connected to MySQL server"
        );
        Outcome::Ok(conn)
    }

    // === Command plumbing ===

    /// Tear the socket down if a previous operation was abandoned mid-exchange.
    fn check_abandoned(&mut self) -> Result<()> {
        if !self.in_flight {
            return Ok(());
        }
        warn!(
            connection_id = self.session.connection_id(),
            "Closing connection left in the middle of an exchange by a cancelled operation"
        );
        self.in_flight = false;
        self.session.mark_broken();
        self.stream.shutdown();
        Err(Error::transport(
            TransportErrorKind::Aborted,
            "a previous operation was cancelled mid-exchange; the connection was closed",
        ))
    }

    fn failed(&mut self, error: Error) -> Error {
        if self.session.fail(&error) {
            debug!(error = %error, "Dropping connection after fatal error");
            self.stream.shutdown();
        }
        error
    }

    async fn run<E>(&mut self, cx: &Cx, exchange: E, reset_sequence: bool) -> Outcome<E::Output, Error>
    where
        E: Exchange + Send,
    {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if reset_sequence {
            self.stream.reset_sequence();
        }
        self.in_flight = true;
        let result = self.stream.run(exchange, &self.config).await;
        self.in_flight = false;
        match result {
            Ok(output) => Outcome::Ok(output),
            Err(e) => Outcome::Err(self.failed(e)),
        }
    }

    /// Run one command exchange from sequence 0.
    async fn exchange<E>(&mut self, cx: &Cx, exchange: E) -> Outcome<E::Output, Error>
    where
        E: Exchange + Send,
    {
        self.run(cx, exchange, true).await
    }

    async fn ready(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(lift(self.check_abandoned()));
        if self.config.consume_results
            && self.session.is_open()
            && (self.session.unread_result() || self.session.have_next_result())
        {
            warn!("Discarding unread result before the next command");
            try_outcome!(self.consume_results(cx).await);
        }
        lift(self.session.check_ready())
    }

    async fn read_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        try_outcome!(lift(self.check_abandoned()));
        if !self.session.unread_result() {
            return Outcome::Ok(None);
        }
        if let Some(reason) = cx.cancel_reason() {
            warn!("Closing connection cancelled while rows were pending");
            self.session.mark_broken();
            self.stream.shutdown();
            return Outcome::Cancelled(reason);
        }
        self.in_flight = true;
        let received = self.stream.receive().await;
        self.in_flight = false;
        let payload = match received {
            Ok(payload) => payload,
            Err(e) => return Outcome::Err(self.failed(e)),
        };
        match self.session.decode_row(&payload) {
            Ok(row) => Outcome::Ok(row),
            Err(e) => Outcome::Err(self.failed(e)),
        }
    }

    async fn buffer_result(&mut self, cx: &Cx) -> Outcome<StatementResult, Error> {
        let columns = self.session.result_columns().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = try_outcome!(self.read_row(cx).await) {
            rows.push(row);
        }
        Outcome::Ok(StatementResult {
            columns,
            rows,
            affected_rows: self.session.affected_rows(),
            last_insert_id: self.session.last_insert_id(),
            warnings: self.session.warnings(),
            info: self.session.info().to_string(),
            status_flags: self.session.status_flags(),
        })
    }

    async fn advance_result(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(lift(self.session.start_next_result()));
        let command =
            QueryCommand::next_result(self.session.capabilities(), self.config.local_infile.clone());
        let response = try_outcome!(self.run(cx, command, false).await);
        self.session.apply_response(response);
        Outcome::Ok(())
    }

    async fn execute_sql(&mut self, cx: &Cx, sql: &str) -> Outcome<u64, Error> {
        try_outcome!(self.send_query(cx, Statement::Text(sql), &[]).await);
        while try_outcome!(self.read_row(cx).await).is_some() {}
        Outcome::Ok(self.session.affected_rows())
    }

    async fn apply_collation(&mut self, cx: &Cx, collation: u16) -> Outcome<(), Error> {
        let Some((charset_name, collation_name)) = charset::collation_info(collation) else {
            return Outcome::Err(Error::config(format!("unknown collation id {collation}")));
        };
        let sql = format!("SET NAMES {charset_name} COLLATE {collation_name}");
        try_outcome!(self.execute_sql(cx, &sql).await);
        self.session.set_collation(collation);
        Outcome::Ok(())
    }

    // === Queries ===

    /// Send a statement and read up to its first row.
    ///
    /// Pull the rows with [`next_row`](Self::next_row) and further results
    /// with [`next_result`](Self::next_result).
    pub async fn send_query(
        &mut self,
        cx: &Cx,
        statement: Statement<'_>,
        params: &[Value],
    ) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        if let Statement::Prepared(prepared) = statement {
            try_outcome!(lift(self.session.statement(prepared.statement_id).map(|_| ())));
        }
        let encoded = try_outcome!(lift(statement.encode(params, self.session.capabilities())));
        self.session.begin_command(encoded.format);
        let command = QueryCommand::new(
            encoded.packet,
            Some(encoded.sql),
            self.session.capabilities(),
            self.config.local_infile.clone(),
        );
        let response = try_outcome!(self.exchange(cx, command).await);
        self.session.apply_response(response);
        Outcome::Ok(())
    }

    /// Next row of the current result, `None` once it has ended.
    pub async fn next_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        self.read_row(cx).await
    }

    /// Columns of the result being read.
    pub fn columns(&self) -> &[ColumnDef] {
        self.session.result_columns()
    }

    /// Move to the next result of a multi-result response. Returns false
    /// when there is none.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        try_outcome!(lift(self.check_abandoned()));
        if !self.session.unread_result() && !self.session.have_next_result() {
            return Outcome::Ok(false);
        }
        try_outcome!(self.advance_result(cx).await);
        Outcome::Ok(true)
    }

    /// Run a query and collect its rows.
    pub async fn query(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        try_outcome!(self.send_query(cx, Statement::Text(sql), params).await);
        let mut rows = Vec::new();
        while let Some(row) = try_outcome!(self.read_row(cx).await) {
            rows.push(row);
        }
        Outcome::Ok(rows)
    }

    /// Run a query and return its first row.
    pub async fn query_one(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        let rows = try_outcome!(self.query(cx, sql, params).await);
        Outcome::Ok(rows.into_iter().next())
    }

    /// Execute SQL text or a prepared statement and buffer its first result.
    pub async fn execute(
        &mut self,
        cx: &Cx,
        statement: Statement<'_>,
        params: &[Value],
    ) -> Outcome<StatementResult, Error> {
        try_outcome!(self.send_query(cx, statement, params).await);
        self.buffer_result(cx).await
    }

    /// Execute a prepared statement and buffer its rows.
    pub async fn execute_prepared(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<StatementResult, Error> {
        self.execute(cx, Statement::Prepared(statement), params).await
    }

    /// Run a multi-statement query and buffer every result, in order.
    pub async fn query_multi(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<StatementResult>, Error> {
        try_outcome!(self.send_query(cx, Statement::Text(sql), &[]).await);
        let mut results = vec![try_outcome!(self.buffer_result(cx).await)];
        while self.session.have_next_result() {
            try_outcome!(self.advance_result(cx).await);
            results.push(try_outcome!(self.buffer_result(cx).await));
        }
        Outcome::Ok(results)
    }

    /// Read and discard all pending rows and results.
    pub async fn consume_results(&mut self, cx: &Cx) -> Outcome<(), Error> {
        loop {
            loop {
                match self.read_row(cx).await {
                    Outcome::Ok(Some(_)) | Outcome::Err(Error::Data(_)) => {}
                    Outcome::Ok(None) => break,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                    Outcome::Panicked(payload) => return Outcome::Panicked(payload),
                }
            }
            if !self.session.have_next_result() {
                return Outcome::Ok(());
            }
            try_outcome!(self.advance_result(cx).await);
        }
    }

    // === Prepared statements ===

    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        try_outcome!(self.ready(cx).await);
        let command = PrepareCommand::new(sql, self.session.capabilities());
        let statement = try_outcome!(self.exchange(cx, command).await);
        self.session.register_statement(statement.clone());
        Outcome::Ok(statement)
    }

    pub async fn close_statement(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
    ) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        try_outcome!(lift(self.session.forget_statement(statement.statement_id).map(|_| ())));
        let packet = build_stmt_close(statement.statement_id);
        try_outcome!(self.exchange(cx, NoReplyCommand::new(packet)).await);
        debug!(statement_id = statement.statement_id, "Closed prepared statement");
        Outcome::Ok(())
    }

    pub async fn reset_statement(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
    ) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        try_outcome!(lift(self.session.statement(statement.statement_id).map(|_| ())));
        let packet = build_stmt_reset(statement.statement_id);
        self.exchange(cx, SimpleCommand::new(packet)).await.map(|_| ())
    }

    pub async fn send_long_data(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        param_index: u16,
        data: &[u8],
    ) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        let count = try_outcome!(lift(
            self.session
                .statement(statement.statement_id)
                .map(PreparedStatement::param_count)
        ));
        if usize::from(param_index) >= count {
            return Outcome::Err(Error::usage(
                UsageErrorKind::ParameterCount,
                format!("parameter {param_index} out of range for a statement with {count} parameters"),
            ));
        }
        let packet = build_stmt_send_long_data(statement.statement_id, param_index, data);
        self.exchange(cx, NoReplyCommand::new(packet)).await
    }

    // === Server commands ===

    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        let packet = command_packet(Command::Ping, &[]);
        self.exchange(cx, SimpleCommand::new(packet)).await.map(|_| ())
    }

    /// Whether the connection answers a ping. Never raises.
    pub async fn is_healthy(&mut self, cx: &Cx) -> bool {
        if self.in_flight || self.session.check_ready().is_err() {
            return false;
        }
        matches!(self.ping(cx).await, Outcome::Ok(()))
    }

    pub async fn statistics(&mut self, cx: &Cx) -> Outcome<String, Error> {
        try_outcome!(self.ready(cx).await);
        self.exchange(cx, StatisticsCommand::default()).await
    }

    pub async fn refresh(&mut self, cx: &Cx, options: u8) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        let packet = command_packet(Command::Refresh, &[options]);
        self.exchange(cx, SimpleCommand::new(packet)).await.map(|_| ())
    }

    pub async fn kill(&mut self, cx: &Cx, connection_id: u32) -> Outcome<(), Error> {
        self.execute_sql(cx, &format!("KILL {connection_id}")).await.map(|_| ())
    }

    /// COM_RESET_CONNECTION.
    pub async fn reset(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        let packet = command_packet(Command::ResetConnection, &[]);
        let ok = try_outcome!(self.exchange(cx, SimpleCommand::new(packet)).await);
        self.session.after_reset(&ok);
        if self.session.collation() > 255 {
            try_outcome!(self.apply_collation(cx, self.session.collation()).await);
        }
        Outcome::Ok(())
    }

    /// Re-authenticate as another user. A failed change closes the connection.
    pub async fn change_user(
        &mut self,
        cx: &Cx,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
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
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        self.stream.reset_sequence();
        self.in_flight = true;
        let result = self.stream.run(authenticator, &config).await;
        self.in_flight = false;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.session.mark_broken();
                self.stream.shutdown();
                return Outcome::Err(e);
            }
        };
        self.session
            .after_change_user(&outcome, user, config.database.clone(), config.collation);
        self.config = config;
        if self.config.collation > 255 {
            try_outcome!(self.apply_collation(cx, self.config.collation).await);
        }
        debug!(user, plugin = %outcome.plugin, "Changed user");
        Outcome::Ok(())
    }

    pub async fn select_database(&mut self, cx: &Cx, database: &str) -> Outcome<(), Error> {
        try_outcome!(self.ready(cx).await);
        let packet = command_packet(Command::InitDb, database.as_bytes());
        try_outcome!(self.exchange(cx, SimpleCommand::new(packet)).await);
        self.session.set_database(Some(database.to_string()));
        Outcome::Ok(())
    }

    // === Transactions ===

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.execute_sql(cx, "BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.execute_sql(cx, "COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.execute_sql(cx, "ROLLBACK").await.map(|_| ())
    }

    pub async fn set_autocommit(&mut self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        let sql = if enabled {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.execute_sql(cx, sql).await.map(|_| ())
    }

    pub async fn savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_outcome!(lift(validate_savepoint_name(name)));
        self.execute_sql(cx, &format!("SAVEPOINT {name}")).await.map(|_| ())
    }

    pub async fn release_savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_outcome!(lift(validate_savepoint_name(name)));
        self.execute_sql(cx, &format!("RELEASE SAVEPOINT {name}"))
            .await
            .map(|_| ())
    }

    pub async fn rollback_to_savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_outcome!(lift(validate_savepoint_name(name)));
        self.execute_sql(cx, &format!("ROLLBACK TO SAVEPOINT {name}"))
            .await
            .map(|_| ())
    }

    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    // === Lifecycle ===

    /// Close prepared statements, send COM_QUIT and shut the socket down.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        let result = if self.session.is_open() && !self.in_flight {
            self.say_goodbye(cx).await
        } else {
            Outcome::Ok(())
        };
        self.session.mark_closed();
        self.stream.shutdown();
        result
    }

    async fn say_goodbye(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.consume_results(cx).await);
        for id in self.session.statement_ids() {
            try_outcome!(lift(self.session.forget_statement(id).map(|_| ())));
            try_outcome!(self.exchange(cx, NoReplyCommand::new(build_stmt_close(id))).await);
            debug!(statement_id = id, "Closed prepared statement");
        }
        let packet = command_packet(Command::Quit, &[]);
        self.exchange(cx, NoReplyCommand::new(packet)).await
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

    pub fn is_compressed(&self) -> bool {
        self.stream.is_compressed()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }
}

// === Shared connection wrapper ===

/// A connection shared between tasks.
///
/// Each call holds the lock for the whole operation, so at most one task
/// talks to the server at a time.
///
/// # Example
///
/// ```ignore
/// let shared = SharedMySqlConnection::connect(&cx, config).await?;
/// let worker = shared.clone();
/// let rows = worker.query(&cx, "SELECT * FROM users", &[]).await?;
/// ```
pub struct SharedMySqlConnection<S: AsyncIo = AsyncNetStream> {
    inner: Arc<Mutex<MySqlAsyncConnection<S>>>,
}

impl SharedMySqlConnection<AsyncNetStream> {
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        MySqlAsyncConnection::connect(cx, config).await.map(Self::new)
    }
}

impl<S: AsyncIo> SharedMySqlConnection<S> {
    pub fn new(conn: MySqlAsyncConnection<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Get the inner Arc for cloning.
    pub fn inner(&self) -> &Arc<Mutex<MySqlAsyncConnection<S>>> {
        &self.inner
    }

    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.query(cx, sql, params).await
    }

    pub async fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.query_one(cx, sql, params).await
    }

    pub async fn execute(
        &self,
        cx: &Cx,
        statement: Statement<'_>,
        params: &[Value],
    ) -> Outcome<StatementResult, Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.execute(cx, statement, params).await
    }

    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.ping(cx).await
    }

    pub async fn begin(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.begin(cx).await
    }

    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.commit(cx).await
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.rollback(cx).await
    }

    pub async fn savepoint(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        // Validate before waiting on the lock
        try_outcome!(lift(validate_savepoint_name(name)));
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.savepoint(cx, name).await
    }

    pub async fn rollback_to_savepoint(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_outcome!(lift(validate_savepoint_name(name)));
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.rollback_to_savepoint(cx, name).await
    }

    pub async fn release_savepoint(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_outcome!(lift(validate_savepoint_name(name)));
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        guard.release_savepoint(cx, name).await
    }

    pub async fn is_healthy(&self, cx: &Cx) -> bool {
        match self.inner.lock(cx).await {
            Ok(mut guard) => guard.is_healthy(cx).await,
            Err(_) => false,
        }
    }
}

impl<S: AsyncIo> Clone for SharedMySqlConnection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: AsyncIo> std::fmt::Debug for SharedMySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMySqlConnection")
            .field("inner", &"Arc<Mutex<MySqlAsyncConnection>>")
            .finish()
    }
}

fn lock_failed<T>(cx: &Cx) -> Outcome<T, Error> {
    match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => Outcome::Err(Error::usage(
            UsageErrorKind::Closed,
            "failed to acquire connection lock",
        )),
    }
}
