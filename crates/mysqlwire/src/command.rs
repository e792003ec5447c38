//! Command dispatch without I/O.
//!
//! Every command is a short [`Exchange`]: send the command packet, then
//! classify what comes back. The session resets the sequence counter before
//! running one. Responses to COM_QUERY and COM_STMT_EXECUTE are:
//!
//! | first byte | meaning |
//! |---|---|
//! | `0x00` | OK |
//! | `0xFE` (short, deprecate-EOF) | OK |
//! | `0xFF` | ERR, raised as a server error |
//! | `0xFB` | local infile request |
//! | otherwise | column count of a result set |

use tracing::debug;

use crate::config::LocalInfilePolicy;
use crate::exchange::{Exchange, Step};
use crate::local_infile::LocalInfileSender;
use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_QUERY_ATTRIBUTES};
use crate::protocol::prepared::{build_query, build_stmt_execute, build_stmt_prepare};
use crate::protocol::{
    Command, OkPacket, PacketReader, PacketType, PacketWriter, PreparedStatement, StmtPrepareOk,
    parse_err, parse_ok, unexpected,
};
use crate::resultset::{ColumnReader, RowFormat};
use crate::types::{ColumnDef, interpolate_params};
use mysqlwire_core::{Error, Result, Value};

/// Classified first response packet of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(OkPacket),
    /// A result set follows with this many columns
    ResultSet { column_count: u64 },
    /// The server wants the contents of a client-side file
    LocalInfile { filename: String },
}

/// Classify a command response. ERR packets become server errors carrying
/// `sql` when given.
pub fn classify(payload: &[u8], capabilities: u32, sql: Option<&str>) -> Result<Response> {
    match payload.first() {
        None => Err(Error::protocol("empty response packet")),
        Some(0x00) => Ok(Response::Ok(parse_ok(payload)?)),
        Some(0xFF) => Err(Error::Server(parse_err(payload)?.into_server_error(sql))),
        Some(0xFE) if capabilities & CLIENT_DEPRECATE_EOF != 0 && payload.len() < 9 => {
            Ok(Response::Ok(parse_ok(payload)?))
        }
        Some(0xFB) => Ok(Response::LocalInfile {
            filename: String::from_utf8_lossy(&payload[1..]).into_owned(),
        }),
        Some(_) => {
            let mut reader = PacketReader::new(payload);
            match reader.read_lenenc_int() {
                Some(count) if count > 0 && reader.is_empty() => {
                    Ok(Response::ResultSet { column_count: count })
                }
                _ => Err(unexpected("reading a command response", payload)),
            }
        }
    }
}

/// Something to execute: SQL text or a statement prepared on the server.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    Text(&'a str),
    Prepared(&'a PreparedStatement),
}

impl<'a> From<&'a str> for Statement<'a> {
    fn from(sql: &'a str) -> Self {
        Statement::Text(sql)
    }
}

impl<'a> From<&'a String> for Statement<'a> {
    fn from(sql: &'a String) -> Self {
        Statement::Text(sql)
    }
}

impl<'a> From<&'a PreparedStatement> for Statement<'a> {
    fn from(statement: &'a PreparedStatement) -> Self {
        Statement::Prepared(statement)
    }
}

/// An encoded COM_QUERY or COM_STMT_EXECUTE.
#[derive(Debug)]
pub struct EncodedStatement {
    pub packet: Vec<u8>,
    /// SQL text attached to server errors
    pub sql: String,
    pub format: RowFormat,
}

impl Statement<'_> {
    /// Encode with `params`. Text statements get the parameters interpolated
    /// into `?` placeholders; prepared ones bind them in the binary protocol.
    pub fn encode(&self, params: &[Value], capabilities: u32) -> Result<EncodedStatement> {
        match self {
            Statement::Text(sql) => {
                let sql = if params.is_empty() {
                    (*sql).to_string()
                } else {
                    interpolate_params(sql, params)?
                };
                let packet =
                    build_query(&sql, &[], capabilities & CLIENT_QUERY_ATTRIBUTES != 0);
                Ok(EncodedStatement {
                    packet,
                    sql,
                    format: RowFormat::Text,
                })
            }
            Statement::Prepared(statement) => {
                statement.check_params(params)?;
                Ok(EncodedStatement {
                    packet: build_stmt_execute(statement.statement_id, params),
                    sql: statement.sql.clone(),
                    format: RowFormat::Binary,
                })
            }
        }
    }
}

/// Payload of a command that carries only its opcode and an argument.
pub fn command_packet(command: Command, argument: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::command(command, argument.len());
    writer.write_bytes(argument);
    writer.into_bytes()
}

/// A command answered by a single OK (COM_PING, COM_INIT_DB, COM_REFRESH,
/// COM_RESET_CONNECTION, COM_STMT_RESET).
#[derive(Debug)]
pub struct SimpleCommand {
    packet: Option<Vec<u8>>,
}

impl SimpleCommand {
    pub fn new(packet: Vec<u8>) -> Self {
        Self {
            packet: Some(packet),
        }
    }
}

impl Exchange for SimpleCommand {
    type Output = OkPacket;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<OkPacket>> {
        if let Some(command) = self.packet.take() {
            return Ok(Step::Send(command));
        }
        match packet {
            None => Ok(Step::Receive),
            Some(payload) => match PacketType::of(&payload) {
                PacketType::Ok => Ok(Step::Done(parse_ok(&payload)?)),
                PacketType::Error => Err(parse_err(&payload)?.into_error()),
                _ => Err(unexpected("expecting OK", &payload)),
            },
        }
    }
}

/// A command the server never answers (COM_QUIT, COM_STMT_CLOSE,
/// COM_STMT_SEND_LONG_DATA).
#[derive(Debug)]
pub struct NoReplyCommand {
    packet: Option<Vec<u8>>,
}

impl NoReplyCommand {
    pub fn new(packet: Vec<u8>) -> Self {
        Self {
            packet: Some(packet),
        }
    }
}

impl Exchange for NoReplyCommand {
    type Output = ();

    fn resume(&mut self, _packet: Option<Vec<u8>>) -> Result<Step<()>> {
        Ok(match self.packet.take() {
            Some(command) => Step::Send(command),
            None => Step::Done(()),
        })
    }
}

/// COM_STATISTICS: the reply is a bare human-readable string.
#[derive(Debug, Default)]
pub struct StatisticsCommand {
    sent: bool,
}

impl Exchange for StatisticsCommand {
    type Output = String;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<String>> {
        if !self.sent {
            self.sent = true;
            return Ok(Step::Send(command_packet(Command::Statistics, &[])));
        }
        match packet {
            None => Ok(Step::Receive),
            Some(payload) if PacketType::of(&payload) == PacketType::Error => {
                Err(parse_err(&payload)?.into_error())
            }
            Some(payload) => Ok(Step::Done(String::from_utf8_lossy(&payload).into_owned())),
        }
    }
}

/// First packets of a text or binary result.
#[derive(Debug)]
pub enum QueryResponse {
    /// The statement produced no result set
    Ok(OkPacket),
    /// Column definitions were read; rows follow
    Columns(Vec<ColumnDef>),
}

enum QueryState {
    Send(Vec<u8>),
    AwaitResponse,
    Columns(ColumnReader),
    Infile(Box<LocalInfileSender>),
    Done,
}

/// COM_QUERY or COM_STMT_EXECUTE up to the first row, or the next result of
/// a multi-result response when built with [`QueryCommand::next_result`].
pub struct QueryCommand {
    state: QueryState,
    capabilities: u32,
    sql: Option<String>,
    local_infile: LocalInfilePolicy,
}

impl std::fmt::Debug for QueryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCommand")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl QueryCommand {
    pub fn new(
        packet: Vec<u8>,
        sql: Option<String>,
        capabilities: u32,
        local_infile: LocalInfilePolicy,
    ) -> Self {
        Self {
            state: QueryState::Send(packet),
            capabilities,
            sql,
            local_infile,
        }
    }

    /// Read the next result without sending anything.
    pub fn next_result(capabilities: u32, local_infile: LocalInfilePolicy) -> Self {
        Self {
            state: QueryState::AwaitResponse,
            capabilities,
            sql: None,
            local_infile,
        }
    }

    fn on_response(&mut self, payload: &[u8]) -> Result<Step<QueryResponse>> {
        match classify(payload, self.capabilities, self.sql.as_deref())? {
            Response::Ok(ok) => {
                self.state = QueryState::Done;
                Ok(Step::Done(QueryResponse::Ok(ok)))
            }
            Response::ResultSet { column_count } => {
                let count = usize::try_from(column_count)
                    .map_err(|_| Error::protocol("column count out of range"))?;
                self.state = QueryState::Columns(ColumnReader::new(count, self.capabilities));
                Ok(Step::Receive)
            }
            Response::LocalInfile { filename } => {
                let mut sender = Box::new(LocalInfileSender::new(&self.local_infile, &filename));
                let step = sender.resume(None)?;
                self.state = QueryState::Infile(sender);
                self.map_infile(step)
            }
        }
    }

    fn map_infile(&mut self, step: Step<OkPacket>) -> Result<Step<QueryResponse>> {
        Ok(match step {
            Step::Send(p) => Step::Send(p),
            Step::Receive => Step::Receive,
            Step::StartTls => return Err(Error::protocol("TLS upgrade during local infile")),
            Step::Done(ok) => {
                self.state = QueryState::Done;
                Step::Done(QueryResponse::Ok(ok))
            }
        })
    }
}

impl Exchange for QueryCommand {
    type Output = QueryResponse;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<QueryResponse>> {
        match std::mem::replace(&mut self.state, QueryState::Done) {
            QueryState::Send(command) => {
                self.state = QueryState::AwaitResponse;
                Ok(Step::Send(command))
            }
            QueryState::AwaitResponse => match packet {
                None => {
                    self.state = QueryState::AwaitResponse;
                    Ok(Step::Receive)
                }
                Some(payload) => self.on_response(&payload),
            },
            QueryState::Columns(mut reader) => {
                let Some(payload) = packet else {
                    self.state = QueryState::Columns(reader);
                    return Ok(Step::Receive);
                };
                if reader.push(&payload)? {
                    Ok(Step::Done(QueryResponse::Columns(reader.into_columns())))
                } else {
                    self.state = QueryState::Columns(reader);
                    Ok(Step::Receive)
                }
            }
            QueryState::Infile(mut sender) => {
                let step = sender.resume(packet)?;
                self.state = QueryState::Infile(sender);
                self.map_infile(step)
            }
            QueryState::Done => Err(Error::protocol("query exchange already finished")),
        }
    }
}

enum PrepareState {
    Send(Vec<u8>),
    AwaitOk,
    Params(StmtPrepareOk, ColumnReader),
    Columns(StmtPrepareOk, Vec<ColumnDef>, ColumnReader),
    Done,
}

/// COM_STMT_PREPARE through the parameter and column definitions.
pub struct PrepareCommand {
    state: PrepareState,
    sql: String,
    capabilities: u32,
}

impl std::fmt::Debug for PrepareCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareCommand")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl PrepareCommand {
    pub fn new(sql: &str, capabilities: u32) -> Self {
        Self {
            state: PrepareState::Send(build_stmt_prepare(sql)),
            sql: sql.to_string(),
            capabilities,
        }
    }

    /// Move to the column phase, or finish when nothing is left to read.
    fn after_params(
        &mut self,
        ok: StmtPrepareOk,
        params: Vec<ColumnDef>,
    ) -> Step<PreparedStatement> {
        let columns = ColumnReader::new(usize::from(ok.num_columns), self.capabilities);
        if columns.is_complete() {
            self.finish(ok, params, Vec::new())
        } else {
            self.state = PrepareState::Columns(ok, params, columns);
            Step::Receive
        }
    }

    fn finish(
        &mut self,
        ok: StmtPrepareOk,
        params: Vec<ColumnDef>,
        columns: Vec<ColumnDef>,
    ) -> Step<PreparedStatement> {
        debug!(
            statement_id = ok.statement_id,
            params = params.len(),
            columns = columns.len(),
            "Prepared statement"
        );
        let mut statement =
            PreparedStatement::new(ok.statement_id, std::mem::take(&mut self.sql), params, columns);
        statement.warnings = ok.warnings;
        self.state = PrepareState::Done;
        Step::Done(statement)
    }
}

impl Exchange for PrepareCommand {
    type Output = PreparedStatement;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<PreparedStatement>> {
        let state = std::mem::replace(&mut self.state, PrepareState::Done);
        let Some(payload) = packet else {
            return Ok(match state {
                PrepareState::Send(command) => {
                    self.state = PrepareState::AwaitOk;
                    Step::Send(command)
                }
                other => {
                    self.state = other;
                    Step::Receive
                }
            });
        };

        match state {
            PrepareState::AwaitOk => {
                if PacketType::of(&payload) == PacketType::Error {
                    return Err(Error::Server(
                        parse_err(&payload)?.into_server_error(Some(&self.sql)),
                    ));
                }
                let ok = StmtPrepareOk::parse(&payload)?;
                let params = ColumnReader::new(usize::from(ok.num_params), self.capabilities);
                if params.is_complete() {
                    Ok(self.after_params(ok, Vec::new()))
                } else {
                    self.state = PrepareState::Params(ok, params);
                    Ok(Step::Receive)
                }
            }
            PrepareState::Params(ok, mut reader) => {
                if reader.push(&payload)? {
                    Ok(self.after_params(ok, reader.into_columns()))
                } else {
                    self.state = PrepareState::Params(ok, reader);
                    Ok(Step::Receive)
                }
            }
            PrepareState::Columns(ok, params, mut reader) => {
                if reader.push(&payload)? {
                    Ok(self.finish(ok, params, reader.into_columns()))
                } else {
                    self.state = PrepareState::Columns(ok, params, reader);
                    Ok(Step::Receive)
                }
            }
            PrepareState::Send(_) | PrepareState::Done => {
                Err(unexpected("preparing a statement", &payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;
    use crate::transport::mock::{column_payload, err_payload, ok_payload};
    use crate::types::FieldType;
    use mysqlwire_core::ServerErrorKind;

    fn drive<E: Exchange>(exchange: &mut E, replies: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, E::Output) {
        let mut sent = Vec::new();
        let mut replies = replies.into_iter();
        let mut input = None;
        loop {
            match exchange.resume(input.take()).unwrap() {
                Step::Send(p) => sent.push(p),
                Step::Receive => input = Some(replies.next().expect("exchange wants more packets")),
                Step::StartTls => panic!("unexpected TLS upgrade"),
                Step::Done(out) => return (sent, out),
            }
        }
    }

    fn eof() -> Vec<u8> {
        vec![0xFE, 0, 0, 2, 0]
    }

    #[test]
    fn test_classify() {
        let caps = DEFAULT_CLIENT_FLAGS;
        assert!(matches!(
            classify(&ok_payload(3, 9, 2, 0), caps, None).unwrap(),
            Response::Ok(OkPacket { affected_rows: 3, last_insert_id: 9, .. })
        ));
        assert_eq!(
            classify(&[0x02], caps, None).unwrap(),
            Response::ResultSet { column_count: 2 }
        );
        assert_eq!(
            classify(b"\xfb/tmp/data.csv", caps, None).unwrap(),
            Response::LocalInfile {
                filename: "/tmp/data.csv".to_string()
            }
        );

        let err = classify(&err_payload(1064, "42000", "syntax"), caps, Some("SELEC 1")).unwrap_err();
        match err {
            Error::Server(e) => {
                assert_eq!(e.kind, ServerErrorKind::Syntax);
                assert_eq!(e.sql.as_deref(), Some("SELEC 1"));
                assert_eq!(e.sqlstate.as_deref(), Some("42000"));
            }
            other => panic!("expected server error, got {other:?}"),
        }

        assert!(matches!(classify(&[], caps, None), Err(Error::Protocol(_))));
        assert!(matches!(classify(&[0x02, 0x01], caps, None), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_classify_deprecate_eof_ok() {
        let terminator = [0xFE, 0, 0, 2, 0, 0, 0];
        assert!(matches!(
            classify(&terminator, DEFAULT_CLIENT_FLAGS | CLIENT_DEPRECATE_EOF, None),
            Ok(Response::Ok(_))
        ));
        // without the capability 0xFE is a 254-column header
        assert!(classify(&terminator, DEFAULT_CLIENT_FLAGS, None).is_err());
    }

    #[test]
    fn test_simple_command() {
        let mut cmd = SimpleCommand::new(command_packet(Command::Ping, &[]));
        let (sent, ok) = drive(&mut cmd, vec![ok_payload(0, 0, 2, 0)]);
        assert_eq!(sent, vec![vec![0x0e]]);
        assert_eq!(ok.status_flags, 2);

        let mut cmd = SimpleCommand::new(command_packet(Command::InitDb, b"nope"));
        assert!(cmd.resume(None).is_ok());
        assert!(matches!(cmd.resume(None).unwrap(), Step::Receive));
        let err = cmd.resume(Some(err_payload(1049, "42000", "Unknown database 'nope'"))).unwrap_err();
        assert_eq!(err.server_code(), Some(1049));
    }

    #[test]
    fn test_no_reply_command() {
        let mut cmd = NoReplyCommand::new(command_packet(Command::Quit, &[]));
        let (sent, ()) = drive(&mut cmd, Vec::new());
        assert_eq!(sent, vec![vec![0x01]]);
    }

    #[test]
    fn test_statistics() {
        let mut cmd = StatisticsCommand::default();
        let (sent, stats) = drive(&mut cmd, vec![b"Uptime: 10  Threads: 1".to_vec()]);
        assert_eq!(sent, vec![vec![0x09]]);
        assert!(stats.starts_with("Uptime"));
    }

    #[test]
    fn test_query_with_columns() {
        let columns = [
            ColumnDef::new("id", FieldType::Long),
            ColumnDef::new("name", FieldType::VarString),
        ];
        let mut cmd = QueryCommand::new(
            b"\x03SELECT id, name FROM t".to_vec(),
            Some("SELECT id, name FROM t".into()),
            DEFAULT_CLIENT_FLAGS,
            LocalInfilePolicy::Disabled,
        );
        let replies = vec![
            vec![0x02],
            column_payload(&columns[0]),
            column_payload(&columns[1]),
            eof(),
        ];
        let (sent, response) = drive(&mut cmd, replies);
        assert_eq!(sent.len(), 1);
        match response {
            QueryResponse::Columns(defs) => assert_eq!(defs, columns.to_vec()),
            QueryResponse::Ok(_) => panic!("expected columns"),
        }
    }

    #[test]
    fn test_query_ok_and_next_result() {
        let mut cmd = QueryCommand::new(
            b"\x03DELETE FROM t".to_vec(),
            None,
            DEFAULT_CLIENT_FLAGS,
            LocalInfilePolicy::Disabled,
        );
        let (_, response) = drive(&mut cmd, vec![ok_payload(4, 0, 0x000A, 0)]);
        assert!(matches!(
            response,
            QueryResponse::Ok(ref ok) if ok.affected_rows == 4 && ok.more_results_exists()
        ));

        let mut next = QueryCommand::next_result(DEFAULT_CLIENT_FLAGS, LocalInfilePolicy::Disabled);
        let (sent, response) = drive(&mut next, vec![ok_payload(1, 0, 2, 0)]);
        assert!(sent.is_empty());
        assert!(matches!(response, QueryResponse::Ok(ref ok) if !ok.more_results_exists()));
    }

    #[test]
    fn test_prepare() {
        let prepare_ok = b"\x00\x07\x00\x00\x00\x01\x00\x02\x00\x00\x00\x00".to_vec();
        let mut cmd = PrepareCommand::new("SELECT ? + ?", DEFAULT_CLIENT_FLAGS);
        let param = ColumnDef::new("?", FieldType::LongLong);
        let result = ColumnDef::new("? + ?", FieldType::NewDecimal);
        let replies = vec![
            prepare_ok,
            column_payload(&param),
            column_payload(&param),
            eof(),
            column_payload(&result),
            eof(),
        ];
        let (sent, stmt) = drive(&mut cmd, replies);
        assert_eq!(sent, vec![b"\x16SELECT ? + ?".to_vec()]);
        assert_eq!(stmt.statement_id, 7);
        assert_eq!(stmt.param_count(), 2);
        assert_eq!(stmt.column_count(), 1);
        assert_eq!(stmt.sql, "SELECT ? + ?");
    }

    #[test]
    fn test_prepare_without_params_or_columns() {
        let prepare_ok = b"\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00".to_vec();
        let mut cmd = PrepareCommand::new("DO 1", DEFAULT_CLIENT_FLAGS);
        let (_, stmt) = drive(&mut cmd, vec![prepare_ok]);
        assert_eq!(stmt.param_count(), 0);
        assert_eq!(stmt.column_count(), 0);
    }

    #[test]
    fn test_prepare_error_carries_sql() {
        let mut cmd = PrepareCommand::new("SELEC ?", DEFAULT_CLIENT_FLAGS);
        cmd.resume(None).unwrap();
        assert!(matches!(cmd.resume(None).unwrap(), Step::Receive));
        match cmd.resume(Some(err_payload(1064, "42000", "syntax"))).unwrap_err() {
            Error::Server(e) => assert_eq!(e.sql.as_deref(), Some("SELEC ?")),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn test_text_statement_interpolates() {
        let encoded = Statement::from("SELECT * FROM t WHERE a = ? AND b = ?")
            .encode(&[Value::Int(3), Value::Text("it's".into())], DEFAULT_CLIENT_FLAGS)
            .unwrap();
        assert_eq!(encoded.format, RowFormat::Text);
        assert_eq!(encoded.packet[0], Command::Query as u8);
        assert_eq!(encoded.sql, "SELECT * FROM t WHERE a = 3 AND b = 'it\\'s'");
        assert_eq!(&encoded.packet[1..], encoded.sql.as_bytes());
    }

    #[test]
    fn test_query_attributes_prefix() {
        let encoded = Statement::Text("SELECT 1")
            .encode(&[], CLIENT_QUERY_ATTRIBUTES)
            .unwrap();
        // no attributes, one parameter set
        assert_eq!(&encoded.packet[..3], &[Command::Query as u8, 0, 1]);
    }

    #[test]
    fn test_prepared_statement_checks_params() {
        let statement = PreparedStatement::new(
            9,
            "SELECT ?".into(),
            vec![ColumnDef::new("?", FieldType::VarString)],
            vec![],
        );
        let encoded = Statement::from(&statement)
            .encode(&[Value::Int(1)], DEFAULT_CLIENT_FLAGS)
            .unwrap();
        assert_eq!(encoded.format, RowFormat::Binary);
        assert_eq!(encoded.packet[0], Command::StmtExecute as u8);
        assert_eq!(&encoded.packet[1..5], &9u32.to_le_bytes());

        let err = Statement::from(&statement)
            .encode(&[], DEFAULT_CLIENT_FLAGS)
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(mysqlwire_core::UsageErrorKind::ParameterCount));
    }
}
