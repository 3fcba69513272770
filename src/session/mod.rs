//! The session protocol engine: a single-threaded cooperative task that
//! owns one [`DbView`] and one backend connection for the lifetime of a
//! client connection.

pub mod messages;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::backend::{BackendClient, DiscardRows, Row, RowSink, XactStatus};
use crate::codec::MessageCodec;
use crate::compiler::CompilerClient;
use crate::dbview::{DbView, TxStatus};
use crate::error::{EdgeError, WireError};
use crate::recoder;
use crate::types::{OutputMode, QueryUnit, StatementMode, TxAction, TypeId};

use messages::ClientMessage;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Streams result rows out to the client as `D` frames as they arrive.
struct CodecRowSink<'a, S> {
    codec: &'a mut MessageCodec<S>,
}

#[async_trait]
impl<'a, S> RowSink for CodecRowSink<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn emit_row(&mut self, row: Row) -> Result<(), EdgeError> {
        self.codec.begin(b'D');
        self.codec.write_u16(row.len() as u16);
        for col in &row {
            match col {
                Some(bytes) => {
                    self.codec.write_i32(bytes.len() as i32);
                    self.codec.write_bytes(bytes);
                }
                None => self.codec.write_i32(-1),
            }
        }
        self.codec.finish_message(b'D').await
    }
}

/// Buffers rows for the legacy JSON entrypoint instead of streaming them.
struct JsonCollectSink {
    rows: Vec<Row>,
}

#[async_trait]
impl RowSink for JsonCollectSink {
    async fn emit_row(&mut self, row: Row) -> Result<(), EdgeError> {
        self.rows.push(row);
        Ok(())
    }
}

pub struct Session<S, C, B> {
    codec: MessageCodec<S>,
    dbview: DbView,
    compiler: Arc<C>,
    backend: B,
    dbver: u64,
    connection_id: u32,
    /// The most recently parsed (or opportunistically re-parsed) anonymous
    /// statement: its source text, the output mode it was compiled for, and
    /// the compiled unit itself. `Describe`/`Execute` operate on this.
    last_anonymous: Option<(String, OutputMode, Arc<QueryUnit>)>,
}

impl<S, C, B> Session<S, C, B>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: CompilerClient,
    B: BackendClient,
{
    pub fn new(stream: S, compiler: Arc<C>, backend: B, dbver: u64, cache_capacity: usize) -> Self {
        Session {
            codec: MessageCodec::new(stream),
            dbview: DbView::new(cache_capacity),
            compiler,
            backend,
            dbver,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            last_anonymous: None,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Drives the session to completion: handshake, authenticate,
    /// initialize, restore, then the main dispatch loop. Returns once the
    /// connection closes or the handshake is rejected.
    pub async fn run(mut self) -> Result<(), EdgeError> {
        if let Err(e) = self.handshake().await {
            let _ = self.write_error_frame(&e).await;
            let _ = self.codec.flush().await;
            return Err(e);
        }
        self.authenticate().await?;
        self.initialize().await?;
        self.restore().await?;
        debug!(connection_id = self.connection_id, "session ready");
        self.main_loop().await
    }

    async fn handshake(&mut self) -> Result<(), EdgeError> {
        let raw = self.codec.read_raw(4).await?;
        let major = u16::from_be_bytes([raw[0], raw[1]]);
        let minor = u16::from_be_bytes([raw[2], raw[3]]);
        if (major, minor) != (1, 0) {
            return Err(EdgeError::UnsupportedProtocolVersion { major, minor });
        }
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), EdgeError> {
        let frame = self.codec.wait_for_message().await?;
        let message = messages::decode(&frame)?;
        // Credential verification and database routing are external
        // collaborators; the core accepts
        // unconditionally here.
        let ClientMessage::Auth { .. } = message else {
            return Err(EdgeError::BinaryProtocolError(
                "expected an authentication message".into(),
            ));
        };

        self.codec.begin(b'R');
        self.codec.write_u32(0);
        self.codec.finish_message(b'R').await?;

        self.codec.begin(b'K');
        self.codec.write_u32(self.connection_id);
        self.codec.finish_message(b'K').await?;

        self.emit_ready_for_query().await?;
        self.codec.flush().await
    }

    async fn initialize(&mut self) -> Result<(), EdgeError> {
        self.backend
            .simple_query(
                "create temporary table _edgecon_state(name text, value text, \
                 type text check(type in ('C','A')), unique(name, type))",
                true,
            )
            .await?;
        self.backend
            .simple_query(
                "create temporary table _edgecon_current_savepoint(sp_id bigint, \
                 _sentinel bigint default -1, unique(_sentinel))",
                true,
            )
            .await?;
        self.backend
            .simple_query(
                "insert into _edgecon_state(name, value, type) values ('', 'default', 'A')",
                true,
            )
            .await?;
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), EdgeError> {
        let rows = self
            .backend
            .simple_query("select name, value, type from _edgecon_state", false)
            .await?;
        let Some(rows) = rows else {
            return Ok(());
        };
        for row in rows {
            if row.len() != 3 {
                continue;
            }
            let col = |b: &Option<Bytes>| b.as_ref().map(|v| String::from_utf8_lossy(v).into_owned());
            let (Some(name), Some(value), Some(kind)) = (col(&row[0]), col(&row[1]), col(&row[2])) else {
                continue;
            };
            match kind.as_str() {
                "A" => self.dbview.set_alias(name, value),
                "C" => self
                    .dbview
                    .set_config(name, crate::types::ConfigValue::Str(value)),
                _ => {}
            }
        }
        Ok(())
    }

    async fn main_loop(&mut self) -> Result<(), EdgeError> {
        loop {
            let frame = match self.codec.wait_for_message().await {
                Ok(f) => f,
                Err(EdgeError::ConnectionAborted) => return Ok(()),
                Err(e) => return Err(e),
            };
            let tag = frame.tag;
            let message = match messages::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    if self.report_error(tag, e).await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            };
            if let Err(e) = self.dispatch(message).await {
                if matches!(e, EdgeError::ConnectionAborted) {
                    return Ok(());
                }
                if self.report_error(tag, e).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<(), EdgeError> {
        match message {
            ClientMessage::Parse {
                statement_name,
                source,
            } => self.handle_parse(statement_name, source).await,
            ClientMessage::Describe { mode, statement_name } => {
                self.handle_describe(mode, statement_name).await
            }
            ClientMessage::Execute {
                statement_name,
                bind_args,
            } => self.handle_execute(statement_name, bind_args).await,
            ClientMessage::OpportunisticExecute {
                source,
                input_type_id,
                output_type_id,
                bind_args,
            } => {
                self.handle_opportunistic_execute(source, input_type_id, output_type_id, bind_args)
                    .await
            }
            ClientMessage::SimpleQuery { source } => self.handle_simple_query(source).await,
            ClientMessage::LegacyScript { lang, source } => {
                self.handle_legacy_script(lang, source).await
            }
            ClientMessage::Sync => self.handle_sync().await,
            ClientMessage::Flush => self.codec.flush().await,
            ClientMessage::Auth { .. } => Err(EdgeError::BinaryProtocolError(
                "unexpected authentication message".into(),
            )),
            ClientMessage::Unsupported(other) => Err(EdgeError::BinaryProtocolError(format!(
                "unexpected message type {:#x}",
                other
            ))),
        }
    }

    /// `Parse`: compile (or reuse) a statement and reply with its type ids.
    async fn handle_parse(&mut self, statement_name: String, source: String) -> Result<(), EdgeError> {
        if !statement_name.is_empty() {
            return Err(EdgeError::UnsupportedFeature(
                "named prepared statements".into(),
            ));
        }
        if source.is_empty() {
            return Err(EdgeError::BinaryProtocolError("empty query".into()));
        }
        let mode = OutputMode::Binary;

        let cached = self
            .dbview
            .lookup_compiled_query(&source, mode)
            .filter(|u| self.dbview.cache_is_usable_for(u));

        let unit = match cached {
            Some(u) => u,
            None => self.compile_and_warm_one(&source, mode).await?,
        };

        self.last_anonymous = Some((source, mode, unit.clone()));

        self.codec.begin(b'1');
        self.codec.write_bytes(&unit.input_type_id);
        self.codec.write_bytes(&unit.output_type_id);
        self.codec.finish_message(b'1').await?;
        // Parse is always followed by a Describe/Execute from the client,
        // which the codec can only see once this reply has actually left
        // the wire; the auto-flush threshold alone won't trigger here.
        self.codec.flush().await
    }

    /// Compiles a single (non-cached) statement, issues a parse-only
    /// `parse_execute` to warm the backend's prepared statement, and caches
    /// the result if cacheable. Shared by `Parse` and `O`'s re-parse branch.
    async fn compile_and_warm_one(
        &mut self,
        source: &str,
        mode: OutputMode,
    ) -> Result<Arc<QueryUnit>, EdgeError> {
        let unit = if self.dbview.status() == TxStatus::InTxError {
            let (unit, remaining) = self.compiler.try_compile_rollback(self.dbver, source).await?;
            if remaining != 0 {
                return Err(EdgeError::InTxErrorRejection);
            }
            unit
        } else {
            let units = self
                .compile_script(source, mode, StatementMode::Normal, false, false)
                .await?;
            units
                .into_iter()
                .next()
                .ok_or_else(|| EdgeError::InternalServerError("compiler returned no units".into()))?
        };
        let unit = Arc::new(unit);
        let mut sink = DiscardRows;
        self.backend
            .parse_execute(
                true,
                false,
                &unit,
                &mut sink,
                &[],
                false,
                unit.prepared_stmt_hash.is_some(),
            )
            .await?;
        if unit.cacheable {
            self.dbview.cache_compiled_query(source.to_string(), mode, unit.clone());
        }
        Ok(unit)
    }

    /// `Describe`: report the last anonymous statement's type descriptors.
    async fn handle_describe(&mut self, mode: u8, statement_name: String) -> Result<(), EdgeError> {
        if mode != b'T' {
            return Err(EdgeError::UnsupportedFeature(format!(
                "describe mode {:#x}",
                mode
            )));
        }
        if !statement_name.is_empty() {
            return Err(EdgeError::UnsupportedFeature(
                "named prepared statements".into(),
            ));
        }
        let Some((_, _, unit)) = self.last_anonymous.clone() else {
            return Err(EdgeError::TypeSpecNotFound);
        };
        self.write_describe_frame(&unit).await?;
        // Describe is normally followed by Execute, which the client won't
        // send until it has this reply in hand.
        self.codec.flush().await
    }

    async fn write_describe_frame(&mut self, unit: &QueryUnit) -> Result<(), EdgeError> {
        self.codec.begin(b'T');
        self.codec.write_bytes(&unit.input_type_id);
        self.codec.write_u16(unit.input_type_descriptor.len() as u16);
        self.codec.write_bytes(&unit.input_type_descriptor);
        self.codec.write_bytes(&unit.output_type_id);
        self.codec.write_u16(unit.output_type_descriptor.len() as u16);
        self.codec.write_bytes(&unit.output_type_descriptor);
        self.codec.finish_message(b'T').await
    }

    /// `Execute`: bind and run the last anonymous statement.
    async fn handle_execute(&mut self, statement_name: String, bind_args: Bytes) -> Result<(), EdgeError> {
        if !statement_name.is_empty() {
            return Err(EdgeError::UnsupportedFeature(
                "named prepared statements".into(),
            ));
        }
        let Some((_, _, unit)) = self.last_anonymous.clone() else {
            return Err(EdgeError::TypeSpecNotFound);
        };
        self.execute_unit(unit, &bind_args, false).await
    }

    /// `OpportunisticExecute`: a single-round-trip parse-and-execute that
    /// trusts the client's cached type ids, falling back to an explicit
    /// reparse when they're stale.
    async fn handle_opportunistic_execute(
        &mut self,
        source: String,
        input_type_id: TypeId,
        output_type_id: TypeId,
        bind_args: Bytes,
    ) -> Result<(), EdgeError> {
        let mode = OutputMode::Binary;
        let reusable = self
            .dbview
            .lookup_compiled_query(&source, mode)
            .filter(|u| self.dbview.cache_is_usable_for(u))
            .filter(|u| u.input_type_id == input_type_id && u.output_type_id == output_type_id);

        let (unit, parse_flag) = match reusable {
            Some(u) => (u, true),
            None => {
                let unit = self.compile_and_warm_one(&source, mode).await?;
                self.write_describe_frame(&unit).await?;
                (unit, false)
            }
        };

        self.last_anonymous = Some((source, mode, unit.clone()));
        self.execute_unit(unit, &bind_args, parse_flag).await?;
        // O is the single-round-trip fast path (spec: "this single round
        // trip is the performance-critical path"): the client isn't going
        // to send a Sync to flush this reply for us.
        self.codec.flush().await
    }

    /// The common execute path shared by `Execute` and `OpportunisticExecute`.
    async fn execute_unit(
        &mut self,
        unit: Arc<QueryUnit>,
        bind_args: &[u8],
        parse_flag: bool,
    ) -> Result<(), EdgeError> {
        self.dbview.start(&unit)?;

        if self.dbview.status() == TxStatus::InTxError {
            if !unit.sql.is_empty() {
                let sql = String::from_utf8(unit.sql.to_vec())?;
                self.backend.simple_query(&sql, true).await?;
            }
            if unit.tx_action == TxAction::SavepointRollback {
                if let Some(id) = unit.savepoint_id {
                    self.dbview.rollback_tx_to_savepoint(id)?;
                }
            } else {
                self.dbview.abort_tx();
            }
            return self.write_command_complete().await;
        }

        let recoded = recoder::recode_bind_args(bind_args)?;
        // A fully-buffered trailing Sync is folded into this call and
        // consumed here rather than dispatched separately by the main loop.
        let send_sync = self.codec.take_pending_sync();
        let use_prepared = unit.prepared_stmt_hash.is_some();

        let result = {
            let mut sink = CodecRowSink {
                codec: &mut self.codec,
            };
            self.backend
                .parse_execute(parse_flag, true, &unit, &mut sink, &recoded, send_sync, use_prepared)
                .await
        };

        match result {
            Ok(()) => {
                self.dbview.on_success(&unit);
                self.write_command_complete().await?;
                if send_sync {
                    self.emit_ready_for_query().await?;
                    // The trailing Sync was already consumed off the wire
                    // by take_pending_sync(), so no later `S` handler will
                    // flush this reply; do it here.
                    self.codec.flush().await?;
                }
                Ok(())
            }
            Err(e) => {
                self.dbview.on_error(&unit);
                self.reconcile_tx_abort();
                Err(e)
            }
        }
    }

    /// The "failed COMMIT" workaround: if the
    /// view still believes it is in a transaction but the backend has
    /// already observed it end, force the view back to `Idle`.
    fn reconcile_tx_abort(&mut self) {
        if self.dbview.status() == TxStatus::InTx && self.backend.xact_status() == XactStatus::Idle {
            self.dbview.abort_tx();
        }
    }

    /// `SimpleQuery`: run one non-script EdgeQL statement outside the
    /// extended-query flow.
    async fn handle_simple_query(&mut self, source: String) -> Result<(), EdgeError> {
        let stmt_mode = if self.dbview.status() == TxStatus::InTxError {
            let remaining = self.run_error_recovery(&source).await?;
            if remaining == 0 {
                self.write_command_complete().await?;
                self.emit_ready_for_query().await?;
                self.codec.flush().await?;
                return Ok(());
            }
            StatementMode::SkipFirst
        } else {
            StatementMode::Normal
        };

        let units = self
            .compile_script(&source, OutputMode::Binary, stmt_mode, false, false)
            .await?;
        for unit in units {
            self.run_one_script_unit(Arc::new(unit), &mut DiscardRows).await?;
        }
        self.write_command_complete().await?;
        self.emit_ready_for_query().await?;
        self.codec.flush().await
    }

    /// `LegacyScript`: same contract as `SimpleQuery`, except the output mode
    /// is JSON and rows are concatenated into a single array.
    async fn handle_legacy_script(&mut self, lang: u8, source: String) -> Result<(), EdgeError> {
        let graphql = lang == b'g';
        let stmt_mode = if self.dbview.status() == TxStatus::InTxError {
            let remaining = self.run_error_recovery(&source).await?;
            if remaining == 0 {
                self.write_legacy_frame(&[]).await?;
                self.emit_ready_for_query().await?;
                self.codec.flush().await?;
                return Ok(());
            }
            StatementMode::SkipFirst
        } else {
            StatementMode::Normal
        };

        let units = self
            .compile_script(&source, OutputMode::Json, stmt_mode, true, graphql)
            .await?;
        let mut elements = Vec::with_capacity(units.len());
        for unit in units {
            let mut sink = JsonCollectSink { rows: Vec::new() };
            self.run_one_script_unit(Arc::new(unit), &mut sink).await?;
            let element = sink
                .rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next())
                .flatten()
                .unwrap_or_else(|| Bytes::from_static(b"null"));
            elements.push(element);
        }
        self.write_legacy_frame(&elements).await?;
        self.emit_ready_for_query().await?;
        self.codec.flush().await
    }

    async fn write_legacy_frame(&mut self, elements: &[Bytes]) -> Result<(), EdgeError> {
        let mut body = Vec::new();
        body.push(b'[');
        for (i, el) in elements.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(el);
        }
        body.push(b']');
        self.codec.begin(b'L');
        self.codec.write_bytes(&body);
        self.codec.finish_message(b'L').await
    }

    /// Compiles `source`, choosing `compile` or `compile_in_tx` based on the
    /// view's current status.
    async fn compile_script(
        &self,
        source: &str,
        mode: OutputMode,
        stmt_mode: StatementMode,
        legacy: bool,
        graphql: bool,
    ) -> Result<Vec<QueryUnit>, EdgeError> {
        match self.dbview.status() {
            TxStatus::Idle => {
                self.compiler
                    .compile(self.dbver, source, self.dbview.aliases(), self.dbview.config(), mode)
                    .await
            }
            TxStatus::InTx | TxStatus::InTxError => {
                self.compiler
                    .compile_in_tx(self.tx_id(), source, mode, legacy, graphql, stmt_mode)
                    .await
            }
        }
    }

    /// A stand-in for the backend-assigned transaction id the compiler uses
    /// to disambiguate its in-transaction snapshot; this
    /// crate's `BackendClient` contract does not expose one, so the
    /// connection id is reused for the lifetime of one transaction.
    fn tx_id(&self) -> u64 {
        self.connection_id as u64
    }

    async fn run_error_recovery(&mut self, source: &str) -> Result<usize, EdgeError> {
        let (rollback_unit, remaining) = self.compiler.try_compile_rollback(self.dbver, source).await?;
        if !rollback_unit.sql.is_empty() {
            let sql = String::from_utf8(rollback_unit.sql.to_vec())?;
            self.backend.simple_query(&sql, true).await?;
        }
        if rollback_unit.tx_action == TxAction::SavepointRollback {
            if let Some(id) = self.current_backend_savepoint().await? {
                self.dbview.rollback_tx_to_savepoint(id)?;
            }
        } else {
            self.dbview.abort_tx();
        }
        Ok(remaining)
    }

    async fn current_backend_savepoint(&mut self) -> Result<Option<i64>, EdgeError> {
        let rows = self
            .backend
            .simple_query("select sp_id from _edgecon_current_savepoint", false)
            .await?;
        let Some(mut rows) = rows else {
            return Ok(None);
        };
        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        let Some(Some(bytes)) = row.into_iter().next() else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes.to_vec())?;
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| EdgeError::InternalServerError("malformed savepoint id".into()))
    }

    async fn run_one_script_unit(
        &mut self,
        unit: Arc<QueryUnit>,
        sink: &mut dyn RowSink,
    ) -> Result<(), EdgeError> {
        self.dbview.start(&unit)?;
        let result: Result<(), EdgeError> = if unit.sql.is_empty() {
            Ok(())
        } else {
            let sql = String::from_utf8(unit.sql.to_vec())?;
            match self.backend.simple_query(&sql, false).await {
                Ok(Some(rows)) => {
                    for row in rows {
                        sink.emit_row(row).await?;
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => {
                self.dbview.on_success(&unit);
                Ok(())
            }
            Err(e) => {
                self.dbview.on_error(&unit);
                self.reconcile_tx_abort();
                Err(e)
            }
        }
    }

    async fn write_command_complete(&mut self) -> Result<(), EdgeError> {
        self.codec.begin(b'C');
        self.codec.finish_message(b'C').await
    }

    async fn emit_ready_for_query(&mut self) -> Result<(), EdgeError> {
        let status_byte = match self.backend.xact_status() {
            XactStatus::Idle => b'I',
            XactStatus::InTrans => b'T',
            XactStatus::InError => b'E',
        };
        self.codec.begin(b'Z');
        self.codec.write_u8(status_byte);
        self.codec.finish_message(b'Z').await
    }

    /// `Sync`: drain the backend to a ready-for-query state.
    async fn handle_sync(&mut self) -> Result<(), EdgeError> {
        self.backend.sync().await?;
        self.emit_ready_for_query().await?;
        self.codec.flush().await
    }

    async fn write_error_frame(&mut self, err: &EdgeError) -> Result<(), EdgeError> {
        let wire = WireError::from(err);
        self.codec.begin(b'E');
        self.codec.write_u32(wire.code.0);
        self.codec.write_len_string(&wire.message);
        for (tag, value) in &wire.attributes {
            self.codec.write_u8(*tag);
            self.codec.write_len_string(value);
        }
        self.codec.write_u8(0);
        self.codec.finish_message(b'E').await
    }

    /// The error-reporting subroutine: translate, emit an `E`
    /// frame, then either flush-sync-on-error (`Q`/`L`) or enter recovery
    /// (discard frames until the next `S`, then handle it normally). An
    /// error here is itself fatal and propagated to the caller.
    async fn report_error(&mut self, origin_tag: u8, err: EdgeError) -> Result<(), EdgeError> {
        warn!(
            connection_id = self.connection_id,
            origin_tag = origin_tag as char,
            error = %err,
            "session error"
        );
        self.dbview.tx_error();
        let err = match err {
            EdgeError::RawBackendError(fields) => {
                self.compiler.interpret_backend_error(self.dbver, fields).await
            }
            other => other,
        };
        self.write_error_frame(&err).await?;
        if origin_tag == b'Q' || origin_tag == b'L' {
            self.emit_ready_for_query().await?;
            self.codec.flush().await?;
        } else {
            self.discard_until_sync().await?;
            self.handle_sync().await?;
        }
        Ok(())
    }

    async fn discard_until_sync(&mut self) -> Result<(), EdgeError> {
        loop {
            let frame = self.codec.wait_for_message().await?;
            if frame.tag == b'S' {
                return Ok(());
            }
        }
    }
}

#[cfg(all(test, feature = "test-support"))]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::compiler::mock::MockCompiler;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn spawn_session() -> (
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<(), EdgeError>>,
    ) {
        let (client, server) = duplex(16 * 1024);
        let session = Session::new(server, Arc::new(MockCompiler), MockBackend::new(), 1, 100);
        let handle = tokio::spawn(session.run());
        (client, handle)
    }

    fn auth_frame(user: &str, password: &str, database: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for s in [user, password, database] {
            body.extend_from_slice(&(s.len() as u32).to_be_bytes());
            body.extend_from_slice(s.as_bytes());
        }
        let mut frame = Vec::new();
        frame.push(b'0');
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn simple_frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push(tag);
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    async fn read_frame(client: &mut tokio::io::DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 5];
        client.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len - 4];
        client.read_exact(&mut payload).await.unwrap();
        (header[0], payload)
    }

    #[tokio::test]
    async fn handshake_and_ping_emits_the_documented_frame_sequence() {
        let (mut client, _handle) = spawn_session();

        client.write_all(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
        client
            .write_all(&auth_frame("u", "", "d"))
            .await
            .unwrap();

        let (tag, payload) = read_frame(&mut client).await;
        assert_eq!(tag, b'R');
        assert_eq!(u32::from_be_bytes(payload.try_into().unwrap()), 0);

        let (tag, _) = read_frame(&mut client).await;
        assert_eq!(tag, b'K');

        let (tag, payload) = read_frame(&mut client).await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload, vec![b'I']);

        client
            .write_all(&simple_frame(b'Q', &cstr("select 1;")))
            .await
            .unwrap();

        let (tag, _) = read_frame(&mut client).await;
        assert_eq!(tag, b'C');
        let (tag, payload) = read_frame(&mut client).await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload, vec![b'I']);
    }

    #[tokio::test]
    async fn in_transaction_error_is_rejected_until_rollback() {
        let (mut client, _handle) = spawn_session();
        client.write_all(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
        client.write_all(&auth_frame("u", "", "d")).await.unwrap();
        read_frame(&mut client).await;
        read_frame(&mut client).await;
        read_frame(&mut client).await;

        client
            .write_all(&simple_frame(b'Q', &cstr("start transaction;")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'C');
        let (_, z) = read_frame(&mut client).await;
        assert_eq!(z, vec![b'T']);

        client
            .write_all(&simple_frame(b'Q', &cstr("select 1/0;")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'E');
        let (_, z) = read_frame(&mut client).await;
        assert_eq!(z, vec![b'E']);

        client
            .write_all(&simple_frame(b'Q', &cstr("select 1;")))
            .await
            .unwrap();
        let (tag, _) = read_frame(&mut client).await;
        assert_eq!(tag, b'E');
        let (_, z) = read_frame(&mut client).await;
        assert_eq!(z, vec![b'E']);

        client
            .write_all(&simple_frame(b'Q', &cstr("rollback;")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'C');
        let (_, z) = read_frame(&mut client).await;
        assert_eq!(z, vec![b'I']);
    }
}
