//! The backend driver client contract: a thin wrapper over
//! whatever SQL engine actually executes compiled query units. The edge
//! connection core only depends on this trait; the real backend connection
//! is an external collaborator outside this crate's scope.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EdgeError;
use crate::types::QueryUnit;

/// The backend's authoritative transaction status, read back at
/// synchronization points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactStatus {
    Idle,
    InTrans,
    InError,
}

/// A single row of opaque, already wire-encoded column data.
pub type Row = Vec<Option<Bytes>>;

/// Callback surface the backend streams result rows through as they arrive,
/// implemented by the session so it can re-emit them to the client at frame
/// boundaries.
#[async_trait]
pub trait RowSink: Send {
    async fn emit_row(&mut self, row: Row) -> Result<(), EdgeError>;
}

/// A `RowSink` that drops every row, used by callers who only need
/// side-effects and a completion signal (e.g. error-recovery rollback SQL).
pub struct DiscardRows;

#[async_trait]
impl RowSink for DiscardRows {
    async fn emit_row(&mut self, _row: Row) -> Result<(), EdgeError> {
        Ok(())
    }
}

#[async_trait]
pub trait BackendClient: Send {
    /// Does any combination of parse/execute on the backend. On the execute
    /// side, result rows are streamed through `sink` as they arrive.
    #[allow(clippy::too_many_arguments)]
    async fn parse_execute(
        &mut self,
        parse: bool,
        execute: bool,
        unit: &QueryUnit,
        sink: &mut dyn RowSink,
        bind_data: &[u8],
        send_sync: bool,
        use_prepared_stmt: bool,
    ) -> Result<(), EdgeError>;

    /// Runs one or more raw SQL statements. Returns rows unless
    /// `ignore_data` is set.
    async fn simple_query(
        &mut self,
        sql: &str,
        ignore_data: bool,
    ) -> Result<Option<Vec<Row>>, EdgeError>;

    /// Drains the backend to a ready-for-query state.
    async fn sync(&mut self) -> Result<(), EdgeError>;

    fn in_tx(&self) -> bool;

    fn xact_status(&self) -> XactStatus;
}

/// An in-memory backend standing in for a real SQL engine connection, used
/// by the bundled server binary and the integration test suite, standing
/// in for the real backend connection this crate treats as an external
/// collaborator.
#[cfg(feature = "test-support")]
pub mod mock {
    use super::*;
    use crate::types::TxAction;
    use std::collections::HashMap;

    /// Tracks transaction depth by watching the `tx_action` of every unit it
    /// is asked to execute, and fails any statement containing the literal
    /// substring `fail` (case-insensitive) so tests can script backend
    /// errors without a real SQL engine.
    pub struct MockBackend {
        status: XactStatus,
        state_table: HashMap<(String, char), String>,
        current_savepoint: Option<i64>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            MockBackend {
                status: XactStatus::Idle,
                state_table: HashMap::new(),
                current_savepoint: None,
            }
        }

        pub fn current_savepoint(&self) -> Option<i64> {
            self.current_savepoint
        }

        pub fn persisted_config(&self) -> Vec<(&str, &str)> {
            self.state_table
                .iter()
                .filter(|((_, t), _)| *t == 'C')
                .map(|((name, _), value)| (name.as_str(), value.as_str()))
                .collect()
        }

        fn apply_tx_action(&mut self, unit: &QueryUnit) {
            match unit.tx_action {
                TxAction::Begin => self.status = XactStatus::InTrans,
                TxAction::Commit | TxAction::Rollback => {
                    self.status = XactStatus::Idle;
                    self.current_savepoint = None;
                }
                TxAction::SavepointDeclare => self.current_savepoint = unit.savepoint_id,
                TxAction::SavepointRollback | TxAction::SavepointRelease => {
                    self.current_savepoint = unit.savepoint_id
                }
                TxAction::None => {}
            }
        }

        fn sql_fails(sql: &[u8]) -> bool {
            let text = String::from_utf8_lossy(sql);
            text.to_ascii_lowercase().contains("fail") || text.contains("1/0")
        }

        /// Parses the single-quoted literal tuple out of the fixed
        /// `insert into _edgecon_state(name, value, type) values (...)`
        /// statement the session issues during `initialize`, and records
        /// it in `state_table`.
        fn record_state_insert(&mut self, sql: &str) {
            let Some(values_start) = sql.to_ascii_lowercase().find("values") else {
                return;
            };
            let rest = &sql[values_start + "values".len()..];
            let literals: Vec<&str> = rest.split('\'').skip(1).step_by(2).collect();
            if let [name, value, kind] = literals.as_slice() {
                if let Some(tag) = kind.chars().next() {
                    self.state_table
                        .insert((name.to_string(), tag), value.to_string());
                }
            }
        }

        /// Every row in `_edgecon_state`, in the `(name, value, type)` shape
        /// `restore` reads back.
        fn state_rows(&self) -> Vec<Row> {
            self.state_table
                .iter()
                .map(|((name, kind), value)| {
                    vec![
                        Some(Bytes::from(name.clone())),
                        Some(Bytes::from(value.clone())),
                        Some(Bytes::from(kind.to_string())),
                    ]
                })
                .collect()
        }
    }

    fn savepoint_hash(name: &str) -> i64 {
        let mut acc: i64 = 0;
        for b in name.bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(b as i64);
        }
        acc
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BackendClient for MockBackend {
        async fn parse_execute(
            &mut self,
            _parse: bool,
            execute: bool,
            unit: &QueryUnit,
            sink: &mut dyn RowSink,
            _bind_data: &[u8],
            send_sync: bool,
            _use_prepared_stmt: bool,
        ) -> Result<(), EdgeError> {
            if Self::sql_fails(&unit.sql) {
                if self.status == XactStatus::InTrans {
                    self.status = XactStatus::InError;
                }
                return Err(EdgeError::BackendError {
                    code: crate::error::ErrorCode::BACKEND_ERROR,
                    message: "division by zero".to_string(),
                    attributes: Vec::new(),
                });
            }
            self.apply_tx_action(unit);
            if execute {
                sink.emit_row(vec![Some(Bytes::from_static(b"1"))]).await?;
            }
            if send_sync {
                self.sync().await?;
            }
            Ok(())
        }

        async fn simple_query(
            &mut self,
            sql: &str,
            ignore_data: bool,
        ) -> Result<Option<Vec<Row>>, EdgeError> {
            if Self::sql_fails(sql.as_bytes()) {
                if self.status == XactStatus::InTrans {
                    self.status = XactStatus::InError;
                }
                return Err(EdgeError::BackendError {
                    code: crate::error::ErrorCode::BACKEND_ERROR,
                    message: "division by zero".to_string(),
                    attributes: Vec::new(),
                });
            }
            // The session reads the innermost active savepoint id back from
            // this table during error recovery (the `Q` handler's rollback path);
            // answer it from the tracked state rather than the generic
            // literal-row stand-in below.
            if sql.contains("_edgecon_current_savepoint") && sql.trim_start().to_ascii_lowercase().starts_with("select") {
                return Ok(self.current_savepoint.map(|id| vec![vec![Some(Bytes::from(id.to_string()))]]));
            }
            if sql.contains("_edgecon_state") {
                let lower = sql.trim_start().to_ascii_lowercase();
                if lower.starts_with("insert") {
                    self.record_state_insert(sql);
                    return Ok(if ignore_data { None } else { Some(Vec::new()) });
                }
                if lower.starts_with("select") {
                    return Ok(Some(self.state_rows()));
                }
            }
            for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                let lower = stmt.to_ascii_lowercase();
                // "rollback to savepoint"/"release savepoint" must be checked
                // before the plain "rollback"/"commit" arm below, since both
                // also start with (or contain) those words.
                if lower.starts_with("begin") || lower.starts_with("start transaction") {
                    self.status = XactStatus::InTrans;
                } else if let Some(name) = lower.strip_prefix("rollback to savepoint ") {
                    self.current_savepoint = Some(savepoint_hash(name));
                } else if lower.starts_with("release savepoint ") {
                    // the dbview owns the actual stack; the backend only
                    // tracks the innermost id for _edgecon_current_savepoint.
                } else if let Some(name) = lower.strip_prefix("savepoint ") {
                    self.current_savepoint = Some(savepoint_hash(name));
                } else if lower.starts_with("commit") || lower.starts_with("rollback") {
                    self.status = XactStatus::Idle;
                    self.current_savepoint = None;
                }
            }
            if ignore_data {
                Ok(None)
            } else {
                Ok(Some(vec![vec![Some(Bytes::from_static(b"1"))]]))
            }
        }

        async fn sync(&mut self) -> Result<(), EdgeError> {
            Ok(())
        }

        fn in_tx(&self) -> bool {
            self.status == XactStatus::InTrans || self.status == XactStatus::InError
        }

        fn xact_status(&self) -> XactStatus {
            self.status
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn state_insert_round_trips_through_select() {
            let mut backend = MockBackend::new();
            backend
                .simple_query(
                    "insert into _edgecon_state(name, value, type) values ('', 'default', 'A')",
                    true,
                )
                .await
                .unwrap();
            assert_eq!(backend.persisted_config(), Vec::<(&str, &str)>::new());

            let rows = backend
                .simple_query("select name, value, type from _edgecon_state", false)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(rows.len(), 1);
            let cols: Vec<String> = rows[0]
                .iter()
                .map(|c| String::from_utf8_lossy(c.as_ref().unwrap()).into_owned())
                .collect();
            assert_eq!(cols, vec!["".to_string(), "default".to_string(), "A".to_string()]);
        }

        #[tokio::test]
        async fn current_savepoint_select_reflects_tracked_state() {
            let mut backend = MockBackend::new();
            assert_eq!(
                backend
                    .simple_query("select sp_id from _edgecon_current_savepoint", false)
                    .await
                    .unwrap(),
                None
            );

            backend
                .simple_query("SAVEPOINT s1", false)
                .await
                .unwrap();
            let rows = backend
                .simple_query("select sp_id from _edgecon_current_savepoint", false)
                .await
                .unwrap()
                .unwrap();
            let id: i64 = String::from_utf8(rows[0][0].clone().unwrap().to_vec())
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(id, backend.current_savepoint().unwrap());
        }
    }
}
