//! The compiler client contract: an external collaborator
//! that turns EdgeQL-like source text into [`QueryUnit`]s. The edge
//! connection core only depends on this trait; the real compiler lives
//! outside this crate's scope.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::EdgeError;
use crate::types::{AliasMap, ConfigOverlay, OutputMode, QueryUnit, StatementMode};

/// Four single-request/single-response operations, all failing with
/// `EdgeError::CompilerError` on compiler-side rejection.
#[async_trait]
pub trait CompilerClient: Send + Sync {
    /// Used outside an active transaction; may return more than one unit
    /// when `text` is a script.
    async fn compile(
        &self,
        dbver: u64,
        text: &str,
        aliases: &AliasMap,
        config: &ConfigOverlay,
        output_mode: OutputMode,
    ) -> Result<Vec<QueryUnit>, EdgeError>;

    /// Used inside an active transaction; `tx_id` disambiguates which
    /// backend snapshot the compiler should reason about.
    async fn compile_in_tx(
        &self,
        tx_id: u64,
        text: &str,
        output_mode: OutputMode,
        legacy: bool,
        graphql: bool,
        stmt_mode: StatementMode,
    ) -> Result<Vec<QueryUnit>, EdgeError>;

    /// Best-effort parse of `text` to extract a leading rollback or
    /// savepoint-rollback statement. `remaining_count` is how many trailing
    /// statements could not be compiled, used by error recovery to decide
    /// whether the script should continue.
    async fn try_compile_rollback(
        &self,
        dbver: u64,
        text: &str,
    ) -> Result<(QueryUnit, usize), EdgeError>;

    /// Translate a backend engine error's field dictionary into the
    /// domain's error taxonomy.
    async fn interpret_backend_error(&self, dbver: u64, fields: HashMap<u8, String>) -> EdgeError;
}

/// An in-memory, deterministic stand-in compiler for tests and the
/// bundled server binary, since the real compiler is an external
/// collaborator outside this crate's scope.
#[cfg(feature = "test-support")]
pub mod mock {
    use super::*;
    use crate::types::{StagedUpdate, TxAction};
    use bytes::Bytes;

    /// Compiles a handful of literal EdgeQL-shaped statements the test
    /// suite and example server recognize, falling back to a generic
    /// pass-through SQL unit for anything else.
    pub struct MockCompiler;

    fn base_unit(sql: impl Into<Bytes>) -> QueryUnit {
        QueryUnit {
            input_type_id: [0; 16],
            input_type_descriptor: Bytes::new(),
            output_type_id: [1; 16],
            output_type_descriptor: Bytes::new(),
            sql: sql.into(),
            prepared_stmt_hash: None,
            cacheable: true,
            tx_action: TxAction::None,
            savepoint_id: None,
            staged_update: None,
        }
    }

    fn compile_one(text: &str) -> QueryUnit {
        let trimmed = text.trim().trim_end_matches(';').trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower == "start transaction" || lower == "begin" {
            let mut u = base_unit(Bytes::from_static(b"BEGIN"));
            u.tx_action = TxAction::Begin;
            u.cacheable = false;
            u
        } else if lower == "commit" {
            let mut u = base_unit(Bytes::from_static(b"COMMIT"));
            u.tx_action = TxAction::Commit;
            u.cacheable = false;
            u
        } else if lower == "rollback" {
            let mut u = base_unit(Bytes::from_static(b"ROLLBACK"));
            u.tx_action = TxAction::Rollback;
            u.cacheable = false;
            u
        } else if let Some(name) = lower.strip_prefix("declare savepoint ") {
            let id = savepoint_hash(name);
            let mut u = base_unit(format!("SAVEPOINT {name}"));
            u.tx_action = TxAction::SavepointDeclare;
            u.savepoint_id = Some(id);
            u.cacheable = false;
            u
        } else if let Some(name) = lower.strip_prefix("release savepoint ") {
            let id = savepoint_hash(name);
            let mut u = base_unit(format!("RELEASE SAVEPOINT {name}"));
            u.tx_action = TxAction::SavepointRelease;
            u.savepoint_id = Some(id);
            u.cacheable = false;
            u
        } else if let Some(name) = lower.strip_prefix("rollback to savepoint ") {
            let id = savepoint_hash(name);
            let mut u = base_unit(format!("ROLLBACK TO SAVEPOINT {name}"));
            u.tx_action = TxAction::SavepointRollback;
            u.savepoint_id = Some(id);
            u.cacheable = false;
            u
        } else if let Some(rest) = lower.strip_prefix("set ") {
            let mut parts = rest.splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim().to_string();
            let value = parts.next().unwrap_or_default().trim().to_string();
            let mut u = base_unit(trimmed.to_string());
            u.staged_update = Some(StagedUpdate::Config(
                key,
                crate::types::ConfigValue::Str(value),
            ));
            u.cacheable = false;
            u
        } else {
            base_unit(trimmed.to_string())
        }
    }

    fn savepoint_hash(name: &str) -> i64 {
        let mut acc: i64 = 0;
        for b in name.bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(b as i64);
        }
        acc
    }

    fn split_script(text: &str) -> Vec<String> {
        text.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[async_trait]
    impl CompilerClient for MockCompiler {
        async fn compile(
            &self,
            _dbver: u64,
            text: &str,
            _aliases: &AliasMap,
            _config: &ConfigOverlay,
            _output_mode: OutputMode,
        ) -> Result<Vec<QueryUnit>, EdgeError> {
            let stmts = split_script(text);
            if stmts.is_empty() {
                return Err(EdgeError::BinaryProtocolError("empty query".into()));
            }
            Ok(stmts.iter().map(|s| compile_one(s)).collect())
        }

        async fn compile_in_tx(
            &self,
            _tx_id: u64,
            text: &str,
            _output_mode: OutputMode,
            _legacy: bool,
            _graphql: bool,
            stmt_mode: StatementMode,
        ) -> Result<Vec<QueryUnit>, EdgeError> {
            let mut stmts = split_script(text);
            if stmt_mode == StatementMode::SkipFirst && !stmts.is_empty() {
                stmts.remove(0);
            }
            Ok(stmts.iter().map(|s| compile_one(s)).collect())
        }

        async fn try_compile_rollback(
            &self,
            _dbver: u64,
            text: &str,
        ) -> Result<(QueryUnit, usize), EdgeError> {
            let stmts = split_script(text);
            let Some(first) = stmts.first() else {
                return Err(EdgeError::BinaryProtocolError("empty query".into()));
            };
            let unit = compile_one(first);
            if !unit.tx_action.is_rollback_shaped() {
                return Err(EdgeError::InTxErrorRejection);
            }
            Ok((unit, stmts.len() - 1))
        }

        async fn interpret_backend_error(
            &self,
            _dbver: u64,
            fields: HashMap<u8, String>,
        ) -> EdgeError {
            let message = fields
                .get(&b'M')
                .cloned()
                .unwrap_or_else(|| "backend error".to_string());
            EdgeError::BackendError {
                code: crate::error::ErrorCode::BACKEND_ERROR,
                message,
                attributes: fields.into_iter().collect(),
            }
        }
    }
}
