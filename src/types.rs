//! Shared data types: the compiled query unit and the small enums that
//! describe how it interacts with the transaction state machine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

/// A 16-byte type identifier, as produced by the compiler's type descriptor
/// encoder and echoed back to the client on the wire.
pub type TypeId = [u8; 16];

/// A typed configuration value stored in the session configuration overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Immutable, atomically-swappable session configuration overlay.
pub type ConfigOverlay = Arc<HashMap<String, ConfigValue>>;

/// Immutable, atomically-swappable module alias map. The empty-string key
/// denotes the default module.
pub type AliasMap = Arc<HashMap<String, String>>;

/// The output encoding a compiled query unit's result rows use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputMode {
    /// Binary protocol rows, as used by `Parse`/`Execute`/`O`.
    Binary,
    /// A single JSON array, as used by the legacy script entrypoint (`L`).
    Json,
    /// JSON output produced from a GraphQL-mode legacy script.
    JsonGraphQl,
}

/// How a simple-query script should be compiled: `SkipFirst` is used by the
/// error-recovery path once `try_compile_rollback` has already consumed the
/// leading rollback statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementMode {
    Normal,
    SkipFirst,
}

/// The transactional classification of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    None,
    Begin,
    Commit,
    Rollback,
    SavepointDeclare,
    SavepointRelease,
    SavepointRollback,
}

impl TxAction {
    /// True for the only units admissible while the view is in `InTxError`.
    pub fn is_rollback_shaped(self) -> bool {
        matches!(self, TxAction::Rollback | TxAction::SavepointRollback)
    }
}

/// A single setting or alias change staged by a config-affecting unit,
/// applied by the dbview on `on_success`.
#[derive(Debug, Clone)]
pub enum StagedUpdate {
    Config(String, ConfigValue),
    Alias(String, String),
}

/// The compiler's output for one statement.
///
/// Immutable after construction; either owned by the dbview's compiled-query
/// cache (if `cacheable`) or held by the session as the last anonymous
/// compiled unit.
#[derive(Debug, Clone)]
pub struct QueryUnit {
    pub input_type_id: TypeId,
    pub input_type_descriptor: Bytes,
    pub output_type_id: TypeId,
    pub output_type_descriptor: Bytes,
    /// Executable SQL for this unit; empty for units with nothing to send
    /// to the backend (pure no-ops after `try_compile_rollback` recovery).
    pub sql: Bytes,
    /// Hash identifying a reusable prepared statement on the backend
    /// connection, if this unit was deemed worth preparing.
    pub prepared_stmt_hash: Option<u64>,
    pub cacheable: bool,
    pub tx_action: TxAction,
    /// The savepoint id this unit declares (for `SavepointDeclare`) or
    /// targets (for `SavepointRelease` / `SavepointRollback`).
    pub savepoint_id: Option<i64>,
    /// A single setting/alias change this unit stages on success, if it is
    /// config-affecting.
    pub staged_update: Option<StagedUpdate>,
}

impl QueryUnit {
    pub fn is_config_affecting(&self) -> bool {
        self.staged_update.is_some()
    }
}
