//! Per-session database view: the transaction status machine, the
//! savepoint stack, the configuration overlay/alias map, and the
//! compiled-query cache's owner.
//!
//! State transitions follow the status-machine table exactly; the overlay
//! and alias maps are swapped wholesale on every change (see
//! `types::ConfigOverlay`), which is what makes capturing a savepoint frame
//! an `Arc::clone` rather than a deep copy.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::QueryCache;
use crate::error::EdgeError;
use crate::types::{AliasMap, ConfigOverlay, ConfigValue, QueryUnit, StagedUpdate, TxAction};

/// The transaction status machine's three states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    InTx,
    InTxError,
}

/// One saved stack frame, captured at `savepoint_declare` and restored by
/// `rollback_tx_to_savepoint`.
#[derive(Debug, Clone)]
struct SavepointFrame {
    savepoint_id: i64,
    saved_config: ConfigOverlay,
    saved_aliases: AliasMap,
}

pub struct DbView {
    status: TxStatus,
    savepoints: Vec<SavepointFrame>,
    config: ConfigOverlay,
    aliases: AliasMap,
    cache: QueryCache,
}

impl DbView {
    pub fn new(cache_capacity: usize) -> Self {
        DbView {
            status: TxStatus::Idle,
            savepoints: Vec::new(),
            config: Arc::new(HashMap::new()),
            aliases: Arc::new(HashMap::new()),
            cache: QueryCache::new(cache_capacity),
        }
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn config(&self) -> &ConfigOverlay {
        &self.config
    }

    pub fn aliases(&self) -> &AliasMap {
        &self.aliases
    }

    pub fn lookup_compiled_query(
        &mut self,
        text: &str,
        mode: crate::types::OutputMode,
    ) -> Option<Arc<QueryUnit>> {
        self.cache.lookup(text, mode)
    }

    pub fn cache_compiled_query(
        &mut self,
        text: String,
        mode: crate::types::OutputMode,
        unit: Arc<QueryUnit>,
    ) {
        self.cache.insert(text, mode, unit);
    }

    /// Whether `unit` may be reused from cache right now: the cache is
    /// consulted only outside `InTxError`, or when the cached unit is itself
    /// rollback-shaped.
    pub fn cache_is_usable_for(&self, unit: &QueryUnit) -> bool {
        self.status != TxStatus::InTxError || unit.tx_action.is_rollback_shaped()
    }

    /// Called immediately before executing `unit`. Rejects non-rollback
    /// units while the view is latched in error.
    pub fn start(&self, unit: &QueryUnit) -> Result<(), EdgeError> {
        if self.status == TxStatus::InTxError && !unit.tx_action.is_rollback_shaped() {
            return Err(EdgeError::InTxErrorRejection);
        }
        Ok(())
    }

    /// Called after the backend reports success for `unit`. Advances the
    /// state machine per the table above and applies any staged
    /// config/alias change.
    pub fn on_success(&mut self, unit: &QueryUnit) {
        match (self.status, unit.tx_action) {
            (TxStatus::Idle, TxAction::None) => {}
            (TxStatus::Idle, TxAction::Begin) => {
                self.status = TxStatus::InTx;
                self.savepoints.clear();
            }
            (TxStatus::InTx, TxAction::None) => {}
            (TxStatus::InTx, TxAction::Commit) | (TxStatus::InTx, TxAction::Rollback) => {
                self.status = TxStatus::Idle;
                self.savepoints.clear();
            }
            (TxStatus::InTx, TxAction::SavepointDeclare) => {
                if let Some(id) = unit.savepoint_id {
                    self.savepoints.push(SavepointFrame {
                        savepoint_id: id,
                        saved_config: Arc::clone(&self.config),
                        saved_aliases: Arc::clone(&self.aliases),
                    });
                }
            }
            (TxStatus::InTx, TxAction::SavepointRelease) => {
                if let Some(id) = unit.savepoint_id {
                    self.truncate_savepoints_through(id);
                }
            }
            (TxStatus::InTx, TxAction::SavepointRollback) => {
                if let Some(id) = unit.savepoint_id {
                    let _ = self.rollback_tx_to_savepoint(id);
                }
            }
            (TxStatus::InTxError, TxAction::Commit) | (TxStatus::InTxError, TxAction::Rollback) => {
                self.status = TxStatus::Idle;
                self.savepoints.clear();
            }
            (TxStatus::InTxError, TxAction::SavepointRollback) => {
                if let Some(id) = unit.savepoint_id {
                    let _ = self.rollback_tx_to_savepoint(id);
                }
            }
            _ => {}
        }

        if let Some(update) = &unit.staged_update {
            self.apply_staged_update(update);
        }
    }

    fn apply_staged_update(&mut self, update: &StagedUpdate) {
        match update {
            StagedUpdate::Config(key, value) => {
                let mut next = (*self.config).clone();
                next.insert(key.clone(), value.clone());
                self.config = Arc::new(next);
            }
            StagedUpdate::Alias(module, target) => {
                let mut next = (*self.aliases).clone();
                next.insert(module.clone(), target.clone());
                self.aliases = Arc::new(next);
            }
        }
    }

    /// Called after the backend reports failure executing `unit`.
    pub fn on_error(&mut self, _unit: &QueryUnit) {
        if self.status == TxStatus::InTx {
            self.status = TxStatus::InTxError;
        }
    }

    /// Called when a failure occurred outside the narrow `on_error` window
    /// (e.g. during encoding) while a transaction was active.
    pub fn tx_error(&mut self) {
        if self.status == TxStatus::InTx {
            self.status = TxStatus::InTxError;
        }
    }

    /// The "failed COMMIT" workaround: invoked when the backend's observed
    /// transaction status disagrees with the view's own bookkeeping and
    /// shows the transaction has already ended.
    pub fn abort_tx(&mut self) {
        self.status = TxStatus::Idle;
        self.savepoints.clear();
    }

    /// Pops stack frames until `savepoint_id` is on top (inclusive),
    /// restores its saved config/alias maps, and clears the error latch.
    /// Popping past an unknown id is an error.
    pub fn rollback_tx_to_savepoint(&mut self, savepoint_id: i64) -> Result<(), EdgeError> {
        let idx = self
            .savepoints
            .iter()
            .position(|f| f.savepoint_id == savepoint_id)
            .ok_or_else(|| {
                EdgeError::InternalServerError(format!("unknown savepoint id {savepoint_id}"))
            })?;
        let frame = self.savepoints[idx].clone();
        self.savepoints.truncate(idx + 1);
        self.config = frame.saved_config;
        self.aliases = frame.saved_aliases;
        self.status = TxStatus::InTx;
        Ok(())
    }

    /// Release: truncate the stack including the target frame, with no
    /// restore, with no snapshot to go back to.
    fn truncate_savepoints_through(&mut self, savepoint_id: i64) {
        if let Some(idx) = self
            .savepoints
            .iter()
            .position(|f| f.savepoint_id == savepoint_id)
        {
            self.savepoints.truncate(idx);
        }
    }

    pub fn raise_in_tx_error(&self) -> EdgeError {
        EdgeError::InTxErrorRejection
    }

    pub fn set_config(&mut self, key: String, value: ConfigValue) {
        let mut next = (*self.config).clone();
        next.insert(key, value);
        self.config = Arc::new(next);
    }

    pub fn set_alias(&mut self, module: String, target: String) {
        let mut next = (*self.aliases).clone();
        next.insert(module, target);
        self.aliases = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn unit(action: TxAction, savepoint_id: Option<i64>) -> QueryUnit {
        QueryUnit {
            input_type_id: [0; 16],
            input_type_descriptor: Bytes::new(),
            output_type_id: [0; 16],
            output_type_descriptor: Bytes::new(),
            sql: Bytes::new(),
            prepared_stmt_hash: None,
            cacheable: false,
            tx_action: action,
            savepoint_id,
            staged_update: None,
        }
    }

    #[test]
    fn begin_transitions_idle_to_in_tx() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        assert_eq!(view.status(), TxStatus::InTx);
    }

    #[test]
    fn error_inside_tx_latches_in_tx_error_and_rejects_non_rollback() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        view.on_error(&unit(TxAction::None, None));
        assert_eq!(view.status(), TxStatus::InTxError);
        assert!(view.start(&unit(TxAction::None, None)).is_err());
        assert!(view.start(&unit(TxAction::Rollback, None)).is_ok());
    }

    #[test]
    fn rollback_clears_the_latch_and_returns_to_idle() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        view.on_error(&unit(TxAction::None, None));
        view.on_success(&unit(TxAction::Rollback, None));
        assert_eq!(view.status(), TxStatus::Idle);
    }

    #[test]
    fn savepoint_declare_then_rollback_restores_config_snapshot() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        view.set_config("k".into(), ConfigValue::Int(1));
        view.on_success(&unit(TxAction::SavepointDeclare, Some(7)));
        view.set_config("k".into(), ConfigValue::Int(2));
        view.on_error(&unit(TxAction::None, None));
        assert_eq!(view.status(), TxStatus::InTxError);

        view.rollback_tx_to_savepoint(7).unwrap();
        assert_eq!(view.status(), TxStatus::InTx);
        assert_eq!(view.config().get("k"), Some(&ConfigValue::Int(1)));
    }

    #[test]
    fn rollback_to_unknown_savepoint_is_an_error() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        assert!(view.rollback_tx_to_savepoint(999).is_err());
    }

    #[test]
    fn abort_tx_drops_the_stack_and_returns_to_idle() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        view.on_success(&unit(TxAction::SavepointDeclare, Some(1)));
        view.abort_tx();
        assert_eq!(view.status(), TxStatus::Idle);
        assert!(view.rollback_tx_to_savepoint(1).is_err());
    }

    #[test]
    fn cache_is_unusable_for_non_rollback_units_while_in_tx_error() {
        let mut view = DbView::new(10);
        view.on_success(&unit(TxAction::Begin, None));
        view.on_error(&unit(TxAction::None, None));
        assert!(!view.cache_is_usable_for(&unit(TxAction::None, None)));
        assert!(view.cache_is_usable_for(&unit(TxAction::Rollback, None)));
    }
}
