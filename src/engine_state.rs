// =============================================================================
// Engine State — error ring buffer + read-only snapshot rollup
// =============================================================================
//
// Two small ambient pieces, kept even without a dashboard to serve them to:
// a bounded ring buffer of recent failures (`push_error`/`MAX_RECENT_ERRORS`)
// so a failing control loop stays observable without scraping logs, and a
// serializable `EngineSnapshot` rollup (`StateSnapshot`/`build_snapshot`) so
// tests and any future introspection surface have one place to read the
// whole picture from.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::position_store::PositionStore;
use crate::types::{AccountSnapshot, Group, Position};

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// Bounded, thread-safe ring buffer of recent errors.
pub struct ErrorLog {
    recent: RwLock<Vec<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self {
            recent: RwLock::new(Vec::new()),
        }
    }

    pub fn push(&self, message: impl Into<String>) {
        self.push_with_code(message, None);
    }

    pub fn push_with_code(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut recent = self.recent.write();
        recent.push(record);
        while recent.len() > MAX_RECENT_ERRORS {
            recent.remove(0);
        }
    }

    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.recent.read().clone()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only rollup of everything the control plane currently knows. Not
/// wired to a dashboard — this crate has none — but kept as the natural
/// `Debug`/introspection surface and exercised by tests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub groups: Vec<Group>,
    pub recent_errors: Vec<ErrorRecord>,
}

pub fn build_snapshot(account: AccountSnapshot, store: &Arc<PositionStore>, errors: &ErrorLog) -> EngineSnapshot {
    let positions = store.positions();
    let groups: Vec<Group> = positions
        .iter()
        .filter_map(|p| p.group_id)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .filter_map(|id| store.group(id))
        .collect();

    EngineSnapshot {
        account,
        positions,
        groups,
        recent_errors: errors.recent(),
    }
}
