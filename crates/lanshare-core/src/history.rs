// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Share history
//
// Append-only log of local share actions. Lives only as long as the process.

use crate::types::HistoryEntry;
use std::sync::{PoisonError, RwLock};

/// In-memory history of share actions, oldest first
#[derive(Default)]
pub struct ShareHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl ShareHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action with the current time
    pub fn record(&self, description: impl Into<String>) -> HistoryEntry {
        let entry = HistoryEntry {
            description: description.into(),
            timestamp: chrono::Utc::now(),
        };
        tracing::debug!("History: {}", entry.description);

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        entry
    }

    /// Get all entries
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
