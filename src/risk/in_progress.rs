//! Mutual-exclusion guard for per-symbol operations.
//!
//! An entry is inserted before an operation is dispatched and removed when
//! the returned guard drops, whatever the outcome.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Kind of operation held in the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    Close,
    Rebalance,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Open => write!(f, "open"),
            OperationKind::Close => write!(f, "close"),
            OperationKind::Rebalance => write!(f, "rebalance"),
        }
    }
}

type Entries = Arc<Mutex<HashSet<(String, OperationKind)>>>;

#[derive(Debug, Clone, Default)]
pub struct InProgressSet {
    entries: Entries,
}

impl InProgressSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(entries: &Entries) -> MutexGuard<'_, HashSet<(String, OperationKind)>> {
        entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `(symbol, kind)` unless already present.
    pub fn try_acquire(&self, symbol: &str, kind: OperationKind) -> Option<InProgressGuard> {
        let key = (symbol.to_string(), kind);
        if !Self::lock(&self.entries).insert(key.clone()) {
            return None;
        }
        Some(InProgressGuard {
            entries: Arc::clone(&self.entries),
            key,
        })
    }

    /// Whether any operation is running for `symbol`.
    pub fn is_busy(&self, symbol: &str) -> bool {
        Self::lock(&self.entries).iter().any(|(s, _)| s == symbol)
    }

    pub fn contains(&self, symbol: &str, kind: OperationKind) -> bool {
        Self::lock(&self.entries).contains(&(symbol.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry from the set on drop.
#[derive(Debug)]
pub struct InProgressGuard {
    entries: Entries,
    key: (String, OperationKind),
}

impl InProgressGuard {
    pub fn kind(&self) -> OperationKind {
        self.key.1
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        InProgressSet::lock(&self.entries).remove(&self.key);
    }
}
