use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::{ItemId, ItemState};

#[derive(Debug, Error)]
pub enum HitlError {
    #[error("Invalid calendar expression: {0}")]
    Cron(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Action failed: {0}")]
    Action(#[from] ActionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

/// Failures raised by the item store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    /// Compare-and-swap lost: the item moved underneath the caller.
    /// Callers re-read and decide again; this never consumes retry budget.
    #[error("Conflict on item {id}: expected {expected}, found {actual}")]
    Conflict {
        id: ItemId,
        expected: ItemState,
        actual: ItemState,
    },

    #[error("Invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: ItemId,
        from: ItemState,
        to: ItemState,
    },

    /// Error -> Inbound refused: the item has used its whole retry budget.
    #[error("Item {id} has used all {max_attempts} retries")]
    RetriesExhausted { id: ItemId, max_attempts: u32 },

    #[error("Item store lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Failure reported by an external collaborator (decision agent, executor, source).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum ActionError {
    /// Network trouble or timeout. Retryable.
    #[error("transient: {0}")]
    Transient(String),
    /// Credential or permission failure. Never retried.
    #[error("auth: {0}")]
    Auth(String),
    /// Validation or logic failure. Routed to a human.
    #[error("policy: {0}")]
    Policy(String),
}

impl ActionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ActionError::Transient(_) => ErrorClass::Transient,
            ActionError::Auth(_) => ErrorClass::Auth,
            ActionError::Policy(_) => ErrorClass::Policy,
        }
    }
}

/// Classifies a failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Auth,
    Policy,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Auth => write!(f, "Auth"),
            ErrorClass::Policy => write!(f, "Policy"),
        }
    }
}
