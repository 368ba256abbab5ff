use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a task item.
///
/// Allowed moves:
/// - INBOUND → PENDING | ERROR | DONE
/// - PENDING → APPROVED | REJECTED
/// - APPROVED → DONE | ERROR
/// - ERROR → INBOUND (retry) | DONE (unrecoverable)
///
/// `InProgress` is reserved for persisted records written by other tools;
/// no transition leads into or out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Inbound,
    Pending,
    Approved,
    Rejected,
    InProgress,
    Error,
    Done,
}

impl ItemState {
    pub const ALL: [ItemState; 7] = [
        ItemState::Inbound,
        ItemState::Pending,
        ItemState::Approved,
        ItemState::Rejected,
        ItemState::InProgress,
        ItemState::Error,
        ItemState::Done,
    ];

    /// Done and Rejected never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Rejected)
    }

    pub fn can_transition_to(self, to: ItemState) -> bool {
        matches!(
            (self, to),
            (ItemState::Inbound, ItemState::Pending)
                | (ItemState::Inbound, ItemState::Error)
                | (ItemState::Inbound, ItemState::Done)
                | (ItemState::Pending, ItemState::Approved)
                | (ItemState::Pending, ItemState::Rejected)
                | (ItemState::Approved, ItemState::Done)
                | (ItemState::Approved, ItemState::Error)
                | (ItemState::Error, ItemState::Inbound)
                | (ItemState::Error, ItemState::Done)
        )
    }

    /// Folder name used by the on-disk store.
    pub fn dir_name(self) -> &'static str {
        match self {
            ItemState::Inbound => "inbound",
            ItemState::Pending => "pending",
            ItemState::Approved => "approved",
            ItemState::Rejected => "rejected",
            ItemState::InProgress => "in_progress",
            ItemState::Error => "error",
            ItemState::Done => "done",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Inbound => write!(f, "INBOUND"),
            ItemState::Pending => write!(f, "PENDING"),
            ItemState::Approved => write!(f, "APPROVED"),
            ItemState::Rejected => write!(f, "REJECTED"),
            ItemState::InProgress => write!(f, "IN_PROGRESS"),
            ItemState::Error => write!(f, "ERROR"),
            ItemState::Done => write!(f, "DONE"),
        }
    }
}
