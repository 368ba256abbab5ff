//! Dashboard counters, recomputed from the store on every read.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ActionError;
use crate::state_machine::{ItemState, TaskItem};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub by_state: BTreeMap<ItemState, usize>,
    pub unrecoverable: usize,
    pub awaiting_human: usize,
}

impl StatusSummary {
    pub fn project(items: &[TaskItem]) -> Self {
        let mut by_state: BTreeMap<ItemState, usize> = ItemState::ALL.iter().map(|s| (*s, 0)).collect();
        let mut unrecoverable = 0;
        let mut awaiting_human = 0;

        for item in items {
            *by_state.entry(item.state).or_default() += 1;
            if item.is_unrecoverable() {
                unrecoverable += 1;
            }
            let held = item.state == ItemState::Error && matches!(item.last_error, Some(ActionError::Policy(_)));
            if item.state == ItemState::Pending || held {
                awaiting_human += 1;
            }
        }

        Self {
            total: items.len(),
            by_state,
            unrecoverable,
            awaiting_human,
        }
    }

    pub fn count(&self, state: ItemState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}
