mod item;
mod state;

pub use item::{Actor, ItemId, ItemKind, Resolution, TaskItem};
pub use state::ItemState;
