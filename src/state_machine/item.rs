use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::ItemState;
use crate::error::ActionError;

/// Unique, immutable identifier of a task item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of a task item. Anything a source reports that is not one of
/// the known categories is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemKind {
    Payment,
    Invoice,
    Email,
    SocialPost,
    SocialMention,
    Alert,
    Other(String),
}

impl ItemKind {
    pub fn as_str(&self) -> &str {
        match self {
            ItemKind::Payment => "payment",
            ItemKind::Invoice => "invoice",
            ItemKind::Email => "email",
            ItemKind::SocialPost => "social_post",
            ItemKind::SocialMention => "social_mention",
            ItemKind::Alert => "alert",
            ItemKind::Other(name) => name,
        }
    }
}

impl From<&str> for ItemKind {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "payment" => ItemKind::Payment,
            "invoice" => ItemKind::Invoice,
            "email" => ItemKind::Email,
            "social_post" => ItemKind::SocialPost,
            "social_mention" => ItemKind::SocialMention,
            "alert" => ItemKind::Alert,
            other => ItemKind::Other(other.to_string()),
        }
    }
}

impl From<String> for ItemKind {
    fn from(s: String) -> Self {
        ItemKind::from(s.as_str())
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who requested a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Actor {
    Human,
    DecisionAgent,
    RetryEngine,
    Scheduler,
    Watcher(String),
}

impl From<String> for Actor {
    fn from(s: String) -> Self {
        match s.as_str() {
            "human" => Actor::Human,
            "decision_agent" => Actor::DecisionAgent,
            "retry_engine" => Actor::RetryEngine,
            "scheduler" => Actor::Scheduler,
            other => Actor::Watcher(other.strip_prefix("watcher:").unwrap_or(other).to_string()),
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Human => write!(f, "human"),
            Actor::DecisionAgent => write!(f, "decision_agent"),
            Actor::RetryEngine => write!(f, "retry_engine"),
            Actor::Scheduler => write!(f, "scheduler"),
            Actor::Watcher(id) => write!(f, "watcher:{id}"),
        }
    }
}

/// How a Done item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    Unrecoverable,
}

/// A single unit of work flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub payload: Value,
    pub state: ItemState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Watcher (or "manual") that produced the item.
    pub origin: String,
    #[serde(default)]
    pub last_error: Option<ActionError>,
    /// Earliest moment the retry engine may re-enter the item.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set once a payment side effect may have happened; disables retry.
    #[serde(default)]
    pub payment_action: bool,
    /// Payload as it was when a human approved it.
    #[serde(default)]
    pub approved_payload: Option<Value>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl TaskItem {
    pub fn new(kind: ItemKind, payload: Value, origin: impl Into<String>) -> Self {
        let now = Utc::now();
        let payment_action = payload
            .get("payment_action")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            id: ItemId::generate(),
            kind,
            payload,
            state: ItemState::Inbound,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            origin: origin.into(),
            last_error: None,
            next_retry_at: None,
            payment_action,
            approved_payload: None,
            resolution: None,
        }
    }

    /// True when a human approved exactly the payload the item carries now.
    pub fn has_standing_approval(&self) -> bool {
        self.approved_payload.as_ref() == Some(&self.payload)
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.state == ItemState::Done && self.resolution == Some(Resolution::Unrecoverable)
    }
}
