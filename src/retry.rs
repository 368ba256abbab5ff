//! Retry engine: owns items in the Error state.
//!
//! Delay before attempt `n + 1` is `min(base_wait * multiplier^n, max_wait)`
//! where `n` is the item's `retry_count`. Auth failures and items flagged as
//! payment actions never retry. Policy failures wait for a human.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActionError, StoreError};
use crate::state_machine::{Actor, ItemId, ItemState, TaskItem};
use crate::store::{ItemStore, TransitionRequest};

/// Retry settings as they appear in `hitlflow.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_wait_secs")]
    pub base_wait_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_wait_secs() -> f64 {
    2.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_wait_secs() -> f64 {
    16.0
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_wait_secs: default_base_wait_secs(),
            multiplier: default_multiplier(),
            max_wait_secs: default_max_wait_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_wait: Duration::from_secs_f64(self.base_wait_secs.max(0.0)),
            multiplier: self.multiplier.max(1.0),
            max_wait: Duration::from_secs_f64(self.max_wait_secs.max(0.0)),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_wait: Duration,
    pub multiplier: f64,
    pub max_wait: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Wait before the retry that follows `retry_count` earlier retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_wait.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_wait.as_secs_f64() {
            self.max_wait
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What to do with an item that failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enter Inbound after `delay`, consuming attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Give up; the item goes to Done with its error kept.
    Unrecoverable { reason: String },
    /// Park in Error until a human retries or abandons it.
    HoldForHuman,
}

impl RetryPolicy {
    pub fn decide(&self, item: &TaskItem, error: &ActionError) -> RetryDecision {
        if let ActionError::Auth(msg) = error {
            return RetryDecision::Unrecoverable {
                reason: format!("authentication failure: {msg}"),
            };
        }
        if item.payment_action {
            return RetryDecision::Unrecoverable {
                reason: "payment action already started; not retrying".to_string(),
            };
        }
        if let ActionError::Policy(_) = error {
            return RetryDecision::HoldForHuman;
        }
        if item.retry_count >= self.max_attempts {
            return RetryDecision::Unrecoverable {
                reason: format!("max retries ({}) exceeded", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            attempt: item.retry_count + 1,
            delay: self.delay_for(item.retry_count),
        }
    }
}

/// Outcome of one pass over the Error state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub retried: Vec<ItemId>,
    pub unrecoverable: Vec<ItemId>,
    pub waiting: usize,
    pub held: usize,
    pub conflicts: usize,
}

pub struct RetryEngine {
    policy: RetryPolicy,
    store: Arc<ItemStore>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, store: Arc<ItemStore>) -> Self {
        Self { policy, store }
    }

    /// The backoff and cap this engine applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Routes a failed item out of the state it was observed in.
    ///
    /// `observed` is the snapshot the caller acted on; the move is a
    /// compare-and-swap against its state. Policy failures on Inbound items go
    /// to Pending for human review; everything else enters Error, and goes
    /// straight on to Done when the failure can never be retried.
    pub fn fail(
        &self,
        observed: &TaskItem,
        error: ActionError,
        actor: Actor,
        payment_started: bool,
    ) -> Result<TaskItem, StoreError> {
        if matches!(error, ActionError::Policy(_)) && observed.state == ItemState::Inbound {
            return self.store.apply(
                &observed.id,
                TransitionRequest::new(
                    ItemState::Inbound,
                    ItemState::Pending,
                    actor,
                    format!("held for review: {error}"),
                )
                .flag_payment_action(payment_started),
            );
        }

        let mut projected = observed.clone();
        projected.payment_action |= payment_started;
        let decision = self.policy.decide(&projected, &error);

        let mut req = TransitionRequest::new(observed.state, ItemState::Error, actor, error.to_string())
            .with_error(error.clone())
            .flag_payment_action(payment_started);
        if let RetryDecision::Retry { attempt, delay } = &decision {
            let delay_chrono = chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::weeks(52));
            req = req.retry_at(Utc::now() + delay_chrono);
            tracing::warn!(
                item_id = %observed.id,
                attempt,
                max = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "{error}; retry scheduled"
            );
        }
        let errored = self.store.apply(&observed.id, req)?;

        match decision {
            RetryDecision::Unrecoverable { reason } => self.give_up(&errored, &reason, Actor::RetryEngine),
            RetryDecision::Retry { .. } | RetryDecision::HoldForHuman => Ok(errored),
        }
    }

    /// Re-enters due items, gives up on exhausted ones. Conflicts are
    /// recorded and skipped; they cost the item nothing.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        for item in self.store.list(ItemState::Error)? {
            let error = item
                .last_error
                .clone()
                .unwrap_or_else(|| ActionError::Transient("unknown failure".into()));
            let result = match self.policy.decide(&item, &error) {
                RetryDecision::HoldForHuman => {
                    report.held += 1;
                    continue;
                }
                RetryDecision::Retry { attempt, .. } => {
                    if item.next_retry_at.is_some_and(|at| now < at) {
                        report.waiting += 1;
                        continue;
                    }
                    self.reenter(&item, attempt, Actor::RetryEngine)
                        .map(|item| report.retried.push(item.id))
                }
                RetryDecision::Unrecoverable { reason } => self
                    .give_up(&item, &reason, Actor::RetryEngine)
                    .map(|item| report.unrecoverable.push(item.id)),
            };
            if let Err(e) = result {
                if !e.is_conflict() {
                    return Err(e);
                }
                report.conflicts += 1;
                self.store.record_abandoned(Actor::RetryEngine, &e, "retry sweep");
            }
        }
        Ok(report)
    }

    /// Human-requested retry: ignores the backoff delay but not the cap or
    /// the non-retryable classes.
    pub fn retry_now(&self, id: &ItemId, actor: Actor) -> Result<TaskItem, StoreError> {
        let item = self.store.get(id)?;
        if item.state != ItemState::Error {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected: ItemState::Error,
                actual: item.state,
            });
        }
        let error = item
            .last_error
            .clone()
            .unwrap_or_else(|| ActionError::Transient("unknown failure".into()));
        match self.policy.decide(&item, &error) {
            RetryDecision::Unrecoverable { reason } => self.give_up(&item, &reason, actor),
            RetryDecision::Retry { attempt, .. } => self.reenter(&item, attempt, actor),
            // A human may override a policy hold; it still spends an attempt.
            RetryDecision::HoldForHuman if item.retry_count < self.policy.max_attempts => {
                self.reenter(&item, item.retry_count + 1, actor)
            }
            RetryDecision::HoldForHuman => self.give_up(
                &item,
                &format!("max retries ({}) exceeded", self.policy.max_attempts),
                actor,
            ),
        }
    }

    /// Marks an Error item as permanently failed.
    pub fn mark_unrecoverable(
        &self,
        id: &ItemId,
        reason: &str,
        actor: Actor,
    ) -> Result<TaskItem, StoreError> {
        let item = self.store.get(id)?;
        self.give_up(&item, reason, actor)
    }

    fn reenter(&self, item: &TaskItem, attempt: u32, actor: Actor) -> Result<TaskItem, StoreError> {
        tracing::info!(item_id = %item.id, attempt, max = self.policy.max_attempts, "retrying item");
        self.store.apply(
            &item.id,
            TransitionRequest::new(
                ItemState::Error,
                ItemState::Inbound,
                actor,
                format!("retry {attempt}/{}", self.policy.max_attempts),
            ),
        )
    }

    fn give_up(&self, item: &TaskItem, reason: &str, actor: Actor) -> Result<TaskItem, StoreError> {
        tracing::error!(item_id = %item.id, "unrecoverable: {reason}");
        self.store.apply(
            &item.id,
            TransitionRequest::new(ItemState::Error, ItemState::Done, actor, format!("unrecoverable: {reason}"))
                .unrecoverable(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::state_machine::ItemKind;
    use serde_json::json;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<ItemStore>, RetryEngine) {
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit")).unwrap());
        let store = Arc::new(ItemStore::open(&dir.path().join("items"), audit).unwrap().with_retry_cap(3));
        let engine = RetryEngine::new(RetryConfig::default().policy(), store.clone());
        (store, engine)
    }

    fn transient() -> ActionError {
        ActionError::Transient("connection reset".into())
    }

    #[test]
    fn exponential_backoff_with_cap() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(16));
    }

    #[test]
    fn decision_table() {
        let policy = RetryConfig::default().policy();
        let mut item = TaskItem::new(ItemKind::Email, json!({}), "gmail");

        assert_eq!(
            policy.decide(&item, &transient()),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(&item, &ActionError::Policy("bad".into())),
            RetryDecision::HoldForHuman
        );
        assert!(matches!(
            policy.decide(&item, &ActionError::Auth("401".into())),
            RetryDecision::Unrecoverable { .. }
        ));

        item.retry_count = 3;
        assert!(matches!(
            policy.decide(&item, &transient()),
            RetryDecision::Unrecoverable { .. }
        ));
    }

    #[test]
    fn payment_action_overrides_remaining_budget() {
        let policy = RetryConfig::default().policy();
        let mut item = TaskItem::new(ItemKind::Payment, json!({"amount": 5}), "odoo");
        item.payment_action = true;
        assert!(matches!(
            policy.decide(&item, &transient()),
            RetryDecision::Unrecoverable { .. }
        ));
    }

    #[test]
    fn successive_failures_use_growing_delays_then_give_up() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();

        let mut delays = Vec::new();
        for _ in 0..3 {
            let observed = store.get(&id).unwrap();
            let errored = engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();
            assert_eq!(errored.state, ItemState::Error);
            let wait = errored.next_retry_at.unwrap() - errored.updated_at;
            delays.push(wait.num_milliseconds());

            // Not yet due.
            let early = engine.sweep(errored.updated_at).unwrap();
            assert!(early.retried.is_empty());
            assert_eq!(early.waiting, 1);

            let report = engine.sweep(errored.next_retry_at.unwrap()).unwrap();
            assert_eq!(report.retried, vec![id.clone()]);
        }
        // Clocks are read a moment apart, so allow a little slack.
        for (got, want) in delays.iter().zip([2_000, 4_000, 8_000]) {
            assert!((*got - want).abs() < 500, "delay {got}ms, want {want}ms");
        }

        // Fourth failure: budget is spent.
        let observed = store.get(&id).unwrap();
        assert_eq!(observed.retry_count, 3);
        let done = engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();
        assert_eq!(done.state, ItemState::Done);
        assert!(done.is_unrecoverable());
        assert_eq!(done.last_error, Some(transient()));
        assert_eq!(done.retry_count, 3);

        let report = engine.sweep(Utc::now() + chrono::Duration::days(1)).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn auth_failure_skips_retry() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::SocialMention, json!({}), "twitter").unwrap();

        let observed = store.get(&id).unwrap();
        let item = engine
            .fail(&observed, ActionError::Auth("token revoked".into()), Actor::DecisionAgent, false)
            .unwrap();
        assert!(item.is_unrecoverable());
        assert_eq!(item.retry_count, 0);

        let labels: Vec<_> = store.audit().replay(&id).unwrap().iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["created", "INBOUND->ERROR", "ERROR->DONE"]);
    }

    #[test]
    fn started_payment_is_never_retried() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Payment, json!({"amount": 40}), "odoo").unwrap();

        let observed = store.get(&id).unwrap();
        let item = engine.fail(&observed, transient(), Actor::DecisionAgent, true).unwrap();
        assert!(item.is_unrecoverable());
        assert!(item.payment_action);
    }

    #[test]
    fn policy_failure_on_inbound_goes_to_review() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Invoice, json!("oops"), "odoo").unwrap();

        let observed = store.get(&id).unwrap();
        let item = engine
            .fail(&observed, ActionError::Policy("payload must be an object".into()), Actor::DecisionAgent, false)
            .unwrap();
        assert_eq!(item.state, ItemState::Pending);
    }

    #[test]
    fn held_items_wait_for_a_human() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Payment, json!({"amount": 150}), "odoo").unwrap();
        store
            .transition(&id, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "gate")
            .unwrap();
        let approved = store
            .transition(&id, ItemState::Pending, ItemState::Approved, Actor::Human, "ok")
            .unwrap();
        engine
            .fail(&approved, ActionError::Policy("unknown vendor".into()), Actor::DecisionAgent, false)
            .unwrap();

        let report = engine.sweep(Utc::now() + chrono::Duration::hours(1)).unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(store.get(&id).unwrap().state, ItemState::Error);

        let item = engine.retry_now(&id, Actor::Human).unwrap();
        assert_eq!(item.state, ItemState::Inbound);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn manual_retry_respects_cap() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        for _ in 0..3 {
            let observed = store.get(&id).unwrap();
            engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();
            engine.retry_now(&id, Actor::Human).unwrap();
        }
        let observed = store.get(&id).unwrap();
        let item = engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();
        assert!(item.is_unrecoverable());
        assert!(engine.retry_now(&id, Actor::Human).unwrap_err().is_conflict());
    }

    #[test]
    fn concurrent_sweeps_do_not_double_increment() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        let observed = store.get(&id).unwrap();
        let errored = engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();
        let due = errored.next_retry_at.unwrap();

        let barrier = Barrier::new(4);
        let reports: Vec<SweepReport> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        engine.sweep(due).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let retried: usize = reports.iter().map(|r| r.retried.len()).sum();
        assert_eq!(retried, 1);
        assert_eq!(store.get(&id).unwrap().retry_count, 1);
    }

    #[test]
    fn human_abandon_keeps_error() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = setup(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        let observed = store.get(&id).unwrap();
        engine.fail(&observed, transient(), Actor::DecisionAgent, false).unwrap();

        let item = engine.mark_unrecoverable(&id, "customer cancelled", Actor::Human).unwrap();
        assert!(item.is_unrecoverable());
        assert_eq!(item.last_error, Some(transient()));
        assert_eq!(store.unrecoverable().unwrap().len(), 1);
    }
}
