//! Moves Inbound and Approved items forward.
//!
//! Every external call (decision agent, executor) happens on a snapshot with
//! no store lock held and under a timeout. The follow-up move is a
//! compare-and-swap against the state the snapshot was taken in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::approval::{evaluate, GateDecision, ThresholdTable};
use crate::error::{ActionError, StoreError};
use crate::retry::RetryEngine;
use crate::state_machine::{Actor, ItemState, TaskItem};
use crate::store::{ItemStore, TransitionRequest};

/// What the decision agent wants done with an Inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Execute,
    RequireApproval { reason: String },
    Fail(ActionError),
}

#[async_trait]
pub trait DecisionAgent: Send + Sync {
    async fn decide(&self, item: &TaskItem) -> Result<Decision, ActionError>;
}

/// Executor failure. `payment_started` reports that money may have moved.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub error: ActionError,
    pub payment_started: bool,
}

impl From<ActionError> for ExecutionFailure {
    fn from(error: ActionError) -> Self {
        Self {
            error,
            payment_started: false,
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, item: &TaskItem) -> Result<(), ExecutionFailure>;
}

/// Executes anything with a structured payload.
pub struct RuleAgent;

#[async_trait]
impl DecisionAgent for RuleAgent {
    async fn decide(&self, item: &TaskItem) -> Result<Decision, ActionError> {
        if item.payload.is_object() {
            Ok(Decision::Execute)
        } else {
            Ok(Decision::Fail(ActionError::Policy(format!(
                "{} payload must be an object",
                item.kind
            ))))
        }
    }
}

/// Stub executor: records the action and reports success.
pub struct LoggingExecutor;

#[async_trait]
impl Executor for LoggingExecutor {
    async fn execute(&self, item: &TaskItem) -> Result<(), ExecutionFailure> {
        tracing::info!(item_id = %item.id, kind = %item.kind, "executing (stub)");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub completed: usize,
    pub held: usize,
    pub failed: usize,
    pub conflicts: usize,
}

enum Outcome {
    Completed,
    Held,
    Failed,
}

pub struct Dispatcher {
    store: Arc<ItemStore>,
    retry: Arc<RetryEngine>,
    table: ThresholdTable,
    agent: Arc<dyn DecisionAgent>,
    executor: Arc<dyn Executor>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ItemStore>,
        retry: Arc<RetryEngine>,
        table: ThresholdTable,
        agent: Arc<dyn DecisionAgent>,
        executor: Arc<dyn Executor>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            retry,
            table,
            agent,
            executor,
            call_timeout,
        }
    }

    /// One pass over Inbound then Approved items.
    pub async fn dispatch(&self) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        for item in self.store.list(ItemState::Inbound)? {
            let outcome = self.process_inbound(item).await;
            self.tally(&mut report, outcome, "dispatch")?;
        }
        for item in self.store.list(ItemState::Approved)? {
            let outcome = self.execute(item).await;
            self.tally(&mut report, outcome, "execute approved")?;
        }
        Ok(report)
    }

    fn tally(
        &self,
        report: &mut DispatchReport,
        outcome: Result<Outcome, StoreError>,
        operation: &str,
    ) -> Result<(), StoreError> {
        match outcome {
            Ok(Outcome::Completed) => report.completed += 1,
            Ok(Outcome::Held) => report.held += 1,
            Ok(Outcome::Failed) => report.failed += 1,
            Err(e) if e.is_conflict() => {
                report.conflicts += 1;
                self.store.record_abandoned(Actor::DecisionAgent, &e, operation);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn process_inbound(&self, item: TaskItem) -> Result<Outcome, StoreError> {
        let decision = match timeout(self.call_timeout, self.agent.decide(&item)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(error)) => Decision::Fail(error),
            Err(_) => Decision::Fail(ActionError::Transient(format!(
                "decision agent timed out after {}s",
                self.call_timeout.as_secs_f64()
            ))),
        };

        match decision {
            Decision::Fail(error) => self.fail(&item, error, false),
            Decision::RequireApproval { reason } => self.hold(&item, reason),
            Decision::Execute => {
                let gate = evaluate(&item.kind, &item.payload, &self.table);
                if gate == GateDecision::RequireHuman && !item.has_standing_approval() {
                    self.hold(&item, format!("{} requires human approval", item.kind))
                } else {
                    self.execute(item).await
                }
            }
        }
    }

    async fn execute(&self, item: TaskItem) -> Result<Outcome, StoreError> {
        let result = match timeout(self.call_timeout, self.executor.execute(&item)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionFailure::from(ActionError::Transient(format!(
                "executor timed out after {}s",
                self.call_timeout.as_secs_f64()
            )))),
        };

        match result {
            Ok(()) => {
                self.store.apply(
                    &item.id,
                    TransitionRequest::new(item.state, ItemState::Done, Actor::DecisionAgent, "executed"),
                )?;
                Ok(Outcome::Completed)
            }
            Err(failure) => self.fail(&item, failure.error, failure.payment_started),
        }
    }

    fn hold(&self, item: &TaskItem, reason: String) -> Result<Outcome, StoreError> {
        self.store.apply(
            &item.id,
            TransitionRequest::new(ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, reason),
        )?;
        Ok(Outcome::Held)
    }

    fn fail(&self, item: &TaskItem, error: ActionError, payment_started: bool) -> Result<Outcome, StoreError> {
        let after = self.retry.fail(item, error, Actor::DecisionAgent, payment_started)?;
        Ok(if after.state == ItemState::Pending {
            Outcome::Held
        } else {
            Outcome::Failed
        })
    }
}
