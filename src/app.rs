//! Wires store, retry engine, dispatcher and scheduler from a config.

use std::sync::Arc;

use anyhow::Result;

use crate::audit::AuditLog;
use crate::config::{HitlConfig, JobKind};
use crate::error::StoreError;
use crate::pipeline::{DecisionAgent, Dispatcher, Executor, LoggingExecutor, RuleAgent};
use crate::retry::RetryEngine;
use crate::scheduler::{Job, Scheduler};
use crate::state_machine::{Actor, ItemId, ItemState, TaskItem};
use crate::store::ItemStore;
use crate::watcher::{DropFolderSource, SourceWatcher};

pub struct App {
    pub config: HitlConfig,
    pub audit: Arc<AuditLog>,
    pub store: Arc<ItemStore>,
    pub retry: Arc<RetryEngine>,
    pub dispatcher: Arc<Dispatcher>,
}

impl App {
    /// Opens with the built-in agent and stub executor.
    pub fn open(config: HitlConfig) -> Result<Self> {
        Self::with_collaborators(config, Arc::new(RuleAgent), Arc::new(LoggingExecutor))
    }

    pub fn with_collaborators(
        config: HitlConfig,
        agent: Arc<dyn DecisionAgent>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let audit = Arc::new(AuditLog::open(&config.audit_dir())?);
        let store = Arc::new(
            ItemStore::open(&config.items_dir(), audit.clone())?.with_retry_cap(config.retry.max_attempts),
        );
        let retry = Arc::new(RetryEngine::new(config.retry.policy(), store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            retry.clone(),
            config.approval.clone(),
            agent,
            executor,
            config.call_timeout(),
        ));
        Ok(Self {
            config,
            audit,
            store,
            retry,
            dispatcher,
        })
    }

    /// Builds the scheduler with every configured job.
    pub fn scheduler(&self) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new(self.audit.clone(), self.config.tick_interval());
        for job in &self.config.jobs {
            let task = match job.kind {
                JobKind::DropFolder => {
                    let source = DropFolderSource::new(&job.folder(&self.config.home));
                    Job::Watch(Arc::new(SourceWatcher::new(
                        job.id.clone(),
                        Box::new(source),
                        self.store.clone(),
                    )))
                }
                JobKind::Dispatch => Job::Dispatch(self.dispatcher.clone()),
                JobKind::RetrySweep => Job::RetrySweep(self.retry.clone()),
                JobKind::StatusSnapshot => Job::StatusSnapshot(self.store.clone()),
                JobKind::AuditDigest => Job::AuditDigest {
                    audit: self.audit.clone(),
                    window: chrono::Duration::days(7),
                },
            };
            scheduler.add(job.id.clone(), job.schedule()?, task, job.enabled);
        }
        Ok(scheduler)
    }

    /// Human sign-off on a Pending item.
    pub fn approve(&self, id: &ItemId, reason: &str) -> Result<TaskItem, StoreError> {
        self.store
            .transition(id, ItemState::Pending, ItemState::Approved, Actor::Human, reason)
    }

    /// Human refusal; Rejected is terminal.
    pub fn reject(&self, id: &ItemId, reason: &str) -> Result<TaskItem, StoreError> {
        self.store
            .transition(id, ItemState::Pending, ItemState::Rejected, Actor::Human, reason)
    }

    /// Manual relocation; still subject to the transition graph. Moves out
    /// of Error go through the retry engine so its cap and the unrecoverable
    /// marking still apply.
    pub fn move_item(&self, id: &ItemId, to: ItemState, reason: &str) -> Result<TaskItem, StoreError> {
        let current = self.store.get(id)?;
        match (current.state, to) {
            (ItemState::Error, ItemState::Inbound) => self.retry.retry_now(id, Actor::Human),
            (ItemState::Error, ItemState::Done) => self.retry.mark_unrecoverable(id, reason, Actor::Human),
            _ => self.store.request_transition(id, to, Actor::Human, reason),
        }
    }

    /// Re-enters an Error item now, ignoring the backoff delay.
    pub fn retry_now(&self, id: &ItemId) -> Result<TaskItem, StoreError> {
        self.retry.retry_now(id, Actor::Human)
    }

    /// Gives up on an Error item; it lands in Done as unrecoverable.
    pub fn abandon(&self, id: &ItemId, reason: &str) -> Result<TaskItem, StoreError> {
        self.retry.mark_unrecoverable(id, reason, Actor::Human)
    }
}
