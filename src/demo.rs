//! Built-in walk-through: one large payment from creation to Done.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::app::App;
use crate::config::HitlConfig;
use crate::error::ActionError;
use crate::pipeline::{ExecutionFailure, Executor, RuleAgent};
use crate::state_machine::{ItemKind, ItemState, TaskItem};
use crate::store::MANUAL_ORIGIN;
use crate::ui::{print_audit, DemoProgress};

/// Fails the first call with a transient error, then succeeds.
#[derive(Default)]
struct FlakyGateway {
    tripped: AtomicBool,
}

#[async_trait]
impl Executor for FlakyGateway {
    async fn execute(&self, item: &TaskItem) -> Result<(), ExecutionFailure> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(ActionError::Transient("payment gateway returned 503".into()).into());
        }
        tracing::info!(item_id = %item.id, "payment sent");
        Ok(())
    }
}

pub async fn run(home: &Path) -> Result<()> {
    let config = HitlConfig {
        home: home.to_path_buf(),
        ..HitlConfig::default()
    };
    let app = App::with_collaborators(config, Arc::new(RuleAgent), Arc::new(FlakyGateway::default()))?;
    let progress = DemoProgress::start("creating payment of 150.00");

    let id = app
        .store
        .create(ItemKind::Payment, json!({"amount": 150, "vendor": "ACME"}), MANUAL_ORIGIN)?;
    progress.step(&app.store.get(&id)?, "payment created");

    progress.working("dispatching");
    app.dispatcher.dispatch().await?;
    progress.step(&app.store.get(&id)?, "amount over 100; waiting for a human");

    app.approve(&id, "demo approval")?;
    progress.step(&app.store.get(&id)?, "approved by human");

    progress.working("executing");
    app.dispatcher.dispatch().await?;
    let errored = app.store.get(&id)?;
    progress.step(&errored, "gateway failed; retry scheduled");

    if let Some(at) = errored.next_retry_at {
        progress.working("waiting for backoff");
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
    }
    app.retry.sweep(Utc::now())?;
    progress.step(&app.store.get(&id)?, "retry 1 re-entered the pipeline");

    progress.working("executing");
    app.dispatcher.dispatch().await?;
    let done = app.store.get(&id)?;
    progress.step(&done, "executed on retry");

    let ok = done.state == ItemState::Done && !done.is_unrecoverable();
    progress.finish(ok, &format!("item {id} finished in {}", done.state));
    println!();
    print_audit(&app.audit.replay(&id)?);

    if !ok {
        bail!("demo ended in unexpected state {}", done.state);
    }
    Ok(())
}
