use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hitlflow::app::App;
use hitlflow::audit::AuditDigest;
use hitlflow::cli::{Cli, Command};
use hitlflow::config::HitlConfig;
use hitlflow::state_machine::{ItemId, ItemKind, ItemState};
use hitlflow::status::StatusSummary;
use hitlflow::store::MANUAL_ORIGIN;
use hitlflow::{demo, ui};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = HitlConfig::load(cli.config.as_deref())?;
    if let Some(home) = cli.home {
        config.home = home;
    }

    if let Command::Demo = cli.command {
        let scratch = std::env::temp_dir().join(format!("hitlflow-demo-{}", uuid::Uuid::new_v4()));
        let result = demo::run(&scratch).await;
        let _ = std::fs::remove_dir_all(&scratch);
        return result;
    }

    let app = App::open(config)?;

    match cli.command {
        Command::Run => {
            let scheduler = app.scheduler()?;
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("cannot listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
        }
        Command::Create { kind, payload } => {
            let payload = serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let id = app.store.create(ItemKind::from(kind.as_str()), payload, MANUAL_ORIGIN)?;
            println!("{id}");
        }
        Command::List {
            state,
            unrecoverable,
            awaiting_human,
        } => {
            let items = if unrecoverable {
                app.store.unrecoverable()?
            } else if awaiting_human {
                app.store.awaiting_human()?
            } else if let Some(state) = state {
                app.store.list(ItemState::from(state))?
            } else {
                app.store.list_all()?
            };
            ui::print_items(&items);
        }
        Command::Show { id } => {
            let id = ItemId::from(id);
            let item = app.store.get(&id)?;
            ui::print_item(&item, &app.audit.replay(&id)?);
        }
        Command::Approve { id, reason } => {
            let item = app.approve(&ItemId::from(id), &reason)?;
            ui::print_items(&[item]);
        }
        Command::Reject { id, reason } => {
            let item = app.reject(&ItemId::from(id), &reason)?;
            ui::print_items(&[item]);
        }
        Command::Retry { id } => {
            let item = app.retry_now(&ItemId::from(id))?;
            ui::print_items(&[item]);
        }
        Command::Abandon { id, reason } => {
            let item = app.abandon(&ItemId::from(id), &reason)?;
            ui::print_items(&[item]);
        }
        Command::Move { id, to, reason } => {
            let item = app.move_item(&ItemId::from(id), ItemState::from(to), &reason)?;
            ui::print_items(&[item]);
        }
        Command::Status => {
            let summary = StatusSummary::project(&app.store.list_all()?);
            let scheduler = app.scheduler()?;
            ui::print_status(&summary, &scheduler.jobs());
        }
        Command::Audit { since_days } => {
            let to = Utc::now();
            let (records, from) = match since_days {
                Some(days) => {
                    let from = to - chrono::Duration::days(i64::from(days));
                    (app.audit.since(from)?, from)
                }
                None => {
                    let records = app.audit.records()?;
                    let from = records.first().map(|r| r.timestamp).unwrap_or(to);
                    (records, from)
                }
            };
            ui::print_audit(&records);
            ui::print_digest(&AuditDigest::build(&records, from, to));
        }
        Command::Demo => {}
    }
    Ok(())
}
