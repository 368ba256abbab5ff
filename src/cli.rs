//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (--config, --home, --verbose) and the
//! [`Command`] subcommands for running the scheduler and for human actions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::state_machine::ItemState;

/// hitlflow: human-in-the-loop task pipeline.
#[derive(Debug, Parser)]
#[command(name = "hitlflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the config file and HITLFLOW_HOME).
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Item state as accepted on the command line, mapped to [`ItemState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StateArg {
    Inbound,
    Pending,
    Approved,
    Rejected,
    InProgress,
    Error,
    Done,
}

impl From<StateArg> for ItemState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Inbound => ItemState::Inbound,
            StateArg::Pending => ItemState::Pending,
            StateArg::Approved => ItemState::Approved,
            StateArg::Rejected => ItemState::Rejected,
            StateArg::InProgress => ItemState::InProgress,
            StateArg::Error => ItemState::Error,
            StateArg::Done => ItemState::Done,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the scheduler until Ctrl-C.
    Run,

    /// Creates an item by hand.
    Create {
        /// Category, e.g. payment, invoice, email.
        #[arg(long = "type")]
        kind: String,

        /// Payload as a JSON document.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Lists items.
    List {
        #[arg(long)]
        state: Option<StateArg>,

        /// Only items that failed for good.
        #[arg(long, conflicts_with_all = ["state", "awaiting_human"])]
        unrecoverable: bool,

        /// Only items waiting on a person.
        #[arg(long, conflicts_with = "state")]
        awaiting_human: bool,
    },

    /// Shows one item and its audit history.
    Show { id: String },

    /// Approves a pending item.
    Approve {
        id: String,
        #[arg(long, default_value = "approved")]
        reason: String,
    },

    /// Rejects a pending item.
    Reject {
        id: String,
        #[arg(long)]
        reason: String,
    },

    /// Retries an item in ERROR now, spending one attempt.
    Retry { id: String },

    /// Gives up on an item in ERROR.
    Abandon {
        id: String,
        #[arg(long)]
        reason: String,
    },

    /// Moves an item to another state by hand.
    Move {
        id: String,
        to: StateArg,
        #[arg(long, default_value = "moved by hand")]
        reason: String,
    },

    /// Shows the dashboard counters.
    Status,

    /// Prints the audit ledger in time order.
    Audit {
        /// Only the last N days.
        #[arg(long)]
        since_days: Option<u32>,
    },

    /// Walks one payment through the whole pipeline in a scratch directory.
    Demo,
}
