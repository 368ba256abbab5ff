//! Terminal output: colored tables and the demo spinner.
//!
//! Uses `console` for styling and `indicatif` for the spinner.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audit::{AuditDigest, AuditRecord};
use crate::scheduler::JobStatus;
use crate::state_machine::{ItemState, TaskItem};
use crate::status::StatusSummary;

fn state_style(state: ItemState) -> Style {
    match state {
        ItemState::Done => Style::new().green(),
        ItemState::Error | ItemState::Rejected => Style::new().red(),
        ItemState::Pending | ItemState::Approved => Style::new().yellow(),
        ItemState::Inbound | ItemState::InProgress => Style::new().cyan(),
    }
}

/// One line per item: id, state, category, retries and any error.
pub fn print_items(items: &[TaskItem]) {
    if items.is_empty() {
        println!("  {}", Style::new().dim().apply_to("(no items)"));
        return;
    }
    for item in items {
        let mut line = format!(
            "  {:<36}  {:<11}  {:<14}  retries={}",
            item.id.to_string(),
            state_style(item.state).apply_to(item.state.to_string()),
            item.kind.to_string(),
            item.retry_count
        );
        if item.is_unrecoverable() {
            line.push_str(&format!("  {}", Style::new().red().bold().apply_to("UNRECOVERABLE")));
        }
        if let Some(err) = &item.last_error {
            line.push_str(&format!("  last_error=\"{err}\""));
        }
        println!("{line}");
    }
}

/// Full item record followed by its audit history.
pub fn print_item(item: &TaskItem, history: &[AuditRecord]) {
    println!(
        "{}",
        serde_json::to_string_pretty(item).unwrap_or_default()
    );
    println!();
    println!("{}", Style::new().bold().apply_to("─── History ───"));
    print_audit(history);
}

/// Audit records oldest first.
pub fn print_audit(records: &[AuditRecord]) {
    let dim = Style::new().dim();
    for record in records {
        let subject = record.item_id().map(|id| id.to_string()).unwrap_or_default();
        println!(
            "  {}  {:<22}  {:<22}  {}  {}",
            dim.apply_to(record.timestamp.format("%Y-%m-%d %H:%M:%S")),
            record.label(),
            record.actor.to_string(),
            subject,
            dim.apply_to(&record.reason)
        );
    }
}

/// Per-event counts for a window of the ledger.
pub fn print_digest(digest: &AuditDigest) {
    let bold = Style::new().bold();
    println!();
    println!(
        "{} {} records between {} and {}",
        bold.apply_to("Summary:"),
        digest.total,
        digest.from.format("%Y-%m-%d %H:%M"),
        digest.to.format("%Y-%m-%d %H:%M")
    );
    for (label, n) in &digest.by_event {
        println!("  {label:<22} {n}");
    }
    if !digest.failures.is_empty() {
        println!("  {} {}", Style::new().red().apply_to("failures:"), digest.failures.len());
    }
}

/// Item counts per state, then the job table when one is given.
pub fn print_status(summary: &StatusSummary, jobs: &[JobStatus]) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to("Items"));
    for (state, n) in &summary.by_state {
        println!("  {:<12} {n}", state_style(*state).apply_to(state.to_string()));
    }
    println!("  {:<12} {}", "total", summary.total);
    println!();
    println!("  awaiting human: {}", Style::new().yellow().apply_to(summary.awaiting_human));
    println!("  unrecoverable:  {}", Style::new().red().apply_to(summary.unrecoverable));

    if !jobs.is_empty() {
        println!();
        println!("{}", bold.apply_to("Jobs"));
        for job in jobs {
            let flag = if job.enabled { Style::new().green().apply_to("on ") } else { Style::new().dim().apply_to("off") };
            let next = job
                .next_due
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {flag} {:<16} {:<24} next {next}", job.id, job.schedule);
        }
    }
}

/// Spinner that narrates the demo walk-through.
pub struct DemoProgress {
    /// Spinner shown while a step is in flight.
    pb: ProgressBar,
    /// Completed steps.
    green: Style,
    /// Failed or rejected steps.
    red: Style,
    /// Steps still on their way.
    yellow: Style,
}

impl DemoProgress {
    /// Starts the spinner with `title` as its message.
    pub fn start(title: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(title.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Replaces the spinner message.
    pub fn working(&self, msg: &str) {
        self.pb.set_message(msg.to_string());
    }

    /// Prints a completed step showing the item's new state.
    pub fn step(&self, item: &TaskItem, note: &str) {
        let marker = match item.state {
            ItemState::Done if !item.is_unrecoverable() => self.green.apply_to("✓"),
            ItemState::Error | ItemState::Rejected => self.red.apply_to("✗"),
            _ => self.yellow.apply_to("→"),
        };
        self.pb.println(format!(
            "  {marker} {:<11} {note}",
            state_style(item.state).apply_to(item.state.to_string())
        ));
    }

    /// Clears the spinner and prints the final verdict.
    pub fn finish(&self, ok: bool, msg: &str) {
        self.pb.finish_and_clear();
        if ok {
            println!("  {} {msg}", self.green.apply_to("✓"));
        } else {
            println!("  {} {msg}", self.red.apply_to("✗"));
        }
    }
}
