//! Configuration loaded from `hitlflow.toml`.
//!
//! [`HitlConfig`] holds every tunable. Missing fields fall back to defaults,
//! so running without a file works. `HITLFLOW_HOME` takes precedence over
//! the file's `home`. Loaded once at startup and never reloaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::approval::ThresholdTable;
use crate::cron::CronSchedule;
use crate::retry::RetryConfig;
use crate::scheduler::Schedule;

pub const DEFAULT_CONFIG_FILE: &str = "hitlflow.toml";
pub const HOME_ENV: &str = "HITLFLOW_HOME";

#[derive(Debug, Clone, Deserialize)]
pub struct HitlConfig {
    /// Data directory: items, audit ledger and drop folders live here.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// How often the scheduler checks for due jobs.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Upper bound on any decision-agent or executor call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Replaces the built-in table entirely when present.
    #[serde(default)]
    pub approval: ThresholdTable,

    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobConfig>,
}

/// What a configured job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Watches a drop folder (`path`, relative to `home` unless absolute).
    DropFolder,
    Dispatch,
    RetrySweep,
    StatusSnapshot,
    AuditDigest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_home() -> PathBuf {
    PathBuf::from(".hitlflow")
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn interval_job(id: &str, kind: JobKind, every_secs: u64) -> JobConfig {
    JobConfig {
        id: id.to_string(),
        kind,
        every_secs: Some(every_secs),
        cron: None,
        enabled: true,
        path: None,
    }
}

// Cadence follows the production deployment this replaces.
fn default_jobs() -> Vec<JobConfig> {
    let mut inbox = interval_job("inbox", JobKind::DropFolder, 120);
    inbox.path = Some(PathBuf::from("inbox"));
    vec![
        inbox,
        interval_job("dispatch", JobKind::Dispatch, 30),
        interval_job("retry", JobKind::RetrySweep, 30),
        interval_job("status", JobKind::StatusSnapshot, 600),
        JobConfig {
            id: "weekly-digest".to_string(),
            kind: JobKind::AuditDigest,
            every_secs: None,
            cron: Some("0 8 * * mon".to_string()),
            enabled: true,
            path: None,
        },
    ]
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            tick_interval_secs: default_tick_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            retry: RetryConfig::default(),
            approval: ThresholdTable::default(),
            jobs: default_jobs(),
        }
    }
}

impl JobConfig {
    /// Exactly one of `every_secs` and `cron` must be set.
    pub fn schedule(&self) -> Result<Schedule> {
        match (self.every_secs, &self.cron) {
            (Some(0), None) => bail!("job '{}': every_secs must be positive", self.id),
            (Some(secs), None) => Ok(Schedule::Interval(Duration::from_secs(secs))),
            (None, Some(expr)) => Ok(Schedule::Calendar(CronSchedule::parse(expr)?)),
            (Some(_), Some(_)) => bail!("job '{}': set either every_secs or cron, not both", self.id),
            (None, None) => bail!("job '{}': needs every_secs or cron", self.id),
        }
    }

    /// Folder for drop-folder jobs.
    pub fn folder(&self, home: &Path) -> PathBuf {
        let path = self.path.clone().unwrap_or_else(|| PathBuf::from(&self.id));
        if path.is_absolute() { path } else { home.join(path) }
    }
}

impl HitlConfig {
    /// Loads `path` if it exists, else `hitlflow.toml` in the working
    /// directory, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<HitlConfig>(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Environment wins over the file.
        if let Ok(home) = std::env::var(HOME_ENV)
            && !home.is_empty()
        {
            config.home = PathBuf::from(home);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        for job in &self.jobs {
            if !ids.insert(job.id.as_str()) {
                bail!("duplicate job id '{}'", job.id);
            }
            job.schedule()?;
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn items_dir(&self) -> PathBuf {
        self.home.join("items")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.home.join("audit")
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{evaluate, GateDecision};
    use crate::state_machine::ItemKind;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = HitlConfig::default();
        assert_eq!(config.home, PathBuf::from(".hitlflow"));
        assert_eq!(config.call_timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.jobs.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            home = "/var/lib/hitlflow"

            [retry]
            max_attempts = 5

            [approval.payment]
            mode = "threshold"
            field = "amount"
            limit = 500.0
            inclusive = false

            [[jobs]]
            id = "gmail"
            kind = "drop_folder"
            every_secs = 120
            path = "gmail-drop"

            [[jobs]]
            id = "briefing"
            kind = "audit_digest"
            cron = "0 8 * * mon"
            enabled = false
        "#;
        let config: HitlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.home, PathBuf::from("/var/lib/hitlflow"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_wait_secs, 2.0);
        assert_eq!(config.tick_interval_secs, 1);
        assert_eq!(config.jobs.len(), 2);
        assert!(!config.jobs[1].enabled);
        assert!(matches!(config.jobs[0].schedule().unwrap(), Schedule::Interval(d) if d.as_secs() == 120));
        assert!(matches!(config.jobs[1].schedule().unwrap(), Schedule::Calendar(_)));
        assert_eq!(
            config.jobs[0].folder(&config.home),
            PathBuf::from("/var/lib/hitlflow/gmail-drop")
        );

        assert_eq!(
            evaluate(&ItemKind::Payment, &json!({"amount": 500}), &config.approval),
            GateDecision::RequireHuman
        );
        // Table replaced wholesale: categories not listed need a human.
        assert_eq!(
            evaluate(&ItemKind::Invoice, &json!({}), &config.approval),
            GateDecision::RequireHuman
        );
    }

    #[test]
    fn bad_schedules_are_rejected() {
        let both: HitlConfig = toml::from_str(
            r#"
            [[jobs]]
            id = "x"
            kind = "dispatch"
            every_secs = 10
            cron = "* * * * *"
            "#,
        )
        .unwrap();
        assert!(both.validate().is_err());

        let dup: HitlConfig = toml::from_str(
            r#"
            [[jobs]]
            id = "x"
            kind = "dispatch"
            every_secs = 10

            [[jobs]]
            id = "x"
            kind = "retry_sweep"
            every_secs = 10
            "#,
        )
        .unwrap();
        assert!(dup.validate().is_err());

        let cron: HitlConfig = toml::from_str(
            r#"
            [[jobs]]
            id = "x"
            kind = "dispatch"
            cron = "every monday"
            "#,
        )
        .unwrap();
        assert!(cron.validate().is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let tick: HitlConfig = toml::from_str("tick_interval_secs = 0").unwrap();
        assert!(tick.validate().is_err());

        let timeout: HitlConfig = toml::from_str("call_timeout_secs = 0").unwrap();
        let err = timeout.validate().unwrap_err();
        assert!(err.to_string().contains("call_timeout_secs"));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hitlflow.toml");
        std::fs::write(&path, "call_timeout_secs = 0\n").unwrap();
        assert!(HitlConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "call_timeout_secs = 5\n").unwrap();
        let config = HitlConfig::load(Some(&path)).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HitlConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
