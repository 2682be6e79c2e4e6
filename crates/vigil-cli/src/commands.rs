//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vigil_core::{
    Clock, FileBackend, LockStateMachine, PersistedState, SecurityStore, StateBackend,
    SystemClock, VigilConfig,
};

/// Vigil - session soft lock state tools
#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Inspect and reset persisted session security state")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the persisted security record
    Status {
        /// State file; defaults to the one named by the configuration
        #[arg(long)]
        state: Option<PathBuf>,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rehydrate the state, run one inactivity check and persist the result
    Check,

    /// Wipe the state on logout so the next user inherits nothing
    Clear,

    /// Write a configuration file with the observed defaults
    InitConfig {
        /// Output path
        #[arg(short, long)]
        out: PathBuf,

        /// How long code entry stays disabled after too many invalid codes
        #[arg(long)]
        lockout_window_secs: u64,

        /// Override the state file location
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

/// Run the CLI, returning the report to print
pub async fn run(cli: Cli) -> anyhow::Result<String> {
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Status { state, json } => {
            let state_path = match state {
                Some(path) => path,
                None => load_config(&config_path)?.state_path,
            };
            status(&state_path, json, SystemClock.now_ms())
        }
        Commands::Check => {
            let config = load_config(&config_path)?;
            check(&config, Arc::new(SystemClock)).await
        }
        Commands::Clear => {
            let config = load_config(&config_path)?;
            clear(&config, Arc::new(SystemClock)).await
        }
        Commands::InitConfig {
            out,
            lockout_window_secs,
            state,
        } => init_config(&out, lockout_window_secs, state),
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
        .join("config.json")
}

fn load_config(path: &Path) -> anyhow::Result<VigilConfig> {
    VigilConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn format_ms(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(at) => at.to_rfc3339(),
        None => format!("{} ms", ms),
    }
}

/// Describe the record at `state_path`
pub fn status(state_path: &Path, json: bool, now_ms: u64) -> anyhow::Result<String> {
    let backend = FileBackend::new(state_path);
    let Some(bytes) = backend.load()? else {
        return Ok(format!(
            "No security state at {} (next start is ACTIVE)",
            state_path.display()
        ));
    };

    let record = match PersistedState::decode(&bytes) {
        Ok(record) => record,
        Err(e) => {
            warn!("Unreadable security state: {}", e);
            return Ok(format!(
                "Security state at {} is unreadable and will fail closed (LOCKED): {}",
                state_path.display(),
                e
            ));
        }
    };

    if json {
        return Ok(serde_json::to_string_pretty(&record)?);
    }

    let mut out = String::new();
    out.push_str(&format!("Security state: {}\n", state_path.display()));
    out.push_str(&format!("  Schema version: {}\n", record.schema_version));
    out.push_str(&format!("  Phase: {:?}\n", record.lock_phase));
    out.push_str(&format!(
        "  Last active: {} ({}s ago)\n",
        format_ms(record.last_active_ms),
        now_ms.saturating_sub(record.last_active_ms) / 1000
    ));
    if record.failed_attempts.is_empty() && record.locked_until.is_empty() {
        out.push_str("  No failed code attempts");
    } else {
        out.push_str("  Code attempts:");
        let contexts = record
            .failed_attempts
            .keys()
            .chain(record.locked_until.keys())
            .collect::<std::collections::BTreeSet<_>>();
        for context in contexts {
            let failed = record.failed_attempts.get(context).copied().unwrap_or(0);
            out.push_str(&format!("\n    {}: {} failed", context, failed));
            if let Some(&until) = record.locked_until.get(context) {
                if now_ms < until {
                    out.push_str(&format!(", locked until {}", format_ms(until)));
                } else {
                    out.push_str(", lockout elapsed");
                }
            }
        }
    }
    Ok(out)
}

/// One inactivity evaluation against the configured state file
pub async fn check(config: &VigilConfig, clock: Arc<dyn Clock>) -> anyhow::Result<String> {
    let backend = Arc::new(FileBackend::new(&config.state_path));
    let store = SecurityStore::open(backend, clock.now_ms()).shared();
    let lock = LockStateMachine::new(store, clock, config.inactivity_threshold());

    let locked_now = lock.check().await?;
    let report = if locked_now {
        "Session idle past threshold: LOCKED".to_string()
    } else if lock.is_locked().await {
        "Session is LOCKED".to_string()
    } else {
        let idle_ms = lock.now_ms().saturating_sub(lock.last_active_ms().await);
        format!(
            "Session is ACTIVE ({}s idle, locks after {}s)",
            idle_ms / 1000,
            config.inactivity_threshold_secs
        )
    };
    Ok(report)
}

/// Logout teardown of the configured state file
pub async fn clear(config: &VigilConfig, clock: Arc<dyn Clock>) -> anyhow::Result<String> {
    let backend = Arc::new(FileBackend::new(&config.state_path));
    let store = SecurityStore::open(backend, clock.now_ms()).shared();
    let lock = LockStateMachine::new(store, clock, config.inactivity_threshold());
    lock.clear().await?;
    info!("Cleared {}", config.state_path.display());
    Ok(format!("Cleared security state at {}", config.state_path.display()))
}

/// Write a config file; the lockout window must be chosen explicitly
pub fn init_config(
    out: &Path,
    lockout_window_secs: u64,
    state: Option<PathBuf>,
) -> anyhow::Result<String> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    let mut config = VigilConfig::with_lockout_window(Duration::from_secs(lockout_window_secs));
    if let Some(state) = state {
        config.state_path = state;
    }
    config.validate()?;
    config.save(out)?;
    Ok(format!("Wrote configuration to {}", out.display()))
}
