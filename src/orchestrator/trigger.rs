//! Trigger loop: runs [`Orchestrator::run_once`] on a fixed interval or a
//! cron schedule until shut down or the vault disappears.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::Orchestrator;
use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, Error};

/// How often a sleeping loop looks at its shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

/// When the loop fires.
#[derive(Debug, Clone)]
pub enum TriggerSchedule {
    Interval(Duration),
    Cron(cron::Schedule),
}

impl TriggerSchedule {
    /// The cron schedule if one is configured, else the fixed interval.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        match &config.schedule {
            Some(expr) => Self::cron(expr),
            None => Ok(Self::Interval(config.interval)),
        }
    }

    pub fn cron(expr: &str) -> Result<Self, ConfigError> {
        cron::Schedule::from_str(expr)
            .map(Self::Cron)
            .map_err(|e| ConfigError::InvalidValue {
                key: "schedule".to_string(),
                message: format!("invalid cron: {e}"),
            })
    }

    /// Next fire time after `now`. `None` once a cron schedule is exhausted.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => chrono::TimeDelta::from_std(*every)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            Self::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// Time to wait from `now` until the next fire.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        if let Self::Interval(every) = self {
            return Some(*every);
        }
        self.next_fire(now)
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

impl std::fmt::Display for TriggerSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(every) => write!(f, "every {}s", every.as_secs()),
            Self::Cron(schedule) => write!(f, "cron '{schedule}'"),
        }
    }
}

/// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(SHUTDOWN_CHECK)).await;
    }
}

/// Spawn the trigger loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after
/// the current iteration. The handle resolves to the fatal error that
/// stopped the loop, if any.
pub fn spawn_trigger_loop(
    orchestrator: Arc<Orchestrator>,
    schedule: TriggerSchedule,
) -> (JoinHandle<Result<(), Error>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        match orchestrator.startup(Utc::now()).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Vault unavailable, trigger loop not started");
                return Err(e);
            }
            Err(e) => warn!(error = %e, "Startup recovery incomplete, continuing"),
        }
        info!(schedule = %schedule, "Trigger loop started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Trigger loop shutting down");
                return Ok(());
            }

            match orchestrator.run_once(Utc::now()).await {
                Ok(report) if !report.errors.is_empty() => {
                    warn!(iteration = %report.id, errors = ?report.errors, "Iteration finished with errors");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Vault unavailable, trigger loop stopping");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Iteration failed"),
            }

            let Some(delay) = schedule.next_delay(Utc::now()) else {
                info!(schedule = %schedule, "Schedule has no further fire times");
                return Ok(());
            };
            if wait_or_shutdown(delay, &shutdown).await {
                info!("Trigger loop shutting down");
                return Ok(());
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Liveness, OwnerId, OwnerProbe};
    use tempfile::TempDir;

    struct AlwaysAlive;

    impl OwnerProbe for AlwaysAlive {
        fn liveness(&self, _owner: &OwnerId) -> Liveness {
            Liveness::Alive
        }
    }

    #[test]
    fn interval_delay_is_fixed() {
        let schedule = TriggerSchedule::Interval(Duration::from_secs(30));
        assert_eq!(schedule.next_delay(Utc::now()), Some(Duration::from_secs(30)));
    }

    #[test]
    fn cron_delay_points_at_next_fire() {
        let schedule = TriggerSchedule::cron("0 * * * * *").unwrap();
        let now = Utc::now();
        let delay = schedule.next_delay(now).unwrap();
        assert!(delay <= Duration::from_secs(60));
        assert!(schedule.next_fire(now).unwrap() > now);
    }

    #[test]
    fn invalid_cron_is_a_config_error() {
        assert!(matches!(
            TriggerSchedule::cron("not a cron"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn config_prefers_schedule() {
        let mut config = OrchestratorConfig::default();
        assert!(matches!(
            TriggerSchedule::from_config(&config).unwrap(),
            TriggerSchedule::Interval(_)
        ));
        config.schedule = Some("0 */5 * * * *".to_string());
        assert!(matches!(
            TriggerSchedule::from_config(&config).unwrap(),
            TriggerSchedule::Cron(_)
        ));
    }

    #[tokio::test]
    async fn stops_on_shutdown_flag() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            vault_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let orch = Orchestrator::new(config, OwnerId::new("t", "h", 1), Arc::new(AlwaysAlive))
            .await
            .unwrap();
        let (handle, shutdown) =
            spawn_trigger_loop(Arc::new(orch), TriggerSchedule::Interval(Duration::from_secs(3600)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::Relaxed);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stops_when_vault_disappears() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vault");
        std::fs::create_dir(&root).unwrap();
        let config = OrchestratorConfig {
            vault_root: root.clone(),
            ..Default::default()
        };
        let orch = Orchestrator::new(config, OwnerId::new("t", "h", 1), Arc::new(AlwaysAlive))
            .await
            .unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let (handle, _shutdown) =
            spawn_trigger_loop(Arc::new(orch), TriggerSchedule::Interval(Duration::from_millis(10)));
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_fatal());
    }
}
