use std::time::Duration;

use clap::Parser;

use jobq_core::QueueSettings;
use jobq_engine::{QueueConfig, SpawnMode};

fn parse_duration(input: &str) -> Result<Duration, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Some(millis) = raw.strip_suffix("ms") {
        let value: u64 = millis
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {input:?}"))?;
        return Ok(Duration::from_millis(value));
    }
    let secs = raw.strip_suffix('s').unwrap_or(raw).trim();
    let value: u64 = secs
        .parse()
        .map_err(|_| format!("invalid duration: {input:?}"))?;
    Ok(Duration::from_secs(value))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "jobq", version, about = "Dependency-aware job queue runner")]
pub struct Cli {
    /// Queries to submit; the run ends once all of them settle.
    #[arg(value_name = "QUERY", required = true)]
    pub queries: Vec<String>,

    /// Number of workers.
    #[arg(short = 'w', long, env = "JOBQ_WORKERS")]
    pub workers: Option<usize>,

    /// Worker heartbeat cadence (e.g. `5s`, `500ms`).
    #[arg(long, env = "JOBQ_HEARTBEAT_INTERVAL", value_parser = parse_duration)]
    pub heartbeat_interval: Option<Duration>,

    /// Silence threshold before a worker is declared dead.
    #[arg(long = "dead-timeout", env = "JOBQ_DEAD_TIMEOUT", value_parser = parse_duration)]
    pub dead_timeout: Option<Duration>,

    /// Per-job wall-clock budget; expiry cancels the job.
    #[arg(long, env = "JOBQ_JOB_TIMEOUT", value_parser = parse_duration)]
    pub job_timeout: Option<Duration>,

    /// Requeues allowed after worker loss before a job fails for good.
    #[arg(long, env = "JOBQ_MAX_REQUEUES")]
    pub max_requeues: Option<u32>,

    /// Run workers as OS subprocesses of this binary instead of
    /// in-process tasks.
    #[arg(long, env = "JOBQ_PROCESS_WORKERS", default_value_t = false)]
    pub process_workers: bool,

    /// Skip the final queue report.
    #[arg(long, default_value_t = false)]
    pub no_report: bool,
}

impl Cli {
    /// Settings file first, flags and env on top.
    pub fn queue_config(&self, settings: &QueueSettings, spawn: SpawnMode) -> QueueConfig {
        let mut cfg = QueueConfig::from_settings(settings, spawn);
        if let Some(workers) = self.workers {
            cfg.workers = workers;
        }
        if let Some(heartbeat_interval) = self.heartbeat_interval {
            cfg.heartbeat_interval = heartbeat_interval;
        }
        if let Some(dead_timeout) = self.dead_timeout {
            cfg.dead_worker_timeout = dead_timeout;
        }
        if let Some(job_timeout) = self.job_timeout {
            cfg.job_timeout = Some(job_timeout);
        }
        if let Some(max_requeues) = self.max_requeues {
            cfg.max_requeues = max_requeues;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_seconds_and_millis() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from(["jobq", "-w", "2", "--job-timeout", "30s", "Job0"]);
        let settings = QueueSettings::default();
        let cfg = cli.queue_config(
            &settings,
            SpawnMode::Subprocess {
                program: "jobq".into(),
                args: Vec::new(),
            },
        );
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.job_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            cfg.heartbeat_interval,
            Duration::from_secs(settings.heartbeat_interval_secs)
        );
    }
}
