pub mod process;
pub mod yarn;

use crate::config::{ConfigError, YarnConfig};
use serde::Serialize;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("No metrics were collected for process {0}")]
    UnknownProcess(i32),
    #[error("The YARN application id of the run is unknown")]
    MissingApplicationId,
    #[error("Resource manager request failed")]
    Request(#[from] reqwest::Error),
    #[error("Cannot parse content-type {0}")]
    ContentType(String),
    #[error("Invalid resource manager address")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("No RM address in yarn-site.xml")]
    MissingAddress,
    #[error("No yarn-site.xml found, set YARN_CONF_DIR or HADOOP_CONF_DIR")]
    MissingYarnSite,
    #[error("Resource manager high availability is not supported, set yarn.resource_manager instead")]
    HighAvailability,
    #[error("Cannot reach RM server at {0}")]
    Unreachable(String),
    #[error("Failed to read yarn-site.xml")]
    Io(#[from] std::io::Error),
}

/// Where Spark runs the application, which decides how it is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Master {
    Local,
    Yarn,
}

impl FromStr for Master {
    type Err = ConfigError;

    /// `"local[*]"` -> Local, `yarn` -> Yarn, everything else is rejected
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw
            .split('[')
            .next()
            .unwrap_or_default()
            .replace('"', "");

        match normalized.trim() {
            "local" => Ok(Self::Local),
            "yarn" => Ok(Self::Yarn),
            _ => Err(ConfigError::UnsupportedMaster(raw.to_string())),
        }
    }
}

impl fmt::Display for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Yarn => "yarn",
        })
    }
}

/// What a collector needs to know about a running program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// process (and process group) id of the launched shell
    pub pid: i32,
    pub application_id: Option<String>,
}

impl ProcessHandle {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            application_id: None,
        }
    }
}

/// Resource usage of a single run
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PerfMetrics {
    /// allocated memory integral in megabyte-seconds
    pub memory_seconds: f64,
    /// allocated cpu integral in vcore-seconds
    pub vcore_seconds: f64,
    /// elapsed time as seen by the collector
    pub elapsed: Duration,
}

impl PerfMetrics {
    /// average allocated memory in megabytes
    pub fn average_memory(&self, seconds: f64) -> f64 {
        crate::objective::ratio(self.memory_seconds, seconds)
    }

    /// average allocated vcores
    pub fn average_vcores(&self, seconds: f64) -> f64 {
        crate::objective::ratio(self.vcore_seconds, seconds)
    }
}

/// All collector variants, chosen once per session from the Spark master
/// (no dynamic dispatch, same as the executors)
#[derive(Debug)]
pub enum MetricsCollector {
    Process(process::ProcessMetrics),
    Yarn(yarn::YarnMetrics),
}

impl MetricsCollector {
    pub fn load(master: Master, config: &YarnConfig) -> Result<Self, ConfigError> {
        info!("Collecting metrics for Spark master {master}");

        match master {
            Master::Local => Ok(Self::Process(process::ProcessMetrics::new())),
            Master::Yarn => Ok(Self::Yarn(yarn::YarnMetrics::load(config)?)),
        }
    }

    pub fn master(&self) -> Master {
        match self {
            Self::Process(_) => Master::Local,
            Self::Yarn(_) => Master::Yarn,
        }
    }

    pub fn start(&mut self, handle: &ProcessHandle) {
        match self {
            Self::Process(collector) => collector.start(handle.pid),
            // remote accounting is already cumulative
            Self::Yarn(_) => {}
        }
    }

    /// Take one sample. Blocks for `interval`, which makes this the clock
    /// of the run loop.
    pub fn update(&mut self, handle: &ProcessHandle, interval: Duration) {
        match self {
            Self::Process(collector) => collector.update(handle.pid, interval),
            Self::Yarn(_) => std::thread::sleep(interval),
        }
    }

    /// Ask the cluster to kill the application behind `handle`. `false` when
    /// there is nothing to kill remotely or the kill failed.
    pub fn kill_remote(&self, handle: &ProcessHandle, timeout: Duration) -> bool {
        match (self, handle.application_id.as_deref()) {
            (Self::Yarn(collector), Some(application_id)) => {
                collector.kill_application(application_id, timeout)
            }
            _ => false,
        }
    }

    pub fn get_perf_metrics(&mut self, handle: &ProcessHandle) -> Result<PerfMetrics, MetricsError> {
        let metrics = match self {
            Self::Process(collector) => collector.get_perf_metrics(handle.pid),
            Self::Yarn(collector) => collector.get_perf_metrics(
                handle
                    .application_id
                    .as_deref()
                    .ok_or(MetricsError::MissingApplicationId)?,
            ),
        }?;

        debug!(pid = handle.pid, metrics = ?metrics, "Collected metrics");

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_normalization() {
        assert_eq!("local".parse::<Master>().unwrap(), Master::Local);
        assert_eq!("local[*]".parse::<Master>().unwrap(), Master::Local);
        assert_eq!("\"local[4]\"".parse::<Master>().unwrap(), Master::Local);
        assert_eq!("yarn".parse::<Master>().unwrap(), Master::Yarn);
        assert!(matches!(
            "mesos://host:5050".parse::<Master>(),
            Err(ConfigError::UnsupportedMaster(_))
        ));
        assert!("".parse::<Master>().is_err());
    }

    #[test]
    fn local_collector_needs_no_cluster() {
        let collector = MetricsCollector::load(Master::Local, &YarnConfig::default()).unwrap();
        assert_eq!(collector.master(), Master::Local);
    }

    #[test]
    fn yarn_requires_application_id() {
        let mut collector = MetricsCollector::Yarn(
            yarn::YarnMetrics::new("http://127.0.0.1:1".parse().unwrap(), Duration::from_secs(1))
                .unwrap(),
        );

        assert!(matches!(
            collector.get_perf_metrics(&ProcessHandle::new(1)),
            Err(MetricsError::MissingApplicationId)
        ));
    }

    #[test]
    fn remote_kill_needs_yarn_and_an_id() {
        let local = MetricsCollector::Process(process::ProcessMetrics::new());
        let yarn = MetricsCollector::Yarn(
            yarn::YarnMetrics::new("http://127.0.0.1:1".parse().unwrap(), Duration::from_secs(1))
                .unwrap()
                .with_cli("/bin/true"),
        );
        let mut handle = ProcessHandle::new(1);

        assert!(!yarn.kill_remote(&handle, Duration::from_secs(5)));

        handle.application_id = Some("application_1_0001".to_string());
        assert!(yarn.kill_remote(&handle, Duration::from_secs(5)));
        assert!(!local.kill_remote(&handle, Duration::from_secs(5)));
    }

    #[test]
    fn averages_are_zero_safe() {
        let metrics = PerfMetrics {
            memory_seconds: 300.0,
            vcore_seconds: 0.0,
            elapsed: Duration::from_secs(3),
        };

        assert_eq!(metrics.average_memory(3.0), 100.0);
        assert_eq!(metrics.average_memory(0.0), f64::INFINITY);
        assert!(metrics.average_vcores(0.0).is_nan());
    }
}
