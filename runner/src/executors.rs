pub mod local;

pub use local::LocalExecutor;

use crate::{
    config::{ConfigError, ExecutorConfig},
    metrics::{MetricsError, PerfMetrics},
};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to launch the program")]
    Spawn(#[source] std::io::Error),
    #[error("Failed while waiting for the program")]
    Wait(#[source] std::io::Error),
    #[error("Lost an output stream of the program")]
    OutputLost,
    #[error("Failed to collect metrics")]
    Metrics(#[from] MetricsError),
    // TODO: tell configuration failures apart from runs that ran out of resources
    #[error("Program exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// Finds the remote application id of a running program in the output it
/// wrote so far. Asked once per sample until it answers.
pub trait ApplicationIdSource: Send {
    fn application_id(&mut self, stdout: &str, stderr: &str) -> Option<String>;
}

impl<F> ApplicationIdSource for F
where
    F: FnMut(&str, &str) -> Option<String> + Send,
{
    fn application_id(&mut self, stdout: &str, stderr: &str) -> Option<String> {
        self(stdout, stderr)
    }
}

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    NotStarted,
    Running,
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    /// wall clock limit, checked once per sample
    pub time_limit: Option<Duration>,
    /// address space ceiling in bytes
    pub memory_limit: Option<u64>,
    pub sample_interval: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            time_limit: None,
            memory_limit: None,
            sample_interval: Duration::from_secs(1),
        }
    }
}

impl RunLimits {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            time_limit: config.time_limit(),
            memory_limit: config.memory_limit()?,
            sample_interval: config.sample_interval(),
        })
    }
}

/// Outcome of one run of a command
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// wall clock seconds, infinite if the run was killed for its time limit
    pub time: f64,
    pub timed_out: bool,
    /// `None` if the program was ended by a signal
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub metrics: PerfMetrics,
}

impl RunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.return_code == Some(0)
    }
}
