use crate::{
    metrics::MetricsError,
    objective::SecondaryMetric,
    params::{parse_size, ParamMap, ParseError, Registry},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap, env, fs::File, io::Error, os::unix::fs::MetadataExt, path::Path,
    path::PathBuf, time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigError> {
    if !path.is_file() {
        Err(ConfigError::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigError::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse parameter: {0}")]
    Parse(#[from] ParseError),
    #[error("Unknown flag '{0}', parameters are keyed by program flag (e.g. executor_memory)")]
    UnknownFlag(String),
    #[error("Required flag '{0}' was not supplied")]
    MissingRequiredFlag(String),
    #[error("Flag '{0}' is still a range, a search value is required before running")]
    UnresolvedRange(String),
    #[error("Invalid scaling {scale} for {name} in [{min}, {max}]: {reason}")]
    InvalidScale {
        name: String,
        min: i64,
        max: i64,
        scale: i64,
        reason: String,
    },
    #[error("Value {value} of flag '{flag}' does not fit the search space")]
    OutOfSearchRange { flag: String, value: u64 },
    #[error("Invalid type for search space: flag '{0}' cannot be searched")]
    UnsupportedSearchKind(String),
    #[error("Invalid Spark master: {0}")]
    UnsupportedMaster(String),
    #[error("Failed to set up metrics collection")]
    Metrics(#[from] MetricsError),
    #[error("Failed to read config")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Failed to read parameter descriptions")]
    InvalidCsv(#[from] csv::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read file")]
    Io(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TunerConfig {
    pub spark: SparkConfig,
    // program flag -> point or range string, e.g. executor_memory: "1g,4g,512m"
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub objective: ObjectiveConfig,
    #[serde(default)]
    pub yarn: YarnConfig,
    // additional `name,default,meaning` CSV of parameter descriptions
    pub descriptions: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SparkConfig {
    #[serde(default = "default_spark_submit")]
    pub submit: PathBuf,
    pub jar: PathBuf,
    #[serde(default)]
    pub program_conf: String,
    // appended as is to every command
    #[serde(default)]
    pub fixed_params: String,
    // render the registry conf defaults (event log, shuffle service, ...) into every command
    #[serde(default)]
    pub conf_defaults: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub time_limit_secs: Option<f64>,
    // address space ceiling, e.g. "16g"
    pub memory_limit: Option<String>,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: None,
            memory_limit: None,
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl ExecutorConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs
            .filter(|secs| secs.is_finite())
            .map(Duration::from_secs_f64)
    }

    pub fn memory_limit(&self) -> Result<Option<u64>, ConfigError> {
        Ok(self
            .memory_limit
            .as_deref()
            .map(parse_size)
            .transpose()?)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ObjectiveConfig {
    #[serde(default = "default_rel_tol")]
    pub rel_tol: f64,
    #[serde(default)]
    pub abs_tol: f64,
    #[serde(default)]
    pub secondary: SecondaryMetric,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            rel_tol: default_rel_tol(),
            abs_tol: 0.0,
            secondary: SecondaryMetric::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct YarnConfig {
    // directory containing yarn-site.xml, falls back to YARN_CONF_DIR and HADOOP_CONF_DIR
    pub conf_dir: Option<PathBuf>,
    // skips yarn-site.xml discovery entirely
    #[serde(default, with = "optional_uri")]
    pub resource_manager: Option<http::Uri>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    // used for `yarn application -kill`
    #[serde(default = "default_yarn_cli")]
    pub cli: PathBuf,
}

impl Default for YarnConfig {
    fn default() -> Self {
        Self {
            conf_dir: None,
            resource_manager: None,
            request_timeout_secs: default_request_timeout(),
            cli: default_yarn_cli(),
        }
    }
}

impl YarnConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TunerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// apply `flag=value` overrides from the command line
    pub fn override_params<'a, I: IntoIterator<Item = &'a (String, String)>>(&mut self, overrides: I) {
        for (flag, value) in overrides {
            self.params.insert(flag.clone(), value.clone());
        }
    }

    /// the registry, extended with user descriptions if configured
    pub fn load_registry(&self) -> Result<Registry, ConfigError> {
        let mut registry = Registry::builtin()?;

        if let Some(ref path) = self.descriptions {
            registry.load_descriptions(File::open(path)?)?;
        }

        Ok(registry)
    }

    /// parse all params, collecting every error instead of stopping at the first
    pub fn load_params(&self, registry: &Registry) -> Result<ParamMap, Vec<(String, ConfigError)>> {
        let mut params = ParamMap::new();
        let mut errors = Vec::new();

        for (flag, raw) in self.params.iter() {
            match registry.parse(flag, raw) {
                Ok(param) => {
                    params.insert(flag.clone(), param);
                }
                Err(error) => errors.push((flag.clone(), error)),
            }
        }

        if errors.is_empty() {
            Ok(params)
        } else {
            Err(errors)
        }
    }

    /// the Spark master, quotes and all, as given by the user
    pub fn master(&self) -> Option<&str> {
        self.params.get("master").map(String::as_str)
    }

    pub fn preflight_checks(&self, registry: &Registry) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for flag in registry.required_flags() {
            if !self.params.contains_key(flag) {
                error!("params.{flag} is required but was not set");
                contains_error = true;
            }
        }

        if let Err(errors) = self.load_params(registry) {
            for (flag, error) in errors {
                error!("params.{flag} is invalid: {error}");
            }
            contains_error = true;
        }

        if !self.spark.jar.is_file() {
            error!(
                "Failed to find spark.jar. Either not a file or not found at {}",
                self.spark.jar.to_string_lossy()
            );
            contains_error = true;
        }

        // a bare `spark-submit` is resolved through PATH by the shell
        if self.spark.submit.components().count() > 1 {
            match check_executable(&self.spark.submit) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "spark.submit target {} is not executable",
                        self.spark.submit.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if spark.submit ({}) is an executable: {e}",
                        self.spark.submit.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if let Err(e) = self.executor.memory_limit() {
            error!("executor.memory_limit is invalid: {e}");
            contains_error = true;
        }

        if self.executor.sample_interval_ms == 0 {
            error!("executor.sample_interval_ms cannot be 0, sampling would spin");
            contains_error = true;
        }

        match self.executor.time_limit_secs {
            Some(limit) if limit <= 0.0 => {
                error!("executor.time_limit_secs must be positive");
                contains_error = true;
            }
            Some(limit) if limit.is_infinite() => {
                warn!("executor.time_limit_secs is infinite, runs will never be cut short");
            }
            _ => {}
        }

        if self.objective.rel_tol < 0.0 || self.objective.abs_tol < 0.0 {
            error!("objective tolerances cannot be negative");
            contains_error = true;
        }

        contains_error
    }
}

// http-serde only covers a bare `Uri`
mod optional_uri {
    use http::Uri;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapped(#[serde(with = "http_serde::uri")] Uri);

    pub fn serialize<S: Serializer>(uri: &Option<Uri>, serializer: S) -> Result<S::Ok, S::Error> {
        uri.as_ref()
            .map(|uri| Wrapped(uri.clone()))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Uri>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(uri)| uri))
    }
}

/// `$SPARK_HOME/bin/spark-submit`, or whatever `spark-submit` is on the PATH
pub fn default_spark_submit() -> PathBuf {
    env::var("SPARK_HOME")
        .map(|home| PathBuf::from(home).join("bin").join("spark-submit"))
        .unwrap_or_else(|_| PathBuf::from("spark-submit"))
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_rel_tol() -> f64 {
    0.06
}

fn default_request_timeout() -> u64 {
    30
}

fn default_yarn_cli() -> PathBuf {
    PathBuf::from(crate::metrics::yarn::YARN_CLI)
}
