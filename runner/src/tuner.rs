use crate::{
    command::CommandBuilder,
    config::{ConfigError, SparkConfig},
    executors::{ExecutorError, LocalExecutor, RunResult},
    objective::{ratio, MinimizeTimeAndResource},
    params::{ParamMap, Registry, Scalar, ScaledIntegerParameter, Value},
};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs::File,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// flag -> value in search domain units
pub type Candidate = BTreeMap<String, Scalar>;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Failed to run the program")]
    Executor(#[from] ExecutorError),
    #[error("Flag '{0}' is not part of the search space")]
    UnknownCandidate(String),
    #[error("Value {value} for flag '{flag}' is outside of the search space")]
    InvalidCandidate { flag: String, value: Scalar },
    #[error("Failed to write the final configuration")]
    Output(#[from] io::Error),
    #[error("Failed to serialize the final configuration")]
    Serialize(#[from] serde_json::Error),
}

/// One searchable dimension, keyed by external flag
#[derive(Debug, Clone, PartialEq)]
pub enum SearchParameter {
    Integer { flag: String, min: i64, max: i64 },
    /// memory, searched through the scaling adapter
    ScaledInteger {
        flag: String,
        adapter: ScaledIntegerParameter,
    },
    Boolean { flag: String },
}

impl SearchParameter {
    pub fn flag(&self) -> &str {
        match self {
            Self::Integer { flag, .. }
            | Self::ScaledInteger { flag, .. }
            | Self::Boolean { flag } => flag,
        }
    }

    /// inclusive bounds in search domain units, `None` for booleans
    pub fn legal_range(&self) -> Option<(i64, i64)> {
        match self {
            Self::Integer { min, max, .. } => Some((*min, *max)),
            Self::ScaledInteger { adapter, .. } => Some(adapter.legal_range()),
            Self::Boolean { .. } => None,
        }
    }

    pub fn search_space_size(&self) -> u64 {
        match self {
            Self::Integer { min, max, .. } => max.abs_diff(*min) + 1,
            Self::ScaledInteger { adapter, .. } => adapter.search_space_size(),
            Self::Boolean { .. } => 2,
        }
    }

    /// Turn a search domain value into the value the parameter is rendered with
    pub fn to_true_domain(&self, value: &Scalar) -> Result<Scalar, TunerError> {
        let invalid = || TunerError::InvalidCandidate {
            flag: self.flag().to_string(),
            value: value.clone(),
        };

        match (self, value) {
            (Self::Boolean { .. }, Scalar::Boolean(_)) => Ok(value.clone()),
            (Self::Integer { min, max, .. }, Scalar::Integer(integer))
                if (*min..=*max).contains(integer) =>
            {
                Ok(value.clone())
            }
            (Self::ScaledInteger { adapter, .. }, Scalar::Integer(integer)) => {
                let (low, high) = adapter.legal_range();

                if (low.min(high)..=low.max(high)).contains(integer) {
                    Ok(Scalar::Integer(adapter.to_true_domain(*integer)))
                } else {
                    Err(invalid())
                }
            }
            _ => Err(invalid()),
        }
    }

    /// the start of the range, in search domain units
    pub fn initial(&self) -> Scalar {
        match self {
            Self::Integer { min, .. } => Scalar::Integer(*min),
            Self::ScaledInteger { adapter, .. } => Scalar::Integer(adapter.legal_range().0),
            Self::Boolean { .. } => Scalar::Boolean(false),
        }
    }
}

fn bound(flag: &str, value: u64) -> Result<i64, ConfigError> {
    i64::try_from(value).map_err(|_| ConfigError::OutOfSearchRange {
        flag: flag.to_string(),
        value,
    })
}

/// The searchable dimensions of every ranged parameter
pub fn search_space(params: &ParamMap) -> Result<Vec<SearchParameter>, ConfigError> {
    params
        .iter()
        .filter(|(_, param)| param.is_range())
        .map(|(flag, param)| {
            let search = match *param.value() {
                Value::IntegerRange { start, end } => SearchParameter::Integer {
                    flag: flag.clone(),
                    min: bound(flag, start)?,
                    max: bound(flag, end)?,
                },
                Value::MemoryRange { start, end, scale } => SearchParameter::ScaledInteger {
                    flag: flag.clone(),
                    adapter: ScaledIntegerParameter::new(
                        flag.as_str(),
                        bound(flag, start)?,
                        bound(flag, end)?,
                        bound(flag, scale)?,
                    )?,
                },
                Value::BooleanToggle => SearchParameter::Boolean { flag: flag.clone() },
                _ => return Err(ConfigError::UnsupportedSearchKind(flag.clone())),
            };

            info!(
                "Added config: {flag}: legal range {:?}, search space size {}",
                search.legal_range(),
                search.search_space_size()
            );

            Ok(search)
        })
        .collect()
}

/// Drives the search, the strategy itself lives outside of this crate
pub trait SearchEngine {
    /// next configuration to try, `None` once the engine is done
    fn suggest(&mut self, space: &[SearchParameter]) -> Option<Candidate>;

    fn report(&mut self, candidate: &Candidate, result: &RunResult, objective: &MinimizeTimeAndResource);

    /// the program exited with an error for this candidate
    fn report_failure(&mut self, _candidate: &Candidate) {}
}

/// Evaluates candidate configurations of a Spark program
#[derive(Debug)]
pub struct Tuner<'a> {
    builder: CommandBuilder<'a>,
    params: ParamMap,
    space: Vec<SearchParameter>,
    spark: SparkConfig,
    objective: MinimizeTimeAndResource,
    executor: LocalExecutor,
}

impl<'a> Tuner<'a> {
    pub fn new(
        registry: &'a Registry,
        params: ParamMap,
        spark: SparkConfig,
        objective: MinimizeTimeAndResource,
        executor: LocalExecutor,
    ) -> Result<Self, ConfigError> {
        let builder = CommandBuilder::new(registry, spark.fixed_params.as_str());
        let builder = if spark.conf_defaults {
            builder.with_registry_conf_defaults()?
        } else {
            builder
        };
        let space = search_space(&params)?;

        debug!("Search space has {} dimensions", space.len());

        Ok(Self {
            builder,
            params,
            space,
            spark,
            objective,
            executor,
        })
    }

    pub fn search_space(&self) -> &[SearchParameter] {
        &self.space
    }

    pub fn objective(&self) -> &MinimizeTimeAndResource {
        &self.objective
    }

    /// every dimension at the start of its range
    pub fn initial_candidate(&self) -> Candidate {
        self.space
            .iter()
            .map(|search| (search.flag().to_string(), search.initial()))
            .collect()
    }

    /// the spark-submit command for a candidate
    pub fn command(&self, candidate: &Candidate) -> Result<String, TunerError> {
        let mut search = ParamMap::new();

        for (flag, value) in candidate {
            let dimension = self
                .space
                .iter()
                .find(|search| search.flag() == flag)
                .ok_or_else(|| TunerError::UnknownCandidate(flag.clone()))?;
            let value = dimension.to_true_domain(value)?;
            let param = self.params[dimension.flag()]
                .materialize(&value)
                .map_err(ConfigError::from)?;

            search.insert(flag.clone(), param);
        }

        Ok(self.builder.make_command(
            &self.params,
            &search,
            &self.spark.submit,
            &self.spark.jar,
            &self.spark.program_conf,
        )?)
    }

    /// Run the program once with a candidate configuration
    #[instrument(skip(self), level = "info")]
    pub fn run(&mut self, candidate: &Candidate) -> Result<RunResult, TunerError> {
        let command = self.command(candidate)?;
        info!("{command}");

        let result = self.executor.run(&command)?;
        debug!(result = ?result, "Run finished");

        if !result.timed_out && result.return_code != Some(0) {
            return Err(ExecutorError::NonZeroExit {
                code: result.return_code,
                stderr: result.stderr,
            }
            .into());
        }

        let seconds = result.metrics.elapsed.as_secs_f64();
        info!(
            "Application metrics: time={seconds:.3}s, mem={:.3}mb, vcores={:.3}",
            ratio(result.metrics.memory_seconds, seconds),
            ratio(result.metrics.vcore_seconds, seconds)
        );

        Ok(result)
    }

    /// Evaluate up to `trials` candidates from the engine and return the best one.
    /// Candidates whose program fails are reported to the engine and skipped.
    pub fn tune<E: SearchEngine>(
        &mut self,
        engine: &mut E,
        trials: usize,
    ) -> Result<Option<(Candidate, RunResult)>, TunerError> {
        let mut best: Option<(Candidate, RunResult)> = None;

        for trial in 0..trials {
            let Some(candidate) = engine.suggest(&self.space) else {
                debug!("Search engine finished after {trial} trials");
                break;
            };

            let result = match self.run(&candidate) {
                Ok(result) => result,
                Err(TunerError::Executor(ExecutorError::NonZeroExit { code, stderr })) => {
                    error!(code = ?code, stderr = %stderr, "Program failed for {candidate:?}");
                    engine.report_failure(&candidate);
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!("Trial {trial}: {}", self.objective.display(&result));
            engine.report(&candidate, &result, &self.objective);

            let improved = best.as_ref().map_or(true, |(_, current)| {
                self.objective.compare(&result, current) == Ordering::Less
            });

            if improved {
                best = Some((candidate, result));
            }
        }

        Ok(best)
    }
}

/// Write a candidate as `<dir>/<name>_final_config.json`
pub fn save_final_config(dir: &Path, name: &str, candidate: &Candidate) -> Result<PathBuf, TunerError> {
    let path = dir.join(format!("{name}_final_config.json"));
    info!("Writing final config to {}", path.to_string_lossy());

    serde_json::to_writer_pretty(File::create(&path)?, candidate)?;

    Ok(path)
}
