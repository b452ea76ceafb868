use super::{Parameter, ParamKind};
use crate::config::ConfigError;
use serde::Deserialize;
use std::{collections::BTreeMap, io::Read};
use tracing::debug;

/// descriptions of Spark 2.4 parameters, `name,default,meaning`
const BUNDLED_DESCRIPTIONS: &str = include_str!("../../resources/spark_params.csv");

/// How a flag ends up on the spark-submit command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// `--name value`
    Direct,
    /// `--conf name=value`
    Conf,
}

#[derive(Debug, Clone)]
pub struct FlagEntry {
    pub partition: Partition,
    /// must be supplied by the caller, the default is only a template
    pub required: bool,
    pub default: Parameter,
}

#[derive(Debug, Deserialize)]
struct DescriptionRow {
    name: String,
    default: String,
    meaning: String,
}

/// Table of all tunable flags, keyed by external flag name (`executor_memory`),
/// together with the conf parameters a spark-submit command always carries.
///
/// Built once at startup and passed around by reference.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    flags: BTreeMap<String, FlagEntry>,
    conf_defaults: BTreeMap<String, Parameter>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flags and defaults of spark-submit, with descriptions taken from
    /// the bundled parameter table
    pub fn builtin() -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        let name = Parameter::string("name", "spark_program", "Program name");
        let class = Parameter::string("class", "MainClass", "Fully qualified main class name");
        let master = Parameter::string("master", "local[*]", "Spark master type: local/yarn/mesos");
        let deploy_mode =
            Parameter::string("deploy-mode", "client", "Deployment mode: client/cluster");
        let driver_memory = Parameter::memory("driver-memory", 10485760, "Amount of driver memory");
        let executor_memory =
            Parameter::memory("executor-memory", 10485760, "Amount of executor memory");
        let executor_cores = Parameter::integer("executor-cores", 2, "Number of executor cores");
        let max_executors = Parameter::integer("spark.dynamicAllocation.maxExecutors", 2, "");
        let parallelism = Parameter::integer("spark.default.parallelism", 10, "");
        let partitions = Parameter::integer("spark.sql.shuffle.partitions", 10, "");

        registry.add_flag("name", Partition::Direct, true, name);
        registry.add_flag("class", Partition::Direct, true, class);
        registry.add_flag("master", Partition::Direct, true, master);
        registry.add_flag("deploy_mode", Partition::Direct, true, deploy_mode);
        registry.add_flag("driver_memory", Partition::Direct, false, driver_memory);
        registry.add_flag("executor_memory", Partition::Direct, false, executor_memory);
        registry.add_flag("executor_cores", Partition::Direct, false, executor_cores);

        registry.add_flag("max_executors", Partition::Conf, false, max_executors.clone());
        registry.add_flag("spark_parallelism", Partition::Conf, false, parallelism.clone());
        registry.add_flag("spark_partitions", Partition::Conf, false, partitions.clone());

        for param in [
            Parameter::boolean("spark.dynamicAllocation.enabled", true, ""),
            max_executors,
            parallelism,
            partitions,
            Parameter::string("spark.eventLog.dir", "file:///tmp/spark-events", ""),
            Parameter::boolean("spark.eventLog.enabled", true, ""),
            Parameter::string(
                "spark.hadoop.mapreduce.fileoutputcommitter.algorithm.version",
                "2",
                "",
            ),
            Parameter::boolean("spark.shuffle.service.enabled", true, ""),
            Parameter::memory("spark.sql.autoBroadcastJoinThreshold", 10485760, ""),
            Parameter::integer("spark.yarn.maxAppAttempts", 1, ""),
        ] {
            registry.add_conf_default(param);
        }

        registry.load_descriptions(BUNDLED_DESCRIPTIONS.as_bytes())?;

        Ok(registry)
    }

    pub fn add_flag(
        &mut self,
        flag: impl Into<String>,
        partition: Partition,
        required: bool,
        default: Parameter,
    ) {
        self.flags.insert(
            flag.into(),
            FlagEntry {
                partition,
                required,
                default,
            },
        );
    }

    pub fn add_conf_default(&mut self, param: Parameter) {
        self.conf_defaults.insert(param.name().to_string(), param);
    }

    /// Fill in missing descriptions from a `name,default,meaning` CSV table.
    /// Descriptions that are already set are left alone.
    pub fn load_descriptions<R: Read>(&mut self, reader: R) -> Result<(), ConfigError> {
        let mut descriptions = BTreeMap::new();

        for row in csv::Reader::from_reader(reader).deserialize() {
            let row: DescriptionRow = row?;
            let meaning = row.meaning.replace("\r\n", "");
            let description = format!(
                "{}. Default: {}.",
                meaning.trim().trim_end_matches('.'),
                row.default.trim()
            );

            descriptions.insert(row.name.trim().to_string(), description);
        }

        debug!("Loaded {} parameter descriptions", descriptions.len());

        let describe = |param: &mut Parameter| {
            if param.description().is_empty() {
                if let Some(description) = descriptions.get(param.name()) {
                    *param = param.clone().with_description(description.as_str());
                }
            }
        };

        self.flags
            .values_mut()
            .for_each(|entry| describe(&mut entry.default));
        self.conf_defaults.values_mut().for_each(describe);

        Ok(())
    }

    pub fn entry(&self, flag: &str) -> Option<&FlagEntry> {
        self.flags.get(flag)
    }

    pub fn partition(&self, flag: &str) -> Option<Partition> {
        self.entry(flag).map(|entry| entry.partition)
    }

    pub fn default_param(&self, flag: &str) -> Option<&Parameter> {
        self.entry(flag).map(|entry| &entry.default)
    }

    pub fn flags(&self) -> impl Iterator<Item = (&str, &FlagEntry)> {
        self.flags.iter().map(|(flag, entry)| (flag.as_str(), entry))
    }

    pub fn required_flags(&self) -> impl Iterator<Item = &str> {
        self.flags()
            .filter(|(_, entry)| entry.required)
            .map(|(flag, _)| flag)
    }

    /// conf parameters always rendered into a command, keyed by native name
    pub fn conf_defaults(&self) -> &BTreeMap<String, Parameter> {
        &self.conf_defaults
    }

    /// Parse a user supplied string for the given flag
    pub fn parse(&self, flag: &str, raw: &str) -> Result<Parameter, ConfigError> {
        let entry = self
            .entry(flag)
            .ok_or_else(|| ConfigError::UnknownFlag(flag.to_string()))?;

        Ok(entry.default.parse(raw)?)
    }

    /// kind of the parameter behind a flag
    pub fn kind(&self, flag: &str) -> Option<ParamKind> {
        self.default_param(flag).map(Parameter::kind)
    }
}
