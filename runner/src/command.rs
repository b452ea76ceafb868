use crate::{
    config::ConfigError,
    params::{ParamMap, Parameter, Partition, Registry},
};
use itertools::Itertools;
use std::{collections::BTreeMap, path::Path};
use tracing::debug;

/// native name -> rendered value
pub type RenderedMap = BTreeMap<String, String>;

/// Turns parameter maps into spark-submit command lines.
///
/// The builder carries its own direct and conf defaults keyed by native
/// name, which sit below the run arguments and the search values.
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    registry: &'a Registry,
    direct_defaults: RenderedMap,
    conf_defaults: RenderedMap,
    fixed_params: String,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(registry: &'a Registry, fixed_params: impl Into<String>) -> Self {
        Self {
            registry,
            direct_defaults: RenderedMap::new(),
            conf_defaults: RenderedMap::new(),
            fixed_params: fixed_params.into(),
        }
    }

    /// add a default `--name value` pair
    pub fn with_direct_default(mut self, param: &Parameter) -> Result<Self, ConfigError> {
        let (name, value) = rendered(param)?;
        self.direct_defaults.insert(name, value);

        Ok(self)
    }

    /// add a default `--conf name=value` pair
    pub fn with_conf_default(mut self, param: &Parameter) -> Result<Self, ConfigError> {
        let (name, value) = rendered(param)?;
        self.conf_defaults.insert(name, value);

        Ok(self)
    }

    /// seed the conf defaults with every conf parameter the registry always carries
    pub fn with_registry_conf_defaults(self) -> Result<Self, ConfigError> {
        let registry = self.registry;

        registry
            .conf_defaults()
            .values()
            .try_fold(self, |builder, param| builder.with_conf_default(param))
    }

    pub fn fixed_params(&self) -> &str {
        &self.fixed_params
    }

    /// Merge run arguments and search values, both keyed by external flag.
    ///
    /// For every flag the search value wins over the run argument, which wins
    /// over the builder default. Returns the direct and conf maps keyed by
    /// native name with rendered values.
    pub fn merge(
        &self,
        args: &ParamMap,
        search: &ParamMap,
    ) -> Result<(RenderedMap, RenderedMap), ConfigError> {
        let mut direct = self.direct_defaults.clone();
        let mut conf = self.conf_defaults.clone();

        // a ranged argument is fine as long as the search supplies its value
        let merged = args
            .keys()
            .chain(search.keys())
            .unique()
            .filter_map(|flag| search.get(flag).or_else(|| args.get(flag)).map(|param| (flag, param)));

        for (flag, param) in merged {
            let partition = self
                .registry
                .partition(flag)
                .ok_or_else(|| ConfigError::UnknownFlag(flag.clone()))?;
            let (name, value) = rendered(param)?;

            debug!(flag = %flag, name = %name, value = %value, "Merging parameter");

            match partition {
                Partition::Direct => direct.insert(name, value),
                Partition::Conf => conf.insert(name, value),
            };
        }

        if let Some(missing) = self.registry.required_flags().find(|flag| {
            self.registry
                .default_param(flag)
                .map_or(true, |param| !direct.contains_key(param.name()))
        }) {
            return Err(ConfigError::MissingRequiredFlag(missing.to_string()));
        }

        Ok((direct, conf))
    }

    /// merge and render in one go
    pub fn make_command(
        &self,
        args: &ParamMap,
        search: &ParamMap,
        submit: &Path,
        jar: &Path,
        program_conf: &str,
    ) -> Result<String, ConfigError> {
        let (direct, conf) = self.merge(args, search)?;

        Ok(render(
            &direct,
            &conf,
            &self.fixed_params,
            &submit.to_string_lossy(),
            &jar.to_string_lossy(),
            program_conf,
        ))
    }
}

fn rendered(param: &Parameter) -> Result<(String, String), ConfigError> {
    if param.is_range() {
        return Err(ConfigError::UnresolvedRange(param.name().to_string()));
    }

    Ok((param.name().to_string(), param.render()))
}

/// Render `<submit> --<direct> <value>... --conf <name>=<value>... <fixed> <jar> <program>`,
/// single space separated with empty parts left out
pub fn render(
    direct: &RenderedMap,
    conf: &RenderedMap,
    fixed_params: &str,
    submit: &str,
    jar: &str,
    program_conf: &str,
) -> String {
    let direct = direct
        .iter()
        .map(|(name, value)| format!("--{name} {value}"))
        .join(" ");
    let conf = conf
        .iter()
        .map(|(name, value)| format!("--conf {name}={value}"))
        .join(" ");

    let command = [
        submit,
        direct.as_str(),
        conf.as_str(),
        fixed_params.trim(),
        jar,
        program_conf.trim(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .join(" ");

    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Parsed {
        submit: String,
        direct: RenderedMap,
        conf: RenderedMap,
        rest: Vec<String>,
    }

    // reads a rendered command back into its groups
    fn parse_command(command: &str) -> Parsed {
        let mut tokens = command.split(' ').peekable();
        let submit = tokens.next().unwrap().to_string();
        let mut direct = RenderedMap::new();
        let mut conf = RenderedMap::new();

        while let Some(token) = tokens.next_if(|token| token.starts_with("--")) {
            let value = tokens.next().unwrap();

            if token == "--conf" {
                let (name, value) = value.split_once('=').unwrap();
                conf.insert(name.to_string(), value.to_string());
            } else {
                direct.insert(token[2..].to_string(), value.to_string());
            }
        }

        Parsed {
            submit,
            direct,
            conf,
            rest: tokens.map(str::to_string).collect(),
        }
    }

    fn required_args(registry: &Registry) -> ParamMap {
        [
            ("name", "sorter"),
            ("class", "com.example.Main"),
            ("master", "local[4]"),
            ("deploy_mode", "client"),
        ]
        .into_iter()
        .map(|(flag, raw)| (flag.to_string(), registry.parse(flag, raw).unwrap()))
        .collect()
    }

    #[test]
    fn required_only_has_no_conf() {
        let registry = Registry::builtin().unwrap();
        let builder = CommandBuilder::new(&registry, "");

        let (direct, conf) = builder.merge(&required_args(&registry), &ParamMap::new()).unwrap();

        assert!(conf.is_empty());
        assert_eq!(direct.len(), 4);
        assert_eq!(direct["deploy-mode"], "client");
        assert_eq!(direct["master"], "local[4]");
    }

    #[test]
    fn search_wins_over_args() {
        let registry = Registry::builtin().unwrap();
        let builder = CommandBuilder::new(&registry, "")
            .with_conf_default(&Parameter::integer("spark.default.parallelism", 3, ""))
            .unwrap();

        let mut args = required_args(&registry);
        args.insert(
            "spark_parallelism".into(),
            registry.parse("spark_parallelism", "20").unwrap(),
        );
        args.insert(
            "executor_memory".into(),
            registry.parse("executor_memory", "2g").unwrap(),
        );

        let mut search = ParamMap::new();
        search.insert(
            "spark_parallelism".into(),
            registry.parse("spark_parallelism", "40").unwrap(),
        );

        let (direct, conf) = builder.merge(&args, &search).unwrap();
        assert_eq!(conf["spark.default.parallelism"], "40");
        assert_eq!(direct["executor-memory"], "2097152k");

        // without an override the builder default stays
        let (_, conf) = builder.merge(&required_args(&registry), &ParamMap::new()).unwrap();
        assert_eq!(conf["spark.default.parallelism"], "3");
    }

    #[test]
    fn search_resolves_ranged_args() {
        let registry = Registry::builtin().unwrap();
        let builder = CommandBuilder::new(&registry, "");

        let mut args = required_args(&registry);
        args.insert(
            "executor_cores".into(),
            registry.parse("executor_cores", "2,8").unwrap(),
        );
        let mut search = ParamMap::new();
        search.insert(
            "executor_cores".into(),
            registry.parse("executor_cores", "5").unwrap(),
        );

        let (direct, _) = builder.merge(&args, &search).unwrap();
        assert_eq!(direct["executor-cores"], "5");
    }

    #[test]
    fn merge_errors() {
        let registry = Registry::builtin().unwrap();
        let builder = CommandBuilder::new(&registry, "");

        // keyed by native name instead of flag
        let mut native = required_args(&registry);
        native.insert(
            "executor-memory".into(),
            registry.parse("executor_memory", "2g").unwrap(),
        );
        assert!(matches!(
            builder.merge(&native, &ParamMap::new()),
            Err(ConfigError::UnknownFlag(flag)) if flag == "executor-memory"
        ));

        let mut ranged = required_args(&registry);
        ranged.insert(
            "executor_cores".into(),
            registry.parse("executor_cores", "2,8").unwrap(),
        );
        assert!(matches!(
            builder.merge(&ranged, &ParamMap::new()),
            Err(ConfigError::UnresolvedRange(_))
        ));

        let mut incomplete = required_args(&registry);
        incomplete.remove("class");
        assert!(matches!(
            builder.merge(&incomplete, &ParamMap::new()),
            Err(ConfigError::MissingRequiredFlag(flag)) if flag == "class"
        ));
    }

    #[test]
    fn render_group_order() {
        let direct = RenderedMap::from([("class".to_string(), "Main".to_string())]);
        let conf = RenderedMap::from([("spark.eventLog.enabled".to_string(), "true".to_string())]);

        assert_eq!(
            render(&direct, &conf, "--verbose", "spark-submit", "app.jar", "10 out"),
            "spark-submit --class Main --conf spark.eventLog.enabled=true --verbose app.jar 10 out"
        );
        assert_eq!(
            render(&RenderedMap::new(), &RenderedMap::new(), "", "spark-submit", "app.jar", ""),
            "spark-submit app.jar"
        );
    }

    #[test]
    fn rendered_command_parses_back() {
        let registry = Registry::builtin().unwrap();
        let builder = CommandBuilder::new(&registry, "-v")
            .with_registry_conf_defaults()
            .unwrap();

        let mut search = ParamMap::new();
        search.insert(
            "executor_cores".into(),
            registry.parse("executor_cores", "6").unwrap(),
        );

        let command = builder
            .make_command(
                &required_args(&registry),
                &search,
                &PathBuf::from("/opt/spark/bin/spark-submit"),
                &PathBuf::from("target/app.jar"),
                "100 /tmp/out",
            )
            .unwrap();
        let parsed = parse_command(&command);

        assert!(!command.ends_with(' '));
        assert!(!command.contains("  "));
        assert_eq!(parsed.submit, "/opt/spark/bin/spark-submit");
        assert_eq!(parsed.direct["executor-cores"], "6");
        assert_eq!(parsed.direct["name"], "sorter");
        assert_eq!(parsed.conf.len(), registry.conf_defaults().len());
        assert_eq!(parsed.conf["spark.yarn.maxAppAttempts"], "1");
        assert_eq!(parsed.conf["spark.sql.autoBroadcastJoinThreshold"], "10240k");
        assert_eq!(
            parsed.rest,
            vec!["-v", "target/app.jar", "100", "/tmp/out"]
        );
    }
}
