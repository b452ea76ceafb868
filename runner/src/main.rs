use clap::{Parser, Subcommand};
use sparktune::{
    config::TunerConfig,
    executors::{LocalExecutor, RunLimits},
    metrics::{Master, MetricsCollector},
    objective::MinimizeTimeAndResource,
    params::Scalar,
    sync::{spawn_interrupt_watcher, LivePids},
    tuner::{save_final_config, Candidate, Tuner, TunerError},
};
use std::{path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tune spark-submit parameters of a Spark program")]
struct Cli {
    /// YAML configuration
    #[arg(short, long, default_value = "sparktune.yaml")]
    config: PathBuf,
    /// debug logging, RUST_LOG takes precedence
    #[arg(short, long)]
    verbose: bool,
    /// override a parameter, e.g. `-p executor_memory=1g,4g,512m`
    #[arg(short = 'p', long = "param", value_parser = key_value)]
    params: Vec<(String, String)>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// print the search space of the ranged parameters
    Space,
    /// run the program once, each range at its start unless set
    Run {
        /// search domain value of a ranged flag, e.g. `--set executor_cores=4`
        #[arg(long = "set", value_parser = key_value)]
        set: Vec<(String, String)>,
        /// directory to write `<name>_final_config.json` to
        #[arg(long)]
        out_config: Option<PathBuf>,
    },
}

fn key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected flag=value, got '{raw}'"))
}

fn scalar(raw: &str) -> Scalar {
    if let Ok(integer) = raw.parse::<i64>() {
        Scalar::Integer(integer)
    } else if let Ok(boolean) = raw.to_lowercase().parse::<bool>() {
        Scalar::Boolean(boolean)
    } else {
        Scalar::String(raw.to_string())
    }
}

// spark-submit logs `Submitted application application_<cluster>_<n>` once YARN accepted the program
fn submitted_application(_stdout: &str, stderr: &str) -> Option<String> {
    stderr
        .lines()
        .filter_map(|line| line.split("Submitted application ").nth(1))
        .filter_map(|rest| rest.split_whitespace().next())
        .find(|id| id.starts_with("application_"))
        .map(str::to_string)
}

fn run(cli: Cli, pids: LivePids) -> Result<(), TunerError> {
    let mut config = TunerConfig::load(&cli.config)?;
    config.override_params(&cli.params);

    let registry = config.load_registry()?;

    if config.preflight_checks(&registry) {
        error!("Invalid configuration in {}", cli.config.to_string_lossy());
        exit(1)
    }

    let params = match config.load_params(&registry) {
        Ok(params) => params,
        Err(errors) => {
            for (flag, e) in errors {
                error!("params.{flag} is invalid: {e}");
            }
            exit(1)
        }
    };

    match cli.command {
        Commands::Space => {
            for search in sparktune::tuner::search_space(&params)? {
                let description = registry
                    .default_param(search.flag())
                    .map(|param| param.description())
                    .unwrap_or_default();

                match search.legal_range() {
                    Some((low, high)) => println!(
                        "{}: [{low}, {high}] ({} values) {description}",
                        search.flag(),
                        search.search_space_size()
                    ),
                    None => println!("{}: true/false {description}", search.flag()),
                }
            }
        }
        Commands::Run { set, out_config } => {
            let master: Master = config.master().unwrap_or_default().parse()?;
            let collector = MetricsCollector::load(master, &config.yarn)?;
            let executor = LocalExecutor::new(collector, RunLimits::load(&config.executor)?, pids)
                .with_application_id_source(submitted_application);
            let mut tuner = Tuner::new(
                &registry,
                params,
                config.spark.clone(),
                MinimizeTimeAndResource::from(&config.objective),
                executor,
            )?;

            let mut candidate: Candidate = tuner.initial_candidate();
            candidate.extend(set.iter().map(|(flag, value)| (flag.clone(), scalar(value))));

            let result = tuner.run(&candidate)?;
            println!("{}", tuner.objective().display(&result));

            if result.timed_out {
                warn!("Run exceeded its time limit");
            }

            if let Some(dir) = out_config {
                let name = config.params.get("name").map(String::as_str).unwrap_or("spark_program");
                save_final_config(&dir, name, &candidate)?;
            }
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // before any other thread exists, so all of them inherit the signal mask
    let pids = LivePids::new();
    if let Err(e) = spawn_interrupt_watcher(pids.clone()) {
        warn!(error = ?e, "Failed to install interrupt handling, programs may outlive an interrupt");
    }

    info!("Loading configuration from {}", cli.config.to_string_lossy());

    if let Err(e) = run(cli, pids) {
        error!(error = ?e, "{e}");
        exit(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli() {
        let cli = Cli::try_parse_from([
            "sparktune",
            "-c",
            "tune.yaml",
            "-p",
            "executor_cores=2,8",
            "run",
            "--set",
            "executor_cores=4",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("tune.yaml"));
        assert_eq!(cli.params, vec![("executor_cores".to_string(), "2,8".to_string())]);
        assert!(matches!(
            cli.command,
            Commands::Run { ref set, out_config: None } if set[0].1 == "4"
        ));
        assert!(Cli::try_parse_from(["sparktune", "-p", "oops", "space"]).is_err());
    }

    #[test]
    fn finds_submitted_application() {
        let stderr = "23/05/02 10:00:01 INFO Client: Requesting a new application\n\
                      23/05/02 10:00:02 INFO YarnClientImpl: Submitted application application_1683000000000_0042\n";

        assert_eq!(
            submitted_application("", stderr).as_deref(),
            Some("application_1683000000000_0042")
        );
        assert_eq!(submitted_application("Submitted application application_1_1", ""), None);
        assert_eq!(submitted_application("", "Submitted application pending\n"), None);
    }

    #[test]
    fn scalars_from_strings() {
        assert_eq!(scalar("42"), Scalar::Integer(42));
        assert_eq!(scalar("True"), Scalar::Boolean(true));
        assert_eq!(scalar("client"), Scalar::String("client".into()));
    }
}
