use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cpt_driver::engine::EngineSession;
use cpt_driver::model::{DriverEvent, EngineConfig};
use cpt_driver::orchestrator::{process_report, run_workflow};
use cpt_driver::registry::{ArtifactKind, OutputRegistry};
use cpt_driver::workflow::{
    self, CcaModes, CopyArchive, DatasetSpec, DeterministicSkill, Domain, GoodnessIndex,
    ModeLimits, ProbabilisticSkill, RegressionOptions, Script, Settings, VerificationOptions,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Which console stream a line of CLI output belongs on.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Console writer on the blocking pool.
///
/// Event lines and the final report share this one channel, so they reach the
/// terminal whole and in order. The task flushes and ends once every sender
/// is dropped.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        let mut out = std::io::LineWriter::new(std::io::stdout().lock());
        let mut err = std::io::LineWriter::new(std::io::stderr().lock());
        while let Some(line) = rx.blocking_recv() {
            let _ = match line {
                OutputLine::Stdout(msg) => writeln!(out, "{msg}"),
                OutputLine::Stderr(msg) => writeln!(err, "{msg}"),
            };
        }
        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "cpt-driver",
    version,
    about = "Drive the Climate Predictability Tool through its batch interface"
)]
pub struct Cli {
    /// Engine executable
    #[arg(long, env = "CPT_ENGINE")]
    pub engine: Option<PathBuf>,

    /// Extra argument passed to the engine (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Working directory for the engine process
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Environment variable for the engine, as KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Write the engine's stdout transcript to this file
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Directory holding every artifact not overridden with --set
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Override one artifact destination, as NAME=PATH (repeatable)
    #[arg(long = "set", value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,

    /// Extension the engine appends to output files
    #[arg(long, default_value = "txt")]
    pub suffix: String,

    /// How often pending artifacts are checked
    #[arg(long)]
    pub poll_interval: Option<humantime::Duration>,

    /// How long size and mtime must stay unchanged
    #[arg(long)]
    pub stability_window: Option<humantime::Duration>,

    /// Overall limit for one synchronization
    #[arg(long)]
    pub deadline: Option<humantime::Duration>,

    /// How long the engine gets to exit after the quit sequence
    #[arg(long)]
    pub shutdown_grace: Option<humantime::Duration>,

    /// Accept zero-length artifacts as complete
    #[arg(long)]
    pub allow_empty: bool,

    /// Keep going when the engine writes to stderr
    #[arg(long)]
    pub ignore_stderr: bool,

    /// Load the engine configuration from a JSON file; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the effective engine configuration as JSON and exit
    #[arg(long)]
    pub print_config: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Export the report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Show every command sent and debug logs
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<AnalysisCommand>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum AnalysisCommand {
    /// Canonical correlation analysis
    Cca {
        #[command(flatten)]
        regression: RegressionArgs,
        /// Predictor EOF modes, as MIN:MAX
        #[arg(long, value_parser = parse_modes, default_value = "1:8")]
        x_modes: ModeLimits,
        /// Predictand EOF modes, as MIN:MAX
        #[arg(long, value_parser = parse_modes, default_value = "1:6")]
        y_modes: ModeLimits,
        /// CCA modes, as MIN:MAX
        #[arg(long, value_parser = parse_modes, default_value = "1:3")]
        cca_modes: ModeLimits,
    },
    /// Principal components regression
    Pcr {
        #[command(flatten)]
        regression: RegressionArgs,
        /// Predictor EOF modes, as MIN:MAX
        #[arg(long, value_parser = parse_modes, default_value = "1:8")]
        x_modes: ModeLimits,
    },
    /// Multiple linear regression
    Mlr {
        #[command(flatten)]
        regression: RegressionArgs,
    },
    /// Deterministic skill of forecasts loaded as the predictor
    Skill {
        #[command(flatten)]
        data: DataArgs,
        /// Skill metric to export (repeatable; default all)
        #[arg(long = "metric", value_parser = parse_deterministic)]
        metrics: Vec<DeterministicSkill>,
    },
    /// Probabilistic forecast verification
    Pfv {
        #[command(flatten)]
        data: DataArgs,
        /// Skill metric to export (repeatable; default all)
        #[arg(long = "metric", value_parser = parse_probabilistic)]
        metrics: Vec<ProbabilisticSkill>,
    },
}

#[derive(Debug, Args, Clone)]
pub struct DataArgs {
    /// Pre-formatted predictor archive
    #[arg(long)]
    pub predictor: PathBuf,

    /// Predictor bounds for gridded data, as NORTH,SOUTH,WEST,EAST
    #[arg(long, value_parser = parse_domain, allow_hyphen_values = true)]
    pub predictor_domain: Option<Domain>,

    /// Pre-formatted predictand archive
    #[arg(long)]
    pub predictand: PathBuf,

    /// Predictand bounds for gridded data, as NORTH,SOUTH,WEST,EAST
    #[arg(long, value_parser = parse_domain, allow_hyphen_values = true)]
    pub predictand_domain: Option<Domain>,

    /// Do not declare the predictors synchronous with the predictand
    #[arg(long)]
    pub asynchronous: bool,

    /// Significant figures in the output files
    #[arg(long, default_value_t = 6)]
    pub sigfigs: u32,

    /// Goodness index: pearson, spearman or kendalls-tau
    #[arg(long, value_parser = parse_goodness, default_value = "kendalls-tau")]
    pub goodness: GoodnessIndex,
}

#[derive(Debug, Args, Clone)]
pub struct RegressionArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Pre-formatted forecast archive
    #[arg(long)]
    pub forecast: Option<PathBuf>,

    /// Forecast bounds for gridded data, as NORTH,SOUTH,WEST,EAST
    #[arg(long, value_parser = parse_domain, allow_hyphen_values = true)]
    pub forecast_domain: Option<Domain>,

    /// Transform the predictand before the regression
    #[arg(long)]
    pub transform_predictand: bool,

    /// Skill metric to export (repeatable; default all)
    #[arg(long = "metric", value_parser = parse_deterministic)]
    pub metrics: Vec<DeterministicSkill>,

    /// Do not save cross-validated hindcasts
    #[arg(long)]
    pub no_hindcasts: bool,

    /// Do not save EOF and CCA loadings
    #[arg(long)]
    pub no_loadings: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn parse_modes(s: &str) -> Result<ModeLimits, String> {
    let (min, max) = s
        .split_once(':')
        .ok_or_else(|| format!("expected MIN:MAX, got `{s}`"))?;
    let min = min.trim().parse().map_err(|e| format!("bad minimum: {e}"))?;
    let max = max.trim().parse().map_err(|e| format!("bad maximum: {e}"))?;
    Ok(ModeLimits::new(min, max))
}

fn parse_domain(s: &str) -> Result<Domain, String> {
    let v: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad bound in `{s}`: {e}"))?;
    match v[..] {
        [north, south, west, east] => Ok(Domain {
            north,
            south,
            west,
            east,
        }),
        _ => Err(format!("expected NORTH,SOUTH,WEST,EAST, got `{s}`")),
    }
}

fn parse_goodness(s: &str) -> Result<GoodnessIndex, String> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
        "pearson" => Ok(GoodnessIndex::Pearson),
        "spearman" => Ok(GoodnessIndex::Spearman),
        "kendalls-tau" | "kendall" => Ok(GoodnessIndex::KendallsTau),
        other => Err(format!("unknown goodness index `{other}`")),
    }
}

/// Metrics are named after the artifact they produce, e.g. `two_afc`.
fn parse_deterministic(s: &str) -> Result<DeterministicSkill, String> {
    let name = s.replace('-', "_");
    DeterministicSkill::ALL
        .into_iter()
        .find(|m| m.artifact().name() == name)
        .ok_or_else(|| format!("unknown deterministic metric `{s}`"))
}

fn parse_probabilistic(s: &str) -> Result<ProbabilisticSkill, String> {
    let name = s.replace('-', "_");
    ProbabilisticSkill::ALL
        .into_iter()
        .find(|m| m.artifact().name() == name)
        .ok_or_else(|| format!("unknown probabilistic metric `{s}`"))
}

fn dataset(archive: &std::path::Path, domain: Option<Domain>) -> DatasetSpec {
    DatasetSpec {
        archive: archive.to_path_buf(),
        domain,
    }
}

impl DataArgs {
    fn verification(&self) -> VerificationOptions {
        VerificationOptions {
            predictor: dataset(&self.predictor, self.predictor_domain),
            predictand: dataset(&self.predictand, self.predictand_domain),
            synchronous_predictors: !self.asynchronous,
            settings: Settings {
                significant_figures: self.sigfigs,
                goodness_index: self.goodness,
                ..Settings::default()
            },
        }
    }
}

impl RegressionArgs {
    fn options(&self) -> RegressionOptions {
        let v = self.data.verification();
        RegressionOptions {
            predictor: v.predictor,
            predictand: v.predictand,
            forecast: self
                .forecast
                .as_deref()
                .map(|f| dataset(f, self.forecast_domain)),
            synchronous_predictors: v.synchronous_predictors,
            transform_predictand: self.transform_predictand,
            settings: v.settings,
            skills: if self.metrics.is_empty() {
                DeterministicSkill::ALL.to_vec()
            } else {
                self.metrics.clone()
            },
            save_hindcasts: !self.no_hindcasts,
            save_loadings: !self.no_loadings,
        }
    }
}

/// Turn the selected subcommand into its command script.
pub fn build_script(cmd: &AnalysisCommand) -> Result<Script> {
    let script = match cmd {
        AnalysisCommand::Cca {
            regression,
            x_modes,
            y_modes,
            cca_modes,
        } => workflow::canonical_correlation_analysis(
            &regression.options(),
            &CcaModes {
                predictor: *x_modes,
                predictand: *y_modes,
                cca: *cca_modes,
            },
        ),
        AnalysisCommand::Pcr { regression, x_modes } => {
            workflow::principal_components_regression(&regression.options(), *x_modes)
        }
        AnalysisCommand::Mlr { regression } => workflow::multiple_regression(&regression.options()),
        AnalysisCommand::Skill { data, metrics } => {
            let metrics = if metrics.is_empty() {
                DeterministicSkill::ALL.to_vec()
            } else {
                metrics.clone()
            };
            workflow::deterministic_skill(&data.verification(), &metrics)
        }
        AnalysisCommand::Pfv { data, metrics } => {
            let metrics = if metrics.is_empty() {
                ProbabilisticSkill::ALL.to_vec()
            } else {
                metrics.clone()
            };
            workflow::probabilistic_forecast_verification(&data.verification(), &metrics)
        }
    };
    script.context("invalid workflow arguments")
}

/// Build an `EngineConfig` from the optional config file and CLI flags.
pub fn build_config(args: &Cli) -> Result<EngineConfig> {
    let mut cfg = match args.config.as_deref() {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => match args.engine.as_deref() {
            Some(exe) => EngineConfig::new(exe),
            None => bail!("no engine given: pass --engine, set CPT_ENGINE or use --config"),
        },
    };

    if let Some(exe) = args.engine.as_deref() {
        cfg.executable = exe.to_path_buf();
    }
    if !args.engine_args.is_empty() {
        cfg.args = args.engine_args.clone();
    }
    if let Some(dir) = args.workdir.as_deref() {
        cfg.working_dir = Some(dir.to_path_buf());
    }
    cfg.env.extend(args.env.iter().cloned());
    if let Some(log) = args.log.as_deref() {
        cfg.log_file = Some(log.to_path_buf());
    }
    if let Some(d) = args.poll_interval {
        cfg.sync.poll_interval = Duration::from(d);
    }
    if let Some(d) = args.stability_window {
        cfg.sync.stability_window = Duration::from(d);
    }
    if let Some(d) = args.deadline {
        cfg.sync.deadline = Duration::from(d);
    }
    if let Some(d) = args.shutdown_grace {
        cfg.shutdown_grace = Duration::from(d);
    }
    if args.allow_empty {
        cfg.sync.allow_empty = true;
    }
    if args.ignore_stderr {
        cfg.fail_on_stderr = false;
    }
    if cfg.sync.poll_interval.is_zero() {
        bail!("--poll-interval must be greater than zero");
    }
    Ok(cfg)
}

/// Registry rooted at `--output-dir` (or `~/.workspace`) with `--set` applied.
pub fn build_registry(args: &Cli) -> Result<OutputRegistry> {
    let root = args
        .output_dir
        .clone()
        .unwrap_or_else(OutputRegistry::default_root);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create output directory {}", root.display()))?;
    let root = std::fs::canonicalize(&root).unwrap_or(root);

    let mut registry = OutputRegistry::new(&root).with_suffix(args.suffix.as_str());
    for (name, path) in &args.overrides {
        if ArtifactKind::from_name(name).is_none() {
            let known: Vec<&str> = registry.names().collect();
            bail!("unknown artifact `{name}` in --set (known: {})", known.join(", "));
        }
        registry
            .override_path(name, path)
            .with_context(|| format!("failed to override {name}"))?;
    }
    Ok(registry)
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let cfg = build_config(&args)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        return Ok(());
    }
    let Some(command) = args.command.as_ref() else {
        bail!("no analysis given; see --help");
    };
    let script = build_script(command)?;
    let mut registry = build_registry(&args)?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<DriverEvent>();
    let session = EngineSession::new(cfg).with_events(evt_tx);

    // Ctrl-C kills the engine and fails the run with a cancellation error.
    let controller = session.controller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.cancel();
        }
    });

    let printer = {
        let out_tx = out_tx.clone();
        let quiet = args.silent || args.json;
        let verbose = args.verbose;
        tokio::spawn(async move {
            while let Some(ev) = evt_rx.recv().await {
                let show = match ev {
                    DriverEvent::CommandSent { .. } => verbose,
                    _ => !quiet,
                };
                if show {
                    let _ = out_tx.send(OutputLine::Stderr(ev.to_message()));
                }
            }
        })
    };

    let result = run_workflow(session, &mut registry, &script, &CopyArchive).await;
    ctrl_c.abort();
    // The session (and its event sender) is gone once the run returns.
    let _ = printer.await;

    let outcome = result
        .with_context(|| format!("{} failed", script.name))
        .map(|report| {
            let processed = process_report(&report, args.export_json.as_deref());
            (report, processed)
        });
    let (report, processed) = match outcome {
        Ok(v) => v,
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e);
        }
    };

    if args.json {
        if !args.silent {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&report)?));
        }
        for msg in &processed.export_messages {
            let _ = out_tx.send(OutputLine::Stderr(msg.clone()));
        }
    } else {
        let summary = cpt_driver::text_summary::build_text_summary(&report, &processed);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    if !processed.missing.is_empty() {
        bail!(
            "artifacts vanished after the run: {}",
            processed.missing.join(", ")
        );
    }
    Ok(())
}
