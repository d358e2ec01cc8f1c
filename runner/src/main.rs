use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use itertools::Itertools;
use slurmlog_runner::{
    cache::SharedCache,
    config::{ConfigErrors, RunnerConfig},
    history::{git::GitLog, HistoryError},
    lifecycle::{
        Engine, FinishOptions, LifecycleError, RescheduleOptions, RescheduleOutcome,
        RescheduleTarget, ScheduleRequest, Selector, Settings,
    },
    outputs::{OutputError, OutputSpec},
    scheduler::slurm::SlurmScheduler,
};
use std::{
    env,
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

type Runner = Engine<GitLog, SlurmScheduler>;

#[derive(Parser, Debug)]
#[command(name = "slurmlog", version, about = "Record SLURM jobs and their outputs in git history")]
struct Cli {
    /// more logging, repeat for even more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// less logging, repeat for even less
    #[arg(short, long, action = ArgAction::Count, global = true, conflicts_with = "verbose")]
    quiet: u8,
    /// configuration file instead of .slurmlog.yaml in the repository root
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Submit a job and record it as open
    Schedule(ScheduleArgs),
    /// Close open jobs and commit their outputs
    Finish(FinishArgs),
    /// Submit finished jobs again
    Reschedule(RescheduleArgs),
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    /// outputs of the job relative to the current directory, comma separated or repeated
    #[arg(short, long = "output", value_name = "SPEC", value_delimiter = ',')]
    outputs: Vec<String>,
    #[arg(long)]
    allow_wildcard_outputs: bool,
    #[arg(short, long)]
    message: Option<String>,
    /// submission command, e.g. `sbatch job.sh`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct FinishArgs {
    /// scheduler job id or (abbreviated) schedule commit
    #[arg(conflicts_with = "since")]
    job: Option<String>,
    /// only jobs scheduled after this history point, empty for all of history
    #[arg(long, value_name = "POINT")]
    since: Option<String>,
    /// report the open jobs and their status without closing anything
    #[arg(long)]
    list_open_jobs: bool,
    #[arg(long)]
    close_failed_jobs: bool,
    /// close failed jobs and commit their outputs anyway
    #[arg(long)]
    commit_failed_jobs: bool,
    /// close jobs the scheduler has no record of
    #[arg(long)]
    close_unknown_jobs: bool,
    /// additional outputs to commit, only together with a job reference
    #[arg(short, long = "output", value_name = "SPEC", value_delimiter = ',')]
    outputs: Vec<String>,
    #[arg(long)]
    allow_wildcard_outputs: bool,
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").args(["job", "since"])))]
struct RescheduleArgs {
    /// scheduler job id or (abbreviated) schedule commit, the most recent record if neither this nor --since is given
    job: Option<String>,
    /// every job scheduled after this history point, empty for all of history
    #[arg(long, value_name = "POINT")]
    since: Option<String>,
    #[arg(long)]
    with_failed_jobs: bool,
    /// only report what would be submitted
    #[arg(long)]
    report: bool,
    /// write the commands that would be submitted to FILE, `-` for stdout; implies --report
    #[arg(long, value_name = "FILE")]
    script: Option<PathBuf>,
    #[arg(short, long)]
    message: Option<String>,
}

/// Result of a whole invocation, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Done,
    /// some jobs couldn't be handled or there was nothing to do
    Impossible,
    Fatal,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => ExitCode::SUCCESS,
            Outcome::Impossible => ExitCode::from(1),
            Outcome::Fatal => ExitCode::from(2),
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to determine the current directory")]
    CurrentDir(#[source] io::Error),
    #[error("{0}")]
    Config(#[from] ConfigErrors),
    #[error("{0}")]
    History(#[from] HistoryError),
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Failed to write the script to {path:?}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<OutputError> for CliError {
    fn from(error: OutputError) -> Self {
        Self::Lifecycle(error.into())
    }
}

fn severity(error: &LifecycleError) -> Outcome {
    match error {
        LifecycleError::FinishImpossible { .. }
        | LifecycleError::NotReschedulable { .. }
        | LifecycleError::AlreadyFinished(_)
        | LifecycleError::UnknownJob(_)
        | LifecycleError::AmbiguousJob(_)
        | LifecycleError::InvalidRequest(_) => Outcome::Impossible,
        _ => Outcome::Fatal,
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match (verbose, quiet) {
        (0, 0) => None,
        (1, _) => Some("debug"),
        (_, 0) => Some("trace"),
        (_, 1) => Some("warn"),
        _ => Some("error"),
    };
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// engine for the repository around the current directory, and that directory relative to its root
fn setup(config: Option<&Path>) -> Result<(Runner, PathBuf), CliError> {
    let cwd = env::current_dir()
        .and_then(|cwd| cwd.canonicalize())
        .map_err(CliError::CurrentDir)?;
    let log = GitLog::discover(&cwd)?;
    let root = log.root().to_path_buf();

    let config = RunnerConfig::discover(&root, config)?;
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let cache_path = config
        .cache
        .resolve(&root, log.git_dir(), log.branch().as_deref());
    let pwd = cwd
        .strip_prefix(&root)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut engine = Engine::new(
        log,
        config.scheduler.slurm.scheduler(),
        root,
        Settings::from_config(&config),
    );
    if let Some(path) = cache_path {
        match SharedCache::open(&path) {
            Ok(cache) => engine = engine.with_cache(cache),
            Err(error) => warn!(path = ?path, error = %error, "Cache unavailable, replaying history"),
        }
    }

    Ok((engine, pwd))
}

fn declare(
    engine: &Runner,
    pwd: &Path,
    raw: &[String],
    allow_wildcards: bool,
) -> Result<Vec<OutputSpec>, OutputError> {
    raw.iter()
        .map(|raw| OutputSpec::declare(raw, pwd, engine.repo_root(), allow_wildcards))
        .collect()
}

fn schedule(engine: &Runner, pwd: &Path, args: ScheduleArgs) -> Result<Outcome, CliError> {
    let outputs = declare(engine, pwd, &args.outputs, args.allow_wildcard_outputs)?;
    let job = engine.schedule(ScheduleRequest {
        command: args.command,
        working_directory: pwd.to_path_buf(),
        outputs,
        message: args.message,
        lineage: None,
    })?;

    println!(
        "Submitted batch job {}, recorded as {}",
        job.job_id,
        job.schedule_commit.short()
    );

    Ok(Outcome::Done)
}

fn finish(engine: &Runner, pwd: &Path, args: FinishArgs) -> Result<Outcome, CliError> {
    let selector = match (args.job, args.since) {
        (Some(reference), _) => Selector::Job(reference),
        (None, Some(since)) => Selector::Since(engine.history_point(&since)?),
        (None, None) => Selector::AllOpen,
    };

    if args.list_open_jobs {
        let listed = engine.list_open(&selector)?;
        for status in listed.iter() {
            println!(
                "{}\t{}\t{}\t{}",
                status.job.job_id,
                status.job.schedule_commit.short(),
                status.group,
                status.job.declared_outputs.iter().join(",")
            );
        }

        return Ok(Outcome::Done);
    }

    let options = FinishOptions {
        close_failed: args.close_failed_jobs || args.commit_failed_jobs,
        commit_failed: args.commit_failed_jobs,
        close_unknown: args.close_unknown_jobs,
        outputs: declare(engine, pwd, &args.outputs, args.allow_wildcard_outputs)?,
        message: args.message,
    };
    let report = engine.finish(&selector, &options)?;

    for (job, resolution) in report.closed() {
        println!(
            "Closed job {} as {}, committed {} files in {}",
            job.status.job.job_id,
            resolution.state,
            resolution.artifacts.len(),
            resolution.finish_commit.short()
        );
    }

    if report.jobs.is_empty() {
        return Ok(Outcome::Impossible);
    }

    Ok(report
        .failed()
        .map(|(_, error)| severity(error))
        .max()
        .unwrap_or(Outcome::Done))
}

fn reschedule(engine: &Runner, args: RescheduleArgs) -> Result<Outcome, CliError> {
    let target = match (&args.job, &args.since) {
        (Some(reference), _) => RescheduleTarget::Job(reference.clone()),
        (None, Some(since)) => RescheduleTarget::Since(engine.history_point(since)?),
        (None, None) => RescheduleTarget::Latest,
    };
    let options = RescheduleOptions {
        with_failed: args.with_failed_jobs,
        report_only: args.report || args.script.is_some(),
        message: args.message.clone(),
    };
    let report = engine.reschedule(&target, &options)?;

    if let Some(path) = &args.script {
        let invocation = script_invocation(&args, path);
        let written = if path.as_os_str() == "-" {
            report.write_script(&mut io::stdout().lock(), &invocation, engine.repo_root())
        } else {
            File::create(path).and_then(|file| {
                report.write_script(&mut BufWriter::new(file), &invocation, engine.repo_root())
            })
        };
        written.map_err(|source| CliError::Script {
            path: path.clone(),
            source,
        })?;
    } else {
        for (job, outcome) in report.jobs.iter() {
            match outcome {
                Ok(RescheduleOutcome::Rescheduled(new)) => {
                    println!("Rescheduled job {} as job {}", job.job_id, new.job_id)
                }
                Ok(RescheduleOutcome::WouldReschedule) => println!(
                    "Would reschedule job {}: {}",
                    job.job_id,
                    job.submission_command.join(" ")
                ),
                Ok(RescheduleOutcome::Skipped(_)) | Err(_) => {}
            }
        }
    }

    if report.jobs.is_empty() {
        return Ok(Outcome::Impossible);
    }

    Ok(report
        .failed()
        .map(|(_, error)| severity(error))
        .max()
        .unwrap_or(Outcome::Done))
}

/// the reschedule command line a script stands for
fn script_invocation(args: &RescheduleArgs, script: &Path) -> String {
    let mut invocation = format!("slurmlog reschedule --script={}", script.display());
    if let Some(since) = &args.since {
        invocation.push_str(&format!(" --since={since}"));
    }
    if args.with_failed_jobs {
        invocation.push_str(" --with-failed-jobs");
    }
    if let Some(job) = &args.job {
        invocation.push_str(&format!(" {job}"));
    }

    invocation
}

fn run(cli: Cli) -> Result<Outcome, CliError> {
    let (engine, pwd) = setup(cli.config.as_deref())?;

    let outcome = match cli.cmd {
        Cmd::Schedule(args) => schedule(&engine, &pwd, args),
        Cmd::Finish(args) => finish(&engine, &pwd, args),
        Cmd::Reschedule(args) => reschedule(&engine, args),
    };

    if let Err(error) = engine.close() {
        warn!(error = %error, "Failed to close the cache");
    }

    outcome
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(outcome) => outcome.into(),
        Err(error) => {
            error!("{error}");

            match &error {
                CliError::Lifecycle(error) => severity(error).into(),
                _ => Outcome::Fatal.into(),
            }
        }
    }
}
