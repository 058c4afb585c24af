use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{Diagnostic, IntoDiagnostic};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use framepull::archive::ZipExtractor;
use framepull::config::{ConfigLoader, ResolvedConfig};
use framepull::domain::{JobState, ResultLocator};
use framepull::error::{JobErrorKind, PullError};
use framepull::normalize::SystemNormalizer;
use framepull::organizer::{Catalog, organize};
use framepull::output::{JsonOutput, ListResult, OutputMode, PingResult, PruneResult, StderrStatus};
use framepull::pipeline::{Job, Pipeline, RetryPolicy};
use framepull::store::Store;
use framepull::transfer::{TransferClient, TransferHttpClient};
use framepull::tui::Tui;

type HttpPipeline = Pipeline<TransferHttpClient, ZipExtractor, SystemNormalizer>;

#[derive(Parser)]
#[command(name = "framepull")]
#[command(about = "Upload a video for frame extraction and organize the returned images")]
#[command(version)]
struct Cli {
    /// Path to a JSON config file (defaults to ./framepull.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload a video, then download, extract and organize the result")]
    Run { video: PathBuf },
    #[command(about = "Upload a video and print the result locator")]
    Upload { video: PathBuf },
    #[command(about = "Download and organize a previously returned result")]
    Fetch { locator: String },
    #[command(about = "List recorded extractions")]
    List,
    #[command(about = "Organize an extracted directory and print its catalog")]
    Show { dir: PathBuf },
    #[command(about = "Remove extractions beyond the retention limit")]
    Prune,
    #[command(about = "Check that the processing server is reachable")]
    Ping,
}

/// A job that ended anywhere but where the command wanted it.
#[derive(Debug, Error, Diagnostic)]
#[error("job {state}: {status}")]
struct JobOutcome {
    state: JobState,
    status: String,
    kind: Option<JobErrorKind>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PullError>() {
            return ExitCode::from(map_exit_code(&err.kind()));
        }
        if let Some(outcome) = report.downcast_ref::<JobOutcome>() {
            return ExitCode::from(map_outcome(outcome));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(kind: &JobErrorKind) -> u8 {
    match kind {
        JobErrorKind::Rejected | JobErrorKind::SourceUnavailable => 2,
        JobErrorKind::InvalidEndpoint
        | JobErrorKind::ServerRejected(_)
        | JobErrorKind::DecodeFailed
        | JobErrorKind::NoData
        | JobErrorKind::EmptyFile
        | JobErrorKind::Transport(_) => 3,
        JobErrorKind::Cancelled => 4,
        _ => 1,
    }
}

fn map_outcome(outcome: &JobOutcome) -> u8 {
    if outcome.state == JobState::Cancelled {
        return 4;
    }
    outcome.kind.as_ref().map(map_exit_code).unwrap_or(1)
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = open_store(&config)?;

    match cli.command {
        Commands::Run { video } => {
            let pipeline = build_pipeline(&config, store)?;
            let job = drive(&pipeline, "Run", output_mode, move |pipeline| {
                pipeline.select_video(&video)?;
                if pipeline.upload()? == JobState::AwaitingDownload {
                    pipeline.download_and_process()?;
                }
                Ok(())
            })?;
            report_job(&job, output_mode, JobState::Complete)
        }
        Commands::Upload { video } => {
            let pipeline = build_pipeline(&config, store)?;
            let job = drive(&pipeline, "Upload", output_mode, move |pipeline| {
                pipeline.select_video(&video)?;
                pipeline.upload()?;
                Ok(())
            })?;
            report_job(&job, output_mode, JobState::AwaitingDownload)
        }
        Commands::Fetch { locator } => {
            let locator: ResultLocator = locator.parse()?;
            let pipeline = build_pipeline(&config, store)?;
            pipeline.adopt_locator(locator)?;
            let job = drive(&pipeline, "Fetch", output_mode, |pipeline| {
                pipeline.download_and_process()?;
                Ok(())
            })?;
            report_job(&job, output_mode, JobState::Complete)
        }
        Commands::List => {
            let result = ListResult {
                extractions: store.list()?,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic()?,
                OutputMode::Interactive => {
                    if result.extractions.is_empty() {
                        println!("No extractions recorded in {}", store.root());
                    }
                    for record in &result.extractions {
                        println!("{}  {}", record.created_at.format("%Y-%m-%d %H:%M:%S"), record.path);
                    }
                }
            }
            Ok(())
        }
        Commands::Show { dir } => {
            if !dir.is_dir() {
                return Err(PullError::SourceNotFound(dir).into());
            }
            let catalog = organize(&dir);
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_catalog(&catalog).into_diagnostic()?,
                OutputMode::Interactive => print_catalog(&catalog),
            }
            Ok(())
        }
        Commands::Prune => {
            let removed = store.prune()?;
            let result = PruneResult {
                removed: removed.iter().map(|path| path.to_string()).collect(),
                kept: store.list()?.len(),
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_prune(&result).into_diagnostic()?,
                OutputMode::Interactive => {
                    for path in &result.removed {
                        println!("removed {path}");
                    }
                    println!("{} extraction(s) kept", result.kept);
                }
            }
            Ok(())
        }
        Commands::Ping => {
            let client = TransferHttpClient::new(&config)?;
            let result = PingResult {
                base_url: client.base_url().to_string(),
                status: client.status()?,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_ping(&result).into_diagnostic()?,
                OutputMode::Interactive => println!("{}: {}", result.base_url, result.status),
            }
            Ok(())
        }
    }
}

fn open_store(config: &ResolvedConfig) -> Result<Store, PullError> {
    match &config.data_dir {
        Some(dir) => Ok(Store::new_with_root(dir.clone(), config.retention)),
        None => Store::new(config.retention),
    }
}

fn build_pipeline(config: &ResolvedConfig, store: Store) -> Result<HttpPipeline, PullError> {
    let transfer = TransferHttpClient::new(config)?;
    Ok(Pipeline::new(
        transfer,
        ZipExtractor,
        SystemNormalizer::new(),
        store,
        RetryPolicy::from_config(config),
    ))
}

/// Runs `work` against the pipeline, inside the status panel when
/// interactive, and returns the final job snapshot.
fn drive<F>(
    pipeline: &HttpPipeline,
    title: &str,
    output_mode: OutputMode,
    work: F,
) -> miette::Result<Job>
where
    F: FnOnce(&HttpPipeline) -> Result<(), PullError> + Send + 'static,
{
    match output_mode {
        OutputMode::Interactive => {
            let updates = pipeline.subscribe();
            let worker = pipeline.clone();
            let canceller = pipeline.clone();
            let mut tui = Tui::new(title);
            tui.run(updates, move || canceller.cancel(), move || {
                work(&worker)?;
                Ok(worker.snapshot())
            })
        }
        OutputMode::NonInteractive => {
            pipeline.add_sink(Arc::new(StderrStatus::default()));
            work(pipeline)?;
            Ok(pipeline.snapshot())
        }
    }
}

fn report_job(job: &Job, output_mode: OutputMode, wanted: JobState) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_job(job).into_diagnostic()?,
        OutputMode::Interactive => print_job_summary(job),
    }
    if job.state == wanted {
        return Ok(());
    }
    Err(JobOutcome {
        state: job.state,
        status: job.status.clone(),
        kind: job.error.as_ref().map(|error| error.kind),
    }
    .into())
}

fn print_job_summary(job: &Job) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let color = match job.state {
        JobState::Complete | JobState::AwaitingDownload => green,
        JobState::Cancelled => yellow,
        JobState::Failed => red,
        _ => cyan,
    };
    println!("{cyan}framepull{reset} {color}{}{reset}: {}", job.state, job.status);
    if let Some(locator) = &job.locator {
        println!("  result: {locator}");
    }
    if job.retries > 0 {
        println!("{yellow}  retries: {}{reset}", job.retries);
    }
    if let Some(dir) = &job.extraction_dir {
        println!("  extracted to: {dir}");
    }
    if let Some(catalog) = &job.catalog {
        print_catalog(catalog);
    }
}

fn print_catalog(catalog: &Catalog) {
    for collection in &catalog.collections {
        println!("  {} ({} items)", collection.path, collection.items.len());
        for item in &collection.items {
            println!("    {}", item.name);
        }
    }
    for skipped in &catalog.skipped {
        println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
    }
}
