use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use platescrub::core::db::{JobStore, SqliteJobStore};
use platescrub::jobs::{JobId, JobStatus, Orchestrator};
use platescrub::{Config, ImageInput, RedactionPipeline};

#[derive(Parser)]
#[command(name = "platescrub")]
#[command(about = "Redact license plates from vehicle photos")]
struct Cli {
    /// Base directory redacted images are written under
    #[arg(long, global = true, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// SQLite job database; without one, jobs run in-process
    #[arg(long, global = true, value_name = "FILE")]
    job_db: Option<PathBuf>,

    /// Plate detector model (.rten)
    #[arg(long, global = true, value_name = "FILE")]
    plate_model: Option<PathBuf>,

    /// Directory with the ocrs text detection/recognition models
    #[arg(long, global = true, value_name = "DIR")]
    ocr_models: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Redact one image and print the result
    Redact {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Save debug outputs to directory (must be empty)
        #[arg(long, value_name = "DIR")]
        debug_out: Option<PathBuf>,
    },
    /// Submit images as jobs and wait for them to finish
    Submit {
        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,

        /// Print job ids and return without waiting
        #[arg(long)]
        no_wait: bool,

        /// Seconds to wait for each job
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Show the status of a job in the job database
    Status {
        #[arg(value_name = "JOB_ID")]
        job_id: JobId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose { "platescrub=debug" } else { "platescrub=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env()?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(db) = args.job_db {
        config.jobs.database = Some(db);
    }
    if let Some(model) = args.plate_model {
        config.detection.plate_model = Some(model);
    }
    if let Some(dir) = args.ocr_models {
        config.detection.ocr_model_dir = Some(dir);
    }
    config.validate()?;

    match args.command {
        Command::Redact { image, debug_out } => {
            let mut pipeline = RedactionPipeline::from_config(&config);
            if let Some(debug_dir) = debug_out {
                pipeline = pipeline.with_debug(debug_dir)?;
            }
            let input = ImageInput::path(image);
            let result = tokio::task::spawn_blocking(move || pipeline.run(&input)).await??;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Submit {
            images,
            no_wait,
            timeout,
        } => {
            let inputs: Vec<ImageInput> = images.into_iter().map(ImageInput::path).collect();
            let pipeline = RedactionPipeline::from_config(&config);
            let timeout = Duration::from_secs(timeout);
            match &config.jobs.database {
                Some(db) => {
                    let store = SqliteJobStore::open(db).await?;
                    let orchestrator =
                        Orchestrator::with_backend(store, pipeline, &config.jobs).await?;
                    submit_and_report(&orchestrator, inputs, no_wait, timeout).await?;
                    // Queued inputs are held in memory; shutdown drains them
                    orchestrator.shutdown().await;
                }
                None => {
                    let orchestrator = Orchestrator::in_process(pipeline);
                    submit_and_report(&orchestrator, inputs, no_wait, timeout).await?;
                    orchestrator.shutdown().await;
                }
            }
        }
        Command::Status { job_id } => {
            let Some(db) = &config.jobs.database else {
                anyhow::bail!("status needs a job database (--job-db or PLATESCRUB_JOB_DB)");
            };
            let status = match SqliteJobStore::open(db).await {
                Ok(store) => match store.load(job_id).await {
                    Ok(Some(record)) => record.status(),
                    Ok(None) => JobStatus::Unknown,
                    Err(_) => JobStatus::Unavailable,
                },
                Err(_) => JobStatus::Unavailable,
            };
            print_status(job_id, &status)?;
        }
    }

    Ok(())
}

async fn submit_and_report<S: JobStore>(
    orchestrator: &Orchestrator<S>,
    inputs: Vec<ImageInput>,
    no_wait: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (batch_id, ids) = orchestrator.submit_many(inputs).await?;
    println!("batch {}", batch_id);
    if no_wait {
        for id in &ids {
            println!("{}", id);
        }
        return Ok(());
    }

    for id in &ids {
        let status = orchestrator
            .wait(*id, Duration::from_millis(200), timeout)
            .await;
        print_status(*id, &status)?;
    }
    println!("batch state: {}", orchestrator.batch_status(&ids).await.as_str());
    Ok(())
}

fn print_status(id: JobId, status: &JobStatus) -> anyhow::Result<()> {
    println!(
        "{} {}",
        status.http_status(),
        serde_json::to_string(&status.payload(id))?
    );
    Ok(())
}
