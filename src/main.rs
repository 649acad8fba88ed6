//! Command-line client for RustyJobs.
//!
//! Every invocation connects to the endpoint, bootstraps the supervisor,
//! performs one operation and disconnects. Jobs keep running in between.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};

use rusty_jobs::utils::logger;
use rusty_jobs::{Config, ConnectParams, Job, JobContainer, JobDescription, JobId, JobService};

/// Run and control jobs on remote hosts through a login shell
#[derive(Parser, Debug)]
#[command(name = "rusty-jobs")]
#[command(version)]
struct Cli {
    /// Endpoint URL: fork://localhost, ssh://[user@]host[:port] or gsissh://host
    #[arg(short = 'H', long, default_value = "fork://localhost")]
    url: String,

    /// Config file (default: ~/.rusty-jobs/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Login user, overriding the one in the URL
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// ssh identity file
    #[arg(short = 'i', long)]
    identity: Option<PathBuf>,

    /// ssh jump host
    #[arg(short = 'J', long)]
    proxy_jump: Option<String>,

    /// Extra ssh option (key=value), repeatable
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job and print its id
    Run {
        /// Wait for the job to finish and print its summary
        #[arg(short, long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Working directory on the endpoint
        #[arg(short = 'C', long)]
        cwd: Option<String>,
        /// Environment variable KEY=VALUE, repeatable
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the state of one or more jobs
    State {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Wait for a job to finish and print its summary
    Wait {
        id: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop a running job
    Suspend { id: String },
    /// Continue a suspended job
    Resume { id: String },
    /// Kill a job
    Cancel { id: String },
    /// Print what a job wrote to stdout (or stderr)
    Output {
        id: String,
        #[arg(long)]
        stderr: bool,
    },
    /// List the ids of all jobs in the store
    List,
    /// Remove one job directory, or all finished ones
    Purge { id: Option<String> },
    /// Copy a local file or directory to the endpoint
    Put {
        local: PathBuf,
        remote: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Copy a file or directory from the endpoint
    Get {
        remote: String,
        local: PathBuf,
        #[arg(short, long)]
        recursive: bool,
    },
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse::<JobId>().with_context(|| format!("Invalid job id '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = logger::init_logging(logger::default_log_dir());

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;
    let params = ConnectParams {
        user: cli.user.clone(),
        identity: cli.identity.clone(),
        proxy_jump: cli.proxy_jump.clone(),
        options: cli.options.clone(),
    };

    let service = JobService::connect(&cli.url, params, config)
        .await
        .with_context(|| format!("Failed to start the supervisor on {}", cli.url))?;

    let outcome = execute(&service, cli.command).await;
    service.close().await;
    outcome
}

async fn execute(service: &Arc<JobService>, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            wait,
            timeout,
            cwd,
            env,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .context("No program given")?;
            let mut description = JobDescription::new(program.as_str()).args(args.iter().cloned());
            for (key, value) in env {
                description = description.env(key, value);
            }
            if let Some(dir) = cwd {
                description = description.working_directory(dir);
            }

            let job = Job::new(service, description);
            job.run().await?;
            let id = job.id().context("Job has no id after submission")?;
            println!("{}", id);
            if wait {
                job.wait(timeout.map(Duration::from_secs)).await?;
                println!("{}", serde_json::to_string_pretty(&job.info())?);
            }
        }
        Commands::State { ids } => {
            let mut container = JobContainer::new();
            for raw in &ids {
                container.add(Arc::new(Job::attach(service, parse_id(raw)?).await?));
            }
            let states = container.get_states().await?;
            for (job, state) in container.jobs().iter().zip(states) {
                if let Some(id) = job.id() {
                    println!("{} {}", id, state);
                }
            }
        }
        Commands::Wait { id, timeout } => {
            let job = Job::attach(service, parse_id(&id)?).await?;
            job.wait(timeout.map(Duration::from_secs)).await?;
            println!("{}", serde_json::to_string_pretty(&job.info())?);
        }
        Commands::Suspend { id } => {
            Job::attach(service, parse_id(&id)?).await?.suspend().await?;
        }
        Commands::Resume { id } => {
            Job::attach(service, parse_id(&id)?).await?.resume().await?;
        }
        Commands::Cancel { id } => {
            let job = Job::attach(service, parse_id(&id)?).await?;
            job.cancel().await?;
            println!("{} {}", id, job.cached_state());
        }
        Commands::Output { id, stderr } => {
            let job = Job::attach(service, parse_id(&id)?).await?;
            let data = if stderr { job.stderr().await? } else { job.stdout().await? };
            let mut out = std::io::stdout().lock();
            out.write_all(&data)?;
            out.flush()?;
        }
        Commands::List => {
            for id in service.list().await? {
                println!("{}", id);
            }
        }
        Commands::Purge { id } => {
            let id = id.as_deref().map(parse_id).transpose()?;
            let purged = service.purge(id.as_ref()).await?;
            println!("purged {}", purged);
        }
        Commands::Put {
            local,
            remote,
            recursive,
        } => {
            service.stage_in(&local, &remote, recursive).await?;
        }
        Commands::Get {
            remote,
            local,
            recursive,
        } => {
            service.stage_out(&remote, &local, recursive).await?;
        }
    }
    Ok(())
}
