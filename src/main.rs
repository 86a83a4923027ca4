use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fleetrun::config::{RetryPolicy, RunnerConfig};
use fleetrun::executor::TaskExecutor;
use fleetrun::registry::{CredentialManager, Host, HostRegistry};
use fleetrun::scheduler::{JobScheduler, JobSpec};
use fleetrun::session::{SessionPool, SshTransport};
use fleetrun::shutdown::install_shutdown_handler;
use fleetrun::store::StateStore;
use fleetrun::summary::{summarize, JobSummary};

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(version)]
#[command(about = "Run a command across a fleet of hosts over SSH")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a job and drive it to completion
    Run {
        #[command(flatten)]
        fleet: FleetArgs,

        #[command(flatten)]
        policy: PolicyArgs,

        /// The command to execute on every host
        command: String,
    },
    /// Submit a job without driving it (drive later with `resume`)
    Submit {
        #[command(flatten)]
        fleet: FleetArgs,

        #[command(flatten)]
        policy: PolicyArgs,

        /// The command to execute on every host
        command: String,
    },
    /// Show the summary for a job
    Status {
        #[command(flatten)]
        common: CommonArgs,

        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a job: stop dispatch, cancel waiting tasks
    Cancel {
        #[command(flatten)]
        common: CommonArgs,

        /// The job ID (UUID)
        job_id: String,
    },
    /// Probe SSH connectivity to every host
    Check {
        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// Recover interrupted tasks and drive unfinished jobs to completion
    Resume {
        #[command(flatten)]
        fleet: FleetArgs,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// Path to the state database
    #[arg(long, default_value = "fleetrun.db")]
    store: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(clap::Args, Debug)]
struct FleetArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Target hosts, format: [user@]addr[:port] (repeatable)
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    /// Path to an SSH private key
    #[arg(long, conflicts_with = "password_env")]
    key: Option<PathBuf>,

    /// Environment variable holding the SSH password
    #[arg(long)]
    password_env: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PolicyArgs {
    /// Maximum simultaneously running attempts
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-task command timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Maximum attempts per host, including the first
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_host(spec: &str) -> Result<Host, String> {
    let (user, rest) = match spec.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        Some(_) => return Err(format!("empty user in host spec: {spec}")),
        None => ("root".to_string(), spec),
    };
    let (addr, port) = match rest.rsplit_once(':') {
        Some((addr, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in host spec: {spec}"))?;
            (addr.to_string(), port)
        }
        None => (rest.to_string(), 22),
    };
    if addr.is_empty() {
        return Err(format!("empty address in host spec: {spec}"));
    }
    Ok(Host {
        id: addr.clone(),
        addr,
        port,
        username: user,
        credential: "default".to_string(),
    })
}

struct Environment {
    scheduler: JobScheduler,
    executor: Arc<TaskExecutor>,
    host_ids: Vec<String>,
}

fn build_environment(fleet: &FleetArgs) -> Result<Environment, Box<dyn std::error::Error>> {
    let mut registry = HostRegistry::new();
    let mut host_ids = Vec::new();
    for spec in &fleet.hosts {
        let host = parse_host(spec)?;
        host_ids.push(host.id.clone());
        registry.register(host);
    }

    let mut credentials = CredentialManager::new();
    if let Some(key) = &fleet.key {
        credentials.add_key_file("default", key.clone(), None);
    } else if let Some(var) = &fleet.password_env {
        let password = std::env::var(var)
            .map_err(|_| format!("password environment variable {var} is not set"))?;
        credentials.add_password("default", password);
    } else {
        return Err("one of --key or --password-env is required".into());
    }

    let config = RunnerConfig {
        store_path: fleet.common.store.clone(),
        ..RunnerConfig::default()
    };
    let registry = Arc::new(registry);
    let pool = Arc::new(SessionPool::new(
        Arc::new(SshTransport::new(config.pool.connect_timeout)),
        Arc::clone(&registry),
        Arc::new(credentials),
        config.pool,
    ));
    let executor = Arc::new(TaskExecutor::new(pool, config.capture));
    let store = StateStore::open(&config.store_path)?;
    let scheduler = JobScheduler::new(store, Arc::clone(&executor), registry, config);

    Ok(Environment {
        scheduler,
        executor,
        host_ids,
    })
}

fn job_spec(command: String, host_ids: Vec<String>, policy: &PolicyArgs) -> JobSpec {
    JobSpec {
        command,
        hosts: host_ids,
        concurrency: policy.concurrency,
        retry: policy.max_attempts.map(|max_attempts| RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        }),
        timeout: policy.timeout_secs.map(Duration::from_secs),
    }
}

fn print_summary(summary: &JobSummary, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Table => {
            println!("Job:     {}", summary.job_id);
            println!("Command: {}", summary.command);
            println!("Status:  {}", summary.status.as_str());
            println!();
            println!("{:<24} {:<12} {:<9} {:<16} DETAIL", "HOST", "STATUS", "ATTEMPTS", "OUTCOME");
            println!("{}", "-".repeat(78));
            for host in &summary.hosts {
                let outcome = host
                    .outcome
                    .map(|o| o.as_str().to_string())
                    .unwrap_or_else(|| "-".to_string());
                let detail = match (&host.exit_code, &host.error) {
                    (_, Some(error)) => error.clone(),
                    (Some(code), None) => format!("exit {code}"),
                    (None, None) => String::new(),
                };
                println!(
                    "{:<24} {:<12} {:<9} {:<16} {}",
                    host.host_id,
                    host.status.as_str(),
                    host.attempts,
                    outcome,
                    detail
                );
            }
            println!();
            println!(
                "succeeded: {}  failed: {}  cancelled: {}",
                summary.succeeded.len(),
                summary.failed.len(),
                summary.cancelled.len()
            );
        }
    }
    Ok(())
}

fn exit_code_for(summary: &JobSummary) -> i32 {
    if summary.failed.is_empty() && summary.cancelled.is_empty() {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            fleet,
            policy,
            command,
        } => {
            let env = build_environment(&fleet)?;
            let token = install_shutdown_handler();
            let job_id = env
                .scheduler
                .submit(job_spec(command, env.host_ids.clone(), &policy))?;
            env.scheduler.run(job_id, &token).await?;
            let summary = summarize(env.scheduler.store(), job_id)?;
            print_summary(&summary, &fleet.common.output)?;
            std::process::exit(exit_code_for(&summary));
        }
        Commands::Submit {
            fleet,
            policy,
            command,
        } => {
            let env = build_environment(&fleet)?;
            let job_id = env
                .scheduler
                .submit(job_spec(command, env.host_ids.clone(), &policy))?;
            println!("{job_id}");
        }
        Commands::Status { common, job_id } => {
            let store = StateStore::open(&common.store)?;
            let job_id: Uuid = job_id.parse()?;
            let summary = summarize(&store, job_id)?;
            print_summary(&summary, &common.output)?;
        }
        Commands::Cancel { common, job_id } => {
            let store = StateStore::open(&common.store)?;
            let job_id: Uuid = job_id.parse()?;
            store.cancel_job(job_id, chrono::Utc::now())?;
            println!("cancellation requested for {job_id}");
        }
        Commands::Check { fleet } => {
            let env = build_environment(&fleet)?;
            let token = install_shutdown_handler();
            let mut all_ok = true;
            for host_id in &env.host_ids {
                let outcome = env
                    .executor
                    .probe(host_id, Duration::from_secs(30), &token)
                    .await;
                if outcome.kind.is_success() {
                    println!("{host_id:<24} ok");
                } else {
                    all_ok = false;
                    let detail = outcome.error.unwrap_or_default();
                    println!("{host_id:<24} {} {detail}", outcome.kind.as_str());
                }
            }
            if !all_ok {
                std::process::exit(1);
            }
        }
        Commands::Resume { fleet } => {
            let env = build_environment(&fleet)?;
            let token = install_shutdown_handler();
            let unfinished = env.scheduler.recover()?;
            if unfinished.is_empty() {
                println!("nothing to resume");
                return Ok(());
            }
            for job_id in unfinished {
                env.scheduler.run(job_id, &token).await?;
                let summary = summarize(env.scheduler.store(), job_id)?;
                print_summary(&summary, &fleet.common.output)?;
            }
        }
    }

    Ok(())
}
