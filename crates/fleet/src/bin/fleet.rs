//! Fleet CLI - run jobs on rented spot GPUs and keep the fleet clean.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet::config::FleetConfig;
use fleet::executor::{InstanceContext, JobExecutor, TerminateOnRelease};
use fleet::models::{Job, SshEndpoint};
use fleet::packer::DatasetPacker;
use fleet::pool::WarmPoolManager;
use fleet::provision::{instance_label, Provisioner};
use fleet::scheduler::FleetScheduler;
use fleet::store::{JobOutcome, JobStore, LocalJobStore};
use fleet::sweeper::{InstanceSweeper, SweepMode, SweepReport};
use fleet::transport::{shell_quote, RemoteTransport, SshTransport, SshTransportFactory, TransferOptions};
use fleet::Dispatcher;
use gpu::vast::VastAi;
use gpu::InstanceProvider;

/// Exit code for invalid invocations (clap uses the same for usage errors).
const EXIT_USAGE: u8 = 2;

/// Fleet CLI - orchestrate spot GPU instances for training and inference jobs.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Run bursty GPU jobs on rented spot instances")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an instance, run one job on it, and terminate it.
    Run {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Enqueue a job for the `serve` daemon.
    Submit {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Run the dispatcher and sweeper until interrupted.
    Serve,

    /// List jobs in the store.
    Jobs,

    /// List offers matching a workload type's criteria.
    Capacity {
        /// Workload type (instance type key).
        #[arg(long)]
        workload: String,

        /// Maximum offers to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Find and terminate orphaned, stuck and stale instances.
    Cleanup {
        /// Report what would be terminated without terminating (default).
        #[arg(long, default_value = "false", conflicts_with = "force")]
        dry_run: bool,

        /// Terminate what the sweep finds.
        #[arg(long, default_value = "false")]
        force: bool,

        /// Terminate every labelled instance regardless of job state.
        #[arg(long, default_value = "false")]
        terminate_all: bool,
    },

    /// Dataset utilities.
    Dataset {
        #[command(subcommand)]
        command: DatasetCommands,
    },
}

#[derive(clap::Args)]
struct JobArgs {
    /// Request type (see `[workloads.requests]` in the configuration).
    #[arg(long)]
    request_type: String,

    /// Local dataset directory for training jobs.
    #[arg(long)]
    inputs: Option<PathBuf>,

    /// JSON payload forwarded to the workload as `job.json`.
    #[arg(long)]
    payload: Option<String>,

    /// Higher runs first.
    #[arg(long, default_value = "0")]
    priority: i32,
}

#[derive(Subcommand)]
enum DatasetCommands {
    /// Check that a directory is a packable dataset.
    Validate {
        /// Dataset directory.
        dir: PathBuf,
    },

    /// Pack a dataset and upload it to an instance, verifying it remotely.
    PackUpload {
        /// Dataset directory.
        dir: PathBuf,

        /// SSH host of the instance.
        #[arg(long)]
        host: String,

        /// SSH port of the instance.
        #[arg(long, default_value = "22")]
        port: u16,

        /// SSH user.
        #[arg(long, default_value = "root")]
        user: String,

        /// Remote directory receiving the dataset.
        #[arg(long, default_value = "/workspace/data")]
        remote_dir: String,
    },
}

/// An invocation that can never succeed as written.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            if e.downcast_ref::<UsageError>().is_some() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Returns whether the operation succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = FleetConfig::load(cli.config.as_deref())
        .map_err(|e| UsageError(e.to_string()))?;

    match cli.command {
        Commands::Run { job } => cmd_run(&config, job).await,
        Commands::Submit { job } => cmd_submit(&config, job).await,
        Commands::Serve => cmd_serve(config).await,
        Commands::Jobs => cmd_jobs(&config).await,
        Commands::Capacity { workload, limit } => cmd_capacity(&config, &workload, limit).await,
        Commands::Cleanup {
            dry_run,
            force,
            terminate_all,
        } => cmd_cleanup(&config, force && !dry_run, terminate_all).await,
        Commands::Dataset { command } => match command {
            DatasetCommands::Validate { dir } => cmd_dataset_validate(&dir),
            DatasetCommands::PackUpload {
                dir,
                host,
                port,
                user,
                remote_dir,
            } => {
                let endpoint = SshEndpoint {
                    host,
                    port,
                    user,
                };
                cmd_pack_upload(&config, &dir, endpoint, &remote_dir).await
            }
        },
    }
}

fn provider(config: &FleetConfig) -> Result<Arc<dyn InstanceProvider>> {
    let api_key = config.api_key().map_err(|e| UsageError(e.to_string()))?;
    let provider = VastAi::new(api_key).context("Failed to create provider client")?;
    Ok(Arc::new(provider))
}

async fn store(config: &FleetConfig) -> Result<Arc<dyn JobStore>> {
    let store = LocalJobStore::open(&config.connection.store_path)
        .await
        .context("Failed to open job store")?;
    Ok(Arc::new(store))
}

fn provisioner(config: &FleetConfig, provider: Arc<dyn InstanceProvider>) -> Result<Provisioner> {
    let transports = Arc::new(SshTransportFactory::new(config.connection.ssh_key_path.clone()));
    let public_key = config.public_key().map_err(|e| UsageError(e.to_string()))?;
    Ok(Provisioner::new(provider, transports, config.provision.clone()).with_public_key(public_key))
}

fn build_job(config: &FleetConfig, args: JobArgs) -> Result<Job> {
    let profile = config
        .workloads
        .profile(&args.request_type)
        .map_err(|e| UsageError(e.to_string()))?;
    if profile.kind == fleet::WorkloadKind::Training && args.inputs.is_none() {
        return Err(UsageError(format!("request type `{}` needs --inputs", args.request_type)).into());
    }

    let mut job = Job::new(args.request_type).with_priority(args.priority);
    if let Some(inputs) = args.inputs {
        job = job.with_inputs(inputs);
    }
    if let Some(payload) = args.payload {
        let payload = serde_json::from_str(&payload)
            .map_err(|e| UsageError(format!("--payload is not valid JSON: {e}")))?;
        job = job.with_payload(payload);
    }
    Ok(job)
}

async fn cmd_submit(config: &FleetConfig, args: JobArgs) -> Result<bool> {
    let job = build_job(config, args)?;
    let store = store(config).await?;
    let id = job.id;
    store.insert(job).await?;
    info!(job_id = %id, "Job submitted");
    println!("{id}");
    Ok(true)
}

async fn cmd_run(config: &FleetConfig, args: JobArgs) -> Result<bool> {
    let job = build_job(config, args)?;
    let profile = config.workloads.profile(&job.request_type)?.clone();
    let spec = config.workloads.instance_spec(&profile.workload_type)?.clone();

    let provider = provider(config)?;
    let store = store(config).await?;
    let provisioner = provisioner(config, Arc::clone(&provider))?;
    let catalog = Arc::new(config.workloads.clone());
    let executor = JobExecutor::new(
        Arc::clone(&store),
        catalog,
        Arc::new(TerminateOnRelease::new(Arc::clone(&provider))),
        config.executor.clone(),
    );

    let job_id = job.id;
    store.insert(job).await?;

    let label = instance_label(&config.connection.label_prefix, &profile.workload_type);
    let mut instance = match provisioner.launch(&profile.workload_type, &spec, &label).await {
        Ok(instance) => instance,
        Err(e) => {
            store
                .finish(job_id, JobOutcome::Failed { error: e.to_string() }, None)
                .await?;
            return Err(e).context("Provisioning failed");
        }
    };
    println!("🚀 Provisioned instance {} (${:.3}/h)", instance.id, instance.hourly_rate);

    let work = async {
        provisioner.await_ready(&mut instance).await?;
        println!("✅ Instance {} ready", instance.id);
        let claimed = store
            .claim(job_id, &instance.id)
            .await?
            .context("Job was claimed by another process")?;
        let ctx = InstanceContext::connect(&instance, provisioner.transports().as_ref())?;
        anyhow::Ok(executor.process(&claimed, ctx).await)
    };

    let outcome = tokio::select! {
        outcome = work => outcome,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.success)
        }
        Err(e) => {
            // Interrupted or failed before the executor released the instance.
            provisioner.terminate(&instance.id).await;
            if let Err(store_err) = store
                .finish(job_id, JobOutcome::Failed { error: e.to_string() }, None)
                .await
            {
                warn!(job_id = %job_id, error = %store_err, "Job already finished");
            }
            Err(e)
        }
    }
}

async fn cmd_serve(config: FleetConfig) -> Result<bool> {
    let provider = provider(&config)?;
    let store = store(&config).await?;
    let provisioner = Arc::new(provisioner(&config, Arc::clone(&provider))?);
    let transports = Arc::clone(provisioner.transports());
    let catalog = Arc::new(config.workloads.clone());

    let mut pool = WarmPoolManager::new(
        Arc::clone(&provisioner),
        Arc::clone(&catalog),
        config.connection.label_prefix.clone(),
    )
    .with_default_policy(config.pool_policy(fleet::config::DEFAULT_POOL_KEY));
    for workload_type in catalog.instance_types.keys() {
        pool = pool.with_policy(workload_type.clone(), config.pool_policy(workload_type));
    }
    let pool = Arc::new(pool);

    let scheduler = Arc::new(FleetScheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&catalog),
    ));
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        Arc::clone(&pool) as Arc<dyn fleet::InstanceRelease>,
        config.executor.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        scheduler,
        Arc::clone(&pool),
        Arc::clone(&store),
        executor,
        transports,
        catalog,
        config.dispatch.clone(),
    ));

    let mut sweeper_config = config.sweeper.clone();
    sweeper_config
        .label_prefix
        .get_or_insert_with(|| config.connection.label_prefix.clone());
    let sweeper = InstanceSweeper::new(provider, store, sweeper_config).with_pool(Arc::clone(&pool));

    let cancel = CancellationToken::new();
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));
    let sweep_cancel = cancel.clone();
    let sweep_task = tokio::spawn(async move { sweeper.run(sweep_cancel).await });

    info!("Fleet daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!(in_flight = dispatcher.in_flight().await, "Shutting down");
    cancel.cancel();
    let dispatcher_ok = joined_cleanly("dispatcher", dispatch_task.await);
    let sweeper_ok = joined_cleanly("sweeper", sweep_task.await);
    let clean = dispatcher_ok && sweeper_ok;

    let remaining = dispatcher.drain(config.dispatch.shutdown_grace).await;
    if remaining > 0 {
        let abandoned = dispatcher.abandon_in_flight().await;
        warn!(remaining, abandoned = abandoned.len(), "Jobs still running at shutdown");
        println!("⚠️  Failed {} job(s) still running at shutdown", abandoned.len());
    }
    let terminated = pool.shutdown().await;
    println!("🛑 Terminated {terminated} pooled instance(s)");
    Ok(clean)
}

/// Logs a background task that panicked or was cancelled.
fn joined_cleanly(task: &str, result: std::result::Result<(), tokio::task::JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(task, error = %e, "Background task failed");
            false
        }
    }
}

async fn cmd_jobs(config: &FleetConfig) -> Result<bool> {
    let store = store(config).await?;
    let jobs = store.list().await?;

    println!(
        "\n{:<38} {:<16} {:<10} {:<14} {:>10} {:>10}",
        "ID", "REQUEST", "STATUS", "INSTANCE", "GPU-SEC", "COST $"
    );
    println!("{}", "-".repeat(102));
    for job in jobs {
        let (secs, cost) = job
            .resource_usage
            .map_or((String::new(), String::new()), |u| {
                (u.gpu_seconds.to_string(), format!("{:.4}", u.cost_usd))
            });
        println!(
            "{:<38} {:<16} {:<10} {:<14} {:>10} {:>10}",
            job.id,
            job.request_type,
            job.status.to_string(),
            job.assigned_instance_id.as_deref().unwrap_or("-"),
            secs,
            cost
        );
        if let Some(error) = &job.error {
            println!("    ↳ {error}");
        }
    }
    println!();
    Ok(true)
}

async fn cmd_capacity(config: &FleetConfig, workload: &str, limit: usize) -> Result<bool> {
    let spec = config
        .workloads
        .instance_spec(workload)
        .map_err(|e| UsageError(e.to_string()))?;
    let provider = provider(config)?;
    let provisioner = provisioner(config, provider)?;
    let offers = provisioner.offers(&spec.offer).await?;

    println!("\n🎮 Offers for `{workload}` ({} matching)", offers.len());
    println!("{}", "=".repeat(86));
    println!(
        "{:<12} {:<18} {:>5} {:>8} {:>10} {:>8}  {}",
        "OFFER", "GPU", "COUNT", "VRAM GB", "$/HOUR", "RELIAB", "LOCATION"
    );
    for offer in offers.iter().take(limit) {
        println!(
            "{:<12} {:<18} {:>5} {:>8} {:>10.3} {:>8}  {}",
            offer.id,
            offer.gpu_name,
            offer.gpu_count,
            offer.gpu_memory_gb.map_or_else(|| "-".to_string(), |m| format!("{m:.0}")),
            offer.hourly_rate,
            offer.reliability.map_or_else(|| "-".to_string(), |r| format!("{r:.3}")),
            offer.location.as_deref().unwrap_or("-")
        );
    }
    println!();
    Ok(!offers.is_empty())
}

async fn cmd_cleanup(config: &FleetConfig, force: bool, terminate_all: bool) -> Result<bool> {
    let provider = provider(config)?;
    let store = store(config).await?;
    let mut sweeper_config = config.sweeper.clone();
    sweeper_config
        .label_prefix
        .get_or_insert_with(|| config.connection.label_prefix.clone());
    let sweeper = InstanceSweeper::new(provider, store, sweeper_config);

    let mode = if force { SweepMode::Enforce } else { SweepMode::DryRun };
    let report = if terminate_all {
        sweeper.terminate_all(mode).await?
    } else {
        sweeper.sweep(mode).await?
    };

    print_report(&report);
    Ok(report.errors.is_empty())
}

fn print_report(report: &SweepReport) {
    let verb = if report.dry_run { "Would terminate" } else { "Terminated" };
    println!("\n🧹 Checked {} instance(s)", report.instances_checked);
    for swept in &report.terminated {
        println!("   {verb} {} ({})", swept.instance_id, swept.reason);
        for job_id in &swept.job_ids {
            println!("      ↳ failed job {job_id}");
        }
    }
    let job_verb = if report.dry_run { "Would fail" } else { "Failed" };
    for swept in &report.failed_jobs {
        println!(
            "   {job_verb} job {} on {} ({})",
            swept.job_id,
            swept.instance_id.as_deref().unwrap_or("-"),
            swept.reason
        );
    }
    for error in &report.errors {
        println!("   ⚠️  {error}");
    }
    if report.dry_run && !(report.terminated.is_empty() && report.failed_jobs.is_empty()) {
        println!("\nDry run. Re-run with --force to terminate.");
    }
    println!();
}

fn cmd_dataset_validate(dir: &Path) -> Result<bool> {
    let summary = DatasetPacker::new()
        .validate(dir)
        .with_context(|| format!("Dataset {} is not valid", dir.display()))?;
    println!(
        "✅ {}: {} file(s), {} bytes",
        dir.display(),
        summary.file_count,
        summary.total_bytes
    );
    Ok(true)
}

async fn cmd_pack_upload(
    config: &FleetConfig,
    dir: &Path,
    endpoint: SshEndpoint,
    remote_dir: &str,
) -> Result<bool> {
    let staging = tempfile::tempdir()?;
    let packer = DatasetPacker::new();
    let source = dir.to_path_buf();
    let out = staging.path().to_path_buf();
    let packed = tokio::task::spawn_blocking(move || packer.pack(&source, &out))
        .await
        .context("Packing task failed")??;
    DatasetPacker::new().verify(&packed.archive_path, &packed.manifest)?;
    println!(
        "📦 Packed {} file(s), {} bytes",
        packed.manifest.file_count, packed.manifest.total_bytes
    );

    let sums = staging.path().join("SHA256SUMS");
    tokio::fs::write(&sums, packed.manifest.to_checksum_list()).await?;

    let transport = SshTransport::new(endpoint.clone(), config.connection.ssh_key_path.clone());
    let timeout = config.executor.transfer_timeout;
    let quoted = shell_quote(remote_dir);
    transport
        .exec(&format!("mkdir -p {quoted}"), config.executor.command_timeout)
        .await?
        .into_result()?;

    let opts = TransferOptions::default().with_timeout(timeout);
    transport
        .upload(&packed.archive_path, &format!("{remote_dir}/dataset.tar.gz"), opts)
        .await?;
    transport
        .upload(&packed.manifest_path, &format!("{remote_dir}/manifest.json"), opts)
        .await?;
    transport
        .upload(&sums, &format!("{remote_dir}/SHA256SUMS"), opts)
        .await?;

    let output = transport
        .exec(
            &format!(
                "cd {quoted} && mkdir -p data && tar -xzf dataset.tar.gz -C data && cd data && sha256sum -c --quiet ../SHA256SUMS"
            ),
            timeout,
        )
        .await?;
    if !output.success() {
        println!("❌ Remote verification failed: {}", output.stderr.trim());
        return Ok(false);
    }

    println!("✅ Dataset uploaded to {endpoint}:{remote_dir}/data and verified");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicked_task_is_reported() {
        let ok = tokio::spawn(async {}).await;
        assert!(joined_cleanly("dispatcher", ok));

        let handle: tokio::task::JoinHandle<()> = tokio::spawn(async { panic!("boom") });
        assert!(!joined_cleanly("sweeper", handle.await));
    }
}
