//! Job executor.
//!
//! Drives one claimed job on one ready instance through
//! `upload -> start -> poll -> retrieve`, then always releases the instance,
//! computes usage and records the terminal state. The workload runs as a
//! session-independent remote process, so a dropped SSH connection between
//! polls does not kill it.

use std::io::Write as _;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use gpu::InstanceProvider;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::cost::compute_usage;
use crate::error::{FleetError, Result};
use crate::models::{Instance, Job, JobProgress};
use crate::packer::DatasetPacker;
use crate::retry::RetryPolicy;
use crate::store::{JobOutcome, JobStore, StoreError};
use crate::transport::{shell_quote, RemoteTransport, TransferOptions, TransportError, TransportFactory};
use crate::workload::{
    CompletionSignal, ReportedState, StatusReport, WorkloadCatalog, WorkloadKind, WorkloadProfile,
};

/// Written by the launch wrapper when the workload process exits.
const EXIT_CODE_FILE: &str = ".exit_code";
const EXIT_CODE_TMP: &str = ".exit_code.tmp";

/// Combined stdout/stderr of the workload.
const LOG_FILE: &str = "workload.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Parent of per-job work directories on the instance.
    pub remote_root: String,
    /// Local directory receiving per-job outputs.
    pub output_root: PathBuf,
    /// Completion polling schedule (only the delays are used).
    pub poll: RetryPolicy,
    /// Timeout of short control commands.
    #[serde(with = "crate::config::duration_secs")]
    pub command_timeout: Duration,
    /// Timeout of uploads, downloads and dataset extraction.
    #[serde(with = "crate::config::duration_secs")]
    pub transfer_timeout: Duration,
    /// Consecutive failed polls tolerated before the instance is given up on.
    pub max_transport_failures: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_root: "/workspace/fleet".to_string(),
            output_root: PathBuf::from(".fleet/outputs"),
            poll: RetryPolicy::new(u32::MAX, Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(60))
                .with_multiplier(1.5),
            command_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(1800),
            max_transport_failures: 5,
        }
    }
}

/// Hands an instance back once a job is done with it.
#[async_trait]
pub trait InstanceRelease: Send + Sync {
    /// `healthy` is false when the job failed because of the instance itself.
    async fn release_instance(&self, instance: &Instance, healthy: bool) -> Result<()>;
}

/// Terminates every released instance (one-shot provision-and-run).
pub struct TerminateOnRelease {
    provider: Arc<dyn InstanceProvider>,
}

impl TerminateOnRelease {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl InstanceRelease for TerminateOnRelease {
    async fn release_instance(&self, instance: &Instance, _healthy: bool) -> Result<()> {
        self.provider.terminate_instance(&instance.id).await?;
        info!(instance_id = %instance.id, "Instance terminated after job");
        Ok(())
    }
}

/// A ready instance and a transport to it.
#[derive(Clone)]
pub struct InstanceContext {
    pub instance: Instance,
    pub transport: Arc<dyn RemoteTransport>,
}

impl InstanceContext {
    pub fn new(instance: Instance, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { instance, transport }
    }

    /// Open a transport to `instance`.
    ///
    /// # Errors
    /// Returns an error if the instance has no SSH endpoint yet.
    pub fn connect(instance: &Instance, transports: &dyn TransportFactory) -> Result<Self> {
        let Some(endpoint) = &instance.ssh else {
            return Err(FleetError::InstanceState {
                instance_id: instance.id.clone(),
                status: instance.status.to_string(),
                expected: "reachable".to_string(),
            });
        };
        let transport = transports.connect(endpoint);
        Ok(Self::new(instance.clone(), transport))
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub job_id: uuid::Uuid,
    pub success: bool,
    pub gpu_seconds: u64,
    pub cost_usd: f64,
    /// Where outputs were retrieved to, if anywhere.
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Observed state of the workload process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Running,
    Exited(i32),
    Gone,
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    catalog: Arc<WorkloadCatalog>,
    release: Arc<dyn InstanceRelease>,
    packer: DatasetPacker,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: Arc<WorkloadCatalog>,
        release: Arc<dyn InstanceRelease>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            release,
            packer: DatasetPacker::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_packer(mut self, packer: DatasetPacker) -> Self {
        self.packer = packer;
        self
    }

    /// Run `job` on the instance in `ctx` to a terminal state.
    ///
    /// Never returns early: whatever happens while driving the workload
    /// (including a panic), the instance is released, usage is computed from
    /// the moment of custody until the release returned, and the job is
    /// finished in the store.
    pub async fn process(&self, job: &Job, ctx: InstanceContext) -> ExecutionReport {
        let custody_start = Utc::now();
        info!(
            job_id = %job.id,
            instance_id = %ctx.instance.id,
            request_type = %job.request_type,
            "Executing job"
        );

        let outcome = match AssertUnwindSafe(self.drive(job, &ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(FleetError::Workload("executor panicked".to_string())),
        };

        let healthy = outcome.as_ref().map_or_else(|e| !e.is_instance_fault(), |_| true);
        if let Err(e) = &outcome {
            warn!(job_id = %job.id, error = %e, instance_fault = !healthy, "Job failed");
            if healthy {
                self.fetch_log(job, &ctx).await;
            }
        }

        if let Err(e) = self.release.release_instance(&ctx.instance, healthy).await {
            error!(instance_id = %ctx.instance.id, error = %e, "Failed to release instance");
        }
        let usage = compute_usage(custody_start, Utc::now(), ctx.instance.hourly_rate);

        let (store_outcome, result, error) = match outcome {
            Ok(result) => (
                JobOutcome::Completed {
                    result: result.clone(),
                },
                result,
                None,
            ),
            Err(e) => {
                let message = e.to_string();
                (
                    JobOutcome::Failed {
                        error: message.clone(),
                    },
                    None,
                    Some(message),
                )
            }
        };
        let success = error.is_none();

        match self.store.finish(job.id, store_outcome, Some(usage)).await {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(job_id = %job.id, status = %from, "Job already finished elsewhere");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
        }

        info!(
            job_id = %job.id,
            success,
            gpu_seconds = usage.gpu_seconds,
            cost_usd = usage.cost_usd,
            "Job finished"
        );
        ExecutionReport {
            job_id: job.id,
            success,
            gpu_seconds: usage.gpu_seconds,
            cost_usd: usage.cost_usd,
            result,
            error,
        }
    }

    async fn drive(&self, job: &Job, ctx: &InstanceContext) -> Result<Option<String>> {
        let profile = self.catalog.profile(&job.request_type)?.clone();
        let workdir = self.workdir(job);

        self.upload(job, ctx, &profile, &workdir).await?;
        let pid = self.start(job, ctx, &profile, &workdir).await?;
        self.store.mark_running(job.id).await?;
        self.poll(job, ctx, &profile, &workdir, pid).await?;
        self.retrieve(job, ctx, &profile, &workdir).await
    }

    fn workdir(&self, job: &Job) -> String {
        format!("{}/{}", self.config.remote_root.trim_end_matches('/'), job.id)
    }

    fn transfer_opts(&self) -> TransferOptions {
        TransferOptions::default().with_timeout(self.config.transfer_timeout)
    }

    async fn run(&self, ctx: &InstanceContext, command: &str) -> Result<String> {
        Ok(ctx
            .transport
            .exec(command, self.config.command_timeout)
            .await?
            .into_result()?)
    }

    async fn upload(
        &self,
        job: &Job,
        ctx: &InstanceContext,
        profile: &WorkloadProfile,
        workdir: &str,
    ) -> Result<()> {
        self.run(ctx, &format!("mkdir -p {}", shell_quote(workdir))).await?;

        let mut spec = tempfile::NamedTempFile::new()?;
        let document = serde_json::json!({
            "id": job.id,
            "request_type": job.request_type,
            "payload": job.payload,
        });
        spec.write_all(document.to_string().as_bytes())?;
        spec.flush()?;
        ctx.transport
            .upload(spec.path(), &format!("{workdir}/job.json"), self.transfer_opts())
            .await?;

        if profile.kind == WorkloadKind::Training {
            self.stage_dataset(job, ctx, workdir).await?;
        }
        debug!(job_id = %job.id, workdir, "Inputs staged");
        Ok(())
    }

    async fn stage_dataset(&self, job: &Job, ctx: &InstanceContext, workdir: &str) -> Result<()> {
        let inputs = job
            .inputs
            .clone()
            .ok_or_else(|| FleetError::Workload("training job has no input directory".to_string()))?;

        let staging = tempfile::tempdir()?;
        let out_dir = staging.path().to_path_buf();
        let packer = self.packer.clone();
        let packed = tokio::task::spawn_blocking(move || packer.pack(&inputs, &out_dir))
            .await
            .map_err(|e| FleetError::Workload(format!("dataset packing task failed: {e}")))??;

        let sums = staging.path().join("SHA256SUMS");
        tokio::fs::write(&sums, packed.manifest.to_checksum_list()).await?;

        let opts = self.transfer_opts();
        ctx.transport
            .upload(&packed.archive_path, &format!("{workdir}/dataset.tar.gz"), opts)
            .await?;
        ctx.transport
            .upload(&packed.manifest_path, &format!("{workdir}/manifest.json"), opts)
            .await?;
        ctx.transport
            .upload(&sums, &format!("{workdir}/SHA256SUMS"), opts)
            .await?;

        let extract = format!(
            "cd {} && mkdir -p data && tar -xzf dataset.tar.gz -C data && cd data && sha256sum -c --quiet ../SHA256SUMS",
            shell_quote(workdir)
        );
        let output = ctx.transport.exec(&extract, self.config.transfer_timeout).await?;
        if !output.success() {
            return Err(FleetError::Workload(format!(
                "dataset verification failed on instance: {}",
                output.stderr.trim()
            )));
        }

        info!(
            job_id = %job.id,
            files = packed.manifest.file_count,
            bytes = packed.manifest.total_bytes,
            "Dataset uploaded and verified"
        );
        Ok(())
    }

    /// Launch the workload detached from the SSH session and return its PID.
    async fn start(
        &self,
        job: &Job,
        ctx: &InstanceContext,
        profile: &WorkloadProfile,
        workdir: &str,
    ) -> Result<u32> {
        // Written then renamed, so a reader never sees a half-written file.
        let wrapped = format!(
            "{}; echo $? > {EXIT_CODE_TMP} && mv -f {EXIT_CODE_TMP} {EXIT_CODE_FILE}",
            profile.command
        );
        let command = format!(
            "cd {} && rm -f {EXIT_CODE_FILE} {EXIT_CODE_TMP} && {{ setsid nohup sh -c {} > {LOG_FILE} 2>&1 < /dev/null & echo $!; }}",
            shell_quote(workdir),
            shell_quote(&wrapped)
        );
        let stdout = self.run(ctx, &command).await?;
        let pid = stdout
            .lines()
            .last()
            .and_then(|l| l.trim().parse::<u32>().ok())
            .ok_or_else(|| FleetError::Workload(format!("could not read workload PID from `{}`", stdout.trim())))?;

        info!(job_id = %job.id, instance_id = %ctx.instance.id, pid, "Workload started");
        Ok(pid)
    }

    async fn poll(
        &self,
        job: &Job,
        ctx: &InstanceContext,
        profile: &WorkloadProfile,
        workdir: &str,
        pid: u32,
    ) -> Result<()> {
        let deadline = Instant::now() + profile.max_runtime;
        let mut backoff = self.config.poll.backoff();
        let mut failures: u32 = 0;
        let mut last_progress: Option<JobProgress> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(FleetError::RuntimeExceeded(profile.max_runtime.as_secs()));
            }
            sleep(backoff.next_delay().min(deadline - now)).await;

            let report = match self.check(ctx, profile, workdir, pid).await {
                Ok(report) => {
                    failures = 0;
                    report
                }
                Err(e) if e.is_connectivity() => {
                    failures += 1;
                    warn!(
                        job_id = %job.id,
                        failures,
                        max = self.config.max_transport_failures,
                        error = %e,
                        "Poll failed"
                    );
                    if failures >= self.config.max_transport_failures {
                        return Err(e.into());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(progress) = report.progress {
                if last_progress != Some(progress) {
                    debug!(job_id = %job.id, current = progress.current, total = ?progress.total, "Progress");
                    self.store.record_progress(job.id, progress).await?;
                    last_progress = Some(progress);
                    backoff.reset();
                }
            }

            match report.state {
                ReportedState::Running => {}
                ReportedState::Completed => {
                    info!(job_id = %job.id, "Workload completed");
                    return Ok(());
                }
                ReportedState::Failed(message) => return Err(FleetError::Workload(message)),
            }
        }
    }

    /// One completion check. A terminal completion signal wins; otherwise the
    /// process state decides, and an exited process is judged by its exit code.
    async fn check(
        &self,
        ctx: &InstanceContext,
        profile: &WorkloadProfile,
        workdir: &str,
        pid: u32,
    ) -> std::result::Result<StatusReport, TransportError> {
        let timeout = self.config.command_timeout;
        let wd = shell_quote(workdir);

        let liveness = ctx
            .transport
            .exec(
                &format!(
                    "cat {wd}/{EXIT_CODE_FILE} 2>/dev/null || (kill -0 {pid} 2>/dev/null && echo running) \
                     || cat {wd}/{EXIT_CODE_FILE} 2>/dev/null || echo gone"
                ),
                timeout,
            )
            .await?
            .into_result()?;
        let liveness = parse_liveness(&liveness);

        let signal = match &profile.completion {
            CompletionSignal::StatusFile { path } => Some(format!(
                "cat {wd}/{} 2>/dev/null || true",
                shell_quote(path)
            )),
            CompletionSignal::HttpEndpoint { url } => Some(format!(
                "curl -fsS --max-time 10 {} 2>/dev/null || true",
                shell_quote(url)
            )),
            CompletionSignal::ProcessExit => None,
        };
        let mut report = match signal {
            Some(command) => {
                StatusReport::parse(&ctx.transport.exec(&command, timeout).await?.into_result()?)
            }
            None => StatusReport {
                state: ReportedState::Running,
                progress: None,
            },
        };

        if report.progress.is_none() {
            if let Some(file) = &profile.progress_file {
                let raw = ctx
                    .transport
                    .exec(&format!("cat {wd}/{} 2>/dev/null || true", shell_quote(file)), timeout)
                    .await?
                    .into_result()?;
                report.progress = parse_progress(&raw);
            }
        }

        if report.state == ReportedState::Running {
            report.state = match liveness {
                Liveness::Running => ReportedState::Running,
                Liveness::Exited(0) => ReportedState::Completed,
                Liveness::Exited(code) => {
                    ReportedState::Failed(format!("workload exited with code {code}"))
                }
                Liveness::Gone => {
                    ReportedState::Failed("workload process disappeared without an exit code".to_string())
                }
            };
        }
        Ok(report)
    }

    async fn retrieve(
        &self,
        job: &Job,
        ctx: &InstanceContext,
        profile: &WorkloadProfile,
        workdir: &str,
    ) -> Result<Option<String>> {
        let Some(output_dir) = &profile.output_dir else {
            return Ok(None);
        };
        let local = self.config.output_root.join(job.id.to_string());
        tokio::fs::create_dir_all(&local).await?;
        ctx.transport
            .download(
                &format!("{workdir}/{output_dir}"),
                &local,
                self.transfer_opts().recursive(),
            )
            .await?;
        self.fetch_log(job, ctx).await;

        info!(job_id = %job.id, path = %local.display(), "Outputs retrieved");
        Ok(Some(local.display().to_string()))
    }

    /// Best-effort copy of the workload log next to the job's outputs.
    async fn fetch_log(&self, job: &Job, ctx: &InstanceContext) {
        let local = self.config.output_root.join(job.id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&local).await {
            debug!(job_id = %job.id, error = %e, "Cannot create output directory");
            return;
        }
        let remote = format!("{}/{LOG_FILE}", self.workdir(job));
        let opts = TransferOptions::default().with_timeout(self.config.command_timeout);
        if let Err(e) = ctx.transport.download(&remote, &local.join(LOG_FILE), opts).await {
            debug!(job_id = %job.id, error = %e, "Workload log not retrieved");
        }
    }
}

/// The exit-code file is read again after a failed `kill -0`, so a process
/// that exits between the two checks still reports its code. An empty read
/// is a file still being written.
fn parse_liveness(raw: &str) -> Liveness {
    let line = raw.lines().next().unwrap_or_default().trim();
    match line {
        "running" | "" => Liveness::Running,
        other => other.parse().map_or(Liveness::Gone, Liveness::Exited),
    }
}

/// Progress counters as JSON (`{"current": 3, "total": 10}`), `3/10`, or `3`.
fn parse_progress(raw: &str) -> Option<JobProgress> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(progress) = serde_json::from_str::<JobProgress>(trimmed) {
        return Some(progress);
    }
    let line = trimmed.lines().last()?.trim();
    match line.split_once('/') {
        Some((current, total)) => Some(JobProgress {
            current: current.trim().parse().ok()?,
            total: total.trim().parse().ok(),
        }),
        None => Some(JobProgress {
            current: line.parse().ok()?,
            total: None,
        }),
    }
}
