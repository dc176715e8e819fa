#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

//! In-process fakes for the provider and the remote transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet::models::SshEndpoint;
use fleet::provision::ProvisionConfig;
use fleet::retry::RetryPolicy;
use fleet::transport::{CommandOutput, RemoteTransport, TransferOptions, TransportError, TransportFactory};
use fleet::workload::{CompletionSignal, InstanceSpec, WorkloadCatalog, WorkloadKind, WorkloadProfile};
use fleet::ExecutorConfig;
use gpu::{
    GpuProviderError, InstanceProvider, Offer, OfferQuery, ProviderInstance, ProviderStatus,
    ProvisionRequest, ProvisionedInstance,
};

pub const TRAIN: &str = "train-a100";
pub const INFER: &str = "infer-4090";

// =============================================================================
// Provider
// =============================================================================

#[derive(Default)]
pub struct FakeProvider {
    offers: Mutex<Vec<Offer>>,
    unavailable: Mutex<HashSet<String>>,
    instances: Mutex<HashMap<String, ProviderInstance>>,
    terminated: Mutex<Vec<String>>,
    next_id: AtomicU64,
    provision_calls: AtomicUsize,
    provision_delay: Mutex<Duration>,
}

pub fn offer(id: &str, gpu: &str, hourly_rate: f64) -> Offer {
    Offer {
        id: id.to_string(),
        gpu_name: gpu.to_string(),
        gpu_count: 1,
        gpu_memory_gb: Some(80.0),
        hourly_rate,
        reliability: Some(0.99),
        disk_gb: Some(200.0),
        location: Some("US".to_string()),
    }
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_offers(offers: Vec<Offer>) -> Arc<Self> {
        let provider = Self::default();
        *provider.offers.lock().unwrap() = offers;
        Arc::new(provider)
    }

    /// Provisioning against `offer_id` fails as if another renter took it.
    pub fn mark_unavailable(&self, offer_id: &str) {
        self.unavailable.lock().unwrap().insert(offer_id.to_string());
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock().unwrap() = delay;
    }

    /// Register an instance that exists at the provider but not locally.
    pub fn add_instance(&self, id: &str, label: &str, created_at: DateTime<Utc>) {
        self.instances.lock().unwrap().insert(
            id.to_string(),
            ProviderInstance {
                id: id.to_string(),
                status: ProviderStatus::Running,
                label: Some(label.to_string()),
                ssh_host: Some("10.0.0.1".to_string()),
                ssh_port: Some(22),
                public_ip: None,
                gpu_type: Some("A100".to_string()),
                hourly_rate: Some(1.2),
                created_at: Some(created_at),
            },
        );
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn live_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn search_offers(&self, _query: &OfferQuery) -> Result<Vec<Offer>, GpuProviderError> {
        Ok(self.offers.lock().unwrap().clone())
    }

    async fn provision_instance(
        &self,
        req: ProvisionRequest,
    ) -> Result<ProvisionedInstance, GpuProviderError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.provision_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.lock().unwrap().contains(&req.offer_id) {
            return Err(GpuProviderError::OfferUnavailable(req.offer_id));
        }

        let rate = self
            .offers
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == req.offer_id)
            .map(|o| o.hourly_rate);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("i-{n}");
        self.instances.lock().unwrap().insert(
            id.clone(),
            ProviderInstance {
                id: id.clone(),
                status: ProviderStatus::Running,
                label: Some(req.label),
                ssh_host: Some(format!("10.0.1.{n}")),
                ssh_port: Some(22_000 + u16::try_from(n).unwrap()),
                public_ip: None,
                gpu_type: Some("A100".to_string()),
                hourly_rate: rate,
                created_at: Some(Utc::now()),
            },
        );
        Ok(ProvisionedInstance {
            instance_id: id,
            status: ProviderStatus::Loading,
        })
    }

    async fn get_instance_status(&self, id: &str) -> Result<ProviderInstance, GpuProviderError> {
        self.instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| GpuProviderError::NotFound(id.to_string()))
    }

    async fn attach_access_credentials(&self, _id: &str, _public_key: &str) -> Result<(), GpuProviderError> {
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), GpuProviderError> {
        self.instances.lock().unwrap().remove(id);
        self.terminated.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, GpuProviderError> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }
}

// =============================================================================
// Transport
// =============================================================================

struct Rule {
    pattern: String,
    responses: VecDeque<Result<CommandOutput, String>>,
}

/// Answers commands from a script; unmatched commands succeed with no output.
#[derive(Default)]
pub struct FakeTransport {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` get `outputs` in order; the last one repeats.
    pub fn respond(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses: outputs.into_iter().map(Ok).collect(),
        });
    }

    /// Commands containing `pattern` fail as if the host were unreachable.
    pub fn refuse(&self, pattern: &str) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses: VecDeque::from([Err("connection refused".to_string())]),
        });
    }

    /// Commands containing `pattern` are refused `times` times, then answered with `output`.
    pub fn refuse_then(&self, pattern: &str, times: usize, output: CommandOutput) {
        let mut responses: VecDeque<_> = (0..times)
            .map(|_| Err("connection refused".to_string()))
            .collect();
        responses.push_back(Ok(output));
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses,
        });
    }

    /// A workload started with PID 4242 that reports `liveness` on successive polls.
    pub fn script_workload(&self, liveness: &[&str]) {
        self.respond("setsid nohup", vec![ok("4242\n")]);
        self.respond(".exit_code", liveness.iter().map(|l| ok(l)).collect());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    fn answer(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.commands.lock().unwrap().push(command.to_string());
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.pattern)) else {
            return Ok(ok(""));
        };
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front().unwrap()
        } else {
            rule.responses.front().cloned().unwrap()
        };
        response.map_err(TransportError::Connection)
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, TransportError> {
        self.answer(command)
    }

    async fn upload(&self, local: &Path, remote: &str, _opts: TransferOptions) -> Result<(), TransportError> {
        assert!(local.exists(), "uploaded file {} is missing", local.display());
        self.uploads.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn download(&self, remote: &str, _local: &Path, _opts: TransferOptions) -> Result<(), TransportError> {
        self.downloads.lock().unwrap().push(remote.to_string());
        Ok(())
    }
}

/// Hands out the same scripted transport for every endpoint.
pub struct FakeTransportFactory {
    pub transport: Arc<FakeTransport>,
    endpoints: Mutex<Vec<SshEndpoint>>,
}

impl FakeTransportFactory {
    pub fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoints(&self) -> Vec<SshEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn connect(&self, endpoint: &SshEndpoint) -> Arc<dyn RemoteTransport> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Arc::clone(&self.transport) as Arc<dyn RemoteTransport>
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// `finetune` trains on [`TRAIN`] instances, `generate` runs inference on [`INFER`].
pub fn catalog() -> WorkloadCatalog {
    let spec = |gpu: &str| InstanceSpec {
        offer: OfferQuery {
            gpu_name: Some(gpu.to_string()),
            ..OfferQuery::default()
        },
        image: "pytorch/pytorch:2.3.0-cuda12.1-cudnn8-runtime".to_string(),
        disk_gb: 60,
    };
    WorkloadCatalog::default()
        .with_instance_type(TRAIN, spec("A100"))
        .with_instance_type(INFER, spec("RTX_4090"))
        .with_request(
            "finetune",
            WorkloadProfile {
                workload_type: TRAIN.to_string(),
                kind: WorkloadKind::Training,
                command: "python train.py --data data".to_string(),
                completion: CompletionSignal::ProcessExit,
                output_dir: Some("outputs".to_string()),
                progress_file: Some("progress.txt".to_string()),
                max_runtime: Duration::from_secs(60),
            },
        )
        .with_request(
            "generate",
            WorkloadProfile {
                workload_type: INFER.to_string(),
                kind: WorkloadKind::Inference,
                command: "python generate.py".to_string(),
                completion: CompletionSignal::ProcessExit,
                output_dir: None,
                progress_file: None,
                max_runtime: Duration::from_secs(60),
            },
        )
}

fn quick(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1)).with_max_delay(Duration::from_millis(5))
}

pub fn fast_provision_config() -> ProvisionConfig {
    ProvisionConfig {
        offer_retry: quick(3),
        readiness_timeout: Duration::from_secs(5),
        status_poll: quick(u32::MAX),
        probe: quick(5),
        probe_timeout: Duration::from_secs(1),
    }
}

pub fn fast_executor_config(output_root: &Path) -> ExecutorConfig {
    ExecutorConfig {
        remote_root: "/workspace/fleet".to_string(),
        output_root: PathBuf::from(output_root),
        poll: quick(u32::MAX),
        command_timeout: Duration::from_secs(1),
        transfer_timeout: Duration::from_secs(5),
        max_transport_failures: 3,
    }
}

/// A small dataset directory.
pub fn dataset(dir: &Path) -> PathBuf {
    let root = dir.join("corpus");
    std::fs::create_dir_all(root.join("shards")).unwrap();
    std::fs::write(root.join("train.jsonl"), "{\"text\": \"hello\"}\n").unwrap();
    std::fs::write(root.join("shards/part-0001.jsonl"), "{\"text\": \"world\"}\n").unwrap();
    root
}
