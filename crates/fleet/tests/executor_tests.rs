//! Job executor against a scripted transport.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{catalog, dataset, fast_executor_config, FakeProvider, FakeTransport, INFER, TRAIN};
use fleet::cost::usage_for;
use fleet::models::{Instance, InstanceStatus, Job, JobProgress, JobStatus, SshEndpoint};
use fleet::store::{JobStore, LocalJobStore};
use fleet::transport::RemoteTransport;
use fleet::workload::WorkloadCatalog;
use fleet::{InstanceContext, InstanceRelease, JobExecutor, TerminateOnRelease};
use gpu::InstanceProvider;

/// Records release calls instead of acting on them.
#[derive(Default)]
struct RecordingRelease {
    calls: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl InstanceRelease for RecordingRelease {
    async fn release_instance(&self, instance: &Instance, healthy: bool) -> fleet::Result<()> {
        self.calls.lock().unwrap().push((instance.id.clone(), healthy));
        Ok(())
    }
}

fn busy_instance(id: &str, workload_type: &str, hourly_rate: f64) -> Instance {
    let mut instance = Instance::provisioning(id, workload_type, format!("fleet-{workload_type}-0001"), hourly_rate);
    instance.ssh = Some(SshEndpoint::new("10.0.1.1", 22001));
    instance.status = InstanceStatus::Busy;
    instance
}

async fn claimed(store: &LocalJobStore, job: Job, instance_id: &str) -> Job {
    let id = job.id;
    store.insert(job).await.unwrap();
    store.claim(id, instance_id).await.unwrap().unwrap()
}

fn context(instance: Instance, transport: &Arc<FakeTransport>) -> InstanceContext {
    InstanceContext::new(instance, Arc::clone(transport) as Arc<dyn RemoteTransport>)
}

#[tokio::test]
async fn test_training_job_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let inputs = dataset(tmp.path());
    let store = Arc::new(LocalJobStore::new());
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    transport.script_workload(&["running\n", "running\n", "0\n"]);
    transport.respond(
        "progress.txt",
        vec![common::ok("10/100\n"), common::ok("55/100\n"), common::ok("100/100\n")],
    );

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog()),
        Arc::new(TerminateOnRelease::new(Arc::clone(&provider) as Arc<dyn InstanceProvider>)),
        fast_executor_config(&tmp.path().join("outputs")),
    );

    let job = claimed(&store, Job::new("finetune").with_inputs(&inputs), "i-7").await;
    let report = executor
        .process(&job, context(busy_instance("i-7", TRAIN, 1.8), &transport))
        .await;

    assert!(report.success, "unexpected failure: {:?}", report.error);
    assert!(report.gpu_seconds >= 1);
    assert!((report.cost_usd - usage_for(report.gpu_seconds, 1.8).cost_usd).abs() < 1e-9);

    let uploads = transport.uploads();
    for file in ["job.json", "dataset.tar.gz", "manifest.json", "SHA256SUMS"] {
        assert!(
            uploads.iter().any(|u| u.ends_with(&format!("{}/{file}", job.id))),
            "{file} not uploaded: {uploads:?}"
        );
    }
    assert!(transport.commands().iter().any(|c| c.contains("sha256sum -c")));
    assert!(transport.downloads().iter().any(|d| d.ends_with("/outputs")));
    assert_eq!(provider.terminated(), vec!["i-7".to_string()]);

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.started_at.is_some());
    assert_eq!(
        stored.progress,
        Some(JobProgress {
            current: 100,
            total: Some(100)
        })
    );
    let usage = stored.resource_usage.unwrap();
    assert_eq!(usage.gpu_seconds, report.gpu_seconds);
    assert_eq!(usage.hourly_rate, 1.8);
    assert_eq!(
        stored.result.as_deref(),
        Some(tmp.path().join("outputs").join(job.id.to_string()).display().to_string().as_str())
    );
}

#[tokio::test]
async fn test_nonzero_exit_fails_job_and_keeps_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalJobStore::new());
    let release = Arc::new(RecordingRelease::default());
    let transport = FakeTransport::new();
    transport.script_workload(&["running\n", "3\n"]);

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog()),
        Arc::clone(&release) as Arc<dyn InstanceRelease>,
        fast_executor_config(tmp.path()),
    );
    let job = claimed(
        &store,
        Job::new("generate").with_payload(serde_json::json!({"prompt": "a lighthouse"})),
        "i-2",
    )
    .await;

    let report = executor
        .process(&job, context(busy_instance("i-2", INFER, 0.4), &transport))
        .await;

    assert!(!report.success);
    assert!(report.error.as_deref().unwrap().contains("exited with code 3"));
    assert!(report.gpu_seconds >= 1);
    // A workload failure says nothing about the instance.
    assert_eq!(*release.calls.lock().unwrap(), vec![("i-2".to_string(), true)]);
    assert!(transport.downloads().iter().any(|d| d.ends_with("workload.log")));

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.resource_usage.is_some());
}

#[tokio::test]
async fn test_lost_instance_is_released_unhealthy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalJobStore::new());
    let release = Arc::new(RecordingRelease::default());
    let transport = FakeTransport::new();
    transport.respond("setsid nohup", vec![common::ok("4242\n")]);
    transport.refuse(".exit_code");

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog()),
        Arc::clone(&release) as Arc<dyn InstanceRelease>,
        fast_executor_config(tmp.path()),
    );
    let job = claimed(&store, Job::new("generate"), "i-3").await;

    let report = executor
        .process(&job, context(busy_instance("i-3", INFER, 0.4), &transport))
        .await;

    assert!(!report.success);
    let polls = transport
        .commands()
        .iter()
        .filter(|c| c.contains("kill -0 4242"))
        .count();
    assert_eq!(polls, 3);
    assert_eq!(*release.calls.lock().unwrap(), vec![("i-3".to_string(), false)]);
    assert_eq!(
        store.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_runtime_ceiling_abandons_job() {
    let tmp = tempfile::tempdir().unwrap();
    let mut catalog: WorkloadCatalog = catalog();
    catalog.requests.get_mut("generate").unwrap().max_runtime = Duration::from_millis(50);

    let store = Arc::new(LocalJobStore::new());
    let release = Arc::new(RecordingRelease::default());
    let transport = FakeTransport::new();
    transport.script_workload(&["running\n"]);

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog),
        Arc::clone(&release) as Arc<dyn InstanceRelease>,
        fast_executor_config(tmp.path()),
    );
    let job = claimed(&store, Job::new("generate"), "i-4").await;

    let report = executor
        .process(&job, context(busy_instance("i-4", INFER, 0.4), &transport))
        .await;

    assert!(!report.success);
    assert!(report.error.unwrap().contains("maximum runtime"));
    assert_eq!(*release.calls.lock().unwrap(), vec![("i-4".to_string(), false)]);
}

#[tokio::test]
async fn test_upload_failure_is_billed() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalJobStore::new());
    let release = Arc::new(RecordingRelease::default());
    let transport = FakeTransport::new();
    transport.respond("mkdir -p", vec![common::exit(1, "No space left on device")]);

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog()),
        Arc::clone(&release) as Arc<dyn InstanceRelease>,
        fast_executor_config(tmp.path()),
    );
    let job = claimed(&store, Job::new("generate"), "i-5").await;

    let report = executor
        .process(&job, context(busy_instance("i-5", INFER, 0.4), &transport))
        .await;

    assert!(!report.success);
    assert!(report.error.unwrap().contains("No space left on device"));
    assert_eq!(release.calls.lock().unwrap().len(), 1);

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.started_at.is_none());
    assert!(stored.resource_usage.unwrap().gpu_seconds >= 1);
}

#[tokio::test]
async fn test_exit_code_read_while_being_written_is_not_a_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalJobStore::new());
    let release = Arc::new(RecordingRelease::default());
    let transport = FakeTransport::new();
    transport.script_workload(&["running\n", "", "0\n"]);

    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog()),
        Arc::clone(&release) as Arc<dyn InstanceRelease>,
        fast_executor_config(tmp.path()),
    );
    let job = claimed(&store, Job::new("generate"), "i-6").await;

    let report = executor
        .process(&job, context(busy_instance("i-6", INFER, 0.4), &transport))
        .await;

    assert!(report.success, "unexpected failure: {:?}", report.error);
    assert_eq!(
        store.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let commands = transport.commands();
    let start = commands.iter().find(|c| c.contains("setsid nohup")).unwrap();
    assert!(start.contains("mv -f .exit_code.tmp .exit_code"), "{start}");
    // A process that exits between the first read and `kill -0` is caught
    // by the second read.
    let check = commands.iter().find(|c| c.contains("kill -0 4242")).unwrap();
    let after_kill = &check[check.find("kill -0").unwrap()..];
    assert!(after_kill.contains("cat "), "{check}");
    assert!(check.ends_with("echo gone"), "{check}");
}
