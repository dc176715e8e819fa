//! Offer fallback, readiness and a one-shot provision-and-run.

mod common;

use std::sync::Arc;

use common::{
    catalog, fast_executor_config, fast_provision_config, offer, FakeProvider, FakeTransport,
    FakeTransportFactory, INFER,
};
use fleet::models::{InstanceStatus, Job, JobStatus, SshEndpoint};
use fleet::provision::instance_label;
use fleet::store::{JobStore, LocalJobStore};
use fleet::{FleetError, InstanceContext, JobExecutor, Provisioner, TerminateOnRelease};
use gpu::{GpuProviderError, InstanceProvider};

fn provisioner(provider: &Arc<FakeProvider>, factory: &Arc<FakeTransportFactory>) -> Provisioner {
    Provisioner::new(
        Arc::clone(provider) as Arc<dyn InstanceProvider>,
        Arc::clone(factory) as Arc<dyn fleet::TransportFactory>,
        fast_provision_config(),
    )
}

#[tokio::test]
async fn test_unavailable_offer_falls_through_to_next() {
    let provider = FakeProvider::with_offers(vec![offer("B", "RTX_4090", 0.55), offer("A", "RTX_4090", 0.42)]);
    provider.mark_unavailable("A");
    let transport = FakeTransport::new();
    transport.script_workload(&["running\n", "0\n"]);
    let factory = FakeTransportFactory::new(Arc::clone(&transport));
    let provisioner = provisioner(&provider, &factory);

    let catalog = catalog();
    let spec = catalog.instance_spec(INFER).unwrap();
    let label = instance_label("fleet", INFER);
    let mut instance = provisioner.launch(INFER, spec, &label).await.unwrap();

    assert_eq!(provider.provision_calls(), 2);
    assert_eq!(provisioner.provisioning_errors(), 1);
    assert_eq!(instance.hourly_rate, 0.55);
    assert_eq!(instance.label, label);
    assert_eq!(instance.status, InstanceStatus::Provisioning);

    provisioner.await_ready(&mut instance).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Ready);
    assert_eq!(instance.ssh, Some(SshEndpoint::new("10.0.1.1", 22001)));
    assert_eq!(factory.endpoints(), vec![SshEndpoint::new("10.0.1.1", 22001)]);

    // The rest of a one-shot run: claim, execute, terminate.
    let store = Arc::new(LocalJobStore::new());
    let job = Job::new("generate");
    let job_id = job.id;
    store.insert(job).await.unwrap();
    let claimed = store.claim(job_id, &instance.id).await.unwrap().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(catalog.clone()),
        Arc::new(TerminateOnRelease::new(Arc::clone(&provider) as Arc<dyn InstanceProvider>)),
        fast_executor_config(tmp.path()),
    );
    let ctx = InstanceContext::connect(&instance, factory.as_ref()).unwrap();
    let report = executor.process(&claimed, ctx).await;

    assert!(report.success, "{:?}", report.error);
    let stored = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.started_at.is_some(), "job never reached running");
    assert_eq!(stored.assigned_instance_id.as_deref(), Some(instance.id.as_str()));
    assert!(provider.live_instances().is_empty());
}

#[tokio::test]
async fn test_attempts_are_bounded() {
    let offers = (1..=5)
        .map(|n| offer(&n.to_string(), "A100", f64::from(n)))
        .collect::<Vec<_>>();
    let provider = FakeProvider::with_offers(offers);
    for n in 1..=5 {
        provider.mark_unavailable(&n.to_string());
    }
    let factory = FakeTransportFactory::new(FakeTransport::new());
    let provisioner = provisioner(&provider, &factory);

    let catalog = catalog();
    let err = provisioner
        .launch(INFER, catalog.instance_spec(INFER).unwrap(), "fleet-infer-x")
        .await
        .unwrap_err();

    assert!(
        matches!(err, FleetError::ProvisioningExhausted { attempts: 3, .. }),
        "{err}"
    );
    assert_eq!(provider.provision_calls(), 3);
    assert_eq!(provisioner.provisioning_errors(), 3);
}

#[tokio::test]
async fn test_no_offers_is_not_retried() {
    let provider = FakeProvider::new();
    let factory = FakeTransportFactory::new(FakeTransport::new());
    let provisioner = provisioner(&provider, &factory);

    let catalog = catalog();
    let err = provisioner
        .launch(INFER, catalog.instance_spec(INFER).unwrap(), "fleet-infer-x")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FleetError::Provider(GpuProviderError::NoOffersAvailable(_))
    ));
    assert_eq!(provider.provision_calls(), 0);
}

#[tokio::test]
async fn test_probe_retries_until_sshd_answers() {
    let provider = FakeProvider::with_offers(vec![offer("A", "A100", 1.1)]);
    let transport = FakeTransport::new();
    transport.refuse_then("echo ready", 3, common::ok("ready\n"));
    let factory = FakeTransportFactory::new(Arc::clone(&transport));
    let provisioner = provisioner(&provider, &factory);

    let catalog = catalog();
    let mut instance = provisioner
        .launch(INFER, catalog.instance_spec(INFER).unwrap(), "fleet-infer-x")
        .await
        .unwrap();
    provisioner.await_ready(&mut instance).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Ready);
    let probes = transport
        .commands()
        .iter()
        .filter(|c| c.as_str() == "echo ready")
        .count();
    assert_eq!(probes, 4);
}

#[tokio::test]
async fn test_failed_probe_command_terminates_instance() {
    let provider = FakeProvider::with_offers(vec![offer("A", "A100", 1.1)]);
    let transport = FakeTransport::new();
    transport.respond("echo ready", vec![common::exit(127, "sh: echo: not found")]);
    let factory = FakeTransportFactory::new(Arc::clone(&transport));
    let provisioner = provisioner(&provider, &factory);

    let catalog = catalog();
    let mut instance = provisioner
        .launch(INFER, catalog.instance_spec(INFER).unwrap(), "fleet-infer-x")
        .await
        .unwrap();
    let result = provisioner.await_ready(&mut instance).await;

    assert!(matches!(result, Err(FleetError::ReadinessTimeout { .. })));
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert_eq!(provider.terminated(), vec![instance.id.clone()]);
}
