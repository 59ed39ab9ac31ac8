//! Full reconcile passes against the in-memory orchestration API.

use automq_operator::api::memory::InMemoryApi;
use async_trait::async_trait;
use automq_operator::api::{shutdown_channel, ClusterApi, Shutdown, ShutdownTrigger};
use automq_operator::conditions::{
    AUTOMQ_FINALIZER, CONDITION_BOOTSTRAP_READY, CONDITION_BROKER_READY,
    CONDITION_CONTROLLER_READY, CONDITION_S3_READY,
};
use automq_operator::config::OperatorConfig;
use automq_operator::controllers::pipeline::default_steps;
use automq_operator::controllers::{ReconcileStep, StepContext, StepOutcome};
use automq_operator::crd::{AutoMQ, AutoMQPhase, AutoMQSpec};
use automq_operator::resources::{role_labels, Role};
use automq_operator::storage::memory::{MemoryBucket, MemoryBucketFactory};
use automq_operator::{AutoMQReconciler, OperatorError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, PodCondition, PodStatus, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "mq";
const NAME: &str = "demo";

fn automq(controllers: i32, brokers: i32) -> AutoMQ {
    let spec: AutoMQSpec = serde_json::from_value(serde_json::json!({
        "s3": {
            "endpoint": "http://minio.storage:9000",
            "accessKeyID": "admin",
            "secretAccessKey": "password",
            "bucket": "automq",
            "enablePathStyle": true
        },
        "controller": { "replicas": controllers },
        "broker": { "replicas": brokers }
    }))
    .unwrap();
    let mut automq = AutoMQ::new(NAME, spec);
    automq.metadata.namespace = Some(NS.to_string());
    automq
}

fn reconciler(
    api: &Arc<InMemoryApi>,
    bucket: &MemoryBucket,
    refresh: Duration,
    shutdown: Shutdown,
) -> AutoMQReconciler<InMemoryApi> {
    let config = OperatorConfig {
        status_refresh: refresh,
        ..Default::default()
    };
    AutoMQReconciler::new(
        api.clone(),
        config,
        Arc::new(MemoryBucketFactory::new(bucket.clone())),
        shutdown,
    )
}

struct Harness {
    api: Arc<InMemoryApi>,
    bucket: MemoryBucket,
    reconciler: AutoMQReconciler<InMemoryApi>,
}

impl Harness {
    async fn with(automq: AutoMQ) -> Self {
        Self::with_refresh(automq, Duration::from_secs(3600)).await
    }

    async fn with_refresh(automq: AutoMQ, refresh: Duration) -> Self {
        let api = Arc::new(InMemoryApi::new());
        api.create(NS, &automq).await.unwrap();
        let bucket = MemoryBucket::new();
        let reconciler = reconciler(&api, &bucket, refresh, Shutdown::never());
        Self {
            api,
            bucket,
            reconciler,
        }
    }

    async fn reconcile(&self) -> Action {
        self.reconciler.reconcile_key(NS, NAME).await.unwrap()
    }

    async fn live(&self) -> Option<AutoMQ> {
        self.api.get::<AutoMQ>(NS, NAME).await.unwrap()
    }

    async fn seed_pod(&self, role: Role, index: i32, ready: bool) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("automq-{}-{}-abc", role, index)),
                labels: Some(role_labels(NAME, role)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.api.seed(NS, &pod).unwrap();
    }
}

/// Signals process shutdown from inside the pipeline.
struct TriggerShutdown(ShutdownTrigger);

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for TriggerShutdown {
    fn condition_type(&self) -> &'static str {
        "ShutdownRequested"
    }

    async fn run(&self, _ctx: &StepContext<'_, A>) -> StepOutcome {
        self.0.trigger();
        StepOutcome::ready("Triggered", "")
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_first_reconcile_materializes_cluster() {
    let h = Harness::with(automq(3, 2)).await;
    let action = h.reconcile().await;
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let live = h.live().await.unwrap();
    assert!(live
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&AUTOMQ_FINALIZER.to_string()));
    assert!(h.bucket.has_bucket("automq"));

    let expected = names(&[
        "automq-broker-0",
        "automq-broker-1",
        "automq-controller-0",
        "automq-controller-1",
        "automq-controller-2",
    ]);
    assert_eq!(h.api.names::<Deployment>(NS), expected);
    assert_eq!(h.api.names::<PersistentVolumeClaim>(NS), expected);
    assert_eq!(
        h.api.names::<Service>(NS),
        names(&[
            "automq-broker-0",
            "automq-broker-1",
            "automq-broker-bootstrap",
            "automq-controller-0",
            "automq-controller-1",
            "automq-controller-2",
        ])
    );
    assert_eq!(h.api.names::<ConfigMap>(NS), names(&[NAME]));

    let status = live.status.unwrap();
    assert_eq!(status.controller_replicas, 3);
    assert_eq!(status.broker_replicas, 2);
    assert_eq!(
        status.controller_addresses,
        names(&[
            "0@automq-controller-0.mq.svc:9093",
            "1@automq-controller-1.mq.svc:9093",
            "2@automq-controller-2.mq.svc:9093",
        ])
    );
    assert_eq!(status.bootstrap_internal_address, "automq-broker-bootstrap.mq.svc:9092");
    assert_eq!(status.conditions.len(), 7);
    assert!(status.conditions.all_true());
    assert!(status
        .conditions
        .iter()
        .all(|c| c.observed_generation == Some(1)));
    // No pods are running yet
    assert_eq!(status.phase, AutoMQPhase::InProcess);
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let h = Harness::with(automq(3, 2)).await;
    h.reconcile().await;
    let writes = h.api.write_count();
    let before = h.live().await.unwrap().status;

    h.reconcile().await;
    assert_eq!(h.api.write_count(), writes);
    assert_eq!(h.live().await.unwrap().status, before);
}

#[tokio::test]
async fn test_server_defaults_do_not_cause_rewrites() {
    let h = Harness::with(automq(1, 1)).await;
    h.reconcile().await;

    // Fill in what the API server defaults on admission
    for name in h.api.names::<Deployment>(NS) {
        let mut deploy = h.api.get::<Deployment>(NS, &name).await.unwrap().unwrap();
        let spec = deploy.spec.as_mut().unwrap();
        spec.revision_history_limit = Some(10);
        let pod = spec.template.spec.as_mut().unwrap();
        pod.restart_policy = Some("Always".to_string());
        pod.dns_policy = Some("ClusterFirst".to_string());
        pod.scheduler_name = Some("default-scheduler".to_string());
        for c in pod.containers.iter_mut() {
            c.termination_message_path = Some("/dev/termination-log".to_string());
        }
        h.api.replace(NS, &deploy).await.unwrap();
    }
    let writes = h.api.write_count();

    h.reconcile().await;
    assert_eq!(h.api.write_count(), writes);
}

#[tokio::test]
async fn test_conflicting_writes_are_retried() {
    let h = Harness::with(automq(1, 1)).await;
    h.api.inject_conflicts(2);
    h.reconcile().await;
    let live = h.live().await.unwrap();
    assert!(live.metadata.finalizers.is_some());
    assert!(live.status.unwrap().conditions.all_true());
}

#[tokio::test]
async fn test_scale_down_removes_highest_indices() {
    let h = Harness::with(automq(1, 5)).await;
    h.reconcile().await;
    assert_eq!(h.api.names::<Deployment>(NS).len(), 6);

    let mut live = h.live().await.unwrap();
    live.spec.broker.replicas = 2;
    h.api.replace(NS, &live).await.unwrap();
    h.reconcile().await;

    let expected = names(&["automq-broker-0", "automq-broker-1", "automq-controller-0"]);
    assert_eq!(h.api.names::<Deployment>(NS), expected);
    assert_eq!(h.api.names::<PersistentVolumeClaim>(NS), expected);
    assert_eq!(
        h.api.names::<Service>(NS),
        names(&[
            "automq-broker-0",
            "automq-broker-1",
            "automq-broker-bootstrap",
            "automq-controller-0",
        ])
    );
    let status = h.live().await.unwrap().status.unwrap();
    assert_eq!(status.broker_replicas, 2);
    assert_eq!(
        status.conditions.get(CONDITION_BROKER_READY).unwrap().observed_generation,
        Some(2)
    );
}

#[tokio::test]
async fn test_scale_up_adds_indices() {
    let h = Harness::with(automq(1, 1)).await;
    h.reconcile().await;

    let mut live = h.live().await.unwrap();
    live.spec.broker.replicas = 3;
    h.api.replace(NS, &live).await.unwrap();
    h.reconcile().await;

    assert_eq!(
        h.api.names::<Deployment>(NS),
        names(&[
            "automq-broker-0",
            "automq-broker-1",
            "automq-broker-2",
            "automq-controller-0",
        ])
    );
}

#[tokio::test]
async fn test_pvc_failure_degrades_but_pipeline_continues() {
    let h = Harness::with(automq(1, 1)).await;
    h.api.fail_kind("PersistentVolumeClaim", "exceeded quota");
    h.reconcile().await;

    let status = h.live().await.unwrap().status.unwrap();
    let controller = status.conditions.get(CONDITION_CONTROLLER_READY).unwrap();
    assert!(!controller.is_true());
    assert_eq!(controller.reason.as_deref(), Some("ControllerPVCReconciling"));
    assert!(controller
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("exceeded quota"));
    assert!(!status.conditions.get(CONDITION_BROKER_READY).unwrap().is_true());
    assert!(status.conditions.get(CONDITION_BOOTSTRAP_READY).unwrap().is_true());
    assert!(status.conditions.get(CONDITION_S3_READY).unwrap().is_true());
    assert_eq!(status.phase, AutoMQPhase::Error);
    assert_eq!(h.api.names::<Service>(NS), names(&["automq-broker-bootstrap"]));

    // Recovery on the next pass
    h.api.heal_kind("PersistentVolumeClaim");
    h.reconcile().await;
    let status = h.live().await.unwrap().status.unwrap();
    assert!(status.conditions.all_true());
    assert_eq!(h.api.names::<Deployment>(NS).len(), 2);
}

#[tokio::test]
async fn test_bucket_failure_sets_condition_false() {
    let h = Harness::with(automq(1, 1)).await;
    h.bucket.fail_with("connection refused");
    h.reconcile().await;

    let status = h.live().await.unwrap().status.unwrap();
    let s3 = status.conditions.get(CONDITION_S3_READY).unwrap();
    assert!(!s3.is_true());
    assert_eq!(s3.reason.as_deref(), Some("AwsS3ReconcilingCreate"));
    assert_eq!(status.phase, AutoMQPhase::Error);
    // Workloads are still materialized
    assert_eq!(h.api.names::<Deployment>(NS).len(), 2);
}

#[tokio::test]
async fn test_phase_follows_ready_pods() {
    let h = Harness::with(automq(1, 2)).await;
    h.seed_pod(Role::Controller, 0, true).await;
    h.seed_pod(Role::Broker, 0, true).await;
    h.seed_pod(Role::Broker, 1, false).await;
    h.reconcile().await;

    let status = h.live().await.unwrap().status.unwrap();
    assert_eq!(status.phase, AutoMQPhase::InProcess);
    assert_eq!(status.ready_pods, 2);

    h.seed_pod(Role::Broker, 1, true).await;
    assert!(h.reconciler.refresh_status(NS, NAME).await.unwrap());
    let status = h.live().await.unwrap().status.unwrap();
    assert_eq!(status.phase, AutoMQPhase::Ready);
    assert_eq!(status.ready_pods, 3);
}

#[tokio::test]
async fn test_deletion_removes_children_and_finalizer() {
    let h = Harness::with(automq(2, 2)).await;
    h.reconcile().await;
    assert!(h.reconciler.refresher().is_running("mq/demo"));

    assert!(h.api.delete::<AutoMQ>(NS, NAME).await.unwrap());
    assert!(h.live().await.unwrap().metadata.deletion_timestamp.is_some());

    let action = h.reconcile().await;
    assert_eq!(action, Action::await_change());
    assert!(h.live().await.is_none());
    assert!(h.api.names::<Deployment>(NS).is_empty());
    assert!(h.api.names::<Service>(NS).is_empty());
    assert!(h.api.names::<PersistentVolumeClaim>(NS).is_empty());
    assert!(h.api.names::<ConfigMap>(NS).is_empty());
    assert!(!h.reconciler.refresher().is_running("mq/demo"));

    // Gone objects reconcile as a no-op
    assert_eq!(h.reconcile().await, Action::await_change());
}

#[tokio::test]
async fn test_failed_cleanup_keeps_finalizer() {
    let h = Harness::with(automq(1, 1)).await;
    h.reconcile().await;
    h.api.delete::<AutoMQ>(NS, NAME).await.unwrap();

    h.api.fail_kind("Deployment", "forbidden");
    let err = h.reconciler.reconcile_key(NS, NAME).await.unwrap_err();
    assert!(err.to_string().contains("forbidden"));
    let live = h.live().await.unwrap();
    assert!(live
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&AUTOMQ_FINALIZER.to_string()));

    h.api.heal_kind("Deployment");
    h.reconcile().await;
    assert!(h.live().await.is_none());
    assert!(h.api.names::<Deployment>(NS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refresher_updates_phase_between_reconciles() {
    let h = Harness::with_refresh(automq(1, 1), Duration::from_secs(5)).await;
    h.reconcile().await;
    assert_eq!(
        h.live().await.unwrap().status.unwrap().phase,
        AutoMQPhase::InProcess
    );

    h.seed_pod(Role::Controller, 0, true).await;
    h.seed_pod(Role::Broker, 0, true).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let status = h.live().await.unwrap().status.unwrap();
    assert_eq!(status.phase, AutoMQPhase::Ready);
    assert_eq!(status.ready_pods, 2);

    // Reconciling again does not start a second refresher
    h.reconcile().await;
    assert_eq!(h.reconciler.refresher().active(), 1);
    h.reconciler.refresher().shutdown();
}

#[tokio::test]
async fn test_shutdown_mid_pass_cancels_without_writing_status() {
    let api = Arc::new(InMemoryApi::new());
    api.create(NS, &automq(1, 1)).await.unwrap();
    let bucket = MemoryBucket::new();
    let (trigger, shutdown) = shutdown_channel();
    let mut steps: Vec<Box<dyn ReconcileStep<InMemoryApi>>> =
        vec![Box::new(TriggerShutdown(trigger))];
    steps.extend(default_steps());
    let reconciler =
        reconciler(&api, &bucket, Duration::from_secs(3600), shutdown).with_steps(steps);

    let err = reconciler.reconcile_key(NS, NAME).await.unwrap_err();
    assert!(matches!(err, OperatorError::Cancelled(_)), "got {}", err);

    // The finalizer lands before the pipeline runs; nothing after it is written
    let live = api.get::<AutoMQ>(NS, NAME).await.unwrap().unwrap();
    assert!(live
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&AUTOMQ_FINALIZER.to_string()));
    assert!(live.status.is_none());
    assert!(api.names::<Deployment>(NS).is_empty());
    assert!(api.names::<PersistentVolumeClaim>(NS).is_empty());
    reconciler.refresher().shutdown();
}
