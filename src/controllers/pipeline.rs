//! Reconcile pipeline
//!
//! An ordered list of independent convergence steps. Each step owns one
//! condition type and reports [`StepOutcome::Ready`] or
//! [`StepOutcome::Degraded`]; a degraded step never stops the steps after
//! it. The orchestrator folds the outcomes into the status conditions.

use crate::api::{create_or_update, ClusterApi, OperationResult, RetryPolicy, Shutdown};
use crate::conditions::{
    Condition, ConditionStatus, CONDITION_BOOTSTRAP_READY, CONDITION_BROKER_READY,
    CONDITION_BROKER_SCALE, CONDITION_CONFIGMAP_READY, CONDITION_CONTROLLER_READY,
    CONDITION_CONTROLLER_SCALE, CONDITION_S3_READY,
};
use crate::config::OperatorConfig;
use crate::controllers::scale;
use crate::crd::AutoMQ;
use crate::error::Result;
use crate::resources::{
    allocated_node_port, build_bootstrap_service, build_deployment, build_pvc,
    build_role_service, build_script_configmap, merge_configmap, merge_deployment, merge_pvc,
    merge_service, resource_name, Role, WorkloadInput,
};
use crate::storage::{BucketFactory, StorageConfig};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// What a step sees: the AutoMQ as fetched (previous status included) and
/// the collaborators it may call.
pub struct StepContext<'a, A: ClusterApi> {
    pub api: &'a A,
    pub automq: &'a AutoMQ,
    pub config: &'a OperatorConfig,
    pub retry: &'a RetryPolicy,
    pub shutdown: &'a Shutdown,
    pub storage: &'a dyn BucketFactory,
    pub script_hash: &'a str,
}

impl<A: ClusterApi> StepContext<'_, A> {
    fn name(&self) -> String {
        self.automq.name_any()
    }

    fn namespace(&self) -> String {
        self.automq.namespace().unwrap_or_default()
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ready { reason: String, message: String },
    Degraded { reason: String, message: String },
}

impl StepOutcome {
    pub fn ready(reason: &str, message: impl Into<String>) -> Self {
        StepOutcome::Ready {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn degraded(reason: &str, message: impl Into<String>) -> Self {
        StepOutcome::Degraded {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, StepOutcome::Ready { .. })
    }

    /// Condition of `condition_type` reporting this outcome.
    pub fn to_condition(&self, condition_type: &str) -> Condition {
        match self {
            StepOutcome::Ready { reason, message } => {
                Condition::new(condition_type, ConditionStatus::True, reason, message)
            }
            StepOutcome::Degraded { reason, message } => {
                Condition::new(condition_type, ConditionStatus::False, reason, message)
            }
        }
    }
}

/// One convergence step of the pipeline
#[async_trait]
pub trait ReconcileStep<A: ClusterApi>: Send + Sync {
    /// Condition type this step writes
    fn condition_type(&self) -> &'static str;

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome;
}

/// The steps in the order they run.
pub fn default_steps<A: ClusterApi>() -> Vec<Box<dyn ReconcileStep<A>>> {
    vec![
        Box::new(EnsureBucket),
        Box::new(EnsureScriptConfig),
        Box::new(ScaleRole(Role::Controller)),
        Box::new(SyncRole(Role::Controller)),
        Box::new(ScaleRole(Role::Broker)),
        Box::new(SyncRole(Role::Broker)),
        Box::new(SyncBootstrapService),
    ]
}

/// Run every step in order and collect `(condition type, outcome)` pairs.
pub async fn run_steps<A: ClusterApi>(
    steps: &[Box<dyn ReconcileStep<A>>],
    ctx: &StepContext<'_, A>,
) -> Vec<(&'static str, StepOutcome)> {
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        let outcome = step.run(ctx).await;
        if let StepOutcome::Degraded { reason, message } = &outcome {
            warn!(
                name = %ctx.name(),
                namespace = %ctx.namespace(),
                condition = step.condition_type(),
                reason = %reason,
                message = %message,
                "step degraded"
            );
        }
        outcomes.push((step.condition_type(), outcome));
    }
    outcomes
}

fn title(role: Role) -> &'static str {
    match role {
        Role::Controller => "Controller",
        Role::Broker => "Broker",
    }
}

fn log_applied(kind: &str, name: &str, namespace: &str, result: OperationResult) {
    match result {
        OperationResult::Unchanged => {
            debug!(kind, name = %name, namespace = %namespace, "unchanged")
        }
        result => info!(kind, name = %name, namespace = %namespace, result = ?result, "applied"),
    }
}

/// Ensures the object-storage bucket exists.
pub struct EnsureBucket;

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for EnsureBucket {
    fn condition_type(&self) -> &'static str {
        CONDITION_S3_READY
    }

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome {
        let s3 = &ctx.automq.spec.s3;
        let bucket = match ctx.storage.open(&StorageConfig::from_spec(s3), ctx.shutdown) {
            Ok(bucket) => bucket,
            Err(e) => {
                return StepOutcome::degraded(
                    "AwsS3ReconcilingInit",
                    format!(
                        "Failed to init s3 client for the custom resource ({}): ({})",
                        ctx.name(),
                        e
                    ),
                )
            }
        };
        if let Err(e) = bucket.mk_bucket(&s3.bucket).await {
            return StepOutcome::degraded(
                "AwsS3ReconcilingCreate",
                format!(
                    "Failed to create bucket {} for the custom resource ({}): ({})",
                    s3.bucket,
                    ctx.name(),
                    e
                ),
            );
        }
        StepOutcome::ready(
            "AwsS3Reconciling",
            format!("Bucket {} is ready for the custom resource ({})", s3.bucket, ctx.name()),
        )
    }
}

/// Ensures the ConfigMap carrying the entrypoint script exists.
pub struct EnsureScriptConfig;

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for EnsureScriptConfig {
    fn condition_type(&self) -> &'static str {
        CONDITION_CONFIGMAP_READY
    }

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome {
        let desired = build_script_configmap(ctx.automq);
        match create_or_update(ctx.api, ctx.retry, ctx.shutdown, &desired, merge_configmap).await {
            Ok(result) => {
                log_applied("ConfigMap", &desired.name_any(), &ctx.namespace(), result);
                StepOutcome::ready(
                    "ConfigmapReconciling",
                    format!("Configmap is ready for the custom resource ({})", ctx.name()),
                )
            }
            Err(e) => StepOutcome::degraded(
                "ConfigmapReconcilingCreate",
                format!(
                    "Failed to create configmap for the custom resource ({}): ({})",
                    ctx.name(),
                    e
                ),
            ),
        }
    }
}

/// Removes the managed sets of a role above its desired replica count.
pub struct ScaleRole(pub Role);

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for ScaleRole {
    fn condition_type(&self) -> &'static str {
        match self.0 {
            Role::Controller => CONDITION_CONTROLLER_SCALE,
            Role::Broker => CONDITION_BROKER_SCALE,
        }
    }

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome {
        let role = self.0;
        let desired = role.spec(&ctx.automq.spec).replicas;
        let observed = ctx
            .automq
            .status
            .as_ref()
            .map(|s| match role {
                Role::Controller => s.controller_replicas,
                Role::Broker => s.broker_replicas,
            })
            .unwrap_or_default();

        scale::scale_down(ctx.api, &ctx.namespace(), role, desired, observed).await;
        StepOutcome::ready(
            &format!("{}ScaleReconciling", title(role)),
            format!("Scale {} to {} replicas for the custom resource ({})", role, desired, ctx.name()),
        )
    }
}

/// Materializes PVC, Service and Deployment for every index of a role.
pub struct SyncRole(pub Role);

impl SyncRole {
    async fn sync_index<A: ClusterApi>(
        &self,
        ctx: &StepContext<'_, A>,
        index: i32,
    ) -> std::result::Result<(), StepOutcome> {
        let role = self.0;
        let namespace = ctx.namespace();
        let name = resource_name(role, index);
        let failed = |what: &str, reason: &str, e: crate::error::OperatorError| {
            StepOutcome::degraded(
                &format!("{}{}Reconciling", title(role), reason),
                format!(
                    "Failed to create {} {} for the custom resource ({}): ({})",
                    what,
                    name,
                    ctx.name(),
                    e
                ),
            )
        };

        let pvc = build_pvc(ctx.automq, role, index);
        let result = create_or_update(ctx.api, ctx.retry, ctx.shutdown, &pvc, merge_pvc)
            .await
            .map_err(|e| failed("pvc", "PVC", e))?;
        log_applied("PersistentVolumeClaim", &name, &namespace, result);

        let service = build_role_service(ctx.automq, role, index);
        let result = create_or_update(ctx.api, ctx.retry, ctx.shutdown, &service, merge_service)
            .await
            .map_err(|e| failed("service", "Service", e))?;
        log_applied("Service", &name, &namespace, result);

        let node_port = match role {
            Role::Broker => self
                .live_node_port(ctx, &namespace, &name)
                .await
                .map_err(|e| failed("service", "Service", e))?,
            Role::Controller => 0,
        };

        let deployment = build_deployment(&WorkloadInput {
            automq: ctx.automq,
            role,
            index,
            node_port,
            script_hash: ctx.script_hash,
            config: ctx.config,
        });
        let result =
            create_or_update(ctx.api, ctx.retry, ctx.shutdown, &deployment, merge_deployment)
                .await
                .map_err(|e| failed("deployment", "STS", e))?;
        log_applied("Deployment", &name, &namespace, result);
        Ok(())
    }

    async fn live_node_port<A: ClusterApi>(
        &self,
        ctx: &StepContext<'_, A>,
        namespace: &str,
        name: &str,
    ) -> Result<i32> {
        let service = ctx.api.get::<Service>(namespace, name).await?;
        Ok(service.as_ref().map(allocated_node_port).unwrap_or_default())
    }
}

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for SyncRole {
    fn condition_type(&self) -> &'static str {
        match self.0 {
            Role::Controller => CONDITION_CONTROLLER_READY,
            Role::Broker => CONDITION_BROKER_READY,
        }
    }

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome {
        let role = self.0;
        let replicas = role.spec(&ctx.automq.spec).replicas;
        for index in 0..replicas {
            if let Err(outcome) = self.sync_index(ctx, index).await {
                return outcome;
            }
        }
        StepOutcome::ready(
            &format!("{}Reconciling", title(role)),
            format!(
                "{} {} replicas are synced for the custom resource ({})",
                title(role),
                replicas.max(0),
                ctx.name()
            ),
        )
    }
}

/// Ensures the broker bootstrap NodePort Service.
pub struct SyncBootstrapService;

#[async_trait]
impl<A: ClusterApi> ReconcileStep<A> for SyncBootstrapService {
    fn condition_type(&self) -> &'static str {
        CONDITION_BOOTSTRAP_READY
    }

    async fn run(&self, ctx: &StepContext<'_, A>) -> StepOutcome {
        let desired = build_bootstrap_service(ctx.automq);
        match create_or_update(ctx.api, ctx.retry, ctx.shutdown, &desired, merge_service).await {
            Ok(result) => {
                log_applied("Service", &desired.name_any(), &ctx.namespace(), result);
                StepOutcome::ready(
                    "BootstrapServiceReconciling",
                    format!("Bootstrap service is ready for the custom resource ({})", ctx.name()),
                )
            }
            Err(e) => StepOutcome::degraded(
                "BootstrapServiceReconciling",
                format!(
                    "Failed to create bootstrap service for the custom resource ({}): ({})",
                    ctx.name(),
                    e
                ),
            ),
        }
    }
}
