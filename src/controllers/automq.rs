//! AutoMQ Controller
//!
//! Reconciles AutoMQ custom resources: guards them with a finalizer, runs the
//! step pipeline, and keeps a status refresher alive per resource.

use super::pipeline::{default_steps, run_steps, ReconcileStep, StepContext};
use super::refresher::StatusRefresher;
use super::{scale, status};
use crate::api::{retry_on_conflict, ClusterApi, KubeApi, Managed, RetryPolicy, Shutdown};
use crate::conditions::{now_timestamp, AUTOMQ_FINALIZER};
use crate::config::OperatorConfig;
use crate::crd::AutoMQ;
use crate::error::{OperatorError, Result};
use crate::quorum;
use crate::resources::{script_hash, Role, BOOTSTRAP_SERVICE_NAME};
use crate::storage::{BackendFactory, BucketFactory};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REQUEUE_AFTER: Duration = Duration::from_secs(60);

/// Reconciler for AutoMQ resources
pub struct AutoMQReconciler<A: ClusterApi> {
    api: Arc<A>,
    config: OperatorConfig,
    storage: Arc<dyn BucketFactory>,
    retry: RetryPolicy,
    shutdown: Shutdown,
    refresher: StatusRefresher,
    steps: Vec<Box<dyn ReconcileStep<A>>>,
    script_hash: String,
}

impl<A: ClusterApi> AutoMQReconciler<A> {
    pub fn new(
        api: Arc<A>,
        config: OperatorConfig,
        storage: Arc<dyn BucketFactory>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            api,
            config,
            storage,
            retry: RetryPolicy::default(),
            shutdown,
            refresher: StatusRefresher::new(),
            steps: default_steps(),
            script_hash: script_hash(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the step pipeline run on every pass.
    pub fn with_steps(mut self, steps: Vec<Box<dyn ReconcileStep<A>>>) -> Self {
        self.steps = steps;
        self
    }

    pub fn refresher(&self) -> &StatusRefresher {
        &self.refresher
    }

    /// Reconcile the AutoMQ `namespace/name`.
    pub async fn reconcile_key(&self, namespace: &str, name: &str) -> Result<Action> {
        let key = format!("{}/{}", namespace, name);
        let Some(automq) = self.api.get::<AutoMQ>(namespace, name).await? else {
            debug!(name = %name, namespace = %namespace, "AutoMQ not found, nothing to do");
            self.refresher.stop(&key);
            return Ok(Action::await_change());
        };

        if automq.metadata.deletion_timestamp.is_some() {
            return self.finalize(&automq, &key).await;
        }

        info!(name = %name, namespace = %namespace, "reconciling AutoMQ");
        self.ensure_finalizer(namespace, name).await?;
        self.start_refresher(namespace, name, key);
        self.sync(&automq).await?;

        Ok(Action::requeue(REQUEUE_AFTER))
    }

    /// Recompute and persist the phase of `namespace/name` outside a reconcile.
    pub async fn refresh_status(&self, namespace: &str, name: &str) -> Result<bool> {
        status::refresh(self.api.as_ref(), &self.retry, &self.shutdown, namespace, name).await
    }

    async fn sync(&self, automq: &AutoMQ) -> Result<()> {
        let namespace = automq.namespace().unwrap_or_default();
        let name = automq.name_any();
        let mut status = automq.status_or_default();
        status.controller_addresses = quorum::voters_for(automq);
        status.bootstrap_internal_address = quorum::bootstrap_address(&namespace);

        let ctx = StepContext {
            api: self.api.as_ref(),
            automq,
            config: &self.config,
            retry: &self.retry,
            shutdown: &self.shutdown,
            storage: self.storage.as_ref(),
            script_hash: &self.script_hash,
        };
        let outcomes = run_steps(&self.steps, &ctx).await;
        if self.shutdown.is_triggered() {
            return Err(OperatorError::Cancelled(format!(
                "shutdown during reconcile of {}/{}",
                namespace, name
            )));
        }

        let now = now_timestamp();
        let generation = automq.metadata.generation;
        for (condition_type, outcome) in &outcomes {
            status.conditions.set_at(
                outcome.to_condition(condition_type).with_generation(generation),
                &now,
            );
        }
        status.controller_replicas = automq.spec.controller.replicas;
        status.broker_replicas = automq.spec.broker.replicas;

        status::refresh_phase(self.api.as_ref(), automq, &mut status).await?;
        let written = status::persist_status(
            self.api.as_ref(),
            &self.retry,
            &self.shutdown,
            &namespace,
            &name,
            &status,
        )
        .await?;
        info!(
            name = %name,
            namespace = %namespace,
            phase = %status.phase,
            status_written = written,
            "reconciled AutoMQ"
        );
        Ok(())
    }

    async fn ensure_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.api.as_ref();
        let added = retry_on_conflict(&self.retry, &self.shutdown, move || async move {
            let Some(mut live) = api.get::<AutoMQ>(namespace, name).await? else {
                return Ok(false);
            };
            let finalizers = live.metadata.finalizers.get_or_insert_with(Vec::new);
            if finalizers.iter().any(|f| f == AUTOMQ_FINALIZER) {
                return Ok(false);
            }
            finalizers.push(AUTOMQ_FINALIZER.to_string());
            api.replace(namespace, &live).await?;
            Ok(true)
        })
        .await?;
        if added {
            debug!(name = %name, namespace = %namespace, "added finalizer");
        }
        Ok(())
    }

    fn start_refresher(&self, namespace: &str, name: &str, key: String) {
        let api = self.api.clone();
        let retry = self.retry.clone();
        let shutdown = self.shutdown.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.refresher.ensure_started(
            key,
            self.config.status_refresh,
            self.shutdown.clone(),
            move || {
                let api = api.clone();
                let retry = retry.clone();
                let shutdown = shutdown.clone();
                let namespace = namespace.clone();
                let name = name.clone();
                async move { status::refresh(api.as_ref(), &retry, &shutdown, &namespace, &name).await }
            },
        );
    }

    async fn finalize(&self, automq: &AutoMQ, key: &str) -> Result<Action> {
        let namespace = automq.namespace().unwrap_or_default();
        let name = automq.name_any();
        self.refresher.stop(key);

        let has_finalizer = automq
            .finalizers()
            .iter()
            .any(|f| f == AUTOMQ_FINALIZER);
        if !has_finalizer {
            return Ok(Action::await_change());
        }

        info!(name = %name, namespace = %namespace, "cleaning up AutoMQ");
        self.cleanup(automq, &namespace).await?;

        let api = self.api.as_ref();
        let (ns, n) = (namespace.as_str(), name.as_str());
        retry_on_conflict(&self.retry, &self.shutdown, move || async move {
            let Some(mut live) = api.get::<AutoMQ>(ns, n).await? else {
                return Ok(());
            };
            if let Some(finalizers) = live.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != AUTOMQ_FINALIZER);
            }
            api.replace(ns, &live).await?;
            Ok(())
        })
        .await?;

        info!(name = %name, namespace = %namespace, "finalizer removed");
        Ok(Action::await_change())
    }

    /// Delete every child of `automq`. The first failure aborts the deletion
    /// so the finalizer stays until a later pass succeeds.
    async fn cleanup(&self, automq: &AutoMQ, namespace: &str) -> Result<()> {
        let observed = automq.status_or_default();
        for role in Role::ALL {
            let recorded = match role {
                Role::Controller => observed.controller_replicas,
                Role::Broker => observed.broker_replicas,
            };
            let upto = recorded.max(role.spec(&automq.spec).replicas);
            for index in 0..upto {
                scale::delete_index(self.api.as_ref(), namespace, role, index).await?;
            }
        }
        self.api
            .delete::<Service>(namespace, BOOTSTRAP_SERVICE_NAME)
            .await?;
        self.api
            .delete::<ConfigMap>(namespace, &automq.name_any())
            .await?;
        Ok(())
    }
}

fn scoped<K: Managed>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the AutoMQ controller until the watch stream ends.
pub async fn run(client: Client, config: OperatorConfig, shutdown: Shutdown) -> Result<()> {
    let namespace = config.watch_namespace.clone();
    let automqs: Api<AutoMQ> = scoped(&client, namespace.as_deref());
    let deployments: Api<Deployment> = scoped(&client, namespace.as_deref());
    let services: Api<Service> = scoped(&client, namespace.as_deref());

    let api = Arc::new(KubeApi::new(client, config.request_timeout));
    let reconciler = Arc::new(AutoMQReconciler::new(
        api,
        config,
        Arc::new(BackendFactory),
        shutdown,
    ));
    let refresher = reconciler.refresher().clone();

    info!(namespace = ?namespace, "starting AutoMQ controller");

    Controller::new(automqs, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |automq, ctx| async move {
                let namespace = automq.namespace().unwrap_or_default();
                ctx.reconcile_key(&namespace, &automq.name_any()).await
            },
            |automq, err: &OperatorError, _ctx| {
                warn!(
                    name = %automq.name_any(),
                    namespace = ?automq.namespace(),
                    error = %err,
                    "reconcile failed"
                );
                Action::requeue(err.requeue_after())
            },
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, namespace = ?obj.namespace, "reconciled");
                }
                Err(e) => {
                    error!(error = %e, "controller error");
                }
            }
        })
        .await;

    refresher.shutdown();
    info!("AutoMQ controller stopped");
    Ok(())
}
