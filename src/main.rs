//! AutoMQ Kubernetes Operator
//!
//! Runs the AutoMQ controller against the cluster in the current kubeconfig
//! or service account.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! OPERATOR_APIS_SVC_NAME=automq-operator-apis automq-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug automq-operator --apis-service-name automq-operator-apis
//! ```

use automq_operator::api::{shutdown_channel, KubeApi};
use automq_operator::config::{OperatorArgs, OperatorConfig};
use automq_operator::controllers;
use automq_operator::leader_election::{self, LeaderElector};
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = OperatorArgs::parse();
    let config = OperatorConfig::from_args(&args)?;

    info!(
        leader_election = args.leader_election,
        namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        apis = %config.apis_address(),
        "starting AutoMQ operator"
    );

    let client = Client::try_default().await?;
    info!("connected to Kubernetes API server");

    // Acquire the lease before starting the controller
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        let api = Arc::new(KubeApi::new(client.clone(), config.request_timeout));
        let elector = LeaderElector::new(api, &ns, leader_election::detect_identity());
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let (trigger, shutdown) = shutdown_channel();
    let controller_handle = tokio::spawn(controllers::run(client, config, shutdown));

    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "failed to renew leader lease");
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = controller_handle => {
            match result {
                Ok(Ok(())) => info!("controller exited"),
                Ok(Err(e)) => error!(error = %e, "controller failed"),
                Err(e) => error!(error = %e, "controller task failed"),
            }
        }
        _ = renew_handle => {
            error!("leader lease lost, initiating shutdown");
        }
    }
    trigger.trigger();

    // Release the lease so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("AutoMQ operator shutting down");
    Ok(())
}
