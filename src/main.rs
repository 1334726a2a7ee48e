use futures::StreamExt;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use kokeilu::config::ControllerConfig;
use kokeilu::controller::{error_policy, reconcile, Context};
use kokeilu::crd::experiment::Experiment;
use kokeilu::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest and kube both link rustls; pin the ring backend
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting kokeilu experiment controller");

    let config = ControllerConfig::from_env()?;
    info!(
        health_port = config.health_port,
        concurrency = config.concurrency,
        analytics_endpoint = ?config.analytics_endpoint,
        watch_namespace = ?config.watch_namespace,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(Context::new(
        client.clone(),
        config.clone(),
        Some(metrics.clone()),
    ));

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_cache = ctx.cache.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, health_cache).await
        {
            warn!(error = %e, "Health server failed");
        }
    });

    let experiments: Api<Experiment> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    // OS signal flips readiness off and tells the controller to drain
    let signal_readiness = readiness.clone();
    let signal_handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
        }
        // Mark not ready so K8s stops sending traffic during shutdown
        signal_readiness.set_not_ready();
        shutdown_controller.shutdown();
    });

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // in-flight passes finish before the stream ends
    let mut drain = shutdown_signal.clone();
    // error_policy already logs errors with warn!, so only successes are logged here
    Controller::new(experiments, watcher::Config::default())
        .with_config(ControllerRuntimeConfig::default().concurrency(config.concurrency))
        .graceful_shutdown_on(async move { drain.wait().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
        })
        .await;

    if !shutdown_signal.is_shutdown() {
        warn!("Controller stream ended without a shutdown signal");
    }
    signal_handle.abort();
    health_handle.abort();

    info!("kokeilu controller shut down gracefully");
    Ok(())
}
