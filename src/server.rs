//! Process lifecycle
//!
//! Creates the store and cluster, joins with exponential backoff, serves the
//! HTTP API and runs the reconciliation loop until a signal arrives or the
//! API stops. The loop leaves the cluster on its way out.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoffBuilder;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};

use crate::{
    api::{build_router, AppState},
    config::{BackoffSettings, Config},
    discovery::discover_seeds,
    mesh::{Cluster, ClusterError, ReconcileStats, Reconciler, ReplicatedStore, UdpTransport},
    version,
};

pub async fn run(config: Config) -> Result<()> {
    info!(version = %version::get_version_string(), "Starting gossipkv");

    let store = ReplicatedStore::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
    let transport = UdpTransport::new(config.udp_config());

    let cluster = Cluster::create(
        config.node(),
        &transport,
        config.cluster_config(),
        store.clone(),
        inbound_tx,
    )
    .await
    .context("Failed to create cluster")?;
    let cluster = Arc::new(cluster);

    let contacted = join_with_backoff(&cluster, &config)
        .await
        .context("Failed to join cluster")?;
    info!(contacted, "Cluster join complete");
    for member in cluster.members() {
        info!(member = %member.name, address = %member.endpoint(), "Cluster member");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn(signal_task(shutdown_tx.clone()));

    let listener = TcpListener::bind(config.api_addr())
        .await
        .with_context(|| format!("Failed to bind API on {}", config.api_addr()))?;
    info!(listen = %config.api_addr(), "API listening");

    let app = build_router(AppState::new(store.clone(), cluster.clone()));
    let api_shutdown = shutdown_rx.clone();
    let api_stop = shutdown_tx.clone();
    let api = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(api_shutdown))
            .await;
        if let Err(e) = &result {
            error!(error = %e, "API server failed");
        }
        warn!("API stopped");
        api_stop.send_replace(true);
        result
    });

    let reconciler = Reconciler::new(
        cluster.clone(),
        store,
        inbound_rx,
        config.reconciler_config(),
    );
    let stats: ReconcileStats = reconciler.run(shutdown_rx).await;
    info!(?stats, "Reconciliation finished");

    shutdown_tx.send_replace(true);
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "API exited with error"),
        Err(e) => warn!(error = %e, "API task failed"),
    }

    info!("Shutting down");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Join through discovered seeds, retrying transient failures until the
/// configured budget runs out.
///
/// A failed lookup or a lookup that yields no seeds is retried. Only a node
/// configured with neither a discovery host nor explicit seeds starts a new
/// cluster on its own.
pub async fn join_with_backoff(cluster: &Cluster, config: &Config) -> Result<usize> {
    let policy = backoff_policy(&config.backoff_settings());
    let standalone = config.service_discovery_host.is_empty() && config.seeds.is_empty();

    let operation = move || async move {
        if standalone {
            warn!("No discovery host or seeds configured, starting a new cluster");
            return cluster
                .join(&[])
                .await
                .map_err(|e| backoff::Error::permanent(anyhow!(e)));
        }
        let seeds = match discover_seeds(
            &config.service_discovery_host,
            config.cluster_port,
            &config.seeds,
        )
        .await
        {
            Ok(seeds) => seeds,
            Err(e) => return Err(backoff::Error::transient(e)),
        };
        if seeds.is_empty() {
            return Err(backoff::Error::transient(anyhow!(
                "No seeds discovered from {}",
                config.service_discovery_host
            )));
        }
        match cluster.join(&seeds).await {
            Ok(contacted) => Ok(contacted),
            Err(ClusterError::Membership(e)) if e.is_transient() => {
                Err(backoff::Error::transient(anyhow!(e)))
            }
            Err(e) => Err(backoff::Error::permanent(anyhow!(e))),
        }
    };

    let notify = |err: anyhow::Error, wait: Duration| {
        error!(error = %err, retry_in = ?wait, "Cluster join failed");
    };

    backoff::future::retry_notify(policy, operation, notify).await
}

pub fn backoff_policy(settings: &BackoffSettings) -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(settings.initial_interval)
        .with_multiplier(settings.multiplier)
        .with_max_interval(settings.max_interval)
        .with_max_elapsed_time(Some(settings.max_elapsed))
        .build()
}

async fn signal_task(shutdown: Arc<watch::Sender<bool>>) {
    match wait_for_signal().await {
        Ok(name) => warn!(signal = name, "Stop signal received"),
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            return;
        }
    }
    shutdown.send_replace(true);
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
