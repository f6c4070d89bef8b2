//! Test utilities for multi-node scenarios

use std::{
    future::Future,
    sync::{Arc, Once},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    codec::MutationMessage,
    membership::{Cluster, ClusterConfig, MembershipFactory, Node},
    reconcile::{apply_mutation, ApplyOutcome, ReconcileStats, Reconciler, ReconcilerConfig},
    store::ReplicatedStore,
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// One node: store, cluster and the receiving end of its inbound channel.
pub struct TestNode {
    pub store: ReplicatedStore,
    pub cluster: Arc<Cluster>,
    pub inbound_tx: mpsc::Sender<Vec<u8>>,
    pub inbound: Option<mpsc::Receiver<Vec<u8>>>,
}

impl TestNode {
    pub async fn create(
        node: Node,
        factory: &dyn MembershipFactory,
        config: ClusterConfig,
    ) -> Self {
        let store = ReplicatedStore::new();
        let (tx, rx) = mpsc::channel(1024);
        let cluster = Cluster::create(node, factory, config, store.clone(), tx.clone())
            .await
            .expect("cluster creation");
        Self {
            store,
            cluster: Arc::new(cluster),
            inbound_tx: tx,
            inbound: Some(rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.cluster.local_node().name
    }

    /// Local write followed by a timestamped broadcast, as the API does it.
    pub fn put(&self, key: &str, value: &str) {
        let at = self.store.set(key, value);
        self.cluster
            .queue_broadcast(&MutationMessage::set(key, value).with_timestamp(at));
    }

    pub fn remove(&self, key: &str) {
        let at = chrono::Utc::now();
        self.store.delete_if_not_newer(key, at);
        self.cluster
            .queue_broadcast(&MutationMessage::delete(key).with_timestamp(at));
    }

    /// Apply everything waiting in the inbound channel without a running loop.
    pub fn drain_inbound(&mut self) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::new();
        if let Some(rx) = self.inbound.as_mut() {
            while let Ok(bytes) = rx.try_recv() {
                if let Some(msg) = MutationMessage::decode(&bytes) {
                    outcomes.push(apply_mutation(&self.store, &msg));
                }
            }
        }
        outcomes
    }

    /// Start the reconciliation loop on this node's inbound channel.
    pub fn spawn_reconciler(
        &mut self,
        config: ReconcilerConfig,
    ) -> (watch::Sender<bool>, JoinHandle<ReconcileStats>) {
        let rx = self.inbound.take().expect("inbound channel already taken");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Reconciler::new(self.cluster.clone(), self.store.clone(), rx, config);
        let handle = tokio::spawn(reconciler.run(shutdown_rx));
        (shutdown_tx, handle)
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_for<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
