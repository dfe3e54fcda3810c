//! SidecarInjector controller
//!
//! Watch producers feed injector names into a deduplicating [`WorkQueue`];
//! a fixed pool of workers drains it through [`reconciler::sync`]. Failed
//! keys come back after an exponential delay, successful ones have their
//! failure count reset.

#![deny(missing_docs)]

pub mod client;
pub mod error;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod watch;

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use error::ReconcileError;
pub use queue::WorkQueue;
pub use reconciler::{sync, Context, ReconcilerConfig};

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 1;

async fn worker(id: usize, queue: Arc<WorkQueue>, ctx: Arc<Context>) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        match sync(&key, &ctx).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                error!(
                    worker = id,
                    key = %key,
                    requeues = queue.num_requeues(&key),
                    error = %e,
                    "sync failed, requeueing"
                );
                queue.retry(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Run `workers` workers until `shutdown` fires
///
/// Shutdown stops the queue handing out keys; syncs already in flight run
/// to completion before this returns.
pub async fn run_workers(
    queue: Arc<WorkQueue>,
    workers: usize,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) {
    let mut pool = JoinSet::new();
    for id in 0..workers.max(1) {
        pool.spawn(worker(id, queue.clone(), ctx.clone()));
    }

    shutdown.cancelled().await;
    info!("shutting down work queue");
    queue.shutdown();
    while pool.join_next().await.is_some() {}
}

/// Watch, queue and reconcile until `shutdown` fires
pub async fn run_controller(
    client: Client,
    config: ReconcilerConfig,
    workers: usize,
    shutdown: CancellationToken,
) {
    let queue = Arc::new(WorkQueue::default());
    let mut producers = watch::spawn_producers(
        client.clone(),
        &config.namespace,
        queue.clone(),
        shutdown.clone(),
    );
    info!(namespace = %config.namespace, workers, "controller started");

    let ctx = Arc::new(Context::from_client(client, config));
    run_workers(queue, workers, ctx, shutdown).await;

    producers.shutdown().await;
    info!("controller stopped");
}
