//! Bounded pool of delivery workers with request/reply dispatch.
//!
//! The send pipeline hands requests to the pool over a channel and awaits a
//! oneshot reply per request, so a claim transaction waits on results
//! without running the network I/O itself. Workers share one receiver and
//! each handles a single request at a time.

use std::{sync::Arc, thread, time::Duration};

use futures::future::try_join_all;
use httpq_core::DeliveryResponse;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    DEFAULT_WORKER_MULTIPLIER,
};

struct Job {
    request: DeliveryRequest,
    reply: oneshot::Sender<DeliveryResponse>,
}

/// Cloneable handle used to submit deliveries to a running pool.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<Job>,
    cancellation: CancellationToken,
}

impl WorkerHandle {
    /// Delivers one request and waits for its classified response.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WorkerPoolClosed` after shutdown and
    /// `DeliveryError::WorkerPanic` if the worker dropped the request.
    pub async fn dispatch(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        if self.cancellation.is_cancelled() {
            return Err(DeliveryError::WorkerPoolClosed);
        }

        let event_id = request.event_id;
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| DeliveryError::WorkerPoolClosed)?;

        response.await.map_err(|_| {
            if self.cancellation.is_cancelled() {
                DeliveryError::WorkerPoolClosed
            } else {
                DeliveryError::worker_panic(format!("no reply for event {event_id}"))
            }
        })
    }

    /// Delivers every request concurrently and returns the responses in
    /// request order.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any single dispatch fails.
    pub async fn dispatch_all(&self, requests: Vec<DeliveryRequest>) -> Result<Vec<DeliveryResponse>> {
        try_join_all(requests.into_iter().map(|request| self.dispatch(request))).await
    }
}

/// Supervised set of delivery worker tasks.
pub struct WorkerPool {
    handle: WorkerHandle,
    cancellation: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool size for this machine: available parallelism times
    /// [`DEFAULT_WORKER_MULTIPLIER`].
    pub fn default_size() -> usize {
        Self::size_for(DEFAULT_WORKER_MULTIPLIER)
    }

    /// Available parallelism times `multiplier`, at least one.
    pub fn size_for(multiplier: usize) -> usize {
        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        parallelism.saturating_mul(multiplier).max(1)
    }

    /// Spawns `size` workers sharing `client`.
    pub fn start(size: usize, client: DeliveryClient) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(size);
        let receiver = Arc::new(Mutex::new(receiver));
        let cancellation = CancellationToken::new();

        let worker_handles = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let client = client.clone();
                let cancellation = cancellation.clone();
                tokio::spawn(run_worker(worker_id, receiver, client, cancellation))
            })
            .collect();

        info!(worker_count = size, "delivery worker pool started");

        Self {
            handle: WorkerHandle { sender, cancellation: cancellation.clone() },
            cancellation,
            worker_handles,
        }
    }

    /// Handle for submitting deliveries.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Number of spawned workers.
    pub fn size(&self) -> usize {
        self.worker_handles.len()
    }

    /// Stops accepting requests and waits for the workers to exit.
    ///
    /// Workers finish the request they are handling before exiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the workers do not stop in
    /// time and `DeliveryError::WorkerPanic` if a worker panicked.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down delivery worker pool"
        );
        self.cancellation.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;

        let Ok(results) = joined else {
            error!(timeout_seconds = timeout.as_secs(), "worker pool shutdown timed out");
            return Err(DeliveryError::ShutdownTimeout { timeout });
        };

        let panicked: Vec<String> =
            results.into_iter().filter_map(|r| r.err()).map(|e| e.to_string()).collect();
        if !panicked.is_empty() {
            warn!(panicked = panicked.len(), "workers panicked before shutdown");
            return Err(DeliveryError::worker_panic(panicked.join("; ")));
        }

        info!("delivery worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.cancellation.is_cancelled() {
            warn!(
                active_workers = self.worker_handles.len(),
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    client: DeliveryClient,
    cancellation: CancellationToken,
) {
    debug!(worker_id, "delivery worker starting");

    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                () = cancellation.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        let Some(job) = job else {
            break;
        };

        let response = client.deliver(job.request).await;
        if job.reply.send(response).is_err() {
            debug!(worker_id, "dispatcher went away before the reply");
        }
    }

    debug!(worker_id, "delivery worker stopped");
}
