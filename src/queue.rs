use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::model::Job;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

/// Executes one dequeued job.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: Job) -> Result<()>;
}

/// FIFO job queue with a fixed number of admission slots.
///
/// `enqueue` never waits. A single dispatch task pops jobs in order and
/// spawns each one once a slot is free; the slot is a semaphore permit owned
/// by the worker task, so it is released however the job ends.
pub struct JobQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    pending: Arc<AtomicUsize>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawns the dispatcher and returns the accepting end
    ///
    /// # Arguments
    /// * `runner` - Executes each admitted job
    /// * `settings` - Source of `concurrent_downloads`, the slot count
    pub fn start(runner: Arc<dyn JobRunner>, settings: &Settings) -> Self {
        let slots = settings.config().concurrent_downloads.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let dispatcher = tokio::spawn(dispatch(
            receiver,
            Arc::new(Semaphore::new(slots)),
            runner,
            Arc::clone(&pending),
        ));
        info!(slots, "job queue started");

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Appends a job and returns how many jobs are waiting, this one included.
    ///
    /// # Errors
    /// * If the queue has been shut down
    pub fn enqueue(&self, job: Job) -> Result<usize> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(AppError::Custom("job queue is shut down".into()));
        };
        let waiting = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Custom("job queue is shut down".into()));
        }
        Ok(waiting)
    }

    /// Jobs accepted but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs and waits for every queued and running job.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "job dispatcher terminated abnormally");
            }
        }
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    slots: Arc<Semaphore>,
    runner: Arc<dyn JobRunner>,
    pending: Arc<AtomicUsize>,
) {
    let mut workers = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some(joined) = workers.next(), if !workers.is_empty() => reap(joined),
            job = receiver.recv() => {
                let Some(job) = job else { break };
                pending.fetch_sub(1, Ordering::SeqCst);

                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    error!("admission semaphore closed");
                    break;
                };
                info!(job = %job, "dispatching job");
                let runner = Arc::clone(&runner);
                workers.push(tokio::spawn(async move {
                    let _permit = permit;
                    let label = job.to_string();
                    if let Err(e) = runner.run(job).await {
                        warn!(job = %label, error = %e, "job failed");
                    }
                }));
            }
        }
    }

    while let Some(joined) = workers.next().await {
        reap(joined);
    }
    info!("job queue drained");
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job worker panicked");
    }
}
