/// Transition work queue and its dispatcher
///
/// The lifecycle manager never runs a transition itself: it pushes a
/// `TransitionJob` onto a bounded channel and returns. Pushing never waits; a
/// job that finds the queue full is dropped and its leased workflow is picked
/// up by the reaper once the lease lapses. The dispatcher drains the
/// channel and runs each job as its own task, with a semaphore capping how many
/// state-machine runs are in flight at once.

use crate::error::{LifecycleError, Result};
use crate::runtime::machine::{DeploymentStateMachine, TransitionJob};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Producer side of the transition queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<TransitionJob>,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` pending jobs
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<TransitionJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue a job without waiting; fails when the queue is full or closed
    pub fn enqueue(&self, job: TransitionJob) -> Result<()> {
        tracing::debug!("Enqueueing {} of {}", job.verb, job.target);
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) => {
                LifecycleError::Internal(format!("transition queue full, dropped job for {}", job.target))
            }
            TrySendError::Closed(job) => {
                LifecycleError::Internal(format!("transition queue closed, dropped job for {}", job.target))
            }
        })
    }
}

/// Consumer side: runs queued jobs on the state machine
pub struct Dispatcher {
    machine: Arc<DeploymentStateMachine>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(machine: Arc<DeploymentStateMachine>, workers: usize) -> Self {
        Self {
            machine,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Start draining `receiver` in the background
    ///
    /// The task ends once every `WorkQueue` handle has been dropped.
    pub fn spawn(self, mut receiver: mpsc::Receiver<TransitionJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Transition dispatcher started");
            while let Some(job) = receiver.recv().await {
                let permit = match Arc::clone(&self.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let machine = Arc::clone(&self.machine);
                tokio::spawn(async move {
                    machine.run(job).await;
                    drop(permit);
                });
            }
            tracing::info!("Transition queue closed, dispatcher stopping");
        })
    }
}
