/// Transition lease recovery
///
/// A workflow left in DEPLOYING or DELETING by a run that died would otherwise
/// stay locked forever. The reaper looks for leases that are no longer backed by
/// a live run and either resumes the transition under a fresh lease (when its
/// operation is still pending) or reverts the workflow to its prior state.
///
/// It also closes operations no run is left to report on, such as those
/// allocated by a request that crashed before its conditional write, or those
/// whose run settled the workflow and died before reporting.

use crate::error::{ErrorCode, LifecycleError, Result};
use crate::operation::tracker::OperationTracker;
use crate::operation::types::{Operation, OperationOutcome, OperationVerb};
use crate::runtime::dispatcher::WorkQueue;
use crate::runtime::machine::TransitionJob;
use crate::workflow::storage::{DeleteOutcome, Precondition, WorkflowStorage, WriteOutcome};
use crate::workflow::types::{TransitionLease, WorkflowName, WorkflowRecord, WorkflowState};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Which leases a sweep may reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Process start: every lease held by another owner is dead, expired or not
    Startup,
    /// Periodic: only leases past their expiry
    Expired,
}

/// Counts of what one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transitions re-enqueued under a fresh lease
    pub resumed: usize,
    /// Workflows put back to their pre-transition state
    pub reverted: usize,
    /// Pending operations closed because no run was left to report them
    pub abandoned_operations: usize,
}

pub struct LeaseReaper {
    workflows: WorkflowStorage,
    operations: OperationTracker,
    queue: WorkQueue,
    owner: String,
    lease_duration: chrono::Duration,
}

impl LeaseReaper {
    pub fn new(
        workflows: WorkflowStorage,
        operations: OperationTracker,
        queue: WorkQueue,
        owner: String,
        lease_duration: chrono::Duration,
    ) -> Self {
        Self {
            workflows,
            operations,
            queue,
            owner,
            lease_duration,
        }
    }

    /// Run sweeps forever, `interval` apart
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match self.sweep(Sweep::Expired).await {
                    Ok(report) if report != RecoveryReport::default() => {
                        tracing::warn!("Lease sweep recovered {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Lease sweep failed: {}", e),
                }
            }
        })
    }

    /// One pass over transient workflows and pending operations
    pub async fn sweep(&self, mode: Sweep) -> Result<RecoveryReport> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        // Before anything is resumed, so no run started by this sweep is reporting yet
        for operation in self.operations.list_pending().await? {
            if self.close_if_orphaned(&operation, mode, now).await? {
                report.abandoned_operations += 1;
            }
        }

        for record in self.workflows.list_transient().await? {
            if !self.reclaimable(&record, mode, now) {
                continue;
            }

            match self.pending_operation(&record).await? {
                Some(operation) => {
                    if self.resume(&record, &operation).await? {
                        report.resumed += 1;
                    }
                }
                None => {
                    if self.revert(&record).await? {
                        report.reverted += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    fn reclaimable(&self, record: &WorkflowRecord, mode: Sweep, now: DateTime<Utc>) -> bool {
        match &record.lease {
            None => true,
            Some(lease) => {
                lease.is_expired(now) || (mode == Sweep::Startup && lease.owner != self.owner)
            }
        }
    }

    async fn pending_operation(&self, record: &WorkflowRecord) -> Result<Option<Operation>> {
        let Some(lease) = &record.lease else {
            return Ok(None);
        };
        match self.operations.get(&lease.operation).await {
            Ok(operation) if !operation.done => Ok(Some(operation)),
            Ok(_) | Err(LifecycleError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Take the lease over and queue the transition again
    async fn resume(&self, record: &WorkflowRecord, operation: &Operation) -> Result<bool> {
        let lease = TransitionLease::new(&self.owner, &operation.name, self.lease_duration);
        let lease_id = lease.id;
        let mut next = record.clone();
        next.lease = Some(lease);

        match self
            .workflows
            .put_if_match(&next, Precondition::Revision(record.revision))
            .await?
        {
            WriteOutcome::Written(_) => {
                tracing::warn!(
                    "Resuming {} of {} under a new lease",
                    operation.metadata.verb,
                    record.workflow.name
                );
                let job = TransitionJob {
                    operation: operation.name.clone(),
                    target: WorkflowName::parse(&record.workflow.name)?,
                    verb: operation.metadata.verb,
                    lease_id,
                };
                if let Err(e) = self.queue.enqueue(job) {
                    tracing::warn!("{}; retrying once the new lease lapses", e);
                }
                Ok(true)
            }
            WriteOutcome::Conflict => Ok(false),
        }
    }

    async fn revert(&self, record: &WorkflowRecord) -> Result<bool> {
        let name = WorkflowName::parse(&record.workflow.name)?;
        let reverted = match record.reverted() {
            Some(prior) => matches!(
                self.workflows
                    .put_if_match(&prior, Precondition::Revision(record.revision))
                    .await?,
                WriteOutcome::Written(_)
            ),
            None => matches!(
                self.workflows.delete_if_match(&name, record.revision).await?,
                DeleteOutcome::Deleted
            ),
        };
        if reverted {
            tracing::warn!(
                "Reverted {} from {} after its run was lost",
                record.workflow.name,
                record.workflow.state
            );
        }
        Ok(reverted)
    }

    /// Close `operation` if no run is left to report its outcome
    ///
    /// A run releases its lease before it reports, so a target settled by this
    /// operation only counts once the settle is a lease length old. A removed
    /// target leaves nothing to look at: a delete is closed as done, anything
    /// else waits for a startup sweep.
    async fn close_if_orphaned(&self, operation: &Operation, mode: Sweep, now: DateTime<Utc>) -> Result<bool> {
        let grace_over = operation.metadata.create_time + self.lease_duration <= now;
        if mode == Sweep::Expired && !grace_over {
            return Ok(false);
        }

        let target = WorkflowName::parse(&operation.metadata.target)?;
        let outcome = match self.workflows.get(&target).await? {
            Some(record)
                if record
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.operation == operation.name) =>
            {
                return Ok(false)
            }
            Some(record) if record.settled_by.as_deref() == Some(operation.name.as_str()) => {
                if record.workflow.update_time + self.lease_duration > now {
                    return Ok(false);
                }
                settled_outcome(operation.metadata.verb, record)
            }
            Some(_) => lost(),
            None if operation.metadata.verb == OperationVerb::Delete => OperationOutcome::empty(),
            None if mode == Sweep::Startup => lost(),
            None => return Ok(false),
        };

        let closed = self.operations.complete_if_pending(&operation.name, outcome).await?;
        if closed {
            tracing::warn!("Closed operation {}: no run was left to report it", operation.name);
        }
        Ok(closed)
    }
}

/// Outcome for an operation whose run settled its target but never reported
fn settled_outcome(verb: OperationVerb, record: WorkflowRecord) -> OperationOutcome {
    match (verb, record.workflow.state) {
        (OperationVerb::Create | OperationVerb::Update, WorkflowState::Active) => {
            OperationOutcome::workflow(record.workflow)
        }
        _ => OperationOutcome::error(
            ErrorCode::Aborted,
            "transition settled but its result was never reported",
        ),
    }
}

fn lost() -> OperationOutcome {
    OperationOutcome::error(
        ErrorCode::Aborted,
        "operation abandoned: its transition was lost before it could finish",
    )
}
