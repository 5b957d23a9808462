/// Deployment state machine
///
/// Drives one workflow through a transition it holds the lease for:
///
/// - deploy: DEPLOYING -> ACTIVE on backend success, DEPLOYING -> FAILED on failure
/// - delete: DELETING -> removed on success, DELETING -> prior state on failure
///
/// Cancellation is cooperative. The run checks the operation's flag before the
/// backend call (abort and revert) and after it (the call is irreversible, so the
/// run completes normally). There is no internal timeout; while the backend call
/// is in flight the lease is renewed so the reaper leaves the run alone.

use crate::error::{ErrorCode, LifecycleError, Result};
use crate::operation::tracker::OperationTracker;
use crate::operation::types::{OperationOutcome, OperationVerb};
use crate::runtime::backend::DeploymentBackend;
use crate::workflow::storage::{DeleteOutcome, Precondition, WorkflowStorage, WriteOutcome};
use crate::workflow::types::{WorkflowName, WorkflowRecord, WorkflowState};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Attempts at a leased write before the run gives up
const COMMIT_ATTEMPTS: usize = 5;

/// A unit of work on the transition queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionJob {
    /// Operation reporting this transition
    pub operation: String,
    pub target: WorkflowName,
    pub verb: OperationVerb,
    /// Lease the job must still hold on the target for its writes to land
    pub lease_id: Uuid,
}

/// Leased write the run wants to apply to its workflow
enum Mutation {
    Write(WorkflowRecord),
    Remove,
}

/// Executes queued transitions against the stores and the deployment backend
pub struct DeploymentStateMachine {
    workflows: WorkflowStorage,
    operations: OperationTracker,
    backend: Arc<dyn DeploymentBackend>,
    lease_duration: chrono::Duration,
}

impl DeploymentStateMachine {
    pub fn new(
        workflows: WorkflowStorage,
        operations: OperationTracker,
        backend: Arc<dyn DeploymentBackend>,
        lease_duration: chrono::Duration,
    ) -> Self {
        Self {
            workflows,
            operations,
            backend,
            lease_duration,
        }
    }

    /// Run one job to completion
    ///
    /// Failures that prevent the run from finishing are logged and the record is
    /// left leased; once the lease expires the reaper resumes or reverts it.
    pub async fn run(&self, job: TransitionJob) {
        tracing::info!("Starting {} of {} ({})", job.verb, job.target, job.operation);

        let result = match job.verb {
            OperationVerb::Create | OperationVerb::Update => self.deploy(&job).await,
            OperationVerb::Delete => self.teardown(&job).await,
        };

        if let Err(e) = result {
            tracing::error!("Transition {} of {} did not finish: {}", job.verb, job.target, e);
        }
    }

    async fn deploy(&self, job: &TransitionJob) -> Result<()> {
        let Some(record) = self.owned_record(job).await? else {
            return Ok(());
        };

        if self.cancel_requested(&job.operation).await? {
            return self.abandon(job, "cancelled before deployment started").await;
        }

        let record = self.renew_lease(job).await?.unwrap_or(record);
        let workflow = record.workflow;
        self.progress(
            &job.operation,
            &format!("Deploying workflow revision {}", workflow.version_id),
        )
        .await?;

        let result = self
            .with_heartbeat(
                job,
                self.backend
                    .deploy(&job.target, &workflow.source_code, &workflow.service_account),
            )
            .await;

        if self.cancel_requested(&job.operation).await? {
            tracing::info!(
                "Cancellation of {} arrived after the deployment started; completing normally",
                job.operation
            );
        }

        match result {
            Ok(()) => {
                let settled = self.settle(job, WorkflowState::Active).await?;
                tracing::info!(
                    "Workflow {} ACTIVE at version {}",
                    job.target,
                    settled.workflow.version_id
                );
                self.report(&job.operation, OperationOutcome::workflow(settled.workflow))
                    .await
            }
            Err(e) => {
                let settled = self.settle(job, WorkflowState::Failed).await?;
                tracing::warn!(
                    "Workflow {} FAILED at version {}: {}",
                    job.target,
                    settled.workflow.version_id,
                    e
                );
                self.report(
                    &job.operation,
                    OperationOutcome::error(ErrorCode::Internal, format!("deployment failed: {}", e)),
                )
                .await
            }
        }
    }

    async fn teardown(&self, job: &TransitionJob) -> Result<()> {
        if self.owned_record(job).await?.is_none() {
            return Ok(());
        }

        if self.cancel_requested(&job.operation).await? {
            return self.abandon(job, "cancelled before teardown started").await;
        }

        self.renew_lease(job).await?;
        self.progress(&job.operation, "Tearing down workflow").await?;

        let result = self
            .with_heartbeat(job, self.backend.teardown(&job.target))
            .await;

        if self.cancel_requested(&job.operation).await? {
            tracing::info!(
                "Cancellation of {} arrived after the teardown started; completing normally",
                job.operation
            );
        }

        match result {
            Ok(()) => {
                self.commit(job, |_| Mutation::Remove).await?;
                tracing::info!("Workflow {} deleted", job.target);
                self.report(&job.operation, OperationOutcome::empty()).await
            }
            Err(e) => {
                self.commit(job, revert).await?;
                tracing::warn!("Teardown of {} failed, restored prior state: {}", job.target, e);
                self.report(
                    &job.operation,
                    OperationOutcome::error(ErrorCode::Internal, format!("teardown failed: {}", e)),
                )
                .await
            }
        }
    }

    /// Revert the workflow to its pre-transition state and close the operation as cancelled
    async fn abandon(&self, job: &TransitionJob, reason: &str) -> Result<()> {
        self.commit(job, revert).await?;
        tracing::info!("Transition of {} {}; reverted", job.target, reason);
        self.report(
            &job.operation,
            OperationOutcome::error(ErrorCode::Cancelled, format!("operation {}", reason)),
        )
        .await
    }

    async fn settle(&self, job: &TransitionJob, state: WorkflowState) -> Result<WorkflowRecord> {
        let written = self
            .commit(job, |record| {
                let mut next = record.clone();
                next.finish(state);
                Mutation::Write(next)
            })
            .await?;
        written.ok_or_else(|| LifecycleError::Internal(format!("{} vanished while settling", job.target)))
    }

    /// Push the lease expiry forward; `None` only if the record was removed
    async fn renew_lease(&self, job: &TransitionJob) -> Result<Option<WorkflowRecord>> {
        let expires_at = Utc::now() + self.lease_duration;
        self.commit(job, |record| {
            let mut next = record.clone();
            if let Some(lease) = next.lease.as_mut() {
                lease.expires_at = expires_at;
            }
            Mutation::Write(next)
        })
        .await
    }

    /// Await `work` while periodically renewing the job's lease
    async fn with_heartbeat<F: Future>(&self, job: &TransitionJob, work: F) -> F::Output {
        let period = (self.lease_duration.to_std().unwrap_or_default() / 3).max(Duration::from_millis(250));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_lease(job).await {
                        tracing::warn!("Could not renew lease on {}: {}", job.target, e);
                    }
                }
            }
        }
    }

    /// Apply a leased write, re-reading and retrying when the store moved underneath
    async fn commit<F>(&self, job: &TransitionJob, mutate: F) -> Result<Option<WorkflowRecord>>
    where
        F: Fn(&WorkflowRecord) -> Mutation,
    {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let record = self
                .workflows
                .get(&job.target)
                .await?
                .ok_or_else(|| LifecycleError::Aborted(format!("{} disappeared mid-transition", job.target)))?;
            if !record.holds_lease(job.lease_id) {
                return Err(LifecycleError::Aborted(format!(
                    "lease on {} was taken over by another run",
                    job.target
                )));
            }

            match mutate(&record) {
                Mutation::Write(next) => {
                    match self
                        .workflows
                        .put_if_match(&next, Precondition::Revision(record.revision))
                        .await?
                    {
                        WriteOutcome::Written(written) => return Ok(Some(written)),
                        WriteOutcome::Conflict => {}
                    }
                }
                Mutation::Remove => {
                    match self.workflows.delete_if_match(&job.target, record.revision).await? {
                        DeleteOutcome::Deleted => return Ok(None),
                        DeleteOutcome::Conflict => {}
                        DeleteOutcome::NotFound => {
                            return Err(LifecycleError::Aborted(format!(
                                "{} disappeared mid-transition",
                                job.target
                            )))
                        }
                    }
                }
            }
            tracing::warn!("Leased write on {} conflicted (attempt {})", job.target, attempt);
        }

        Err(LifecycleError::Aborted(format!(
            "gave up writing {} after {} conflicting attempts",
            job.target, COMMIT_ATTEMPTS
        )))
    }

    /// The target record, if this job still owns it
    async fn owned_record(&self, job: &TransitionJob) -> Result<Option<WorkflowRecord>> {
        match self.workflows.get(&job.target).await? {
            Some(record) if record.holds_lease(job.lease_id) => Ok(Some(record)),
            Some(_) => {
                tracing::warn!("Dropping stale job for {}: lease no longer held", job.target);
                Ok(None)
            }
            None => {
                tracing::warn!("Dropping stale job for {}: workflow is gone", job.target);
                Ok(None)
            }
        }
    }

    /// A deleted operation record counts as "not cancelled"; the run carries on
    async fn cancel_requested(&self, operation: &str) -> Result<bool> {
        match self.operations.get(operation).await {
            Ok(op) => Ok(op.metadata.cancel_requested),
            Err(LifecycleError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn progress(&self, operation: &str, detail: &str) -> Result<()> {
        match self.operations.update_progress(operation, detail).await {
            Ok(_) | Err(LifecycleError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn report(&self, operation: &str, outcome: OperationOutcome) -> Result<()> {
        match self.operations.complete(operation, outcome).await {
            Ok(_) => Ok(()),
            Err(LifecycleError::NotFound(_)) => {
                tracing::debug!("Operation {} was deleted before completion", operation);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Leased revert: back to the prior snapshot, or gone if the transition was a create
fn revert(record: &WorkflowRecord) -> Mutation {
    match record.reverted() {
        Some(prior) => Mutation::Write(prior),
        None => Mutation::Remove,
    }
}
