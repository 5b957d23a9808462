/// Lifecycle manager: the public face of the service
///
/// Validates requests, allocates operations and takes the transition lease with
/// a conditional write, then hands the run to the work queue and returns the
/// operation handle without waiting. Reads go straight to the stores.
///
/// The conditional write is the only concurrency control. Two requests racing
/// on the same workflow both read it, but only one write lands; the loser
/// re-reads and sees the winner's transient state.

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Result};
use crate::lifecycle::update_mask;
use crate::operation::tracker::{OperationPage, OperationTracker};
use crate::operation::types::{Operation, OperationVerb};
use crate::pagination::effective_page_size;
use crate::runtime::dispatcher::WorkQueue;
use crate::runtime::machine::TransitionJob;
use crate::workflow::storage::{Precondition, WorkflowPage, WorkflowStorage, WriteOutcome};
use crate::workflow::types::{
    validate_spec, validate_workflow_id, LocationName, TransitionLease, Workflow, WorkflowName,
    WorkflowRecord, WorkflowSpec, WorkflowState,
};
use uuid::Uuid;

/// What a mutation does to the record once it holds the lease
enum Change {
    /// Deploy new content; `None` service account means the project default
    Redeploy(WorkflowSpec),
    Remove,
}

pub struct LifecycleManager {
    workflows: WorkflowStorage,
    operations: OperationTracker,
    queue: WorkQueue,
    config: LifecycleConfig,
    /// Lease owner id of this process
    owner: String,
}

impl LifecycleManager {
    pub fn new(
        workflows: WorkflowStorage,
        operations: OperationTracker,
        queue: WorkQueue,
        config: LifecycleConfig,
        owner: String,
    ) -> Self {
        Self {
            workflows,
            operations,
            queue,
            config,
            owner,
        }
    }

    /// Create `{parent}/workflows/{workflow_id}` and start deploying it
    pub async fn create_workflow(&self, parent: &str, workflow_id: &str, spec: WorkflowSpec) -> Result<Operation> {
        let parent = LocationName::parse(parent)?;
        if parent.is_wildcard() {
            return Err(LifecycleError::invalid("workflows cannot be created under location '-'"));
        }
        validate_workflow_id(workflow_id)?;
        validate_spec(&spec)?;

        let name = WorkflowName::new(&parent, workflow_id);
        if self.workflows.get(&name).await?.is_some() {
            return Err(already_exists(&name));
        }

        let service_account = spec
            .service_account
            .clone()
            .unwrap_or_else(|| self.config.service_account_for(&name.project));
        let mut record = WorkflowRecord::placeholder(&name, spec, service_account)?;

        let operation = self.operations.create(&name, OperationVerb::Create).await?;
        let lease = self.lease_for(&operation);
        let lease_id = lease.id;
        record.begin_deploy(lease);

        match self.workflows.put_if_match(&record, Precondition::Absent).await {
            Ok(WriteOutcome::Written(_)) => {}
            Ok(WriteOutcome::Conflict) => {
                self.discard(&operation).await;
                return Err(already_exists(&name));
            }
            Err(e) => {
                self.discard(&operation).await;
                return Err(e);
            }
        }

        tracing::info!("Creating workflow {} ({})", name, operation.name);
        self.dispatch(&operation, name, OperationVerb::Create, lease_id);
        Ok(operation)
    }

    pub async fn get_workflow(&self, name: &str) -> Result<Workflow> {
        let name = WorkflowName::parse(name)?;
        match self.workflows.get(&name).await? {
            Some(record) if record.workflow.state != WorkflowState::Unspecified => Ok(record.workflow),
            _ => Err(LifecycleError::NotFound(format!("workflow {}", name))),
        }
    }

    pub async fn list_workflows(
        &self,
        parent: &str,
        page_size: i32,
        page_token: &str,
        filter: &str,
        order_by: &str,
    ) -> Result<WorkflowPage> {
        let parent = LocationName::parse(parent)?;
        let page_size = effective_page_size(page_size, self.config.default_page_size, self.config.max_page_size);
        self.workflows
            .list(&parent, page_size, page_token, filter, order_by)
            .await
    }

    /// Deploy new content for an existing workflow
    ///
    /// An empty `update_mask` replaces every client-owned field; otherwise only
    /// the masked fields are taken from `spec`. Always consumes a version.
    pub async fn update_workflow(&self, name: &str, spec: WorkflowSpec, update_mask: &[String]) -> Result<Operation> {
        let name = WorkflowName::parse(name)?;
        let mask = update_mask::parse_mask(update_mask)?;

        self.begin_transition(&name, OperationVerb::Update, |record| {
            let merged = update_mask::merge(&record.workflow, spec.clone(), &mask);
            validate_spec(&merged)?;
            Ok(Change::Redeploy(merged))
        })
        .await
    }

    pub async fn delete_workflow(&self, name: &str) -> Result<Operation> {
        let name = WorkflowName::parse(name)?;
        self.begin_transition(&name, OperationVerb::Delete, |_| Ok(Change::Remove))
            .await
    }

    pub async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.operations.get(name).await
    }

    pub async fn list_operations(&self, parent: &str, page_size: i32, page_token: &str) -> Result<OperationPage> {
        let parent = LocationName::parse(parent)?;
        let page_size = effective_page_size(page_size, self.config.default_page_size, self.config.max_page_size);
        self.operations.list(&parent, page_size, page_token).await
    }

    /// Ask the run behind `name` to stop at its next safe point
    pub async fn cancel_operation(&self, name: &str) -> Result<Operation> {
        self.operations.request_cancel(name).await
    }

    pub async fn delete_operation(&self, name: &str) -> Result<()> {
        self.operations.delete(name).await?;
        tracing::info!("Deleted operation {}", name);
        Ok(())
    }

    /// Take the lease on an existing workflow for `verb`
    ///
    /// The operation is allocated on first need and removed again if the
    /// request fails, so a rejected mutation leaves no trace.
    async fn begin_transition<F>(&self, name: &WorkflowName, verb: OperationVerb, plan: F) -> Result<Operation>
    where
        F: Fn(&WorkflowRecord) -> Result<Change>,
    {
        let mut operation = None;
        let result = self.try_begin(name, verb, &plan, &mut operation).await;
        if let (Err(e), Some(allocated)) = (&result, &operation) {
            tracing::debug!("{} of {} rejected: {}", verb, name, e);
            self.discard(allocated).await;
        }
        result
    }

    async fn try_begin<F>(
        &self,
        name: &WorkflowName,
        verb: OperationVerb,
        plan: &F,
        operation: &mut Option<Operation>,
    ) -> Result<Operation>
    where
        F: Fn(&WorkflowRecord) -> Result<Change>,
    {
        for attempt in 0..=self.config.cas_retries {
            let record = match self.workflows.get(name).await? {
                Some(record) if record.workflow.state != WorkflowState::Unspecified => record,
                _ => return Err(LifecycleError::NotFound(format!("workflow {}", name))),
            };
            if record.workflow.state.is_transient() {
                return Err(LifecycleError::FailedPrecondition(format!(
                    "conflicting operation in progress on {} (state {})",
                    name, record.workflow.state
                )));
            }

            let change = plan(&record)?;

            let op = match operation.clone() {
                Some(op) => op,
                None => {
                    let op = self.operations.create(name, verb).await?;
                    *operation = Some(op.clone());
                    op
                }
            };
            let lease = self.lease_for(&op);
            let lease_id = lease.id;

            let mut next = record.clone();
            match change {
                Change::Redeploy(spec) => {
                    next.begin_deploy(lease);
                    self.apply_spec(&mut next.workflow, name, spec)?;
                }
                Change::Remove => next.begin_delete(lease),
            }

            match self
                .workflows
                .put_if_match(&next, Precondition::Revision(record.revision))
                .await?
            {
                WriteOutcome::Written(written) => {
                    tracing::info!(
                        "{} of {} started at version {} ({})",
                        verb,
                        name,
                        written.workflow.version_id,
                        op.name
                    );
                    self.dispatch(&op, name.clone(), verb, lease_id);
                    return Ok(op);
                }
                WriteOutcome::Conflict => {
                    tracing::warn!("Write conflict on {} during {} (attempt {})", name, verb, attempt + 1);
                }
            }
        }

        Err(LifecycleError::Aborted(format!(
            "{} kept changing underneath the {}; retry the request",
            name, verb
        )))
    }

    fn apply_spec(&self, workflow: &mut Workflow, name: &WorkflowName, spec: WorkflowSpec) -> Result<()> {
        workflow.description = spec.description;
        workflow.source_code = spec
            .source_code
            .ok_or_else(|| LifecycleError::invalid("source_contents is required"))?;
        workflow.labels = spec.labels;
        workflow.service_account = spec
            .service_account
            .unwrap_or_else(|| self.config.service_account_for(&name.project));
        Ok(())
    }

    fn lease_for(&self, operation: &Operation) -> TransitionLease {
        TransitionLease::new(&self.owner, &operation.name, self.config.lease_duration())
    }

    /// Queue the run; a failed enqueue is left for the reaper once the lease lapses
    fn dispatch(&self, operation: &Operation, target: WorkflowName, verb: OperationVerb, lease_id: Uuid) {
        let job = TransitionJob {
            operation: operation.name.clone(),
            target,
            verb,
            lease_id,
        };
        if let Err(e) = self.queue.enqueue(job) {
            tracing::error!("Could not queue {}: {}", operation.name, e);
        }
    }

    /// Drop an operation whose mutation never took hold
    async fn discard(&self, operation: &Operation) {
        if let Err(e) = self.operations.delete(&operation.name).await {
            tracing::warn!("Could not discard operation {}: {}", operation.name, e);
        }
    }
}

fn already_exists(name: &WorkflowName) -> LifecycleError {
    LifecycleError::AlreadyExists(format!("workflow {}", name))
}
