//! Shared harness for lifecycle integration tests
//!
//! Builds the manager over an in-memory SQLite pool with a scripted backend.
//! The work queue is not drained in the background: tests run queued
//! transitions explicitly, which makes every checkpoint deterministic.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use workflowctl::config::LifecycleConfig;
use workflowctl::lifecycle::LifecycleManager;
use workflowctl::operation::{Operation, OperationTracker};
use workflowctl::runtime::backend::BackendError;
use workflowctl::runtime::machine::TransitionJob;
use workflowctl::runtime::reaper::LeaseReaper;
use workflowctl::runtime::{DeploymentBackend, DeploymentStateMachine, WorkQueue};
use workflowctl::workflow::{SourceCode, WorkflowName, WorkflowSpec, WorkflowStorage};

pub const PARENT: &str = "projects/p1/locations/l1";

/// Backend double that records calls and fails on demand
#[derive(Default)]
pub struct ScriptedBackend {
    pub fail_deploy: AtomicBool,
    pub fail_teardown: AtomicBool,
    pub deploys: Mutex<Vec<(String, String)>>,
    pub teardowns: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn deploy_count(&self) -> usize {
        self.deploys.lock().unwrap().len()
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.lock().unwrap().len()
    }
}

#[async_trait]
impl DeploymentBackend for ScriptedBackend {
    async fn deploy(
        &self,
        name: &WorkflowName,
        _source: &SourceCode,
        service_account: &str,
    ) -> Result<(), BackendError> {
        self.deploys
            .lock()
            .unwrap()
            .push((name.to_string(), service_account.to_string()));
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(BackendError::new("syntax error on line 1"));
        }
        Ok(())
    }

    async fn teardown(&self, name: &WorkflowName) -> Result<(), BackendError> {
        self.teardowns.lock().unwrap().push(name.to_string());
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(BackendError::new("artifact store unavailable"));
        }
        Ok(())
    }
}

pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        default_service_account: "{project}-default@example.com".to_string(),
        max_page_size: 1000,
        default_page_size: 500,
        cas_retries: 3,
        lease_secs: 600,
        reaper_interval_secs: 30,
        workers: 4,
        queue_capacity: 64,
    }
}

pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

pub struct Harness {
    pub manager: Arc<LifecycleManager>,
    pub workflows: WorkflowStorage,
    pub operations: OperationTracker,
    pub backend: Arc<ScriptedBackend>,
    pub queue: WorkQueue,
    pub config: LifecycleConfig,
    machine: DeploymentStateMachine,
    receiver: mpsc::Receiver<TransitionJob>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: LifecycleConfig) -> Self {
        let pool = memory_pool().await;
        let workflows = WorkflowStorage::new(pool.clone());
        let operations = OperationTracker::new(pool);
        workflows.init_schema().await.unwrap();
        operations.init_schema().await.unwrap();

        let backend = Arc::new(ScriptedBackend::default());
        let (queue, receiver) = WorkQueue::bounded(config.queue_capacity);
        let machine = DeploymentStateMachine::new(
            workflows.clone(),
            operations.clone(),
            backend.clone(),
            config.lease_duration(),
        );
        let manager = Arc::new(LifecycleManager::new(
            workflows.clone(),
            operations.clone(),
            queue.clone(),
            config.clone(),
            "manager-test".to_string(),
        ));

        Self {
            manager,
            workflows,
            operations,
            backend,
            queue,
            config,
            machine,
            receiver,
        }
    }

    /// Run every queued transition to completion, in order
    pub async fn run_queued(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            self.machine.run(job).await;
            ran += 1;
        }
        ran
    }

    /// Drop queued transitions without running them, as a crash would
    pub fn lose_queued(&mut self) -> usize {
        let mut lost = 0;
        while self.receiver.try_recv().is_ok() {
            lost += 1;
        }
        lost
    }

    /// A reaper acting for a different process than the manager
    pub fn reaper(&self, owner: &str) -> LeaseReaper {
        LeaseReaper::new(
            self.workflows.clone(),
            self.operations.clone(),
            self.queue.clone(),
            owner.to_string(),
            self.config.lease_duration(),
        )
    }

    /// Create `workflow_id` under `PARENT` and deploy it
    pub async fn create_active(&mut self, workflow_id: &str) -> Operation {
        let operation = self
            .manager
            .create_workflow(PARENT, workflow_id, spec("steps: []"))
            .await
            .unwrap();
        self.run_queued().await;
        let operation = self.manager.get_operation(&operation.name).await.unwrap();
        assert!(operation.done, "create of {} did not finish", workflow_id);
        operation
    }
}

pub fn spec(source: &str) -> WorkflowSpec {
    WorkflowSpec {
        description: String::new(),
        source_code: Some(SourceCode::SourceContents(source.to_string())),
        labels: BTreeMap::new(),
        service_account: None,
    }
}

pub fn workflow_name(workflow_id: &str) -> String {
    format!("{}/workflows/{}", PARENT, workflow_id)
}

/// Poll an operation until done, as a client would
pub async fn wait_done(manager: &LifecycleManager, name: &str) -> Operation {
    for _ in 0..500 {
        let operation = manager.get_operation(name).await.unwrap();
        if operation.done {
            return operation;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {} never finished", name);
}
