/// workflowctl: control plane for deployable workflow resources
///
/// This library provides the workflow lifecycle manager: conditional-write
/// resource storage, long-running operation tracking, and the deployment state
/// machine that drives each workflow through DEPLOYING and DELETING.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Opaque page token encoding
pub mod pagination;

// Workflow resources - types, validation, filtering and storage
pub mod workflow;

// Long-running operation records and their tracker
pub mod operation;

// Deployment backend, state machine, work queue and lease recovery
pub mod runtime;

// Public request handling - create/get/list/update/delete
pub mod lifecycle;

// HTTP API layer - REST endpoints mirroring the RPC surface
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{ErrorCode, LifecycleError};
pub use lifecycle::LifecycleManager;
pub use operation::{Operation, OperationVerb};
pub use server::start_server;
pub use workflow::{Workflow, WorkflowSpec, WorkflowState};
