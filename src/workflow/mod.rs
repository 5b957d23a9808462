/// Workflow Resource Layer
///
/// This module handles workflow resources and their persistence:
/// - Type definitions (Workflow, WorkflowRecord, resource names, validation)
/// - Filter and ordering support for listings
/// - SQLite persistence with compare-and-swap writes

// Core workflow type definitions
pub mod types;

// List filter and order_by parsing
pub mod query;

// SQLite persistence layer for workflow storage
pub mod storage;

// Re-export commonly used types
pub use storage::WorkflowStorage;
pub use types::{SourceCode, Workflow, WorkflowName, WorkflowSpec, WorkflowState};
