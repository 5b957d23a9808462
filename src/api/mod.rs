/// HTTP API Layer
///
/// This module provides the REST endpoints for the lifecycle manager:
/// - Workflow CRUD (create, get, list, patch, delete)
/// - Long-running operation polling, listing, cancellation and deletion
/// - Error rendering in the canonical JSON error shape

use crate::lifecycle::LifecycleManager;
use std::sync::Arc;

// JSON error responses
pub mod error;

// Workflow management endpoints (GET/POST/PATCH/DELETE)
pub mod workflows;

// Operation endpoints
pub mod operations;

// Re-export router builders
pub use operations::create_operation_routes;
pub use workflows::create_workflow_routes;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
}
