/// Workflow management REST API endpoints
///
/// Thin translation between the HTTP bindings and the lifecycle manager.
/// Mutations answer with the operation handle as soon as the transition is
/// queued; clients poll the operation endpoints for the outcome.

use crate::api::{error::ApiError, AppState};
use crate::error::LifecycleError;
use crate::operation::types::Operation;
use crate::workflow::types::{SourceCode, Workflow, WorkflowSpec};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request body for create and update
///
/// Output-only fields sent by clients (state, versionId, timestamps) are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowBody {
    pub name: Option<String>,
    pub description: String,
    pub source_contents: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

impl WorkflowBody {
    fn into_spec(self) -> WorkflowSpec {
        WorkflowSpec {
            description: self.description,
            source_code: self.source_contents.map(SourceCode::SourceContents),
            labels: self.labels,
            service_account: self.service_account.filter(|account| !account.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    #[serde(default)]
    pub workflow_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub page_size: i32,
    pub page_token: String,
    pub filter: String,
    pub order_by: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateParams {
    /// Comma-separated field paths
    pub update_mask: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
    pub next_page_token: String,
    pub unreachable: Vec<String>,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/projects/{project}/locations/{location}/workflows",
            get(list_workflows).post(create_workflow),
        )
        .route(
            "/v1/projects/{project}/locations/{location}/workflows/{workflow}",
            get(get_workflow).patch(update_workflow).delete(delete_workflow),
        )
}

fn parent_name(project: &str, location: &str) -> String {
    format!("projects/{}/locations/{}", project, location)
}

/// List workflows
///
/// GET /v1/projects/{project}/locations/{location}/workflows?pageSize=&pageToken=&filter=&orderBy=
async fn list_workflows(
    State(state): State<AppState>,
    Path((project, location)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListWorkflowsResponse>, ApiError> {
    let page = state
        .manager
        .list_workflows(
            &parent_name(&project, &location),
            params.page_size,
            &params.page_token,
            &params.filter,
            &params.order_by,
        )
        .await?;

    Ok(Json(ListWorkflowsResponse {
        workflows: page.workflows,
        next_page_token: page.next_page_token,
        unreachable: page.unreachable,
    }))
}

/// Create a new workflow
///
/// POST /v1/projects/{project}/locations/{location}/workflows?workflowId=
/// Body: { "description": "...", "sourceContents": "...", "labels": {...}, "serviceAccount": "..." }
async fn create_workflow(
    State(state): State<AppState>,
    Path((project, location)): Path<(String, String)>,
    Query(params): Query<CreateParams>,
    Json(body): Json<WorkflowBody>,
) -> Result<Json<Operation>, ApiError> {
    let operation = state
        .manager
        .create_workflow(&parent_name(&project, &location), &params.workflow_id, body.into_spec())
        .await?;
    Ok(Json(operation))
}

/// GET /v1/projects/{project}/locations/{location}/workflows/{workflow}
async fn get_workflow(
    State(state): State<AppState>,
    Path((project, location, workflow)): Path<(String, String, String)>,
) -> Result<Json<Workflow>, ApiError> {
    let name = format!("{}/workflows/{}", parent_name(&project, &location), workflow);
    Ok(Json(state.manager.get_workflow(&name).await?))
}

/// Update an existing workflow
///
/// PATCH /v1/projects/{project}/locations/{location}/workflows/{workflow}?updateMask=description,labels
async fn update_workflow(
    State(state): State<AppState>,
    Path((project, location, workflow)): Path<(String, String, String)>,
    Query(params): Query<UpdateParams>,
    Json(body): Json<WorkflowBody>,
) -> Result<Json<Operation>, ApiError> {
    let name = format!("{}/workflows/{}", parent_name(&project, &location), workflow);
    if let Some(body_name) = body.name.as_deref().filter(|n| !n.is_empty()) {
        if body_name != name {
            return Err(LifecycleError::invalid(format!(
                "body name '{}' does not match '{}'",
                body_name, name
            ))
            .into());
        }
    }

    let mask: Vec<String> = params.update_mask.split(',').map(str::to_string).collect();
    let operation = state
        .manager
        .update_workflow(&name, body.into_spec(), &mask)
        .await?;
    Ok(Json(operation))
}

/// DELETE /v1/projects/{project}/locations/{location}/workflows/{workflow}
async fn delete_workflow(
    State(state): State<AppState>,
    Path((project, location, workflow)): Path<(String, String, String)>,
) -> Result<Json<Operation>, ApiError> {
    let name = format!("{}/workflows/{}", parent_name(&project, &location), workflow);
    Ok(Json(state.manager.delete_workflow(&name).await?))
}
