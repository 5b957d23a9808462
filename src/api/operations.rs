/// Long-running operation endpoints
///
/// Polling, listing, cancelling and forgetting operations. Cancellation uses the
/// custom-method form `{operation}:cancel`, so the last path segment is matched
/// whole and the suffix is split off here.

use crate::api::{error::ApiError, AppState};
use crate::error::LifecycleError;
use crate::operation::types::Operation;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const CANCEL_SUFFIX: &str = ":cancel";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOperationsParams {
    pub page_size: i32,
    pub page_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOperationsResponse {
    pub operations: Vec<Operation>,
    pub next_page_token: String,
}

pub fn create_operation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/projects/{project}/locations/{location}/operations",
            get(list_operations),
        )
        .route(
            "/v1/projects/{project}/locations/{location}/operations/{operation}",
            get(get_operation).post(cancel_operation).delete(delete_operation),
        )
}

fn operation_name(project: &str, location: &str, operation: &str) -> String {
    format!("projects/{}/locations/{}/operations/{}", project, location, operation)
}

/// GET /v1/projects/{project}/locations/{location}/operations?pageSize=&pageToken=
async fn list_operations(
    State(state): State<AppState>,
    Path((project, location)): Path<(String, String)>,
    Query(params): Query<ListOperationsParams>,
) -> Result<Json<ListOperationsResponse>, ApiError> {
    let parent = format!("projects/{}/locations/{}", project, location);
    let page = state
        .manager
        .list_operations(&parent, params.page_size, &params.page_token)
        .await?;
    Ok(Json(ListOperationsResponse {
        operations: page.operations,
        next_page_token: page.next_page_token,
    }))
}

/// GET /v1/projects/{project}/locations/{location}/operations/{operation}
async fn get_operation(
    State(state): State<AppState>,
    Path((project, location, operation)): Path<(String, String, String)>,
) -> Result<Json<Operation>, ApiError> {
    let name = operation_name(&project, &location, &operation);
    Ok(Json(state.manager.get_operation(&name).await?))
}

/// POST /v1/projects/{project}/locations/{location}/operations/{operation}:cancel
async fn cancel_operation(
    State(state): State<AppState>,
    Path((project, location, operation)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let Some(id) = operation.strip_suffix(CANCEL_SUFFIX) else {
        return Err(LifecycleError::NotFound(format!("no POST method on operation {}", operation)).into());
    };
    state
        .manager
        .cancel_operation(&operation_name(&project, &location, id))
        .await?;
    Ok(Json(json!({})))
}

/// DELETE /v1/projects/{project}/locations/{location}/operations/{operation}
async fn delete_operation(
    State(state): State<AppState>,
    Path((project, location, operation)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let name = operation_name(&project, &location, &operation);
    state.manager.delete_operation(&name).await?;
    Ok(Json(json!({})))
}
