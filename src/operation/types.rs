/// Long-running operation definitions
///
/// An Operation is the client's handle on an asynchronous workflow mutation.
/// It follows the usual long-running-operation shape: a name, typed metadata,
/// a `done` flag, and once done exactly one of `response` or `error`.

use crate::error::{ErrorCode, LifecycleError, Result};
use crate::workflow::types::{LocationName, Workflow, WorkflowName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// API version stamped on every operation's metadata
pub const API_VERSION: &str = "v1";

/// Kind of mutation an operation tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationVerb {
    Create,
    Update,
    Delete,
}

impl OperationVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationVerb::Create => "create",
            OperationVerb::Update => "update",
            OperationVerb::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress metadata attached to an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    pub create_time: DateTime<Utc>,
    /// Absent while the operation is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Workflow resource being mutated
    pub target: String,
    pub verb: OperationVerb,
    /// Human-readable progress text
    pub status_detail: String,
    /// Advisory, monotonic false -> true
    pub cancel_requested: bool,
    pub api_version: String,
}

/// Error outcome of a finished operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: ErrorCode,
    pub message: String,
}

impl OperationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Successful result payload
///
/// Deploys resolve to the workflow snapshot, deletes to an empty message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationResponse {
    Workflow(Box<Workflow>),
    Empty {},
}

/// Terminal outcome passed to `OperationTracker::complete`
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Response(OperationResponse),
    Error(OperationError),
}

impl OperationOutcome {
    pub fn workflow(workflow: Workflow) -> Self {
        OperationOutcome::Response(OperationResponse::Workflow(Box::new(workflow)))
    }

    pub fn empty() -> Self {
        OperationOutcome::Response(OperationResponse::Empty {})
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OperationOutcome::Error(OperationError::new(code, message))
    }
}

/// A long-running operation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// projects/{project}/locations/{location}/operations/operation-{uuid}
    pub name: String,
    pub metadata: OperationMetadata,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<OperationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl Operation {
    /// New running operation against `target`
    pub fn start(target: &WorkflowName, verb: OperationVerb) -> Self {
        let name = OperationName::generate(&target.parent());
        Self {
            name: name.to_string(),
            metadata: OperationMetadata {
                create_time: Utc::now(),
                end_time: None,
                target: target.to_string(),
                verb,
                status_detail: "Queued".to_string(),
                cancel_requested: false,
                api_version: API_VERSION.to_string(),
            },
            done: false,
            response: None,
            error: None,
        }
    }

    /// Terminal outcome, if the operation is done
    pub fn outcome(&self) -> Option<OperationOutcome> {
        if !self.done {
            return None;
        }
        match (&self.response, &self.error) {
            (_, Some(error)) => Some(OperationOutcome::Error(error.clone())),
            (Some(response), None) => Some(OperationOutcome::Response(response.clone())),
            (None, None) => Some(OperationOutcome::empty()),
        }
    }

    /// Record the terminal outcome and stamp `end_time`
    pub fn finish(&mut self, outcome: OperationOutcome) {
        self.done = true;
        self.metadata.end_time = Some(Utc::now());
        match outcome {
            OperationOutcome::Response(response) => {
                self.metadata.status_detail = "Completed".to_string();
                self.response = Some(response);
                self.error = None;
            }
            OperationOutcome::Error(error) => {
                self.metadata.status_detail = match error.code {
                    ErrorCode::Cancelled => "Cancelled".to_string(),
                    _ => format!("Failed: {}", error.message),
                };
                self.response = None;
                self.error = Some(error);
            }
        }
    }
}

/// Operation resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationName {
    pub parent: LocationName,
    pub id: String,
}

impl OperationName {
    pub fn generate(parent: &LocationName) -> Self {
        Self {
            parent: parent.clone(),
            id: format!("operation-{}", Uuid::new_v4()),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || {
            LifecycleError::invalid(format!(
                "invalid operation name '{}': expected projects/{{project}}/locations/{{location}}/operations/{{operation}}",
                name
            ))
        };
        let (parent, id) = name.rsplit_once("/operations/").ok_or_else(invalid)?;
        let parent = LocationName::parse(parent).map_err(|_| invalid())?;
        if parent.is_wildcard() || id.is_empty() || id.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            parent,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/operations/{}", self.parent, self.id)
    }
}
