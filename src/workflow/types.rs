/// Core workflow resource definitions
///
/// Defines the Workflow resource as clients see it, the resource names it is
/// addressed by, and the internal record the resource store persists (which adds
/// the transition lease and the pre-transition snapshot used for reverts).

use crate::error::{LifecycleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest accepted description, in characters
pub const MAX_DESCRIPTION_CHARS: usize = 1000;
/// Largest accepted inline source, in bytes
pub const MAX_SOURCE_BYTES: usize = 128 * 1024;
/// Most labels a single workflow may carry
pub const MAX_LABELS: usize = 64;

/// A deployable workflow program resource
///
/// `state`, `version_id`, `revision_id` and the timestamps are system-owned;
/// everything else comes from the client through `WorkflowSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Full resource name: projects/{project}/locations/{location}/workflows/{workflow}
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Program source; serialized inline as e.g. `"sourceContents": "..."`
    #[serde(flatten)]
    pub source_code: SourceCode,
    /// Deployment state
    pub state: WorkflowState,
    /// Monotonic deployment counter, 1 after the first deploy attempt
    pub version_id: u64,
    /// Display form of the current revision: `{version_id:06}-{suffix}`
    pub revision_id: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// When the current revision was deployed
    pub revision_create_time: DateTime<Utc>,
    /// Client-owned labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Identity the deployment backend runs the program as
    pub service_account: String,
}

/// Where a workflow's program comes from
///
/// Only inline contents exist today; further variants (e.g. an external
/// reference) slot in here without touching callers that match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceCode {
    /// Program text supplied inline
    SourceContents(String),
}

impl SourceCode {
    /// Size of the source payload in bytes
    pub fn len(&self) -> usize {
        match self {
            SourceCode::SourceContents(contents) => contents.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deployment state of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Pre-creation placeholder, never observed by clients
    #[serde(rename = "STATE_UNSPECIFIED")]
    Unspecified,
    Active,
    Failed,
    Deploying,
    Deleting,
}

impl WorkflowState {
    /// In-progress states double as the soft lock on a resource
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowState::Deploying | WorkflowState::Deleting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Unspecified => "STATE_UNSPECIFIED",
            WorkflowState::Active => "ACTIVE",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Deploying => "DEPLOYING",
            WorkflowState::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STATE_UNSPECIFIED" | "UNSPECIFIED" => Ok(WorkflowState::Unspecified),
            "ACTIVE" => Ok(WorkflowState::Active),
            "FAILED" => Ok(WorkflowState::Failed),
            "DEPLOYING" => Ok(WorkflowState::Deploying),
            "DELETING" => Ok(WorkflowState::Deleting),
            other => Err(LifecycleError::invalid(format!("unknown workflow state '{}'", other))),
        }
    }
}

/// Client-supplied mutable fields of a workflow
///
/// Used as the body of create requests and as the patch source for updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowSpec {
    pub description: String,
    pub source_code: Option<SourceCode>,
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

/// Parent collection: projects/{project}/locations/{location}
///
/// The location `-` addresses every location of the project when listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationName {
    pub project: String,
    pub location: String,
}

impl LocationName {
    pub fn parse(parent: &str) -> Result<Self> {
        let parts: Vec<&str> = parent.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location] => {
                validate_segment("project", project)?;
                if *location != "-" {
                    validate_segment("location", location)?;
                }
                Ok(Self {
                    project: project.to_string(),
                    location: location.to_string(),
                })
            }
            _ => Err(LifecycleError::invalid(format!(
                "invalid parent '{}': expected projects/{{project}}/locations/{{location}}",
                parent
            ))),
        }
    }

    /// True when this parent spans every location of its project
    pub fn is_wildcard(&self) -> bool {
        self.location == "-"
    }
}

impl fmt::Display for LocationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/locations/{}", self.project, self.location)
    }
}

/// Workflow resource name: projects/{project}/locations/{location}/workflows/{workflow}
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowName {
    pub project: String,
    pub location: String,
    pub workflow: String,
}

impl WorkflowName {
    pub fn new(parent: &LocationName, workflow_id: &str) -> Self {
        Self {
            project: parent.project.clone(),
            location: parent.location.clone(),
            workflow: workflow_id.to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "workflows", workflow] => {
                validate_segment("project", project)?;
                validate_segment("location", location)?;
                validate_segment("workflow", workflow)?;
                Ok(Self {
                    project: project.to_string(),
                    location: location.to_string(),
                    workflow: workflow.to_string(),
                })
            }
            _ => Err(LifecycleError::invalid(format!(
                "invalid workflow name '{}': expected projects/{{project}}/locations/{{location}}/workflows/{{workflow}}",
                name
            ))),
        }
    }

    pub fn parent(&self) -> LocationName {
        LocationName {
            project: self.project.clone(),
            location: self.location.clone(),
        }
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/workflows/{}",
            self.project, self.location, self.workflow
        )
    }
}

fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    let valid = segment.starts_with(|c: char| c.is_ascii_alphanumeric())
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::invalid(format!("invalid {} id '{}'", kind, segment)))
    }
}

/// Check a client-chosen workflow id
///
/// Letters, digits, underscores and hyphens; starts with a letter, ends with a
/// letter or digit, 1 to 64 characters.
pub fn validate_workflow_id(workflow_id: &str) -> Result<()> {
    let len = workflow_id.chars().count();
    let starts_with_letter = workflow_id
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic());
    let ends_with_alnum = workflow_id
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    let charset_ok = workflow_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if (1..=64).contains(&len) && starts_with_letter && ends_with_alnum && charset_ok {
        Ok(())
    } else {
        Err(LifecycleError::invalid(format!(
            "invalid workflow_id '{}': must be 1-64 letters, digits, underscores or hyphens, \
             start with a letter and end with a letter or digit",
            workflow_id
        )))
    }
}

/// Validate the client-owned fields that will land on a resource
pub fn validate_spec(spec: &WorkflowSpec) -> Result<()> {
    if spec.description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(LifecycleError::invalid(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }

    match &spec.source_code {
        None => return Err(LifecycleError::invalid("source_contents is required")),
        Some(source) if source.is_empty() => {
            return Err(LifecycleError::invalid("source_contents must not be empty"))
        }
        Some(source) if source.len() > MAX_SOURCE_BYTES => {
            return Err(LifecycleError::invalid(format!(
                "source_contents exceeds {} bytes",
                MAX_SOURCE_BYTES
            )))
        }
        Some(_) => {}
    }

    if spec.labels.len() > MAX_LABELS {
        return Err(LifecycleError::invalid(format!("at most {} labels are allowed", MAX_LABELS)));
    }
    for (key, value) in &spec.labels {
        let key_ok = (1..=63).contains(&key.len())
            && key.starts_with(|c: char| c.is_ascii_lowercase())
            && key.chars().all(is_label_char);
        if !key_ok {
            return Err(LifecycleError::invalid(format!("invalid label key '{}'", key)));
        }
        if value.len() > 63 || !value.chars().all(is_label_char) {
            return Err(LifecycleError::invalid(format!(
                "invalid value '{}' for label '{}'",
                value, key
            )));
        }
    }

    if let Some(account) = &spec.service_account {
        if account.trim().is_empty() {
            return Err(LifecycleError::invalid("service_account must not be blank"));
        }
    }

    Ok(())
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
}

/// Ownership token marking a workflow as under one state-machine run
///
/// Held while the workflow is DEPLOYING or DELETING. A lease past `expires_at`
/// belongs to a run presumed dead and may be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionLease {
    pub id: Uuid,
    /// Process instance that holds the lease
    pub owner: String,
    /// Operation driving the transition
    pub operation: String,
    pub expires_at: DateTime<Utc>,
}

impl TransitionLease {
    pub fn new(owner: &str, operation: &str, duration: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            operation: operation.to_string(),
            expires_at: Utc::now() + duration,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stored form of a workflow
///
/// `revision` is the resource store's compare-and-swap token; it changes on
/// every write and is carried outside the serialized JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow: Workflow,
    /// Present exactly while the workflow is in a transient state
    #[serde(default)]
    pub lease: Option<TransitionLease>,
    /// Pre-transition snapshot; `None` during a create (revert means removal)
    #[serde(default)]
    pub prior: Option<Box<Workflow>>,
    /// Operation whose run last released the lease, kept until the next release
    #[serde(default)]
    pub settled_by: Option<String>,
    #[serde(skip)]
    pub revision: i64,
}

impl WorkflowRecord {
    /// Fresh record for a create, at version 0 and not yet deploying
    pub fn placeholder(name: &WorkflowName, spec: WorkflowSpec, service_account: String) -> Result<Self> {
        let source_code = spec
            .source_code
            .ok_or_else(|| LifecycleError::invalid("source_contents is required"))?;
        let now = Utc::now();
        Ok(Self {
            workflow: Workflow {
                name: name.to_string(),
                description: spec.description,
                source_code,
                state: WorkflowState::Unspecified,
                version_id: 0,
                revision_id: String::new(),
                create_time: now,
                update_time: now,
                revision_create_time: now,
                labels: spec.labels,
                service_account,
            },
            lease: None,
            prior: None,
            settled_by: None,
            revision: 0,
        })
    }

    /// Enter DEPLOYING under `lease`, consuming the next version number
    pub fn begin_deploy(&mut self, lease: TransitionLease) {
        let now = Utc::now();
        self.prior = match self.workflow.state {
            WorkflowState::Unspecified => None,
            _ => Some(Box::new(self.workflow.clone())),
        };
        self.workflow.state = WorkflowState::Deploying;
        self.workflow.version_id += 1;
        self.workflow.revision_id = revision_id(self.workflow.version_id);
        self.workflow.revision_create_time = now;
        self.workflow.update_time = now;
        self.lease = Some(lease);
    }

    /// Enter DELETING under `lease`
    pub fn begin_delete(&mut self, lease: TransitionLease) {
        self.prior = Some(Box::new(self.workflow.clone()));
        self.workflow.state = WorkflowState::Deleting;
        self.workflow.update_time = Utc::now();
        self.lease = Some(lease);
    }

    /// Settle into a terminal state and drop the lease
    pub fn finish(&mut self, state: WorkflowState) {
        self.workflow.state = state;
        self.workflow.update_time = Utc::now();
        self.settled_by = self.lease.take().map(|lease| lease.operation);
        self.prior = None;
    }

    /// Undo the in-flight transition
    ///
    /// Restores the pre-transition content, state and revision but keeps the
    /// version counter, so an abandoned attempt still consumes its version.
    /// Returns `None` when the transition was a create and the record should vanish.
    pub fn reverted(&self) -> Option<WorkflowRecord> {
        let prior = self.prior.as_ref()?;
        let mut workflow = (**prior).clone();
        workflow.version_id = self.workflow.version_id;
        workflow.update_time = Utc::now();
        Some(WorkflowRecord {
            workflow,
            lease: None,
            prior: None,
            settled_by: self.lease.as_ref().map(|lease| lease.operation.clone()),
            revision: self.revision,
        })
    }

    pub fn holds_lease(&self, lease_id: Uuid) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.id == lease_id)
    }
}

fn revision_id(version_id: u64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{:06}-{}", version_id, &suffix[..3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(source: &str) -> WorkflowSpec {
        WorkflowSpec {
            source_code: Some(SourceCode::SourceContents(source.to_string())),
            ..WorkflowSpec::default()
        }
    }

    #[test]
    fn workflow_id_rules() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for ok in ["w1", "a", "my_workflow-2", longest.as_str()] {
            assert!(validate_workflow_id(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "1abc", "_abc", "abc-", "abc_", "has space", "dot.ted", too_long.as_str()] {
            assert!(validate_workflow_id(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn names_round_trip_through_display() {
        let name = WorkflowName::parse("projects/p1/locations/l1/workflows/w1").unwrap();
        assert_eq!(name.workflow, "w1");
        assert_eq!(name.to_string(), "projects/p1/locations/l1/workflows/w1");
        assert_eq!(name.parent().to_string(), "projects/p1/locations/l1");

        assert!(WorkflowName::parse("projects/p1/workflows/w1").is_err());
        assert!(LocationName::parse("projects/p1/locations/-").unwrap().is_wildcard());
        assert!(WorkflowName::parse("projects/p1/locations/-/workflows/w1").is_err());
    }

    #[test]
    fn spec_validation_rejects_bad_labels_and_sources() {
        assert!(validate_spec(&spec("steps: []")).is_ok());
        assert!(validate_spec(&WorkflowSpec::default()).is_err());
        assert!(validate_spec(&spec("")).is_err());

        let mut labelled = spec("steps: []");
        labelled.labels.insert("Env".to_string(), "prod".to_string());
        assert!(validate_spec(&labelled).is_err());

        let mut labelled = spec("steps: []");
        labelled.labels.insert("env".to_string(), "prod-1".to_string());
        assert!(validate_spec(&labelled).is_ok());
    }

    #[test]
    fn deploy_bumps_version_and_revert_keeps_it() {
        let name = WorkflowName::parse("projects/p/locations/l/workflows/w").unwrap();
        let mut record = WorkflowRecord::placeholder(&name, spec("v1"), "sa".to_string()).unwrap();
        record.begin_deploy(TransitionLease::new("me", "op-1", chrono::Duration::seconds(60)));
        assert_eq!(record.workflow.version_id, 1);
        assert!(record.workflow.revision_id.starts_with("000001-"));
        assert!(record.reverted().is_none(), "reverting a create removes the record");

        record.finish(WorkflowState::Active);
        record.workflow.source_code = SourceCode::SourceContents("v2".to_string());
        assert_eq!(record.settled_by.as_deref(), Some("op-1"));
        let before = record.workflow.clone();
        record.begin_deploy(TransitionLease::new("me", "op-2", chrono::Duration::seconds(60)));
        assert_eq!(record.workflow.version_id, 2);
        assert_ne!(record.workflow.revision_id, before.revision_id);

        let reverted = record.reverted().unwrap();
        assert_eq!(reverted.workflow.state, WorkflowState::Active);
        assert_eq!(reverted.workflow.source_code, before.source_code);
        assert_eq!(reverted.workflow.version_id, 2);
        assert_eq!(reverted.workflow.revision_id, before.revision_id);
        assert_eq!(reverted.workflow.revision_create_time, before.revision_create_time);
        assert_eq!(reverted.settled_by.as_deref(), Some("op-2"));
        assert!(reverted.lease.is_none());
    }

    #[test]
    fn source_serializes_inline() {
        let name = WorkflowName::parse("projects/p/locations/l/workflows/w").unwrap();
        let record = WorkflowRecord::placeholder(&name, spec("steps: []"), "sa".to_string()).unwrap();
        let json = serde_json::to_value(&record.workflow).unwrap();
        assert_eq!(json["sourceContents"], "steps: []");
        assert_eq!(json["state"], "STATE_UNSPECIFIED");
    }
}
