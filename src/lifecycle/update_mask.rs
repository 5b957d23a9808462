/// Field masks for partial workflow updates
///
/// An empty mask replaces every client-owned field with the request's values.
/// A non-empty mask copies only the named fields over the stored workflow.
/// Paths are accepted in snake_case or camelCase.

use crate::error::{LifecycleError, Result};
use crate::workflow::types::{Workflow, WorkflowSpec};

/// A client-owned workflow field that an update may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskField {
    Description,
    SourceContents,
    Labels,
    ServiceAccount,
}

impl MaskField {
    fn parse(path: &str) -> Result<Self> {
        match path {
            "description" => Ok(MaskField::Description),
            "source_contents" | "sourceContents" => Ok(MaskField::SourceContents),
            "labels" => Ok(MaskField::Labels),
            "service_account" | "serviceAccount" => Ok(MaskField::ServiceAccount),
            "name" | "state" | "version_id" | "versionId" | "revision_id" | "revisionId"
            | "create_time" | "createTime" | "update_time" | "updateTime"
            | "revision_create_time" | "revisionCreateTime" => Err(LifecycleError::invalid(format!(
                "update_mask path '{}' is not client-settable",
                path
            ))),
            other => Err(LifecycleError::invalid(format!("unknown update_mask path '{}'", other))),
        }
    }
}

/// Parse mask paths; blank entries are skipped and duplicates collapse
pub fn parse_mask(paths: &[String]) -> Result<Vec<MaskField>> {
    let mut fields = Vec::new();
    for path in paths.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let field = MaskField::parse(path)?;
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    Ok(fields)
}

/// Compute the spec an update will deploy
///
/// A `service_account` of `None` in the result means "use the project default".
pub fn merge(current: &Workflow, patch: WorkflowSpec, mask: &[MaskField]) -> WorkflowSpec {
    if mask.is_empty() {
        return patch;
    }

    let mut merged = WorkflowSpec {
        description: current.description.clone(),
        source_code: Some(current.source_code.clone()),
        labels: current.labels.clone(),
        service_account: Some(current.service_account.clone()),
    };
    let WorkflowSpec {
        description,
        source_code,
        labels,
        service_account,
    } = patch;

    for field in mask {
        match field {
            MaskField::Description => merged.description = description.clone(),
            MaskField::SourceContents => merged.source_code = source_code.clone(),
            MaskField::Labels => merged.labels = labels.clone(),
            MaskField::ServiceAccount => merged.service_account = service_account.clone(),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{SourceCode, WorkflowState};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn stored() -> Workflow {
        let now = Utc::now();
        Workflow {
            name: "projects/p/locations/l/workflows/w".to_string(),
            description: "old".to_string(),
            source_code: SourceCode::SourceContents("steps: [old]".to_string()),
            state: WorkflowState::Active,
            version_id: 3,
            revision_id: "000003-abc".to_string(),
            create_time: now,
            update_time: now,
            revision_create_time: now,
            labels: BTreeMap::from([("team".to_string(), "core".to_string())]),
            service_account: "custom@example.com".to_string(),
        }
    }

    fn patch() -> WorkflowSpec {
        WorkflowSpec {
            description: "new".to_string(),
            source_code: Some(SourceCode::SourceContents("steps: [new]".to_string())),
            labels: BTreeMap::new(),
            service_account: None,
        }
    }

    #[test]
    fn empty_mask_replaces_everything() {
        let merged = merge(&stored(), patch(), &[]);
        assert_eq!(merged, patch());
    }

    #[test]
    fn masked_fields_only() {
        let mask = parse_mask(&["sourceContents".to_string()]).unwrap();
        let merged = merge(&stored(), patch(), &mask);
        assert_eq!(merged.description, "old");
        assert_eq!(merged.source_code, Some(SourceCode::SourceContents("steps: [new]".to_string())));
        assert_eq!(merged.labels.get("team").map(String::as_str), Some("core"));
        assert_eq!(merged.service_account.as_deref(), Some("custom@example.com"));
    }

    #[test]
    fn masking_service_account_without_value_resets_to_default() {
        let mask = parse_mask(&["service_account".to_string(), "labels".to_string()]).unwrap();
        let merged = merge(&stored(), patch(), &mask);
        assert_eq!(merged.service_account, None);
        assert!(merged.labels.is_empty());
    }

    #[test]
    fn paths_are_trimmed_and_deduplicated() {
        let paths = vec![" labels ".to_string(), String::new(), "labels".to_string()];
        assert_eq!(parse_mask(&paths).unwrap(), vec![MaskField::Labels]);
    }

    #[test]
    fn output_only_and_unknown_paths_are_rejected() {
        for path in ["state", "versionId", "name", "bogus"] {
            let err = parse_mask(&[path.to_string()]).unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidArgument(_)), "{}", path);
        }
    }
}
