/// SQLite persistence layer for workflow resources
///
/// Workflows are stored as JSON records next to a small set of indexed columns.
/// Every write is conditional: inserts only succeed while the name is absent and
/// updates/deletes only while the stored `revision` still matches what the caller
/// read. A mismatch comes back as a `Conflict` outcome, never as an error.

use crate::error::{LifecycleError, Result};
use crate::pagination::{decode_token, encode_token};
use crate::workflow::query::{Filter, OrderBy, WorkflowCursor};
use crate::workflow::types::{LocationName, Workflow, WorkflowName, WorkflowRecord, WorkflowState};
use sqlx::{sqlite::SqlitePool, Row};

/// What a conditional write expects to find in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No record with this name exists
    Absent,
    /// The stored record is at exactly this revision
    Revision(i64),
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Written; carries the record at its new revision
    Written(WorkflowRecord),
    /// The precondition no longer held
    Conflict,
}

/// Result of a conditional delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Conflict,
    NotFound,
}

/// One page of a workflow listing
#[derive(Debug, Clone, Default)]
pub struct WorkflowPage {
    pub workflows: Vec<Workflow>,
    /// Empty when no further results exist
    pub next_page_token: String,
    /// Locations that could not be reached; always empty for a single database
    pub unreachable: Vec<String>,
}

/// SQLite-based workflow resource store
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// Connection pool shared with the operation tracker
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the workflow storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                name TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                parent TEXT NOT NULL,
                state TEXT NOT NULL,
                revision INTEGER NOT NULL,
                record JSON NOT NULL,
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_parent ON workflows(parent)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_state ON workflows(state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Retrieve a workflow record by name
    pub async fn get(&self, name: &WorkflowName) -> Result<Option<WorkflowRecord>> {
        let row = sqlx::query("SELECT revision, record FROM workflows WHERE name = ?")
            .bind(name.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode_row(&row)).transpose()
    }

    /// Write `record` only if the stored state still matches `expected`
    ///
    /// On success the returned record carries its new revision.
    pub async fn put_if_match(&self, record: &WorkflowRecord, expected: Precondition) -> Result<WriteOutcome> {
        let name = WorkflowName::parse(&record.workflow.name)?;
        let json = serde_json::to_string(record)?;
        let workflow = &record.workflow;

        let (result, revision) = match expected {
            Precondition::Absent => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO workflows (name, project, parent, state, revision, record, create_time, update_time)
                    VALUES (?, ?, ?, ?, 1, ?, ?, ?)
                    ON CONFLICT(name) DO NOTHING
                    "#,
                )
                .bind(&workflow.name)
                .bind(&name.project)
                .bind(name.parent().to_string())
                .bind(workflow.state.as_str())
                .bind(&json)
                .bind(workflow.create_time.to_rfc3339())
                .bind(workflow.update_time.to_rfc3339())
                .execute(&self.pool)
                .await?;
                (result, 1)
            }
            Precondition::Revision(current) => {
                let result = sqlx::query(
                    r#"
                    UPDATE workflows
                    SET state = ?, revision = revision + 1, record = ?, update_time = ?
                    WHERE name = ? AND revision = ?
                    "#,
                )
                .bind(workflow.state.as_str())
                .bind(&json)
                .bind(workflow.update_time.to_rfc3339())
                .bind(&workflow.name)
                .bind(current)
                .execute(&self.pool)
                .await?;
                (result, current + 1)
            }
        };

        if result.rows_affected() == 0 {
            tracing::debug!("Conditional write lost for {} (expected {:?})", workflow.name, expected);
            return Ok(WriteOutcome::Conflict);
        }

        let mut written = record.clone();
        written.revision = revision;
        Ok(WriteOutcome::Written(written))
    }

    /// Remove a workflow only if it is still at `revision`
    pub async fn delete_if_match(&self, name: &WorkflowName, revision: i64) -> Result<DeleteOutcome> {
        let name = name.to_string();
        let result = sqlx::query("DELETE FROM workflows WHERE name = ? AND revision = ?")
            .bind(&name)
            .bind(revision)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(DeleteOutcome::Deleted);
        }

        let exists = sqlx::query("SELECT 1 FROM workflows WHERE name = ?")
            .bind(&name)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(if exists { DeleteOutcome::Conflict } else { DeleteOutcome::NotFound })
    }

    /// List one page of workflows under `parent`
    ///
    /// Results follow `order_by` (name by default) with name as the tie-breaker,
    /// so the order is stable across pages. `page_size` must already be clamped.
    pub async fn list(
        &self,
        parent: &LocationName,
        page_size: usize,
        page_token: &str,
        filter: &str,
        order_by: &str,
    ) -> Result<WorkflowPage> {
        let parsed_filter = Filter::parse(filter)?;
        let order = OrderBy::parse(order_by)?;
        let query_key = format!("{}|{}|{}", parent, filter.trim(), order_by.trim());

        let cursor = if page_token.is_empty() {
            None
        } else {
            let cursor: WorkflowCursor = decode_token(page_token)?;
            if cursor.query != query_key {
                return Err(LifecycleError::invalid(
                    "page_token does not belong to this parent, filter and order_by",
                ));
            }
            Some(cursor)
        };

        let rows = if parent.is_wildcard() {
            sqlx::query("SELECT revision, record FROM workflows WHERE project = ?")
                .bind(&parent.project)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT revision, record FROM workflows WHERE parent = ?")
                .bind(parent.to_string())
                .fetch_all(&self.pool)
                .await?
        };

        let mut matching = Vec::new();
        for row in &rows {
            let record = decode_row(row)?;
            // Placeholders never surface to clients
            if record.workflow.state != WorkflowState::Unspecified && parsed_filter.matches(&record.workflow) {
                matching.push(record.workflow);
            }
        }
        matching.sort_by(|a, b| order.compare(a, b));

        let mut page: Vec<Workflow> = matching
            .into_iter()
            .filter(|workflow| cursor.as_ref().map_or(true, |c| order.is_after(workflow, c)))
            .take(page_size + 1)
            .collect();

        let next_page_token = if page.len() > page_size {
            page.truncate(page_size);
            match page.last() {
                Some(last) => encode_token(&WorkflowCursor {
                    query: query_key,
                    key: order.sort_value(last),
                    name: last.name.clone(),
                })?,
                None => String::new(),
            }
        } else {
            String::new()
        };

        tracing::debug!("Listed {} workflows under {}", page.len(), parent);

        Ok(WorkflowPage {
            workflows: page,
            next_page_token,
            unreachable: Vec::new(),
        })
    }

    /// Load every record currently in DEPLOYING or DELETING
    ///
    /// Used by lease recovery to find runs that may have died.
    pub async fn list_transient(&self) -> Result<Vec<WorkflowRecord>> {
        let rows = sqlx::query("SELECT revision, record FROM workflows WHERE state IN (?, ?)")
            .bind(WorkflowState::Deploying.as_str())
            .bind(WorkflowState::Deleting.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRecord> {
    let json: String = row.get("record");
    let mut record: WorkflowRecord = serde_json::from_str(&json)?;
    record.revision = row.get("revision");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{SourceCode, TransitionLease, WorkflowSpec};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn storage() -> WorkflowStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let storage = WorkflowStorage::new(pool);
        storage.init_schema().await.expect("schema");
        storage
    }

    fn deploying(name: &str) -> WorkflowRecord {
        let name = WorkflowName::parse(name).unwrap();
        let spec = WorkflowSpec {
            source_code: Some(SourceCode::SourceContents("steps: []".to_string())),
            ..WorkflowSpec::default()
        };
        let mut record = WorkflowRecord::placeholder(&name, spec, "sa".to_string()).unwrap();
        record.begin_deploy(TransitionLease::new("test", "op", chrono::Duration::seconds(60)));
        record
    }

    fn written(outcome: WriteOutcome) -> WorkflowRecord {
        match outcome {
            WriteOutcome::Written(record) => record,
            WriteOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn insert_only_succeeds_once() {
        let storage = storage().await;
        let record = deploying("projects/p/locations/l/workflows/w");

        let first = written(storage.put_if_match(&record, Precondition::Absent).await.unwrap());
        assert_eq!(first.revision, 1);
        assert_eq!(
            storage.put_if_match(&record, Precondition::Absent).await.unwrap(),
            WriteOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let storage = storage().await;
        let name = WorkflowName::parse("projects/p/locations/l/workflows/w").unwrap();
        let mut record = written(
            storage
                .put_if_match(&deploying(&name.to_string()), Precondition::Absent)
                .await
                .unwrap(),
        );

        record.finish(WorkflowState::Active);
        let updated = written(
            storage
                .put_if_match(&record, Precondition::Revision(record.revision))
                .await
                .unwrap(),
        );
        assert_eq!(updated.revision, 2);

        // Writing again with the revision we originally read must lose
        assert_eq!(
            storage.put_if_match(&record, Precondition::Revision(1)).await.unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(storage.delete_if_match(&name, 1).await.unwrap(), DeleteOutcome::Conflict);
        assert_eq!(storage.delete_if_match(&name, 2).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(storage.delete_if_match(&name, 2).await.unwrap(), DeleteOutcome::NotFound);
        assert!(storage.get(&name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_records_are_discoverable() {
        let storage = storage().await;
        let mut settled = written(
            storage
                .put_if_match(&deploying("projects/p/locations/l/workflows/a"), Precondition::Absent)
                .await
                .unwrap(),
        );
        settled.finish(WorkflowState::Active);
        storage
            .put_if_match(&settled, Precondition::Revision(settled.revision))
            .await
            .unwrap();
        storage
            .put_if_match(&deploying("projects/p/locations/l/workflows/b"), Precondition::Absent)
            .await
            .unwrap();

        let transient = storage.list_transient().await.unwrap();
        assert_eq!(transient.len(), 1);
        assert!(transient[0].workflow.name.ends_with("/b"));
    }
}
