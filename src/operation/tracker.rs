/// SQLite persistence layer for long-running operations
///
/// Operations are stored as JSON records. The advisory `cancel_requested` flag
/// lives in its own column so clients can flip it with a single atomic UPDATE
/// while the state machine is rewriting the rest of the record.

use crate::error::{LifecycleError, Result};
use crate::operation::types::{Operation, OperationName, OperationOutcome, OperationVerb};
use crate::pagination::{decode_token, encode_token};
use crate::workflow::types::{LocationName, WorkflowName};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

/// Attempts at a record rewrite before giving up with `Aborted`
const WRITE_ATTEMPTS: usize = 5;

/// One page of an operation listing
#[derive(Debug, Clone, Default)]
pub struct OperationPage {
    pub operations: Vec<Operation>,
    pub next_page_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OperationCursor {
    query: String,
    name: String,
}

/// SQLite-based operation tracker
#[derive(Debug, Clone)]
pub struct OperationTracker {
    /// Connection pool shared with the workflow store
    pool: SqlitePool,
}

impl OperationTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the operations table; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                name TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                parent TEXT NOT NULL,
                target TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL,
                record JSON NOT NULL,
                create_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_done ON operations(done)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Allocate a running operation for a mutation of `target`
    pub async fn create(&self, target: &WorkflowName, verb: OperationVerb) -> Result<Operation> {
        let operation = Operation::start(target, verb);
        let parent = target.parent();

        sqlx::query(
            r#"
            INSERT INTO operations (name, project, parent, target, done, cancel_requested, revision, record, create_time)
            VALUES (?, ?, ?, ?, 0, 0, 1, ?, ?)
            "#,
        )
        .bind(&operation.name)
        .bind(&parent.project)
        .bind(parent.to_string())
        .bind(&operation.metadata.target)
        .bind(serde_json::to_string(&operation)?)
        .bind(operation.metadata.create_time.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!("Created operation {} ({} {})", operation.name, verb, target);
        Ok(operation)
    }

    /// Fetch an operation; `NotFound` if it does not exist
    pub async fn get(&self, name: &str) -> Result<Operation> {
        OperationName::parse(name)?;
        self.load(name)
            .await?
            .map(|(operation, _)| operation)
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {}", name)))
    }

    /// Replace the human-readable progress text of a running operation
    pub async fn update_progress(&self, name: &str, status_detail: &str) -> Result<Operation> {
        for _ in 0..WRITE_ATTEMPTS {
            let (mut operation, revision) = self.require(name).await?;
            if operation.done {
                tracing::debug!("Ignoring progress update for finished operation {}", name);
                return Ok(operation);
            }
            operation.metadata.status_detail = status_detail.to_string();
            if self.write_if_match(&operation, revision).await? {
                return Ok(operation);
            }
        }
        Err(LifecycleError::Aborted(format!("concurrent updates to operation {}", name)))
    }

    /// Mark an operation done with `outcome`
    ///
    /// Completing twice with the same outcome is a no-op. Completing a finished
    /// operation with a different outcome is a bug in the caller and panics.
    pub async fn complete(&self, name: &str, outcome: OperationOutcome) -> Result<Operation> {
        for _ in 0..WRITE_ATTEMPTS {
            let (mut operation, revision) = self.require(name).await?;
            if let Some(existing) = operation.outcome() {
                if existing == outcome {
                    return Ok(operation);
                }
                tracing::error!(
                    "Operation {} already completed with {:?}; refusing conflicting outcome {:?}",
                    name,
                    existing,
                    outcome
                );
                panic!("operation {} completed twice with different outcomes", name);
            }

            operation.finish(outcome.clone());
            if self.write_if_match(&operation, revision).await? {
                tracing::info!("Operation {} done: {}", name, operation.metadata.status_detail);
                return Ok(operation);
            }
        }
        Err(LifecycleError::Aborted(format!("concurrent updates to operation {}", name)))
    }

    /// Complete `name` unless it already finished or no longer exists
    ///
    /// For recovery paths that may race the run they are cleaning up after.
    pub async fn complete_if_pending(&self, name: &str, outcome: OperationOutcome) -> Result<bool> {
        for _ in 0..WRITE_ATTEMPTS {
            let Some((mut operation, revision)) = self.load(name).await? else {
                return Ok(false);
            };
            if operation.done {
                return Ok(false);
            }
            operation.finish(outcome.clone());
            if self.write_if_match(&operation, revision).await? {
                return Ok(true);
            }
        }
        Err(LifecycleError::Aborted(format!("concurrent updates to operation {}", name)))
    }

    /// Flip the advisory cancellation flag
    ///
    /// Never terminates anything by itself; finished operations are left untouched.
    pub async fn request_cancel(&self, name: &str) -> Result<Operation> {
        OperationName::parse(name)?;
        sqlx::query("UPDATE operations SET cancel_requested = 1 WHERE name = ? AND done = 0")
            .bind(name)
            .execute(&self.pool)
            .await?;

        let operation = self.get(name).await?;
        if operation.metadata.cancel_requested && !operation.done {
            tracing::info!("Cancellation requested for operation {}", name);
        }
        Ok(operation)
    }

    /// List operations under `parent`, ordered by name
    pub async fn list(&self, parent: &LocationName, page_size: usize, page_token: &str) -> Result<OperationPage> {
        let query_key = parent.to_string();
        let after = if page_token.is_empty() {
            String::new()
        } else {
            let cursor: OperationCursor = decode_token(page_token)?;
            if cursor.query != query_key {
                return Err(LifecycleError::invalid("page_token does not belong to this parent"));
            }
            cursor.name
        };

        let (column, value) = if parent.is_wildcard() {
            ("project", parent.project.clone())
        } else {
            ("parent", parent.to_string())
        };
        let sql = format!(
            "SELECT revision, cancel_requested, record FROM operations \
             WHERE {} = ? AND name > ? ORDER BY name LIMIT ?",
            column
        );
        let rows = sqlx::query(&sql)
            .bind(value)
            .bind(&after)
            .bind((page_size + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut operations = rows
            .iter()
            .map(|row| decode_row(row).map(|(operation, _)| operation))
            .collect::<Result<Vec<_>>>()?;

        let next_page_token = if operations.len() > page_size {
            operations.truncate(page_size);
            match operations.last() {
                Some(last) => encode_token(&OperationCursor {
                    query: query_key,
                    name: last.name.clone(),
                })?,
                None => String::new(),
            }
        } else {
            String::new()
        };

        Ok(OperationPage {
            operations,
            next_page_token,
        })
    }

    /// Forget an operation record; a run still driving it is unaffected
    pub async fn delete(&self, name: &str) -> Result<()> {
        OperationName::parse(name)?;
        let result = sqlx::query("DELETE FROM operations WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LifecycleError::NotFound(format!("operation {}", name)));
        }
        Ok(())
    }

    /// Every operation that has not finished yet
    pub async fn list_pending(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query("SELECT revision, cancel_requested, record FROM operations WHERE done = 0")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| decode_row(row).map(|(operation, _)| operation))
            .collect()
    }

    async fn load(&self, name: &str) -> Result<Option<(Operation, i64)>> {
        let row = sqlx::query("SELECT revision, cancel_requested, record FROM operations WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn require(&self, name: &str) -> Result<(Operation, i64)> {
        self.load(name)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {}", name)))
    }

    /// Rewrite the record if nobody else has since `revision`; the cancel column is left alone
    async fn write_if_match(&self, operation: &Operation, revision: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET done = ?, record = ?, revision = revision + 1
            WHERE name = ? AND revision = ?
            "#,
        )
        .bind(operation.done)
        .bind(serde_json::to_string(operation)?)
        .bind(&operation.name)
        .bind(revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!("Lost write race on operation {}, retrying", operation.name);
        }
        Ok(result.rows_affected() > 0)
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<(Operation, i64)> {
    let json: String = row.get("record");
    let mut operation: Operation = serde_json::from_str(&json)?;
    let cancel_requested: i64 = row.get("cancel_requested");
    operation.metadata.cancel_requested = cancel_requested != 0;
    Ok((operation, row.get("revision")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn tracker() -> OperationTracker {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let tracker = OperationTracker::new(pool);
        tracker.init_schema().await.expect("schema");
        tracker
    }

    fn target(id: &str) -> WorkflowName {
        WorkflowName::parse(&format!("projects/p/locations/l/workflows/{}", id)).unwrap()
    }

    #[tokio::test]
    async fn complete_is_idempotent_for_identical_outcomes() {
        let tracker = tracker().await;
        let op = tracker.create(&target("w"), OperationVerb::Delete).await.unwrap();

        let first = tracker.complete(&op.name, OperationOutcome::empty()).await.unwrap();
        let second = tracker.complete(&op.name, OperationOutcome::empty()).await.unwrap();
        assert!(first.done);
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[should_panic(expected = "completed twice")]
    async fn conflicting_completion_is_fatal() {
        let tracker = tracker().await;
        let op = tracker.create(&target("w"), OperationVerb::Delete).await.unwrap();
        tracker.complete(&op.name, OperationOutcome::empty()).await.unwrap();
        let _ = tracker
            .complete(&op.name, OperationOutcome::error(ErrorCode::Internal, "boom"))
            .await;
    }

    #[tokio::test]
    async fn complete_if_pending_never_overrides_a_result() {
        let tracker = tracker().await;
        let op = tracker.create(&target("w"), OperationVerb::Create).await.unwrap();
        tracker.complete(&op.name, OperationOutcome::empty()).await.unwrap();

        let closed = tracker
            .complete_if_pending(&op.name, OperationOutcome::error(ErrorCode::Aborted, "lost"))
            .await
            .unwrap();
        assert!(!closed);
        assert!(tracker.get(&op.name).await.unwrap().error.is_none());

        let missing = "projects/p/locations/l/operations/operation-missing";
        assert!(!tracker
            .complete_if_pending(missing, OperationOutcome::empty())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_survives_progress_updates() {
        let tracker = tracker().await;
        let op = tracker.create(&target("w"), OperationVerb::Create).await.unwrap();

        tracker.request_cancel(&op.name).await.unwrap();
        tracker.update_progress(&op.name, "Deploying workflow revision 1").await.unwrap();

        let fetched = tracker.get(&op.name).await.unwrap();
        assert!(fetched.metadata.cancel_requested);
        assert_eq!(fetched.metadata.status_detail, "Deploying workflow revision 1");
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let tracker = tracker().await;
        let op = tracker.create(&target("w"), OperationVerb::Delete).await.unwrap();
        tracker.complete(&op.name, OperationOutcome::empty()).await.unwrap();

        let after = tracker.request_cancel(&op.name).await.unwrap();
        assert!(!after.metadata.cancel_requested);
        assert!(after.done);
    }

    #[tokio::test]
    async fn unknown_operations_are_not_found() {
        let tracker = tracker().await;
        let missing = "projects/p/locations/l/operations/operation-missing";
        assert_eq!(tracker.get(missing).await.unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(tracker.delete(missing).await.unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(
            tracker.request_cancel(missing).await.unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn listing_pages_through_every_operation() {
        let tracker = tracker().await;
        for i in 0..5 {
            tracker
                .create(&target(&format!("w{}", i)), OperationVerb::Create)
                .await
                .unwrap();
        }
        let parent = LocationName::parse("projects/p/locations/l").unwrap();

        let mut seen = Vec::new();
        let mut token = String::new();
        loop {
            let page = tracker.list(&parent, 2, &token).await.unwrap();
            seen.extend(page.operations.into_iter().map(|op| op.name));
            if page.next_page_token.is_empty() {
                break;
            }
            token = page.next_page_token;
        }
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen.len(), 5);
        assert_eq!(deduped, seen);
        assert_eq!(tracker.list_pending().await.unwrap().len(), 5);
    }
}
