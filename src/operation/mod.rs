/// Long-running operation layer
///
/// Every mutation is reported through an operation record that clients poll
/// until it is done:
/// - Type definitions (Operation, OperationOutcome, OperationName)
/// - SQLite persistence with sqlx

pub mod types;

pub mod tracker;

pub use tracker::OperationTracker;
pub use types::{Operation, OperationOutcome, OperationVerb};
