/// Transition Runtime
///
/// Everything that happens after a mutation request returns:
/// - The deployment backend collaborator
/// - The per-workflow deployment state machine
/// - The work queue and its dispatcher
/// - Recovery of transitions whose run died

// External deployment backend trait and clients
pub mod backend;

// DEPLOYING/DELETING state machine
pub mod machine;

// Bounded work queue drained by a semaphore-limited dispatcher
pub mod dispatcher;

// Lease expiry sweeps
pub mod reaper;

// Re-export main types
pub use backend::{DeploymentBackend, HttpDeploymentBackend, LocalBackend};
pub use dispatcher::{Dispatcher, WorkQueue};
pub use machine::DeploymentStateMachine;
pub use reaper::LeaseReaper;
