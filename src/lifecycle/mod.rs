/// Lifecycle Manager layer
///
/// Entry point for every client-visible operation on workflows and their
/// long-running operations. Mutations return an operation handle immediately;
/// the deployment itself runs in the background.

pub mod manager;

// Partial update support
pub mod update_mask;

pub use manager::LifecycleManager;
