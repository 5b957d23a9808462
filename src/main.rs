/// workflowctl server entry point
///
/// Loads configuration from the environment and starts the HTTP server.

use workflowctl::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /v1/projects/{project}/locations/{location}/workflows
/// - Operation polling and cancellation at /v1/projects/{project}/locations/{location}/operations
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to 0.0.0.0:3004 and a local SQLite file)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
