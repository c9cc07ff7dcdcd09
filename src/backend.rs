//! Container backend contract — the seam between the pool and the runtime.
//!
//! The pool never inspects container internals; it drives an opaque handle
//! through the operations below. Every call may block and may fail. The pool
//! never retries a backend call — retry pressure exists only at the acquirer
//! level, on capacity.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::action::RunResult;

/// Opaque handle to a container issued by the backend.
///
/// The runtime id is absent until the backend reports a successful start
/// (e.g. a straggler listed by name only). The name is unique per pool
/// lifetime and doubles as the pool's lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: Option<String>,
    pub name: String,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
        }
    }
}

/// Resource limits applied at creation.
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    pub memory_mb: u64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self { memory_mb: 256 }
    }
}

/// Everything `create` needs besides the image and name.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub network: String,
    /// Pull the image before creating. Stock runtime images are assumed
    /// present; user images are not.
    pub pull: bool,
    pub env: Vec<String>,
    pub limits: ContainerLimits,
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("image pull failed: {0}")]
    Pull(String),
    #[error("container init failed: {0}")]
    Init(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Driver for the external container runtime.
///
/// Implementations translate these calls into whatever the runtime speaks;
/// the pool consumes them as-is.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    /// Create and start a container. On success the returned handle carries
    /// the runtime id.
    async fn create(
        &self,
        name: &str,
        image: &str,
        opts: &CreateOptions,
    ) -> Result<Container, BackendError>;

    /// Run the in-container initialization protocol with the given payload.
    /// Transport-level failures are errors; an unsuccessful init is a
    /// `RunResult` with a non-zero (or absent) response.
    async fn init(&self, container: &Container, payload: &Value) -> Result<RunResult, BackendError>;

    async fn pause(&self, container: &Container) -> Result<(), BackendError>;

    async fn unpause(&self, container: &Container) -> Result<(), BackendError>;

    async fn kill(&self, container: &Container) -> Result<(), BackendError>;

    /// Remove the container from the runtime, forcibly if needed.
    async fn remove(&self, container: &Container) -> Result<(), BackendError>;

    /// Combined stdout/stderr of the container so far, as UTF-8 text.
    async fn get_logs(&self, container: &Container) -> Result<String, BackendError>;

    /// Size in bytes of the container's log, without fetching it.
    async fn get_log_size(&self, container: &Container) -> Result<u64, BackendError>;

    /// Every container the runtime knows about, running or not.
    async fn list_all(&self) -> Result<Vec<Container>, BackendError>;
}
