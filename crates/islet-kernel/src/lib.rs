//! Orchestration core of the Islet sandbox platform.
//!
//! Wires the persistence layer, the container runtime adapter, and the
//! secrets vault into the environment and sandbox services. The HTTP and
//! WebSocket surface lives in `islet-daemon`; everything stateful about
//! sandboxes happens here.

pub mod environments;
pub mod redact;
pub mod runtime;
pub mod sandboxes;
pub mod validate;
pub mod vault;
pub mod workers;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use islet_db::{Database, StoreError};
use thiserror::Error;
use uuid::Uuid;

pub use environments::{EnvironmentPatch, EnvironmentService, EnvironmentSpec};
pub use redact::LogRedactor;
pub use runtime::{
    ContainerMetrics, ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime, ExecOutput,
    LogEvent, RuntimeError, TerminalControl, TerminalSession,
};
pub use sandboxes::{CreateSandbox, LogBroker, ReplicateSandbox, SandboxService, SandboxSettings};
pub use vault::{SecretsVault, VaultError};

/// Error taxonomy of the control plane. The daemon maps these onto the
/// external error codes and HTTP statuses.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("validation failed: {0}")]
    Validation(String),
    /// Covers both genuinely absent resources and resources owned by a
    /// different tenant; callers must not be able to tell the two apart.
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("sandbox is not running")]
    NotRunning,
    #[error("sandbox has no container")]
    NoContainer,
    #[error("metrics unavailable for this sandbox")]
    MetricsUnavailable,
    #[error(transparent)]
    Secrets(#[from] VaultError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Kernel-wide tunables.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub max_environments_per_user: i64,
    pub sandbox: SandboxSettings,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_environments_per_user: 5,
            sandbox: SandboxSettings::default(),
        }
    }
}

/// Top-level handle tying the services together.
pub struct IsletKernel<R>
where
    R: ContainerRuntime,
{
    db: Database,
    environments: EnvironmentService,
    sandboxes: SandboxService<R>,
}

impl<R> Clone for IsletKernel<R>
where
    R: ContainerRuntime,
{
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            environments: self.environments.clone(),
            sandboxes: self.sandboxes.clone(),
        }
    }
}

impl<R> IsletKernel<R>
where
    R: ContainerRuntime,
{
    pub fn new(db: Database, runtime: R, vault: SecretsVault, config: KernelConfig) -> Self {
        let runtime = Arc::new(runtime);
        let vault = Arc::new(vault);
        let environments = EnvironmentService::new(
            db.clone(),
            vault.clone(),
            config.max_environments_per_user,
        );
        let sandboxes = SandboxService::new(db.clone(), runtime, vault, config.sandbox);
        Self {
            db,
            environments,
            sandboxes,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn environments(&self) -> &EnvironmentService {
        &self.environments
    }

    pub fn sandboxes(&self) -> &SandboxService<R> {
        &self.sandboxes
    }

    /// Deletes an environment, first destroying every sandbox built from it
    /// through the state machine.
    pub async fn delete_environment(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
    ) -> Result<bool, KernelError> {
        if self
            .db
            .fetch_environment(user_id, environment_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        self.sandboxes
            .destroy_environment_sandboxes(user_id, environment_id)
            .await?;
        self.environments
            .delete_rows(user_id, environment_id)
            .await
    }
}
