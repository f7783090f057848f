//! Typed records and enums shared by the persistence layer and the kernel.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated.
    #[error("duplicate {entity}: {detail}")]
    Duplicate {
        entity: &'static str,
        detail: String,
    },
    /// The underlying database rejected the operation.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A stored row could not be decoded into its typed record.
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Coarse user-visible lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Error,
    Expired,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
            SandboxStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SandboxStatus::Pending),
            "running" => Some(SandboxStatus::Running),
            "stopped" => Some(SandboxStatus::Stopped),
            "error" => Some(SandboxStatus::Error),
            "expired" => Some(SandboxStatus::Expired),
            _ => None,
        }
    }

    /// Whether the sandbox still counts against the per-user quota.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            SandboxStatus::Stopped | SandboxStatus::Expired | SandboxStatus::Error
        )
    }

    /// Legal coarse transitions of the lifecycle state machine. `error` and
    /// `expired` are terminal until the row is destroyed.
    pub fn can_transition(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Error)
                | (Pending, Expired)
                | (Running, Running)
                | (Running, Stopped)
                | (Running, Expired)
                | (Running, Error)
                | (Stopped, Running)
                | (Stopped, Error)
        )
    }
}

/// Fine-grained provisioning sub-state, orthogonal to [`SandboxStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPhase {
    Creating,
    Starting,
    Healthy,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxPhase::Creating => "creating",
            SandboxPhase::Starting => "starting",
            SandboxPhase::Healthy => "healthy",
            SandboxPhase::Stopping => "stopping",
            SandboxPhase::Stopped => "stopped",
            SandboxPhase::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creating" => Some(SandboxPhase::Creating),
            "starting" => Some(SandboxPhase::Starting),
            "healthy" => Some(SandboxPhase::Healthy),
            "stopping" => Some(SandboxPhase::Stopping),
            "stopped" => Some(SandboxPhase::Stopped),
            "failed" => Some(SandboxPhase::Failed),
            _ => None,
        }
    }
}

/// Output stream a log line originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(LogStream::Stdout),
            "stderr" => Some(LogStream::Stderr),
            _ => None,
        }
    }
}

/// A container-port to host-port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
}

impl PortMapping {
    /// Container ports span the full range; host ports must be unprivileged.
    pub fn is_valid(&self) -> bool {
        self.container >= 1 && self.host >= 1024
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_prefix: String,
    pub secret_hash: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub current_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of an environment's container configuration. Only the
/// encrypted-secrets map may be rewritten in place after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentVersionRecord {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub version: i64,
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub build_files: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
    pub cpu: f64,
    pub memory_mb: i64,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub secrets_encrypted: BTreeMap<String, String>,
    pub mounts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub environment_id: Uuid,
    pub environment_version_id: Uuid,
    pub name: String,
    pub container_ref: Option<String>,
    pub status: SandboxStatus,
    pub phase: SandboxPhase,
    pub ports: Vec<PortMapping>,
    pub provision_progress: u8,
    pub provision_status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SandboxLogRecord {
    pub id: Uuid,
    pub sandbox_id: Uuid,
    pub stream: LogStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditEntryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: Value,
    pub client_ip: Option<String>,
    pub client_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub password_hash: &'a str,
}

#[derive(Debug)]
pub struct NewApiKey<'a> {
    pub user_id: Uuid,
    pub key_prefix: &'a str,
    pub secret_hash: &'a str,
    pub name: &'a str,
}

#[derive(Debug)]
pub struct NewEnvironment<'a> {
    pub user_id: Uuid,
    pub name: &'a str,
}

/// Field set for appending a version row. The `version` number is assigned by
/// the store inside the append transaction.
#[derive(Debug, Clone)]
pub struct NewEnvironmentVersion {
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub build_files: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
    pub cpu: f64,
    pub memory_mb: i64,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub secrets_encrypted: BTreeMap<String, String>,
    pub mounts: Vec<String>,
}

#[derive(Debug)]
pub struct NewSandbox<'a> {
    pub user_id: Uuid,
    pub environment_id: Uuid,
    pub environment_version_id: Uuid,
    pub name: &'a str,
    pub ports: Vec<PortMapping>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct NewSandboxLog<'a> {
    pub sandbox_id: Uuid,
    pub stream: LogStream,
    pub text: &'a str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewAuditEntry<'a> {
    pub user_id: Uuid,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: String,
    pub metadata: Value,
    pub client_ip: Option<&'a str>,
    pub client_agent: Option<&'a str>,
}

/// Filter for sandbox listings.
#[derive(Debug, Default, Clone)]
pub struct SandboxFilter {
    pub status: Option<SandboxStatus>,
    pub environment_id: Option<Uuid>,
}

/// Filter for audit listings.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            SandboxStatus::Pending,
            SandboxStatus::Running,
            SandboxStatus::Stopped,
            SandboxStatus::Error,
            SandboxStatus::Expired,
        ] {
            assert_eq!(SandboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SandboxStatus::parse("bogus"), None);
    }

    #[test]
    fn phase_round_trips() {
        for phase in [
            SandboxPhase::Creating,
            SandboxPhase::Starting,
            SandboxPhase::Healthy,
            SandboxPhase::Stopping,
            SandboxPhase::Stopped,
            SandboxPhase::Failed,
        ] {
            assert_eq!(SandboxPhase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use SandboxStatus::*;
        // The provisioning pipeline.
        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Error));
        // User stop / start / ttl expiry.
        assert!(Running.can_transition(Stopped));
        assert!(Stopped.can_transition(Running));
        assert!(Running.can_transition(Expired));
        // A pending sandbox whose TTL lapses before it ever became healthy.
        assert!(Pending.can_transition(Expired));
        // Terminal states stay terminal until the row is destroyed.
        assert!(!Error.can_transition(Running));
        assert!(!Expired.can_transition(Running));
        assert!(!Expired.can_transition(Stopped));
        // Stopped sandboxes never expire; they are already inert.
        assert!(!Stopped.can_transition(Expired));
    }

    #[test]
    fn active_statuses_count_against_quota() {
        assert!(SandboxStatus::Pending.is_active());
        assert!(SandboxStatus::Running.is_active());
        assert!(!SandboxStatus::Stopped.is_active());
        assert!(!SandboxStatus::Error.is_active());
        assert!(!SandboxStatus::Expired.is_active());
    }

    #[test]
    fn port_mapping_bounds() {
        assert!(PortMapping {
            container: 80,
            host: 48080
        }
        .is_valid());
        assert!(!PortMapping {
            container: 80,
            host: 80
        }
        .is_valid());
    }
}
