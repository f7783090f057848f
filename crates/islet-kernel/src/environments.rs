//! Environment service: immutable, versioned container templates.
//!
//! `update` never rewrites an existing version; it appends `current + 1`
//! under the environment row lock and flips the current pointer. The
//! encrypted-secrets map is the single exception: `set_secret` and
//! `delete_secret` rewrite it on the current version in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use islet_db::{
    Database, EnvironmentRecord, EnvironmentVersionRecord, NewAuditEntry, NewEnvironment,
    NewEnvironmentVersion, PortMapping, StoreError,
};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::validate;
use crate::vault::SecretsVault;
use crate::KernelError;

/// Caller-supplied configuration for a new environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSpec {
    pub name: String,
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub build_files: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
    pub cpu: Option<f64>,
    pub memory_mb: Option<i64>,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<String>,
}

/// Partial update; `None` fields carry over from the current version.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentPatch {
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub build_files: Option<BTreeMap<String, String>>,
    pub command: Option<Vec<String>>,
    pub cpu: Option<f64>,
    pub memory_mb: Option<i64>,
    pub ports: Option<Vec<PortMapping>>,
    pub env: Option<BTreeMap<String, String>>,
    pub mounts: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct EnvironmentService {
    db: Database,
    vault: Arc<SecretsVault>,
    max_environments: i64,
}

impl EnvironmentService {
    pub fn new(db: Database, vault: Arc<SecretsVault>, max_environments: i64) -> Self {
        Self {
            db,
            vault,
            max_environments,
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create(
        &self,
        user_id: Uuid,
        spec: EnvironmentSpec,
    ) -> Result<(EnvironmentRecord, EnvironmentVersionRecord), KernelError> {
        validate::resource_name(&spec.name)?;
        validate_image_source(spec.image.as_deref(), spec.dockerfile.as_deref())?;
        let cpu = spec.cpu.unwrap_or(validate::CPU_DEFAULT);
        validate::cpu(cpu)?;
        let memory_mb = spec.memory_mb.unwrap_or(validate::MEMORY_MB_DEFAULT);
        validate::memory_mb(memory_mb)?;
        validate::ports(&spec.ports)?;

        let count = self.db.count_environments(user_id).await?;
        if count >= self.max_environments {
            return Err(KernelError::QuotaExceeded(format!(
                "at most {} environments per user",
                self.max_environments
            )));
        }

        let name = spec.name.trim().to_string();
        let (env, version) = self
            .db
            .create_environment(
                NewEnvironment {
                    user_id,
                    name: &name,
                },
                NewEnvironmentVersion {
                    image: spec.image,
                    dockerfile: spec.dockerfile,
                    build_files: spec.build_files,
                    command: spec.command,
                    cpu,
                    memory_mb,
                    ports: spec.ports,
                    env: spec.env,
                    secrets_encrypted: BTreeMap::new(),
                    mounts: spec.mounts,
                },
            )
            .await
            .map_err(duplicate_to_conflict)?;

        info!(environment_id = %env.id, "environment created");
        self.audit(
            user_id,
            "environment.created",
            "environment",
            env.id,
            json!({ "name": env.name, "version": version.version }),
        )
        .await;
        Ok((env, version))
    }

    /// Appends version `current + 1` carrying over unspecified fields and the
    /// existing encrypted secrets, then flips the current pointer.
    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
        patch: EnvironmentPatch,
    ) -> Result<(EnvironmentRecord, EnvironmentVersionRecord), KernelError> {
        if patch.image.is_some() && patch.dockerfile.is_some() {
            return Err(KernelError::Validation(
                "exactly one of image or dockerfile may be set".to_string(),
            ));
        }
        if let Some(image) = patch.image.as_deref() {
            validate::image_name(image)?;
        }
        if let Some(cpu) = patch.cpu {
            validate::cpu(cpu)?;
        }
        if let Some(memory) = patch.memory_mb {
            validate::memory_mb(memory)?;
        }
        if let Some(ports) = patch.ports.as_deref() {
            validate::ports(ports)?;
        }

        self.db
            .fetch_environment(user_id, environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;

        let version = self
            .db
            .append_environment_version(environment_id, move |current| {
                merge_patch(current, patch)
            })
            .await?
            .ok_or(KernelError::NotFound("environment"))?;

        let env = self
            .db
            .fetch_environment(user_id, environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;

        info!(environment_id = %environment_id, version = version.version, "environment version appended");
        self.audit(
            user_id,
            "environment.updated",
            "environment",
            environment_id,
            json!({ "version": version.version }),
        )
        .await;
        Ok((env, version))
    }

    pub async fn get(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
    ) -> Result<(EnvironmentRecord, Option<EnvironmentVersionRecord>), KernelError> {
        let env = self
            .db
            .fetch_environment(user_id, environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;
        let version = match env.current_version_id {
            Some(id) => self.db.fetch_environment_version(id).await?,
            None => None,
        };
        Ok((env, version))
    }

    pub async fn list(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(EnvironmentRecord, Option<EnvironmentVersionRecord>)>, KernelError> {
        let envs = self.db.list_environments(user_id).await?;
        let mut out = Vec::with_capacity(envs.len());
        for env in envs {
            let version = match env.current_version_id {
                Some(id) => self.db.fetch_environment_version(id).await?,
                None => None,
            };
            out.push((env, version));
        }
        Ok(out)
    }

    /// Removes the environment rows. Live sandboxes must have been destroyed
    /// by the caller first (the kernel cascade does this).
    pub(crate) async fn delete_rows(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
    ) -> Result<bool, KernelError> {
        let existed = self.db.delete_environment(user_id, environment_id).await?;
        if existed {
            info!(environment_id = %environment_id, "environment deleted");
            self.audit(
                user_id,
                "environment.deleted",
                "environment",
                environment_id,
                json!({}),
            )
            .await;
        }
        Ok(existed)
    }

    /// Encrypts and stores a secret on the current version. The rewrite
    /// happens under the environment row lock, so concurrent secret
    /// mutations serialize.
    #[instrument(skip(self, value))]
    pub async fn set_secret(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), KernelError> {
        validate::secret_key(key)?;

        // Tenant scope first; the locked mutation below is unscoped.
        self.db
            .fetch_environment(user_id, environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;

        let sealed = self.vault.encrypt(value)?;
        let owned_key = key.to_string();
        self.db
            .mutate_version_secrets(environment_id, move |secrets| {
                secrets.insert(owned_key, sealed);
                true
            })
            .await?
            .ok_or(KernelError::NotFound("environment version"))?;

        self.audit(
            user_id,
            "environment.secret_set",
            "environment",
            environment_id,
            json!({ "key": key }),
        )
        .await;
        Ok(())
    }

    /// Removes a secret from the current version. Returns whether it existed.
    pub async fn delete_secret(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
        key: &str,
    ) -> Result<bool, KernelError> {
        self.db
            .fetch_environment(user_id, environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;

        let existed = self
            .db
            .mutate_version_secrets(environment_id, |secrets| secrets.remove(key).is_some())
            .await?
            .ok_or(KernelError::NotFound("environment version"))?;

        if existed {
            self.audit(
                user_id,
                "environment.secret_deleted",
                "environment",
                environment_id,
                json!({ "key": key }),
            )
            .await;
        }
        Ok(existed)
    }

    async fn audit(
        &self,
        user_id: Uuid,
        action: &str,
        resource_type: &str,
        resource_id: Uuid,
        metadata: serde_json::Value,
    ) {
        let entry = NewAuditEntry {
            user_id,
            action,
            resource_type,
            resource_id: resource_id.to_string(),
            metadata,
            client_ip: None,
            client_agent: None,
        };
        if let Err(err) = self.db.record_audit_entry(entry).await {
            warn!(action, error = %err, "failed to record audit entry");
        }
    }
}

fn validate_image_source(
    image: Option<&str>,
    dockerfile: Option<&str>,
) -> Result<(), KernelError> {
    match (image, dockerfile) {
        (Some(image), None) => validate::image_name(image),
        (None, Some(dockerfile)) if !dockerfile.trim().is_empty() => Ok(()),
        _ => Err(KernelError::Validation(
            "exactly one of image or dockerfile must be set".to_string(),
        )),
    }
}

fn merge_patch(
    current: &EnvironmentVersionRecord,
    patch: EnvironmentPatch,
) -> NewEnvironmentVersion {
    // A new image clears a carried dockerfile and vice versa; otherwise both
    // carry over (and the pair invariant already held on `current`).
    let (image, dockerfile) = match (patch.image, patch.dockerfile) {
        (Some(image), _) => (Some(image), None),
        (None, Some(dockerfile)) => (None, Some(dockerfile)),
        (None, None) => (current.image.clone(), current.dockerfile.clone()),
    };

    NewEnvironmentVersion {
        image,
        dockerfile,
        build_files: patch
            .build_files
            .unwrap_or_else(|| current.build_files.clone()),
        command: patch.command.or_else(|| current.command.clone()),
        cpu: patch.cpu.unwrap_or(current.cpu),
        memory_mb: patch.memory_mb.unwrap_or(current.memory_mb),
        ports: patch.ports.unwrap_or_else(|| current.ports.clone()),
        env: patch.env.unwrap_or_else(|| current.env.clone()),
        // Secret changes never mint versions; the map rides along.
        secrets_encrypted: current.secrets_encrypted.clone(),
        mounts: patch.mounts.unwrap_or_else(|| current.mounts.clone()),
    }
}

fn duplicate_to_conflict(err: StoreError) -> KernelError {
    match err {
        StoreError::Duplicate { entity, detail } => {
            KernelError::Conflict(format!("{entity} {detail} already exists"))
        }
        other => KernelError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn version_record(env: BTreeMap<String, String>) -> EnvironmentVersionRecord {
        EnvironmentVersionRecord {
            id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            version: 3,
            image: Some("nginx:alpine".into()),
            dockerfile: None,
            build_files: BTreeMap::new(),
            command: Some(vec!["nginx".into(), "-g".into(), "daemon off;".into()]),
            cpu: 1.0,
            memory_mb: 256,
            ports: vec![PortMapping {
                container: 80,
                host: 48080,
            }],
            env,
            secrets_encrypted: BTreeMap::from([("API_KEY".to_string(), "sealed".to_string())]),
            mounts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn merge_carries_over_unspecified_fields() {
        let current = version_record(BTreeMap::from([("A".into(), "1".into())]));
        let next = merge_patch(
            &current,
            EnvironmentPatch {
                memory_mb: Some(512),
                ..Default::default()
            },
        );

        assert_eq!(next.image.as_deref(), Some("nginx:alpine"));
        assert_eq!(next.memory_mb, 512);
        assert_eq!(next.cpu, 1.0);
        assert_eq!(next.ports, current.ports);
        assert_eq!(next.env, current.env);
        // Encrypted secrets always ride along to the next version.
        assert_eq!(next.secrets_encrypted, current.secrets_encrypted);
    }

    #[test]
    fn merge_switching_to_dockerfile_clears_image() {
        let current = version_record(BTreeMap::new());
        let next = merge_patch(
            &current,
            EnvironmentPatch {
                dockerfile: Some("FROM alpine".into()),
                ..Default::default()
            },
        );
        assert!(next.image.is_none());
        assert_eq!(next.dockerfile.as_deref(), Some("FROM alpine"));
    }

    #[test]
    fn image_source_requires_exactly_one() {
        assert!(validate_image_source(Some("nginx:alpine"), None).is_ok());
        assert!(validate_image_source(None, Some("FROM alpine")).is_ok());
        assert!(validate_image_source(None, None).is_err());
        assert!(validate_image_source(Some("a"), Some("FROM alpine")).is_err());
        assert!(validate_image_source(None, Some("   ")).is_err());
    }
}
