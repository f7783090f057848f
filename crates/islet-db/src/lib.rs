//! Persistence layer for the Islet sandbox platform.
//!
//! Offers an async API over SQLite (development, tests) and Postgres
//! (production) through the sqlx Any driver. All identifiers are stored as
//! UUID text, timestamps as fixed-width RFC3339 text so that lexicographic
//! and chronological ordering coincide, and structured columns as JSON text.

mod types;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Once;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

pub use types::{
    ApiKeyRecord, AuditEntryRecord, AuditFilter, EnvironmentRecord, EnvironmentVersionRecord,
    LogStream, NewApiKey, NewAuditEntry, NewEnvironment, NewEnvironmentVersion, NewSandbox,
    NewSandboxLog, NewUser, PortMapping, SandboxFilter, SandboxLogRecord, SandboxPhase,
    SandboxRecord, SandboxStatus, StoreError, UserRecord,
};

/// Per-sandbox log retention: only the newest N entries are kept.
pub const SANDBOX_LOG_KEEP: i64 = 10_000;

/// Supported database backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Primary entry point to the persistence layer. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    driver: DatabaseDriver,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl Database {
    /// Connects to the database at `url` (`sqlite://…` or `postgres://…`),
    /// sizes the pool, and runs the embedded migrations idempotently.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if url.contains(":memory:") => 1,
            _ => max_connections.max(1),
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, driver })
    }

    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    /// Closes the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Cheap readiness probe for health endpoints.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // Queries are written with `?` placeholders; Postgres requires `$n`.
    fn stmt(&self, sql: &'static str) -> Cow<'static, str> {
        match self.driver {
            DatabaseDriver::Sqlite => Cow::Borrowed(sql),
            DatabaseDriver::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0u32;
                for ch in sql.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Inserts a user. The email is case-folded before storage; a duplicate
    /// email surfaces as [`StoreError::Duplicate`].
    pub async fn create_user(&self, data: NewUser<'_>) -> Result<UserRecord> {
        let id = Uuid::new_v4();
        let email = data.email.trim().to_lowercase();
        let now = Utc::now();
        sqlx::query(&self.stmt(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        ))
        .bind(encode_uuid(id))
        .bind(&email)
        .bind(data.password_hash)
        .bind(encode_datetime(now))
        .execute(&self.pool)
        .await
        .map_err(|err| duplicate_or_db(err, "user", &email))?;

        Ok(UserRecord {
            id,
            email,
            password_hash: data.password_hash.to_string(),
            created_at: now,
        })
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let email = email.trim().to_lowercase();
        let row = sqlx::query(&self.stmt("SELECT * FROM users WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query(&self.stmt("SELECT * FROM users WHERE id = ?"))
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    pub async fn insert_api_key(&self, data: NewApiKey<'_>) -> Result<ApiKeyRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(&self.stmt(
            "INSERT INTO api_keys (id, user_id, key_prefix, secret_hash, name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(data.user_id))
        .bind(data.key_prefix)
        .bind(data.secret_hash)
        .bind(data.name)
        .bind(encode_datetime(now))
        .execute(&self.pool)
        .await?;

        Ok(ApiKeyRecord {
            id,
            user_id: data.user_id,
            key_prefix: data.key_prefix.to_string(),
            secret_hash: data.secret_hash.to_string(),
            name: data.name.to_string(),
            created_at: now,
            last_used_at: None,
            revoked_at: None,
        })
    }

    pub async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM api_keys WHERE user_id = ? ORDER BY created_at DESC",
        ))
        .bind(encode_uuid(user_id))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_api_key).collect()
    }

    /// Candidate keys for a bearer token, selected by prefix. Revoked keys
    /// are excluded; the caller performs the constant-time digest compare.
    pub async fn find_api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKeyRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM api_keys WHERE key_prefix = ? AND revoked_at IS NULL",
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_api_key).collect()
    }

    pub async fn touch_api_key_usage(&self, id: Uuid, timestamp: DateTime<Utc>) -> Result<()> {
        sqlx::query(&self.stmt("UPDATE api_keys SET last_used_at = ? WHERE id = ?"))
            .bind(encode_datetime(timestamp))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks a key revoked. Returns false if the key does not exist or is
    /// owned by someone else.
    pub async fn revoke_api_key(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query(&self.stmt(
            "UPDATE api_keys SET revoked_at = ? WHERE id = ? AND user_id = ? AND revoked_at IS NULL",
        ))
        .bind(encode_datetime(Utc::now()))
        .bind(encode_uuid(id))
        .bind(encode_uuid(user_id))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    /// Creates an environment together with its version 1 and the current
    /// pointer, in one transaction.
    pub async fn create_environment(
        &self,
        data: NewEnvironment<'_>,
        version: NewEnvironmentVersion,
    ) -> Result<(EnvironmentRecord, EnvironmentVersionRecord)> {
        let env_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&self.stmt(
            "INSERT INTO environments (id, user_id, name, current_version_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(encode_uuid(env_id))
        .bind(encode_uuid(data.user_id))
        .bind(data.name)
        .bind(encode_uuid(version_id))
        .bind(encode_datetime(now))
        .bind(encode_datetime(now))
        .execute(&mut *tx)
        .await
        .map_err(|err| duplicate_or_db(err, "environment", data.name))?;

        let record = insert_version_row(
            &mut tx,
            self,
            version_id,
            env_id,
            1,
            &version,
            now,
        )
        .await?;

        tx.commit().await?;

        Ok((
            EnvironmentRecord {
                id: env_id,
                user_id: data.user_id,
                name: data.name.to_string(),
                current_version_id: Some(version_id),
                created_at: now,
                updated_at: now,
            },
            record,
        ))
    }

    pub async fn fetch_environment(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<EnvironmentRecord>> {
        let row = sqlx::query(&self.stmt(
            "SELECT * FROM environments WHERE id = ? AND user_id = ?",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(user_id))
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_environment).transpose()
    }

    pub async fn list_environments(&self, user_id: Uuid) -> Result<Vec<EnvironmentRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM environments WHERE user_id = ? ORDER BY created_at DESC",
        ))
        .bind(encode_uuid(user_id))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_environment).collect()
    }

    pub async fn count_environments(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query(&self.stmt(
            "SELECT COUNT(*) AS n FROM environments WHERE user_id = ?",
        ))
        .bind(encode_uuid(user_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Removes an environment and everything hanging off it. The caller is
    /// responsible for destroying live containers first.
    pub async fn delete_environment(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let owned = sqlx::query(&self.stmt(
            "SELECT id FROM environments WHERE id = ? AND user_id = ?",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(user_id))
        .fetch_optional(&mut *tx)
        .await?
        .is_some();

        if !owned {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(&self.stmt(
            "DELETE FROM sandbox_logs WHERE sandbox_id IN \
             (SELECT id FROM sandboxes WHERE environment_id = ?)",
        ))
        .bind(encode_uuid(id))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&self.stmt("DELETE FROM sandboxes WHERE environment_id = ?"))
            .bind(encode_uuid(id))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.stmt(
            "DELETE FROM environment_versions WHERE environment_id = ?",
        ))
        .bind(encode_uuid(id))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&self.stmt("DELETE FROM environments WHERE id = ?"))
            .bind(encode_uuid(id))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Environment versions
    // ------------------------------------------------------------------

    /// Appends a new immutable version under a row lock on the environment
    /// and flips `current_version_id`. The `build` closure receives the
    /// current version and returns the field set for the next one; the store
    /// assigns `current.version + 1`. Returns `None` when the environment is
    /// gone.
    pub async fn append_environment_version<F>(
        &self,
        environment_id: Uuid,
        build: F,
    ) -> Result<Option<EnvironmentVersionRecord>>
    where
        F: FnOnce(&EnvironmentVersionRecord) -> NewEnvironmentVersion + Send,
    {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent appends on the environment row.
        let select_env = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM environments WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM environments WHERE id = $1 FOR UPDATE",
        };
        let Some(env_row) = sqlx::query(select_env)
            .bind(encode_uuid(environment_id))
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let env = map_environment(env_row)?;

        let Some(current_id) = env.current_version_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let current_row = sqlx::query(&self.stmt(
            "SELECT * FROM environment_versions WHERE id = ?",
        ))
        .bind(encode_uuid(current_id))
        .fetch_one(&mut *tx)
        .await?;
        let current = map_environment_version(current_row)?;

        let next = build(&current);
        let version_id = Uuid::new_v4();
        let now = Utc::now();
        let record = insert_version_row(
            &mut tx,
            self,
            version_id,
            environment_id,
            current.version + 1,
            &next,
            now,
        )
        .await?;

        sqlx::query(&self.stmt(
            "UPDATE environments SET current_version_id = ?, updated_at = ? WHERE id = ?",
        ))
        .bind(encode_uuid(version_id))
        .bind(encode_datetime(now))
        .bind(encode_uuid(environment_id))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    pub async fn fetch_environment_version(
        &self,
        id: Uuid,
    ) -> Result<Option<EnvironmentVersionRecord>> {
        let row = sqlx::query(&self.stmt("SELECT * FROM environment_versions WHERE id = ?"))
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_environment_version).transpose()
    }

    pub async fn list_environment_versions(
        &self,
        environment_id: Uuid,
    ) -> Result<Vec<EnvironmentVersionRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM environment_versions WHERE environment_id = ? ORDER BY version ASC",
        ))
        .bind(encode_uuid(environment_id))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_environment_version).collect()
    }

    /// Rewrites the encrypted-secrets map of the environment's current
    /// version under the same row lock the version-append path takes, so
    /// concurrent secret mutations serialize instead of losing updates.
    /// Every other version column is immutable once written. The `mutate`
    /// closure reports whether it changed the map; returns `None` when the
    /// environment (or its current version) is gone.
    pub async fn mutate_version_secrets<F>(
        &self,
        environment_id: Uuid,
        mutate: F,
    ) -> Result<Option<bool>>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool + Send,
    {
        let mut tx = self.pool.begin().await?;

        let select_env = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM environments WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM environments WHERE id = $1 FOR UPDATE",
        };
        let Some(env_row) = sqlx::query(select_env)
            .bind(encode_uuid(environment_id))
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let env = map_environment(env_row)?;

        let Some(current_id) = env.current_version_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let version_row = sqlx::query(&self.stmt(
            "SELECT * FROM environment_versions WHERE id = ?",
        ))
        .bind(encode_uuid(current_id))
        .fetch_one(&mut *tx)
        .await?;
        let version = map_environment_version(version_row)?;

        let mut secrets = version.secrets_encrypted;
        let changed = mutate(&mut secrets);
        if changed {
            sqlx::query(&self.stmt(
                "UPDATE environment_versions SET secrets_encrypted = ? WHERE id = ?",
            ))
            .bind(encode_json(&secrets)?)
            .bind(encode_uuid(current_id))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(changed))
    }

    // ------------------------------------------------------------------
    // Sandboxes
    // ------------------------------------------------------------------

    /// Inserts a sandbox in its initial `pending/creating` state. A clash on
    /// the `(user, environment, name)` idempotency key surfaces as
    /// [`StoreError::Duplicate`].
    pub async fn insert_sandbox(&self, data: NewSandbox<'_>) -> Result<SandboxRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(&self.stmt(
            "INSERT INTO sandboxes (id, user_id, environment_id, environment_version_id, name, \
             status, phase, ports, provision_progress, provision_status, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, '', ?, ?)",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(data.user_id))
        .bind(encode_uuid(data.environment_id))
        .bind(encode_uuid(data.environment_version_id))
        .bind(data.name)
        .bind(SandboxStatus::Pending.as_str())
        .bind(SandboxPhase::Creating.as_str())
        .bind(encode_json(&data.ports)?)
        .bind(encode_datetime(now))
        .bind(data.expires_at.map(encode_datetime))
        .execute(&self.pool)
        .await
        .map_err(|err| duplicate_or_db(err, "sandbox", data.name))?;

        Ok(SandboxRecord {
            id,
            user_id: data.user_id,
            environment_id: data.environment_id,
            environment_version_id: data.environment_version_id,
            name: data.name.to_string(),
            container_ref: None,
            status: SandboxStatus::Pending,
            phase: SandboxPhase::Creating,
            ports: data.ports,
            provision_progress: 0,
            provision_status: String::new(),
            created_at: now,
            started_at: None,
            stopped_at: None,
            expires_at: data.expires_at,
        })
    }

    pub async fn fetch_sandbox(&self, user_id: Uuid, id: Uuid) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query(&self.stmt(
            "SELECT * FROM sandboxes WHERE id = ? AND user_id = ?",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(user_id))
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_sandbox).transpose()
    }

    /// Tenant-unscoped fetch for internal tasks (provisioner, sweeper, hub).
    pub async fn fetch_sandbox_any(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query(&self.stmt("SELECT * FROM sandboxes WHERE id = ?"))
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_sandbox).transpose()
    }

    /// Looks up a sandbox by its idempotency key.
    pub async fn find_sandbox_by_name(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
        name: &str,
    ) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query(&self.stmt(
            "SELECT * FROM sandboxes WHERE user_id = ? AND environment_id = ? AND name = ?",
        ))
        .bind(encode_uuid(user_id))
        .bind(encode_uuid(environment_id))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_sandbox).transpose()
    }

    pub async fn list_sandboxes(
        &self,
        user_id: Uuid,
        filter: &SandboxFilter,
    ) -> Result<Vec<SandboxRecord>> {
        let rows = match (filter.status, filter.environment_id) {
            (Some(status), Some(env)) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM sandboxes WHERE user_id = ? AND status = ? \
                     AND environment_id = ? ORDER BY created_at DESC",
                ))
                .bind(encode_uuid(user_id))
                .bind(status.as_str())
                .bind(encode_uuid(env))
                .fetch_all(&self.pool)
                .await?
            }
            (Some(status), None) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM sandboxes WHERE user_id = ? AND status = ? \
                     ORDER BY created_at DESC",
                ))
                .bind(encode_uuid(user_id))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(env)) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM sandboxes WHERE user_id = ? AND environment_id = ? \
                     ORDER BY created_at DESC",
                ))
                .bind(encode_uuid(user_id))
                .bind(encode_uuid(env))
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM sandboxes WHERE user_id = ? ORDER BY created_at DESC",
                ))
                .bind(encode_uuid(user_id))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(map_sandbox).collect()
    }

    /// Sandboxes counting against the per-user quota (not stopped, expired
    /// or errored).
    pub async fn count_active_sandboxes(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query(&self.stmt(
            "SELECT COUNT(*) AS n FROM sandboxes WHERE user_id = ? \
             AND status NOT IN ('stopped', 'expired', 'error')",
        ))
        .bind(encode_uuid(user_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Sets status and phase. Lifecycle legality is enforced by the kernel
    /// before this is called; the guard on the previous status makes
    /// concurrent writers converge instead of clobbering each other.
    pub async fn update_sandbox_state(
        &self,
        id: Uuid,
        from: SandboxStatus,
        status: SandboxStatus,
        phase: SandboxPhase,
    ) -> Result<bool> {
        let result = sqlx::query(&self.stmt(
            "UPDATE sandboxes SET status = ?, phase = ? WHERE id = ? AND status = ?",
        ))
        .bind(status.as_str())
        .bind(phase.as_str())
        .bind(encode_uuid(id))
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition into `running/healthy`: stamps `started_at`, clears
    /// `stopped_at`.
    pub async fn mark_sandbox_running(&self, id: Uuid) -> Result<()> {
        sqlx::query(&self.stmt(
            "UPDATE sandboxes SET status = 'running', phase = 'healthy', \
             started_at = ?, stopped_at = NULL WHERE id = ?",
        ))
        .bind(encode_datetime(Utc::now()))
        .bind(encode_uuid(id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition into a stopped-like state (`stopped` or `expired`),
    /// stamping `stopped_at`.
    pub async fn mark_sandbox_stopped(&self, id: Uuid, status: SandboxStatus) -> Result<()> {
        sqlx::query(&self.stmt(
            "UPDATE sandboxes SET status = ?, phase = 'stopped', stopped_at = ? WHERE id = ?",
        ))
        .bind(status.as_str())
        .bind(encode_datetime(Utc::now()))
        .bind(encode_uuid(id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_sandbox_failed(&self, id: Uuid, detail: &str) -> Result<()> {
        sqlx::query(&self.stmt(
            "UPDATE sandboxes SET status = 'error', phase = 'failed', provision_status = ? \
             WHERE id = ?",
        ))
        .bind(detail)
        .bind(encode_uuid(id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_sandbox_container_ref(
        &self,
        id: Uuid,
        container_ref: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&self.stmt("UPDATE sandboxes SET container_ref = ? WHERE id = ?"))
            .bind(container_ref)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_sandbox_provision(
        &self,
        id: Uuid,
        progress: u8,
        status_text: &str,
    ) -> Result<()> {
        sqlx::query(&self.stmt(
            "UPDATE sandboxes SET provision_progress = ?, provision_status = ? WHERE id = ?",
        ))
        .bind(progress.min(100) as i64)
        .bind(status_text)
        .bind(encode_uuid(id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hard-deletes a sandbox row and its logs. Returns whether a row owned
    /// by the user existed; concurrent destroys deduplicate here.
    pub async fn delete_sandbox(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.stmt("DELETE FROM sandbox_logs WHERE sandbox_id = ?"))
            .bind(encode_uuid(id))
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&self.stmt(
            "DELETE FROM sandboxes WHERE id = ? AND user_id = ?",
        ))
        .bind(encode_uuid(id))
        .bind(encode_uuid(user_id))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fleet-wide sandbox count, for the metrics exposition.
    pub async fn count_sandboxes_total(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sandboxes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Fleet-wide count of sandboxes in one status, for the metrics
    /// exposition.
    pub async fn count_sandboxes_with_status(&self, status: SandboxStatus) -> Result<i64> {
        let row = sqlx::query(&self.stmt(
            "SELECT COUNT(*) AS n FROM sandboxes WHERE status = ?",
        ))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Sandboxes whose TTL has elapsed and which are still live.
    pub async fn list_expired_sandboxes(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM sandboxes WHERE expires_at IS NOT NULL AND expires_at < ? \
             AND status NOT IN ('expired', 'stopped', 'error')",
        ))
        .bind(encode_datetime(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_sandbox).collect()
    }

    /// Sandboxes belonging to an environment, for cascade destruction.
    pub async fn list_environment_sandboxes(
        &self,
        environment_id: Uuid,
    ) -> Result<Vec<SandboxRecord>> {
        let rows = sqlx::query(&self.stmt("SELECT * FROM sandboxes WHERE environment_id = ?"))
            .bind(encode_uuid(environment_id))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(map_sandbox).collect()
    }

    // ------------------------------------------------------------------
    // Sandbox logs
    // ------------------------------------------------------------------

    pub async fn append_sandbox_log(&self, data: NewSandboxLog<'_>) -> Result<()> {
        sqlx::query(&self.stmt(
            "INSERT INTO sandbox_logs (id, sandbox_id, stream, text, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        ))
        .bind(encode_uuid(Uuid::new_v4()))
        .bind(encode_uuid(data.sandbox_id))
        .bind(data.stream.as_str())
        .bind(data.text)
        .bind(encode_datetime(data.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent `tail` entries in chronological order.
    pub async fn list_sandbox_logs(
        &self,
        sandbox_id: Uuid,
        tail: u32,
    ) -> Result<Vec<SandboxLogRecord>> {
        let rows = sqlx::query(&self.stmt(
            "SELECT * FROM sandbox_logs WHERE sandbox_id = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        ))
        .bind(encode_uuid(sandbox_id))
        .bind(tail as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = rows
            .into_iter()
            .map(map_sandbox_log)
            .collect::<Result<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    /// Enforces the newest-N retention bound for one sandbox.
    pub async fn trim_sandbox_logs(&self, sandbox_id: Uuid, keep: i64) -> Result<u64> {
        let result = sqlx::query(&self.stmt(
            "DELETE FROM sandbox_logs WHERE sandbox_id = ? AND id NOT IN \
             (SELECT id FROM sandbox_logs WHERE sandbox_id = ? \
              ORDER BY timestamp DESC, id DESC LIMIT ?)",
        ))
        .bind(encode_uuid(sandbox_id))
        .bind(encode_uuid(sandbox_id))
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Global retention: drops log entries older than the cutoff.
    pub async fn purge_sandbox_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&self.stmt("DELETE FROM sandbox_logs WHERE timestamp < ?"))
            .bind(encode_datetime(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub async fn record_audit_entry(&self, data: NewAuditEntry<'_>) -> Result<()> {
        sqlx::query(&self.stmt(
            "INSERT INTO audit_logs (id, user_id, action, resource_type, resource_id, \
             metadata, client_ip, client_agent, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        ))
        .bind(encode_uuid(Uuid::new_v4()))
        .bind(encode_uuid(data.user_id))
        .bind(data.action)
        .bind(data.resource_type)
        .bind(&data.resource_id)
        .bind(data.metadata.to_string())
        .bind(data.client_ip)
        .bind(data.client_agent)
        .bind(encode_datetime(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit_entries(
        &self,
        user_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditEntryRecord>> {
        let limit = filter.limit.unwrap_or(50).min(500) as i64;
        let rows = match (&filter.action, &filter.resource_type) {
            (Some(action), Some(rtype)) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM audit_logs WHERE user_id = ? AND action = ? \
                     AND resource_type = ? ORDER BY created_at DESC LIMIT ?",
                ))
                .bind(encode_uuid(user_id))
                .bind(action)
                .bind(rtype)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(action), None) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM audit_logs WHERE user_id = ? AND action = ? \
                     ORDER BY created_at DESC LIMIT ?",
                ))
                .bind(encode_uuid(user_id))
                .bind(action)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(rtype)) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM audit_logs WHERE user_id = ? AND resource_type = ? \
                     ORDER BY created_at DESC LIMIT ?",
                ))
                .bind(encode_uuid(user_id))
                .bind(rtype)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(&self.stmt(
                    "SELECT * FROM audit_logs WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
                ))
                .bind(encode_uuid(user_id))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(map_audit_entry).collect()
    }

    pub async fn purge_audit_entries_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&self.stmt("DELETE FROM audit_logs WHERE created_at < ?"))
            .bind(encode_datetime(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_version_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    db: &Database,
    id: Uuid,
    environment_id: Uuid,
    version: i64,
    data: &NewEnvironmentVersion,
    now: DateTime<Utc>,
) -> Result<EnvironmentVersionRecord> {
    sqlx::query(&db.stmt(
        "INSERT INTO environment_versions (id, environment_id, version, image, dockerfile, \
         build_files, command, cpu, memory_mb, ports, env, secrets_encrypted, mounts, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    ))
    .bind(encode_uuid(id))
    .bind(encode_uuid(environment_id))
    .bind(version)
    .bind(data.image.as_deref())
    .bind(data.dockerfile.as_deref())
    .bind(encode_json(&data.build_files)?)
    .bind(data.command.as_ref().map(encode_json).transpose()?)
    .bind(data.cpu)
    .bind(data.memory_mb)
    .bind(encode_json(&data.ports)?)
    .bind(encode_json(&data.env)?)
    .bind(encode_json(&data.secrets_encrypted)?)
    .bind(encode_json(&data.mounts)?)
    .bind(encode_datetime(now))
    .execute(&mut **tx)
    .await
    .map_err(|err| duplicate_or_db(err, "environment version", &version.to_string()))?;

    Ok(EnvironmentVersionRecord {
        id,
        environment_id,
        version,
        image: data.image.clone(),
        dockerfile: data.dockerfile.clone(),
        build_files: data.build_files.clone(),
        command: data.command.clone(),
        cpu: data.cpu,
        memory_mb: data.memory_mb,
        ports: data.ports.clone(),
        env: data.env.clone(),
        secrets_encrypted: data.secrets_encrypted.clone(),
        mounts: data.mounts.clone(),
        created_at: now,
    })
}

// ----------------------------------------------------------------------
// Encoding / row mapping
// ----------------------------------------------------------------------

fn encode_uuid(id: Uuid) -> String {
    id.to_string()
}

/// Fixed-width RFC3339 (microseconds, `Z` suffix) so text comparison in SQL
/// matches chronological order.
fn encode_datetime(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
        table: "json",
        detail: err.to_string(),
    })
}

fn duplicate_or_db(err: sqlx::Error, entity: &'static str, detail: &str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Duplicate {
            entity,
            detail: detail.to_string(),
        }
    } else {
        StoreError::Database(err)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code()
                .map(|code| code == "2067" || code == "1555" || code == "23505")
                .unwrap_or(false)
                || db.message().to_ascii_lowercase().contains("unique")
        }
        _ => false,
    }
}

fn get_uuid(row: &AnyRow, table: &'static str, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("invalid uuid in {col}: {raw}"),
    })
}

fn get_opt_uuid(row: &AnyRow, table: &'static str, col: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|value| {
        Uuid::parse_str(&value).map_err(|_| StoreError::Corrupt {
            table,
            detail: format!("invalid uuid in {col}: {value}"),
        })
    })
    .transpose()
}

fn get_datetime(row: &AnyRow, table: &'static str, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_datetime(&raw).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("invalid timestamp in {col}: {raw}"),
    })
}

fn get_opt_datetime(
    row: &AnyRow,
    table: &'static str,
    col: &str,
) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|value| {
        parse_datetime(&value).ok_or_else(|| StoreError::Corrupt {
            table,
            detail: format!("invalid timestamp in {col}: {value}"),
        })
    })
    .transpose()
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn get_json<T: serde::de::DeserializeOwned>(
    row: &AnyRow,
    table: &'static str,
    col: &str,
) -> Result<T> {
    let raw: String = row.try_get(col)?;
    serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
        table,
        detail: format!("invalid json in {col}: {err}"),
    })
}

fn get_opt_json<T: serde::de::DeserializeOwned>(
    row: &AnyRow,
    table: &'static str,
    col: &str,
) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|value| {
        serde_json::from_str(&value).map_err(|err| StoreError::Corrupt {
            table,
            detail: format!("invalid json in {col}: {err}"),
        })
    })
    .transpose()
}

fn map_user(row: AnyRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: get_uuid(&row, "users", "id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        created_at: get_datetime(&row, "users", "created_at")?,
    })
}

fn map_api_key(row: AnyRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: get_uuid(&row, "api_keys", "id")?,
        user_id: get_uuid(&row, "api_keys", "user_id")?,
        key_prefix: row.try_get("key_prefix")?,
        secret_hash: row.try_get("secret_hash")?,
        name: row.try_get("name")?,
        created_at: get_datetime(&row, "api_keys", "created_at")?,
        last_used_at: get_opt_datetime(&row, "api_keys", "last_used_at")?,
        revoked_at: get_opt_datetime(&row, "api_keys", "revoked_at")?,
    })
}

fn map_environment(row: AnyRow) -> Result<EnvironmentRecord> {
    Ok(EnvironmentRecord {
        id: get_uuid(&row, "environments", "id")?,
        user_id: get_uuid(&row, "environments", "user_id")?,
        name: row.try_get("name")?,
        current_version_id: get_opt_uuid(&row, "environments", "current_version_id")?,
        created_at: get_datetime(&row, "environments", "created_at")?,
        updated_at: get_datetime(&row, "environments", "updated_at")?,
    })
}

fn map_environment_version(row: AnyRow) -> Result<EnvironmentVersionRecord> {
    const T: &str = "environment_versions";
    Ok(EnvironmentVersionRecord {
        id: get_uuid(&row, T, "id")?,
        environment_id: get_uuid(&row, T, "environment_id")?,
        version: row.try_get("version")?,
        image: row.try_get("image")?,
        dockerfile: row.try_get("dockerfile")?,
        build_files: get_json(&row, T, "build_files")?,
        command: get_opt_json(&row, T, "command")?,
        cpu: row.try_get("cpu")?,
        memory_mb: row.try_get("memory_mb")?,
        ports: get_json(&row, T, "ports")?,
        env: get_json(&row, T, "env")?,
        secrets_encrypted: get_json(&row, T, "secrets_encrypted")?,
        mounts: get_json(&row, T, "mounts")?,
        created_at: get_datetime(&row, T, "created_at")?,
    })
}

fn map_sandbox(row: AnyRow) -> Result<SandboxRecord> {
    const T: &str = "sandboxes";
    let status_raw: String = row.try_get("status")?;
    let status = SandboxStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
        table: T,
        detail: format!("unknown status {status_raw}"),
    })?;
    let phase_raw: String = row.try_get("phase")?;
    let phase = SandboxPhase::parse(&phase_raw).ok_or_else(|| StoreError::Corrupt {
        table: T,
        detail: format!("unknown phase {phase_raw}"),
    })?;

    Ok(SandboxRecord {
        id: get_uuid(&row, T, "id")?,
        user_id: get_uuid(&row, T, "user_id")?,
        environment_id: get_uuid(&row, T, "environment_id")?,
        environment_version_id: get_uuid(&row, T, "environment_version_id")?,
        name: row.try_get("name")?,
        container_ref: row.try_get("container_ref")?,
        status,
        phase,
        ports: get_json(&row, T, "ports")?,
        provision_progress: row.try_get::<i64, _>("provision_progress")?.clamp(0, 100) as u8,
        provision_status: row.try_get("provision_status")?,
        created_at: get_datetime(&row, T, "created_at")?,
        started_at: get_opt_datetime(&row, T, "started_at")?,
        stopped_at: get_opt_datetime(&row, T, "stopped_at")?,
        expires_at: get_opt_datetime(&row, T, "expires_at")?,
    })
}

fn map_sandbox_log(row: AnyRow) -> Result<SandboxLogRecord> {
    const T: &str = "sandbox_logs";
    let stream_raw: String = row.try_get("stream")?;
    let stream = LogStream::parse(&stream_raw).ok_or_else(|| StoreError::Corrupt {
        table: T,
        detail: format!("unknown stream {stream_raw}"),
    })?;
    Ok(SandboxLogRecord {
        id: get_uuid(&row, T, "id")?,
        sandbox_id: get_uuid(&row, T, "sandbox_id")?,
        stream,
        text: row.try_get("text")?,
        timestamp: get_datetime(&row, T, "timestamp")?,
    })
}

fn map_audit_entry(row: AnyRow) -> Result<AuditEntryRecord> {
    const T: &str = "audit_logs";
    Ok(AuditEntryRecord {
        id: get_uuid(&row, T, "id")?,
        user_id: get_uuid(&row, T, "user_id")?,
        action: row.try_get("action")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        metadata: get_json(&row, T, "metadata")?,
        client_ip: row.try_get("client_ip")?,
        client_agent: row.try_get("client_agent")?,
        created_at: get_datetime(&row, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn version_fields() -> NewEnvironmentVersion {
        NewEnvironmentVersion {
            image: Some("nginx:alpine".into()),
            dockerfile: None,
            build_files: BTreeMap::new(),
            command: None,
            cpu: 1.0,
            memory_mb: 256,
            ports: vec![PortMapping {
                container: 80,
                host: 48080,
            }],
            env: BTreeMap::new(),
            secrets_encrypted: BTreeMap::new(),
            mounts: Vec::new(),
        }
    }

    async fn seed_user(db: &Database) -> UserRecord {
        db.create_user(NewUser {
            email: "U@x.test",
            password_hash: "argon2-hash",
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn user_email_is_case_folded_and_unique() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        assert_eq!(user.email, "u@x.test");

        let err = db
            .create_user(NewUser {
                email: "u@X.TEST",
                password_hash: "other",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "user", .. }));

        let found = db.find_user_by_email("U@x.Test").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn environment_create_sets_version_one_as_current() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "nginx-demo",
                },
                version_fields(),
            )
            .await
            .unwrap();

        assert_eq!(version.version, 1);
        assert_eq!(env.current_version_id, Some(version.id));

        let reloaded = db.fetch_environment(user.id, env.id).await.unwrap().unwrap();
        assert_eq!(reloaded.current_version_id, Some(version.id));
    }

    #[tokio::test]
    async fn duplicate_environment_name_is_rejected() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        db.create_environment(
            NewEnvironment {
                user_id: user.id,
                name: "dup",
            },
            version_fields(),
        )
        .await
        .unwrap();

        let err = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "dup",
                },
                version_fields(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Duplicate {
                entity: "environment",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn append_version_is_monotone_and_leaves_prior_untouched() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, v1) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "appender",
                },
                version_fields(),
            )
            .await
            .unwrap();

        let v2 = db
            .append_environment_version(env.id, |current| {
                let mut next = version_fields();
                next.memory_mb = current.memory_mb * 2;
                next
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.memory_mb, 512);

        let env_after = db.fetch_environment(user.id, env.id).await.unwrap().unwrap();
        assert_eq!(env_after.current_version_id, Some(v2.id));

        // The prior version row is unchanged.
        let v1_after = db.fetch_environment_version(v1.id).await.unwrap().unwrap();
        assert_eq!(v1_after, v1);
    }

    #[tokio::test]
    async fn append_version_on_missing_environment_returns_none() {
        let db = test_db().await;
        let got = db
            .append_environment_version(Uuid::new_v4(), |_| version_fields())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn secret_mutations_rewrite_only_the_current_map() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "sealed",
                },
                version_fields(),
            )
            .await
            .unwrap();

        let changed = db
            .mutate_version_secrets(env.id, |secrets| {
                secrets.insert("API_KEY".to_string(), "ciphertext-a".to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(changed, Some(true));

        let reloaded = db.fetch_environment_version(version.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.secrets_encrypted.get("API_KEY").map(String::as_str),
            Some("ciphertext-a")
        );
        // Every other column of the version row is untouched.
        assert_eq!(reloaded.memory_mb, version.memory_mb);
        assert_eq!(reloaded.image, version.image);

        let removed = db
            .mutate_version_secrets(env.id, |secrets| secrets.remove("MISSING").is_some())
            .await
            .unwrap();
        assert_eq!(removed, Some(false));

        // Unknown environment reports absence instead of mutating anything.
        let gone = db
            .mutate_version_secrets(Uuid::new_v4(), |_| true)
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn sandbox_idempotency_key_is_unique() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "twin-env",
                },
                version_fields(),
            )
            .await
            .unwrap();

        let new = |name| NewSandbox {
            user_id: user.id,
            environment_id: env.id,
            environment_version_id: version.id,
            name,
            ports: Vec::new(),
            expires_at: None,
        };

        db.insert_sandbox(new("twin")).await.unwrap();
        let err = db.insert_sandbox(new("twin")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Duplicate {
                entity: "sandbox",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn active_count_skips_terminal_statuses() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "quota-env",
                },
                version_fields(),
            )
            .await
            .unwrap();

        let a = db
            .insert_sandbox(NewSandbox {
                user_id: user.id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: "a",
                ports: Vec::new(),
                expires_at: None,
            })
            .await
            .unwrap();
        db.insert_sandbox(NewSandbox {
            user_id: user.id,
            environment_id: env.id,
            environment_version_id: version.id,
            name: "b",
            ports: Vec::new(),
            expires_at: None,
        })
        .await
        .unwrap();

        assert_eq!(db.count_active_sandboxes(user.id).await.unwrap(), 2);
        db.mark_sandbox_stopped(a.id, SandboxStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(db.count_active_sandboxes(user.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn guarded_state_update_rejects_stale_writer() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "cas-env",
                },
                version_fields(),
            )
            .await
            .unwrap();
        let sandbox = db
            .insert_sandbox(NewSandbox {
                user_id: user.id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: "cas",
                ports: Vec::new(),
                expires_at: None,
            })
            .await
            .unwrap();

        // First writer advances pending → running.
        assert!(db
            .update_sandbox_state(
                sandbox.id,
                SandboxStatus::Pending,
                SandboxStatus::Running,
                SandboxPhase::Healthy,
            )
            .await
            .unwrap());
        // A stale writer still expecting the pending state loses.
        assert!(!db
            .update_sandbox_state(
                sandbox.id,
                SandboxStatus::Pending,
                SandboxStatus::Error,
                SandboxPhase::Failed,
            )
            .await
            .unwrap());
        // A writer holding the current state wins.
        assert!(db
            .update_sandbox_state(
                sandbox.id,
                SandboxStatus::Running,
                SandboxStatus::Stopped,
                SandboxPhase::Stopped,
            )
            .await
            .unwrap());

        let row = db.fetch_sandbox_any(sandbox.id).await.unwrap().unwrap();
        assert_eq!(row.status, SandboxStatus::Stopped);
        assert_eq!(row.phase, SandboxPhase::Stopped);
    }

    #[tokio::test]
    async fn log_tail_is_chronological_and_trim_keeps_newest() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "log-env",
                },
                version_fields(),
            )
            .await
            .unwrap();
        let sandbox = db
            .insert_sandbox(NewSandbox {
                user_id: user.id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: "logs",
                ports: Vec::new(),
                expires_at: None,
            })
            .await
            .unwrap();

        let base = Utc::now();
        for i in 0..10 {
            db.append_sandbox_log(NewSandboxLog {
                sandbox_id: sandbox.id,
                stream: LogStream::Stdout,
                text: &format!("line {i}"),
                timestamp: base + Duration::milliseconds(i),
            })
            .await
            .unwrap();
        }

        let tail = db.list_sandbox_logs(sandbox.id, 3).await.unwrap();
        let lines: Vec<_> = tail.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);

        let removed = db.trim_sandbox_logs(sandbox.id, 4).await.unwrap();
        assert_eq!(removed, 6);
        let rest = db.list_sandbox_logs(sandbox.id, 100).await.unwrap();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest.first().unwrap().text, "line 6");
    }

    #[tokio::test]
    async fn expired_listing_honours_status_and_deadline() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: user.id,
                    name: "ttl-env",
                },
                version_fields(),
            )
            .await
            .unwrap();

        let expired = db
            .insert_sandbox(NewSandbox {
                user_id: user.id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: "old",
                ports: Vec::new(),
                expires_at: Some(Utc::now() - Duration::seconds(30)),
            })
            .await
            .unwrap();
        db.insert_sandbox(NewSandbox {
            user_id: user.id,
            environment_id: env.id,
            environment_version_id: version.id,
            name: "fresh",
            ports: Vec::new(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
        .await
        .unwrap();

        let due = db.list_expired_sandboxes(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, expired.id);

        db.mark_sandbox_stopped(expired.id, SandboxStatus::Expired)
            .await
            .unwrap();
        assert!(db.list_expired_sandboxes(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_scoped_fetch_hides_other_users() {
        let db = test_db().await;
        let owner = seed_user(&db).await;
        let other = db
            .create_user(NewUser {
                email: "b@x.test",
                password_hash: "hash",
            })
            .await
            .unwrap();
        let (env, version) = db
            .create_environment(
                NewEnvironment {
                    user_id: owner.id,
                    name: "private",
                },
                version_fields(),
            )
            .await
            .unwrap();
        let sandbox = db
            .insert_sandbox(NewSandbox {
                user_id: owner.id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: "mine",
                ports: Vec::new(),
                expires_at: None,
            })
            .await
            .unwrap();

        assert!(db.fetch_sandbox(other.id, sandbox.id).await.unwrap().is_none());
        assert!(db.fetch_environment(other.id, env.id).await.unwrap().is_none());
        assert!(!db.delete_sandbox(other.id, sandbox.id).await.unwrap());
        assert!(db.fetch_sandbox(owner.id, sandbox.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn audit_entries_record_and_purge() {
        let db = test_db().await;
        let user = seed_user(&db).await;
        db.record_audit_entry(NewAuditEntry {
            user_id: user.id,
            action: "sandbox.created",
            resource_type: "sandbox",
            resource_id: Uuid::new_v4().to_string(),
            metadata: serde_json::json!({"name": "demo"}),
            client_ip: Some("127.0.0.1"),
            client_agent: None,
        })
        .await
        .unwrap();

        let entries = db
            .list_audit_entries(user.id, &AuditFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "sandbox.created");

        let purged = db
            .purge_audit_entries_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
