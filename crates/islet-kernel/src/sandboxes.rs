//! Sandbox lifecycle service.
//!
//! Owns the state machine, per-user quota, idempotent creation, the async
//! provisioner, log collection and fan-out, TTL sweeping, and reconciliation
//! against runtime truth. Provisioning never throws back to the API caller:
//! a failed pipeline parks the row in `error/failed` and the container (if
//! any) is left for the operator to destroy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use islet_db::{
    Database, NewAuditEntry, NewSandbox, NewSandboxLog, PortMapping, SandboxFilter, SandboxPhase,
    SandboxRecord, SandboxStatus, StoreError,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::redact::LogRedactor;
use crate::runtime::{
    ContainerMetrics, ContainerRuntime, ContainerSpec, ExecOutput, LogEvent, RuntimeError,
    SANDBOX_ID_LABEL, USER_ID_LABEL,
};
use crate::validate;
use crate::vault::SecretsVault;
use crate::KernelError;

/// Tunables for the lifecycle service.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub max_active_per_user: i64,
    /// Single budget shared by image pull, container creation, start, and
    /// the wait for the container to report running.
    pub health_wait: Duration,
    /// Grace given to user-initiated stops.
    pub stop_grace_seconds: u32,
    /// Grace given by the TTL sweeper and shutdown cleanup.
    pub sweep_grace_seconds: u32,
    /// Newest-N per-sandbox log retention.
    pub log_keep: i64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_active_per_user: 10,
            health_wait: Duration::from_secs(30),
            stop_grace_seconds: 10,
            sweep_grace_seconds: 5,
            log_keep: islet_db::SANDBOX_LOG_KEEP,
        }
    }
}

/// Request payload for creating a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CreateSandbox {
    pub environment_id: Uuid,
    /// Defaults to the environment's current version.
    pub environment_version_id: Option<Uuid>,
    /// Defaults to `{environment}-{8 hex}`.
    pub name: Option<String>,
    pub ttl_seconds: Option<i64>,
    /// Overrides the version's port mappings.
    pub ports: Option<Vec<PortMapping>>,
    /// Right-biased overrides on top of version env and secrets.
    pub env: BTreeMap<String, String>,
}

/// Request payload for replicating a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ReplicateSandbox {
    pub name: Option<String>,
    pub ports: Option<Vec<PortMapping>>,
}

/// Fan-out hub for live log events: the collector is the single reader of
/// the runtime stream, persists each event exactly once, and broadcasts it
/// to any number of WebSocket viewers.
#[derive(Clone, Default)]
pub struct LogBroker {
    inner: Arc<Mutex<HashMap<Uuid, broadcast::Sender<LogEvent>>>>,
}

impl LogBroker {
    /// Subscribes a viewer; `None` when no collector is live for the id.
    pub fn subscribe(&self, sandbox_id: Uuid) -> Option<broadcast::Receiver<LogEvent>> {
        self.inner.lock().get(&sandbox_id).map(|s| s.subscribe())
    }

    fn register(&self, sandbox_id: Uuid) -> broadcast::Sender<LogEvent> {
        self.inner
            .lock()
            .entry(sandbox_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn remove(&self, sandbox_id: Uuid) {
        self.inner.lock().remove(&sandbox_id);
    }
}

#[derive(Default)]
struct Tasks {
    provisioners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    collectors: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

pub struct SandboxService<R>
where
    R: ContainerRuntime,
{
    db: Database,
    runtime: Arc<R>,
    vault: Arc<SecretsVault>,
    redactor: Arc<LogRedactor>,
    settings: SandboxSettings,
    tasks: Arc<Tasks>,
    broker: LogBroker,
}

impl<R> Clone for SandboxService<R>
where
    R: ContainerRuntime,
{
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            runtime: self.runtime.clone(),
            vault: self.vault.clone(),
            redactor: self.redactor.clone(),
            settings: self.settings.clone(),
            tasks: self.tasks.clone(),
            broker: self.broker.clone(),
        }
    }
}

impl<R> SandboxService<R>
where
    R: ContainerRuntime,
{
    pub fn new(
        db: Database,
        runtime: Arc<R>,
        vault: Arc<SecretsVault>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            db,
            runtime,
            vault,
            redactor: Arc::new(LogRedactor::new()),
            settings,
            tasks: Arc::new(Tasks::default()),
            broker: LogBroker::default(),
        }
    }

    pub fn broker(&self) -> &LogBroker {
        &self.broker
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Creates a sandbox and enqueues its provisioner. Returns immediately
    /// with the `pending/creating` row. Repeat calls with the same
    /// `(user, environment, name)` return the existing row and spawn
    /// nothing.
    #[instrument(skip(self, req), fields(environment_id = %req.environment_id))]
    pub async fn create(
        &self,
        user_id: Uuid,
        req: CreateSandbox,
    ) -> Result<SandboxRecord, KernelError> {
        let active = self.db.count_active_sandboxes(user_id).await?;
        if active >= self.settings.max_active_per_user {
            return Err(KernelError::QuotaExceeded(format!(
                "at most {} active sandboxes per user",
                self.settings.max_active_per_user
            )));
        }

        let env = self
            .db
            .fetch_environment(user_id, req.environment_id)
            .await?
            .ok_or(KernelError::NotFound("environment"))?;
        let version_id = req
            .environment_version_id
            .or(env.current_version_id)
            .ok_or(KernelError::NotFound("environment version"))?;
        let version = self
            .db
            .fetch_environment_version(version_id)
            .await?
            .filter(|v| v.environment_id == env.id)
            .ok_or(KernelError::NotFound("environment version"))?;

        let name = match req.name {
            Some(name) => {
                validate::resource_name(&name)?;
                name.trim().to_string()
            }
            None => format!("{}-{:08x}", env.name, rand::thread_rng().gen::<u32>()),
        };

        if let Some(existing) = self
            .db
            .find_sandbox_by_name(user_id, env.id, &name)
            .await?
        {
            return Ok(existing);
        }

        let expires_at = match req.ttl_seconds {
            Some(ttl) => {
                validate::ttl_seconds(ttl)?;
                Some(Utc::now() + chrono::Duration::seconds(ttl))
            }
            None => None,
        };

        let ports = match req.ports {
            Some(ports) => {
                validate::ports(&ports)?;
                ports
            }
            None => version.ports.clone(),
        };

        let record = match self
            .db
            .insert_sandbox(NewSandbox {
                user_id,
                environment_id: env.id,
                environment_version_id: version.id,
                name: &name,
                ports,
                expires_at,
            })
            .await
        {
            Ok(record) => record,
            // Lost a concurrent race on the idempotency key: share the
            // winner's row and spawn no second provisioner.
            Err(StoreError::Duplicate { .. }) => {
                return self
                    .db
                    .find_sandbox_by_name(user_id, env.id, &name)
                    .await?
                    .ok_or(KernelError::NotFound("sandbox"));
            }
            Err(err) => return Err(err.into()),
        };

        info!(sandbox_id = %record.id, name = %record.name, "sandbox created");
        self.audit(
            user_id,
            "sandbox.created",
            record.id,
            json!({ "name": record.name, "environment_id": env.id }),
        )
        .await;

        self.spawn_provisioner(record.id, req.env);
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Provisioner
    // ------------------------------------------------------------------

    fn spawn_provisioner(&self, id: Uuid, env_overrides: BTreeMap<String, String>) {
        let mut guard = self.tasks.provisioners.lock();
        // At most one provisioner per sandbox id, ever.
        if guard.contains_key(&id) {
            return;
        }
        let svc = self.clone();
        let handle = tokio::spawn(async move {
            svc.provision(id, env_overrides).await;
            svc.tasks.provisioners.lock().remove(&id);
        });
        guard.insert(id, handle);
    }

    async fn provision(&self, id: Uuid, env_overrides: BTreeMap<String, String>) {
        let sandbox = match self.db.fetch_sandbox_any(id).await {
            Ok(Some(sandbox)) => sandbox,
            Ok(None) => return,
            Err(err) => {
                warn!(sandbox_id = %id, error = %err, "provisioner could not load sandbox");
                return;
            }
        };

        if let Err(err) = self.provision_inner(&sandbox, env_overrides).await {
            warn!(sandbox_id = %id, error = %err, "provisioning failed");
            if let Err(db_err) = self.db.mark_sandbox_failed(id, &err.to_string()).await {
                warn!(sandbox_id = %id, error = %db_err, "could not mark sandbox failed");
            }
            self.audit(
                sandbox.user_id,
                "sandbox.failed",
                id,
                json!({ "error": err.to_string() }),
            )
            .await;
        }
    }

    async fn provision_inner(
        &self,
        sandbox: &SandboxRecord,
        env_overrides: BTreeMap<String, String>,
    ) -> Result<(), KernelError> {
        let id = sandbox.id;
        let version = self
            .db
            .fetch_environment_version(sandbox.environment_version_id)
            .await?
            .ok_or(KernelError::NotFound("environment version"))?;

        let image = version.image.clone().ok_or_else(|| {
            KernelError::Validation(
                "version has no prebuilt image; dockerfile builds are not provisioned".to_string(),
            )
        })?;

        let secrets = self.vault.decrypt_map(&version.secrets_encrypted)?;

        // Progress writes are throttled to >= 5% deltas; 100% always lands.
        let last = Arc::new(AtomicU8::new(0));
        let progress_db = self.db.clone();
        let sink = {
            let last = last.clone();
            move |pct: u8, status: &str| {
                let prev = last.load(Ordering::Relaxed);
                if pct < 100 && pct < prev.saturating_add(5) {
                    return;
                }
                last.store(pct, Ordering::Relaxed);
                let db = progress_db.clone();
                let status = status.to_string();
                tokio::spawn(async move {
                    if let Err(err) = db.update_sandbox_provision(id, pct, &status).await {
                        debug!(sandbox_id = %id, error = %err, "progress write failed");
                    }
                });
            }
        };

        // Pull, create, start, and the health wait all draw from one budget.
        let budget_start = Instant::now();
        self.within_health_budget(budget_start, self.runtime.ensure_image(&image, &sink))
            .await?;

        let mut merged = version.env.clone();
        merged.extend(secrets);
        merged.extend(env_overrides);
        merged.insert("SANDBOX_ID".to_string(), id.to_string());
        let env_vec: Vec<String> = merged
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let labels = BTreeMap::from([
            (SANDBOX_ID_LABEL.to_string(), id.to_string()),
            (USER_ID_LABEL.to_string(), sandbox.user_id.to_string()),
        ]);

        let spec = ContainerSpec {
            name: format!("islet-{id}"),
            image,
            command: version.command.clone(),
            env: env_vec,
            ports: sandbox.ports.clone(),
            cpu: version.cpu,
            memory_mb: version.memory_mb,
            labels,
        };

        let container_ref = self
            .within_health_budget(budget_start, self.runtime.create_container(&spec))
            .await?;
        self.db
            .set_sandbox_container_ref(id, Some(&container_ref))
            .await?;

        // The row may have been destroyed while we were pulling; a failed
        // guard means stop here quietly.
        let advanced = self
            .db
            .update_sandbox_state(
                id,
                SandboxStatus::Pending,
                SandboxStatus::Pending,
                SandboxPhase::Starting,
            )
            .await?;
        if !advanced {
            return Ok(());
        }

        self.within_health_budget(budget_start, self.runtime.start(&container_ref))
            .await?;
        let left = self
            .settings
            .health_wait
            .checked_sub(budget_start.elapsed())
            .unwrap_or(Duration::ZERO);
        let healthy = self.runtime.wait_running(&container_ref, left).await?;
        if !healthy {
            return Err(self.health_budget_exhausted());
        }

        self.db.mark_sandbox_running(id).await?;
        sink(100, "running");
        self.spawn_collector(id, container_ref);

        info!(sandbox_id = %id, "sandbox healthy");
        self.audit(sandbox.user_id, "sandbox.started", id, json!({})).await;
        Ok(())
    }

    /// Runs a provisioning step against whatever is left of the shared
    /// health budget.
    async fn within_health_budget<T, F>(
        &self,
        budget_start: Instant,
        step: F,
    ) -> Result<T, KernelError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        let left = self
            .settings
            .health_wait
            .checked_sub(budget_start.elapsed())
            .ok_or_else(|| self.health_budget_exhausted())?;
        match tokio::time::timeout(left, step).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.health_budget_exhausted()),
        }
    }

    fn health_budget_exhausted(&self) -> KernelError {
        KernelError::Runtime(RuntimeError::Other(format!(
            "container did not reach running within the {}s provisioning budget",
            self.settings.health_wait.as_secs()
        )))
    }

    // ------------------------------------------------------------------
    // Log collector
    // ------------------------------------------------------------------

    fn spawn_collector(&self, id: Uuid, container_ref: String) {
        let mut guard = self.tasks.collectors.lock();
        if let Some(old) = guard.remove(&id) {
            old.abort();
        }
        let svc = self.clone();
        let handle = tokio::spawn(async move {
            svc.collect_logs(id, container_ref).await;
        });
        guard.insert(id, handle);
    }

    fn stop_collector(&self, id: Uuid) {
        if let Some(handle) = self.tasks.collectors.lock().remove(&id) {
            handle.abort();
        }
        self.broker.remove(id);
    }

    /// Single reader of the runtime log stream for one sandbox: redacts,
    /// persists exactly once, broadcasts to viewers, and enforces the
    /// newest-N retention bound. Ends silently with the stream.
    async fn collect_logs(&self, id: Uuid, container_ref: String) {
        let sender = self.broker.register(id);
        let mut stream = match self
            .runtime
            .stream_logs(&container_ref, Utc::now().timestamp())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                debug!(sandbox_id = %id, error = %err, "log stream unavailable");
                self.broker.remove(id);
                return;
            }
        };

        let mut appended: u64 = 0;
        while let Some(event) = stream.next().await {
            let event = LogEvent {
                text: self.redactor.redact_owned(&event.text),
                ..event
            };
            let write = self
                .db
                .append_sandbox_log(NewSandboxLog {
                    sandbox_id: id,
                    stream: event.stream,
                    text: &event.text,
                    timestamp: event.timestamp,
                })
                .await;
            if write.is_err() {
                // Row gone (destroyed); close the collector silently.
                break;
            }
            let _ = sender.send(event);
            appended += 1;
            if appended % 128 == 0 {
                let _ = self.db.trim_sandbox_logs(id, self.settings.log_keep).await;
            }
        }

        let _ = self.db.trim_sandbox_logs(id, self.settings.log_keep).await;
        self.broker.remove(id);
        self.tasks.collectors.lock().remove(&id);
    }

    // ------------------------------------------------------------------
    // Lifecycle verbs
    // ------------------------------------------------------------------

    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<SandboxRecord, KernelError> {
        self.db
            .fetch_sandbox(user_id, id)
            .await?
            .ok_or(KernelError::NotFound("sandbox"))
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        filter: &SandboxFilter,
    ) -> Result<Vec<SandboxRecord>, KernelError> {
        Ok(self.db.list_sandboxes(user_id, filter).await?)
    }

    /// Starts a stopped sandbox. Any other state returns the current row
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn start(&self, user_id: Uuid, id: Uuid) -> Result<SandboxRecord, KernelError> {
        let record = self.get(user_id, id).await?;
        if record.status != SandboxStatus::Stopped {
            return Ok(record);
        }
        let container_ref = record
            .container_ref
            .clone()
            .ok_or(KernelError::NoContainer)?;

        self.runtime.start(&container_ref).await?;
        self.db.mark_sandbox_running(id).await?;
        self.spawn_collector(id, container_ref);

        info!(sandbox_id = %id, "sandbox started");
        self.audit(user_id, "sandbox.started", id, json!({})).await;
        self.get(user_id, id).await
    }

    /// Stops a running sandbox with the configured grace period.
    #[instrument(skip(self))]
    pub async fn stop(&self, user_id: Uuid, id: Uuid) -> Result<SandboxRecord, KernelError> {
        let record = self.get(user_id, id).await?;
        if record.status != SandboxStatus::Running {
            return Ok(record);
        }
        let container_ref = record
            .container_ref
            .clone()
            .ok_or(KernelError::NoContainer)?;

        self.runtime
            .stop(&container_ref, self.settings.stop_grace_seconds)
            .await?;
        self.stop_collector(id);
        self.db
            .mark_sandbox_stopped(id, SandboxStatus::Stopped)
            .await?;

        info!(sandbox_id = %id, "sandbox stopped");
        self.audit(user_id, "sandbox.stopped", id, json!({})).await;
        self.get(user_id, id).await
    }

    /// Restarts a running sandbox, re-stamping `started_at`.
    #[instrument(skip(self))]
    pub async fn restart(&self, user_id: Uuid, id: Uuid) -> Result<SandboxRecord, KernelError> {
        let record = self.get(user_id, id).await?;
        if record.status != SandboxStatus::Running {
            return Ok(record);
        }
        let container_ref = record
            .container_ref
            .clone()
            .ok_or(KernelError::NoContainer)?;

        self.runtime
            .restart(&container_ref, self.settings.stop_grace_seconds)
            .await?;
        self.db.mark_sandbox_running(id).await?;
        self.spawn_collector(id, container_ref);

        info!(sandbox_id = %id, "sandbox restarted");
        self.audit(user_id, "sandbox.restarted", id, json!({})).await;
        self.get(user_id, id).await
    }

    /// Hard-deletes the sandbox and its container. Returns whether a row
    /// existed; concurrent destroys deduplicate at the store delete.
    #[instrument(skip(self))]
    pub async fn destroy(&self, user_id: Uuid, id: Uuid) -> Result<bool, KernelError> {
        let Some(record) = self.db.fetch_sandbox(user_id, id).await? else {
            return Ok(false);
        };

        if let Some(handle) = self.tasks.provisioners.lock().remove(&id) {
            handle.abort();
        }
        self.stop_collector(id);

        if let Some(container_ref) = record.container_ref.as_deref() {
            self.runtime.remove(container_ref).await?;
        }

        let existed = self.db.delete_sandbox(user_id, id).await?;
        if existed {
            info!(sandbox_id = %id, "sandbox destroyed");
            self.audit(user_id, "sandbox.destroyed", id, json!({ "name": record.name }))
                .await;
        }
        Ok(existed)
    }

    /// Clones a sandbox onto fresh host ports (probed upward from the
    /// original's) and runs the full create pipeline again.
    #[instrument(skip(self, req))]
    pub async fn replicate(
        &self,
        user_id: Uuid,
        id: Uuid,
        req: ReplicateSandbox,
    ) -> Result<SandboxRecord, KernelError> {
        let original = self.get(user_id, id).await?;

        let name = match req.name {
            Some(name) => name,
            None => format!(
                "{}-replica-{:04x}",
                original.name,
                rand::thread_rng().gen::<u16>()
            ),
        };

        let ports = match req.ports {
            Some(ports) => {
                validate::ports(&ports)?;
                ports
            }
            None => probe_host_ports(&original.ports)?,
        };

        let replica = self
            .create(
                user_id,
                CreateSandbox {
                    environment_id: original.environment_id,
                    environment_version_id: Some(original.environment_version_id),
                    name: Some(name),
                    ttl_seconds: None,
                    ports: Some(ports),
                    env: BTreeMap::new(),
                },
            )
            .await?;

        self.audit(
            user_id,
            "sandbox.replicated",
            replica.id,
            json!({ "source": original.id }),
        )
        .await;
        Ok(replica)
    }

    /// Aligns the row with runtime truth: running, exited, or gone.
    #[instrument(skip(self))]
    pub async fn sync(&self, user_id: Uuid, id: Uuid) -> Result<SandboxRecord, KernelError> {
        let record = self.get(user_id, id).await?;
        let Some(container_ref) = record.container_ref.as_deref() else {
            return Ok(record);
        };

        match self.runtime.inspect(container_ref).await? {
            Some(state) if state.running => {
                if record.status != SandboxStatus::Running
                    && record.status.can_transition(SandboxStatus::Running)
                {
                    self.db.mark_sandbox_running(id).await?;
                }
            }
            Some(state) if state.status == "exited" => {
                if record.status != SandboxStatus::Stopped
                    && record.status.can_transition(SandboxStatus::Stopped)
                {
                    self.stop_collector(id);
                    self.db
                        .mark_sandbox_stopped(id, SandboxStatus::Stopped)
                        .await?;
                }
            }
            Some(_) | None => {
                if record.status != SandboxStatus::Error {
                    self.stop_collector(id);
                    self.db
                        .mark_sandbox_failed(id, "container missing or dead")
                        .await?;
                }
            }
        }

        self.get(user_id, id).await
    }

    /// Runs a blocking command inside a running sandbox.
    pub async fn exec(
        &self,
        user_id: Uuid,
        id: Uuid,
        argv: &[String],
    ) -> Result<ExecOutput, KernelError> {
        let record = self.get(user_id, id).await?;
        if record.status != SandboxStatus::Running {
            return Err(KernelError::NotRunning);
        }
        let container_ref = record.container_ref.as_deref().ok_or(KernelError::NoContainer)?;
        if argv.is_empty() {
            return Err(KernelError::Validation("command must not be empty".to_string()));
        }
        Ok(self.runtime.exec_batch(container_ref, argv).await?)
    }

    /// One-shot resource usage sample.
    pub async fn metrics(&self, user_id: Uuid, id: Uuid) -> Result<ContainerMetrics, KernelError> {
        let record = self.get(user_id, id).await?;
        if record.status != SandboxStatus::Running {
            return Err(KernelError::NotRunning);
        }
        let container_ref = record.container_ref.as_deref().ok_or(KernelError::NoContainer)?;
        self.runtime
            .stats(container_ref)
            .await?
            .ok_or(KernelError::MetricsUnavailable)
    }

    /// Stored log tail, chronological.
    pub async fn logs(
        &self,
        user_id: Uuid,
        id: Uuid,
        tail: u32,
    ) -> Result<Vec<islet_db::SandboxLogRecord>, KernelError> {
        self.get(user_id, id).await?;
        Ok(self.db.list_sandbox_logs(id, tail).await?)
    }

    // ------------------------------------------------------------------
    // TTL sweep and cascade destruction
    // ------------------------------------------------------------------

    /// One sweeper pass: expire every live sandbox past its deadline.
    /// Per-sandbox failures are logged and retried on the next pass.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Sweep against an explicit deadline clock.
    pub async fn sweep_expired_at(&self, now: chrono::DateTime<Utc>) -> usize {
        let due = match self.db.list_expired_sandboxes(now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "ttl sweep could not list sandboxes");
                return 0;
            }
        };

        let mut expired = 0;
        for sandbox in due {
            if let Some(handle) = self.tasks.provisioners.lock().remove(&sandbox.id) {
                handle.abort();
            }
            self.stop_collector(sandbox.id);

            if let Some(container_ref) = sandbox.container_ref.as_deref() {
                if let Err(err) = self
                    .runtime
                    .stop(container_ref, self.settings.sweep_grace_seconds)
                    .await
                {
                    warn!(sandbox_id = %sandbox.id, error = %err, "ttl stop failed");
                }
                if let Err(err) = self.runtime.remove(container_ref).await {
                    warn!(sandbox_id = %sandbox.id, error = %err, "ttl remove failed");
                    continue; // retried next sweep
                }
            }

            if let Err(err) = self
                .db
                .mark_sandbox_stopped(sandbox.id, SandboxStatus::Expired)
                .await
            {
                warn!(sandbox_id = %sandbox.id, error = %err, "ttl status write failed");
                continue;
            }

            info!(sandbox_id = %sandbox.id, "sandbox expired");
            self.audit(sandbox.user_id, "sandbox.expired", sandbox.id, json!({}))
                .await;
            expired += 1;
        }
        expired
    }

    /// Destroys every sandbox of an environment (used by environment
    /// deletion).
    pub(crate) async fn destroy_environment_sandboxes(
        &self,
        user_id: Uuid,
        environment_id: Uuid,
    ) -> Result<(), KernelError> {
        for sandbox in self.db.list_environment_sandboxes(environment_id).await? {
            self.destroy(user_id, sandbox.id).await?;
        }
        Ok(())
    }

    /// Shutdown path: best-effort stop and remove of every platform-labeled
    /// container.
    pub async fn shutdown_cleanup(&self) {
        let owned = match self.runtime.list_owned().await {
            Ok(owned) => owned,
            Err(err) => {
                warn!(error = %err, "could not enumerate owned containers at shutdown");
                return;
            }
        };

        for container_ref in owned {
            if let Err(err) = self
                .runtime
                .stop(&container_ref, self.settings.sweep_grace_seconds)
                .await
            {
                warn!(container = %container_ref, error = %err, "shutdown stop failed");
            }
            if let Err(err) = self.runtime.remove(&container_ref).await {
                warn!(container = %container_ref, error = %err, "shutdown remove failed");
            }
        }
    }

    async fn audit(&self, user_id: Uuid, action: &str, sandbox_id: Uuid, metadata: serde_json::Value) {
        let entry = NewAuditEntry {
            user_id,
            action,
            resource_type: "sandbox",
            resource_id: sandbox_id.to_string(),
            metadata,
            client_ip: None,
            client_agent: None,
        };
        if let Err(err) = self.db.record_audit_entry(entry).await {
            warn!(action, error = %err, "failed to record audit entry");
        }
    }
}

/// Assigns a fresh host port per mapping by probing local availability
/// upward from `original + 1`. The probe is racy by nature; the runtime's
/// `Conflict` on create is surfaced as retriable.
fn probe_host_ports(original: &[PortMapping]) -> Result<Vec<PortMapping>, KernelError> {
    let mut assigned: HashSet<u16> = HashSet::new();
    let mut out = Vec::with_capacity(original.len());

    for mapping in original {
        let mut candidate = mapping.host.saturating_add(1).max(1024);
        let mut found = None;
        for _ in 0..100 {
            if !assigned.contains(&candidate) && host_port_free(candidate) {
                found = Some(candidate);
                break;
            }
            candidate = candidate.checked_add(1).ok_or_else(|| {
                KernelError::Conflict("host port space exhausted".to_string())
            })?;
        }
        let host = found.ok_or_else(|| {
            KernelError::Conflict(format!(
                "no free host port within 100 attempts above {}",
                mapping.host
            ))
        })?;
        assigned.insert(host);
        out.push(PortMapping {
            container: mapping.container,
            host,
        });
    }
    Ok(out)
}

fn host_port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probed_ports_start_above_the_original() {
        let original = vec![PortMapping {
            container: 80,
            host: 48080,
        }];
        let probed = probe_host_ports(&original).unwrap();
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].container, 80);
        assert!(probed[0].host > 48080);
    }

    #[test]
    fn probed_ports_within_one_call_never_collide() {
        let original = vec![
            PortMapping {
                container: 80,
                host: 48090,
            },
            PortMapping {
                container: 81,
                host: 48090,
            },
        ];
        let probed = probe_host_ports(&original).unwrap();
        assert_ne!(probed[0].host, probed[1].host);
    }

    #[test]
    fn probing_skips_a_bound_port() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();
        if bound == u16::MAX || bound < 1024 {
            return; // nothing sensible to assert at the edges
        }
        let original = vec![PortMapping {
            container: 80,
            host: bound - 1,
        }];
        let probed = probe_host_ports(&original).unwrap();
        assert_ne!(probed[0].host, bound);
    }
}
