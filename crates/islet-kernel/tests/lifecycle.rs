//! End-to-end lifecycle tests against the scriptable in-memory runtime.

use std::time::Duration;

use chrono::Utc;
use islet_db::{
    Database, LogStream, NewUser, PortMapping, SandboxFilter, SandboxPhase, SandboxStatus,
};
use islet_kernel::testing::FakeRuntime;
use islet_kernel::{
    ContainerRuntime, CreateSandbox, EnvironmentPatch, EnvironmentSpec, IsletKernel, KernelConfig,
    KernelError, LogEvent, ReplicateSandbox, SecretsVault,
};
use uuid::Uuid;

async fn harness() -> (IsletKernel<FakeRuntime>, Uuid) {
    let db = Database::connect("sqlite::memory:", 1).await.unwrap();
    let kernel = IsletKernel::new(
        db.clone(),
        FakeRuntime::new(),
        SecretsVault::generate_ephemeral(),
        KernelConfig::default(),
    );
    let user = db
        .create_user(NewUser {
            email: "owner@x.test",
            password_hash: "argon2-hash",
        })
        .await
        .unwrap();
    (kernel, user.id)
}

fn env_spec(name: &str) -> EnvironmentSpec {
    EnvironmentSpec {
        name: name.to_string(),
        image: Some("nginx:alpine".to_string()),
        cpu: Some(1.0),
        memory_mb: Some(256),
        ports: vec![PortMapping {
            container: 80,
            host: 48080,
        }],
        ..Default::default()
    }
}

async fn wait_status(
    kernel: &IsletKernel<FakeRuntime>,
    user: Uuid,
    id: Uuid,
    status: SandboxStatus,
) -> islet_db::SandboxRecord {
    for _ in 0..400 {
        let record = kernel.sandboxes().get(user, id).await.unwrap();
        if record.status == status {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sandbox {id} never reached {status:?}");
}

#[tokio::test]
async fn provision_happy_path() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("web")).await.unwrap();

    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("demo".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The caller sees the pending row immediately.
    assert_eq!(created.status, SandboxStatus::Pending);
    assert_eq!(created.phase, SandboxPhase::Creating);
    assert!(created.container_ref.is_none());

    let running = wait_status(&kernel, user, created.id, SandboxStatus::Running).await;
    assert_eq!(running.phase, SandboxPhase::Healthy);
    assert!(running.container_ref.is_some());
    assert!(running.started_at.is_some());

    // Container spec carries the resource profile and identity labels.
    let specs = kernel.sandboxes().runtime().specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.image, "nginx:alpine");
    assert_eq!(spec.cpu, 1.0);
    assert_eq!(spec.memory_mb, 256);
    assert_eq!(spec.labels.get("sandbox-id").unwrap(), &created.id.to_string());
    assert_eq!(spec.labels.get("user-id").unwrap(), &user.to_string());
    assert!(spec
        .env
        .iter()
        .any(|kv| kv == &format!("SANDBOX_ID={}", created.id)));

    // Progress lands at 100 once healthy.
    for _ in 0..400 {
        let record = kernel.sandboxes().get(user, created.id).await.unwrap();
        if record.provision_progress == 100 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provision progress never reached 100");
}

#[tokio::test]
async fn create_is_idempotent_per_name() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("twin-env")).await.unwrap();

    let request = CreateSandbox {
        environment_id: env.id,
        name: Some("twin".to_string()),
        ..Default::default()
    };
    let first = kernel.sandboxes().create(user, request.clone()).await.unwrap();
    let second = kernel.sandboxes().create(user, request).await.unwrap();

    assert_eq!(first.id, second.id);
    wait_status(&kernel, user, first.id, SandboxStatus::Running).await;
    // Exactly one container was ever created for the pair.
    assert_eq!(kernel.sandboxes().runtime().container_count(), 1);
}

#[tokio::test]
async fn eleventh_active_sandbox_is_rejected() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("quota")).await.unwrap();

    for i in 0..10 {
        kernel
            .sandboxes()
            .create(
                user,
                CreateSandbox {
                    environment_id: env.id,
                    name: Some(format!("s{i}")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let err = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("s10".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::QuotaExceeded(_)));

    let rows = kernel
        .sandboxes()
        .list(user, &SandboxFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
}

#[tokio::test]
async fn environment_quota_is_enforced() {
    let (kernel, user) = harness().await;
    for i in 0..5 {
        kernel
            .environments()
            .create(user, env_spec(&format!("env-{i}")))
            .await
            .unwrap();
    }
    let err = kernel
        .environments()
        .create(user, env_spec("env-5"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::QuotaExceeded(_)));
}

#[tokio::test]
async fn secrets_are_injected_and_logs_redacted() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("secretive")).await.unwrap();
    kernel
        .environments()
        .set_secret(user, env.id, "API_KEY", "sk_live_ABCDEF")
        .await
        .unwrap();

    kernel.sandboxes().runtime().script_logs(vec![LogEvent {
        stream: LogStream::Stdout,
        text: "API_KEY=sk_live_ABCDEF".to_string(),
        timestamp: Utc::now(),
    }]);

    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("leaky".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, created.id, SandboxStatus::Running).await;

    // The container env got the decrypted value...
    let specs = kernel.sandboxes().runtime().specs();
    assert!(specs[0].env.iter().any(|kv| kv == "API_KEY=sk_live_ABCDEF"));

    // ...while the stored log tail only ever sees the redacted form.
    for _ in 0..400 {
        let logs = kernel.sandboxes().logs(user, created.id, 10).await.unwrap();
        if !logs.is_empty() {
            assert_eq!(logs[0].text, "API_KEY=[REDACTED]");
            assert!(!logs[0].text.contains("sk_live_ABCDEF"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("collector never persisted the scripted log line");
}

#[tokio::test]
async fn secret_values_never_appear_in_environment_listing() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("opaque")).await.unwrap();
    kernel
        .environments()
        .set_secret(user, env.id, "API_KEY", "sk_live_ABCDEF")
        .await
        .unwrap();

    let (_, version) = kernel.environments().get(user, env.id).await.unwrap();
    let version = version.unwrap();
    let sealed = version.secrets_encrypted.get("API_KEY").unwrap();
    assert!(!sealed.contains("sk_live_ABCDEF"));
}

#[tokio::test]
async fn update_appends_and_secrets_ride_along() {
    let (kernel, user) = harness().await;
    let (env, v1) = kernel.environments().create(user, env_spec("versioned")).await.unwrap();
    kernel
        .environments()
        .set_secret(user, env.id, "TOKEN_A", "first")
        .await
        .unwrap();

    let (_, v2) = kernel
        .environments()
        .update(
            user,
            env.id,
            EnvironmentPatch {
                memory_mb: Some(512),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(v2.version, v1.version + 1);
    assert_eq!(v2.memory_mb, 512);
    assert_eq!(v2.image.as_deref(), Some("nginx:alpine"));
    assert!(v2.secrets_encrypted.contains_key("TOKEN_A"));

    let (env_after, current) = kernel.environments().get(user, env.id).await.unwrap();
    assert_eq!(env_after.current_version_id, Some(v2.id));
    assert_eq!(current.unwrap().id, v2.id);
}

#[tokio::test]
async fn stop_start_restart_follow_the_state_machine() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("cycler")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("cycle".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, created.id, SandboxStatus::Running).await;

    let stopped = kernel.sandboxes().stop(user, created.id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.phase, SandboxPhase::Stopped);
    assert!(stopped.stopped_at.is_some());

    // Stopping a stopped sandbox is a no-op returning the row.
    let again = kernel.sandboxes().stop(user, created.id).await.unwrap();
    assert_eq!(again.status, SandboxStatus::Stopped);

    let restarted = kernel.sandboxes().start(user, created.id).await.unwrap();
    assert_eq!(restarted.status, SandboxStatus::Running);
    assert!(restarted.stopped_at.is_none());

    let bounced = kernel.sandboxes().restart(user, created.id).await.unwrap();
    assert_eq!(bounced.status, SandboxStatus::Running);
    assert_eq!(bounced.phase, SandboxPhase::Healthy);
}

#[tokio::test]
async fn destroy_removes_row_and_container() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("doomed")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("gone".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, created.id, SandboxStatus::Running).await;

    assert!(kernel.sandboxes().destroy(user, created.id).await.unwrap());
    assert_eq!(kernel.sandboxes().runtime().container_count(), 0);
    assert!(matches!(
        kernel.sandboxes().get(user, created.id).await,
        Err(KernelError::NotFound(_))
    ));
    // Concurrent/second destroy deduplicates to false.
    assert!(!kernel.sandboxes().destroy(user, created.id).await.unwrap());
}

#[tokio::test]
async fn failed_health_wait_parks_in_error() {
    let (kernel, user) = harness().await;
    kernel.sandboxes().runtime().refuse_healthy(true);
    let (env, _) = kernel.environments().create(user, env_spec("sickly")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("sick".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let failed = wait_status(&kernel, user, created.id, SandboxStatus::Error).await;
    assert_eq!(failed.phase, SandboxPhase::Failed);
    // The container is left behind for the operator.
    assert_eq!(kernel.sandboxes().runtime().container_count(), 1);
}

#[tokio::test]
async fn ttl_sweep_expires_and_removes_container() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("ephemeral")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("shortlived".to_string()),
                ttl_seconds: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, created.id, SandboxStatus::Running).await;

    let expired = kernel
        .sandboxes()
        .sweep_expired_at(Utc::now() + chrono::Duration::seconds(120))
        .await;
    assert_eq!(expired, 1);

    let record = kernel.sandboxes().get(user, created.id).await.unwrap();
    assert_eq!(record.status, SandboxStatus::Expired);
    assert_eq!(record.phase, SandboxPhase::Stopped);
    assert!(record.stopped_at.is_some());
    assert_eq!(kernel.sandboxes().runtime().container_count(), 0);

    // A second pass finds nothing.
    assert_eq!(
        kernel
            .sandboxes()
            .sweep_expired_at(Utc::now() + chrono::Duration::seconds(240))
            .await,
        0
    );
}

#[tokio::test]
async fn sync_reconciles_with_runtime_truth() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("drifty")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("drift".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let running = wait_status(&kernel, user, created.id, SandboxStatus::Running).await;
    let container_ref = running.container_ref.clone().unwrap();

    // Process died underneath us.
    kernel.sandboxes().runtime().exit_container(&container_ref);
    let synced = kernel.sandboxes().sync(user, created.id).await.unwrap();
    assert_eq!(synced.status, SandboxStatus::Stopped);
    assert_eq!(synced.phase, SandboxPhase::Stopped);

    // Container vanished entirely.
    kernel.sandboxes().runtime().remove(&container_ref).await.unwrap();
    let synced = kernel.sandboxes().sync(user, created.id).await.unwrap();
    assert_eq!(synced.status, SandboxStatus::Error);
    assert_eq!(synced.phase, SandboxPhase::Failed);
}

#[tokio::test]
async fn replicate_assigns_disjoint_host_ports() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("replica-env")).await.unwrap();
    let original = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("origin".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, original.id, SandboxStatus::Running).await;

    let replica = kernel
        .sandboxes()
        .replicate(user, original.id, ReplicateSandbox::default())
        .await
        .unwrap();
    assert_ne!(replica.id, original.id);
    assert!(replica.name.starts_with("origin-replica-"));
    wait_status(&kernel, user, replica.id, SandboxStatus::Running).await;

    let original_row = kernel.sandboxes().get(user, original.id).await.unwrap();
    let original_hosts: Vec<u16> = original_row.ports.iter().map(|p| p.host).collect();
    for port in &replica.ports {
        assert!(!original_hosts.contains(&port.host));
    }

    // Destroying the replica leaves the original running.
    assert!(kernel.sandboxes().destroy(user, replica.id).await.unwrap());
    let survivor = kernel.sandboxes().get(user, original.id).await.unwrap();
    assert_eq!(survivor.status, SandboxStatus::Running);
}

#[tokio::test]
async fn tenant_isolation_returns_not_found() {
    let (kernel, owner) = harness().await;
    let intruder = kernel
        .db()
        .create_user(NewUser {
            email: "intruder@x.test",
            password_hash: "hash",
        })
        .await
        .unwrap()
        .id;

    let (env, _) = kernel.environments().create(owner, env_spec("private")).await.unwrap();
    let sandbox = kernel
        .sandboxes()
        .create(
            owner,
            CreateSandbox {
                environment_id: env.id,
                name: Some("mine".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, owner, sandbox.id, SandboxStatus::Running).await;

    assert!(matches!(
        kernel.sandboxes().get(intruder, sandbox.id).await,
        Err(KernelError::NotFound(_))
    ));
    assert!(matches!(
        kernel.sandboxes().stop(intruder, sandbox.id).await,
        Err(KernelError::NotFound(_))
    ));
    assert!(!kernel.sandboxes().destroy(intruder, sandbox.id).await.unwrap());
    assert!(matches!(
        kernel.environments().get(intruder, env.id).await,
        Err(KernelError::NotFound(_))
    ));

    // The sandbox is untouched.
    let record = kernel.sandboxes().get(owner, sandbox.id).await.unwrap();
    assert_eq!(record.status, SandboxStatus::Running);
}

#[tokio::test]
async fn exec_and_metrics_require_running() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("execer")).await.unwrap();
    let created = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("exec".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, created.id, SandboxStatus::Running).await;

    let outcome = kernel
        .sandboxes()
        .exec(user, created.id, &["echo".to_string(), "hi".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.output, "echo hi");

    let metrics = kernel.sandboxes().metrics(user, created.id).await.unwrap();
    assert!(metrics.cpu_percent > 0.0);

    kernel.sandboxes().stop(user, created.id).await.unwrap();
    assert!(matches!(
        kernel.sandboxes().exec(user, created.id, &["id".to_string()]).await,
        Err(KernelError::NotRunning)
    ));
    assert!(matches!(
        kernel.sandboxes().metrics(user, created.id).await,
        Err(KernelError::NotRunning)
    ));
}

#[tokio::test]
async fn deleting_an_environment_destroys_its_sandboxes() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("cascade")).await.unwrap();
    let sandbox = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("victim".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, sandbox.id, SandboxStatus::Running).await;

    assert!(kernel.delete_environment(user, env.id).await.unwrap());
    assert_eq!(kernel.sandboxes().runtime().container_count(), 0);
    assert!(matches!(
        kernel.sandboxes().get(user, sandbox.id).await,
        Err(KernelError::NotFound(_))
    ));
    assert!(kernel.environments().list(user).await.unwrap().is_empty());

    // Deleting again reports absence.
    assert!(!kernel.delete_environment(user, env.id).await.unwrap());
}

#[tokio::test]
async fn audit_trail_records_lifecycle_actions() {
    let (kernel, user) = harness().await;
    let (env, _) = kernel.environments().create(user, env_spec("audited")).await.unwrap();
    let sandbox = kernel
        .sandboxes()
        .create(
            user,
            CreateSandbox {
                environment_id: env.id,
                name: Some("papertrail".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_status(&kernel, user, sandbox.id, SandboxStatus::Running).await;
    kernel.sandboxes().stop(user, sandbox.id).await.unwrap();

    let entries = kernel
        .db()
        .list_audit_entries(user, &islet_db::AuditFilter::default())
        .await
        .unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"environment.created"));
    assert!(actions.contains(&"sandbox.created"));
    assert!(actions.contains(&"sandbox.started"));
    assert!(actions.contains(&"sandbox.stopped"));
    // Exactly one created entry despite the idempotent surface.
    assert_eq!(
        actions.iter().filter(|a| **a == "sandbox.created").count(),
        1
    );
}
