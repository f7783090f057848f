//! Scriptable in-memory container runtime for tests.
//!
//! Behaves like a well-mannered engine: containers transition between
//! created/running/exited, log streams drain a scripted backlog, and the
//! interactive session echoes written bytes back. Knobs simulate the
//! interesting failures (start refusal, health-wait timeout).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::runtime::{
    ContainerMetrics, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, LogEvent,
    ProgressFn, RuntimeError, RuntimeResult, TerminalControl, TerminalSession,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub status: String,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    scripted_logs: Mutex<Vec<LogEvent>>,
    counter: AtomicU64,
    fail_start: AtomicBool,
    refuse_healthy: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `start` fail with a runtime error.
    pub fn fail_start(&self, enabled: bool) {
        self.fail_start.store(enabled, Ordering::SeqCst);
    }

    /// Makes `wait_running` report unhealthy regardless of state.
    pub fn refuse_healthy(&self, enabled: bool) {
        self.refuse_healthy.store(enabled, Ordering::SeqCst);
    }

    /// Queues log lines that the next `stream_logs` call will drain.
    pub fn script_logs(&self, events: Vec<LogEvent>) {
        *self.scripted_logs.lock() = events;
    }

    /// Flips a running container to exited, as if its process died.
    pub fn exit_container(&self, container_ref: &str) {
        if let Some(container) = self.containers.lock().get_mut(container_ref) {
            container.running = false;
            container.status = "exited".to_string();
        }
    }

    pub fn container(&self, container_ref: &str) -> Option<FakeContainer> {
        self.containers.lock().get(container_ref).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.containers.lock().values().map(|c| c.spec.clone()).collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn ensure_image(&self, _image: &str, progress: &ProgressFn) -> RuntimeResult<()> {
        progress(50, "pulling");
        progress(100, "image present");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let id = format!("fake-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                status: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start(&self, container_ref: &str) -> RuntimeResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("scripted start failure".to_string()));
        }
        match self.containers.lock().get_mut(container_ref) {
            Some(container) => {
                container.running = true;
                container.status = "running".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_ref.to_string())),
        }
    }

    async fn stop(&self, container_ref: &str, _grace_seconds: u32) -> RuntimeResult<()> {
        match self.containers.lock().get_mut(container_ref) {
            Some(container) => {
                container.running = false;
                container.status = "exited".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_ref.to_string())),
        }
    }

    async fn restart(&self, container_ref: &str, _grace_seconds: u32) -> RuntimeResult<()> {
        match self.containers.lock().get_mut(container_ref) {
            Some(container) => {
                container.running = true;
                container.status = "running".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_ref.to_string())),
        }
    }

    async fn remove(&self, container_ref: &str) -> RuntimeResult<()> {
        self.containers.lock().remove(container_ref);
        Ok(())
    }

    async fn inspect(&self, container_ref: &str) -> RuntimeResult<Option<ContainerState>> {
        Ok(self.containers.lock().get(container_ref).map(|container| {
            ContainerState {
                status: container.status.clone(),
                running: container.running,
                exit_code: if container.status == "exited" {
                    Some(0)
                } else {
                    None
                },
            }
        }))
    }

    async fn wait_running(
        &self,
        container_ref: &str,
        _deadline: std::time::Duration,
    ) -> RuntimeResult<bool> {
        if self.refuse_healthy.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self
            .containers
            .lock()
            .get(container_ref)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn stats(&self, container_ref: &str) -> RuntimeResult<Option<ContainerMetrics>> {
        Ok(self.containers.lock().get(container_ref).and_then(|c| {
            c.running.then(|| ContainerMetrics {
                cpu_percent: 3.5,
                memory_usage_bytes: 64 * 1024 * 1024,
                memory_limit_bytes: 256 * 1024 * 1024,
                memory_percent: 25.0,
                network_rx_bytes: 1024,
                network_tx_bytes: 2048,
                block_read_bytes: 0,
                block_write_bytes: 4096,
            })
        }))
    }

    async fn stream_logs(
        &self,
        _container_ref: &str,
        _since_unix: i64,
    ) -> RuntimeResult<BoxStream<'static, LogEvent>> {
        let events: Vec<LogEvent> = std::mem::take(&mut *self.scripted_logs.lock());
        Ok(futures::stream::iter(events).boxed())
    }

    async fn get_logs(&self, _container_ref: &str, tail: u32) -> RuntimeResult<Vec<LogEvent>> {
        let events = self.scripted_logs.lock();
        let skip = events.len().saturating_sub(tail as usize);
        Ok(events.iter().skip(skip).cloned().collect())
    }

    async fn exec_batch(&self, container_ref: &str, argv: &[String]) -> RuntimeResult<ExecOutput> {
        if self.containers.lock().get(container_ref).map(|c| c.running) != Some(true) {
            return Err(RuntimeError::Conflict("container is not running".to_string()));
        }
        Ok(ExecOutput {
            exit_code: Some(0),
            output: argv.join(" "),
        })
    }

    async fn exec_interactive(
        &self,
        container_ref: &str,
        _cols: u16,
        _rows: u16,
    ) -> RuntimeResult<TerminalSession> {
        if self.containers.lock().get(container_ref).map(|c| c.running) != Some(true) {
            return Err(RuntimeError::Conflict("container is not running".to_string()));
        }

        // An echo shell: everything written comes straight back as output.
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let _ = tx.send(b"$ ".to_vec());
        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();

        Ok(TerminalSession {
            output,
            control: Box::new(EchoControl {
                tx: Some(tx),
                resizes: Vec::new(),
            }),
        })
    }

    async fn list_owned(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.containers.lock().keys().cloned().collect())
    }
}

/// Control half of the echo terminal.
struct EchoControl {
    tx: Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>,
    resizes: Vec<(u16, u16)>,
}

#[async_trait]
impl TerminalControl for EchoControl {
    async fn write_input(&mut self, data: &[u8]) -> RuntimeResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| RuntimeError::Other("terminal closed".to_string())),
            None => Err(RuntimeError::Other("terminal closed".to_string())),
        }
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.resizes.push((cols, rows));
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the sender ends the output stream.
        self.tx = None;
    }
}
