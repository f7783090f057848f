//! Container runtime adapter.
//!
//! Everything the kernel needs from the OCI engine goes through the
//! [`ContainerRuntime`] trait so that orchestration logic and tests never
//! talk to a real daemon directly. [`DockerRuntime`] is the production
//! implementation over the engine API socket.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use islet_db::{LogStream, PortMapping};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Label attached to every container the platform owns.
pub const PLATFORM_LABEL: &str = "sandbox-platform";
/// Label carrying the owning sandbox id.
pub const SANDBOX_ID_LABEL: &str = "sandbox-id";
/// Label carrying the owning user id.
pub const USER_ID_LABEL: &str = "user-id";

/// CFS scheduler period used for CPU quotas, in microseconds.
const CPU_PERIOD_USEC: i64 = 100_000;
const MIB: i64 = 1_048_576;
const INSPECT_POLL: Duration = Duration::from_millis(500);

/// Categorized engine failures. The sandbox service translates these into
/// lifecycle transitions.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } if status_code >= 500 => RuntimeError::Unavailable(message),
            DockerError::IOError { err } => RuntimeError::Unavailable(err.to_string()),
            DockerError::HyperResponseError { err } => RuntimeError::Unavailable(err.to_string()),
            DockerError::RequestTimeoutError => {
                RuntimeError::Unavailable("request timed out".to_string())
            }
            other => RuntimeError::Other(other.to_string()),
        }
    }
}

/// Sink for image-pull progress: percentage 0..=100 and a status line.
pub type ProgressFn = dyn Fn(u8, &str) + Send + Sync;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    /// `KEY=VALUE` entries, secrets already merged in.
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub cpu: f64,
    pub memory_mb: i64,
    pub labels: BTreeMap<String, String>,
}

/// One-shot inspect snapshot.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "exited" | "dead")
    }
}

/// One-shot resource usage sample.
#[derive(Debug, Clone, Default)]
pub struct ContainerMetrics {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

/// A decoded log line from the engine.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub stream: LogStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a blocking exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
}

/// Interactive PTY-backed shell session, split so output can be pumped
/// while control operations run concurrently.
pub struct TerminalSession {
    /// PTY output chunks; finite once the shell exits.
    pub output: BoxStream<'static, Vec<u8>>,
    pub control: Box<dyn TerminalControl>,
}

/// Input, resize, and teardown side of a PTY session.
#[async_trait]
pub trait TerminalControl: Send {
    async fn write_input(&mut self, data: &[u8]) -> RuntimeResult<()>;
    async fn resize(&mut self, cols: u16, rows: u16) -> RuntimeResult<()>;
    /// Tears the session down from this side.
    async fn close(&mut self);
}

/// Abstraction over the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Liveness probe against the engine.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Pulls `image` unless it is already present, reporting aggregate
    /// progress through `progress`.
    async fn ensure_image(&self, image: &str, progress: &ProgressFn) -> RuntimeResult<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start(&self, container_ref: &str) -> RuntimeResult<()>;
    /// Treats "already stopped" as success.
    async fn stop(&self, container_ref: &str, grace_seconds: u32) -> RuntimeResult<()>;
    async fn restart(&self, container_ref: &str, grace_seconds: u32) -> RuntimeResult<()>;
    /// Force-removes; "not found" counts as success.
    async fn remove(&self, container_ref: &str) -> RuntimeResult<()>;
    async fn inspect(&self, container_ref: &str) -> RuntimeResult<Option<ContainerState>>;

    /// Polls inspect until the container reports running, exits, or the
    /// deadline elapses.
    async fn wait_running(&self, container_ref: &str, deadline: Duration) -> RuntimeResult<bool> {
        let started = Instant::now();
        loop {
            match self.inspect(container_ref).await? {
                Some(state) if state.running => return Ok(true),
                Some(state) if state.is_terminal() => return Ok(false),
                Some(_) => {}
                None => return Ok(false),
            }
            if started.elapsed() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(INSPECT_POLL).await;
        }
    }

    async fn stats(&self, container_ref: &str) -> RuntimeResult<Option<ContainerMetrics>>;

    /// Follows the container's output starting at `since_unix`. The stream
    /// is finite when the container exits.
    async fn stream_logs(
        &self,
        container_ref: &str,
        since_unix: i64,
    ) -> RuntimeResult<BoxStream<'static, LogEvent>>;

    async fn get_logs(&self, container_ref: &str, tail: u32) -> RuntimeResult<Vec<LogEvent>>;
    async fn exec_batch(&self, container_ref: &str, argv: &[String]) -> RuntimeResult<ExecOutput>;
    async fn exec_interactive(
        &self,
        container_ref: &str,
        cols: u16,
        rows: u16,
    ) -> RuntimeResult<TerminalSession>;

    /// Containers bearing the platform label, used at shutdown.
    async fn list_owned(&self) -> RuntimeResult<Vec<String>>;
}

/// Engine-API implementation over the local socket.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects via the configured socket path, or the platform default.
    pub fn connect(socket_path: Option<&str>) -> RuntimeResult<Self> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_socket_defaults()?,
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str, progress: &ProgressFn) -> RuntimeResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                progress(100, "image present");
                return Ok(());
            }
            Err(err) if is_status(&err, 404) => {}
            Err(err) => return Err(err.into()),
        }

        let mut layers: HashMap<String, (i64, i64)> = HashMap::new();
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Other(format!("image pull failed: {error}")));
            }
            if let (Some(id), Some(detail)) = (info.id.as_ref(), info.progress_detail.as_ref()) {
                if let (Some(current), Some(total)) = (detail.current, detail.total) {
                    if total > 0 {
                        layers.insert(id.clone(), (current.min(total), total));
                    }
                }
            }
            let (done, total) = layers
                .values()
                .fold((0i64, 0i64), |acc, (c, t)| (acc.0 + c, acc.1 + t));
            // Hold 100% back until the pull stream actually finishes.
            let pct = if total > 0 {
                ((done * 100) / total).clamp(0, 99) as u8
            } else {
                0
            };
            progress(pct, info.status.as_deref().unwrap_or("pulling"));
        }

        progress(100, "image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut labels: HashMap<String, String> =
            spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        labels.insert(PLATFORM_LABEL.to_string(), "true".to_string());

        let (exposed_ports, port_bindings) = build_port_maps(&spec.ports);

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(build_host_config(spec.cpu, spec.memory_mb, port_bindings)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(created.id)
    }

    async fn start(&self, container_ref: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(container_ref, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, container_ref: &str, grace_seconds: u32) -> RuntimeResult<()> {
        match self
            .docker
            .stop_container(
                container_ref,
                Some(StopContainerOptions {
                    t: grace_seconds as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(err) if is_status(&err, 304) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn restart(&self, container_ref: &str, grace_seconds: u32) -> RuntimeResult<()> {
        self.docker
            .restart_container(
                container_ref,
                Some(RestartContainerOptions {
                    t: grace_seconds as isize,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> RuntimeResult<()> {
        match self
            .docker
            .remove_container(
                container_ref,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_status(&err, 404) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn inspect(&self, container_ref: &str) -> RuntimeResult<Option<ContainerState>> {
        match self
            .docker
            .inspect_container(container_ref, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                Ok(Some(ContainerState {
                    status: state
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    running: state.running.unwrap_or(false),
                    exit_code: state.exit_code,
                }))
            }
            Err(err) if is_status(&err, 404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn stats(&self, container_ref: &str) -> RuntimeResult<Option<ContainerMetrics>> {
        let mut stream = self.docker.stats(
            container_ref,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(convert_stats(&stats))),
            Some(Err(err)) if is_status(&err, 404) => Ok(None),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    async fn stream_logs(
        &self,
        container_ref: &str,
        since_unix: i64,
    ) -> RuntimeResult<BoxStream<'static, LogEvent>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: since_unix,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(container_ref, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(output) => decode_log_output(output),
                    // The container went away; end the stream.
                    Err(_) => None,
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn get_logs(&self, container_ref: &str, tail: u32) -> RuntimeResult<Vec<LogEvent>> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_ref, Some(options));
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            if let Some(event) = decode_log_output(item?) {
                out.push(event);
            }
        }
        Ok(out)
    }

    async fn exec_batch(&self, container_ref: &str, argv: &[String]) -> RuntimeResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container_ref,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv.to_vec()),
                    ..Default::default()
                },
            )
            .await?;

        let mut combined = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(out) => {
                        combined.push_str(&String::from_utf8_lossy(out.into_bytes().as_ref()))
                    }
                    Err(_) => break,
                }
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code,
            output: combined,
        })
    }

    async fn exec_interactive(
        &self,
        container_ref: &str,
        cols: u16,
        rows: u16,
    ) -> RuntimeResult<TerminalSession> {
        let exec = self
            .docker
            .create_exec(
                container_ref,
                CreateExecOptions::<String> {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(vec!["/bin/sh".to_string()]),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(RuntimeError::Other(
                "exec unexpectedly started detached".to_string(),
            ));
        };

        let mut control = DockerTerminalControl {
            docker: self.docker.clone(),
            exec_id: exec.id,
            input,
        };
        control.resize(cols, rows).await?;

        let output = output
            .filter_map(|item| async move {
                item.ok().map(|chunk| chunk.into_bytes().to_vec())
            })
            .boxed();

        Ok(TerminalSession {
            output,
            control: Box::new(control),
        })
    }

    async fn list_owned(&self) -> RuntimeResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{PLATFORM_LABEL}=true")],
        );
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(summaries.into_iter().filter_map(|c| c.id).collect())
    }
}

struct DockerTerminalControl {
    docker: Docker,
    exec_id: String,
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
impl TerminalControl for DockerTerminalControl {
    async fn write_input(&mut self, data: &[u8]) -> RuntimeResult<()> {
        self.input
            .write_all(data)
            .await
            .map_err(|err| RuntimeError::Other(err.to_string()))?;
        self.input
            .flush()
            .await
            .map_err(|err| RuntimeError::Other(err.to_string()))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.input.shutdown().await;
    }
}

fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

fn cpu_quota_for(cpu: f64) -> i64 {
    (cpu * CPU_PERIOD_USEC as f64).floor() as i64
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;
type PortBindings = HashMap<String, Option<Vec<PortBinding>>>;

fn build_port_maps(ports: &[PortMapping]) -> (ExposedPorts, PortBindings) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for mapping in ports {
        let key = format!("{}/tcp", mapping.container);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(mapping.host.to_string()),
            }]),
        );
    }
    (exposed, bindings)
}

fn build_host_config(cpu: f64, memory_mb: i64, port_bindings: PortBindings) -> HostConfig {
    let memory = memory_mb * MIB;
    HostConfig {
        memory: Some(memory),
        // swap == memory: the container gets no swap headroom.
        memory_swap: Some(memory),
        cpu_period: Some(CPU_PERIOD_USEC),
        cpu_quota: Some(cpu_quota_for(cpu)),
        port_bindings: Some(port_bindings),
        cap_drop: Some(vec!["ALL".to_string()]),
        cap_add: Some(vec![
            "CHOWN".to_string(),
            "SETUID".to_string(),
            "SETGID".to_string(),
        ]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        network_mode: Some("bridge".to_string()),
        ..Default::default()
    }
}

fn decode_log_output(output: LogOutput) -> Option<LogEvent> {
    let (stream, bytes) = match output {
        LogOutput::StdOut { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        LogOutput::Console { message } => (LogStream::Stdout, message),
        LogOutput::StdIn { .. } => return None,
    };

    let raw = String::from_utf8_lossy(&bytes);
    let line = raw.trim_end_matches(['\r', '\n']);
    let (timestamp, text) = split_timestamp(line);
    Some(LogEvent {
        stream,
        text: text.to_string(),
        timestamp,
    })
}

/// Engine log lines arrive as `<rfc3339> <text>` when timestamps are on.
fn split_timestamp(line: &str) -> (DateTime<Utc>, &str) {
    if let Some((prefix, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
            return (ts.with_timezone(&Utc), rest);
        }
    }
    (Utc::now(), line)
}

fn convert_stats(stats: &Stats) -> ContainerMetrics {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    let cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
    let cpu_percent = if system_delta > 0 {
        (cpu_delta as f64 / system_delta as f64) * cpus as f64 * 100.0
    } else {
        0.0
    };

    let memory_usage = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        (memory_usage as f64 / memory_limit as f64) * 100.0
    } else {
        0.0
    };

    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |acc, net| {
                (acc.0 + net.rx_bytes, acc.1 + net.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    let (read, write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |acc, entry| {
                if entry.op.eq_ignore_ascii_case("read") {
                    (acc.0 + entry.value, acc.1)
                } else if entry.op.eq_ignore_ascii_case("write") {
                    (acc.0, acc.1 + entry.value)
                } else {
                    acc
                }
            })
        })
        .unwrap_or((0, 0));

    ContainerMetrics {
        cpu_percent,
        memory_usage_bytes: memory_usage,
        memory_limit_bytes: memory_limit,
        memory_percent,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        block_read_bytes: read,
        block_write_bytes: write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_is_floored_against_the_period() {
        assert_eq!(cpu_quota_for(1.0), 100_000);
        assert_eq!(cpu_quota_for(0.25), 25_000);
        assert_eq!(cpu_quota_for(2.5), 250_000);
        assert_eq!(cpu_quota_for(0.333), 33_300);
    }

    #[test]
    fn port_maps_cover_every_mapping() {
        let ports = vec![
            PortMapping {
                container: 80,
                host: 48080,
            },
            PortMapping {
                container: 443,
                host: 48443,
            },
        ];
        let (exposed, bindings) = build_port_maps(&ports);
        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("443/tcp"));
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("48080"));
    }

    #[test]
    fn host_config_enforces_security_profile() {
        let config = build_host_config(2.0, 512, HashMap::new());
        assert_eq!(config.memory, Some(512 * MIB));
        assert_eq!(config.memory_swap, config.memory);
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.cpu_quota, Some(200_000));
        assert_eq!(config.cap_drop.as_deref(), Some(&["ALL".to_string()][..]));
        let caps = config.cap_add.unwrap();
        assert_eq!(caps, vec!["CHOWN", "SETUID", "SETGID"]);
        assert_eq!(
            config.security_opt.as_deref(),
            Some(&["no-new-privileges:true".to_string()][..])
        );
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
        assert!(config.binds.is_none());
    }

    #[test]
    fn log_lines_split_their_timestamp_prefix() {
        let (ts, text) = split_timestamp("2026-01-02T03:04:05.000000000Z hello world");
        assert_eq!(text, "hello world");
        assert_eq!(ts.to_rfc3339(), "2026-01-02T03:04:05+00:00");

        let (_, text) = split_timestamp("no timestamp here");
        assert_eq!(text, "no timestamp here");
    }

    #[test]
    fn terminal_state_detection() {
        let exited = ContainerState {
            status: "exited".into(),
            running: false,
            exit_code: Some(0),
        };
        assert!(exited.is_terminal());
        let running = ContainerState {
            status: "running".into(),
            running: true,
            exit_code: None,
        };
        assert!(!running.is_terminal());
    }
}
