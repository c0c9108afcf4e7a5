//! Service Supervisor: lifecycle management for the local model backends.
//!
//! Each backend (text LLM, vision-language model, TTS) is tracked by one
//! uniform state machine: `stopped -> starting -> running -> stopping ->
//! stopped`, with `error` reachable from `starting`/`running`. Every
//! transition is emitted on the shared event bus; output lines of owned
//! processes are emitted as `service.log` events.

pub mod descriptor;
pub mod process;

pub use descriptor::{ServiceDescriptor, ServiceKind};

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::config::ServicesConfig;
use crate::error::{Error, Result};
use crate::protocol::{ServerEvent, ServiceStatus};
use process::{ManagedProcess, OutputLine};

/// Deadline for one-shot health/model probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the exit monitor checks an owned process.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Dynamic state of one supervised backend.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub detail: Option<String>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
}

impl ServiceState {
    fn new(kind: ServiceKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            status: ServiceStatus::Stopped,
            pid: None,
            detail: None,
            last_exit_code: None,
            last_error: None,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::ServiceStatus {
            name: self.name.clone(),
            status: self.status,
            detail: self.detail.clone(),
            pid: self.pid,
            last_exit_code: self.last_exit_code,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Supervisor over all configured backends.
pub struct ServiceSupervisor {
    descriptors: HashMap<ServiceKind, ServiceDescriptor>,
    states: RwLock<HashMap<ServiceKind, ServiceState>>,
    processes: Mutex<HashMap<ServiceKind, ManagedProcess>>,
    events: broadcast::Sender<ServerEvent>,
    http: reqwest::Client,
    workspace_root: Option<PathBuf>,
}

impl ServiceSupervisor {
    pub fn new(
        services: &ServicesConfig,
        workspace_root: Option<PathBuf>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Result<Self> {
        let mut descriptors = HashMap::new();
        let mut states = HashMap::new();
        for descriptor in ServiceDescriptor::resolve_all(services) {
            states.insert(descriptor.kind, ServiceState::new(descriptor.kind));
            descriptors.insert(descriptor.kind, descriptor);
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            descriptors,
            states: RwLock::new(states),
            processes: Mutex::new(HashMap::new()),
            events,
            http,
            workspace_root,
        })
    }

    pub fn descriptor(&self, kind: ServiceKind) -> Result<&ServiceDescriptor> {
        self.descriptors
            .get(&kind)
            .ok_or_else(|| Error::Service(format!("unknown service: {kind}")))
    }

    pub async fn status(&self, kind: ServiceKind) -> Option<ServiceState> {
        self.states.read().await.get(&kind).cloned()
    }

    /// All backend states, in stable order.
    pub async fn all_statuses(&self) -> Vec<ServiceState> {
        let states = self.states.read().await;
        ServiceKind::ALL
            .iter()
            .filter_map(|kind| states.get(kind).cloned())
            .collect()
    }

    /// Short-timeout probe of the backend's health endpoint.
    pub async fn is_healthy(&self, kind: ServiceKind) -> bool {
        match self.descriptor(kind) {
            Ok(descriptor) => self.probe_health(descriptor).await,
            Err(_) => false,
        }
    }

    /// Whether a `start()` attempt makes sense right now.
    pub async fn can_start(&self, kind: ServiceKind) -> bool {
        let Ok(descriptor) = self.descriptor(kind) else {
            return false;
        };
        if descriptor.command.is_empty() {
            return false;
        }
        !matches!(
            self.status(kind).await.map(|s| s.status),
            Some(ServiceStatus::Starting) | Some(ServiceStatus::Stopping)
        )
    }

    /// Start one backend. No-op when already running or starting. When the
    /// health endpoint is already answering, the backend is adopted as
    /// external with no owned process.
    pub async fn start(self: &Arc<Self>, kind: ServiceKind) -> Result<()> {
        let descriptor = self.descriptor(kind)?.clone();

        // Single-flight guard: claim the starting slot under the write lock.
        let starting_event = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(&kind) else {
                return Err(Error::Service(format!("unknown service: {kind}")));
            };
            match state.status {
                ServiceStatus::Running | ServiceStatus::Starting => return Ok(()),
                ServiceStatus::Stopping => {
                    return Err(Error::Service(format!("{kind} is still stopping")))
                }
                ServiceStatus::Stopped | ServiceStatus::Error => {
                    state.status = ServiceStatus::Starting;
                    state.pid = None;
                    state.detail = None;
                    state.to_event()
                }
            }
        };
        self.emit(starting_event);
        tracing::info!(service = %kind, "starting backend");

        // Someone else is already serving the port: adopt without owning.
        if self.probe_health(&descriptor).await {
            let detail = match self.probe_model(&descriptor).await {
                Some(model) => format!("external, model={model}"),
                None => "external".to_string(),
            };
            self.transition(kind, |s| {
                s.status = ServiceStatus::Running;
                s.pid = None;
                s.detail = Some(detail);
                s.last_error = None;
                s.last_exit_code = None;
            })
            .await;
            tracing::info!(service = %kind, "adopted external backend");
            return Ok(());
        }

        let spawned = ManagedProcess::spawn(&descriptor.command, self.workspace_root.as_deref());
        let (process, output) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                let msg = e.to_string();
                self.transition(kind, |s| {
                    s.status = ServiceStatus::Error;
                    s.last_error = Some(msg.clone());
                })
                .await;
                let _ = self.stop(kind).await;
                return Err(Error::Service(format!("{kind} failed to start: {msg}")));
            }
        };
        let pid = process.pid();
        self.processes.lock().await.insert(kind, process);
        self.transition(kind, |s| s.pid = pid).await;
        self.spawn_log_pump(kind, output);
        self.spawn_exit_monitor(kind);

        match self.wait_for_ready(kind, &descriptor).await {
            Ok(()) => {
                let detail = self.probe_model(&descriptor).await.map(|m| format!("model={m}"));
                self.transition(kind, |s| {
                    s.status = ServiceStatus::Running;
                    s.detail = detail;
                    s.last_error = None;
                    s.last_exit_code = None;
                })
                .await;
                tracing::info!(service = %kind, pid, "backend ready");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                tracing::warn!(service = %kind, error = %msg, "backend failed to become ready");
                // Only force the error transition when the start is still ours;
                // a concurrent stop() already moved the state machine on.
                let current = self.status(kind).await.map(|s| s.status);
                if current == Some(ServiceStatus::Starting) {
                    self.transition(kind, |s| {
                        s.status = ServiceStatus::Error;
                        s.last_error = Some(msg);
                    })
                    .await;
                    let _ = self.stop(kind).await;
                }
                Err(e)
            }
        }
    }

    /// Stop one backend. No-op when no process is owned (externals included).
    pub async fn stop(&self, kind: ServiceKind) -> Result<()> {
        let process = self.processes.lock().await.remove(&kind);
        let Some(process) = process else {
            tracing::debug!(service = %kind, "stop: no owned process");
            return Ok(());
        };
        let grace = self.descriptor(kind)?.grace_period;

        self.transition(kind, |s| s.status = ServiceStatus::Stopping).await;
        tracing::info!(service = %kind, pid = process.pid(), "stopping backend");

        let result = process.shutdown(grace).await;
        let exit_code = match &result {
            Ok(Some(status)) => status.code(),
            _ => None,
        };
        self.transition(kind, |s| {
            s.status = ServiceStatus::Stopped;
            s.pid = None;
            s.detail = None;
            if exit_code.is_some() {
                s.last_exit_code = exit_code;
            }
        })
        .await;
        result.map(|_| ())
    }

    /// Probe health; when unhealthy and the backend opts into auto-start,
    /// attempt one start. Returns whether the backend ended up healthy.
    pub async fn ensure_healthy(self: &Arc<Self>, kind: ServiceKind) -> bool {
        if self.is_healthy(kind).await {
            return true;
        }
        let auto_start = self
            .descriptor(kind)
            .map(|d| d.auto_start)
            .unwrap_or(false);
        if !auto_start || !self.can_start(kind).await {
            return false;
        }
        match self.start(kind).await {
            Ok(()) => self.is_healthy(kind).await,
            Err(e) => {
                tracing::warn!(service = %kind, error = %e, "auto-start failed");
                false
            }
        }
    }

    /// Start every backend whose descriptor opts into auto-start. Runs once
    /// at process startup; failures are logged, not fatal.
    pub async fn auto_start_if_configured(self: Arc<Self>) {
        for kind in ServiceKind::ALL {
            let auto_start = self
                .descriptor(kind)
                .map(|d| d.auto_start)
                .unwrap_or(false);
            if !auto_start {
                continue;
            }
            if let Err(e) = self.start(kind).await {
                tracing::warn!(service = %kind, error = %e, "auto-start failed");
            }
        }
    }

    /// Tear down every owned process. Used at shutdown.
    pub async fn stop_all(&self) {
        for kind in ServiceKind::ALL {
            if let Err(e) = self.stop(kind).await {
                tracing::warn!(service = %kind, error = %e, "stop failed");
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn wait_for_ready(&self, kind: ServiceKind, descriptor: &ServiceDescriptor) -> Result<()> {
        let deadline = Instant::now() + descriptor.ready_timeout;
        loop {
            if self.probe_health(descriptor).await {
                return Ok(());
            }
            // The exit monitor moves the state off `starting` when the
            // process dies underneath us.
            if self.status(kind).await.map(|s| s.status) != Some(ServiceStatus::Starting) {
                return Err(Error::Service(format!("{kind} exited during startup")));
            }
            if Instant::now() >= deadline {
                return Err(Error::Service(format!(
                    "{kind} not ready after {}ms",
                    descriptor.ready_timeout.as_millis()
                )));
            }
            tokio::time::sleep(descriptor.poll_interval).await;
        }
    }

    async fn probe_health(&self, descriptor: &ServiceDescriptor) -> bool {
        match self
            .http
            .get(descriptor.health_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Best-effort model id from `/v1/models` for backends that report one.
    async fn probe_model(&self, descriptor: &ServiceDescriptor) -> Option<String> {
        let url = descriptor.models_url()?;
        let resp = self
            .http
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: ModelsResponse = resp.json().await.ok()?;
        parsed.data.into_iter().next().map(|m| m.id)
    }

    fn spawn_log_pump(
        self: &Arc<Self>,
        kind: ServiceKind,
        mut output: mpsc::UnboundedReceiver<OutputLine>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(OutputLine { stream, line }) = output.recv().await {
                tracing::debug!(service = %kind, stream = stream.as_str(), "{line}");
                supervisor.emit(ServerEvent::ServiceLog {
                    name: kind.as_str().to_string(),
                    stream,
                    line,
                });
            }
        });
    }

    fn spawn_exit_monitor(self: &Arc<Self>, kind: ServiceKind) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                let exited = {
                    let mut processes = supervisor.processes.lock().await;
                    let Some(process) = processes.get_mut(&kind) else {
                        // stop() took ownership; nothing left to watch.
                        break;
                    };
                    match process.try_wait() {
                        Ok(Some(status)) => {
                            processes.remove(&kind);
                            Some(status)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            tracing::warn!(service = %kind, error = %e, "exit probe failed");
                            break;
                        }
                    }
                };
                if let Some(status) = exited {
                    supervisor.handle_unsolicited_exit(kind, status).await;
                    break;
                }
            }
        });
    }

    async fn handle_unsolicited_exit(&self, kind: ServiceKind, status: ExitStatus) {
        let code = status.code();
        let current = self.status(kind).await.map(|s| s.status);
        match current {
            Some(ServiceStatus::Stopping) | Some(ServiceStatus::Stopped) => {
                // Expected during teardown.
                self.transition(kind, |s| {
                    s.status = ServiceStatus::Stopped;
                    s.pid = None;
                    s.last_exit_code = code;
                })
                .await;
            }
            Some(ServiceStatus::Starting) => {
                tracing::warn!(service = %kind, ?code, "backend exited during startup");
                self.transition(kind, |s| {
                    s.status = ServiceStatus::Error;
                    s.pid = None;
                    s.last_exit_code = code;
                    s.last_error = Some(format!("exited during startup ({})", format_exit(status)));
                })
                .await;
            }
            _ => {
                tracing::warn!(service = %kind, ?code, "backend exited unexpectedly");
                self.transition(kind, |s| {
                    s.status = ServiceStatus::Stopped;
                    s.pid = None;
                    s.last_exit_code = code;
                    s.last_error = Some(format!("exited unexpectedly ({})", format_exit(status)));
                })
                .await;
            }
        }
    }

    async fn transition<F>(&self, kind: ServiceKind, f: F)
    where
        F: FnOnce(&mut ServiceState),
    {
        let event = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(&kind) else {
                return;
            };
            f(state);
            state.to_event()
        };
        self.emit(event);
    }

    fn emit(&self, event: ServerEvent) {
        // No receivers is fine; events are best-effort fan-out.
        let _ = self.events.send(event);
    }
}

fn format_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Health stub that fails the first `fail_first` requests, then succeeds.
    async fn spawn_health_stub(fail_first: usize) -> u16 {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/health",
            get(move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < fail_first {
                        axum::http::StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        axum::http::StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    /// A port nothing listens on.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn supervisor_with_llm(
        llm: ServiceConfig,
    ) -> (Arc<ServiceSupervisor>, broadcast::Receiver<ServerEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let services = ServicesConfig {
            llm,
            ..Default::default()
        };
        let supervisor = Arc::new(ServiceSupervisor::new(&services, None, tx).unwrap());
        (supervisor, rx)
    }

    fn fast_config(port: u16, command: &str) -> ServiceConfig {
        ServiceConfig {
            port: Some(port),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            ready_timeout_ms: Some(400),
            poll_interval_ms: Some(50),
            grace_period_ms: Some(1000),
            ..Default::default()
        }
    }

    async fn wait_for_status(
        supervisor: &Arc<ServiceSupervisor>,
        kind: ServiceKind,
        wanted: ServiceStatus,
    ) -> ServiceState {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = supervisor.status(kind).await.unwrap();
            if state.status == wanted {
                return state;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {wanted}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_statuses() {
        let (supervisor, _rx) = supervisor_with_llm(ServiceConfig::default());
        let all = supervisor.all_statuses().await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|s| s.status == ServiceStatus::Stopped));
        assert_eq!(all[0].name, "llm");
        assert_eq!(all[1].name, "vlm");
        assert_eq!(all[2].name, "tts");
    }

    #[tokio::test]
    async fn test_adopts_external_backend() {
        let port = spawn_health_stub(0).await;
        let (supervisor, _rx) = supervisor_with_llm(fast_config(port, "sleep 30"));

        supervisor.start(ServiceKind::Llm).await.unwrap();

        let state = supervisor.status(ServiceKind::Llm).await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert!(state.detail.as_deref().unwrap_or("").contains("external"));
        assert!(state.pid.is_none());
        assert!(supervisor.processes.lock().await.is_empty());

        // stop() is a no-op for externals
        supervisor.stop(ServiceKind::Llm).await.unwrap();
        let state = supervisor.status(ServiceKind::Llm).await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_double_start_spawns_one_process() {
        let port = dead_port();
        let (supervisor, mut rx) =
            supervisor_with_llm(fast_config(port, "echo spawned; sleep 30"));

        let (a, b) = tokio::join!(
            supervisor.start(ServiceKind::Llm),
            supervisor.start(ServiceKind::Llm)
        );
        // One attempt times out against the dead port, the other is a no-op.
        assert!(a.is_err() != b.is_err(), "exactly one start should fail");

        let mut spawned_lines = 0;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::ServiceLog { line, .. } = event {
                if line == "spawned" {
                    spawned_lines += 1;
                }
            }
        }
        assert_eq!(spawned_lines, 1);
    }

    #[tokio::test]
    async fn test_never_healthy_resolves_to_error() {
        let port = dead_port();
        let (supervisor, mut rx) = supervisor_with_llm(fast_config(port, "sleep 30"));

        let started = Instant::now();
        let err = supervisor.start(ServiceKind::Llm).await.unwrap_err();
        assert!(matches!(err, Error::Service(_)));
        // 400ms readiness budget plus scheduling slack
        assert!(started.elapsed() < Duration::from_secs(3));

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::ServiceStatus { status, .. } = event {
                if status == ServiceStatus::Error {
                    saw_error = true;
                }
            }
        }
        assert!(saw_error);

        // Implicit stop reaped the process.
        let state = wait_for_status(&supervisor, ServiceKind::Llm, ServiceStatus::Stopped).await;
        assert!(state.last_error.as_deref().unwrap_or("").contains("not ready"));
        assert!(supervisor.processes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_exit_marks_stopped_with_error() {
        // First probe fails so the supervisor spawns; later probes succeed.
        let port = spawn_health_stub(1).await;
        let (supervisor, _rx) = supervisor_with_llm(fast_config(port, "sleep 1"));

        supervisor.start(ServiceKind::Llm).await.unwrap();
        let state = supervisor.status(ServiceKind::Llm).await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert!(state.pid.is_some());

        let state =
            wait_for_status(&supervisor, ServiceKind::Llm, ServiceStatus::Stopped).await;
        assert_eq!(state.last_exit_code, Some(0));
        assert!(state
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("unexpectedly"));
    }

    #[tokio::test]
    async fn test_stop_terminates_owned_process() {
        let port = spawn_health_stub(1).await;
        let (supervisor, _rx) = supervisor_with_llm(fast_config(port, "sleep 30"));

        supervisor.start(ServiceKind::Llm).await.unwrap();
        assert_eq!(supervisor.processes.lock().await.len(), 1);

        supervisor.stop(ServiceKind::Llm).await.unwrap();
        let state = supervisor.status(ServiceKind::Llm).await.unwrap();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert!(state.pid.is_none());
        assert!(supervisor.processes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_can_start_and_is_healthy() {
        let port = spawn_health_stub(0).await;
        let (supervisor, _rx) = supervisor_with_llm(fast_config(port, "sleep 30"));

        assert!(supervisor.can_start(ServiceKind::Llm).await);
        assert!(supervisor.is_healthy(ServiceKind::Llm).await);
        assert!(!supervisor.is_healthy(ServiceKind::Vlm).await);
    }
}
