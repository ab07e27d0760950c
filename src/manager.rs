//! Dispatches invocations onto sandboxes.
//!
//! `SandboxManager` is `Send + Sync`. Every invocation gets a fresh isolate on
//! a dedicated OS thread, since V8 isolates are `!Send`. The host end of the
//! bridge (log forwarding, fetch serving, stream forwarding) runs as tasks on
//! the caller's tokio runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::bridge;
use crate::config::SandboxConfig;
use crate::deployment::Deployment;
use crate::error::{InvocationError, StartupError};
use crate::mocks::console::{forward_logs, LogSink, NoopLogSink};
use crate::mocks::fetch::{serve_fetches, HostFetch, HttpFetch};
use crate::mocks::stream::{forward_stream, StreamSink};
use crate::mocks::{Capabilities, Capability};
use crate::runtime::{run_invocation, Invocation, InvocationRequest, InvocationResponse};
use crate::snapshot::Snapshot;

/// Host callbacks for one invocation.
#[derive(Clone, Default)]
pub struct HostSinks {
    /// Console output. Absent means records are dropped.
    pub log: Option<Arc<dyn LogSink>>,
    /// Streamed response bytes. Absent means `streamResponse` is not installed
    /// and stream bodies are buffered.
    pub stream: Option<Arc<dyn StreamSink>>,
}

impl HostSinks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = Some(sink);
        self
    }

    pub fn with_stream(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(sink);
        self
    }
}

/// Counts a live sandbox for as long as it is held.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SandboxManager {
    snapshot: Arc<Snapshot>,
    config: SandboxConfig,
    capabilities: Capabilities,
    fetcher: Arc<dyn HostFetch>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl SandboxManager {
    /// Validates `config` and the embedded snapshot. Fetches go over HTTP
    /// under `config.fetch`.
    pub fn new(config: SandboxConfig) -> Result<Self, StartupError> {
        let fetcher = HttpFetch::new(config.fetch.clone()).map_err(StartupError::Fetch)?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    /// Like [`SandboxManager::new`] with a host-supplied fetch implementation.
    pub fn with_fetcher(config: SandboxConfig, fetcher: Arc<dyn HostFetch>) -> Result<Self, StartupError> {
        config.validate()?;
        let snapshot = Snapshot::embedded()?;
        tracing::info!(
            snapshot_bytes = snapshot.len(),
            max_concurrent = config.max_concurrent,
            timeout_ms = config.timeout_ms,
            "sandbox manager ready"
        );
        Ok(Self {
            snapshot,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            capabilities: Capabilities::default(),
            fetcher,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Restricts the capabilities every sandbox from this manager gets.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of sandboxes currently alive.
    pub fn active_sandboxes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs `code` for `deployment` against `request`, waiting for a free slot
    /// when `max_concurrent` sandboxes are already running.
    pub async fn invoke(
        &self,
        deployment: Arc<Deployment>,
        code: String,
        request: InvocationRequest,
        sinks: &HostSinks,
    ) -> Result<InvocationResponse, InvocationError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InvocationError::Internal(e.into()))?;
        self.dispatch(permit, deployment, code, request, sinks).await
    }

    /// Like [`SandboxManager::invoke`] but fails with
    /// [`InvocationError::ConcurrencyLimit`] instead of waiting.
    pub async fn try_invoke(
        &self,
        deployment: Arc<Deployment>,
        code: String,
        request: InvocationRequest,
        sinks: &HostSinks,
    ) -> Result<InvocationResponse, InvocationError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            InvocationError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;
        self.dispatch(permit, deployment, code, request, sinks).await
    }

    async fn dispatch(
        &self,
        permit: OwnedSemaphorePermit,
        deployment: Arc<Deployment>,
        code: String,
        request: InvocationRequest,
        sinks: &HostSinks,
    ) -> Result<InvocationResponse, InvocationError> {
        let deployment_id = deployment.deployment_id.clone();
        tracing::info!(deployment = %deployment_id, method = %request.method, url = %request.url, "invoke: starting");

        let capabilities = self.capabilities.for_stream_sink(sinks.stream.is_some());
        let (sandbox_end, host_end) = bridge::channel(capabilities.contains(Capability::StreamResponse));
        let expired = Arc::new(AtomicBool::new(false));
        let (disposed_tx, disposed_rx) = watch::channel(false);

        let mut host_tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);
        let log_sink = sinks.log.clone().unwrap_or_else(|| Arc::new(NoopLogSink));
        host_tasks.push(tokio::spawn(forward_logs(
            deployment_id.clone(),
            host_end.logs,
            log_sink,
            expired.clone(),
            disposed_rx.clone(),
        )));
        host_tasks.push(tokio::spawn(serve_fetches(
            deployment_id.clone(),
            self.fetcher.clone(),
            self.config.fetch.max_in_flight,
            host_end.fetches,
            disposed_rx.clone(),
        )));
        if let (Some(events), Some(sink)) = (host_end.stream, sinks.stream.clone()) {
            host_tasks.push(tokio::spawn(forward_stream(
                deployment.clone(),
                events,
                sink,
                host_end.stream_opened,
                expired.clone(),
                disposed_rx,
            )));
        }

        let invocation = Invocation {
            snapshot: self.snapshot.clone(),
            deployment,
            code,
            request,
            config: self.config.clone(),
            capabilities,
            bridge: sandbox_end,
            expired,
        };

        // V8 isolates are !Send - run everything on a dedicated thread
        let guard = ActiveGuard::new(&self.active);
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("edge-sandbox-{deployment_id}"))
            .spawn(move || {
                let result = run_invocation(invocation);
                // counters return to baseline before the caller sees the result
                drop(guard);
                drop(permit);
                if tx.send(result).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            });

        let result = match spawned {
            Ok(_) => rx
                .await
                .unwrap_or_else(|_| Err(InvocationError::Internal(anyhow::anyhow!("sandbox thread panicked")))),
            Err(e) => Err(InvocationError::Internal(e.into())),
        };

        let _ = disposed_tx.send(true);
        for task in host_tasks {
            let _ = task.await;
        }

        match &result {
            Ok(response) => tracing::info!(
                deployment = %deployment_id,
                status = response.status,
                streamed = response.streamed,
                "invoke: complete"
            ),
            Err(e) => tracing::warn!(deployment = %deployment_id, error = %e, "invoke: failed"),
        }
        result
    }
}
