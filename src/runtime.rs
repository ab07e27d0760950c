//! Sandbox lifecycle - one V8 isolate per invocation.
//!
//! `Created → Initialized → Executing → Settled → Disposed`
//!
//! A sandbox is restored from the shared snapshot, locked down, given its
//! capability mocks, runs the deployment's handler once and is dropped. It
//! must stay on the thread that created it.

use deno_core::{serde_v8, v8, JsBuffer, JsRuntime, ModuleId, PollEventLoopOptions, RuntimeOptions, ToJsBuffer};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::task::Poll;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bridge::SandboxBridge;
use crate::config::SandboxConfig;
use crate::deployment::Deployment;
use crate::error::{InvocationError, ResourceLimit};
use crate::loader::DeploymentLoader;
use crate::mocks::Capabilities;
use crate::ops;
use crate::sanitize::sanitize_error_message;
use crate::snapshot::Snapshot;

/// Headroom granted past the heap limit so V8 can unwind after termination.
const HEAP_GRACE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Initialized,
    Executing,
    Settled,
    Disposed,
}

/// The request handed to a deployment's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl InvocationRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: vec![],
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What the handler's `Response` resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    /// Empty when the body went to the stream sink.
    pub body: Vec<u8>,
    pub streamed: bool,
}

impl InvocationResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Serialize)]
struct RequestInit<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a [(String, String)],
    body: Option<ToJsBuffer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeOutcome {
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: Option<JsBuffer>,
    #[serde(default)]
    streamed: bool,
}

fn init_error(e: impl std::fmt::Display) -> InvocationError {
    InvocationError::Init {
        message: sanitize_error_message(&e.to_string()),
    }
}

/// One isolate bound to one deployment for one invocation.
pub struct Sandbox {
    // handles into the isolate are declared before it so they drop first
    invoke_fn: Option<v8::Global<v8::Function>>,
    runtime: JsRuntime,
    deployment: Arc<Deployment>,
    state: SandboxState,
    heap_exceeded: Arc<AtomicBool>,
    max_heap_size: usize,
}

impl Sandbox {
    /// Restores an isolate from `snapshot` with `code` as its only loadable
    /// module and `bridge` as its only way out.
    pub fn create(
        snapshot: &Snapshot,
        deployment: Arc<Deployment>,
        code: String,
        config: &SandboxConfig,
        bridge: SandboxBridge,
    ) -> Result<Self, InvocationError> {
        crate::snapshot::restrict_code_generation();
        let loader = DeploymentLoader::new(&deployment.module_specifier(), code).map_err(init_error)?;
        let create_params = v8::Isolate::create_params().heap_limits(0, config.max_heap_size);

        let mut runtime = JsRuntime::new(RuntimeOptions {
            startup_snapshot: Some(snapshot.blob()),
            extensions: ops::extensions(false),
            module_loader: Some(Rc::new(loader)),
            create_params: Some(create_params),
            ..Default::default()
        });

        let heap_exceeded = Arc::new(AtomicBool::new(false));
        let flag = heap_exceeded.clone();
        let handle = runtime.v8_isolate().thread_safe_handle();
        let deployment_id = deployment.deployment_id.clone();
        runtime.add_near_heap_limit_callback(move |current, initial| {
            if !flag.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    deployment = %deployment_id,
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "heap limit reached, terminating sandbox"
                );
                handle.terminate_execution();
            }
            current + HEAP_GRACE
        });

        runtime.op_state().borrow_mut().put(bridge);

        tracing::debug!(deployment = %deployment.deployment_id, "sandbox created");
        Ok(Self {
            invoke_fn: None,
            runtime,
            deployment,
            state: SandboxState::Created,
            heap_exceeded,
            max_heap_size: config.max_heap_size,
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub(crate) fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    pub(crate) fn heap_exceeded(&self) -> bool {
        self.heap_exceeded.load(Ordering::SeqCst)
    }

    pub(crate) fn heap_limit(&self) -> ResourceLimit {
        ResourceLimit::Heap(self.max_heap_size)
    }

    /// Binds `global`, disables code generation from strings, installs the
    /// allowed capabilities and detaches the host internals.
    pub fn initialize(&mut self, capabilities: &Capabilities) -> Result<(), InvocationError> {
        debug_assert_eq!(self.state, SandboxState::Created);

        self.runtime
            .execute_script("[edge:lockdown]", "__edgeInternals.lockDown();")
            .map_err(init_error)?;

        for capability in capabilities.iter() {
            let script = capability.install_script(&self.deployment);
            self.runtime
                .execute_script(capability.script_name(), script)
                .map_err(|e| InvocationError::Init {
                    message: format!(
                        "failed to install {}: {}",
                        capability.name(),
                        sanitize_error_message(&e.to_string())
                    ),
                })?;
        }

        let invoke = self
            .runtime
            .execute_script("[edge:seal]", "__edgeInternals.seal()")
            .map_err(init_error)?;
        let invoke_fn = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, invoke);
            let function = v8::Local::<v8::Function>::try_from(local)
                .map_err(|_| init_error("sandbox invoker is not a function"))?;
            v8::Global::new(scope, function)
        };
        self.invoke_fn = Some(invoke_fn);

        self.state = SandboxState::Initialized;
        tracing::debug!(deployment = %self.deployment.deployment_id, "sandbox initialized");
        Ok(())
    }

    /// Evaluates the deployment module and calls `entry_export` with `request`.
    ///
    /// With `streaming` set, a `ReadableStream` body is pushed to the stream
    /// sink and this returns once the stream has finished.
    pub async fn execute(
        &mut self,
        request: &InvocationRequest,
        entry_export: &str,
        streaming: bool,
    ) -> Result<InvocationResponse, InvocationError> {
        let invoke_fn = self
            .invoke_fn
            .clone()
            .ok_or_else(|| InvocationError::Internal(anyhow::anyhow!("sandbox is not initialized")))?;
        self.state = SandboxState::Executing;

        let specifier = deno_core::ModuleSpecifier::parse(&self.deployment.module_specifier()).map_err(init_error)?;
        let module_id = self.runtime.load_main_es_module(&specifier).await.map_err(init_error)?;
        let evaluation = self.runtime.mod_evaluate(module_id);
        self.runtime
            .with_event_loop_future(Box::pin(evaluation), PollEventLoopOptions::default())
            .await
            .map_err(init_error)?;

        let args = self.invoke_args(module_id, request, entry_export, streaming)?;
        let call = self.runtime.call_with_args(&invoke_fn, &args);
        let result = self
            .runtime
            .with_event_loop_promise(Box::pin(call), PollEventLoopOptions::default())
            .await
            .map_err(|e| InvocationError::Handler {
                message: sanitize_error_message(&e.to_string()),
            })?;

        let outcome: InvokeOutcome = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, result);
            serde_v8::from_v8(scope, local).map_err(|e| InvocationError::Internal(e.into()))?
        };

        let response = match outcome.kind.as_str() {
            "response" => InvocationResponse {
                status: outcome.status,
                status_text: outcome.status_text,
                headers: outcome.headers,
                body: outcome.body.map(|b| b.to_vec()).unwrap_or_default(),
                streamed: outcome.streamed,
            },
            "init" => return Err(init_error(outcome.message.unwrap_or_default())),
            "request" => {
                return Err(InvocationError::Request {
                    message: sanitize_error_message(&outcome.message.unwrap_or_default()),
                })
            }
            _ => {
                return Err(InvocationError::Handler {
                    message: sanitize_error_message(&outcome.message.unwrap_or_default()),
                })
            }
        };

        // a claimed stream is finished even when it is not the response body
        if response.streamed || self.stream_pending() {
            self.finish_stream().await.map_err(|e| InvocationError::Handler {
                message: sanitize_error_message(&e.to_string()),
            })?;
        }
        Ok(response)
    }

    fn invoke_args(
        &mut self,
        module_id: ModuleId,
        request: &InvocationRequest,
        entry_export: &str,
        streaming: bool,
    ) -> Result<Vec<v8::Global<v8::Value>>, InvocationError> {
        let namespace = self.runtime.get_module_namespace(module_id).map_err(init_error)?;
        let scope = &mut self.runtime.handle_scope();

        let namespace: v8::Local<v8::Value> = v8::Local::new(scope, namespace).into();
        let export: v8::Local<v8::Value> = v8::String::new(scope, entry_export)
            .ok_or_else(|| init_error("entry export name is too long"))?
            .into();
        let init = RequestInit {
            method: &request.method,
            url: &request.url,
            headers: &request.headers,
            body: request.body.clone().map(Into::into),
        };
        let init = serde_v8::to_v8(scope, init).map_err(|e| InvocationError::Internal(e.into()))?;
        let streaming: v8::Local<v8::Value> = v8::Boolean::new(scope, streaming).into();

        Ok([namespace, export, init, streaming]
            .into_iter()
            .map(|value| v8::Global::new(scope, value))
            .collect())
    }

    pub(crate) fn dropped_logs(&mut self) -> usize {
        self.runtime
            .op_state()
            .borrow()
            .try_borrow::<SandboxBridge>()
            .map_or(0, |bridge| bridge.dropped_logs())
    }

    fn stream_pending(&mut self) -> bool {
        self.runtime
            .op_state()
            .borrow()
            .try_borrow::<SandboxBridge>()
            .is_some_and(|bridge| bridge.stream_pending())
    }

    fn stream_finished(&mut self) -> bool {
        self.runtime
            .op_state()
            .borrow()
            .try_borrow::<SandboxBridge>()
            .map(|bridge| bridge.stream_finished())
            .unwrap_or(true)
    }

    /// Drives the event loop until the response stream has been closed or
    /// nothing is left that could close it.
    async fn finish_stream(&mut self) -> Result<(), anyhow::Error> {
        std::future::poll_fn(|cx| {
            if self.stream_finished() {
                return Poll::Ready(Ok(()));
            }
            match self.runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
                Poll::Ready(result) => Poll::Ready(result.map_err(Into::into)),
                Poll::Pending if self.stream_finished() => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    pub(crate) fn settle(&mut self) {
        self.state = SandboxState::Settled;
    }

    /// Tears the isolate down. Every channel end the sandbox held closes here.
    pub fn dispose(mut self) -> SandboxState {
        self.invoke_fn = None;
        let deployment_id = self.deployment.deployment_id.clone();
        let from = self.state();
        drop(self.runtime);
        tracing::debug!(deployment = %deployment_id, ?from, "sandbox disposed");
        SandboxState::Disposed
    }
}

/// Terminates an isolate once the wall-clock budget runs out. Dropping the
/// watchdog cancels it.
pub(crate) struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn start(
        handle: v8::IsolateHandle,
        limit: Duration,
        expired: Arc<AtomicBool>,
        deployment_id: String,
    ) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("edge-watchdog".into())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(limit) {
                    expired.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        deployment = %deployment_id,
                        timeout_ms = limit.as_millis() as u64,
                        "invocation timed out, terminating sandbox"
                    );
                    handle.terminate_execution();
                }
            })?;
        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Everything one sandbox thread needs.
pub(crate) struct Invocation {
    pub snapshot: Arc<Snapshot>,
    pub deployment: Arc<Deployment>,
    pub code: String,
    pub request: InvocationRequest,
    pub config: SandboxConfig,
    pub capabilities: Capabilities,
    pub bridge: SandboxBridge,
    pub expired: Arc<AtomicBool>,
}

/// Runs one invocation to completion on the current thread. The sandbox is
/// disposed before this returns, whatever the outcome.
pub(crate) fn run_invocation(invocation: Invocation) -> Result<InvocationResponse, InvocationError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| InvocationError::Internal(e.into()))?;
    rt.block_on(run_sandbox(invocation))
}

async fn run_sandbox(invocation: Invocation) -> Result<InvocationResponse, InvocationError> {
    let Invocation {
        snapshot,
        deployment,
        code,
        request,
        config,
        capabilities,
        bridge,
        expired,
    } = invocation;
    let deployment_id = deployment.deployment_id.clone();
    let streaming = capabilities.contains(crate::mocks::Capability::StreamResponse);
    let limit = config.timeout();

    let mut sandbox = Sandbox::create(&snapshot, deployment, code, &config, bridge)?;
    let watchdog = Watchdog::start(sandbox.isolate_handle(), limit, expired.clone(), deployment_id.clone())
        .map_err(|e| InvocationError::Internal(e.into()));
    let watchdog = match watchdog {
        Ok(watchdog) => watchdog,
        Err(e) => {
            sandbox.dispose();
            return Err(e);
        }
    };

    let result = tokio::time::timeout(limit, async {
        sandbox.initialize(&capabilities)?;
        sandbox.execute(&request, &config.entry_export, streaming).await
    })
    .await;
    drop(watchdog);
    sandbox.settle();

    let outcome = if sandbox.heap_exceeded() {
        expired.store(true, Ordering::SeqCst);
        Err(InvocationError::Timeout {
            limit: sandbox.heap_limit(),
        })
    } else {
        match result {
            Err(_elapsed) => {
                expired.store(true, Ordering::SeqCst);
                Err(InvocationError::Timeout {
                    limit: ResourceLimit::WallClock(config.timeout_ms),
                })
            }
            Ok(_) if expired.load(Ordering::SeqCst) => Err(InvocationError::Timeout {
                limit: ResourceLimit::WallClock(config.timeout_ms),
            }),
            Ok(result) => result,
        }
    };

    match &outcome {
        Ok(response) => tracing::debug!(
            deployment = %deployment_id,
            status = response.status,
            streamed = response.streamed,
            "sandbox settled"
        ),
        Err(e) => tracing::debug!(deployment = %deployment_id, error = %e, "sandbox settled with error"),
    }

    let dropped = sandbox.dropped_logs();
    if dropped > 0 {
        tracing::warn!(deployment = %deployment_id, dropped, "log records dropped, host sink fell behind");
    }

    sandbox.dispose();
    outcome
}
