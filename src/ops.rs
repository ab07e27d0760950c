//! Shared ops module - used by both build.rs (snapshot) and the runtime.
//!
//! The ops are the sandbox ends of the bridge channels. Each one copies its
//! arguments into owned Rust values before anything crosses to the host.

use crate::bridge::{FetchCall, FetchRequest, LogLevel, LogRecord, SandboxBridge, StreamEvent, StreamMessage};
use deno_core::error::{type_error, AnyError};
use deno_core::{op2, Extension, JsBuffer, OpState, ToJsBuffer};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// Console
// ============================================================================

/// Arguments arrive already converted to JSON values, so the record is a copy
/// taken at call time.
#[op2]
pub fn op_edge_log(
    state: &mut OpState,
    #[string] level: &str,
    #[serde] args: Vec<serde_json::Value>,
) {
    let level = LogLevel::parse(level).unwrap_or(LogLevel::Log);
    if let Some(bridge) = state.try_borrow_mut::<SandboxBridge>() {
        bridge.log(LogRecord { level, args });
    }
}

// ============================================================================
// Fetch
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchInit {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<JsBuffer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReply {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub body: ToJsBuffer,
}

#[op2(async)]
#[serde]
pub async fn op_edge_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] init: FetchInit,
) -> Result<FetchReply, AnyError> {
    let sender = {
        let state = state.borrow();
        match state.try_borrow::<SandboxBridge>() {
            Some(bridge) => bridge.fetch_sender(),
            None => return Err(type_error("fetch failed: network access is not available")),
        }
    };

    let request = FetchRequest {
        url: init.url,
        method: init.method,
        headers: init.headers,
        body: init.body.map(|body| body.to_vec()),
    };
    let (reply, response) = oneshot::channel();
    sender
        .send(FetchCall { request, reply })
        .map_err(|_| type_error("fetch failed: sandbox is shutting down"))?;

    match response.await {
        Ok(Ok(response)) => Ok(FetchReply {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            url: response.url,
            body: response.body.into(),
        }),
        Ok(Err(reason)) => Err(type_error(format!("fetch failed: {reason}"))),
        Err(_) => Err(type_error("fetch failed: sandbox is shutting down")),
    }
}

// ============================================================================
// Streaming response
// ============================================================================

#[op2(fast)]
pub fn op_edge_stream_open(state: &mut OpState) -> bool {
    state
        .try_borrow_mut::<SandboxBridge>()
        .map(|bridge| bridge.open_stream())
        .unwrap_or(false)
}

#[op2(async)]
pub async fn op_edge_stream_push(
    state: Rc<RefCell<OpState>>,
    #[buffer(copy)] chunk: Vec<u8>,
) -> Result<(), AnyError> {
    send_stream_event(state, StreamEvent::Chunk(chunk)).await
}

#[op2(async)]
pub async fn op_edge_stream_close(state: Rc<RefCell<OpState>>) -> Result<(), AnyError> {
    let finished = state
        .borrow()
        .try_borrow::<SandboxBridge>()
        .map(|bridge| bridge.stream_finished())
        .unwrap_or(false);
    if finished {
        return Ok(());
    }
    send_stream_event(state, StreamEvent::Done).await
}

/// Sends one event and waits for the host to acknowledge it, so the producer
/// never runs more than one element ahead of the sink.
async fn send_stream_event(state: Rc<RefCell<OpState>>, event: StreamEvent) -> Result<(), AnyError> {
    let sender = {
        let mut state = state.borrow_mut();
        let Some(bridge) = state.try_borrow_mut::<SandboxBridge>() else {
            return Err(type_error("streamResponse is not available"));
        };
        if !bridge.has_stream() {
            return Err(type_error("streamResponse is not available"));
        }
        match bridge.stream_sender_for(&event) {
            Some(sender) => sender,
            None => return Err(type_error("response stream is already closed")),
        }
    };

    let (ack, acked) = oneshot::channel();
    sender
        .send(StreamMessage { event, ack })
        .await
        .map_err(|_| type_error("response stream is closed"))?;
    acked.await.map_err(|_| type_error("response stream is closed"))
}

// ============================================================================
// Extension Definition
// ============================================================================

/// Sandboxes never get high resolution time.
pub struct CoarseTimers;

impl deno_web::TimersPermission for CoarseTimers {
    fn allow_hrtime(&mut self) -> bool {
        false
    }
}

deno_core::extension!(
    edge_runtime,
    deps = [deno_webidl, deno_console, deno_url, deno_web, deno_crypto],
    ops = [
        op_edge_log,
        op_edge_fetch,
        op_edge_stream_open,
        op_edge_stream_push,
        op_edge_stream_close,
    ],
    esm_entry_point = "ext:edge_runtime/bootstrap.js",
    esm = ["ext:edge_runtime/bootstrap.js" = "src/js/bootstrap.js"],
    state = |state| {
        state.put(CoarseTimers);
    },
);

/// The extension set, in dependency order. The snapshot is built with
/// `with_esm` set; sandboxes restored from it only register the ops.
pub fn extensions(with_esm: bool) -> Vec<Extension> {
    let blob_store = Arc::new(deno_web::BlobStore::default());
    if with_esm {
        vec![
            deno_webidl::deno_webidl::init_ops_and_esm(),
            deno_console::deno_console::init_ops_and_esm(),
            deno_url::deno_url::init_ops_and_esm(),
            deno_web::deno_web::init_ops_and_esm::<CoarseTimers>(blob_store, None),
            deno_crypto::deno_crypto::init_ops_and_esm(None),
            edge_runtime::init_ops_and_esm(),
        ]
    } else {
        vec![
            deno_webidl::deno_webidl::init_ops(),
            deno_console::deno_console::init_ops(),
            deno_url::deno_url::init_ops(),
            deno_web::deno_web::init_ops::<CoarseTimers>(blob_store, None),
            deno_crypto::deno_crypto::init_ops(None),
            edge_runtime::init_ops(),
        ]
    }
}
