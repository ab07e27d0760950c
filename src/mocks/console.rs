//! Host side of the logging facade.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::bridge::{LogLevel, LogRecord};
use crate::sanitize::clamp_log_value;

/// Receives console output from deployments.
///
/// Called from a host task, never from inside the isolate. Records for one
/// invocation arrive in the order the sandbox produced them.
pub trait LogSink: Send + Sync {
    fn on_deployment_log(&self, deployment_id: &str, level: LogLevel, args: Vec<Value>);
}

/// Drops every record. Used when the host supplies no log sink.
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn on_deployment_log(&self, _deployment_id: &str, _level: LogLevel, _args: Vec<Value>) {}
}

/// Drains `logs` into `sink` until the sandbox is disposed. Records that
/// arrive after the invocation expired are dropped.
pub(crate) async fn forward_logs(
    deployment_id: String,
    mut logs: mpsc::Receiver<LogRecord>,
    sink: Arc<dyn LogSink>,
    expired: Arc<AtomicBool>,
    mut disposed: watch::Receiver<bool>,
) {
    let deliver = |record: LogRecord| {
        if expired.load(Ordering::SeqCst) {
            return;
        }
        let args = record.args.into_iter().map(clamp_log_value).collect();
        sink.on_deployment_log(&deployment_id, record.level, args);
    };

    loop {
        tokio::select! {
            biased;
            record = logs.recv() => match record {
                Some(record) => deliver(record),
                None => break,
            },
            _ = disposed.wait_for(|d| *d) => {
                while let Ok(record) = logs.try_recv() {
                    deliver(record);
                }
                break;
            }
        }
    }
}
