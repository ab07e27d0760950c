//! Channels between a sandbox and the host.
//!
//! Every capability that crosses the sandbox boundary is a message on one of
//! these channels. The sandbox end lives in the isolate's `OpState`; the host
//! end is drained by handler tasks owned by the manager. Payloads are owned
//! Rust values, so nothing the sandbox holds can alias host memory.
//!
//! Shared with `build.rs`, so only `serde` and `tokio::sync` are available here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Error,
    Info,
    Warn,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Log,
        LogLevel::Error,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Debug => "debug",
        }
    }

    pub fn parse(level: &str) -> Option<LogLevel> {
        LogLevel::ALL.into_iter().find(|l| l.as_str() == level)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One console call, with its arguments already copied out of the isolate.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    /// Final URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

/// A fetch waiting on the host. The error string becomes a `TypeError` inside
/// the sandbox.
pub struct FetchCall {
    pub request: FetchRequest,
    pub reply: oneshot::Sender<Result<FetchResponse, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(Vec<u8>),
    Done,
}

/// A stream event plus the acknowledgement the sandbox waits on before it
/// pulls the next element.
pub struct StreamMessage {
    pub event: StreamEvent,
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Idle,
    Open,
    Finished,
}

/// Log records queued per sandbox before further records are dropped.
pub const LOG_CAPACITY: usize = 1024;

/// Sandbox end of the channels. Stored in `OpState` for one invocation.
pub struct SandboxBridge {
    logs: mpsc::Sender<LogRecord>,
    dropped_logs: usize,
    fetches: mpsc::UnboundedSender<FetchCall>,
    stream: Option<mpsc::Sender<StreamMessage>>,
    stream_opened: Arc<AtomicBool>,
    phase: StreamPhase,
}

impl SandboxBridge {
    /// Queues a log record. Never blocks. A full or closed channel drops the
    /// record; returns false when that happens.
    pub fn log(&mut self, record: LogRecord) -> bool {
        match self.logs.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_logs += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Records dropped because the host fell behind.
    pub fn dropped_logs(&self) -> usize {
        self.dropped_logs
    }

    pub fn fetch_sender(&self) -> mpsc::UnboundedSender<FetchCall> {
        self.fetches.clone()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Marks the response stream as claimed. Returns false when no stream sink
    /// is attached or the stream was already claimed.
    pub fn open_stream(&mut self) -> bool {
        if self.stream.is_none() || self.phase != StreamPhase::Idle {
            return false;
        }
        self.phase = StreamPhase::Open;
        self.stream_opened.store(true, Ordering::SeqCst);
        true
    }

    /// Sender for the next stream event, or `None` once the stream has
    /// finished. A `Done` event finishes the stream.
    pub fn stream_sender_for(&mut self, event: &StreamEvent) -> Option<mpsc::Sender<StreamMessage>> {
        let sender = self.stream.clone()?;
        match self.phase {
            StreamPhase::Finished => None,
            StreamPhase::Idle | StreamPhase::Open => {
                self.stream_opened.store(true, Ordering::SeqCst);
                self.phase = match event {
                    StreamEvent::Done => StreamPhase::Finished,
                    StreamEvent::Chunk(_) => StreamPhase::Open,
                };
                Some(sender)
            }
        }
    }

    pub fn stream_finished(&self) -> bool {
        self.phase == StreamPhase::Finished
    }

    /// The response stream was claimed and has not finished yet.
    pub fn stream_pending(&self) -> bool {
        self.phase == StreamPhase::Open
    }
}

/// Host end of the channels.
pub struct HostChannels {
    pub logs: mpsc::Receiver<LogRecord>,
    pub fetches: mpsc::UnboundedReceiver<FetchCall>,
    pub stream: Option<mpsc::Receiver<StreamMessage>>,
    /// Set once the sandbox claims the response stream.
    pub stream_opened: Arc<AtomicBool>,
}

/// Creates a connected bridge pair. `streaming` attaches the response stream
/// channel, which holds at most one in-flight event.
pub fn channel(streaming: bool) -> (SandboxBridge, HostChannels) {
    let (log_tx, log_rx) = mpsc::channel(LOG_CAPACITY);
    let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
    let (stream_tx, stream_rx) = if streaming {
        let (tx, rx) = mpsc::channel(1);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let stream_opened = Arc::new(AtomicBool::new(false));

    let bridge = SandboxBridge {
        logs: log_tx,
        dropped_logs: 0,
        fetches: fetch_tx,
        stream: stream_tx,
        stream_opened: stream_opened.clone(),
        phase: StreamPhase::Idle,
    };
    let host = HostChannels {
        logs: log_rx,
        fetches: fetch_rx,
        stream: stream_rx,
        stream_opened,
    };
    (bridge, host)
}
