//! Host side of the streaming response facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::bridge::{StreamEvent, StreamMessage};
use crate::deployment::Deployment;

/// Receives streamed response bytes.
///
/// For one invocation the sink sees chunk events in production order followed
/// by exactly one `done = true` event, and nothing after it.
pub trait StreamSink: Send + Sync {
    fn on_receive_stream(&self, deployment: &Deployment, done: bool, chunk: Option<Vec<u8>>);
}

/// Forwards stream events from one sandbox to `sink`, acknowledging each one
/// after the sink returns.
///
/// If the sandbox goes away with the stream open (source error, handler
/// error, timeout) the terminal event is emitted here instead. Chunks that
/// arrive after the invocation expired are dropped.
pub(crate) async fn forward_stream(
    deployment: Arc<Deployment>,
    mut events: mpsc::Receiver<StreamMessage>,
    sink: Arc<dyn StreamSink>,
    opened: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    mut disposed: watch::Receiver<bool>,
) {
    let mut done = false;
    let mut deliver = |message: StreamMessage| {
        if done {
            return;
        }
        match message.event {
            StreamEvent::Chunk(chunk) => {
                if !expired.load(Ordering::SeqCst) {
                    sink.on_receive_stream(&deployment, false, Some(chunk));
                }
            }
            StreamEvent::Done => {
                sink.on_receive_stream(&deployment, true, None);
                done = true;
            }
        }
        let _ = message.ack.send(());
    };

    loop {
        tokio::select! {
            biased;
            message = events.recv() => match message {
                Some(message) => deliver(message),
                None => break,
            },
            _ = disposed.wait_for(|d| *d) => {
                while let Ok(message) = events.try_recv() {
                    deliver(message);
                }
                break;
            }
        }
    }

    if opened.load(Ordering::SeqCst) && !done {
        tracing::debug!(deployment = %deployment.deployment_id, "closing abandoned response stream");
        sink.on_receive_stream(&deployment, true, None);
    }
}
