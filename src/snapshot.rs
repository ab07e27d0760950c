//! The shared startup snapshot.
//!
//! The blob is produced by `build.rs` and embedded in the binary. It is
//! validated once at startup; after that it is only ever read.

use deno_core::{serde_v8, v8, JsRuntime, RuntimeOptions};
use std::sync::{Arc, Once};

use crate::error::SnapshotError;
use crate::ops;
use crate::polyfills::POLYFILLS;

static EDGE_SNAPSHOT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/EDGE_SNAPSHOT.bin"));

/// Web globals every sandbox must see besides the polyfills.
const WEB_GLOBALS: &[&str] = &[
    "URL",
    "URLSearchParams",
    "TextEncoder",
    "TextDecoder",
    "atob",
    "btoa",
    "ReadableStream",
    "crypto",
    "setTimeout",
    "__edgeInternals",
];

static V8_FLAGS: Once = Once::new();

/// Makes V8 refuse to compile code from strings in every context of this
/// process. Must run before the first isolate is created; later calls do
/// nothing.
pub(crate) fn restrict_code_generation() {
    V8_FLAGS.call_once(|| {
        let unrecognized = deno_core::v8_set_flags(vec![
            "edge-isolate".to_string(),
            "--disallow-code-generation-from-strings".to_string(),
        ]);
        if unrecognized.len() > 1 {
            tracing::warn!(flags = ?&unrecognized[1..], "V8 rejected flags");
        }
    });
}

/// Immutable handle to a validated snapshot blob.
#[derive(Debug)]
pub struct Snapshot {
    blob: &'static [u8],
}

impl Snapshot {
    /// The snapshot built into this binary.
    pub fn embedded() -> Result<Arc<Snapshot>, SnapshotError> {
        Self::from_static(EDGE_SNAPSHOT)
    }

    /// Validates `blob` by restoring a throwaway isolate from it and checking
    /// every polyfill is present.
    pub fn from_static(blob: &'static [u8]) -> Result<Arc<Snapshot>, SnapshotError> {
        if blob.is_empty() {
            return Err(SnapshotError::Empty);
        }
        restrict_code_generation();
        let snapshot = Snapshot { blob };
        snapshot.verify()?;
        tracing::debug!(bytes = blob.len(), "startup snapshot validated");
        Ok(Arc::new(snapshot))
    }

    pub fn blob(&self) -> &'static [u8] {
        self.blob
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    fn verify(&self) -> Result<(), SnapshotError> {
        let blob = self.blob;
        // A corrupt blob makes V8 abort the creating thread, so keep it off ours.
        let missing = std::thread::Builder::new()
            .name("edge-snapshot-verify".into())
            .spawn(move || missing_globals(blob))
            .map_err(|e| SnapshotError::Verify(e.to_string()))?
            .join()
            .map_err(|_| SnapshotError::Verify("isolate could not be restored".into()))?
            .map_err(|e| SnapshotError::Verify(e.to_string()))?;

        match missing.into_iter().next() {
            Some(name) => Err(SnapshotError::MissingPolyfill(name)),
            None => Ok(()),
        }
    }
}

fn missing_globals(blob: &'static [u8]) -> Result<Vec<String>, anyhow::Error> {
    let mut runtime = JsRuntime::new(RuntimeOptions {
        startup_snapshot: Some(blob),
        extensions: ops::extensions(false),
        ..Default::default()
    });

    // typeof on a bare identifier also sees script-scope bindings, which
    // `globalThis[name]` would not.
    let checks: Vec<String> = POLYFILLS
        .iter()
        .flat_map(|polyfill| polyfill.globals.iter())
        .chain(WEB_GLOBALS.iter())
        .map(|name| format!("typeof {name} === 'undefined' ? '{name}' : null"))
        .collect();
    let script = format!("[{}].filter((name) => name !== null)", checks.join(", "));

    let value = runtime.execute_script("[edge:snapshot-verify]", script)?;
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, value);
    let missing: Vec<String> = serde_v8::from_v8(scope, local)?;
    Ok(missing)
}
