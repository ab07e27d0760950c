//! Build script to create the V8 startup snapshot every sandbox is restored from.
//!
//! Extension modules and the polyfill scripts are compiled and evaluated here,
//! so creating a sandbox only deserializes the snapshot. A polyfill that fails
//! to evaluate fails the build.

use std::env;
use std::path::PathBuf;

// Shared with the crate so ops and polyfills are IDENTICAL between the
// snapshot and the runtime.
#[allow(dead_code)]
#[path = "src/bridge.rs"]
mod bridge;
#[allow(dead_code)]
#[path = "src/ops.rs"]
mod ops;
#[allow(dead_code)]
#[path = "src/polyfills.rs"]
mod polyfills;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/bridge.rs");
    println!("cargo:rerun-if-changed=src/ops.rs");
    println!("cargo:rerun-if-changed=src/polyfills.rs");
    println!("cargo:rerun-if-changed=src/js");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let snapshot_path = out_dir.join("EDGE_SNAPSHOT.bin");

    let snapshot = deno_core::snapshot::create_snapshot(
        deno_core::snapshot::CreateSnapshotOptions {
            cargo_manifest_dir: env!("CARGO_MANIFEST_DIR"),
            startup_snapshot: None,
            skip_op_registration: false,
            extensions: ops::extensions(true),
            with_runtime_cb: Some(Box::new(|runtime| {
                for polyfill in polyfills::POLYFILLS {
                    let source = polyfills::strip_global_assignments(polyfill.source);
                    if let Err(e) = runtime.execute_script(polyfill.specifier, source) {
                        panic!("Failed to evaluate polyfill `{}`: {}", polyfill.name, e);
                    }
                }
            })),
            extension_transpiler: None,
        },
        None,
    )
    .expect("Failed to create snapshot");

    std::fs::write(&snapshot_path, snapshot.output).expect("Failed to write snapshot");

    println!(
        "cargo:warning=Snapshot created at {:?} ({} bytes)",
        snapshot_path,
        std::fs::metadata(&snapshot_path).unwrap().len()
    );
}
