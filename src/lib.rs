//! # Edge Isolate
//!
//! Runs untrusted deployment code in per-invocation V8 isolates using deno_core.
//!
//! ## Security Guarantees
//!
//! - **No filesystem access**: the only loadable module is the deployment itself
//! - **No direct network access**: `fetch` is served by the host under an origin allowlist
//! - **No host environment**: `process.env` is a frozen copy of the deployment's env
//! - **No code generation**: `eval` and the `Function` constructors throw
//! - **Bounded**: wall-clock and heap budgets terminate the isolate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use edge_isolate::{Deployment, HostSinks, InvocationRequest, SandboxConfig, SandboxManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SandboxManager::new(SandboxConfig::default())?;
//!     let deployment = Arc::new(Deployment::new("hello")?.with_env("name", "world"));
//!     let code = "export function handler() { return new Response(`hi ${process.env.NAME}`); }";
//!
//!     let response = manager
//!         .invoke(deployment, code.into(), InvocationRequest::get("https://hello.test/"), &HostSinks::none())
//!         .await?;
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```

mod bridge;
pub mod config;
mod deployment;
pub mod error;
mod loader;
mod manager;
pub mod mocks;
mod ops;
mod polyfills;
mod runtime;
pub mod sanitize;
mod snapshot;
mod store;

pub use bridge::{FetchRequest, FetchResponse, LogLevel};
pub use config::{EdgeConfig, FetchConfig, SandboxConfig};
pub use deployment::{is_valid_deployment_id, Deployment};
pub use error::{ConfigError, InvocationError, ResourceLimit, SnapshotError, StartupError, StoreError};
pub use manager::{HostSinks, SandboxManager};
pub use mocks::console::{LogSink, NoopLogSink};
pub use mocks::fetch::{HostFetch, HttpFetch};
pub use mocks::stream::StreamSink;
pub use mocks::{Capabilities, Capability};
pub use runtime::{InvocationRequest, InvocationResponse, SandboxState};
pub use snapshot::Snapshot;
pub use store::DeploymentStore;
