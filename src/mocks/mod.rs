//! Capability mocks installed into each sandbox.
//!
//! The set of capabilities a sandbox can ever see is fixed before it is
//! created. Code generation from strings and the `Deno` namespace are not
//! capabilities and cannot be requested.

pub mod console;
pub mod env;
pub mod fetch;
pub mod stream;

use std::collections::BTreeSet;

use crate::deployment::Deployment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// `process.env`
    Env,
    /// `console.{log,error,info,warn,debug}`
    Console,
    /// `fetch`
    Fetch,
    /// `streamResponse`
    StreamResponse,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Env,
        Capability::Console,
        Capability::Fetch,
        Capability::StreamResponse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::Env => "env",
            Capability::Console => "console",
            Capability::Fetch => "fetch",
            Capability::StreamResponse => "streamResponse",
        }
    }

    /// Script name used when the installer is evaluated.
    pub(crate) fn script_name(self) -> &'static str {
        match self {
            Capability::Env => "[edge:install-env]",
            Capability::Console => "[edge:install-console]",
            Capability::Fetch => "[edge:install-fetch]",
            Capability::StreamResponse => "[edge:install-stream]",
        }
    }

    /// Source of the installer for this capability.
    pub(crate) fn install_script(self, deployment: &Deployment) -> String {
        match self {
            Capability::Env => env::install_script(deployment),
            Capability::Console => "__edgeInternals.installConsole();".to_string(),
            Capability::Fetch => "__edgeInternals.installFetch();".to_string(),
            Capability::StreamResponse => "__edgeInternals.installStreamResponse();".to_string(),
        }
    }
}

/// Allowlist of capabilities exposed to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn all() -> Self {
        Self(Capability::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.0.remove(&capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// `streamResponse` needs somewhere to send chunks.
    pub(crate) fn for_stream_sink(&self, has_stream_sink: bool) -> Self {
        if has_stream_sink {
            self.clone()
        } else {
            self.clone().without(Capability::StreamResponse)
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}
