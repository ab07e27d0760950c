//! Deployment data model.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::StoreError;

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Returns true if `id` is safe to use as a file stem and module specifier.
pub fn is_valid_deployment_id(id: &str) -> bool {
    ID_RE.is_match(id)
}

/// A unit of user code plus its environment and assets.
///
/// Owned by the host. A sandbox only borrows it (through an `Arc`) for the
/// lifetime of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub deployment_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub assets: Vec<String>,
}

impl Deployment {
    pub fn new(deployment_id: impl Into<String>) -> Result<Self, StoreError> {
        let deployment_id = deployment_id.into();
        if !is_valid_deployment_id(&deployment_id) {
            return Err(StoreError::InvalidId(deployment_id));
        }
        Ok(Self {
            deployment_id,
            env: BTreeMap::new(),
            assets: Vec::new(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_asset(mut self, name: impl Into<String>) -> Self {
        self.assets.push(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.deployment_id
    }

    /// Module specifier the deployment's code is loaded under inside the sandbox.
    pub fn module_specifier(&self) -> String {
        format!("deployment:///{}.js", self.deployment_id)
    }
}
