//! `process.env` for a deployment.
//!
//! The environment is rendered into sandbox-local source, so the sandbox only
//! ever holds a frozen copy, never a reference into the host.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::deployment::Deployment;

pub const NODE_ENV: &str = "NODE_ENV";
pub const NODE_ENV_VALUE: &str = "production";

/// Deployment env with keys upper-cased. `NODE_ENV` is reserved.
pub fn normalized_env(deployment: &Deployment) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in &deployment.env {
        let upper = key.to_uppercase();
        if upper == NODE_ENV {
            tracing::warn!(
                deployment = %deployment.deployment_id,
                key = %key,
                "ignoring reserved env key"
            );
            continue;
        }
        if env.insert(upper.clone(), value.clone()).is_some() {
            tracing::warn!(
                deployment = %deployment.deployment_id,
                key = %upper,
                "env keys collide after upper-casing, last one wins"
            );
        }
    }
    env
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

pub(crate) fn install_script(deployment: &Deployment) -> String {
    let mut script = String::from("(() => {\n  const env = {};\n");
    let mut define = |key: &str, value: &str| {
        script.push_str(&format!(
            "  Object.defineProperty(env, {}, {{ value: {}, enumerable: true }});\n",
            js_string(key),
            js_string(value)
        ));
    };
    define(NODE_ENV, NODE_ENV_VALUE);
    for (key, value) in normalized_env(deployment) {
        define(&key, &value);
    }
    script.push_str(
        "  Object.defineProperty(globalThis, \"process\", {\n    \
         value: Object.freeze({ env: Object.freeze(env) }),\n    \
         writable: false,\n    enumerable: false,\n    configurable: false,\n  });\n})();\n",
    );
    script
}
