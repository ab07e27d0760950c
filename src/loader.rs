//! Module loader for a single in-memory deployment module.
//!
//! A deployment is one pre-bundled ES module. The loader serves exactly that
//! module and refuses every other specifier: no filesystem, no network, no
//! `data:` or `blob:` URLs, and no dynamic import of anything else.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};

pub struct DeploymentLoader {
    specifier: ModuleSpecifier,
    code: String,
}

impl DeploymentLoader {
    pub fn new(specifier: &str, code: String) -> Result<Self, Error> {
        let specifier = ModuleSpecifier::parse(specifier)
            .map_err(|e| anyhow!("Invalid deployment specifier '{}': {}", specifier, e))?;
        Ok(Self { specifier, code })
    }
}

impl ModuleLoader for DeploymentLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        let resolved = match ModuleSpecifier::parse(specifier) {
            Ok(url) => url,
            Err(_) => ModuleSpecifier::parse(referrer)
                .and_then(|base| base.join(specifier))
                .map_err(|_| anyhow!("Module imports are not available in deployments: {}", specifier))?,
        };

        if resolved != self.specifier {
            return Err(anyhow!(
                "Module imports are not available in deployments: {}",
                specifier
            ));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        if *module_specifier != self.specifier {
            return ModuleLoadResponse::Sync(Err(anyhow!(
                "Module imports are not available in deployments: {}",
                module_specifier
            )));
        }

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(self.code.clone().into()),
            module_specifier,
            None,
        )))
    }
}
