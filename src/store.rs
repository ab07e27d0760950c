//! On-disk deployment code and assets.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<deploymentId>.js        compiled code
//! <root>/<deploymentId>/<asset>   assets, only when the deployment has any
//! ```

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use crate::deployment::{is_valid_deployment_id, Deployment};
use crate::error::StoreError;

pub struct DeploymentStore {
    root: PathBuf,
}

impl DeploymentStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn code_path(&self, deployment_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_deployment_id(deployment_id) {
            return Err(StoreError::InvalidId(deployment_id.to_string()));
        }
        Ok(self.root.join(format!("{deployment_id}.js")))
    }

    fn assets_dir(&self, deployment_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_deployment_id(deployment_id) {
            return Err(StoreError::InvalidId(deployment_id.to_string()));
        }
        Ok(self.root.join(deployment_id))
    }

    pub fn has_code_locally(&self, deployment_id: &str) -> bool {
        self.code_path(deployment_id).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn get_code(&self, deployment_id: &str) -> Result<String, StoreError> {
        let path = self.code_path(deployment_id)?;
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(deployment_id.to_string()),
            _ => StoreError::io(&path, e),
        })
    }

    /// Writes the deployment's code. The asset directory is created when the
    /// deployment lists any assets.
    pub fn write_code(&self, deployment: &Deployment, code: &str) -> Result<(), StoreError> {
        let path = self.code_path(&deployment.deployment_id)?;
        if !deployment.assets.is_empty() {
            let dir = self.assets_dir(&deployment.deployment_id)?;
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        fs::write(&path, code).map_err(|e| StoreError::io(&path, e))?;
        tracing::debug!(deployment = %deployment.deployment_id, bytes = code.len(), "deployment code written");
        Ok(())
    }

    /// Opens one of a deployment's assets for reading.
    pub fn get_asset(&self, deployment_id: &str, name: &str) -> Result<File, StoreError> {
        let path = self.assets_dir(deployment_id)?.join(checked_relative(name)?);
        File::open(&path).map_err(|e| StoreError::io(&path, e))
    }

    /// Writes an asset. `name` is relative to the store root, normally
    /// `<deploymentId>/<asset>`. Parent directories are created.
    pub fn write_asset(&self, name: &str, content: &[u8]) -> Result<(), StoreError> {
        let path = self.root.join(checked_relative(name)?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        fs::write(&path, content).map_err(|e| StoreError::io(&path, e))
    }

    /// Removes a deployment's code and assets. Missing files are not an error.
    pub fn delete_code(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let path = self.code_path(&deployment.deployment_id)?;
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(deployment = %deployment.deployment_id, error = %e, "failed to remove deployment code");
        }
        let dir = self.assets_dir(&deployment.deployment_id)?;
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(deployment = %deployment.deployment_id, error = %e, "failed to remove deployment assets");
            }
        }
        Ok(())
    }

    /// Removes every stored deployment whose id is not in `current`. Returns
    /// the removed ids, sorted.
    pub fn delete_stale(&self, current: &HashSet<String>) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let file_name = entry.file_name();
            let Some(id) = file_name.to_str().and_then(|name| name.strip_suffix(".js")) else {
                continue;
            };
            if !is_valid_deployment_id(id) || current.contains(id) {
                continue;
            }
            // deleting only needs the id
            let stale = Deployment {
                deployment_id: id.to_string(),
                env: Default::default(),
                assets: Vec::new(),
            };
            self.delete_code(&stale)?;
            removed.push(stale.deployment_id);
        }
        removed.sort();
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "removed stale deployments");
        }
        Ok(removed)
    }
}

/// Rejects absolute names and any `..` component.
fn checked_relative(name: &str) -> Result<&Path, StoreError> {
    let path = Path::new(name);
    let ok = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(path)
    } else {
        Err(StoreError::InvalidAssetName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_code() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        let deployment = Deployment::new("site").unwrap();

        assert!(!store.has_code_locally("site"));
        store.write_code(&deployment, "export const handler = 1;").unwrap();
        assert!(store.has_code_locally("site"));
        assert_eq!(store.get_code("site").unwrap(), "export const handler = 1;");
        // no assets, no asset directory
        assert!(!dir.path().join("site").exists());
    }

    #[test]
    fn test_missing_code() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        assert!(matches!(store.get_code("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_invalid_ids() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        assert!(!store.has_code_locally("../escape"));
        assert!(matches!(store.get_code("../escape"), Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn test_assets() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        let deployment = Deployment::new("site").unwrap().with_asset("css/app.css");
        store.write_code(&deployment, "").unwrap();
        assert!(dir.path().join("site").is_dir());

        store.write_asset("site/css/app.css", b"body{}").unwrap();
        let mut content = String::new();
        store.get_asset("site", "css/app.css").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "body{}");
    }

    #[test]
    fn test_asset_names_cannot_escape() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        assert!(matches!(store.write_asset("../x", b""), Err(StoreError::InvalidAssetName(_))));
        assert!(matches!(store.write_asset("/etc/x", b""), Err(StoreError::InvalidAssetName(_))));
        assert!(matches!(store.get_asset("site", "a/../../x"), Err(StoreError::InvalidAssetName(_))));
        assert!(matches!(store.write_asset("", b""), Err(StoreError::InvalidAssetName(_))));
    }

    #[test]
    fn test_delete_code_removes_assets() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        let deployment = Deployment::new("site").unwrap().with_asset("a.txt");
        store.write_code(&deployment, "").unwrap();
        store.write_asset("site/a.txt", b"a").unwrap();

        store.delete_code(&deployment).unwrap();
        assert!(!store.has_code_locally("site"));
        assert!(!dir.path().join("site").exists());

        // deleting again is fine
        store.delete_code(&deployment).unwrap();
    }

    #[test]
    fn test_delete_stale() {
        let dir = tempdir().unwrap();
        let store = DeploymentStore::new(dir.path()).unwrap();
        for id in ["keep", "old-1", "old-2"] {
            store.write_code(&Deployment::new(id).unwrap(), "").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let current: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = store.delete_stale(&current).unwrap();

        assert_eq!(removed, vec!["old-1".to_string(), "old-2".to_string()]);
        assert!(store.has_code_locally("keep"));
        assert!(!store.has_code_locally("old-1"));
        assert!(dir.path().join("notes.txt").exists());
    }
}
