//! Per-device filesystem context: cache/config/data directories rooted at
//! `<user-data>/<appname>/<deviceId>/`, created on demand (§4.F).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl DeviceContext {
    pub fn for_device(root: &Path, device_id: &str) -> Self {
        let base = root.join(device_id);
        Self {
            cache_dir: base.join("cache"),
            config_dir: base.clone(),
            data_dir: base.join("data"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn identity_path(&self) -> PathBuf {
        self.config_dir.join("identity.json")
    }

    /// Remove everything under this context's root. Never called for the
    /// Device Manager's own identity directory (§4.F `clear_data`).
    pub fn clear(&self) -> std::io::Result<()> {
        if self.config_dir.exists() {
            std::fs::remove_dir_all(&self.config_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn for_device_nests_under_root_by_id() {
        let root = TempDir::new().unwrap();
        let ctx = DeviceContext::for_device(root.path(), "abc-123");
        assert_eq!(ctx.config_dir, root.path().join("abc-123"));
        assert_eq!(ctx.identity_path(), root.path().join("abc-123/identity.json"));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let root = TempDir::new().unwrap();
        let ctx = DeviceContext::for_device(root.path(), "dev");
        ctx.ensure_dirs().unwrap();
        assert!(ctx.cache_dir.is_dir());
        assert!(ctx.data_dir.is_dir());
    }

    #[test]
    fn clear_removes_the_device_root() {
        let root = TempDir::new().unwrap();
        let ctx = DeviceContext::for_device(root.path(), "dev");
        ctx.ensure_dirs().unwrap();
        ctx.clear().unwrap();
        assert!(!ctx.config_dir.exists());
    }
}
