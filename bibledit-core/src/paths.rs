use std::path::{Path, PathBuf};

/// Locations handed to the kernel at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPaths {
    /// Read-only resources bundled with the app.
    pub resources: PathBuf,
    /// Writable location the kernel copies its data into and serves from.
    pub writable_root: PathBuf,
}

impl LaunchPaths {
    /// Use `writable_root` when given, otherwise the platform data directory
    /// (`~/Library/Application Support/bibledit` on macOS). The writable root
    /// is created if missing.
    pub fn resolve(resources: &Path, writable_root: Option<&Path>) -> Result<Self, String> {
        if !resources.is_dir() {
            return Err(format!(
                "Resource directory not found: {}",
                resources.display()
            ));
        }

        let writable_root = match writable_root {
            Some(path) => path.to_path_buf(),
            None => default_writable_root()?,
        };
        std::fs::create_dir_all(&writable_root).map_err(|e| {
            format!(
                "Failed to create writable root {}: {}",
                writable_root.display(),
                e
            )
        })?;

        Ok(Self {
            resources: resources.to_path_buf(),
            writable_root,
        })
    }
}

pub fn default_writable_root() -> Result<PathBuf, String> {
    dirs::data_dir()
        .map(|dir| dir.join("bibledit"))
        .ok_or_else(|| "Cannot determine data home directory".to_string())
}
