//! PHP interpreter discovery.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TuskError};

/// Default interpreter name looked up on `PATH`.
pub const DEFAULT_RUNTIME: &str = "php";

/// Sidecar location relative to the directory holding the tusk binary.
pub const SIDECAR_DIR: &str = ".tusk/bin";

/// Resolves the interpreter binary used to run workers.
#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    /// Directory searched for a sidecar `.tusk/bin/php`.
    exe_dir: Option<PathBuf>,
    /// Search path, normally `$PATH`.
    search_path: Option<std::ffi::OsString>,
}

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeLocator {
    /// Locator using the current executable's directory and `$PATH`.
    pub fn new() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            exe_dir,
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Locator with an explicit sidecar directory and search path.
    pub fn with_paths(exe_dir: Option<PathBuf>, search_path: Option<&OsStr>) -> Self {
        Self {
            exe_dir,
            search_path: search_path.map(OsStr::to_os_string),
        }
    }

    /// Resolve `configured` to an executable.
    ///
    /// A non-empty value must name an existing file or a command on the search
    /// path. An empty value tries the sidecar binary, then `php` on the search
    /// path.
    pub fn resolve(&self, configured: &str) -> Result<PathBuf> {
        if !configured.is_empty() {
            let path = Path::new(configured);
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            return self.find_in_path(configured).ok_or_else(|| {
                TuskError::RuntimeNotFound(format!("configured PHP not found: {}", configured))
            });
        }

        if let Some(sidecar) = self.sidecar() {
            return Ok(sidecar);
        }
        self.find_in_path(DEFAULT_RUNTIME).ok_or_else(|| {
            TuskError::RuntimeNotFound(format!(
                "install PHP or place a portable build in {}",
                SIDECAR_DIR
            ))
        })
    }

    fn sidecar(&self) -> Option<PathBuf> {
        let candidate = self.exe_dir.as_ref()?.join(SIDECAR_DIR).join(DEFAULT_RUNTIME);
        candidate.is_file().then_some(candidate)
    }

    fn find_in_path(&self, binary: &str) -> Option<PathBuf> {
        // Names with a separator are paths, not commands.
        if binary.contains('/') {
            return None;
        }
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(binary))
            .find(|candidate| is_executable(candidate))
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_configured_existing_file() {
        let dir = TempDir::new().unwrap();
        let php = make_executable(dir.path(), "php8.3");
        let locator = RuntimeLocator::with_paths(None, None);

        let resolved = locator.resolve(php.to_str().unwrap()).unwrap();
        assert_eq!(resolved, php);
    }

    #[test]
    fn test_configured_name_on_path() {
        let dir = TempDir::new().unwrap();
        let php = make_executable(dir.path(), "php-custom");
        let locator = RuntimeLocator::with_paths(None, Some(dir.path().as_os_str()));

        assert_eq!(locator.resolve("php-custom").unwrap(), php);
    }

    #[test]
    fn test_configured_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        // A sidecar exists, but an explicit setting must not silently fall back to it.
        fs::create_dir_all(dir.path().join(SIDECAR_DIR)).unwrap();
        make_executable(&dir.path().join(SIDECAR_DIR), "php");
        let locator = RuntimeLocator::with_paths(Some(dir.path().to_path_buf()), None);

        let err = locator.resolve("/no/such/php").unwrap_err();
        assert!(matches!(err, TuskError::RuntimeNotFound(_)));
        assert!(err.to_string().contains("/no/such/php"));
    }

    #[test]
    fn test_empty_prefers_sidecar() {
        let exe_dir = TempDir::new().unwrap();
        fs::create_dir_all(exe_dir.path().join(SIDECAR_DIR)).unwrap();
        let sidecar = make_executable(&exe_dir.path().join(SIDECAR_DIR), "php");
        let path_dir = TempDir::new().unwrap();
        make_executable(path_dir.path(), "php");

        let locator = RuntimeLocator::with_paths(
            Some(exe_dir.path().to_path_buf()),
            Some(path_dir.path().as_os_str()),
        );
        assert_eq!(locator.resolve("").unwrap(), sidecar);
    }

    #[test]
    fn test_empty_falls_back_to_path() {
        let path_dir = TempDir::new().unwrap();
        let php = make_executable(path_dir.path(), "php");
        let locator = RuntimeLocator::with_paths(None, Some(path_dir.path().as_os_str()));

        assert_eq!(locator.resolve("").unwrap(), php);
    }

    #[test]
    fn test_non_executable_on_path_is_skipped() {
        let path_dir = TempDir::new().unwrap();
        fs::write(path_dir.path().join("php"), "").unwrap();
        let locator = RuntimeLocator::with_paths(None, Some(path_dir.path().as_os_str()));

        assert!(matches!(
            locator.resolve(""),
            Err(TuskError::RuntimeNotFound(_))
        ));
    }
}
