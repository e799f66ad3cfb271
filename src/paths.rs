//! OS-specific directories for logs, lockfile, pinned-cert store, and runtime config.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

const QUALIFIER: &str = "ai";
const ORGANIZATION: &str = "anava";
const APPLICATION: &str = "connector";

const LOCKFILE_NAME: &str = "anava-proxy-service.lock";
const PIN_STORE_NAME: &str = "certificate-fingerprints.json";
const RUNTIME_CONFIG_NAME: &str = "connector-config.json";
const PROXY_LOG_NAME: &str = "anava-proxy-service.log";
const HOST_LOG_NAME: &str = "anava-native-host.log";

/// Resolved state/config/log roots for this platform, and the concrete file paths within them.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_root: PathBuf,
    pub config_root: PathBuf,
    pub logs_root: PathBuf,
}

impl StatePaths {
    /// Resolves the OS-specific directories. Does not touch the filesystem.
    pub fn resolve() -> Self {
        match ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION) {
            Some(dirs) => Self {
                state_root: dirs.data_local_dir().to_path_buf(),
                config_root: dirs.config_dir().to_path_buf(),
                logs_root: dirs.cache_dir().join("logs"),
            },
            None => {
                // No home directory could be resolved (unusual sandboxes). Fall back to a
                // relative directory rather than failing outright.
                let fallback = PathBuf::from(".anava-connector");
                Self {
                    state_root: fallback.clone(),
                    config_root: fallback.clone(),
                    logs_root: fallback.join("logs"),
                }
            }
        }
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.state_root.join(LOCKFILE_NAME)
    }

    pub fn pin_store_path(&self) -> PathBuf {
        self.state_root.join(PIN_STORE_NAME)
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.config_root.join(RUNTIME_CONFIG_NAME)
    }

    pub fn proxy_log_path(&self) -> PathBuf {
        self.logs_root.join(PROXY_LOG_NAME)
    }

    pub fn host_log_path(&self) -> PathBuf {
        self.logs_root.join(HOST_LOG_NAME)
    }

    /// Creates all three roots with owner-only permissions (0700 on unix).
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [&self.state_root, &self.config_root, &self.logs_root] {
            create_owner_only_dir(dir)?;
        }
        Ok(())
    }
}

fn create_owner_only_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dir)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

/// Writes `contents` to `path` with owner-only permissions (0600 on unix), creating the parent
/// directory if needed. Used for the lockfile, pin store, and runtime config.
pub fn write_owner_only(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_owner_only_dir(parent)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        use std::io::Write;
        file.write_all(contents)?;
    }
    #[cfg(not(unix))]
    {
        fs::write(path, contents)?;
    }
    Ok(())
}

/// Atomically replaces the contents of `path`: writes to a sibling temp file then renames over it.
pub fn write_owner_only_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    write_owner_only(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
