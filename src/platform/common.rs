use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomically write content to a file
///
/// Writes to a sibling temporary file, syncs it to disk, then renames it over
/// the target. Readers either see the old content or the new content, never a
/// torn policy backup or half-written allowed-apps list.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Restrict a file to its owner (Unix only, clears read-only on Windows)
pub fn set_owner_only(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o600);
    }

    #[cfg(not(unix))]
    {
        permissions.set_readonly(false);
    }

    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set permissions for: {}", path.display()))
}

/// Returns true when the agent runs with administrator/root privileges
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        (unsafe { libc::geteuid() }) == 0
    }

    #[cfg(windows)]
    {
        (unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() }) != 0
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Check if running with administrator/root privileges
pub fn ensure_admin_privileges() -> Result<()> {
    if is_elevated() {
        return Ok(());
    }

    #[cfg(unix)]
    anyhow::bail!(
        "This program must be run as root or with sudo. Current EUID: {}",
        unsafe { libc::geteuid() }
    );

    #[cfg(not(unix))]
    anyhow::bail!(
        "This program must be run as Administrator. Please restart with elevated privileges."
    );
}

/// Directory holding the agent's configuration and persisted state
pub fn data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("kiosk-agent");
        Ok(path)
    }

    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/var/lib/kiosk-agent");
        if system_path.exists() || is_elevated() {
            return Ok(system_path);
        }

        directories::ProjectDirs::from("", "", "kiosk-agent")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        directories::ProjectDirs::from("", "", "kiosk-agent")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .context("Could not determine data directory")
    }
}
