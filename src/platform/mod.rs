//! Host integration: policy storage, locking and shutdown per platform

pub mod common;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::kiosk::policy::PolicyStore;

/// The lockdown switch store native to this platform
pub fn native_policy_store(data_dir: &Path) -> Result<Arc<dyn PolicyStore>> {
    #[cfg(target_os = "windows")]
    {
        let _ = data_dir;
        Ok(Arc::new(windows::RegistryPolicyStore))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::FilePolicyStore::new(
            data_dir.join("lockdown.json"),
        )))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        let _ = data_dir;
        anyhow::bail!("Unsupported operating system for kiosk lockdown")
    }
}

pub fn lock_workstation() -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::lock_workstation()
    }

    #[cfg(target_os = "linux")]
    {
        linux::lock_workstation()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        anyhow::bail!("Unsupported operating system for workstation locking")
    }
}

pub fn shutdown_computer() -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::shutdown_computer()
    }

    #[cfg(target_os = "linux")]
    {
        linux::shutdown_computer()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        anyhow::bail!("Unsupported operating system for shutdown")
    }
}
