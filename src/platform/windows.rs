use anyhow::{Context, Result};
use std::process::Command;
use winreg::RegKey;
use winreg::enums::*;

use crate::kiosk::policy::{PolicyError, PolicyKey, PolicyStore};

/// Registry location of each lockdown switch, relative to HKCU
pub fn registry_location(key: PolicyKey) -> (&'static str, &'static str) {
    const SYSTEM: &str = r"Software\Microsoft\Windows\CurrentVersion\Policies\System";
    const EXPLORER: &str = r"Software\Microsoft\Windows\CurrentVersion\Policies\Explorer";

    match key {
        PolicyKey::TaskManager => (SYSTEM, "DisableTaskMgr"),
        PolicyKey::CommandPrompt => (r"Software\Policies\Microsoft\Windows\System", "DisableCMD"),
        PolicyKey::RegistryTools => (SYSTEM, "DisableRegistryTools"),
        PolicyKey::AltTab => (SYSTEM, "NoAltTab"),
        PolicyKey::WindowsKey => (EXPLORER, "NoWinKeys"),
    }
}

/// Lockdown switches stored as DWORD values in the current user's policy hive
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryPolicyStore;

impl PolicyStore for RegistryPolicyStore {
    fn get(&self, key: PolicyKey) -> Result<Option<u32>, PolicyError> {
        let (path, name) = registry_location(key);
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);

        let subkey = match hkcu.open_subkey(path) {
            Ok(subkey) => subkey,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PolicyError::from_io(key, &e)),
        };

        match subkey.get_value::<u32, _>(name) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PolicyError::from_io(key, &e)),
        }
    }

    fn set(&self, key: PolicyKey, value: u32) -> Result<(), PolicyError> {
        let (path, name) = registry_location(key);
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);

        let (subkey, _) = hkcu
            .create_subkey(path)
            .map_err(|e| PolicyError::from_io(key, &e))?;
        subkey
            .set_value(name, &value)
            .map_err(|e| PolicyError::from_io(key, &e))
    }

    fn remove(&self, key: PolicyKey) -> Result<(), PolicyError> {
        let (path, name) = registry_location(key);
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);

        let subkey = match hkcu.open_subkey_with_flags(path, KEY_WRITE) {
            Ok(subkey) => subkey,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PolicyError::from_io(key, &e)),
        };

        match subkey.delete_value(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PolicyError::from_io(key, &e)),
        }
    }
}

pub fn lock_workstation() -> Result<()> {
    let ok = unsafe { windows_sys::Win32::System::Shutdown::LockWorkStation() };
    if ok == 0 {
        return Err(std::io::Error::last_os_error()).context("LockWorkStation failed");
    }
    Ok(())
}

pub fn shutdown_computer() -> Result<()> {
    let status = Command::new("shutdown")
        .args(["/s", "/t", "1"])
        .status()
        .context("Failed to run shutdown")?;

    if !status.success() {
        anyhow::bail!("shutdown exited with {}", status);
    }
    Ok(())
}
