//! Kiosk lockdown: policy switches, allowed applications and process
//! enforcement

pub mod apps;
pub mod controller;
pub mod enforcement;
pub mod policy;
pub mod process;

pub use apps::{AllowedApp, AllowedAppsFile, LaunchError};
pub use controller::{BackupJournal, KioskController, KioskError, KioskMode, KioskSettings};
pub use policy::{PolicyBackup, PolicyKey, PolicyStore};
pub use process::{ProcessTable, SysinfoProcessTable};

/// Processes that must survive every sweep on a Windows host
pub fn default_system_processes() -> Vec<String> {
    [
        "system",
        "registry",
        "smss.exe",
        "csrss.exe",
        "wininit.exe",
        "winlogon.exe",
        "services.exe",
        "lsass.exe",
        "svchost.exe",
        "spoolsv.exe",
        "dwm.exe",
        "fontdrvhost.exe",
        "explorer.exe",
        "sihost.exe",
        "ctfmon.exe",
        "kiosk-agent.exe",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Interactive shells: allowed to run, but anything they start is judged on
/// its own
pub fn default_shell_processes() -> Vec<String> {
    vec!["explorer.exe".to_string()]
}
