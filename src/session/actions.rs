use anyhow::Result;

use crate::platform;

/// Privileged host operations ordered by the controller
pub trait HostActions: Send + Sync {
    fn lock_workstation(&self) -> Result<()>;

    fn shutdown(&self) -> Result<()>;
}

/// Performs the operations on the local machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostActions;

impl HostActions for SystemHostActions {
    fn lock_workstation(&self) -> Result<()> {
        platform::lock_workstation()
    }

    fn shutdown(&self) -> Result<()> {
        platform::shutdown_computer()
    }
}
