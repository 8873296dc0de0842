// Agent daemon
//
// Connects to the controller, applies its session commands and keeps the
// kiosk lockdown enforced until the process is asked to stop.

mod daemon;
mod runtime;

pub use daemon::run_agent_daemon;
pub use runtime::{AgentRuntime, RunningAgent};
