//! Paid-session lifecycle

pub mod actions;
pub mod clock;
pub mod coordinator;
pub mod state;

pub use actions::{HostActions, SystemHostActions};
pub use clock::{Clock, SystemClock};
pub use coordinator::{OperatingMode, SessionCoordinator, SessionError, SessionSnapshot};
pub use state::SessionState;
