//! Kiosk session agent.
//!
//! Keeps a long-lived link to a session controller, locks the machine into
//! kiosk mode while a paid session runs and counts the session down locally
//! so it ends even when the controller is unreachable.

pub mod agent;
pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod kiosk;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;
