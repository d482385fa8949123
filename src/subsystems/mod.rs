//! Subsystems hosted by the supervisor.

pub mod bot;
pub mod comms;
pub mod runtime;
