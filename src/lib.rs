// Library root: exposes internals for integration tests and the binary.
// The binary entry point is src/main.rs.

pub mod app;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod inference;
pub mod logger;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod subsystems;
pub mod supervisor;
pub mod training;
