//! gRPC front end
//!
//! This module provides:
//! - the generated `codexec` protobuf types and service traits
//! - CoderGateway, the `ExecuteCode` implementation bridging requests to the worker pool
//! - server entry points with graceful shutdown

pub mod gateway;
pub mod server;

pub use gateway::CoderGateway;
pub use server::codexec;
pub use server::{serve, serve_listener};
