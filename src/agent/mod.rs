//! Agent module for LLM-driven code generation and execution
//!
//! # Architecture
//!
//! ```text
//! Task → Agent → LanguageModel::generate (streamed to the client)
//!                  ↓
//!           response contains TERMINATE? ──► Terminated
//!                  ↓ no
//!           extract_and_save → task workdir
//!                  ↓
//!           ContainerExecutor::run → exit code + output
//!                  ↓
//!           attempts left? ──► correction prompt → loop
//!                  ↓ no
//!                GaveUp
//! ```

pub mod controller;

pub use controller::{
    Agent, AgentContext, AgentError, AgentOutcome, AgentRun, AttemptReport, Instrumentation,
    DEFAULT_SYSTEM_PROMPT, TERMINATION_MARKER,
};
