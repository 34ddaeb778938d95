//! Code block handling for model responses
//!
//! Turns fenced blocks in model output into files inside the task directory,
//! then derives the shell commands that run them.
//!
//! ```text
//! model text ──extract_and_save──► workdir/codeblock_1.sh
//!                                  workdir/codeblock_2.py
//!                                  workdir/codeblock_10.sh
//!                      │
//!                      ▼
//!            generate_commands ──► ["sh codeblock_1.sh", "sh codeblock_10.sh"]
//! ```

pub mod extract;
pub mod plan;

pub use extract::{
    extension_for_language, extract_and_save, parse_code_blocks, CodeBlock, ExtractError,
    SavedBlock,
};
pub use plan::{generate_commands, PlanError};
