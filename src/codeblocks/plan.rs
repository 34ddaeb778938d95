//! Command Generator - derives the execution plan from the task directory
//!
//! Only `codeblock_<N>.sh` files are scheduled. They run in ascending numeric
//! order of `N`, so `codeblock_2.sh` comes before `codeblock_10.sh`.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex_lite::Regex;

lazy_static! {
    static ref SCRIPT_NAME: Regex = Regex::new(r"^codeblock_(\d+)\.sh$")
        .expect("invalid script name pattern");
}

/// Errors raised while building the plan
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// List `dir` and return one `sh <file>` command per generated script
pub fn generate_commands(dir: &Path) -> Result<Vec<String>, PlanError> {
    let read_err = |source| PlanError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut scripts: Vec<(u64, String)> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        if !entry.file_type().map_err(read_err)?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(number) = script_number(&name) {
            scripts.push((number, name));
        }
    }

    scripts.sort_by_key(|(number, _)| *number);

    Ok(scripts
        .into_iter()
        .map(|(_, name)| format!("sh {}", name))
        .collect())
}

/// Numeric suffix of a schedulable script name
fn script_number(name: &str) -> Option<u64> {
    SCRIPT_NAME
        .captures(name)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}
