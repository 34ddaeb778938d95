//! Code Block Extractor - fenced blocks in model output → files on disk

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex_lite::Regex;
use tracing::debug;

/// Fence marker that opens and closes a block
const FENCE: &str = "```";

lazy_static! {
    /// `# filename: <name>` directive, first match anywhere in the block
    static ref FILENAME_DIRECTIVE: Regex = Regex::new(r"(?m)^#\s*filename:\s*(\S+)")
        .expect("invalid filename directive pattern");
}

/// A single fenced block parsed from model output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Language tag from the opening fence (may be empty)
    pub language: String,
    /// Raw block content, newline-terminated lines
    pub content: String,
    /// Explicit name from a `# filename:` directive
    pub filename: Option<String>,
    /// 1-based position among all blocks in the response
    pub index: usize,
}

impl CodeBlock {
    fn new(language: String, content: String, index: usize) -> Self {
        let filename = extract_filename(&content);
        Self {
            language,
            content,
            filename,
            index,
        }
    }

    /// Name the block is saved under inside the task directory
    pub fn file_name(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            format!(
                "codeblock_{}{}",
                self.index,
                extension_for_language(&self.language)
            )
        })
    }
}

/// A block that has been written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBlock {
    pub index: usize,
    pub language: String,
    pub path: PathBuf,
}

/// Errors raised while saving extracted blocks
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Map a fence language tag to a file extension
///
/// Unknown and empty tags default to a shell script so that untagged blocks
/// still get scheduled for execution.
pub fn extension_for_language(language: &str) -> &'static str {
    match language.trim().to_ascii_lowercase().as_str() {
        "python" => ".py",
        "javascript" => ".js",
        "java" => ".java",
        "go" => ".go",
        "ruby" => ".rb",
        "c++" | "cpp" => ".cpp",
        "c" => ".c",
        "bash" | "shell" | "sh" => ".sh",
        _ => ".sh",
    }
}

/// Parse every fenced block in `input`, in document order
///
/// A block left open at the end of input is still returned.
pub fn parse_code_blocks(input: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut language = String::new();
    let mut in_block = false;

    for line in input.split('\n') {
        let trimmed = line.trim();
        if let Some(tag) = trimmed.strip_prefix(FENCE) {
            if in_block {
                let index = blocks.len() + 1;
                blocks.push(CodeBlock::new(
                    std::mem::take(&mut language),
                    std::mem::take(&mut current),
                    index,
                ));
                in_block = false;
            } else {
                language = tag.trim().to_string();
                in_block = true;
            }
        } else if in_block {
            current.push_str(line);
            current.push('\n');
        }
    }

    if in_block {
        let index = blocks.len() + 1;
        blocks.push(CodeBlock::new(language, current, index));
    }

    blocks
}

/// Parse `input` and write each block into `output_dir`
///
/// Creates `output_dir` if it does not exist. Returns the saved blocks in
/// document order; an input without fences writes nothing.
pub fn extract_and_save(input: &str, output_dir: &Path) -> Result<Vec<SavedBlock>, ExtractError> {
    std::fs::create_dir_all(output_dir).map_err(|source| ExtractError::CreateDir {
        path: output_dir.to_path_buf(),
        source,
    })?;

    parse_code_blocks(input)
        .into_iter()
        .map(|block| save_block(output_dir, block))
        .collect()
}

fn save_block(output_dir: &Path, block: CodeBlock) -> Result<SavedBlock, ExtractError> {
    let path = output_dir.join(block.file_name());
    std::fs::write(&path, block.content.as_bytes()).map_err(|source| ExtractError::Write {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), language = %block.language, "Created file");

    Ok(SavedBlock {
        index: block.index,
        language: block.language,
        path,
    })
}

/// Find a `# filename:` directive and reduce it to a bare file name
///
/// Directives pointing outside the task directory (`../x`, `/etc/x`) keep
/// only their last component.
fn extract_filename(content: &str) -> Option<String> {
    let raw = FILENAME_DIRECTIVE.captures(content)?.get(1)?.as_str();
    Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
}
