//! Built-in coding tools.
//!
//! `LS`, `Read`, `Write`, `Grep` and `Bash` give an agent access to the
//! local workspace. Relative paths resolve against
//! [`ToolExecutionContext::working_dir`]. Each tool is an [`AgentTool`]
//! returned as `Arc<dyn Tool>`.
//!
//! ```rust,no_run
//! use skiff::tools::builtin::all_tools;
//!
//! let tools = all_tools();
//! assert_eq!(tools.len(), 5);
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use regex::Regex;

use crate::error::{Result, SkiffError};
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext, ToolOutcome};
use crate::tools::types::ToolParameters;

pub const LS: &str = "LS";
pub const READ: &str = "Read";
pub const WRITE: &str = "Write";
pub const GREP: &str = "Grep";
pub const BASH: &str = "Bash";

const BASH_OUTPUT_MAX_BYTES: usize = 32_768;
const READ_MAX_BYTES: usize = 65_536;
const READ_DEFAULT_LIMIT: usize = 2_000;
const GREP_OUTPUT_MAX_BYTES: usize = 32_768;
const GREP_MAX_MATCHES: usize = 500;
const BASH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const BASH_MAX_TIMEOUT: Duration = Duration::from_secs(600);

const TRUNCATED: &str = "\n... (truncated)";

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

/// Cap `s` at `max_bytes`, appending a marker when cut.
fn capped(s: String, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s, false);
    }
    let mut out = truncate_utf8(&s, max_bytes);
    out.push_str(TRUNCATED);
    (out, true)
}

fn io_error(tool: &str, path: &Path, e: std::io::Error) -> SkiffError {
    SkiffError::tool(tool, format!("{}: {e}", path.display()))
}

/// `LS`: sorted directory listing, directories suffixed with `/`.
pub fn ls_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            LS,
            "List the entries of a directory. Directories end with '/'.",
            ToolParameters::object()
                .string("path", "Directory to list (defaults to the working directory)", false)
                .build(),
            |args, ctx: ToolExecutionContext| async move {
                let dir = ctx.resolve(args.get_str_opt("path").unwrap_or("."));

                let mut read_dir = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|e| io_error(LS, &dir, e))?;

                let mut entries = Vec::new();
                while let Some(entry) = read_dir
                    .next_entry()
                    .await
                    .map_err(|e| io_error(LS, &dir, e))?
                {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        name.push('/');
                    }
                    entries.push(name);
                }
                entries.sort();

                let count = entries.len();
                let content = if entries.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    entries.join("\n")
                };
                Ok(ToolOutcome::success(content).with_metadata("count", count))
            },
        )
        .read_only(),
    )
}

/// `Read`: a window of a UTF-8 file's lines, numbered from 1.
pub fn read_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            READ,
            "Read a text file. Lines are numbered from 1; use offset and limit for large files.",
            ToolParameters::object()
                .string("path", "Path of the file to read", true)
                .integer("offset", "First line to return (1-based)", false)
                .integer("limit", "Maximum number of lines to return", false)
                .build(),
            |args, ctx: ToolExecutionContext| async move {
                let path = ctx.resolve(args.get_str("path")?);
                let offset = args.get_u64_opt("offset").unwrap_or(1).max(1) as usize;
                let limit = args
                    .get_u64_opt("limit")
                    .map(|l| l as usize)
                    .unwrap_or(READ_DEFAULT_LIMIT);

                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_error(READ, &path, e))?;

                let total_lines = text.lines().count();
                let window: String = text
                    .lines()
                    .enumerate()
                    .skip(offset - 1)
                    .take(limit)
                    .map(|(i, line)| format!("{:>6}\t{line}\n", i + 1))
                    .collect();

                let (content, truncated) = capped(window, READ_MAX_BYTES);
                let content = if content.is_empty() {
                    "(no content in range)".to_string()
                } else {
                    content
                };
                Ok(ToolOutcome::success(content)
                    .with_metadata("total_lines", total_lines)
                    .with_metadata("truncated", truncated))
            },
        )
        .read_only(),
    )
}

/// `Write`: replace a file's contents, creating parent directories.
pub fn write_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        WRITE,
        "Write content to a file, creating parent directories if needed",
        ToolParameters::object()
            .string("path", "Path of the file to write", true)
            .string("content", "Full new content of the file", true)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let path = ctx.resolve(args.get_str("path")?);
            let content = args.get_str("content")?;

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error(WRITE, parent, e))?;
                }
            }

            tokio::fs::write(&path, content)
                .await
                .map_err(|e| io_error(WRITE, &path, e))?;

            Ok(ToolOutcome::success(format!(
                "Wrote {} bytes to {}",
                content.len(),
                path.display()
            ))
            .with_metadata("bytes_written", content.len()))
        },
    ))
}

/// `Grep`: regex search over a gitignore-aware walk.
pub fn grep_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            GREP,
            "Search file contents with a regular expression. Output lines are path:line:text.",
            ToolParameters::object()
                .string("pattern", "Regular expression to search for", true)
                .string("path", "File or directory to search (defaults to the working directory)", false)
                .string("glob", "Only search files matching this glob, e.g. '*.rs'", false)
                .build(),
            |args, ctx: ToolExecutionContext| async move {
                let regex = Regex::new(args.get_str("pattern")?)
                    .map_err(|e| SkiffError::InvalidArgument(format!("invalid pattern: {e}")))?;
                let root = ctx.resolve(args.get_str_opt("path").unwrap_or("."));
                let glob = args.get_str_opt("glob").map(str::to_string);
                let base = ctx.working_dir.clone();

                let (matches, hit_cap) = tokio::task::spawn_blocking(move || {
                    search(&regex, &root, glob.as_deref(), &base)
                })
                .await
                .map_err(|e| SkiffError::tool(GREP, e.to_string()))??;

                if matches.is_empty() {
                    return Ok(ToolOutcome::success("No matches found.").with_metadata("matches", 0));
                }
                let count = matches.len();
                let (mut content, truncated) = capped(matches.join("\n"), GREP_OUTPUT_MAX_BYTES);
                if hit_cap && !truncated {
                    content.push_str(TRUNCATED);
                }
                Ok(ToolOutcome::success(content)
                    .with_metadata("matches", count)
                    .with_metadata("truncated", truncated || hit_cap))
            },
        )
        .read_only(),
    )
}

/// Walk `root` and collect `path:line:text` matches. Returns whether the
/// match cap was reached.
fn search(regex: &Regex, root: &Path, glob: Option<&str>, base: &Path) -> Result<(Vec<String>, bool)> {
    let mut walker = WalkBuilder::new(root);
    walker
        .hidden(true)
        .ignore(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .parents(true);
    if let Some(glob) = glob {
        let overrides = OverrideBuilder::new(root)
            .add(glob)
            .and_then(|b| b.build())
            .map_err(|e| SkiffError::InvalidArgument(format!("invalid glob: {e}")))?;
        walker.overrides(overrides);
    }

    let mut matches = Vec::new();
    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        // Binary or non-UTF-8 files are skipped.
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let shown = display_path(entry.path(), base);
        for (i, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{shown}:{}:{line}", i + 1));
                if matches.len() >= GREP_MAX_MATCHES {
                    return Ok((matches, true));
                }
            }
        }
    }
    Ok((matches, false))
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// `Bash`: run a command via `sh -c` in the working directory.
///
/// The child is killed when the timeout expires or the call is cancelled.
pub fn bash_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        BASH,
        "Run a shell command and return its combined output",
        ToolParameters::object()
            .string("command", "The shell command to execute", true)
            .integer("timeout", "Timeout in seconds (default 120, max 600)", false)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let command = args.get_str("command")?;
            let timeout = args
                .get_u64_opt("timeout")
                .map(Duration::from_secs)
                .unwrap_or(BASH_DEFAULT_TIMEOUT)
                .min(BASH_MAX_TIMEOUT);

            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SkiffError::tool(BASH, e.to_string()))?;

            // Dropping the output future drops the child, which kills it.
            let output = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(SkiffError::Cancelled),
                result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(SkiffError::tool(BASH, e.to_string())),
                    Err(_) => {
                        return Err(SkiffError::tool(
                            BASH,
                            format!("command timed out after {}s", timeout.as_secs()),
                        ))
                    }
                },
            };
            let status = output.status;

            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let (content, truncated) = capped(combined, BASH_OUTPUT_MAX_BYTES);
            let content = if content.is_empty() {
                "(no output)".to_string()
            } else {
                content
            };
            let exit_code = status.code();
            let outcome = if status.success() {
                ToolOutcome::success(content)
            } else {
                ToolOutcome::failure(content)
            };
            Ok(outcome
                .with_metadata("exit_code", exit_code)
                .with_metadata("truncated", truncated))
        },
    ))
}

/// Return all built-in coding tools.
pub fn all_tools() -> Vec<Arc<dyn Tool>> {
    vec![ls_tool(), read_tool(), write_tool(), grep_tool(), bash_tool()]
}
