//! Utility functions for directory management
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and state storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/fwconverge/` - Configuration (`config.json`)
//! - State: `~/.local/state/fwconverge/` - Audit log
//!
//! # Example
//!
//! ```
//! use fwconverge::utils::{get_data_dir, get_state_dir, ensure_dirs};
//!
//! // Ensure directories exist before use
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Load configuration from data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "fwconverge", "fwconverge").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "fwconverge", "fwconverge")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

/// One line per flag with its values, so argument vectors diff readably
fn arg_lines(args: &[String]) -> String {
    let mut out = String::new();
    for arg in args {
        if arg.starts_with('-') && !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        } else if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(arg);
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Unified line diff of two argument vectors
pub fn args_diff(live: &[String], desired: &[String]) -> String {
    use std::fmt::Write;

    let old_text = arg_lines(live);
    let new_text = arg_lines(desired);
    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let mut result = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("9999 0123456789abcdef", 12), "9999 0123...");
    }

    #[test]
    fn test_args_diff() {
        let args = |s: &str| s.split(' ').map(String::from).collect::<Vec<_>>();
        let diff = args_diff(
            &args("-p tcp -m tcp --dport 22 -j ACCEPT"),
            &args("-p tcp -m tcp --dport 22 -j DROP"),
        );
        assert!(diff.contains("  -p tcp\n"));
        assert!(diff.contains("- -j ACCEPT\n"));
        assert!(diff.contains("+ -j DROP\n"));
    }
}
