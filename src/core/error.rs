use crate::core::property::Family;
use thiserror::Error;

/// Core error types for fwconverge
#[derive(Debug, Error)]
pub enum Error {
    /// Address literal could not be parsed or does not fit the rule's family
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// A live dump line did not fully decompose under the known property grammar
    #[error("Unrecognized rule syntax ({reason}): {line}")]
    UnrecognizedRuleSyntax { line: String, reason: String },

    /// Mutating iptables/ip6tables/ebtables invocation returned nonzero
    #[error("Failed to apply '{rule}': `{command}` exited with {}: {}", exit_status_text(.exit_code), .stderr.trim())]
    ApplyFailed {
        rule: String,
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The family's save tool could not produce a dump
    #[error("Failed to read live {family} rules via `{command}`: {message}")]
    DumpFailed {
        family: Family,
        command: String,
        message: String,
    },

    /// The save-to-durable-store step failed after a successful mutation
    #[error("Live {family} rules changed but were not persisted: {message}")]
    PersistFailed { family: Family, message: String },

    /// No backend is registered for the requested family/operation
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_status_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "no status".to_string(), |c| c.to_string())
}

impl Error {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn syntax(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnrecognizedRuleSyntax {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the live rule store may have been left changed by the
    /// failing operation (the mutation succeeded, only the flush did not).
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, Self::PersistFailed { .. })
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables-family error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or set FWCONVERGE_ELEVATION_METHOD=sudo")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables tooling is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or point the config at the right binaries (\"commands\" section)");
        }

        // Concurrent modification
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall manager may be modifying the tables")
                .with_suggestion("Wait a moment and re-run; positions are recomputed each run");
        }

        // Missing chain or target
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, jump target or match module not found")
                .with_suggestion("Declare the user-defined chain before rules that use it")
                .with_suggestion("Check that the kernel module for the match is available");
        }

        // Position out of range
        if lower.contains("index of insertion too big") || lower.contains("index of replacement too big") {
            return ErrorTranslation::new("Computed rule position is past the end of the chain")
                .with_suggestion("The chain changed while converging; re-run to recompute positions");
        }

        // Chain lifecycle
        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Chain already exists")
                .with_suggestion("Another actor created the chain; re-run to pick up live state");
        }
        if lower.contains("directory not empty") || lower.contains("too many links") {
            return ErrorTranslation::new("Chain is still referenced or not empty")
                .with_suggestion("Remove the rules that jump to the chain first")
                .with_suggestion("Flush the chain's own rules before destroying it");
        }

        // Table errors
        if lower.contains("can't initialize") && lower.contains("table") {
            return ErrorTranslation::new("Firewall table is not available")
                .with_suggestion("Load the table's kernel module (e.g. modprobe iptable_nat)");
        }

        // Syntax errors
        if lower.contains("bad argument") || lower.contains("unknown option") || lower.contains("invalid") {
            return ErrorTranslation::new("The rule engine rejected the rule arguments")
                .with_suggestion("Check the rule's properties for typos")
                .with_suggestion("Verify ports, addresses and protocol combinations");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify the tools work: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_missing_chain() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: No chain/target/match by that name.",
        );
        assert!(translation.user_message.contains("not found"));
    }

    #[test]
    fn test_insertion_index() {
        let translation =
            IptablesErrorPattern::match_error("iptables: Index of insertion too big.");
        assert!(translation.suggestions.iter().any(|s| s.contains("re-run")));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("lock"));
    }

    #[test]
    fn test_apply_failed_message_names_rule() {
        let err = Error::ApplyFailed {
            rule: "100 allow ssh".into(),
            command: "iptables -t filter -I INPUT 1".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "iptables: Bad argument\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("100 allow ssh"));
        assert!(msg.contains("exited with 1"));
        assert!(msg.ends_with("Bad argument"));
    }

    #[test]
    fn test_persist_failed_is_partial() {
        let err = Error::PersistFailed {
            family: Family::Ipv4,
            message: "disk full".into(),
        };
        assert!(err.is_partial_failure());
        assert!(err.to_string().contains("IPv4"));
        assert!(!Error::Internal("x".into()).is_partial_failure());
    }
}
