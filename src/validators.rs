//! Input validation functions for fwconverge
//!
//! This module provides centralized validation for declared rule and chain
//! values before they are turned into command arguments.

/// Longest chain name iptables accepts
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Longest prefix the LOG target accepts
pub const MAX_LOG_PREFIX_LEN: usize = 29;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A trailing `+` is the iptables wildcard (`eth+` matches every `eth*`).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
///
/// # Examples
///
/// ```
/// use fwconverge::validators::validate_interface;
///
/// assert!(validate_interface("eth0").is_ok());
/// assert!(validate_interface("wg+").is_ok());
/// assert!(validate_interface("eth0; rm").is_err());
/// ```
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

fn is_chain_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Validates a chain name (built-in or user-defined).
///
/// # Errors
///
/// Returns `Err` for empty names, names over 28 characters, or characters
/// other than ASCII alphanumerics, `-` and `_`.
pub fn validate_chain_name(name: &str) -> Result<String, String> {
    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }
    if !is_chain_token(name) {
        return Err(format!(
            "Chain name '{name}' must consist of alphanumeric characters, an underscore or a hyphen"
        ));
    }
    Ok(name.to_string())
}

/// Validates a jump target.
///
/// # Errors
///
/// Returns `Err` for malformed targets and for the generic actions, which
/// are expressed through `action` instead.
pub fn validate_jump_target(target: &str) -> Result<String, String> {
    if !is_chain_token(target) {
        return Err(
            "Jump destination must consist of alphanumeric characters, an underscore or a hyphen"
                .to_string(),
        );
    }
    if ["accept", "reject", "drop"].contains(&target.to_lowercase().as_str()) {
        return Err(
            "Jump destination should not be one of ACCEPT, REJECT or DROP. Use the action property instead"
                .to_string(),
        );
    }
    Ok(target.to_string())
}

/// Validates a LOG prefix.
///
/// Log prefixes appear in kernel logs and are replayed through the dump, so
/// control characters and double quotes are refused.
///
/// # Errors
///
/// Returns `Err` if:
/// - Prefix is empty
/// - Prefix exceeds 29 characters
/// - Prefix contains control characters or `"`
pub fn validate_log_prefix(prefix: &str) -> Result<String, String> {
    if prefix.is_empty() {
        return Err("Log prefix cannot be empty".to_string());
    }

    if prefix.len() > MAX_LOG_PREFIX_LEN {
        return Err(format!(
            "Log prefix too long (max {MAX_LOG_PREFIX_LEN} chars)"
        ));
    }

    if prefix.chars().any(|c| c.is_control() || c == '"') {
        return Err("Log prefix contains control characters or quotes".to_string());
    }

    Ok(prefix.to_string())
}

/// Validates a rate for the limit match (`50/sec`, `40/minute`, `10/day`).
///
/// # Errors
///
/// Returns `Err` if the count is not a positive integer or the unit is unknown.
pub fn validate_rate_limit(rate: &str) -> Result<String, String> {
    let (count, unit) = rate
        .split_once('/')
        .ok_or_else(|| format!("Rate '{rate}' must look like 50/sec"))?;

    match count.parse::<u32>() {
        Ok(n) if n > 0 => {}
        _ => return Err(format!("Rate count '{count}' must be a positive integer")),
    }

    if !matches!(
        unit,
        "s" | "sec" | "second" | "m" | "min" | "minute" | "h" | "hour" | "d" | "day"
    ) {
        return Err(format!(
            "Rate unit '{unit}' must be one of second, minute, hour, day"
        ));
    }

    Ok(rate.to_string())
}

/// Validates a limit burst value.
///
/// # Errors
///
/// Returns `Err` if the value is not a non-negative integer.
pub fn validate_burst(burst: &str) -> Result<String, String> {
    burst
        .parse::<u32>()
        .map(|b| b.to_string())
        .map_err(|_| format!("Burst '{burst}' must be a number"))
}
