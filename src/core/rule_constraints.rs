//! Rule constraint functions for desired rules
//!
//! This module centralizes the rules about valid field combinations: which
//! tables may hold which built-in chains, which properties only make sense in
//! certain chains, and which jump targets need companion properties.
//!
//! Rules read from a live dump are never validated here; the engine accepted
//! them already.
//!
//! # Examples
//!
//! ```
//! use fwconverge::core::rule_constraints::*;
//!
//! assert!(protocol_supports_ports("tcp"));
//! assert!(!protocol_supports_ports("icmp"));
//!
//! assert!(chain_allowed_in_table("PREROUTING", "nat"));
//! assert!(!chain_allowed_in_table("PREROUTING", "filter"));
//! ```

use crate::core::error::{Error, Result};
use crate::core::property::Property;
use crate::core::rule::{Rule, is_synthetic_name};
use regex::Regex;
use std::sync::LazyLock;

/// Tables a rule may be placed in
pub const RULE_TABLES: [&str; 5] = ["nat", "mangle", "filter", "raw", "rawpost"];

/// Protocols accepted in the `proto` property
pub const PROTOCOLS: [&str; 12] = [
    "tcp", "udp", "icmp", "ipv6-icmp", "esp", "ah", "vrrp", "igmp", "ipencap", "ospf", "gre",
    "all",
];

/// Connection states a rule may match on
pub const CONNECTION_STATES: [&str; 4] = ["INVALID", "ESTABLISHED", "NEW", "RELATED"];

/// Link-layer packet types for `pkttype`
pub const PACKET_TYPES: [&str; 3] = ["unicast", "broadcast", "multicast"];

static NAME_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\d+[[:alpha:][:digit:][:punct:][:space:]]+$"));

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol carries ports.
#[inline]
pub fn protocol_supports_ports(proto: &str) -> bool {
    matches!(proto, "tcp" | "udp" | "sctp")
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain / Table Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `false` for built-in chains that do not exist in `table`.
///
/// User-defined chains are allowed anywhere.
pub fn chain_allowed_in_table(chain: &str, table: &str) -> bool {
    match table {
        "filter" => !matches!(chain, "PREROUTING" | "POSTROUTING"),
        "nat" => !matches!(chain, "INPUT" | "FORWARD"),
        "raw" => !matches!(chain, "INPUT" | "FORWARD" | "POSTROUTING"),
        _ => true,
    }
}

/// Chains that see an input interface
#[inline]
pub fn chain_uses_input_interface(chain: &str) -> bool {
    matches!(chain, "INPUT" | "FORWARD" | "PREROUTING")
}

/// Chains that see an output interface
#[inline]
pub fn chain_uses_output_interface(chain: &str) -> bool {
    matches!(chain, "OUTPUT" | "FORWARD" | "POSTROUTING")
}

/// Chains where the owner match (uid/gid) is available
#[inline]
pub fn chain_supports_owner(chain: &str) -> bool {
    matches!(chain, "OUTPUT" | "POSTROUTING")
}

// ═══════════════════════════════════════════════════════════════════════════
// Whole-rule validation
// ═══════════════════════════════════════════════════════════════════════════

/// Checks a desired rule against every combination constraint.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the rule and the first violated
/// constraint.
pub fn validate_rule(rule: &Rule) -> Result<()> {
    let invalid =
        |field: &str, message: String| Error::validation(field, format!("[{}] {message}", rule.name));
    let fail = |field: &str, message: String| Err(invalid(field, message));

    let name_ok = match &*NAME_RE {
        Ok(re) => re.is_match(&rule.name),
        Err(e) => return Err(Error::Internal(format!("rule name pattern: {e}"))),
    };
    if !name_ok {
        return fail(
            "name",
            "rule names must start with a number followed by printable characters".to_string(),
        );
    }
    if is_synthetic_name(&rule.name) {
        return fail("name", "names of this form are reserved for unnamed live rules".to_string());
    }

    if !RULE_TABLES.contains(&rule.table.as_str()) {
        return fail("table", format!("unknown table '{}'", rule.table));
    }
    crate::validators::validate_chain_name(&rule.chain).map_err(|m| invalid("chain", m))?;
    if !chain_allowed_in_table(&rule.chain, &rule.table) {
        return fail(
            "chain",
            format!("{} cannot be used in table '{}'", rule.chain, rule.table),
        );
    }

    let proto = rule.text(Property::Proto).unwrap_or("all");
    if !PROTOCOLS.contains(&proto) {
        return fail("proto", format!("unknown protocol '{proto}'"));
    }

    for (property, value) in &rule.properties {
        match property {
            Property::Iniface | Property::Outiface => {
                if let Some(name) = value.as_text() {
                    crate::validators::validate_interface(name)
                        .map_err(|m| invalid(property.as_ref(), m))?;
                }
            }
            Property::Sport | Property::Dport | Property::Port => {
                if !protocol_supports_ports(proto) {
                    return fail(
                        property.as_ref(),
                        format!("{property} only applies to sctp, tcp and udp, not {proto}"),
                    );
                }
            }
            Property::State => {
                let states = value.as_list().unwrap_or_default();
                if let Some(bad) = states.iter().find(|s| !CONNECTION_STATES.contains(&s.as_str())) {
                    return fail(
                        "state",
                        format!("unknown state '{bad}', expected one of {}", CONNECTION_STATES.join(", ")),
                    );
                }
            }
            Property::Pkttype => {
                if let Some(kind) = value.as_text()
                    && !PACKET_TYPES.contains(&kind)
                {
                    return fail(
                        "pkttype",
                        format!("unknown packet type '{kind}', expected one of {}", PACKET_TYPES.join(", ")),
                    );
                }
            }
            _ => {}
        }
    }

    if rule.get(Property::Iniface).is_some() && !chain_uses_input_interface(&rule.chain) {
        return fail(
            "iniface",
            "iniface only applies to chains INPUT, FORWARD, PREROUTING".to_string(),
        );
    }
    if rule.get(Property::Outiface).is_some() && !chain_uses_output_interface(&rule.chain) {
        return fail(
            "outiface",
            "outiface only applies to chains OUTPUT, FORWARD, POSTROUTING".to_string(),
        );
    }
    for owner in [Property::Uid, Property::Gid] {
        if rule.get(owner).is_some() && !chain_supports_owner(&rule.chain) {
            return fail(
                owner.as_ref(),
                format!("{owner} only applies to chains OUTPUT, POSTROUTING"),
            );
        }
    }

    let jump = rule.jump();
    if let Some(jump) = jump {
        if rule.action.is_some() {
            return fail(
                "jump",
                "only one of 'action' and 'jump' can be set".to_string(),
            );
        }
        crate::validators::validate_jump_target(jump).map_err(|m| invalid("jump", m))?;
    }

    if rule.get(Property::SetMark).is_some()
        && !(jump == Some("MARK")
            && matches!(rule.chain.as_str(), "PREROUTING" | "OUTPUT")
            && rule.table == "mangle")
    {
        return fail(
            "set_mark",
            "set_mark only applies to the PREROUTING or OUTPUT chain of the mangle table with jump MARK"
                .to_string(),
        );
    }

    match jump {
        Some("DNAT") => {
            if rule.table != "nat" {
                return fail("jump", "DNAT only applies to table nat".to_string());
            }
            if rule.get(Property::Todest).is_none() {
                return fail("todest", "DNAT requires todest".to_string());
            }
        }
        Some("SNAT") => {
            if rule.table != "nat" {
                return fail("jump", "SNAT only applies to table nat".to_string());
            }
            if rule.get(Property::Tosource).is_none() {
                return fail("tosource", "SNAT requires tosource".to_string());
            }
        }
        Some("REDIRECT") if rule.get(Property::Toports).is_none() => {
            return fail("toports", "REDIRECT requires toports".to_string());
        }
        Some("MASQUERADE") if rule.table != "nat" => {
            return fail("jump", "MASQUERADE only applies to table nat".to_string());
        }
        _ => {}
    }

    if (rule.get(Property::LogPrefix).is_some() || rule.get(Property::LogLevel).is_some())
        && jump != Some("LOG")
    {
        return fail(
            "log_prefix",
            "log_prefix and log_level require jump LOG".to_string(),
        );
    }

    if rule.get(Property::Burst).is_some() && rule.get(Property::Limit).is_none() {
        return fail("burst", "burst makes no sense without limit".to_string());
    }

    Ok(())
}
