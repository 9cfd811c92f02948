//! Rule → argument vector
//!
//! Insert and replace arguments are generated from the rule model in canonical
//! order, so a serialized rule comes back from the dump in the same shape.
//! Delete arguments replay the live dump line instead, since the engine matches
//! deletions against the exact rule specification it holds.

use crate::core::canonical;
use crate::core::error::{Error, Result};
use crate::core::parser::tokenize;
use crate::core::property::{Property, SyntaxTable, ValueKind};
use crate::core::rule::{PropertyValue, Rule};

/// Mutating operations the serializer knows how to express
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert(usize),
    Replace(usize),
}

impl Operation {
    fn flag(self) -> &'static str {
        match self {
            Operation::Insert(_) => "-I",
            Operation::Replace(_) => "-R",
        }
    }

    fn position(self) -> usize {
        match self {
            Operation::Insert(p) | Operation::Replace(p) => p,
        }
    }
}

/// Builds `-t <table> -I|-R <chain> <position> <flags...>` for `rule`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedPlatform`] if the rule uses a property the
/// family's syntax table cannot express.
pub fn mutation_args(table: &SyntaxTable, rule: &Rule, op: Operation) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "-t".into(),
        rule.table.clone(),
        op.flag().into(),
        rule.chain.clone(),
        op.position().to_string(),
    ];
    args.extend(rule_args(table, rule)?);
    Ok(args)
}

/// The property part of a rule's arguments, in canonical order
///
/// # Errors
///
/// See [`mutation_args`].
pub fn rule_args(table: &SyntaxTable, rule: &Rule) -> Result<Vec<String>> {
    for property in rule.properties.keys() {
        if !table.supports(*property) {
            return Err(Error::UnsupportedPlatform(format!(
                "{} rules cannot express '{property}' (rule '{}')",
                table.family(),
                rule.name
            )));
        }
    }

    let proto = rule.text(Property::Proto).unwrap_or_default();
    let mut args = Vec::new();

    for entry in table.entries() {
        let flag = entry.flag();
        let value = match entry.property {
            Property::Name => Some(PropertyValue::Text(rule.name.clone())),
            Property::Jump => rule
                .target()
                .map(|t| PropertyValue::Text(t.to_string())),
            p => rule.get(p).cloned(),
        };
        let Some(value) = value else { continue };

        match (entry.property.kind(), value) {
            (ValueKind::Switch, PropertyValue::Switch(true)) => {
                args.extend(flag.split_whitespace().map(String::from));
            }
            (ValueKind::Switch, _) => {}
            (ValueKind::List, PropertyValue::List(items)) if entry.property.is_port_list() => {
                let single_port_match = matches!(entry.property, Property::Sport | Property::Dport)
                    && items.len() == 1
                    && matches!(proto, "tcp" | "udp");
                if single_port_match {
                    let option = if entry.property == Property::Sport {
                        "--sport"
                    } else {
                        "--dport"
                    };
                    args.extend(["-m".to_string(), proto.to_string(), option.to_string()]);
                } else {
                    args.extend(flag.split_whitespace().map(String::from));
                }
                args.push(
                    items
                        .iter()
                        .map(|p| canonical::port_to_wire(p))
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            (ValueKind::Pair, PropertyValue::Text(pair)) => {
                args.extend(flag.split_whitespace().map(String::from));
                args.extend(pair.split_whitespace().map(String::from));
            }
            (_, value) => {
                args.extend(flag.split_whitespace().map(String::from));
                args.push(value.to_string());
            }
        }
    }

    Ok(args)
}

/// Builds `-t <table> -D <chain> ...` by replaying the live rule's dump line.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the rule was not read from a dump, and
/// [`Error::UnrecognizedRuleSyntax`] if its line does not start with `-A`.
pub fn delete_args(rule: &Rule) -> Result<Vec<String>> {
    let line = rule.line.as_deref().ok_or_else(|| {
        Error::Internal(format!("rule '{}' has no live line to delete", rule.name))
    })?;

    let mut tokens = tokenize(line)?;
    match tokens.first_mut() {
        Some(marker) if marker == "-A" => *marker = "-D".to_string(),
        _ => return Err(Error::syntax(line, "rule line does not start with -A")),
    }

    let mut args = vec!["-t".to_string(), rule.table.clone()];
    args.append(&mut tokens);
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::RuleParser;
    use crate::core::property::{Family, SyntaxOptions};
    use crate::core::rule::Action;

    fn v4() -> SyntaxTable {
        SyntaxTable::new(Family::Ipv4, &SyntaxOptions::default()).unwrap()
    }

    fn text(s: &str) -> PropertyValue {
        PropertyValue::Text(s.to_string())
    }

    fn list(items: &[&str]) -> PropertyValue {
        PropertyValue::List(items.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_insert_ssh() {
        let rule = Rule::new("100 allow ssh", Family::Ipv4, "filter", "INPUT")
            .with(Property::Proto, text("tcp"))
            .with(Property::Dport, list(&["22"]))
            .with_action(Action::Accept);

        let args = mutation_args(&v4(), &rule, Operation::Insert(1)).unwrap();
        assert_eq!(
            args,
            [
                "-t", "filter", "-I", "INPUT", "1", "-p", "tcp", "-m", "tcp", "--dport", "22",
                "-m", "comment", "--comment", "100 allow ssh", "-j", "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_action_drop_emits_target() {
        let rule = Rule::new("200 block", Family::Ipv4, "filter", "INPUT")
            .with(Property::Source, text("192.0.2.0/24"))
            .with_action(Action::Drop);
        let args = rule_args(&v4(), &rule).unwrap();
        assert_eq!(args[args.len() - 2..], ["-j", "DROP"]);
        assert_eq!(args[..2], ["-s", "192.0.2.0/24"]);
    }

    #[test]
    fn test_port_ranges_use_wire_separator() {
        let rule = Rule::new("300 range", Family::Ipv4, "filter", "INPUT")
            .with(Property::Proto, text("tcp"))
            .with(Property::Dport, list(&["22", "1024-2048"]));
        let args = rule_args(&v4(), &rule).unwrap();
        let at = args.iter().position(|a| a == "--dports").unwrap();
        assert_eq!(args[at - 2..=at + 1], ["-m", "multiport", "--dports", "22,1024:2048"]);
    }

    #[test]
    fn test_switch_and_pair_emission() {
        let rule = Rule::new("400 frag", Family::Ipv4, "filter", "INPUT")
            .with(Property::Proto, text("tcp"))
            .with(Property::Isfragment, PropertyValue::Switch(true))
            .with(Property::Socket, PropertyValue::Switch(false))
            .with(Property::TcpFlags, text("SYN,RST SYN"))
            .with_action(Action::Drop);
        let args = rule_args(&v4(), &rule).unwrap();
        assert_eq!(
            args,
            [
                "-p", "tcp", "-f", "-m", "tcp", "--tcp-flags", "SYN,RST", "SYN", "-m", "comment",
                "--comment", "400 frag", "-j", "DROP"
            ]
        );
    }

    #[test]
    fn test_unsupported_property_for_family() {
        let table = SyntaxTable::new(Family::Ipv6, &SyntaxOptions::default()).unwrap();
        let rule = Rule::new("100 frag", Family::Ipv6, "filter", "INPUT")
            .with(Property::Isfragment, PropertyValue::Switch(true));
        assert!(matches!(
            rule_args(&table, &rule),
            Err(Error::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_serialized_rule_parses_back() {
        let table = v4();
        let desired = Rule::new("500 web", Family::Ipv4, "filter", "INPUT")
            .with(Property::Proto, text("tcp"))
            .with(Property::Source, text("10.0.0.0/8"))
            .with(Property::Dport, list(&["80", "443"]))
            .with(Property::State, list(&["ESTABLISHED", "NEW"]))
            .with_action(Action::Accept);

        let mut line = vec!["-A".to_string(), "INPUT".to_string()];
        for arg in rule_args(&table, &desired).unwrap() {
            line.push(if arg.contains(' ') { format!("\"{arg}\"") } else { arg });
        }
        let parsed = RuleParser::new(&table)
            .parse_line("filter", &line.join(" "))
            .unwrap();

        assert_eq!(parsed.name, desired.name);
        assert_eq!(parsed.action, desired.action);
        assert_eq!(parsed.properties, desired.properties);
    }

    #[test]
    fn test_vocabulary_parses_back() {
        let table = v4();
        let rule = |name: &str, table: &str, chain: &str| Rule::new(name, Family::Ipv4, table, chain);
        let cases = [
            rule("100 frag", "filter", "INPUT")
                .with(Property::Proto, text("all"))
                .with(Property::Isfragment, PropertyValue::Switch(true))
                .with_action(Action::Drop),
            rule("110 socket", "mangle", "PREROUTING")
                .with(Property::Proto, text("tcp"))
                .with(Property::Socket, PropertyValue::Switch(true))
                .with_action(Action::Accept),
            rule("120 syn", "filter", "INPUT")
                .with(Property::Proto, text("tcp"))
                .with(Property::TcpFlags, text("SYN,RST,ACK,FIN SYN"))
                .with(Property::Dport, list(&["22"]))
                .with_action(Action::Accept),
            rule("130 log ssh", "filter", "INPUT")
                .with(Property::Proto, text("tcp"))
                .with(Property::Dport, list(&["22"]))
                .with(Property::Limit, text("5/min"))
                .with(Property::Burst, text("10"))
                .with(Property::Jump, text("LOG"))
                .with(Property::LogPrefix, text("ssh: "))
                .with(Property::LogLevel, text("4")),
            rule("140 dnat", "nat", "PREROUTING")
                .with(Property::Proto, text("tcp"))
                .with(Property::Dport, list(&["80"]))
                .with(Property::Jump, text("DNAT"))
                .with(Property::Todest, text("10.0.0.5:8080")),
            rule("150 snat", "nat", "POSTROUTING")
                .with(Property::Source, text("10.0.0.0/8"))
                .with(Property::Proto, text("all"))
                .with(Property::Jump, text("SNAT"))
                .with(Property::Tosource, text("192.0.2.1")),
            rule("160 redirect", "nat", "PREROUTING")
                .with(Property::Proto, text("tcp"))
                .with(Property::Dport, list(&["80"]))
                .with(Property::Jump, text("REDIRECT"))
                .with(Property::Toports, text("3128")),
            rule("170 owner", "filter", "OUTPUT")
                .with(Property::Proto, text("all"))
                .with(Property::Uid, text("0"))
                .with(Property::Gid, text("0"))
                .with_action(Action::Accept),
            rule("180 mark", "mangle", "PREROUTING")
                .with(Property::Proto, text("all"))
                .with(Property::Jump, text("MARK"))
                .with(Property::SetMark, text("0x1/0xffffffff")),
            rule("190 reject telnet", "filter", "INPUT")
                .with(Property::Proto, text("tcp"))
                .with(Property::Dport, list(&["23"]))
                .with(Property::Reject, text("tcp-reset"))
                .with_action(Action::Reject),
            rule("200 ping", "filter", "INPUT")
                .with(Property::Proto, text("icmp"))
                .with(Property::Icmp, text("8"))
                .with(Property::Pkttype, text("unicast"))
                .with_action(Action::Accept),
            rule("210 dns", "filter", "OUTPUT")
                .with(Property::Proto, text("udp"))
                .with(Property::Sport, list(&["53"]))
                .with(Property::Destination, text("192.0.2.53/32"))
                .with_action(Action::Accept),
        ];

        let parser = RuleParser::new(&table);
        for desired in &cases {
            let mut line = vec!["-A".to_string(), desired.chain.clone()];
            for arg in rule_args(&table, desired).unwrap() {
                line.push(if arg.contains(' ') { format!("\"{arg}\"") } else { arg });
            }
            let line = line.join(" ");
            let parsed = parser
                .parse_line(&desired.table, &line)
                .unwrap_or_else(|e| panic!("{}: {e}", desired.name));

            assert_eq!(parsed.name, desired.name, "{line}");
            assert_eq!(parsed.action, desired.action, "{line}");
            assert_eq!(parsed.jump(), desired.jump(), "{line}");
            assert!(
                desired.converged_with(&parsed),
                "{line}: {:?}",
                desired.divergences(&parsed)
            );
        }
    }

    #[test]
    fn test_delete_replays_line() {
        let table = v4();
        let live = RuleParser::new(&table)
            .parse_line(
                "filter",
                r#"-A INPUT -p tcp -m tcp --dport 22 -m comment --comment "100 allow ssh" -j ACCEPT"#,
            )
            .unwrap();
        assert_eq!(
            delete_args(&live).unwrap(),
            [
                "-t", "filter", "-D", "INPUT", "-p", "tcp", "-m", "tcp", "--dport", "22", "-m",
                "comment", "--comment", "100 allow ssh", "-j", "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_delete_without_line() {
        let rule = Rule::new("100 x", Family::Ipv4, "filter", "INPUT");
        assert!(matches!(delete_args(&rule), Err(Error::Internal(_))));
    }
}
